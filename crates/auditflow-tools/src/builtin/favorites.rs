use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;

use auditflow_core::error::{AuditflowError, Result};
use auditflow_core::traits::Tool;
use auditflow_core::types::{ToolContext, ToolResult};

use super::fetch_workflow;

#[derive(Deserialize)]
struct FavoriteInput {
    workflow: String,
}

// ── favorite_workflow ───────────────────────────────────────────

pub struct FavoriteWorkflowTool;

impl Tool for FavoriteWorkflowTool {
    fn name(&self) -> &str {
        "favorite_workflow"
    }
    fn description(&self) -> &str {
        "Mark a workflow as a favorite for the calling user."
    }
    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "workflow": { "type": "string", "description": "Workflow id or slug" }
            },
            "required": ["workflow"]
        })
    }
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: FavoriteInput = serde_json::from_value(input)
                .map_err(|e| AuditflowError::InvalidArgument(e.to_string()))?;

            let wf = fetch_workflow(&ctx, &p.workflow).await?;
            let added = ctx.store.add_favorite(&ctx.user_id, &wf.id).await?;
            let message = if added {
                format!("Added '{}' to favorites", wf.slug)
            } else {
                format!("'{}' is already a favorite", wf.slug)
            };
            Ok(ToolResult::success(message))
        })
    }
}

// ── unfavorite_workflow ─────────────────────────────────────────

pub struct UnfavoriteWorkflowTool;

impl Tool for UnfavoriteWorkflowTool {
    fn name(&self) -> &str {
        "unfavorite_workflow"
    }
    fn description(&self) -> &str {
        "Remove a workflow from the calling user's favorites."
    }
    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "workflow": { "type": "string", "description": "Workflow id or slug" }
            },
            "required": ["workflow"]
        })
    }
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: FavoriteInput = serde_json::from_value(input)
                .map_err(|e| AuditflowError::InvalidArgument(e.to_string()))?;

            let wf = fetch_workflow(&ctx, &p.workflow).await?;
            let removed = ctx.store.remove_favorite(&ctx.user_id, &wf.id).await?;
            let message = if removed {
                format!("Removed '{}' from favorites", wf.slug)
            } else {
                format!("'{}' was not a favorite", wf.slug)
            };
            Ok(ToolResult::success(message))
        })
    }
}

// ── list_favorites ──────────────────────────────────────────────

pub struct ListFavoritesTool;

impl Tool for ListFavoritesTool {
    fn name(&self) -> &str {
        "list_favorites"
    }
    fn description(&self) -> &str {
        "List the calling user's favorite workflows."
    }
    fn input_schema(&self) -> serde_json::Value {
        json!({ "type": "object", "properties": {} })
    }
    fn execute(
        &self,
        _input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let favorites = ctx.store.list_favorites(&ctx.user_id).await?;
            let summaries: Vec<serde_json::Value> = favorites
                .iter()
                .map(|wf| {
                    json!({
                        "id": wf.id.0,
                        "slug": wf.slug,
                        "title": wf.title,
                        "favorites": wf.favorites_count,
                    })
                })
                .collect();
            Ok(ToolResult::success(json!(summaries).to_string()))
        })
    }
}
