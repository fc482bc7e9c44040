use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;

use auditflow_core::error::{AuditflowError, Result};
use auditflow_core::traits::Tool;
use auditflow_core::types::{StepResult, ToolContext, ToolResult};
use auditflow_graph::{ExecutionPlanner, StepGraph};

use super::fetch_workflow;

// ── save_step_result ────────────────────────────────────────────

pub struct SaveStepResultTool;

#[derive(Deserialize)]
struct SaveStepResultInput {
    workflow: String,
    step_id: String,
    result: String,
    #[serde(default)]
    completed: bool,
}

impl Tool for SaveStepResultTool {
    fn name(&self) -> &str {
        "save_step_result"
    }
    fn description(&self) -> &str {
        "Save or update the calling user's result for one workflow step. \
         Saving again for the same step replaces the previous result."
    }
    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "workflow": { "type": "string", "description": "Workflow id or slug" },
                "step_id": { "type": "string" },
                "result": { "type": "string", "description": "Result text for the step" },
                "completed": { "type": "boolean", "description": "Mark the step completed (default false)" }
            },
            "required": ["workflow", "step_id", "result"]
        })
    }
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: SaveStepResultInput = serde_json::from_value(input)
                .map_err(|e| AuditflowError::InvalidArgument(e.to_string()))?;

            let wf = fetch_workflow(&ctx, &p.workflow).await?;
            if wf.step(&p.step_id).is_none() {
                return Err(AuditflowError::NotFound(format!(
                    "step '{}' in workflow '{}'",
                    p.step_id, wf.slug
                )));
            }

            let result = if p.completed {
                StepResult::completed(ctx.user_id.clone(), wf.id.clone(), p.step_id.clone(), p.result)
            } else {
                StepResult::draft(ctx.user_id.clone(), wf.id.clone(), p.step_id.clone(), p.result)
            };
            ctx.store.upsert_step_result(&result).await?;

            Ok(ToolResult::success(
                json!({
                    "workflow": wf.slug,
                    "step_id": p.step_id,
                    "completed": p.completed,
                })
                .to_string(),
            ))
        })
    }
}

// ── get_workflow_progress ───────────────────────────────────────

pub struct GetWorkflowProgressTool;

#[derive(Deserialize)]
struct GetProgressInput {
    workflow: String,
}

impl Tool for GetWorkflowProgressTool {
    fn name(&self) -> &str {
        "get_workflow_progress"
    }
    fn description(&self) -> &str {
        "Report the calling user's progress through a workflow: per-step \
         results plus the steps currently ready to run."
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
            let p: GetProgressInput = serde_json::from_value(input)
                .map_err(|e| AuditflowError::InvalidArgument(e.to_string()))?;

            let wf = fetch_workflow(&ctx, &p.workflow).await?;
            let results = ctx.store.list_step_results(&ctx.user_id, &wf.id).await?;

            let graph = StepGraph::from_workflow(&wf)?;
            let planner = ExecutionPlanner::new(&graph, &results);
            let frontier = planner.ready_frontier();

            let steps: Vec<serde_json::Value> = wf
                .steps
                .iter()
                .map(|step| {
                    let result = results.iter().find(|r| r.step_id == step.id);
                    json!({
                        "step_id": step.id,
                        "label": step.label,
                        "completed": result.map(|r| r.completed).unwrap_or(false),
                        "completed_at": result.and_then(|r| r.completed_at.map(|t| t.to_rfc3339())),
                        "result": result.map(|r| r.result.clone()),
                        "ready": frontier.contains(&step.id),
                    })
                })
                .collect();

            let completed = results.iter().filter(|r| r.completed).count();
            Ok(ToolResult::success(
                json!({
                    "workflow": wf.slug,
                    "total_steps": wf.steps.len(),
                    "completed_steps": completed,
                    "ready": frontier,
                    "steps": steps,
                })
                .to_string(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use auditflow_core::traits::WorkflowStore;
    use auditflow_core::types::{Dependency, Step, UserId, Workflow};
    use auditflow_store::SqliteStore;

    use crate::ToolRegistry;

    use super::*;

    fn context(store: Arc<SqliteStore>, user: &str) -> ToolContext {
        ToolContext {
            user_id: UserId::from_str(user),
            store,
        }
    }

    async fn seed_workflow(store: &SqliteStore) -> Workflow {
        let mut wf = Workflow::new(UserId::from_str("owner"), "vendor-review", "Vendor Review");
        wf.steps.push(Step::new("scope", "Define scope"));
        wf.steps.push(Step::new("assess", "Assess controls"));
        wf.dependencies.push(Dependency::new("scope", "assess"));
        store.create_workflow(&wf).await.unwrap();
        wf
    }

    #[tokio::test]
    async fn save_then_progress_round_trip() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let wf = seed_workflow(&store).await;
        let registry = ToolRegistry::with_builtins();
        let ctx = context(store.clone(), "owner");

        let saved = registry
            .execute(
                "save_step_result",
                json!({
                    "workflow": wf.slug,
                    "step_id": "scope",
                    "result": "Scope covers the top five vendors.",
                    "completed": true,
                }),
                ctx.clone(),
            )
            .await
            .unwrap();
        assert!(!saved.is_error);

        let progress = registry
            .execute(
                "get_workflow_progress",
                json!({ "workflow": wf.slug }),
                ctx,
            )
            .await
            .unwrap();
        let report: serde_json::Value = serde_json::from_str(&progress.content).unwrap();
        assert_eq!(report["completed_steps"], 1);
        assert_eq!(report["ready"], json!(["assess"]));
        let scope = &report["steps"][0];
        assert_eq!(scope["completed"], true);
        assert!(scope["completed_at"].is_string());
    }

    #[tokio::test]
    async fn save_rejects_unknown_step() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let wf = seed_workflow(&store).await;
        let registry = ToolRegistry::with_builtins();

        let err = registry
            .execute(
                "save_step_result",
                json!({ "workflow": wf.slug, "step_id": "ghost", "result": "x" }),
                context(store, "owner"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuditflowError::NotFound(_)));
    }

    #[tokio::test]
    async fn missing_required_field_is_invalid_argument() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        seed_workflow(&store).await;
        let registry = ToolRegistry::with_builtins();

        let err = registry
            .execute(
                "save_step_result",
                json!({ "workflow": "vendor-review" }),
                context(store, "owner"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuditflowError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn update_by_non_owner_is_not_authorized() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let wf = seed_workflow(&store).await;
        let registry = ToolRegistry::with_builtins();

        let err = registry
            .execute(
                "update_workflow",
                json!({ "workflow": wf.slug, "title": "Hijacked" }),
                context(store, "intruder"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuditflowError::NotAuthorized(_)));
    }

    #[tokio::test]
    async fn update_rejects_dangling_dependency() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let wf = seed_workflow(&store).await;
        let registry = ToolRegistry::with_builtins();

        let err = registry
            .execute(
                "update_workflow",
                json!({
                    "workflow": wf.slug,
                    "dependencies": [{ "source": "scope", "target": "ghost" }],
                }),
                context(store, "owner"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuditflowError::InvalidReference(_)));
    }

    #[tokio::test]
    async fn favorites_flow() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let wf = seed_workflow(&store).await;
        let registry = ToolRegistry::with_builtins();
        let ctx = context(store, "reader");

        let added = registry
            .execute(
                "favorite_workflow",
                json!({ "workflow": wf.slug }),
                ctx.clone(),
            )
            .await
            .unwrap();
        assert!(!added.is_error);

        let listed = registry
            .execute("list_favorites", json!({}), ctx.clone())
            .await
            .unwrap();
        assert!(listed.content.contains("vendor-review"));

        let removed = registry
            .execute(
                "unfavorite_workflow",
                json!({ "workflow": wf.slug }),
                ctx,
            )
            .await
            .unwrap();
        assert!(removed.content.contains("Removed"));
    }

    #[tokio::test]
    async fn create_and_delete_workflow() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let registry = ToolRegistry::with_builtins();
        let ctx = context(store, "owner");

        let created = registry
            .execute(
                "create_workflow",
                json!({
                    "title": "Access Review",
                    "steps": [
                        { "id": "pull", "label": "Pull accounts" },
                        { "id": "review", "label": "Review access" }
                    ],
                    "dependencies": [{ "source": "pull", "target": "review" }],
                }),
                ctx.clone(),
            )
            .await
            .unwrap();
        let summary: serde_json::Value = serde_json::from_str(&created.content).unwrap();
        assert_eq!(summary["slug"], "access-review");

        let deleted = registry
            .execute(
                "delete_workflow",
                json!({ "workflow": "access-review" }),
                ctx,
            )
            .await
            .unwrap();
        assert!(deleted.content.contains("Deleted"));
    }

    #[tokio::test]
    async fn unknown_tool_is_reported() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let registry = ToolRegistry::with_builtins();
        let err = registry
            .execute("launch_rockets", json!({}), context(store, "owner"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuditflowError::ToolNotFound(_)));
    }
}
