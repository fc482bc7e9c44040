use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;

use auditflow_core::error::{AuditflowError, Result};
use auditflow_core::traits::Tool;
use auditflow_core::types::{Dependency, Step, ToolContext, ToolResult, Workflow};
use auditflow_graph::StepGraph;

use super::{fetch_workflow, require_owner};

#[derive(Deserialize)]
struct StepInput {
    id: String,
    label: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    instructions: String,
}

impl StepInput {
    fn into_step(self) -> Step {
        Step {
            id: self.id,
            label: self.label,
            description: self.description,
            instructions: self.instructions,
        }
    }
}

#[derive(Deserialize)]
struct DependencyInput {
    source: String,
    target: String,
}

impl DependencyInput {
    fn into_dependency(self) -> Dependency {
        Dependency::new(self.source, self.target)
    }
}

/// Rejects dangling edge references and self-loops before anything is
/// persisted. Cycles are legal to author; the planner reports them.
fn validate_graph(workflow: &Workflow) -> Result<()> {
    StepGraph::from_workflow(workflow).map(|_| ())
}

fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_dash = true;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

fn workflow_summary(wf: &Workflow) -> serde_json::Value {
    json!({
        "id": wf.id.0,
        "slug": wf.slug,
        "title": wf.title,
        "steps": wf.steps.len(),
        "dependencies": wf.dependencies.len(),
        "favorites": wf.favorites_count,
        "category": wf.category,
    })
}

// ── create_workflow ─────────────────────────────────────────────

pub struct CreateWorkflowTool;

#[derive(Deserialize)]
struct CreateWorkflowInput {
    title: String,
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    steps: Vec<StepInput>,
    #[serde(default)]
    dependencies: Vec<DependencyInput>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
    #[serde(default)]
    category: Option<String>,
}

impl Tool for CreateWorkflowTool {
    fn name(&self) -> &str {
        "create_workflow"
    }
    fn description(&self) -> &str {
        "Create a new audit workflow with steps and dependency edges."
    }
    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "title": { "type": "string", "description": "Workflow title" },
                "slug": { "type": "string", "description": "URL slug (derived from title when omitted)" },
                "steps": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "string" },
                            "label": { "type": "string" },
                            "description": { "type": "string" },
                            "instructions": { "type": "string" }
                        },
                        "required": ["id", "label"]
                    }
                },
                "dependencies": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "source": { "type": "string" },
                            "target": { "type": "string", "description": "Step that depends on source" }
                        },
                        "required": ["source", "target"]
                    }
                },
                "metadata": { "type": "object" },
                "category": { "type": "string" }
            },
            "required": ["title"]
        })
    }
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: CreateWorkflowInput = serde_json::from_value(input)
                .map_err(|e| AuditflowError::InvalidArgument(e.to_string()))?;

            let slug = p.slug.unwrap_or_else(|| slugify(&p.title));
            if slug.is_empty() {
                return Err(AuditflowError::InvalidArgument(
                    "workflow slug must not be empty".into(),
                ));
            }
            if ctx.store.get_workflow_by_slug(&slug).await?.is_some() {
                return Err(AuditflowError::InvalidArgument(format!(
                    "slug '{}' is already taken",
                    slug
                )));
            }

            let mut wf = Workflow::new(ctx.user_id.clone(), slug, p.title);
            wf.steps = p.steps.into_iter().map(StepInput::into_step).collect();
            wf.dependencies = p
                .dependencies
                .into_iter()
                .map(DependencyInput::into_dependency)
                .collect();
            if let Some(metadata) = p.metadata {
                wf.metadata = metadata;
            }
            wf.category = p.category;

            validate_graph(&wf)?;
            ctx.store.create_workflow(&wf).await?;

            Ok(ToolResult::success(workflow_summary(&wf).to_string()))
        })
    }
}

// ── get_workflow ────────────────────────────────────────────────

pub struct GetWorkflowTool;

#[derive(Deserialize)]
struct GetWorkflowInput {
    workflow: String,
}

impl Tool for GetWorkflowTool {
    fn name(&self) -> &str {
        "get_workflow"
    }
    fn description(&self) -> &str {
        "Fetch a workflow document (steps, dependencies, metadata) by id or slug."
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
            let p: GetWorkflowInput = serde_json::from_value(input)
                .map_err(|e| AuditflowError::InvalidArgument(e.to_string()))?;
            let wf = fetch_workflow(&ctx, &p.workflow).await?;
            let doc = serde_json::to_string(&wf)?;
            Ok(ToolResult::success(doc))
        })
    }
}

// ── list_workflows ──────────────────────────────────────────────

pub struct ListWorkflowsTool;

impl Tool for ListWorkflowsTool {
    fn name(&self) -> &str {
        "list_workflows"
    }
    fn description(&self) -> &str {
        "List the calling user's workflows."
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
            let workflows = ctx.store.list_workflows(&ctx.user_id).await?;
            let summaries: Vec<serde_json::Value> =
                workflows.iter().map(workflow_summary).collect();
            Ok(ToolResult::success(json!(summaries).to_string()))
        })
    }
}

// ── update_workflow ─────────────────────────────────────────────

pub struct UpdateWorkflowTool;

#[derive(Deserialize)]
struct UpdateWorkflowInput {
    workflow: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    steps: Option<Vec<StepInput>>,
    #[serde(default)]
    dependencies: Option<Vec<DependencyInput>>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
    #[serde(default)]
    category: Option<String>,
}

impl Tool for UpdateWorkflowTool {
    fn name(&self) -> &str {
        "update_workflow"
    }
    fn description(&self) -> &str {
        "Update a workflow you own. Provided fields replace the existing ones; \
         steps and dependencies are validated as a graph before saving."
    }
    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "workflow": { "type": "string", "description": "Workflow id or slug" },
                "title": { "type": "string" },
                "steps": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "string" },
                            "label": { "type": "string" },
                            "description": { "type": "string" },
                            "instructions": { "type": "string" }
                        },
                        "required": ["id", "label"]
                    }
                },
                "dependencies": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "source": { "type": "string" },
                            "target": { "type": "string" }
                        },
                        "required": ["source", "target"]
                    }
                },
                "metadata": { "type": "object" },
                "category": { "type": "string" }
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
            let p: UpdateWorkflowInput = serde_json::from_value(input)
                .map_err(|e| AuditflowError::InvalidArgument(e.to_string()))?;

            let mut wf = fetch_workflow(&ctx, &p.workflow).await?;
            require_owner(&ctx, &wf)?;

            if let Some(title) = p.title {
                wf.title = title;
            }
            if let Some(steps) = p.steps {
                wf.steps = steps.into_iter().map(StepInput::into_step).collect();
            }
            if let Some(dependencies) = p.dependencies {
                wf.dependencies = dependencies
                    .into_iter()
                    .map(DependencyInput::into_dependency)
                    .collect();
            }
            if let Some(metadata) = p.metadata {
                wf.metadata = metadata;
            }
            if let Some(category) = p.category {
                wf.category = Some(category);
            }

            validate_graph(&wf)?;
            ctx.store.update_workflow(&wf).await?;

            Ok(ToolResult::success(workflow_summary(&wf).to_string()))
        })
    }
}

// ── delete_workflow ─────────────────────────────────────────────

pub struct DeleteWorkflowTool;

#[derive(Deserialize)]
struct DeleteWorkflowInput {
    workflow: String,
}

impl Tool for DeleteWorkflowTool {
    fn name(&self) -> &str {
        "delete_workflow"
    }
    fn description(&self) -> &str {
        "Delete a workflow you own. Saved step results are kept."
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
            let p: DeleteWorkflowInput = serde_json::from_value(input)
                .map_err(|e| AuditflowError::InvalidArgument(e.to_string()))?;

            let wf = fetch_workflow(&ctx, &p.workflow).await?;
            require_owner(&ctx, &wf)?;

            ctx.store.delete_workflow(&ctx.user_id, &wf.id).await?;
            Ok(ToolResult::success(format!(
                "Deleted workflow '{}'",
                wf.slug
            )))
        })
    }
}
