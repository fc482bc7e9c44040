pub mod favorites;
pub mod progress;
pub mod workflow;

use auditflow_core::error::{AuditflowError, Result};
use auditflow_core::types::{ToolContext, Workflow, WorkflowId};

/// Look up a workflow by id, falling back to slug.
pub(crate) async fn fetch_workflow(ctx: &ToolContext, reference: &str) -> Result<Workflow> {
    let by_id = ctx
        .store
        .get_workflow(&WorkflowId::from_str(reference))
        .await?;
    if let Some(wf) = by_id {
        return Ok(wf);
    }
    ctx.store
        .get_workflow_by_slug(reference)
        .await?
        .ok_or_else(|| AuditflowError::NotFound(format!("workflow '{}'", reference)))
}

/// Ownership gate for mutating operations.
pub(crate) fn require_owner(ctx: &ToolContext, workflow: &Workflow) -> Result<()> {
    if workflow.user_id != ctx.user_id {
        return Err(AuditflowError::NotAuthorized(format!(
            "workflow '{}' belongs to another user",
            workflow.slug
        )));
    }
    Ok(())
}
