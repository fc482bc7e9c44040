use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Generative-model capability — one synchronous call per turn.
///
/// The response carries zero or more content parts (text, tool call, code
/// artifact). Provider-side token streaming is an optimization outside this
/// contract.
pub trait ModelClient: Send + Sync + 'static {
    fn generate(&self, request: ModelRequest) -> BoxFuture<'_, Result<ModelResponse>>;
}

/// Tool — one named, argument-bearing operation against the datastore.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in model tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with given input and context.
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Workflow store — persistence backend.
///
/// Required capabilities: point lookup by id/slug, upsert-by-unique-key for
/// step results, and atomic increment/decrement for the favorites counter.
pub trait WorkflowStore: Send + Sync + 'static {
    fn create_workflow(&self, workflow: &Workflow) -> BoxFuture<'_, Result<()>>;

    fn get_workflow(&self, id: &WorkflowId) -> BoxFuture<'_, Result<Option<Workflow>>>;

    fn get_workflow_by_slug(&self, slug: &str) -> BoxFuture<'_, Result<Option<Workflow>>>;

    fn update_workflow(&self, workflow: &Workflow) -> BoxFuture<'_, Result<()>>;

    /// Delete a workflow; scoped to the owning user in the same statement.
    fn delete_workflow(&self, user: &UserId, id: &WorkflowId) -> BoxFuture<'_, Result<bool>>;

    fn list_workflows(&self, user: &UserId) -> BoxFuture<'_, Result<Vec<Workflow>>>;

    /// Upsert on the (user, workflow, step) unique key — last writer wins.
    fn upsert_step_result(&self, result: &StepResult) -> BoxFuture<'_, Result<()>>;

    fn get_step_result(
        &self,
        user: &UserId,
        workflow: &WorkflowId,
        step_id: &str,
    ) -> BoxFuture<'_, Result<Option<StepResult>>>;

    fn list_step_results(
        &self,
        user: &UserId,
        workflow: &WorkflowId,
    ) -> BoxFuture<'_, Result<Vec<StepResult>>>;

    /// Returns true if newly added; adjusts the denormalized counter in the
    /// same transaction.
    fn add_favorite(&self, user: &UserId, workflow: &WorkflowId) -> BoxFuture<'_, Result<bool>>;

    /// Returns true if a favorite was removed.
    fn remove_favorite(&self, user: &UserId, workflow: &WorkflowId)
        -> BoxFuture<'_, Result<bool>>;

    fn list_favorites(&self, user: &UserId) -> BoxFuture<'_, Result<Vec<Workflow>>>;

    fn list_categories(&self) -> BoxFuture<'_, Result<Vec<Category>>>;
}
