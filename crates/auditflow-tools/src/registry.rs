use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use auditflow_core::error::{AuditflowError, Result};
use auditflow_core::traits::Tool;
use auditflow_core::types::{ToolContext, ToolDefinition, ToolResult};

/// Registry of available tools — the dispatch table from operation name to
/// handler.
///
/// Failures never propagate past the loop boundary: callers convert an `Err`
/// from `execute` into an error-typed function response, so the conversation
/// continues.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// List all registered tool names.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }

    /// Tool definitions for the model catalog. Schemas come from the same
    /// objects that validate, so the two cannot drift.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Definitions for a named subset, used to scope helper personas.
    /// Unknown names are skipped.
    pub fn definitions_for(&self, names: &[String]) -> Vec<ToolDefinition> {
        self.definitions()
            .into_iter()
            .filter(|d| names.iter().any(|n| n == &d.name))
            .collect()
    }

    /// Execute a tool by name with a per-tool timeout.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| AuditflowError::ToolNotFound(name.to_string()))?;

        debug!(tool = %name, "Executing tool");
        let timeout = std::time::Duration::from_secs(tool.timeout_secs());

        match tokio::time::timeout(timeout, tool.execute(input, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(AuditflowError::ToolTimeout {
                tool: name.to_string(),
                timeout_secs: tool.timeout_secs(),
            }),
        }
    }

    /// Create a registry with all built-in tools registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        // Workflow CRUD
        registry.register(crate::builtin::workflow::CreateWorkflowTool);
        registry.register(crate::builtin::workflow::GetWorkflowTool);
        registry.register(crate::builtin::workflow::ListWorkflowsTool);
        registry.register(crate::builtin::workflow::UpdateWorkflowTool);
        registry.register(crate::builtin::workflow::DeleteWorkflowTool);

        // Favorites
        registry.register(crate::builtin::favorites::FavoriteWorkflowTool);
        registry.register(crate::builtin::favorites::UnfavoriteWorkflowTool);
        registry.register(crate::builtin::favorites::ListFavoritesTool);

        // Progress
        registry.register(crate::builtin::progress::SaveStepResultTool);
        registry.register(crate::builtin::progress::GetWorkflowProgressTool);

        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
