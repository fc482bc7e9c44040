use std::path::Path;

use serde::{Deserialize, Serialize};

use auditflow_core::config::PersonaConfig;
use auditflow_core::error::{AuditflowError, Result};

/// Fixed helper id for the data-query persona.
pub const DATA_QUERY: &str = "data_query";
/// Fixed helper id for the code-execution/analysis persona.
pub const CODE_ANALYSIS: &str = "code_analysis";

const DATA_QUERY_PROMPT: &str = "You are a data-query specialist for audit workflows. \
Use your tools to look up workflow documents and per-step progress, then answer \
with the concrete data you found. Answer with data only; do not speculate.";

const CODE_ANALYSIS_PROMPT: &str = "You are a code-execution and analysis specialist. \
Work through the task with short code artifacts where calculation helps, and \
reply with your analysis as plain text.";

/// A helper agent definition: same loop shape as any other agent, differing
/// only by system instruction and allowed-tool subset.
///
/// Persona text is data — it comes from config or an external file, with
/// built-in defaults as fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub name: String,
    pub system_instruction: String,
    /// Datastore tool names this persona may call. Delegation is not
    /// grantable here, which is what keeps delegation one level deep.
    pub tools: Vec<String>,
}

impl Persona {
    pub fn new(id: impl Into<String>, name: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            system_instruction: instruction.into(),
            tools: vec![],
        }
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    /// Resolve a persona from config, reading `system_prompt_file` relative
    /// to `base_dir` when given.
    pub fn from_config(config: &PersonaConfig, base_dir: &Path) -> Result<Self> {
        let instruction = if let Some(ref file) = config.system_prompt_file {
            std::fs::read_to_string(base_dir.join(file)).map_err(|e| {
                AuditflowError::Config(format!("persona '{}' prompt file: {}", config.id, e))
            })?
        } else if let Some(ref prompt) = config.system_prompt {
            prompt.clone()
        } else {
            return Err(AuditflowError::Config(format!(
                "persona '{}' needs system_prompt or system_prompt_file",
                config.id
            )));
        };

        Ok(Self {
            id: config.id.clone(),
            name: config.name.clone(),
            system_instruction: instruction,
            tools: config.tools.clone(),
        })
    }

    pub fn builtin_data_query() -> Self {
        Self::new(DATA_QUERY, "Data Query", DATA_QUERY_PROMPT).with_tools(vec![
            "get_workflow".into(),
            "list_workflows".into(),
            "get_workflow_progress".into(),
            "list_favorites".into(),
        ])
    }

    pub fn builtin_code_analysis() -> Self {
        Self::new(CODE_ANALYSIS, "Code Analysis", CODE_ANALYSIS_PROMPT)
    }

    /// Load configured personas, falling back to the built-in pair when the
    /// config lists none.
    pub fn load_all(configs: &[PersonaConfig], base_dir: &Path) -> Result<Vec<Self>> {
        if configs.is_empty() {
            return Ok(vec![Self::builtin_data_query(), Self::builtin_code_analysis()]);
        }
        configs
            .iter()
            .map(|c| Self::from_config(c, base_dir))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_used_when_no_personas_configured() {
        let personas = Persona::load_all(&[], Path::new(".")).unwrap();
        assert_eq!(personas.len(), 2);
        assert_eq!(personas[0].id, DATA_QUERY);
        assert_eq!(personas[1].id, CODE_ANALYSIS);
        assert!(personas[1].tools.is_empty());
    }

    #[test]
    fn inline_prompt_wins() {
        let config = PersonaConfig {
            id: "reviewer".into(),
            name: "Reviewer".into(),
            system_prompt: Some("Review things.".into()),
            system_prompt_file: None,
            tools: vec!["get_workflow".into()],
        };
        let persona = Persona::from_config(&config, Path::new(".")).unwrap();
        assert_eq!(persona.system_instruction, "Review things.");
        assert_eq!(persona.tools, vec!["get_workflow"]);
    }

    #[test]
    fn missing_prompt_is_config_error() {
        let config = PersonaConfig {
            id: "empty".into(),
            name: "Empty".into(),
            system_prompt: None,
            system_prompt_file: None,
            tools: vec![],
        };
        assert!(matches!(
            Persona::from_config(&config, Path::new(".")),
            Err(AuditflowError::Config(_))
        ));
    }
}
