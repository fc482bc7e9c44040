use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AuditflowError, Result};

/// Top-level Auditflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Helper persona definitions; when empty the built-in pair is used.
    #[serde(default)]
    pub personas: Vec<PersonaConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default = "default_max_duration")]
    pub max_duration_secs: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_turns() -> usize {
    12
}

fn default_max_duration() -> u64 {
    600
}

fn default_event_capacity() -> usize {
    256
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            max_duration_secs: default_max_duration(),
            event_capacity: default_event_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model: String,
    /// Raw key or `${ENV_VAR}` reference, expanded at load time.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default)]
    pub temperature: Option<f32>,
}

fn default_provider() -> String {
    "anthropic".to_string()
}

fn default_max_output_tokens() -> u32 {
    4096
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "auditflow.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// A helper persona: same loop shape, different system instruction and
/// allowed-tool subset. Persona text lives in config or an external file,
/// never in code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub system_prompt_file: Option<String>,
    /// Datastore tool names available to this persona. Delegation is never
    /// grantable here.
    #[serde(default)]
    pub tools: Vec<String>,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| AuditflowError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| AuditflowError::Config(e.to_string()))
    }

    /// Resolve the database path (expand ~).
    pub fn database_path(&self) -> PathBuf {
        let p = &self.database.path;
        if let Some(rest) = p.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                return PathBuf::from(home).join(rest);
            }
        }
        PathBuf::from(p)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => {
                    result.push_str("${");
                    result.push_str(&var_name);
                    result.push('}');
                }
            }
        } else {
            result.push(c);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [model]
            model = "claude-sonnet-4-5"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.agent.max_turns, 12);
        assert_eq!(cfg.model.provider, "anthropic");
        assert_eq!(cfg.database.path, "auditflow.db");
        assert!(cfg.personas.is_empty());
    }

    #[test]
    fn personas_parse() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [model]
            model = "m"

            [[personas]]
            id = "data_query"
            name = "Data Query"
            system_prompt = "You query audit data."
            tools = ["get_workflow", "get_workflow_progress"]
            "#,
        )
        .unwrap();

        assert_eq!(cfg.personas.len(), 1);
        assert_eq!(cfg.personas[0].id, "data_query");
        assert_eq!(cfg.personas[0].tools.len(), 2);
    }

    #[test]
    fn env_expansion() {
        std::env::set_var("AUDITFLOW_TEST_KEY", "sk-test");
        let expanded = expand_env_vars("key = \"${AUDITFLOW_TEST_KEY}\"");
        assert_eq!(expanded, "key = \"sk-test\"");

        let untouched = expand_env_vars("key = \"${AUDITFLOW_MISSING_VAR}\"");
        assert!(untouched.contains("${AUDITFLOW_MISSING_VAR}"));
    }
}
