pub mod anthropic;

use auditflow_core::config::ModelConfig;
use auditflow_core::error::{AuditflowError, Result};
use auditflow_core::traits::ModelClient;

pub use anthropic::AnthropicClient;

/// Create a model client based on the provider name.
pub fn create_client(config: &ModelConfig) -> Result<Box<dyn ModelClient>> {
    match config.provider.as_str() {
        "anthropic" | "claude" => Ok(Box::new(AnthropicClient::new(config.clone()))),
        other => Err(AuditflowError::Config(format!(
            "unsupported model provider: {}",
            other
        ))),
    }
}
