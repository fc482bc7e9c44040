use base64::Engine;
use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use auditflow_core::config::ModelConfig;
use auditflow_core::error::{AuditflowError, Result};
use auditflow_core::traits::ModelClient;
use auditflow_core::types::*;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Non-streaming Anthropic messages client.
///
/// One POST per `generate` call; the response's content blocks map directly
/// onto `ContentPart`s.
pub struct AnthropicClient {
    http: Client,
    config: ModelConfig,
}

impl AnthropicClient {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    fn api_key(&self) -> Result<String> {
        if let Some(ref key) = self.config.api_key {
            if !key.is_empty() && !key.starts_with("${") {
                return Ok(key.clone());
            }
        }
        std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| AuditflowError::Config("no API key configured".into()))
    }
}

// API request types
#[derive(Serialize)]
struct ApiRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: String,
    content: serde_json::Value,
}

#[derive(Serialize)]
struct ApiTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

// API response types
#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ApiContentBlock>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ApiContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Default)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

fn convert_parts(parts: &[ContentPart]) -> serde_json::Value {
    let blocks: Vec<serde_json::Value> = parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(serde_json::json!({
                "type": "text",
                "text": text,
            })),
            ContentPart::ToolCall {
                id,
                name,
                arguments,
            } => Some(serde_json::json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": arguments,
            })),
            ContentPart::ToolResponse {
                call_id,
                content,
                is_error,
            } => Some(serde_json::json!({
                "type": "tool_result",
                "tool_use_id": call_id,
                "content": content,
                "is_error": is_error,
            })),
            ContentPart::CodeArtifact { language, code, .. } => Some(serde_json::json!({
                "type": "text",
                "text": format!("```{}\n{}\n```", language, code),
            })),
            ContentPart::InlineData { mime_type, data } => {
                if mime_type.starts_with("image/") {
                    Some(serde_json::json!({
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": mime_type,
                            "data": base64::engine::general_purpose::STANDARD.encode(data),
                        },
                    }))
                } else {
                    warn!(mime_type = %mime_type, "Dropping unsupported attachment type");
                    None
                }
            }
        })
        .collect();
    serde_json::Value::Array(blocks)
}

fn convert_turns(turns: &[Turn]) -> Vec<ApiMessage> {
    turns
        .iter()
        .map(|turn| {
            let role = match turn.role {
                Role::Assistant => "assistant",
                // Tool responses travel as user-role tool_result blocks.
                _ => "user",
            };
            ApiMessage {
                role: role.to_string(),
                content: convert_parts(&turn.parts),
            }
        })
        .collect()
}

impl ModelClient for AnthropicClient {
    fn generate(&self, request: ModelRequest) -> BoxFuture<'_, Result<ModelResponse>> {
        Box::pin(async move {
            let api_key = self.api_key()?;

            let body = ApiRequest {
                model: self.config.model.clone(),
                max_tokens: self.config.max_output_tokens,
                temperature: self.config.temperature,
                messages: convert_turns(&request.turns),
                system: if request.system_instruction.is_empty() {
                    None
                } else {
                    Some(request.system_instruction.clone())
                },
                tools: request
                    .tools
                    .iter()
                    .map(|t| ApiTool {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        input_schema: t.input_schema.clone(),
                    })
                    .collect(),
            };

            let url = self
                .config
                .base_url
                .as_deref()
                .unwrap_or(ANTHROPIC_API_URL);

            let response = self
                .http
                .post(url)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
                .send()
                .await
                .map_err(|e| AuditflowError::ModelCallFailed(e.to_string()))?;

            let status = response.status();
            let raw = response
                .text()
                .await
                .map_err(|e| AuditflowError::ModelCallFailed(e.to_string()))?;

            if !status.is_success() {
                let message = serde_json::from_str::<ApiErrorBody>(&raw)
                    .map(|b| b.error.message)
                    .unwrap_or(raw);
                return Err(AuditflowError::ModelCallFailed(format!(
                    "{}: {}",
                    status, message
                )));
            }

            let parsed: ApiResponse = serde_json::from_str(&raw)
                .map_err(|e| AuditflowError::ModelCallFailed(format!("bad response: {}", e)))?;

            let parts: Vec<ContentPart> = parsed
                .content
                .into_iter()
                .filter_map(|block| match block {
                    ApiContentBlock::Text { text } => Some(ContentPart::Text { text }),
                    ApiContentBlock::ToolUse { id, name, input } => Some(ContentPart::ToolCall {
                        id,
                        name,
                        arguments: input,
                    }),
                    ApiContentBlock::Unknown => {
                        debug!("Skipping unrecognized content block");
                        None
                    }
                })
                .collect();

            let usage = parsed.usage.unwrap_or_default();
            Ok(ModelResponse {
                parts,
                usage: TokenUsage {
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                },
            })
        })
    }
}
