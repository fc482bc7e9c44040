use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique user identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique workflow identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One unit of audit work — a node in a workflow graph.
///
/// Step ids are author-chosen strings, unique within their workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub description: String,
    /// Free-text execution instructions; may be empty.
    #[serde(default)]
    pub instructions: String,
}

impl Step {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            description: String::new(),
            instructions: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }
}

/// A directed edge: `target` depends on `source`.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub source: String,
    pub target: String,
}

impl Dependency {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// A workflow document: a directed graph of audit steps owned by one user.
///
/// Invariant: every dependency's endpoints reference existing steps. The
/// graph crate validates this on construction and on edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub user_id: UserId,
    pub slug: String,
    pub title: String,
    pub steps: Vec<Step>,
    pub dependencies: Vec<Dependency>,
    /// Free-form metadata blob, opaque to the engine.
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub favorites_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(user_id: UserId, slug: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            user_id,
            slug: slug.into(),
            title: title.into(),
            steps: vec![],
            dependencies: vec![],
            metadata: serde_json::Value::Null,
            category: None,
            favorites_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }
}

/// The persisted, per-user outcome of a step.
///
/// Keyed by (user, workflow, step) — unique per triple, upserted in place.
/// Lifecycle is independent of the Step it references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub user_id: UserId,
    pub workflow_id: WorkflowId,
    pub step_id: String,
    pub result: String,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepResult {
    /// A completed result stamped with the current time.
    pub fn completed(
        user_id: UserId,
        workflow_id: WorkflowId,
        step_id: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            workflow_id,
            step_id: step_id.into(),
            result: result.into(),
            completed: true,
            completed_at: Some(Utc::now()),
        }
    }

    /// A draft result awaiting approval.
    pub fn draft(
        user_id: UserId,
        workflow_id: WorkflowId,
        step_id: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            workflow_id,
            step_id: step_id.into(),
            result: result.into(),
            completed: false,
            completed_at: None,
        }
    }
}

/// A workflow category for browsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub slug: String,
    pub name: String,
}

/// Role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single content part in a turn or model response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_call")]
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },

    #[serde(rename = "tool_response")]
    ToolResponse {
        call_id: String,
        content: String,
        is_error: bool,
    },

    /// A code-execution artifact produced by the model.
    #[serde(rename = "code")]
    CodeArtifact {
        language: String,
        code: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },

    /// Binary attachment supplied by the user.
    #[serde(rename = "inline_data")]
    InlineData { mime_type: String, data: Vec<u8> },
}

/// One immutable record in a conversation log.
///
/// The log is an append-only ordered sequence owned exclusively by the loop
/// instance that drives it — no external aliasing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<ContentPart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![ContentPart::Text { text: text.into() }],
            timestamp: Some(Utc::now()),
        }
    }

    pub fn assistant(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::Assistant,
            parts,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn tool_response(
        call_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            role: Role::Tool,
            parts: vec![ContentPart::ToolResponse {
                call_id: call_id.into(),
                content: content.into(),
                is_error,
            }],
            timestamp: Some(Utc::now()),
        }
    }

    /// Extract all text content from this turn.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Extract all tool calls from this turn.
    pub fn tool_calls(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolCall {
                    id,
                    name,
                    arguments,
                } => Some((id.as_str(), name.as_str(), arguments)),
                _ => None,
            })
            .collect()
    }
}

/// New user content for one conversational turn: text plus optional
/// binary attachments.
#[derive(Debug, Clone, Default)]
pub struct UserContent {
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl UserContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: vec![],
        }
    }

    pub fn with_attachment(mut self, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        self.attachments.push(Attachment {
            mime_type: mime_type.into(),
            data,
        });
        self
    }

    pub fn into_turn(self) -> Turn {
        let mut parts = vec![ContentPart::Text { text: self.text }];
        for att in self.attachments {
            parts.push(ContentPart::InlineData {
                mime_type: att.mime_type,
                data: att.data,
            });
        }
        Turn {
            role: Role::User,
            parts,
            timestamp: Some(Utc::now()),
        }
    }
}

/// A binary attachment.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// One composed request against the model capability.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system_instruction: String,
    pub tools: Vec<ToolDefinition>,
    pub turns: Vec<Turn>,
}

/// One model response: zero or more content parts plus usage.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub parts: Vec<ContentPart>,
    pub usage: TokenUsage,
}

impl ModelResponse {
    pub fn has_tool_call(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, ContentPart::ToolCall { .. }))
    }
}

/// Token usage reported by the model capability.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Result of a tool execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Tool definition exposed to the model: name, description, JSON schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Context passed to tools during execution.
///
/// Every datastore write a tool performs is scoped to `user_id`.
#[derive(Clone)]
pub struct ToolContext {
    pub user_id: UserId,
    pub store: Arc<dyn crate::traits::WorkflowStore>,
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Status of a routed tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Completed,
    Error,
}

/// Summary record of one routed tool call, kept for the host UI.
///
/// `step_label` groups related calls under the step that spawned them; it
/// carries no execution semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: serde_json::Value,
    pub status: ToolCallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_label: Option<String>,
}

impl ToolCallRecord {
    pub fn pending(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            arguments,
            status: ToolCallStatus::Pending,
            result: None,
            step_label: None,
        }
    }

    pub fn finish(&mut self, result: &ToolResult) {
        self.status = if result.is_error {
            ToolCallStatus::Error
        } else {
            ToolCallStatus::Completed
        };
        self.result = Some(result.content.clone());
    }
}

/// Per-node status surfaced while a wave executes.
#[derive(Debug, Clone, PartialEq)]
pub enum StepStatus {
    Executing,
    /// Draft deliverable ready; awaiting the user's approval.
    Review { draft: String },
    Error { message: String },
}

/// Transient conversation event, published in generation order.
///
/// Never persisted: the host keeps only the final assistant text and
/// tool-call summaries if it wants durable traces.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// A fragment of assistant text.
    Text(String),
    ToolCallStarted {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
        step_label: Option<String>,
    },
    ToolCallFinished {
        call_id: String,
        name: String,
        result: ToolResult,
        step_label: Option<String>,
    },
    CodeExecutionStarted {
        language: String,
        step_label: Option<String>,
    },
    CodeExecutionFinished {
        language: String,
        output: Option<String>,
        step_label: Option<String>,
    },
    DelegationStarted {
        target: String,
        step_label: Option<String>,
    },
    DelegationFinished {
        target: String,
        succeeded: bool,
        step_label: Option<String>,
    },
    StepStatus {
        step_id: String,
        status: StepStatus,
    },
    /// No further tool calls remain for the current turn.
    Terminal { text: String },
    Fatal { error: String },
}

impl TurnEvent {
    /// Whether this event describes sub-agent tool/code activity that a
    /// delegation layer forwards into its parent stream.
    pub fn is_activity(&self) -> bool {
        matches!(
            self,
            TurnEvent::ToolCallStarted { .. }
                | TurnEvent::ToolCallFinished { .. }
                | TurnEvent::CodeExecutionStarted { .. }
                | TurnEvent::CodeExecutionFinished { .. }
        )
    }
}

/// Outcome of one conversational turn driven to termination.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Final accumulated assistant text.
    pub text: String,
    /// Summaries of every tool call routed during the turn, in call order.
    pub tool_calls: Vec<ToolCallRecord>,
    pub usage: TokenUsage,
}
