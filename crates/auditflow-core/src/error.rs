use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditflowError {
    // Tool-call errors (recoverable — converted to function responses)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    // Graph errors
    #[error("Edge references a missing step: {0}")]
    InvalidReference(String),

    #[error("Step cannot depend on itself: {0}")]
    SelfLoop(String),

    #[error("Workflow contains a cycle through step: {0}")]
    CyclicWorkflow(String),

    // Delegation errors
    #[error("Unknown delegate target: {0}")]
    UnknownDelegateTarget(String),

    // Model / loop errors
    #[error("Model call failed: {0}")]
    ModelCallFailed(String),

    #[error("Agent exceeded max turns ({0})")]
    MaxTurnsExceeded(usize),

    #[error("Agent exceeded max duration ({0}s)")]
    MaxDurationExceeded(u64),

    #[error("Cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AuditflowError>;
