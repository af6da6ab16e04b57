use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThinkflowError {
    // Initialization errors
    #[error("Workflow has no startEvent node: {0}")]
    NoStartNode(String),

    #[error("Workflow has more than one startEvent node: {0}")]
    MultipleStartNodes(String),

    #[error("Required input not provided: {0}")]
    MissingRequiredInput(String),

    #[error("Workflow definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("Run instance not found: {0}")]
    RunNotFound(String),

    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    // Executor errors
    #[error("No executor registered for node type: {0}")]
    UnknownNodeType(String),

    #[error("Script failed in node {node}: {message}")]
    Script { node: String, message: String },

    #[error("Script timeout after {timeout_ms}ms in node {node}")]
    ScriptTimeout { node: String, timeout_ms: u64 },

    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    #[error("LLM provider not configured: {0}")]
    LlmNotConfigured(String),

    // Storage errors
    #[error("State store error: {0}")]
    Store(String),

    // RPC errors
    #[error("Broker error: {0}")]
    Broker(String),

    #[error("RPC timeout after {timeout_ms}ms (correlation id {correlation_id})")]
    RpcTimeout {
        correlation_id: String,
        timeout_ms: u64,
    },

    #[error("Remote error: {0}")]
    Remote(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ThinkflowError {
    /// Whether this error prevents a run from ever starting.
    pub fn is_initialization(&self) -> bool {
        matches!(
            self,
            ThinkflowError::NoStartNode(_)
                | ThinkflowError::MultipleStartNodes(_)
                | ThinkflowError::MissingRequiredInput(_)
                | ThinkflowError::DefinitionNotFound(_)
                | ThinkflowError::RunNotFound(_)
                | ThinkflowError::InvalidDefinition(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ThinkflowError>;
