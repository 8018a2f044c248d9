//! Error types shared across the proxy.
//!
//! Defines the taxonomy every component maps failures onto. `Quarantined`
//! and `PendingAuth` are not meant to reach a caller as `Err(..)` — the
//! router turns them into ordinary tool results — but they live here so
//! every component speaks the same vocabulary.

use thiserror::Error;

pub type McpResult<T> = Result<T, McpError>;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("pending authentication: {0}")]
    PendingAuth(String),

    #[error("quarantined: {0}")]
    Quarantined(String),

    #[error("data flow security: {0}")]
    FlowPolicyDenied(String),

    #[error("upstream error ({status}): {body}")]
    UpstreamError { status: u16, body: String },

    #[error("tool name collision: '{tool_name}' exists on servers: {servers:?}")]
    ToolCollision {
        tool_name: String,
        servers: Vec<String>,
    },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Sdk(#[from] Box<rmcp::RmcpError>),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Store(#[from] sled::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl McpError {
    /// HTTP status code this error should surface as on the auxiliary REST
    /// facade. The MCP surface itself never uses these directly (errors
    /// there become tool-result text), but `http.rs` does.
    pub fn status_code(&self) -> u16 {
        match self {
            McpError::InvalidRequest(_) => 400,
            McpError::Unauthorized | McpError::Auth(_) => 401,
            McpError::NotFound(_) | McpError::ServerNotFound(_) => 404,
            McpError::RateLimitExceeded(_) => 429,
            McpError::Timeout(_) => 504,
            McpError::UpstreamError { status, .. } => *status,
            McpError::Internal(_) => 500,
            _ => 500,
        }
    }

    /// True for errors that are logged at debug level on known-noisy
    /// transports rather than surfaced loudly, per the propagation policy.
    pub fn is_quiet(&self) -> bool {
        matches!(self, McpError::Timeout(_) | McpError::Cancelled(_))
    }
}
