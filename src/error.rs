//! Error types for the assistant bridge.

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the assistant bridge.
#[derive(Error, Debug)]
pub enum Error {
    // ===== Tool Server Lifecycle Errors =====
    #[error("MCP server '{server}' is not running")]
    NotRunning { server: String },

    #[error("failed to spawn MCP server '{server}': {reason}")]
    Spawn { server: String, reason: String },

    #[error("MCP server '{server}' did not complete initialize within {timeout_ms}ms")]
    HandshakeTimeout { server: String, timeout_ms: u64 },

    #[error("MCP server '{server}' exited unexpectedly")]
    ProcessExited { server: String },

    #[error("MCP server '{server}' stopped")]
    ServerStopped { server: String },

    // ===== Call Errors =====
    #[error("MCP response timeout: '{method}' got no reply within {timeout_ms}ms")]
    CallTimeout { method: String, timeout_ms: u64 },

    #[error("MCP error {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error("tool '{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("MCP protocol error: {0}")]
    McpProtocol(String),

    // ===== I/O Errors =====
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // ===== Internal Errors =====
    #[error("HTTP server error: {0}")]
    HttpServer(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Build a `NotRunning` error for the named server.
    pub fn not_running(server: impl Into<String>) -> Self {
        Self::NotRunning {
            server: server.into(),
        }
    }

    /// True when the call failed only because the tool server is down.
    ///
    /// List-style HTTP reads render this as an empty collection.
    pub fn is_not_running(&self) -> bool {
        matches!(self, Self::NotRunning { .. })
    }

    /// True for the timeout kinds (handshake or call).
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::HandshakeTimeout { .. } | Self::CallTimeout { .. }
        )
    }

    /// HTTP status used when this error crosses the API boundary.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
