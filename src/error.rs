//! Error taxonomy for chat turns, tool calls and session operations.
//!
//! Every error here is local to one turn or one request. None of them is
//! allowed to take the hosting process down.

use thiserror::Error;

/// Errors surfaced by the gateway, the tool registry, the orchestrator and
/// the session directory.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Network or HTTP failure talking to the model endpoint.
    #[error("model request failed: {0}")]
    GatewayTransport(String),

    /// A stream chunk could not be decoded. Logged and skipped by the driver.
    #[error("malformed stream chunk: {0}")]
    GatewayDecode(String),

    /// The body of a `<tool>` span was not a valid invocation.
    #[error("failed to parse tool call JSON: {0}")]
    ToolCallParse(String),

    /// The model named a tool that is not in the catalogue.
    #[error("unknown tool: {0}")]
    ToolNotFound(String),

    /// The tool ran and failed (including timeouts).
    #[error("tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("session {0} not found")]
    SessionNotFound(i64),

    /// The last remaining session can never be deleted.
    #[error("cannot delete the last remaining session")]
    SessionDeleteRefused,

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    /// The caller stopped listening before the turn finished.
    #[error("turn cancelled: caller disconnected")]
    Cancelled,
}

impl ChatError {
    /// Build a [`ChatError::ToolExecution`] from any displayable failure.
    pub fn tool_execution(tool: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::ToolExecution {
            tool: tool.into(),
            message: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for ChatError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Storage(sqlx::Error::Migrate(Box::new(err)))
    }
}
