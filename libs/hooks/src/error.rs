//! Error types for hook execution.

use thiserror::Error;

/// Errors that can occur while running hooks.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HookError {
    /// A handler reported a failure.
    #[error("hook handler failed: {0}")]
    Handler(String),

    /// A payload could not be built or interpreted.
    #[error("invalid hook payload: {0}")]
    InvalidPayload(String),
}

impl From<serde_json::Error> for HookError {
    fn from(err: serde_json::Error) -> Self {
        HookError::InvalidPayload(err.to_string())
    }
}
