//! Error types for the firmware agent

use thiserror::Error;

/// Process-level error type for the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("Control-plane error: {0}")]
    ControlPlane(String),

    #[error("Control-plane not connected")]
    NotConnected,

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        AgentError::Internal(err.to_string())
    }
}

/// Why a firmware install was abandoned. The running firmware is untouched
/// on every variant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstallError {
    #[error("Not enough space for a {expected} byte image: {reason}")]
    InsufficientSpace { expected: u64, reason: String },

    #[error("Firmware size was not declared by the transfer")]
    UnknownSize,

    #[error("Incomplete write: {written}/{expected} bytes")]
    IncompleteWrite { written: u64, expected: u64 },

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Commit failed: {0}")]
    CommitFailed(String),

    #[error("Verification failed: {0}")]
    VerificationFailed(String),
}

/// Failure of one update attempt (check or direct install)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    #[error("HTTP failure: status {0}")]
    HttpFailure(u16),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid firmware URL: {0}")]
    InvalidUrl(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Install(#[from] InstallError),
}

impl From<AgentError> for UpdateError {
    fn from(err: AgentError) -> Self {
        UpdateError::Transport(err.to_string())
    }
}
