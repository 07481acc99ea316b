//! Error types for the execution service

use thiserror::Error;

use crate::lifecycle::UnitStatus;

/// Result type for execution-service operations
pub type Result<T> = std::result::Result<T, SnapError>;

/// Errors that can occur while managing or driving snaps
#[derive(Error, Debug, Clone)]
pub enum SnapError {
    #[error("Channel setup failed: {0}")]
    ChannelSetup(String),

    #[error("Channel closed before a response arrived")]
    ChannelClosed,

    #[error("Snap '{0}' is already running")]
    DuplicateUnit(String),

    #[error("Unknown snap '{0}'")]
    UnknownUnit(String),

    #[error("Snap '{unit_id}' cannot accept requests while {status}")]
    InvalidState {
        unit_id: String,
        status: UnitStatus,
    },

    #[error("Failed to start snap '{unit_id}': {detail}")]
    ExecutionStart { unit_id: String, detail: String },

    #[error("Snap request failed: {0}")]
    ExecutionRuntime(String),

    #[error("Error while running snap '{unit_id}': {detail}")]
    Crash { unit_id: String, detail: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SnapError {
    /// Diagnostic detail suitable for embedding in another error message
    pub fn detail(&self) -> String {
        match self {
            SnapError::Crash { detail, .. } => detail.clone(),
            SnapError::ExecutionRuntime(detail) => detail.clone(),
            other => other.to_string(),
        }
    }
}
