//! Control plane error types.

use thiserror::Error;

/// Errors returned by control plane backends.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("unknown control plane backend: {0}")]
    UnknownBackend(String),

    #[error("control plane misconfigured: {0}")]
    Misconfigured(String),

    #[error("runner not found: {group}/{id}")]
    RunnerNotFound { group: String, id: String },

    #[error("command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ControlPlaneResult<T> = Result<T, ControlPlaneError>;
