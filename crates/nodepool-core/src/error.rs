//! Error types for the core crate.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while validating identifiers or loading configuration.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid lb group id: {0}")]
    InvalidGroupId(String),

    #[error("invalid lb id: {0}")]
    InvalidLbId(String),

    #[error("config error: {0}")]
    Config(String),
}
