//! Error types for the capacity crate.

use thiserror::Error;

pub type CapacityResult<T> = Result<T, CapacityError>;

#[derive(Debug, Error)]
pub enum CapacityError {
    #[error("invalid reconciler config: {0}")]
    InvalidConfig(String),
}
