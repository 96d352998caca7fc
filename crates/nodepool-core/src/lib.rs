//! nodepool-core — shared data model for the node pool manager.
//!
//! Holds the capacity-advertisement types exchanged between routers and
//! the NPM, the runner description owned by control planes, id
//! validation, and the daemon's configuration surface.

pub mod config;
pub mod error;
pub mod types;

pub use config::NpmConfig;
pub use error::{CoreError, CoreResult};
pub use types::*;
