//! nodepool-capacity — demand aggregation and supply reconciliation.
//!
//! Routers report per-group memory demand; the [`CapacityManager`] keeps
//! a per-(group, router) last-writer-wins view of it and prunes routers
//! that stop reporting. The [`Reconciler`] compares that demand with the
//! runners a control plane reports and provisions or drains runners to
//! close the gap, using an injectable [`ScalingPolicy`].

pub mod error;
pub mod manager;
pub mod policy;
pub mod pool;
pub mod reconciler;
pub mod requirements;

pub use error::{CapacityError, CapacityResult};
pub use manager::{CapacityManager, DemandView, GroupSummary, LbGroup};
pub use policy::{ConservativePolicy, ScalingPolicy};
pub use pool::{PoolCounts, RunnerPool, RunnerStatus};
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use requirements::{LbGroupCapacityRequirements, LbGroupRequirement};
