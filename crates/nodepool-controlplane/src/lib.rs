//! nodepool-controlplane — how runners come into existence.
//!
//! A [`ControlPlane`] lists, provisions, and removes the runners backing
//! an LB group. Callers hold an `Arc<dyn ControlPlane>` chosen once at
//! startup through a [`ControlPlaneRegistry`] and never branch on the
//! concrete backend.
//!
//! # Backends
//!
//! | Name | Type | Behaviour |
//! |---|---|---|
//! | `static` | [`StaticControlPlane`] | Fabricates runners on fixed addresses after a delay |
//! | `command` | [`CommandControlPlane`] | Shells out to external provisioning tools |

pub mod command;
pub mod error;
pub mod fixed;
pub mod registry;

use async_trait::async_trait;
use nodepool_core::Runner;

pub use command::CommandControlPlane;
pub use error::{ControlPlaneError, ControlPlaneResult};
pub use fixed::StaticControlPlane;
pub use registry::{ControlPlaneFactory, ControlPlaneRegistry};

/// Capability set every runner fleet backend provides.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Short backend name, for logs.
    fn name(&self) -> &str;

    /// Runners currently provisioned for a group. Unknown groups have none.
    async fn get_lbg_runners(&self, group: &str) -> ControlPlaneResult<Vec<Runner>>;

    /// Ask for `n` more runners. Returns how many requests were accepted;
    /// the runners show up in [`get_lbg_runners`](Self::get_lbg_runners)
    /// once provisioning finishes in the background.
    async fn provision_runners(&self, group: &str, n: usize) -> ControlPlaneResult<usize>;

    /// Stop returning the runner from [`get_lbg_runners`](Self::get_lbg_runners).
    async fn remove_runner(&self, group: &str, id: &str) -> ControlPlaneResult<()>;
}

/// Random, UUID-shaped runner id.
pub(crate) fn new_runner_id() -> String {
    let mut b = [0u8; 16];
    if getrandom::getrandom(&mut b).is_err() {
        // Fall back to the clock; ids only need to be unique per control plane.
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        b = nanos.to_be_bytes();
    }
    format!(
        "{}-{}-{}-{}-{}",
        hex::encode_upper(&b[0..4]),
        hex::encode_upper(&b[4..6]),
        hex::encode_upper(&b[6..8]),
        hex::encode_upper(&b[8..10]),
        hex::encode_upper(&b[10..]),
    )
}
