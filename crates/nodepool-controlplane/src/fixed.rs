//! Static control plane — simulated provisioning on fixed addresses.
//!
//! Runners are fabricated from a configured address list after an
//! artificial delay, which is enough to exercise autoscaling logic
//! without real infrastructure. Removal is immediate bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use nodepool_core::Runner;
use nodepool_core::config::ControlPlaneConfig;

use crate::error::{ControlPlaneError, ControlPlaneResult};
use crate::{ControlPlane, new_runner_id};

pub struct StaticControlPlane {
    /// group id → runners, in provisioning order.
    runners: Arc<RwLock<HashMap<String, Vec<Runner>>>>,
    addresses: Vec<String>,
    /// Round-robin cursor into `addresses`.
    next_address: AtomicUsize,
    delay: Duration,
    capacity: i64,
}

impl StaticControlPlane {
    pub fn new(addresses: Vec<String>, delay: Duration, capacity: i64) -> ControlPlaneResult<Self> {
        if addresses.is_empty() {
            return Err(ControlPlaneError::Misconfigured(
                "static control plane needs at least one runner address".into(),
            ));
        }
        Ok(Self {
            runners: Arc::new(RwLock::new(HashMap::new())),
            addresses,
            next_address: AtomicUsize::new(0),
            delay,
            capacity,
        })
    }

    pub fn from_config(config: &ControlPlaneConfig) -> ControlPlaneResult<Self> {
        Self::new(
            config.runner_addresses.clone(),
            config.provision_delay(),
            config.runner_capacity_mb,
        )
    }

    fn make_runners(&self, n: usize) -> Vec<Runner> {
        (0..n)
            .map(|_| {
                let slot = self.next_address.fetch_add(1, Ordering::Relaxed) % self.addresses.len();
                Runner {
                    id: new_runner_id(),
                    address: self.addresses[slot].clone(),
                    capacity: self.capacity,
                }
            })
            .collect()
    }
}

#[async_trait]
impl ControlPlane for StaticControlPlane {
    fn name(&self) -> &str {
        "static"
    }

    async fn get_lbg_runners(&self, group: &str) -> ControlPlaneResult<Vec<Runner>> {
        let runners = self.runners.read().await;
        Ok(runners.get(group).cloned().unwrap_or_default())
    }

    async fn provision_runners(&self, group: &str, n: usize) -> ControlPlaneResult<usize> {
        if n == 0 {
            return Ok(0);
        }

        let fresh = self.make_runners(n);
        let runners = Arc::clone(&self.runners);
        let delay = self.delay;
        let group = group.to_string();

        debug!(%group, n, ?delay, "static provisioning scheduled");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut map = runners.write().await;
            info!(%group, count = fresh.len(), "static runners provisioned");
            map.entry(group).or_default().extend(fresh);
        });

        Ok(n)
    }

    async fn remove_runner(&self, group: &str, id: &str) -> ControlPlaneResult<()> {
        let mut map = self.runners.write().await;
        if let Some(runners) = map.get_mut(group) {
            runners.retain(|r| r.id != id);
            debug!(%group, runner = %id, "static runner removed");
        }
        Ok(())
    }
}
