//! Reconciliation loop — closes the gap between demand and supply.
//!
//! Every poll tick each group is brought up to date with its control
//! plane (drained runners past their lifetime are removed, new runners
//! join) and then rescaled. Demand changes trigger a rescale without
//! polling. The purge tick drops routers that stopped reporting.
//! Control-plane failures are logged and retried on the next cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use nodepool_controlplane::ControlPlane;
use nodepool_core::{DEFAULT_CAPACITY_PER_RUNNER_MB, NpmConfig};

use crate::error::{CapacityError, CapacityResult};
use crate::manager::{CapacityManager, LbGroup};
use crate::policy::{ConservativePolicy, ScalingPolicy};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    pub poll_interval: Duration,
    pub purge_interval: Duration,
    /// Router reports older than this are purged.
    pub staleness: Duration,
    /// Cap on a single provisioning request.
    pub max_provision_at_once: usize,
    pub drain_lifetime: Duration,
    /// How long a provisioning request counts as supply before it is
    /// given up on.
    pub provision_timeout: Duration,
    pub capacity_per_runner_mb: i64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            purge_interval: Duration::from_secs(5),
            staleness: Duration::from_secs(5),
            max_provision_at_once: 20,
            drain_lifetime: Duration::from_secs(50),
            provision_timeout: Duration::from_secs(300),
            capacity_per_runner_mb: DEFAULT_CAPACITY_PER_RUNNER_MB,
        }
    }
}

impl ReconcilerConfig {
    pub fn from_config(config: &NpmConfig) -> Self {
        let cap = &config.capacity;
        Self {
            poll_interval: cap.poll_interval(),
            purge_interval: cap.purge_interval(),
            staleness: cap.staleness(),
            max_provision_at_once: cap.max_provision_at_once,
            drain_lifetime: cap.drain_lifetime(),
            provision_timeout: cap.provision_timeout(),
            capacity_per_runner_mb: config.control_plane.runner_capacity_mb,
        }
    }

    fn validate(&self) -> CapacityResult<()> {
        if self.poll_interval.is_zero() || self.purge_interval.is_zero() {
            return Err(CapacityError::InvalidConfig("intervals must be non-zero".into()));
        }
        if self.max_provision_at_once == 0 {
            return Err(CapacityError::InvalidConfig(
                "max_provision_at_once must be at least 1".into(),
            ));
        }
        if self.capacity_per_runner_mb <= 0 {
            return Err(CapacityError::InvalidConfig(
                "capacity_per_runner_mb must be positive".into(),
            ));
        }
        Ok(())
    }
}

pub struct Reconciler {
    manager: Arc<CapacityManager>,
    control_plane: Arc<dyn ControlPlane>,
    policy: Box<dyn ScalingPolicy>,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// A reconciler using [`ConservativePolicy`] with no bounds.
    pub fn new(
        manager: Arc<CapacityManager>,
        control_plane: Arc<dyn ControlPlane>,
        config: ReconcilerConfig,
    ) -> CapacityResult<Self> {
        config.validate()?;
        Ok(Self {
            manager,
            control_plane,
            policy: Box::new(ConservativePolicy::default()),
            config,
        })
    }

    pub fn with_policy(mut self, policy: impl ScalingPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    /// Run until `shutdown` flips or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut purge = tokio::time::interval_at(
            Instant::now() + self.config.purge_interval,
            self.config.purge_interval,
        );
        purge.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            control_plane = self.control_plane.name(),
            poll = ?self.config.poll_interval,
            purge = ?self.config.purge_interval,
            "reconciler started"
        );

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    self.poll_all().await;
                    self.scale_all().await;
                }
                _ = purge.tick() => {
                    self.purge_stale().await;
                    self.scale_all().await;
                }
                _ = self.manager.changed() => {
                    self.scale_all().await;
                }
                _ = shutdown.changed() => {
                    info!("reconciler shutting down");
                    break;
                }
            }
        }
    }

    /// Sync every group's pool with the control plane.
    pub async fn poll_all(&self) {
        for (group, _) in self.manager.snapshot().await {
            self.poll_group(&group).await;
        }
    }

    /// Rescale every group against its current demand.
    pub async fn scale_all(&self) {
        for (group, wanted) in self.manager.snapshot().await {
            self.scale_group(&group, wanted).await;
        }
    }

    /// Drop router reports older than the staleness window.
    pub async fn purge_stale(&self) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(self.config.staleness) else {
            return 0;
        };
        let removed = self
            .manager
            .purge(cutoff, |group, lb| {
                warn!(%group, %lb, "purging lb, no report within staleness window")
            })
            .await;
        if removed > 0 {
            debug!(removed, "purged stale capacity reports");
        }
        removed
    }

    async fn poll_group(&self, group: &LbGroup) {
        let id = group.id();

        let doomed = {
            let mut pool = group.pool().write().await;
            pool.expire_draining(Instant::now());
            pool.dead()
        };
        for runner in doomed {
            if let Err(e) = self.control_plane.remove_runner(id, &runner.id).await {
                warn!(group = %id, runner = %runner.id, error = %e, "failed to remove runner");
            }
        }

        match self.control_plane.get_lbg_runners(id).await {
            Ok(latest) => {
                let (added, removed) = group.pool().write().await.observe(&latest, Instant::now());
                if added > 0 || removed > 0 {
                    debug!(group = %id, added, removed, "runner pool updated");
                }
            }
            Err(e) => warn!(group = %id, error = %e, "failed to list runners"),
        }
    }

    async fn scale_group(&self, group: &LbGroup, wanted: i64) {
        let id = group.id();
        let (desired, missing) = {
            let mut pool = group.pool().write().await;
            let desired = self.policy.desired_runners(
                wanted,
                pool.provisioned(),
                self.config.capacity_per_runner_mb,
            );
            (desired, pool.plan(desired, Instant::now(), self.config.drain_lifetime))
        };
        if missing == 0 {
            return;
        }

        // The pool lock is not held while the control plane works.
        let ask = missing.min(self.config.max_provision_at_once);
        match self.control_plane.provision_runners(id, ask).await {
            Ok(accepted) => {
                info!(group = %id, wanted_mb = wanted, desired, requested = ask, accepted, "provisioning runners");
                group.pool().write().await.record_requested(
                    accepted,
                    Instant::now(),
                    self.config.provision_timeout,
                );
            }
            Err(e) => warn!(group = %id, requested = ask, error = %e, "provisioning failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use nodepool_controlplane::{ControlPlaneError, ControlPlaneResult, StaticControlPlane};
    use nodepool_core::{CapacitySnapshot, CapacitySnapshotList, Runner};

    /// Records requests; runners appear only when a test adds them.
    #[derive(Default)]
    struct MockControlPlane {
        listed: Mutex<HashMap<String, Vec<Runner>>>,
        provisioned: Mutex<Vec<(String, usize)>>,
        removed: Mutex<Vec<String>>,
        fail: AtomicBool,
    }

    impl MockControlPlane {
        fn bring_up(&self, group: &str, ids: &[&str]) {
            let mut listed = self.listed.lock().unwrap();
            let runners = listed.entry(group.to_string()).or_default();
            for id in ids {
                runners.push(Runner {
                    id: id.to_string(),
                    address: format!("{id}:9190"),
                    capacity: 4096,
                });
            }
        }

        fn requests(&self) -> Vec<(String, usize)> {
            self.provisioned.lock().unwrap().clone()
        }

        fn check(&self) -> ControlPlaneResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ControlPlaneError::Misconfigured("injected failure".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ControlPlane for MockControlPlane {
        fn name(&self) -> &str {
            "mock"
        }

        async fn get_lbg_runners(&self, group: &str) -> ControlPlaneResult<Vec<Runner>> {
            self.check()?;
            Ok(self.listed.lock().unwrap().get(group).cloned().unwrap_or_default())
        }

        async fn provision_runners(&self, group: &str, n: usize) -> ControlPlaneResult<usize> {
            self.check()?;
            self.provisioned.lock().unwrap().push((group.to_string(), n));
            Ok(n)
        }

        async fn remove_runner(&self, group: &str, id: &str) -> ControlPlaneResult<()> {
            self.check()?;
            self.removed.lock().unwrap().push(id.to_string());
            if let Some(runners) = self.listed.lock().unwrap().get_mut(group) {
                runners.retain(|r| r.id != id);
            }
            Ok(())
        }
    }

    fn setup() -> (Arc<CapacityManager>, Arc<MockControlPlane>, Reconciler) {
        let manager = Arc::new(CapacityManager::new());
        let cp = Arc::new(MockControlPlane::default());
        let reconciler = Reconciler::new(
            Arc::clone(&manager),
            Arc::clone(&cp) as Arc<dyn ControlPlane>,
            ReconcilerConfig::default(),
        )
        .unwrap();
        (manager, cp, reconciler)
    }

    async fn demand(manager: &CapacityManager, lb: &str, group: &str, mb: u64) {
        manager
            .merge(&CapacitySnapshotList::new(lb, vec![CapacitySnapshot::new(group, mb)]))
            .await;
    }

    #[tokio::test]
    async fn provisions_enough_runners_for_demand() {
        let (manager, cp, reconciler) = setup();
        demand(&manager, "lb-a", "g1", 5000).await;

        reconciler.scale_all().await;
        assert_eq!(cp.requests(), vec![("g1".to_string(), 2)]);

        // Outstanding requests count as supply.
        reconciler.scale_all().await;
        assert_eq!(cp.requests().len(), 1);

        cp.bring_up("g1", &["r1", "r2"]);
        reconciler.poll_all().await;
        reconciler.scale_all().await;

        let mut members = manager.lb_group_members("g1").await;
        members.sort();
        assert_eq!(members, vec!["r1:9190", "r2:9190"]);
        assert_eq!(cp.requests().len(), 1);
    }

    #[tokio::test]
    async fn large_gaps_are_requested_in_bounded_batches() {
        let (manager, cp, reconciler) = setup();
        demand(&manager, "lb-a", "g1", 50 * 4096).await;

        reconciler.scale_all().await;
        reconciler.scale_all().await;
        reconciler.scale_all().await;
        assert_eq!(
            cp.requests().iter().map(|(_, n)| *n).collect::<Vec<_>>(),
            vec![20, 20, 10]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_runners_drain_then_get_removed() {
        let (manager, cp, reconciler) = setup();
        demand(&manager, "lb-a", "g1", 8192).await;
        cp.bring_up("g1", &["r1", "r2"]);
        reconciler.poll_all().await;
        reconciler.scale_all().await;
        assert!(cp.requests().is_empty());

        demand(&manager, "lb-a", "g1", 4096).await;
        reconciler.scale_all().await;
        assert_eq!(manager.lb_group_members("g1").await, vec!["r1:9190"]);

        // Still draining: nothing removed yet.
        tokio::time::advance(Duration::from_secs(49)).await;
        reconciler.poll_all().await;
        assert!(cp.removed.lock().unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        reconciler.poll_all().await;
        assert_eq!(*cp.removed.lock().unwrap(), vec!["r2".to_string()]);

        let counts = manager.lb_group("g1").await.unwrap().counts().await;
        assert_eq!((counts.active, counts.draining, counts.dead), (1, 0, 0));
    }

    #[tokio::test]
    async fn returning_demand_reactivates_draining_runner() {
        let (manager, cp, reconciler) = setup();
        cp.bring_up("g1", &["r1"]);
        demand(&manager, "lb-a", "g1", 0).await;
        reconciler.poll_all().await;
        reconciler.scale_all().await;
        assert!(manager.lb_group_members("g1").await.is_empty());

        demand(&manager, "lb-a", "g1", 100).await;
        reconciler.scale_all().await;
        assert_eq!(manager.lb_group_members("g1").await, vec!["r1:9190"]);
        assert!(cp.requests().is_empty());
    }

    #[tokio::test]
    async fn control_plane_failures_are_retried_next_cycle() {
        let (manager, cp, reconciler) = setup();
        demand(&manager, "lb-a", "g1", 1).await;

        cp.fail.store(true, Ordering::SeqCst);
        reconciler.poll_all().await;
        reconciler.scale_all().await;
        assert!(cp.requests().is_empty());

        cp.fail.store(false, Ordering::SeqCst);
        reconciler.scale_all().await;
        assert_eq!(cp.requests(), vec![("g1".to_string(), 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_quiet_routers() {
        let (manager, _cp, reconciler) = setup();
        demand(&manager, "lb-a", "g1", 128).await;
        assert_eq!(reconciler.purge_stale().await, 0);

        tokio::time::advance(Duration::from_secs(6)).await;
        demand(&manager, "lb-b", "g1", 256).await;
        assert_eq!(reconciler.purge_stale().await, 1);
        assert_eq!(manager.demand("g1").await.unwrap().total_wanted, 256);
    }

    #[tokio::test]
    async fn custom_policy_is_used() {
        let (manager, cp, reconciler) = setup();
        let reconciler = reconciler.with_policy(|_: i64, _: usize, _: i64| 3usize);
        demand(&manager, "lb-a", "g1", 0).await;

        reconciler.scale_all().await;
        assert_eq!(cp.requests(), vec![("g1".to_string(), 3)]);
    }

    /// Holds every provisioning call until released.
    #[derive(Default)]
    struct GatedControlPlane {
        entered: tokio::sync::Notify,
        gate: tokio::sync::Notify,
    }

    #[async_trait]
    impl ControlPlane for GatedControlPlane {
        fn name(&self) -> &str {
            "gated"
        }

        async fn get_lbg_runners(&self, _group: &str) -> ControlPlaneResult<Vec<Runner>> {
            Ok(vec![])
        }

        async fn provision_runners(&self, _group: &str, n: usize) -> ControlPlaneResult<usize> {
            self.entered.notify_one();
            self.gate.notified().await;
            Ok(n)
        }

        async fn remove_runner(&self, _group: &str, _id: &str) -> ControlPlaneResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn membership_stays_readable_while_provisioning() {
        let manager = Arc::new(CapacityManager::new());
        let cp = Arc::new(GatedControlPlane::default());
        let reconciler = Arc::new(
            Reconciler::new(
                Arc::clone(&manager),
                Arc::clone(&cp) as Arc<dyn ControlPlane>,
                ReconcilerConfig::default(),
            )
            .unwrap(),
        );
        demand(&manager, "lb-a", "g1", 5000).await;

        let scaling = {
            let reconciler = Arc::clone(&reconciler);
            tokio::spawn(async move { reconciler.scale_all().await })
        };
        cp.entered.notified().await;

        let members = tokio::time::timeout(Duration::from_secs(1), manager.lb_group_members("g1"))
            .await
            .expect("membership read blocked by provisioning");
        assert!(members.is_empty());

        cp.gate.notify_one();
        scaling.await.unwrap();
        let counts = manager.lb_group("g1").await.unwrap().counts().await;
        assert_eq!(counts.pending, 2);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = ReconcilerConfig {
            poll_interval: Duration::ZERO,
            ..ReconcilerConfig::default()
        };
        let result = Reconciler::new(
            Arc::new(CapacityManager::new()),
            Arc::new(MockControlPlane::default()),
            config,
        );
        assert!(matches!(result, Err(CapacityError::InvalidConfig(_))));
    }

    #[test]
    fn config_follows_npm_config() {
        let mut npm = NpmConfig::default();
        npm.capacity.max_provision_at_once = 7;
        npm.control_plane.runner_capacity_mb = 1024;

        let config = ReconcilerConfig::from_config(&npm);
        assert_eq!(config.max_provision_at_once, 7);
        assert_eq!(config.capacity_per_runner_mb, 1024);
        assert_eq!(config.drain_lifetime, Duration::from_secs(50));
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_scales_a_group_and_stops_on_shutdown() {
        let manager = Arc::new(CapacityManager::new());
        let cp = Arc::new(
            StaticControlPlane::new(vec!["10.0.0.1:9190".into()], Duration::from_millis(100), 4096)
                .unwrap(),
        );
        let reconciler =
            Reconciler::new(Arc::clone(&manager), cp, ReconcilerConfig::default()).unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(reconciler.run(rx));

        demand(&manager, "lb-a", "g1", 4096).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(manager.lb_group_members("g1").await, vec!["10.0.0.1:9190"]);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
