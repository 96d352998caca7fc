//! Capacity advertiser — the router side of the protocol.
//!
//! `assign_capacity` / `release_capacity` sit on the call path, so they
//! only try to enqueue onto a bounded channel and drop the update with a
//! warning when it is full. A single background task owns the per-group
//! totals, and every tick it sends the whole aggregate to the NPM on a
//! separate task. A lost or dropped update is corrected by the next tick
//! because each advertisement is a full snapshot, not a delta.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use nodepool_core::{CapacityRequest, CapacitySnapshot, CapacitySnapshotList, LbGroupId, LbId};

use crate::error::TransportResult;

pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// What the advertiser needs from an NPM.
#[async_trait]
pub trait NodePoolManager: Send + Sync {
    async fn advertise_capacity(&self, list: &CapacitySnapshotList) -> TransportResult<()>;

    async fn get_runners(&self, group_id: &str) -> TransportResult<Vec<String>>;
}

#[derive(Debug, Clone)]
pub struct AdvertiserConfig {
    pub update_period: Duration,
    pub queue_capacity: usize,
    /// Deadline for one advertisement.
    pub send_timeout: Duration,
}

impl AdvertiserConfig {
    /// Sends are bounded by the update period.
    pub fn new(update_period: Duration) -> Self {
        Self {
            update_period,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            send_timeout: update_period,
        }
    }
}

impl Default for AdvertiserConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[derive(Debug)]
struct CapacityUpdate {
    group_id: LbGroupId,
    mem_mb: u64,
    assign: bool,
}

pub struct CapacityAdvertiser {
    updates: mpsc::Sender<CapacityUpdate>,
    shutdown: watch::Sender<bool>,
}

impl CapacityAdvertiser {
    /// Start advertising on behalf of router `lb_id`. Must be called
    /// inside a tokio runtime.
    pub fn new(npm: Arc<dyn NodePoolManager>, lb_id: impl Into<LbId>, config: AdvertiserConfig) -> Self {
        let (updates, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(run(npm, lb_id.into(), config, rx, shutdown_rx));
        Self { updates, shutdown }
    }

    /// Add a call's demand. Returns false if the update was dropped.
    pub fn assign_capacity(&self, req: &CapacityRequest) -> bool {
        self.push(req, true)
    }

    /// Remove a call's demand. Returns false if the update was dropped.
    pub fn release_capacity(&self, req: &CapacityRequest) -> bool {
        self.push(req, false)
    }

    fn push(&self, req: &CapacityRequest, assign: bool) -> bool {
        let update = CapacityUpdate {
            group_id: req.lb_group_id.clone(),
            mem_mb: req.total_memory_mb,
            assign,
        };
        match self.updates.try_send(update) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(update)) => {
                warn!(group = %update.group_id, mem_mb = update.mem_mb, "capacity queue full, dropping update");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("advertiser stopped, dropping update");
                false
            }
        }
    }

    /// Stop the background task. In-flight sends are not awaited.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for CapacityAdvertiser {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run(
    npm: Arc<dyn NodePoolManager>,
    lb_id: LbId,
    config: AdvertiserConfig,
    mut updates: mpsc::Receiver<CapacityUpdate>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut totals: HashMap<LbGroupId, u64> = HashMap::new();
    let mut tick = tokio::time::interval_at(Instant::now() + config.update_period, config.update_period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(%lb_id, period = ?config.update_period, "capacity advertiser started");
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Some(update) => merge_update(&mut totals, update),
                None => break,
            },
            _ = tick.tick() => {
                while let Ok(update) = updates.try_recv() {
                    merge_update(&mut totals, update);
                }
                send_advertisements(&npm, &lb_id, &mut totals, config.send_timeout);
            }
            _ = shutdown.changed() => break,
        }
    }
    info!(%lb_id, "capacity advertiser stopped");
}

fn merge_update(totals: &mut HashMap<LbGroupId, u64>, update: CapacityUpdate) {
    if update.assign {
        let total = totals.entry(update.group_id).or_default();
        *total = total.saturating_add(update.mem_mb);
        return;
    }

    match totals.get_mut(&update.group_id) {
        Some(total) if *total >= update.mem_mb => *total -= update.mem_mb,
        Some(total) => {
            warn!(group = %update.group_id, held = *total, released = update.mem_mb, "release exceeds assigned capacity");
            *total = 0;
        }
        None => {
            warn!(group = %update.group_id, released = update.mem_mb, "release for group with no assigned capacity");
        }
    }
}

/// Send the current aggregate without waiting, then forget zeroed groups.
fn send_advertisements(
    npm: &Arc<dyn NodePoolManager>,
    lb_id: &str,
    totals: &mut HashMap<LbGroupId, u64>,
    timeout: Duration,
) {
    let mut snapshots: Vec<CapacitySnapshot> = totals
        .iter()
        .map(|(group, mb)| CapacitySnapshot::new(group.clone(), *mb))
        .collect();
    snapshots.sort_by(|a, b| a.group_id.cmp(&b.group_id));
    let list = CapacitySnapshotList::new(lb_id, snapshots);

    let npm = Arc::clone(npm);
    tokio::spawn(async move {
        match tokio::time::timeout(timeout, npm.advertise_capacity(&list)).await {
            Ok(Ok(())) => debug!(lb = %list.lb_id, groups = list.snapshots.len(), "capacity advertised"),
            Ok(Err(e)) => warn!(lb = %list.lb_id, error = %e, "failed to advertise capacity"),
            Err(_) => warn!(lb = %list.lb_id, ?timeout, "capacity advertisement timed out"),
        }
    });

    totals.retain(|_, mb| *mb != 0);
}
