//! Runner pool — the supply side of one LB group.
//!
//! Fed only by what the control plane reports. Runners move
//! `Active → Draining → Dead`; a draining runner can be reactivated if
//! demand comes back before its drain lifetime ends. Dead runners are
//! handed to the control plane for removal and forgotten once it stops
//! listing them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use nodepool_core::Runner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerStatus {
    Active,
    Draining,
    Dead,
}

#[derive(Debug, Clone)]
struct PooledRunner {
    runner: Runner,
    status: RunnerStatus,
    kill_after: Option<Instant>,
}

/// Runner counts by state, for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolCounts {
    pub active: usize,
    pub draining: usize,
    pub dead: usize,
    pub pending: usize,
}

#[derive(Debug, Default)]
pub struct RunnerPool {
    runners: HashMap<String, PooledRunner>,
    /// Ids in activation order; the newest is drained first.
    active: Vec<String>,
    /// Ids in drain order; the oldest expires first, the newest is reactivated first.
    draining: Vec<String>,
    dead: Vec<String>,
    /// Deadlines of provisioning requests not yet fulfilled.
    pending: VecDeque<Instant>,
}

impl RunnerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move draining runners whose drain lifetime has passed to `Dead`.
    /// Returns the runners that just died.
    pub fn expire_draining(&mut self, now: Instant) -> Vec<Runner> {
        let mut expired = Vec::new();
        while let Some(id) = self.draining.first() {
            let Some(entry) = self.runners.get_mut(id) else {
                self.draining.remove(0);
                continue;
            };
            if entry.kill_after.is_some_and(|t| t > now) {
                break;
            }
            info!(runner = %id, address = %entry.runner.address, "drain complete, runner is dead");
            entry.status = RunnerStatus::Dead;
            entry.kill_after = None;
            expired.push(entry.runner.clone());
            let id = self.draining.remove(0);
            self.dead.push(id);
        }
        expired
    }

    /// Runners waiting for the control plane to remove them.
    pub fn dead(&self) -> Vec<Runner> {
        self.dead
            .iter()
            .filter_map(|id| self.runners.get(id))
            .map(|e| e.runner.clone())
            .collect()
    }

    /// Reconcile with the control plane's current listing.
    ///
    /// New runners join as active and consume one pending request each;
    /// runners no longer listed are forgotten whatever their state.
    /// Returns `(added, removed)`.
    pub fn observe(&mut self, latest: &[Runner], now: Instant) -> (usize, usize) {
        let before = self.pending.len();
        self.pending.retain(|deadline| *deadline > now);
        let timed_out = before - self.pending.len();
        if timed_out > 0 {
            warn!(count = timed_out, "provisioning requests timed out");
        }

        let mut added = 0;
        let mut seen = HashSet::with_capacity(latest.len());
        for runner in latest {
            seen.insert(runner.id.as_str());
            if self.runners.contains_key(&runner.id) {
                continue;
            }
            info!(runner = %runner.id, address = %runner.address, "new runner is active");
            self.runners.insert(
                runner.id.clone(),
                PooledRunner {
                    runner: runner.clone(),
                    status: RunnerStatus::Active,
                    kill_after: None,
                },
            );
            self.active.push(runner.id.clone());
            self.pending.pop_front();
            added += 1;
        }

        let gone: Vec<String> = self
            .runners
            .keys()
            .filter(|id| !seen.contains(id.as_str()))
            .cloned()
            .collect();
        for id in &gone {
            if let Some(entry) = self.runners.remove(id) {
                debug!(runner = %id, status = ?entry.status, "runner no longer listed");
            }
        }
        if !gone.is_empty() {
            let runners = &self.runners;
            self.active.retain(|id| runners.contains_key(id));
            self.draining.retain(|id| runners.contains_key(id));
            self.dead.retain(|id| runners.contains_key(id));
        }

        (added, gone.len())
    }

    /// Move toward `desired` runners.
    ///
    /// Scaling up reactivates the most recently drained runners first and
    /// returns how many more must be provisioned. Scaling down drains the
    /// most recently activated runners and returns 0.
    pub fn plan(&mut self, desired: usize, now: Instant, drain_lifetime: Duration) -> usize {
        if desired > self.provisioned() {
            while desired > self.provisioned() {
                let Some(id) = self.draining.pop() else { break };
                if let Some(entry) = self.runners.get_mut(&id) {
                    info!(runner = %id, address = %entry.runner.address, "reactivating draining runner");
                    entry.status = RunnerStatus::Active;
                    entry.kill_after = None;
                }
                self.active.push(id);
            }
            return desired.saturating_sub(self.provisioned());
        }

        while self.provisioned() > desired {
            let Some(id) = self.active.pop() else { break };
            if let Some(entry) = self.runners.get_mut(&id) {
                info!(runner = %id, address = %entry.runner.address, "draining runner");
                entry.status = RunnerStatus::Draining;
                entry.kill_after = Some(now + drain_lifetime);
            }
            self.draining.push(id);
        }
        0
    }

    /// Remember `n` accepted provisioning requests until `now + timeout`.
    pub fn record_requested(&mut self, n: usize, now: Instant, timeout: Duration) {
        let deadline = now + timeout;
        self.pending.extend(std::iter::repeat_n(deadline, n));
    }

    /// Addresses of active runners, in activation order.
    pub fn members(&self) -> Vec<String> {
        self.active
            .iter()
            .filter_map(|id| self.runners.get(id))
            .map(|e| e.runner.address.clone())
            .collect()
    }

    /// Active runners plus outstanding provisioning requests.
    pub fn provisioned(&self) -> usize {
        self.active.len() + self.pending.len()
    }

    pub fn status(&self, id: &str) -> Option<RunnerStatus> {
        self.runners.get(id).map(|e| e.status)
    }

    pub fn counts(&self) -> PoolCounts {
        PoolCounts {
            active: self.active.len(),
            draining: self.draining.len(),
            dead: self.dead.len(),
            pending: self.pending.len(),
        }
    }
}
