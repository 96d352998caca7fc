//! Per-group demand, broken down by reporting router.
//!
//! Group totals are maintained incrementally on every update and purge;
//! [`LbGroupCapacityRequirements::recomputed`] exists only to check them.
//! Sums are kept as `i128` so no combination of `i64` reports can
//! overflow them; readers see the total clamped to `i64::MAX`.

use std::collections::HashMap;

use tokio::time::Instant;

use nodepool_core::LbId;

/// The latest report from one router for one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LbGroupRequirement {
    /// When the report was merged.
    pub ts: Instant,
    pub in_use: i64,
    pub total_wanted: i64,
}

#[derive(Debug, Clone, Default)]
pub struct LbGroupCapacityRequirements {
    in_use: i128,
    total_wanted: i128,
    requirements: HashMap<LbId, LbGroupRequirement>,
}

impl LbGroupCapacityRequirements {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace `lb`'s contribution with a new report.
    pub fn update(&mut self, lb: &str, total_wanted: i64, in_use: i64, now: Instant) {
        let next = LbGroupRequirement {
            ts: now,
            in_use,
            total_wanted,
        };
        if let Some(prev) = self.requirements.insert(lb.to_string(), next) {
            self.total_wanted -= i128::from(prev.total_wanted);
            self.in_use -= i128::from(prev.in_use);
        }
        self.total_wanted += i128::from(total_wanted);
        self.in_use += i128::from(in_use);
    }

    /// Drop every report merged before `oldest`, calling `on_removed` once
    /// for each router dropped. Returns the removed router ids.
    pub fn purge<F>(&mut self, oldest: Instant, mut on_removed: F) -> Vec<LbId>
    where
        F: FnMut(&str),
    {
        let stale: Vec<LbId> = self
            .requirements
            .iter()
            .filter(|(_, req)| req.ts < oldest)
            .map(|(lb, _)| lb.clone())
            .collect();

        for lb in &stale {
            if let Some(req) = self.requirements.remove(lb) {
                self.total_wanted -= i128::from(req.total_wanted);
                self.in_use -= i128::from(req.in_use);
                on_removed(lb);
            }
        }
        stale
    }

    pub fn total_wanted(&self) -> i64 {
        clamp(self.total_wanted)
    }

    pub fn in_use(&self) -> i64 {
        clamp(self.in_use)
    }

    /// Number of routers currently contributing.
    pub fn reporters(&self) -> usize {
        self.requirements.len()
    }

    pub fn get(&self, lb: &str) -> Option<&LbGroupRequirement> {
        self.requirements.get(lb)
    }

    /// `(total_wanted, in_use)` summed from scratch.
    pub fn recomputed(&self) -> (i64, i64) {
        let (t, u) = self.requirements.values().fold((0i128, 0i128), |(t, u), r| {
            (t + i128::from(r.total_wanted), u + i128::from(r.in_use))
        });
        (clamp(t), clamp(u))
    }
}

fn clamp(sum: i128) -> i64 {
    i64::try_from(sum).unwrap_or(if sum < 0 { i64::MIN } else { i64::MAX })
}
