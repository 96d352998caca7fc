//! Domain types for capacity advertisement and runner membership.
//!
//! These mirror the wire messages in `nodepool-cluster` but stay free of
//! protobuf concerns so the capacity manager and control planes can be
//! tested without a transport.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Identifier of a logical group of routers sharing one runner pool.
pub type LbGroupId = String;

/// Identifier of a single router process (a capacity reporter).
pub type LbId = String;

/// Memory capacity a single runner contributes, in MB, unless configured otherwise.
pub const DEFAULT_CAPACITY_PER_RUNNER_MB: i64 = 4096;

/// Longest identifier accepted at the RPC boundary.
pub const MAX_ID_LEN: usize = 255;

// ── Capacity advertisement ─────────────────────────────────────────

/// One router's current memory demand for one LB group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacitySnapshot {
    pub group_id: LbGroupId,
    /// Total memory the router wants available for this group.
    pub mem_mb_total: u64,
    /// Portion of the demand already placed on runners (0 when not tracked).
    #[serde(default)]
    pub mem_mb_in_use: u64,
}

impl CapacitySnapshot {
    pub fn new(group_id: impl Into<LbGroupId>, mem_mb_total: u64) -> Self {
        Self {
            group_id: group_id.into(),
            mem_mb_total,
            mem_mb_in_use: 0,
        }
    }
}

/// Envelope batching every snapshot from one router in one advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacitySnapshotList {
    pub lb_id: LbId,
    pub snapshots: Vec<CapacitySnapshot>,
    /// Unix timestamp (milliseconds) at which the router built the list.
    pub timestamp_ms: u64,
}

impl CapacitySnapshotList {
    pub fn new(lb_id: impl Into<LbId>, snapshots: Vec<CapacitySnapshot>) -> Self {
        Self {
            lb_id: lb_id.into(),
            snapshots,
            timestamp_ms: epoch_millis(),
        }
    }

    /// Check the reporter id and every group id without touching any state.
    pub fn validate(&self) -> CoreResult<()> {
        validate_lb_id(&self.lb_id)?;
        for snapshot in &self.snapshots {
            validate_group_id(&snapshot.group_id)?;
        }
        Ok(())
    }
}

/// A single call's capacity demand, as seen by the router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityRequest {
    pub lb_group_id: LbGroupId,
    pub total_memory_mb: u64,
}

impl CapacityRequest {
    pub fn new(lb_group_id: impl Into<LbGroupId>, total_memory_mb: u64) -> Self {
        Self {
            lb_group_id: lb_group_id.into(),
            total_memory_mb,
        }
    }
}

// ── Runners ────────────────────────────────────────────────────────

/// A backend execution node as reported by a control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runner {
    pub id: String,
    pub address: String,
    /// Memory capacity in MB.
    pub capacity: i64,
}

/// Runner addresses currently assigned to an LB group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbGroupMembership {
    pub group_id: LbGroupId,
    pub runners: Vec<String>,
}

// ── Validation ─────────────────────────────────────────────────────

/// Validate an LB group id received from the wire.
pub fn validate_group_id(id: &str) -> CoreResult<()> {
    check_id(id).map_err(|reason| CoreError::InvalidGroupId(format!("{id:?}: {reason}")))
}

/// Validate a router id received from the wire.
pub fn validate_lb_id(id: &str) -> CoreResult<()> {
    check_id(id).map_err(|reason| CoreError::InvalidLbId(format!("{id:?}: {reason}")))
}

fn check_id(id: &str) -> Result<(), &'static str> {
    if id.trim().is_empty() {
        return Err("empty");
    }
    if id.len() > MAX_ID_LEN {
        return Err("too long");
    }
    if id.chars().any(char::is_control) {
        return Err("contains control characters");
    }
    Ok(())
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
