//! Conversions between wire messages and domain types.

use nodepool_core::{CapacitySnapshot, CapacitySnapshotList, LbGroupMembership};

use crate::proto;

impl From<&CapacitySnapshotList> for proto::CapacitySnapshotList {
    fn from(list: &CapacitySnapshotList) -> Self {
        Self {
            timestamp_ms: list.timestamp_ms,
            lb_id: list.lb_id.clone(),
            snapshots: list
                .snapshots
                .iter()
                .map(|s| proto::CapacitySnapshot {
                    group_id: Some(proto::LbGroupId {
                        id: s.group_id.clone(),
                    }),
                    mem_mb_total: s.mem_mb_total,
                    mem_mb_in_use: s.mem_mb_in_use,
                })
                .collect(),
        }
    }
}

/// A snapshot without a group id maps to an empty id, which validation rejects.
impl From<proto::CapacitySnapshotList> for CapacitySnapshotList {
    fn from(list: proto::CapacitySnapshotList) -> Self {
        Self {
            lb_id: list.lb_id,
            timestamp_ms: list.timestamp_ms,
            snapshots: list
                .snapshots
                .into_iter()
                .map(|s| CapacitySnapshot {
                    group_id: s.group_id.map(|g| g.id).unwrap_or_default(),
                    mem_mb_total: s.mem_mb_total,
                    mem_mb_in_use: s.mem_mb_in_use,
                })
                .collect(),
        }
    }
}

impl From<LbGroupMembership> for proto::LbGroupMembership {
    fn from(m: LbGroupMembership) -> Self {
        Self {
            group_id: Some(proto::LbGroupId { id: m.group_id }),
            runners: m
                .runners
                .into_iter()
                .map(|address| proto::Runner { address })
                .collect(),
        }
    }
}

impl From<proto::LbGroupMembership> for LbGroupMembership {
    fn from(m: proto::LbGroupMembership) -> Self {
        Self {
            group_id: m.group_id.map(|g| g.id).unwrap_or_default(),
            runners: m.runners.into_iter().map(|r| r.address).collect(),
        }
    }
}
