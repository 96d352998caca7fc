//! Capacity manager — the NPM's view of demand per LB group.
//!
//! Every router's snapshot list is merged under one coarse lock,
//! last-writer-wins per (group, router) in arrival order. Supply (runner
//! membership) lives in each group's [`RunnerPool`], which only the
//! reconciler writes to.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

use nodepool_core::{CapacitySnapshotList, LbGroupId};

use crate::pool::{PoolCounts, RunnerPool};
use crate::requirements::LbGroupCapacityRequirements;

/// One LB group's supply side.
#[derive(Debug)]
pub struct LbGroup {
    id: LbGroupId,
    pool: RwLock<RunnerPool>,
}

impl LbGroup {
    fn new(id: LbGroupId) -> Self {
        Self {
            id,
            pool: RwLock::new(RunnerPool::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Addresses of the group's active runners.
    pub async fn get_members(&self) -> Vec<String> {
        self.pool.read().await.members()
    }

    pub async fn counts(&self) -> PoolCounts {
        self.pool.read().await.counts()
    }

    pub(crate) fn pool(&self) -> &RwLock<RunnerPool> {
        &self.pool
    }
}

/// Aggregated demand for one group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DemandView {
    pub total_wanted: i64,
    pub in_use: i64,
    pub reporters: usize,
}

/// Demand and supply of one group, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSummary {
    pub group_id: LbGroupId,
    pub demand: DemandView,
    pub runners: PoolCounts,
    pub members: Vec<String>,
}

struct GroupEntry {
    requirements: LbGroupCapacityRequirements,
    group: Arc<LbGroup>,
}

impl GroupEntry {
    fn new(id: &str) -> Self {
        Self {
            requirements: LbGroupCapacityRequirements::new(),
            group: Arc::new(LbGroup::new(id.to_string())),
        }
    }

    fn demand(&self) -> DemandView {
        DemandView {
            total_wanted: self.requirements.total_wanted(),
            in_use: self.requirements.in_use(),
            reporters: self.requirements.reporters(),
        }
    }
}

#[derive(Default)]
pub struct CapacityManager {
    groups: RwLock<HashMap<LbGroupId, GroupEntry>>,
    changed: Notify,
}

impl CapacityManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a router's snapshot list, stamped with the current time.
    pub async fn merge(&self, list: &CapacitySnapshotList) {
        self.merge_at(list, Instant::now()).await;
    }

    /// Merge a router's snapshot list as if it arrived at `now`.
    ///
    /// Ids are assumed valid; the RPC layer rejects bad ones first.
    pub async fn merge_at(&self, list: &CapacitySnapshotList, now: Instant) {
        if list.snapshots.is_empty() {
            return;
        }

        let mut groups = self.groups.write().await;
        for snap in &list.snapshots {
            let entry = groups.entry(snap.group_id.clone()).or_insert_with(|| {
                info!(group = %snap.group_id, "new lb group");
                GroupEntry::new(&snap.group_id)
            });
            entry.requirements.update(
                &list.lb_id,
                clamp_mb(snap.mem_mb_total),
                clamp_mb(snap.mem_mb_in_use),
                now,
            );
            debug!(
                group = %snap.group_id,
                lb = %list.lb_id,
                reported = snap.mem_mb_total,
                total_wanted = entry.requirements.total_wanted(),
                "merged capacity snapshot"
            );
        }
        drop(groups);

        self.changed.notify_one();
    }

    /// Drop every router report older than `oldest`, calling
    /// `on_removed(group, lb)` once per dropped report. Returns how many
    /// reports were dropped.
    pub async fn purge<F>(&self, oldest: Instant, mut on_removed: F) -> usize
    where
        F: FnMut(&str, &str),
    {
        let mut groups = self.groups.write().await;
        let mut removed = 0;
        for (group_id, entry) in groups.iter_mut() {
            removed += entry
                .requirements
                .purge(oldest, |lb| on_removed(group_id.as_str(), lb))
                .len();
        }
        drop(groups);

        if removed > 0 {
            self.changed.notify_one();
        }
        removed
    }

    /// The group's handle, if any router has reported demand for it.
    pub async fn lb_group(&self, id: &str) -> Option<Arc<LbGroup>> {
        self.groups
            .read()
            .await
            .get(id)
            .map(|entry| Arc::clone(&entry.group))
    }

    /// Active runner addresses for a group. Empty for a group that is
    /// unknown or has no runners yet; lookups never create groups.
    pub async fn lb_group_members(&self, id: &str) -> Vec<String> {
        match self.lb_group(id).await {
            Some(group) => group.get_members().await,
            None => Vec::new(),
        }
    }

    pub async fn demand(&self, id: &str) -> Option<DemandView> {
        self.groups.read().await.get(id).map(GroupEntry::demand)
    }

    /// Known group ids, sorted.
    pub async fn groups(&self) -> Vec<LbGroupId> {
        let mut ids: Vec<LbGroupId> = self.groups.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Every group's handle with its current `total_wanted`.
    pub(crate) async fn snapshot(&self) -> Vec<(Arc<LbGroup>, i64)> {
        self.groups
            .read()
            .await
            .values()
            .map(|e| (Arc::clone(&e.group), e.requirements.total_wanted()))
            .collect()
    }

    pub async fn summary(&self, id: &str) -> Option<GroupSummary> {
        let (group, demand) = {
            let groups = self.groups.read().await;
            let entry = groups.get(id)?;
            (Arc::clone(&entry.group), entry.demand())
        };
        Some(summarize(&group, demand).await)
    }

    /// Demand and supply of every group, sorted by id.
    pub async fn summaries(&self) -> Vec<GroupSummary> {
        let mut entries: Vec<(Arc<LbGroup>, DemandView)> = self
            .groups
            .read()
            .await
            .values()
            .map(|e| (Arc::clone(&e.group), e.demand()))
            .collect();
        entries.sort_by(|a, b| a.0.id.cmp(&b.0.id));

        let mut out = Vec::with_capacity(entries.len());
        for (group, demand) in entries {
            out.push(summarize(&group, demand).await);
        }
        out
    }

    /// Resolves after the next demand change or new group.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}

async fn summarize(group: &LbGroup, demand: DemandView) -> GroupSummary {
    let pool = group.pool.read().await;
    GroupSummary {
        group_id: group.id.clone(),
        demand,
        runners: pool.counts(),
        members: pool.members(),
    }
}

fn clamp_mb(mb: u64) -> i64 {
    i64::try_from(mb).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use nodepool_core::CapacitySnapshot;

    fn report(lb: &str, group: &str, mb: u64) -> CapacitySnapshotList {
        CapacitySnapshotList::new(lb, vec![CapacitySnapshot::new(group, mb)])
    }

    async fn wanted(cm: &CapacityManager, group: &str) -> i64 {
        cm.demand(group).await.map(|d| d.total_wanted).unwrap_or_default()
    }

    #[tokio::test]
    async fn two_routers_then_scale_to_zero_then_purge() {
        let cm = CapacityManager::new();
        let t0 = Instant::now();

        cm.merge_at(&report("lb-a", "g1", 128), t0).await;
        cm.merge_at(&report("lb-b", "g1", 256), t0 + Duration::from_secs(1)).await;
        assert_eq!(wanted(&cm, "g1").await, 384);

        cm.merge_at(&report("lb-a", "g1", 0), t0 + Duration::from_secs(2)).await;
        assert_eq!(wanted(&cm, "g1").await, 256);

        // B keeps reporting, A goes quiet.
        cm.merge_at(&report("lb-b", "g1", 256), t0 + Duration::from_secs(10)).await;

        let mut purged = Vec::new();
        let n = cm
            .purge(t0 + Duration::from_secs(8), |group, lb| {
                purged.push((group.to_string(), lb.to_string()))
            })
            .await;
        assert_eq!(n, 1);
        assert_eq!(purged, vec![("g1".to_string(), "lb-a".to_string())]);

        let demand = cm.demand("g1").await.unwrap();
        assert_eq!(demand.total_wanted, 256);
        assert_eq!(demand.reporters, 1);
    }

    #[tokio::test]
    async fn one_list_updates_many_groups() {
        let cm = CapacityManager::new();
        let list = CapacitySnapshotList::new(
            "lb-a",
            vec![CapacitySnapshot::new("g1", 100), CapacitySnapshot::new("g2", 200)],
        );
        cm.merge(&list).await;
        cm.merge(&list).await;

        assert_eq!(wanted(&cm, "g1").await, 100);
        assert_eq!(wanted(&cm, "g2").await, 200);
        assert_eq!(cm.groups().await, vec!["g1", "g2"]);
    }

    #[tokio::test]
    async fn empty_list_is_a_noop() {
        let cm = CapacityManager::new();
        cm.merge(&CapacitySnapshotList::new("lb-a", vec![])).await;
        assert!(cm.groups().await.is_empty());
    }

    #[tokio::test]
    async fn in_use_is_aggregated_alongside_total() {
        let cm = CapacityManager::new();
        let mut snap = CapacitySnapshot::new("g1", 512);
        snap.mem_mb_in_use = 128;
        cm.merge(&CapacitySnapshotList::new("lb-a", vec![snap])).await;

        let demand = cm.demand("g1").await.unwrap();
        assert_eq!(demand, DemandView { total_wanted: 512, in_use: 128, reporters: 1 });
    }

    #[tokio::test]
    async fn unknown_group_has_empty_membership() {
        let cm = CapacityManager::new();
        assert!(cm.lb_group_members("never-seen").await.is_empty());
        assert!(cm.demand("also-never-seen").await.is_none());
    }

    #[tokio::test]
    async fn membership_lookups_do_not_create_groups() {
        let cm = CapacityManager::new();
        for i in 0..1000 {
            assert!(cm.lb_group_members(&format!("never-{i}")).await.is_empty());
        }
        assert!(cm.groups().await.is_empty());
        assert!(cm.lb_group("never-0").await.is_none());

        // Nothing changed, so no rescale is pending.
        let woke = tokio::time::timeout(Duration::from_millis(50), cm.changed()).await;
        assert!(woke.is_err());
    }

    #[tokio::test]
    async fn lb_group_returns_the_same_handle() {
        let cm = CapacityManager::new();
        cm.merge(&report("lb-a", "g1", 1)).await;
        let a = cm.lb_group("g1").await.unwrap();
        let b = cm.lb_group("g1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.id(), "g1");
    }

    #[tokio::test]
    async fn huge_reports_from_two_routers_keep_the_sum() {
        let cm = CapacityManager::new();
        cm.merge(&report("lb-a", "g1", u64::MAX)).await;
        cm.merge(&report("lb-b", "g1", 1)).await;

        let demand = cm.demand("g1").await.unwrap();
        assert_eq!(demand.total_wanted, i64::MAX);
        assert_eq!(demand.reporters, 2);

        cm.merge(&report("lb-a", "g1", 0)).await;
        assert_eq!(wanted(&cm, "g1").await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_merges_keep_the_sum() {
        let cm = Arc::new(CapacityManager::new());
        let mut tasks = Vec::new();
        for i in 0..32u64 {
            let cm = Arc::clone(&cm);
            tasks.push(tokio::spawn(async move {
                let lb = format!("lb-{i}");
                for mb in 1..=10 {
                    cm.merge(&report(&lb, "g1", mb * 10)).await;
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        // Every router's last report was 100.
        assert_eq!(wanted(&cm, "g1").await, 32 * 100);
    }

    #[tokio::test]
    async fn merge_wakes_change_listeners() {
        let cm = Arc::new(CapacityManager::new());
        cm.merge(&report("lb-a", "g1", 1)).await;
        // The stored permit completes this immediately.
        tokio::time::timeout(Duration::from_secs(1), cm.changed())
            .await
            .expect("change notification");
    }

    #[tokio::test]
    async fn summaries_are_sorted() {
        let cm = CapacityManager::new();
        cm.merge(&report("lb-a", "zz", 1)).await;
        cm.merge(&report("lb-a", "aa", 2)).await;

        let summaries = cm.summaries().await;
        let ids: Vec<&str> = summaries.iter().map(|s| s.group_id.as_str()).collect();
        assert_eq!(ids, vec!["aa", "zz"]);
        assert_eq!(summaries[0].demand.total_wanted, 2);
        assert!(summaries[0].members.is_empty());
        assert!(cm.summary("aa").await.is_some());
        assert!(cm.summary("missing").await.is_none());
    }
}
