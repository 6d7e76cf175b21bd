//! Quota arithmetic, arbiter policies and local allocation state

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::persistence::ResourceRecord;

/// Renewal windows of a pool coordinator
///
/// - `lock`: after a renewal, further renewals are skipped until it elapses
/// - `internal`: the coordinator fails with an expiry error if it goes this
///   long without renewing
/// - `external`: expiry published in the store, one `lock` past `internal`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalWindows {
    pub lock: Duration,
    pub internal: Duration,
    pub external: Duration,
}

impl RenewalWindows {
    pub fn new(extra: Duration, rate: f64) -> Self {
        // Tolerance keeps float noise from rounding an exact product up
        let lock_ms = (extra.as_millis() as f64 * rate - 1e-6).ceil().max(0.0) as u64;
        let lock = Duration::from_millis(lock_ms);
        Self {
            lock,
            internal: lock + extra,
            external: lock + extra + lock,
        }
    }
}

/// How many resources a member should hold.
///
/// The arbiter rounds up and absorbs the remainder; everyone else rounds down.
pub fn expected_quota(total: u64, live_members: usize, is_arbiter: bool) -> u64 {
    if live_members == 0 {
        return 0;
    }
    let live = live_members as u64;
    if is_arbiter {
        total.div_ceil(live)
    } else {
        total / live
    }
}

/// Decides which live member absorbs the quota remainder
pub trait ArbiterPolicy: Send + Sync + 'static {
    fn is_arbiter(&self, pool_id: &str, live_members: &[String]) -> bool;
}

/// Nobody is arbiter; remainders stay unallocated
#[derive(Debug, Clone, Copy, Default)]
pub struct NoArbiter;

impl ArbiterPolicy for NoArbiter {
    fn is_arbiter(&self, _pool_id: &str, _live_members: &[String]) -> bool {
        false
    }
}

/// The lexicographically smallest live pool id is arbiter
#[derive(Debug, Clone, Copy, Default)]
pub struct LowestMemberArbiter;

impl ArbiterPolicy for LowestMemberArbiter {
    fn is_arbiter(&self, pool_id: &str, live_members: &[String]) -> bool {
        live_members.iter().min().is_some_and(|lowest| lowest == pool_id)
    }
}

/// Local view of an allocated resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalStatus {
    /// Available to `get`
    Free,
    /// Released with a block; available again once the instant passes
    BlockedUntil(Instant),
    /// Held by a live handle
    InUse,
}

impl LocalStatus {
    pub fn is_free_at(&self, now: Instant) -> bool {
        match self {
            Self::Free => true,
            Self::BlockedUntil(until) => *until <= now,
            Self::InUse => false,
        }
    }
}

/// A resource this coordinator owns in the store
#[derive(Debug, Clone)]
pub(crate) struct Allocation {
    pub record: ResourceRecord,
    pub status: LocalStatus,
}

/// Blocked allocations grouped by remaining block time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockedBuckets {
    pub within_1m: usize,
    pub within_5m: usize,
    pub within_15m: usize,
    pub over_15m: usize,
}

impl BlockedBuckets {
    fn record(&mut self, remaining: Duration) {
        let secs = remaining.as_secs_f64();
        if secs <= 60.0 {
            self.within_1m += 1;
        } else if secs <= 300.0 {
            self.within_5m += 1;
        } else if secs <= 900.0 {
            self.within_15m += 1;
        } else {
            self.over_15m += 1;
        }
    }

    pub fn total(&self) -> usize {
        self.within_1m + self.within_5m + self.within_15m + self.over_15m
    }
}

/// Local state of one resource, as reported by [`PoolStatus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Free,
    InUse,
    Blocked,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ResourceState::Free => "FREE",
            ResourceState::InUse => "IN USE",
            ResourceState::Blocked => "BLOCKED",
        };
        f.pad(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceStatus {
    pub id: Uuid,
    pub value: serde_json::Value,
    pub state: ResourceState,
}

/// Snapshot of a coordinator's local allocations
///
/// `Display` renders the one-line summary; [`PoolStatus::verbose`] adds a
/// line per resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub name: String,
    pub pool_id: String,
    pub total: usize,
    pub free: usize,
    pub in_use: usize,
    pub blocked: BlockedBuckets,
    pub resources: Vec<ResourceStatus>,
}

impl PoolStatus {
    pub(crate) fn collect(
        name: &str,
        pool_id: &str,
        allocations: &[Allocation],
        now: Instant,
    ) -> Self {
        let mut status = Self {
            name: name.to_string(),
            pool_id: pool_id.to_string(),
            total: allocations.len(),
            free: 0,
            in_use: 0,
            blocked: BlockedBuckets::default(),
            resources: Vec::with_capacity(allocations.len()),
        };

        for allocation in allocations {
            let state = match allocation.status {
                LocalStatus::InUse => {
                    status.in_use += 1;
                    ResourceState::InUse
                }
                LocalStatus::BlockedUntil(until) if until > now => {
                    status.blocked.record(until.saturating_duration_since(now));
                    ResourceState::Blocked
                }
                _ => {
                    status.free += 1;
                    ResourceState::Free
                }
            };
            status.resources.push(ResourceStatus {
                id: allocation.record.id,
                value: allocation.record.value.clone(),
                state,
            });
        }

        status
    }

    /// Multi-line report: the summary followed by every resource and its state
    pub fn verbose(&self) -> String {
        let mut report = format!(
            "-- [ resource pool {}/{} ] --\n  {self}\n",
            self.name, self.pool_id
        );
        for resource in &self.resources {
            report.push_str(&format!("  [{:<7}] {}\n", resource.state, resource.value));
        }
        report
    }
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}/{}] {} total, {} free, {} in use, {} blocked (1m: {}, 5m: {}, 15m: {}, over: {})",
            self.name,
            self.pool_id,
            self.total,
            self.free,
            self.in_use,
            self.blocked.total(),
            self.blocked.within_1m,
            self.blocked.within_5m,
            self.blocked.within_15m,
            self.blocked.over_15m
        )
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    fn allocation(status: LocalStatus) -> Allocation {
        Allocation {
            record: ResourceRecord {
                id: Uuid::now_v7(),
                value: json!("r"),
                owner_pool_id: Some("p1".to_string()),
            },
            status,
        }
    }

    #[test]
    fn test_windows() {
        let windows = RenewalWindows::new(Duration::from_secs(10), 0.25);
        assert_eq!(windows.lock, Duration::from_millis(2500));
        assert_eq!(windows.internal, Duration::from_millis(12500));
        assert_eq!(windows.external, Duration::from_millis(15000));
    }

    #[test]
    fn test_quota_sums_to_total_with_arbiter() {
        assert_eq!(expected_quota(5, 2, true), 3);
        assert_eq!(expected_quota(5, 2, false), 2);
        assert_eq!(expected_quota(6, 3, true), 2);
        assert_eq!(expected_quota(6, 3, false), 2);
        assert_eq!(expected_quota(1, 4, false), 0);
        assert_eq!(expected_quota(5, 0, true), 0);
    }

    #[test]
    fn test_lowest_member_arbiter() {
        let live = vec!["pool-b".to_string(), "pool-a".to_string()];
        assert!(LowestMemberArbiter.is_arbiter("pool-a", &live));
        assert!(!LowestMemberArbiter.is_arbiter("pool-b", &live));
        assert!(!LowestMemberArbiter.is_arbiter("pool-a", &[]));
        assert!(!NoArbiter.is_arbiter("pool-a", &live));
    }

    #[test]
    fn test_status_buckets() {
        let now = Instant::now();
        let allocations = vec![
            allocation(LocalStatus::Free),
            allocation(LocalStatus::InUse),
            allocation(LocalStatus::BlockedUntil(now + Duration::from_secs(30))),
            allocation(LocalStatus::BlockedUntil(now + Duration::from_secs(240))),
            allocation(LocalStatus::BlockedUntil(now + Duration::from_secs(3600))),
            allocation(LocalStatus::BlockedUntil(now)),
        ];

        let status = PoolStatus::collect("relays", "p1", &allocations, now);
        assert_eq!(status.total, 6);
        assert_eq!(status.free, 2);
        assert_eq!(status.in_use, 1);
        assert_eq!(status.blocked.within_1m, 1);
        assert_eq!(status.blocked.within_5m, 1);
        assert_eq!(status.blocked.within_15m, 0);
        assert_eq!(status.blocked.over_15m, 1);
        assert!(status.to_string().contains("6 total, 2 free, 1 in use, 3 blocked"));
        assert_eq!(status.resources.len(), 6);
        assert_eq!(status.resources[1].state, ResourceState::InUse);
        assert_eq!(status.resources[5].state, ResourceState::Free);
    }

    #[test]
    fn test_verbose_status_lists_resources() {
        let now = Instant::now();
        let mut blocked = allocation(LocalStatus::BlockedUntil(now + Duration::from_secs(90)));
        blocked.record.value = json!({"host": "smtp-2"});
        let allocations = vec![allocation(LocalStatus::Free), blocked];

        let report = PoolStatus::collect("relays", "p1", &allocations, now).verbose();
        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("relays/p1"));
        assert!(lines[1].contains("2 total, 1 free, 0 in use, 1 blocked"));
        assert_eq!(lines[2], "  [FREE   ] \"r\"");
        assert_eq!(lines[3], "  [BLOCKED] {\"host\":\"smtp-2\"}");
    }
}
