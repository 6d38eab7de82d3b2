//! Expiration manager
//!
//! Owns fragment lifetime. Each fragment moves `Live -> Expiring -> Purged`;
//! escalation may move it straight from `Live` to `Purged`. [`ExpirationManager::is_live`]
//! is the only liveness check in the crate: nothing else compares deadlines
//! against a clock.
//!
//! Deadlines sit in a lazily invalidated min-heap ([`DeadlineQueue`]), so the
//! next expiring fragment is found in O(log n) and tightening a deadline is a
//! push rather than a search.

pub mod queue;

pub use queue::DeadlineQueue;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, MonoTime};
use crate::config::ExpirationConfig;
use crate::error::{Error, Result};
use crate::placement::PlacementManager;
use crate::types::{DomainId, FragmentKey, SetId};

/// Delay before retrying a purge a domain did not acknowledge
const PURGE_RETRY: Duration = Duration::from_millis(10);

/// Sweeper wait when nothing is scheduled
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Below this remaining time the sweeper yields instead of sleeping, since
/// the timer wheel only has millisecond resolution
const TIMER_SLACK: Duration = Duration::from_millis(1);

/// Authorization to overwrite a fragment's backing bytes.
///
/// Only this module can construct one, so every purge of a placed fragment
/// and every retry of a stale hop copy is initiated by the expiration
/// manager. Deletes outside the ticket path are limited to a hop removing
/// the source it just copied, placement rolling back a failed set, and
/// canary decoys, none of which hold a live fragment.
pub struct PurgeTicket {
    _private: (),
}

impl PurgeTicket {
    fn issue() -> Self {
        PurgeTicket { _private: () }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::issue()
    }
}

/// Lifecycle state of a fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentState {
    Live,
    /// Deadline reached, purge in progress
    Expiring,
    Purged,
}

#[derive(Debug, Clone, Copy)]
struct Lifecycle {
    valid_until: MonoTime,
    state: FragmentState,
}

#[derive(Debug)]
struct SetLifetime {
    deadline: MonoTime,
    indices: Vec<u8>,
    /// Fragments not yet purged
    outstanding: usize,
}

/// Whether a set can still be reconstructed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetLiveness {
    Active,
    Expired,
    Unknown,
}

/// Outcome of a sweep or an early purge
#[derive(Debug, Default)]
pub struct PurgeReport {
    /// Fragments whose bytes were overwritten
    pub purged: Vec<FragmentKey>,
    /// Sets whose last fragment was purged
    pub expired_sets: Vec<SetId>,
    /// Purges a domain did not acknowledge; retried later
    pub unconfirmed: Vec<(FragmentKey, DomainId)>,
    /// Stale hop copies whose deletion was finally confirmed
    pub orphans_purged: Vec<FragmentKey>,
    /// Purges that completed after the grace period
    pub late: usize,
    /// Largest observed delay between deadline and completed purge
    pub max_latency: Duration,
}

impl PurgeReport {
    pub fn is_empty(&self) -> bool {
        self.purged.is_empty()
            && self.expired_sets.is_empty()
            && self.unconfirmed.is_empty()
            && self.orphans_purged.is_empty()
    }

    fn merge(&mut self, other: PurgeReport) {
        self.purged.extend(other.purged);
        self.expired_sets.extend(other.expired_sets);
        self.unconfirmed.extend(other.unconfirmed);
        self.orphans_purged.extend(other.orphans_purged);
        self.late += other.late;
        self.max_latency = self.max_latency.max(other.max_latency);
    }
}

/// Fragment lifetime authority
pub struct ExpirationManager {
    clock: Arc<dyn Clock>,
    placement: Arc<PlacementManager>,
    config: ExpirationConfig,
    fragments: DashMap<FragmentKey, Lifecycle>,
    sets: DashMap<SetId, SetLifetime>,
    /// Purged sets and the time they finished
    tombstones: DashMap<SetId, MonoTime>,
    queue: Mutex<DeadlineQueue<FragmentKey>>,
    wake: Notify,
}

impl ExpirationManager {
    pub fn new(
        clock: Arc<dyn Clock>,
        placement: Arc<PlacementManager>,
        config: ExpirationConfig,
    ) -> Self {
        ExpirationManager {
            clock,
            placement,
            config,
            fragments: DashMap::new(),
            sets: DashMap::new(),
            tombstones: DashMap::new(),
            queue: Mutex::new(DeadlineQueue::new()),
            wake: Notify::new(),
        }
    }

    fn grace_period(&self) -> Duration {
        Duration::from_micros(self.config.grace_period_us)
    }

    /// Start tracking a set whose fragments all expire at `deadline`
    pub fn register_set(&self, set_id: SetId, total: usize, deadline: MonoTime) {
        let deadlines = (0..total).map(|i| (i as u8, deadline)).collect();
        self.register_set_with(set_id, deadline, deadlines);
    }

    /// Start tracking a set with per-fragment deadlines (used on resume).
    /// Deadlines later than `deadline` are clamped to it.
    pub fn register_set_with(&self, set_id: SetId, deadline: MonoTime, fragments: Vec<(u8, MonoTime)>) {
        let total = fragments.len();
        self.sets.insert(
            set_id,
            SetLifetime {
                deadline,
                indices: fragments.iter().map(|(i, _)| *i).collect(),
                outstanding: total,
            },
        );

        {
            let mut queue = self.queue.lock();
            for (index, valid_until) in fragments {
                let key = FragmentKey::new(set_id, index);
                let valid_until = valid_until.min(deadline);
                self.fragments.insert(
                    key,
                    Lifecycle {
                        valid_until,
                        state: FragmentState::Live,
                    },
                );
                queue.schedule(key, valid_until);
            }
        }

        if total == 0 {
            self.finalize_set(set_id);
            return;
        }

        debug!("Registered set {} ({} fragments) until {:?}", set_id, total, deadline);
        self.wake.notify_one();
    }

    /// Whether `key` may be read at `at`. Single source of truth for liveness.
    pub fn is_live(&self, key: FragmentKey, at: MonoTime) -> bool {
        self.fragments
            .get(&key)
            .map(|lc| lc.state == FragmentState::Live && at < lc.valid_until)
            .unwrap_or(false)
    }

    pub fn state(&self, key: FragmentKey) -> Option<FragmentState> {
        self.fragments.get(&key).map(|lc| lc.state)
    }

    pub fn valid_until(&self, key: FragmentKey) -> Option<MonoTime> {
        self.fragments.get(&key).map(|lc| lc.valid_until)
    }

    /// Current deadline of a tracked set
    pub fn set_deadline(&self, set_id: SetId) -> Option<MonoTime> {
        self.sets.get(&set_id).map(|s| s.deadline)
    }

    fn keys(&self, set_id: SetId) -> Vec<FragmentKey> {
        self.sets
            .get(&set_id)
            .map(|s| s.indices.iter().map(|i| FragmentKey::new(set_id, *i)).collect())
            .unwrap_or_default()
    }

    pub fn set_liveness(&self, set_id: SetId, at: MonoTime) -> SetLiveness {
        if let Some(set) = self.sets.get(&set_id) {
            if at >= set.deadline {
                SetLiveness::Expired
            } else {
                SetLiveness::Active
            }
        } else if self.tombstones.contains_key(&set_id) {
            SetLiveness::Expired
        } else {
            SetLiveness::Unknown
        }
    }

    /// Fragments of a set that are live at `at`
    pub fn live_fragments(&self, set_id: SetId, at: MonoTime) -> Vec<FragmentKey> {
        self.keys(set_id)
            .into_iter()
            .filter(|key| self.is_live(*key, at))
            .collect()
    }

    /// Per-fragment deadlines of a set's unpurged fragments
    pub fn fragment_deadlines(&self, set_id: SetId) -> Vec<(u8, MonoTime)> {
        self.keys(set_id)
            .into_iter()
            .filter_map(|key| {
                self.fragments
                    .get(&key)
                    .filter(|lc| lc.state != FragmentState::Purged)
                    .map(|lc| (key.index, lc.valid_until))
            })
            .collect()
    }

    /// Lower a fragment's deadline. Never lengthens.
    ///
    /// Returns the effective deadline, or `None` if the fragment is not live.
    pub fn tighten(&self, key: FragmentKey, new_valid_until: MonoTime) -> Option<MonoTime> {
        let effective = {
            let mut lc = self.fragments.get_mut(&key)?;
            if lc.state != FragmentState::Live {
                return None;
            }
            if new_valid_until >= lc.valid_until {
                return Some(lc.valid_until);
            }
            lc.valid_until = new_valid_until;
            new_valid_until
        };

        self.queue.lock().schedule(key, effective);
        self.wake.notify_one();
        debug!("Tightened {} to {:?}", key, effective);
        Some(effective)
    }

    /// Shrink the remaining lifetime of every live fragment in a set by `factor`.
    ///
    /// Each live fragment moves to `now + remaining * factor`, which is
    /// strictly earlier whenever any time remains. The set deadline follows
    /// the latest remaining fragment deadline.
    pub fn tighten_set(&self, set_id: SetId, now: MonoTime, factor: f64) -> Vec<(FragmentKey, MonoTime)> {
        let factor = factor.clamp(0.0, 1.0);
        let mut changed = Vec::new();
        for key in self.keys(set_id) {
            let Some(current) = self.valid_until(key) else {
                continue;
            };
            if !self.is_live(key, now) {
                continue;
            }
            let remaining = current.0.saturating_sub(now.0);
            let target = MonoTime(now.0 + (remaining as f64 * factor) as u64);
            if let Some(effective) = self.tighten(key, target) {
                changed.push((key, effective));
            }
        }

        let latest = self
            .fragment_deadlines(set_id)
            .into_iter()
            .map(|(_, t)| t)
            .max();
        if let (Some(latest), Some(mut set)) = (latest, self.sets.get_mut(&set_id)) {
            if latest < set.deadline {
                set.deadline = latest;
            }
        }

        changed
    }

    /// Earliest scheduled deadline
    pub fn next_deadline(&self) -> Option<MonoTime> {
        self.queue.lock().peek()
    }

    /// Move a fragment to `Expiring` if it is live. Returns whether a purge is needed.
    fn begin_purge(&self, key: FragmentKey) -> bool {
        match self.fragments.get_mut(&key) {
            Some(mut lc) => match lc.state {
                FragmentState::Live => {
                    lc.state = FragmentState::Expiring;
                    true
                }
                FragmentState::Expiring => true,
                FragmentState::Purged => false,
            },
            None => false,
        }
    }

    /// Mark a fragment purged and finalize its set if it was the last one
    fn finish_purge(&self, key: FragmentKey, report: &mut PurgeReport) {
        let newly_purged = match self.fragments.get_mut(&key) {
            Some(mut lc) if lc.state != FragmentState::Purged => {
                lc.state = FragmentState::Purged;
                true
            }
            _ => false,
        };
        if !newly_purged {
            return;
        }
        self.queue.lock().remove(&key);
        report.purged.push(key);

        let set_done = match self.sets.get_mut(&key.set_id) {
            Some(mut set) => {
                set.outstanding = set.outstanding.saturating_sub(1);
                set.outstanding == 0
            }
            None => false,
        };
        if set_done {
            self.finalize_set(key.set_id);
            report.expired_sets.push(key.set_id);
        }
    }

    fn finalize_set(&self, set_id: SetId) {
        if let Some((_, set)) = self.sets.remove(&set_id) {
            for index in set.indices {
                self.fragments.remove(&FragmentKey::new(set_id, index));
            }
        }
        self.placement.forget_set(set_id);
        self.tombstones.insert(set_id, self.clock.now());
        info!("Fragment set {} purged", set_id);
    }

    async fn purge_one(&self, key: FragmentKey, due: MonoTime, report: &mut PurgeReport) {
        let ticket = PurgeTicket::issue();
        match self.placement.purge(key, &ticket).await {
            Ok(_) => {
                let latency = self.clock.now().saturating_since(due);
                report.max_latency = report.max_latency.max(latency);
                if latency > self.grace_period() {
                    report.late += 1;
                    warn!(
                        "Purge of {} completed {:?} after its deadline (grace {:?})",
                        key,
                        latency,
                        self.grace_period()
                    );
                }
                self.finish_purge(key, report);
            }
            Err(Error::PurgeUnconfirmed { key, domain, reason }) => {
                error!("Purge of {} on {} unconfirmed: {}", key, domain, reason);
                report.unconfirmed.push((key, domain));
                self.queue.lock().schedule(key, self.clock.now() + PURGE_RETRY);
            }
            Err(e) => {
                error!("Purge of {} failed: {}", key, e);
                self.queue.lock().schedule(key, self.clock.now() + PURGE_RETRY);
            }
        }
    }

    /// Retry deleting source copies that hops could not remove
    pub async fn purge_orphans(&self) -> Vec<FragmentKey> {
        if !self.placement.has_orphans() {
            return Vec::new();
        }
        let ticket = PurgeTicket::issue();
        self.placement.purge_orphans(&ticket).await
    }

    /// Purge every fragment whose deadline is at or before `now`, and retry
    /// stale hop copies
    pub async fn sweep(&self, now: MonoTime) -> PurgeReport {
        let mut due = Vec::new();
        {
            let mut queue = self.queue.lock();
            while let Some((key, at)) = queue.pop_due(now) {
                due.push((key, at));
            }
            if queue.heap_len() > 4 * queue.len().max(64) {
                queue.compact();
            }
        }

        let due: Vec<(FragmentKey, MonoTime)> = due
            .into_iter()
            .filter(|(key, _)| self.begin_purge(*key))
            .collect();

        let reports = join_all(due.into_iter().map(|(key, at)| async move {
            let mut report = PurgeReport::default();
            self.purge_one(key, at, &mut report).await;
            report
        }))
        .await;

        let mut report = PurgeReport::default();
        for r in reports {
            report.merge(r);
        }
        report.orphans_purged = self.purge_orphans().await;

        self.prune_tombstones(now);

        if !report.purged.is_empty() {
            debug!(
                "Sweep purged {} fragments, {} sets expired, max latency {:?}",
                report.purged.len(),
                report.expired_sets.len(),
                report.max_latency
            );
        }
        report
    }

    fn prune_tombstones(&self, now: MonoTime) {
        let retention = Duration::from_millis(self.config.tombstone_retention_ms);
        self.tombstones
            .retain(|_, purged_at| now.saturating_since(*purged_at) <= retention);
    }

    /// Purge a fragment immediately, ahead of its deadline
    pub async fn purge_now(&self, key: FragmentKey) -> Result<PurgeReport> {
        let mut report = PurgeReport::default();
        if !self.begin_purge(key) {
            return Ok(report);
        }
        let now = self.clock.now();
        self.purge_one(key, now, &mut report).await;
        match report.unconfirmed.first() {
            Some((key, domain)) => Err(Error::PurgeUnconfirmed {
                key: *key,
                domain: *domain,
                reason: "delete not acknowledged".to_string(),
            }),
            None => Ok(report),
        }
    }

    /// Purge every fragment of a set immediately
    pub async fn purge_set(&self, set_id: SetId) -> PurgeReport {
        let keys = self.keys(set_id);
        if keys.is_empty() {
            return PurgeReport::default();
        }
        warn!("Purging set {} ahead of its deadline", set_id);

        let now = self.clock.now();
        let keys: Vec<FragmentKey> = keys
            .into_iter()
            .filter(|key| self.begin_purge(*key))
            .collect();

        let reports = join_all(keys.into_iter().map(|key| async move {
            let mut report = PurgeReport::default();
            self.purge_one(key, now, &mut report).await;
            report
        }))
        .await;

        let mut report = PurgeReport::default();
        for r in reports {
            report.merge(r);
        }
        // Early purges are never late
        report.late = 0;
        report
    }

    /// Run the sweeper until cancelled, forwarding non-empty reports
    pub async fn run_sweeper(
        self: Arc<Self>,
        reports: mpsc::UnboundedSender<PurgeReport>,
        cancel: CancellationToken,
    ) {
        info!("Expiration sweeper started");
        let mut orphan_retry: Option<MonoTime> = None;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let now = self.clock.now();
            if self.placement.has_orphans() {
                orphan_retry.get_or_insert(now + PURGE_RETRY);
            } else {
                orphan_retry = None;
            }
            let next = match (self.next_deadline(), orphan_retry) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let wait = next.map(|t| t.saturating_since(now)).unwrap_or(IDLE_WAIT);

            if wait > TIMER_SLACK {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.wake.notified() => continue,
                    _ = self.placement.orphaned() => continue,
                    _ = tokio::time::sleep(wait - TIMER_SLACK) => continue,
                }
            } else if !wait.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }

            let report = self.sweep(self.clock.now()).await;
            orphan_retry = None;
            if !report.is_empty() && reports.send(report).is_err() {
                debug!("Purge report receiver closed");
            }
        }
        info!("Expiration sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::codec::ShareCodec;
    use crate::config::PlacementConfig;
    use crate::domain::{DomainRef, HealthTracker, MemoryDomain};

    struct Fixture {
        clock: Arc<ManualClock>,
        memory: Vec<Arc<MemoryDomain>>,
        placement: Arc<PlacementManager>,
        expiration: ExpirationManager,
    }

    fn fixture(domains: u16) -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let memory = MemoryDomain::pool(domains);
        let refs: Vec<DomainRef> = memory.iter().map(|d| d.clone() as DomainRef).collect();
        let ids: Vec<DomainId> = (0..domains).map(DomainId).collect();
        let placement = Arc::new(
            PlacementManager::new(refs, Arc::new(HealthTracker::new(&ids)), PlacementConfig::default())
                .unwrap(),
        );
        let expiration = ExpirationManager::new(clock.clone(), placement.clone(), ExpirationConfig::default());
        Fixture {
            clock,
            memory,
            placement,
            expiration,
        }
    }

    async fn create(f: &Fixture, k: usize, n: usize, lifetime_ms: u64) -> SetId {
        let set_id = SetId::new();
        let encoded = ShareCodec::new(k, n).unwrap().encode(b"expiring").unwrap();
        f.placement.place(set_id, k, &encoded.shares).await.unwrap();
        f.expiration
            .register_set(set_id, n, f.clock.now() + Duration::from_millis(lifetime_ms));
        set_id
    }

    fn blobs(f: &Fixture) -> usize {
        f.memory.iter().map(|d| d.blob_count()).sum()
    }

    #[tokio::test]
    async fn test_live_until_deadline() {
        let f = fixture(3);
        let set_id = create(&f, 2, 3, 100).await;
        let key = FragmentKey::new(set_id, 0);

        assert!(f.expiration.is_live(key, MonoTime::from_millis(99)));
        assert!(!f.expiration.is_live(key, MonoTime::from_millis(100)));
        assert_eq!(f.expiration.set_liveness(set_id, MonoTime::from_millis(50)), SetLiveness::Active);
        assert_eq!(f.expiration.set_liveness(set_id, MonoTime::from_millis(100)), SetLiveness::Expired);
    }

    #[tokio::test]
    async fn test_sweep_purges_due_fragments() {
        let f = fixture(3);
        let set_id = create(&f, 2, 3, 100).await;
        assert_eq!(blobs(&f), 3);

        let early = f.expiration.sweep(MonoTime::from_millis(50)).await;
        assert!(early.is_empty());

        f.clock.advance(Duration::from_millis(100));
        let report = f.expiration.sweep(f.clock.now()).await;
        assert_eq!(report.purged.len(), 3);
        assert_eq!(report.expired_sets, vec![set_id]);
        assert_eq!(report.late, 0);
        assert_eq!(blobs(&f), 0);

        // Tombstone keeps reporting the set as expired
        assert_eq!(f.expiration.set_liveness(set_id, f.clock.now()), SetLiveness::Expired);
        assert!(f.placement.locate(set_id).await.is_err());
    }

    #[tokio::test]
    async fn test_late_sweep_is_reported() {
        let f = fixture(3);
        create(&f, 2, 3, 10).await;
        f.clock.advance(Duration::from_millis(50));
        let report = f.expiration.sweep(f.clock.now()).await;
        assert_eq!(report.late, 3);
        assert!(report.max_latency >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_tighten_never_lengthens() {
        let f = fixture(3);
        let set_id = create(&f, 2, 3, 100).await;
        let key = FragmentKey::new(set_id, 1);

        assert_eq!(
            f.expiration.tighten(key, MonoTime::from_millis(200)),
            Some(MonoTime::from_millis(100))
        );
        assert_eq!(
            f.expiration.tighten(key, MonoTime::from_millis(30)),
            Some(MonoTime::from_millis(30))
        );
        assert_eq!(f.expiration.valid_until(key), Some(MonoTime::from_millis(30)));
        assert_eq!(f.expiration.next_deadline(), Some(MonoTime::from_millis(30)));

        let report = f.expiration.sweep(MonoTime::from_millis(30)).await;
        assert_eq!(report.purged, vec![key]);
    }

    #[tokio::test]
    async fn test_tighten_set_scales_remaining() {
        let f = fixture(3);
        let set_id = create(&f, 2, 3, 100).await;
        f.clock.advance(Duration::from_millis(20));

        let changed = f.expiration.tighten_set(set_id, f.clock.now(), 0.5);
        assert_eq!(changed.len(), 3);
        for (_, t) in &changed {
            assert_eq!(*t, MonoTime::from_millis(60));
        }
        assert_eq!(f.expiration.set_deadline(set_id), Some(MonoTime::from_millis(60)));
    }

    #[tokio::test]
    async fn test_purge_now_skips_schedule() {
        let f = fixture(3);
        let set_id = create(&f, 2, 3, 100).await;
        let key = FragmentKey::new(set_id, 2);

        let report = f.expiration.purge_now(key).await.unwrap();
        assert_eq!(report.purged, vec![key]);
        assert!(!f.expiration.is_live(key, MonoTime::ZERO));
        assert_eq!(f.expiration.state(key), Some(FragmentState::Purged));
        assert_eq!(blobs(&f), 2);
        assert_eq!(f.expiration.live_fragments(set_id, MonoTime::ZERO).len(), 2);
    }

    #[tokio::test]
    async fn test_unconfirmed_purge_is_retried() {
        let f = fixture(3);
        let set_id = create(&f, 2, 3, 10).await;
        for d in &f.memory {
            d.set_fail_deletes(true);
        }

        f.clock.advance(Duration::from_millis(10));
        let report = f.expiration.sweep(f.clock.now()).await;
        assert_eq!(report.unconfirmed.len(), 3);
        assert!(report.purged.is_empty());
        // Not readable even though the bytes remain
        assert!(f.expiration.live_fragments(set_id, f.clock.now()).is_empty());

        for d in &f.memory {
            d.set_fail_deletes(false);
        }
        f.clock.advance(PURGE_RETRY);
        let retry = f.expiration.sweep(f.clock.now()).await;
        assert_eq!(retry.purged.len(), 3);
        assert_eq!(retry.expired_sets, vec![set_id]);
        assert_eq!(blobs(&f), 0);
    }

    #[tokio::test]
    async fn test_sweep_retries_stale_hop_copy() {
        let f = fixture(4);
        let set_id = create(&f, 2, 3, 1_000).await;
        let key = FragmentKey::new(set_id, 0);
        let source = f.placement.locate_fragment(key).await.unwrap();
        let source_domain = &f.memory[source.domain.0 as usize];

        source_domain.set_fail_deletes(true);
        assert!(matches!(
            f.placement.rehome(key, &[]).await,
            Err(Error::PurgeUnconfirmed { .. })
        ));
        let report = f.expiration.sweep(f.clock.now()).await;
        assert!(report.orphans_purged.is_empty());
        assert!(source_domain.holds(source.blob));

        source_domain.set_fail_deletes(false);
        f.clock.advance(PURGE_RETRY);
        let report = f.expiration.sweep(f.clock.now()).await;
        assert_eq!(report.orphans_purged, vec![key]);
        assert!(!source_domain.holds(source.blob));
        // The fragment itself is untouched and still live at its new home
        assert!(f.expiration.is_live(key, f.clock.now()));
        assert_eq!(blobs(&f), 3);
    }

    #[tokio::test]
    async fn test_sweeper_purges_stale_copy_without_deadline() {
        let clock: Arc<dyn Clock> = Arc::new(crate::clock::SystemClock::new());
        let memory = MemoryDomain::pool(4);
        let refs: Vec<DomainRef> = memory.iter().map(|d| d.clone() as DomainRef).collect();
        let ids: Vec<DomainId> = (0..4).map(DomainId).collect();
        let placement = Arc::new(
            PlacementManager::new(refs, Arc::new(HealthTracker::new(&ids)), PlacementConfig::default())
                .unwrap(),
        );
        let expiration = Arc::new(ExpirationManager::new(
            clock.clone(),
            placement.clone(),
            ExpirationConfig::default(),
        ));
        let set_id = SetId::new();
        let encoded = ShareCodec::new(2, 3).unwrap().encode(b"hop").unwrap();
        placement.place(set_id, 2, &encoded.shares).await.unwrap();
        expiration.register_set(set_id, 3, clock.now() + Duration::from_secs(60));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let sweeper = tokio::spawn(expiration.clone().run_sweeper(tx, cancel.clone()));

        let key = FragmentKey::new(set_id, 1);
        let source = placement.locate_fragment(key).await.unwrap();
        let source_domain = &memory[source.domain.0 as usize];
        source_domain.set_fail_deletes(true);
        assert!(placement.rehome(key, &[]).await.is_err());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(source_domain.holds(source.blob));

        source_domain.set_fail_deletes(false);
        let report = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.orphans_purged, vec![key]);
        assert!(!source_domain.holds(source.blob));

        cancel.cancel();
        sweeper.await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_set() {
        let f = fixture(4);
        let set_id = create(&f, 2, 4, 1_000).await;
        let report = f.expiration.purge_set(set_id).await;
        assert_eq!(report.purged.len(), 4);
        assert_eq!(report.expired_sets, vec![set_id]);
        assert_eq!(blobs(&f), 0);
    }

    #[tokio::test]
    async fn test_tombstones_are_pruned() {
        let f = fixture(3);
        let set_id = create(&f, 2, 3, 1).await;
        f.clock.advance(Duration::from_millis(1));
        f.expiration.sweep(f.clock.now()).await;
        assert_eq!(f.expiration.set_liveness(set_id, f.clock.now()), SetLiveness::Expired);

        let retention = Duration::from_millis(ExpirationConfig::default().tombstone_retention_ms);
        f.clock.advance(retention + Duration::from_millis(1));
        f.expiration.sweep(f.clock.now()).await;
        assert_eq!(f.expiration.set_liveness(set_id, f.clock.now()), SetLiveness::Unknown);
    }

    #[tokio::test]
    async fn test_register_with_clamps_to_set_deadline() {
        let f = fixture(3);
        let set_id = SetId::new();
        f.expiration.register_set_with(
            set_id,
            MonoTime::from_millis(50),
            vec![(0, MonoTime::from_millis(80)), (1, MonoTime::from_millis(20))],
        );
        assert_eq!(
            f.expiration.valid_until(FragmentKey::new(set_id, 0)),
            Some(MonoTime::from_millis(50))
        );
        assert_eq!(
            f.expiration.valid_until(FragmentKey::new(set_id, 1)),
            Some(MonoTime::from_millis(20))
        );
    }
}
