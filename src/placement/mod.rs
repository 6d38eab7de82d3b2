//! Placement manager
//!
//! Decides which storage domain holds each fragment, records the mapping and
//! moves fragments between domains ("hops"). It is the only component that
//! initiates a hop, and it never decides liveness: purges arrive with a
//! [`PurgeTicket`] issued by the expiration manager.
//!
//! Every fragment sits behind its own `tokio::sync::RwLock`. Fetches hold the
//! read side across the domain read, while hops and purges hold the write
//! side, so a fetch observes either the state before or after a hop, never a
//! mix of both.

pub mod strategy;

pub use strategy::AssignmentStrategy;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, error, info, warn};

use crate::codec::{share_checksum, Share};
use crate::config::PlacementConfig;
use crate::domain::{DomainRef, HealthTracker, INTERNAL_CONTEXT};
use crate::error::{Error, Result};
use crate::expiration::PurgeTicket;
use crate::types::{BlobId, DomainId, FragmentKey, SetId};

/// Snapshot of where a fragment lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentRef {
    pub key: FragmentKey,
    pub domain: DomainId,
    pub blob: BlobId,
    /// Incremented by every hop
    pub generation: u64,
    pub share_checksum: [u8; 32],
}

/// Share bytes read from a domain together with the state they were read at
#[derive(Debug)]
pub struct FetchedShare {
    pub share: Share,
    pub domain: DomainId,
    pub generation: u64,
}

/// Placement details needed to rebuild state after a restart
#[derive(Debug, Clone)]
pub struct AdoptedFragment {
    pub index: u8,
    pub domain: DomainId,
    pub blob: BlobId,
    pub generation: u64,
    pub share_checksum: [u8; 32],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Placed,
    /// A hop failed to write and the source was purged
    Lost,
    Purged,
}

#[derive(Debug, Clone, Copy)]
struct Location {
    domain: DomainId,
    blob: BlobId,
}

/// Source copy a hop could not delete
struct Orphan {
    key: FragmentKey,
    location: Location,
    set: Arc<SetPlacement>,
}

struct FragmentRecord {
    key: FragmentKey,
    location: Option<Location>,
    generation: u64,
    checksum: [u8; 32],
    state: SlotState,
}

impl FragmentRecord {
    fn to_ref(&self) -> Option<FragmentRef> {
        match (self.state, self.location) {
            (SlotState::Placed, Some(loc)) => Some(FragmentRef {
                key: self.key,
                domain: loc.domain,
                blob: loc.blob,
                generation: self.generation,
                share_checksum: self.checksum,
            }),
            _ => None,
        }
    }
}

struct SetPlacement {
    threshold: usize,
    fragments: Vec<Arc<RwLock<FragmentRecord>>>,
    /// Copies of this set's fragments per domain, including in-flight hop targets
    occupancy: Mutex<HashMap<DomainId, usize>>,
}

impl SetPlacement {
    fn fragment(&self, index: u8) -> Option<Arc<RwLock<FragmentRecord>>> {
        self.fragments.get(index as usize).map(Arc::clone)
    }

    fn release(&self, domain: DomainId) {
        let mut occupancy = self.occupancy.lock();
        if let Some(count) = occupancy.get_mut(&domain) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                occupancy.remove(&domain);
            }
        }
    }
}

/// Routes fragments to storage domains
pub struct PlacementManager {
    domains: BTreeMap<DomainId, DomainRef>,
    health: Arc<HealthTracker>,
    config: PlacementConfig,
    sets: DashMap<SetId, Arc<SetPlacement>>,
    next_offset: AtomicUsize,
    orphans: Mutex<Vec<Orphan>>,
    orphaned: Notify,
}

impl PlacementManager {
    /// Create a placement manager over the given domains
    pub fn new(
        domains: Vec<DomainRef>,
        health: Arc<HealthTracker>,
        config: PlacementConfig,
    ) -> Result<Self> {
        if domains.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one storage domain is required".to_string(),
            ));
        }

        let mut map = BTreeMap::new();
        for domain in domains {
            let id = domain.id();
            if map.insert(id, domain).is_some() {
                return Err(Error::InvalidConfig(format!("Duplicate domain id: {}", id)));
            }
        }

        info!(
            "Placement manager over {} domains ({:?})",
            map.len(),
            config.strategy
        );

        Ok(Self {
            domains: map,
            health,
            config,
            sets: DashMap::new(),
            next_offset: AtomicUsize::new(0),
            orphans: Mutex::new(Vec::new()),
            orphaned: Notify::new(),
        })
    }

    /// Get a domain by ID
    pub fn domain(&self, id: DomainId) -> Option<DomainRef> {
        self.domains.get(&id).map(Arc::clone)
    }

    /// All registered domain IDs, sorted
    pub fn domain_ids(&self) -> Vec<DomainId> {
        self.domains.keys().copied().collect()
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    fn usable_domains(&self) -> Vec<DomainId> {
        self.health
            .usable_domains()
            .into_iter()
            .filter(|d| self.domains.contains_key(d))
            .collect()
    }

    fn weight(&self, domain: DomainId) -> u32 {
        self.config.weight_of(domain.0)
    }

    fn set(&self, set_id: SetId) -> Result<Arc<SetPlacement>> {
        self.sets
            .get(&set_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or(Error::SetNotFound(set_id))
    }

    /// Place all shares of a new set. Either every share is written or none is.
    ///
    /// # Errors
    /// - `InvalidParameters` if the usable domains cannot hold N fragments
    ///   with at most K-1 per domain
    /// - `DomainUnavailable` if writes failed and no substitute domain worked
    pub async fn place(
        &self,
        set_id: SetId,
        threshold: usize,
        shares: &[Share],
    ) -> Result<Vec<FragmentRef>> {
        let usable = self.usable_domains();
        let offset = self.next_offset.fetch_add(1, Ordering::Relaxed);
        let assignment = strategy::assign(
            self.config.strategy,
            shares.len(),
            threshold,
            &usable,
            offset,
            |d| self.weight(d),
        )?;

        debug!(
            "Placing set {} ({} fragments, K={}) on {:?}",
            set_id,
            shares.len(),
            threshold,
            assignment
        );

        let writes: Vec<_> = shares
            .iter()
            .zip(assignment.iter())
            .map(|(share, &domain_id)| {
                let blob = BlobId::new();
                async move {
                    let result = self.write_to(domain_id, blob, &share.data).await;
                    (share.index, domain_id, blob, result)
                }
            })
            .collect();
        let results = join_all(writes).await;

        let mut occupancy: HashMap<DomainId, usize> = HashMap::new();
        let mut placed: BTreeMap<u8, Location> = BTreeMap::new();
        let mut failed: Vec<(u8, DomainId)> = Vec::new();
        for (index, domain, blob, result) in results {
            match result {
                Ok(()) => {
                    *occupancy.entry(domain).or_insert(0) += 1;
                    placed.insert(index, Location { domain, blob });
                }
                Err(e) => {
                    warn!("Write of {}#{} to {} failed: {}", set_id, index, domain, e);
                    failed.push((index, domain));
                }
            }
        }

        // Substitute failed writes onto other domains
        let mut bad_domains: Vec<DomainId> = failed.iter().map(|(_, d)| *d).collect();
        let mut last_error = None;
        for (index, _) in &failed {
            let share = &shares[*index as usize];
            let mut written = false;
            loop {
                let candidates: Vec<DomainId> = usable
                    .iter()
                    .copied()
                    .filter(|d| !bad_domains.contains(d))
                    .collect();
                let Some(target) =
                    strategy::pick_target(&candidates, &occupancy, threshold, |d| self.weight(d))
                else {
                    break;
                };
                let blob = BlobId::new();
                match self.write_to(target, blob, &share.data).await {
                    Ok(()) => {
                        *occupancy.entry(target).or_insert(0) += 1;
                        placed.insert(*index, Location { domain: target, blob });
                        written = true;
                        break;
                    }
                    Err(e) => {
                        bad_domains.push(target);
                        last_error = Some((target, e.to_string()));
                    }
                }
            }
            if !written {
                break;
            }
        }

        if placed.len() < shares.len() {
            error!(
                "Set {} could not be placed: {}/{} fragments written, rolling back",
                set_id,
                placed.len(),
                shares.len()
            );
            for location in placed.values() {
                if let Some(domain) = self.domain(location.domain) {
                    if let Err(e) = domain.delete(location.blob).await {
                        error!(
                            "Rollback delete on {} failed for set {}: {}",
                            location.domain, set_id, e
                        );
                    }
                }
            }
            let (domain, reason) = last_error
                .or_else(|| failed.first().map(|(_, d)| (*d, "write failed".to_string())))
                .unwrap_or((DomainId(0), "no domain accepted the write".to_string()));
            return Err(Error::DomainUnavailable(domain, reason));
        }

        let fragments: Vec<Arc<RwLock<FragmentRecord>>> = shares
            .iter()
            .map(|share| {
                let location = placed.get(&share.index).copied();
                Arc::new(RwLock::new(FragmentRecord {
                    key: FragmentKey::new(set_id, share.index),
                    location,
                    generation: 0,
                    checksum: share.checksum(),
                    state: SlotState::Placed,
                }))
            })
            .collect();

        let refs: Vec<FragmentRef> = shares
            .iter()
            .filter_map(|share| {
                placed.get(&share.index).map(|loc| FragmentRef {
                    key: FragmentKey::new(set_id, share.index),
                    domain: loc.domain,
                    blob: loc.blob,
                    generation: 0,
                    share_checksum: share.checksum(),
                })
            })
            .collect();

        self.sets.insert(
            set_id,
            Arc::new(SetPlacement {
                threshold,
                fragments,
                occupancy: Mutex::new(occupancy),
            }),
        );

        info!("Placed set {} across {} fragments", set_id, refs.len());
        Ok(refs)
    }

    async fn write_to(&self, domain_id: DomainId, blob: BlobId, bytes: &[u8]) -> Result<()> {
        let domain = self
            .domain(domain_id)
            .ok_or(Error::UnknownDomain(domain_id))?;
        match domain.put(blob, bytes).await {
            Ok(()) => {
                self.health.record_success(domain_id);
                Ok(())
            }
            Err(e) => {
                self.health.record_failure(domain_id, &e.to_string());
                Err(e)
            }
        }
    }

    /// Rebuild placement state for a set recovered from persisted metadata
    pub fn adopt(&self, set_id: SetId, threshold: usize, total: usize, fragments: Vec<AdoptedFragment>) {
        let mut occupancy: HashMap<DomainId, usize> = HashMap::new();
        let mut by_index: HashMap<u8, AdoptedFragment> = HashMap::new();
        for fragment in fragments {
            *occupancy.entry(fragment.domain).or_insert(0) += 1;
            by_index.insert(fragment.index, fragment);
        }

        let records = (0..total)
            .map(|i| {
                let index = i as u8;
                let key = FragmentKey::new(set_id, index);
                let record = match by_index.remove(&index) {
                    Some(f) => FragmentRecord {
                        key,
                        location: Some(Location {
                            domain: f.domain,
                            blob: f.blob,
                        }),
                        generation: f.generation,
                        checksum: f.share_checksum,
                        state: SlotState::Placed,
                    },
                    None => FragmentRecord {
                        key,
                        location: None,
                        generation: 0,
                        checksum: [0u8; 32],
                        state: SlotState::Lost,
                    },
                };
                Arc::new(RwLock::new(record))
            })
            .collect();

        self.sets.insert(
            set_id,
            Arc::new(SetPlacement {
                threshold,
                fragments: records,
                occupancy: Mutex::new(occupancy),
            }),
        );
    }

    /// All current fragment locations for a set
    pub async fn locate(&self, set_id: SetId) -> Result<Vec<FragmentRef>> {
        let set = self.set(set_id)?;
        let mut refs = Vec::with_capacity(set.fragments.len());
        for fragment in &set.fragments {
            if let Some(r) = fragment.read().await.to_ref() {
                refs.push(r);
            }
        }
        Ok(refs)
    }

    /// Current location of one fragment
    pub async fn locate_fragment(&self, key: FragmentKey) -> Result<FragmentRef> {
        let set = self.set(key.set_id)?;
        let fragment = set
            .fragment(key.index)
            .ok_or(Error::FragmentNotFound(key))?;
        let record = fragment.read().await;
        record.to_ref().ok_or(Error::FragmentNotFound(key))
    }

    /// Read a fragment's share from its domain.
    ///
    /// Holds the fragment's read lock across the domain read, so a concurrent
    /// hop or purge is ordered entirely before or after this fetch.
    ///
    /// # Errors
    /// - `FragmentNotFound` if the fragment moved (generation changed) or was purged
    /// - `DomainUnavailable` on backend failure
    /// - `CorruptShares` if the bytes do not match the recorded checksum
    pub async fn fetch(&self, fragment_ref: &FragmentRef) -> Result<FetchedShare> {
        let key = fragment_ref.key;
        let set = self.set(key.set_id)?;
        let fragment = set
            .fragment(key.index)
            .ok_or(Error::FragmentNotFound(key))?;

        let record = fragment.read().await;
        let current = record.to_ref().ok_or(Error::FragmentNotFound(key))?;
        if current.generation != fragment_ref.generation {
            return Err(Error::FragmentNotFound(key));
        }

        let domain = self
            .domain(current.domain)
            .ok_or(Error::UnknownDomain(current.domain))?;
        let bytes = match domain.get(current.blob, INTERNAL_CONTEXT).await {
            Ok(Some(bytes)) => {
                self.health.record_success(current.domain);
                bytes
            }
            Ok(None) => {
                self.health
                    .record_failure(current.domain, "fragment blob missing");
                return Err(Error::DomainUnavailable(
                    current.domain,
                    format!("blob for {} missing", key),
                ));
            }
            Err(e) => {
                self.health.record_failure(current.domain, &e.to_string());
                return Err(e);
            }
        };

        if share_checksum(&bytes) != record.checksum {
            return Err(Error::CorruptShares(format!(
                "checksum mismatch for {} on {}",
                key, current.domain
            )));
        }

        Ok(FetchedShare {
            share: Share::new(key.index, bytes),
            domain: current.domain,
            generation: current.generation,
        })
    }

    /// Move a fragment to another domain
    ///
    /// The destination write happens before the source purge, so a fragment
    /// is never without a live copy during a successful hop. The target is
    /// reserved in the set's occupancy before writing, so no domain reaches
    /// K copies even while both copies exist.
    ///
    /// # Errors
    /// - `DomainUnavailable` if no target is eligible or the source could
    ///   not be read; nothing changed
    /// - `HopFailed` if the destination write failed; the fragment stays at
    ///   its source and the caller decides whether to purge it
    /// - `PurgeUnconfirmed` if the fragment moved but the source copy could
    ///   not be deleted. The copy is kept as an orphan, still counted against
    ///   the source domain, until [`PlacementManager::purge_orphans`]
    ///   confirms its deletion.
    pub async fn rehome(&self, key: FragmentKey, avoid: &[DomainId]) -> Result<FragmentRef> {
        let set = self.set(key.set_id)?;
        let fragment = set
            .fragment(key.index)
            .ok_or(Error::FragmentNotFound(key))?;

        let mut record = fragment.write().await;
        let source = match (record.state, record.location) {
            (SlotState::Placed, Some(loc)) => loc,
            _ => return Err(Error::FragmentNotFound(key)),
        };

        let candidates: Vec<DomainId> = self
            .usable_domains()
            .into_iter()
            .filter(|d| *d != source.domain && !avoid.contains(d))
            .collect();

        let target = {
            let mut occupancy = set.occupancy.lock();
            let target =
                strategy::pick_target(&candidates, &occupancy, set.threshold, |d| self.weight(d))
                    .ok_or_else(|| {
                        Error::DomainUnavailable(
                            source.domain,
                            format!("no eligible hop target for {}", key),
                        )
                    })?;
            *occupancy.entry(target).or_insert(0) += 1;
            target
        };

        let source_domain = self
            .domain(source.domain)
            .ok_or(Error::UnknownDomain(source.domain))?;

        let bytes = match source_domain.get(source.blob, INTERNAL_CONTEXT).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                set.release(target);
                return Err(Error::DomainUnavailable(
                    source.domain,
                    format!("blob for {} missing", key),
                ));
            }
            Err(e) => {
                set.release(target);
                self.health.record_failure(source.domain, &e.to_string());
                return Err(e);
            }
        };

        let new_blob = BlobId::new();
        if let Err(e) = self.write_to(target, new_blob, &bytes).await {
            set.release(target);
            warn!("Hop of {} to {} failed: {}", key, target, e);
            return Err(Error::HopFailed {
                key,
                target,
                reason: e.to_string(),
            });
        }

        record.location = Some(Location {
            domain: target,
            blob: new_blob,
        });
        record.generation += 1;

        if let Err(e) = source_domain.delete(source.blob).await {
            error!(
                "Hop of {}: source purge on {} unconfirmed: {}",
                key, source.domain, e
            );
            self.orphans.lock().push(Orphan {
                key,
                location: source,
                set: Arc::clone(&set),
            });
            self.orphaned.notify_one();
            return Err(Error::PurgeUnconfirmed {
                key,
                domain: source.domain,
                reason: e.to_string(),
            });
        }
        set.release(source.domain);

        debug!(
            "Hopped {} from {} to {} (generation {})",
            key, source.domain, target, record.generation
        );

        record.to_ref().ok_or(Error::FragmentNotFound(key))
    }

    /// Whether any hop left a source copy behind
    pub fn has_orphans(&self) -> bool {
        !self.orphans.lock().is_empty()
    }

    /// Resolves once a hop leaves a source copy behind
    pub async fn orphaned(&self) {
        self.orphaned.notified().await
    }

    /// Retry deleting source copies left behind by hops. Returns the
    /// fragments whose stale copy is now confirmed gone; the rest stay queued.
    pub async fn purge_orphans(&self, _ticket: &PurgeTicket) -> Vec<FragmentKey> {
        let pending: Vec<Orphan> = std::mem::take(&mut *self.orphans.lock());
        if pending.is_empty() {
            return Vec::new();
        }

        let mut purged = Vec::new();
        let mut remaining = Vec::new();
        for orphan in pending {
            let deleted = match self.domain(orphan.location.domain) {
                Some(domain) => domain.delete(orphan.location.blob).await,
                None => Err(Error::UnknownDomain(orphan.location.domain)),
            };
            match deleted {
                Ok(_) => {
                    orphan.set.release(orphan.location.domain);
                    info!(
                        "Stale copy of {} on {} purged",
                        orphan.key, orphan.location.domain
                    );
                    purged.push(orphan.key);
                }
                Err(e) => {
                    debug!(
                        "Stale copy of {} on {} still not purged: {}",
                        orphan.key, orphan.location.domain, e
                    );
                    remaining.push(orphan);
                }
            }
        }
        self.orphans.lock().extend(remaining);
        purged
    }

    /// Check whether unavailable domains answer again. A domain that does is
    /// reset to healthy and becomes eligible for placement. Returns the
    /// recovered domains.
    pub async fn recheck_unavailable(&self) -> Vec<DomainId> {
        let mut recovered = Vec::new();
        for id in self.health.unavailable_domains() {
            let Some(domain) = self.domain(id) else {
                continue;
            };
            match domain.contains(BlobId::new(), INTERNAL_CONTEXT).await {
                Ok(_) => {
                    self.health.reset_failures(id);
                    info!("Domain {} is reachable again", id);
                    recovered.push(id);
                }
                Err(e) => debug!("Domain {} still unavailable: {}", id, e),
            }
        }
        recovered
    }

    /// Overwrite a fragment's backing bytes. Returns whether bytes were removed.
    ///
    /// # Errors
    /// `PurgeUnconfirmed` if the domain did not acknowledge the delete; the
    /// location is kept so the purge can be retried.
    pub async fn purge(&self, key: FragmentKey, _ticket: &PurgeTicket) -> Result<bool> {
        let set = match self.set(key.set_id) {
            Ok(set) => set,
            Err(_) => return Ok(false),
        };
        let Some(fragment) = set.fragment(key.index) else {
            return Ok(false);
        };

        let mut record = fragment.write().await;
        record.state = SlotState::Purged;
        let Some(location) = record.location else {
            return Ok(false);
        };

        let domain = self
            .domain(location.domain)
            .ok_or(Error::UnknownDomain(location.domain))?;
        match domain.delete(location.blob).await {
            Ok(existed) => {
                record.location = None;
                set.release(location.domain);
                Ok(existed)
            }
            Err(e) => Err(Error::PurgeUnconfirmed {
                key,
                domain: location.domain,
                reason: e.to_string(),
            }),
        }
    }

    /// Drop all placement state for a set once its fragments are purged
    pub fn forget_set(&self, set_id: SetId) {
        self.sets.remove(&set_id);
    }

    /// IDs of every set with placement state
    pub fn set_ids(&self) -> Vec<SetId> {
        self.sets.iter().map(|e| *e.key()).collect()
    }

    /// Copies of the set's fragments held per domain
    pub fn occupancy(&self, set_id: SetId) -> HashMap<DomainId, usize> {
        self.sets
            .get(&set_id)
            .map(|s| s.occupancy.lock().clone())
            .unwrap_or_default()
    }

    /// Sets with at least one fragment in any of `domains`
    pub fn sets_touching(&self, domains: &[DomainId]) -> Vec<SetId> {
        self.sets
            .iter()
            .filter(|entry| {
                let occupancy = entry.value().occupancy.lock();
                domains.iter().any(|d| occupancy.get(d).copied().unwrap_or(0) > 0)
            })
            .map(|entry| *entry.key())
            .collect()
    }

    /// Fragments currently held by any of `domains`
    pub async fn fragments_in(&self, domains: &[DomainId]) -> Vec<FragmentRef> {
        let mut out = Vec::new();
        for set_id in self.sets_touching(domains) {
            if let Ok(refs) = self.locate(set_id).await {
                out.extend(refs.into_iter().filter(|r| domains.contains(&r.domain)));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ShareCodec;
    use crate::domain::{MemoryDomain, StorageDomain};
    use crate::expiration::PurgeTicket;

    fn setup(count: u16) -> (Vec<Arc<MemoryDomain>>, PlacementManager) {
        let memory = MemoryDomain::pool(count);
        let domains: Vec<DomainRef> = memory.iter().map(|d| d.clone() as DomainRef).collect();
        let ids: Vec<DomainId> = domains.iter().map(|d| d.id()).collect();
        let health = Arc::new(HealthTracker::new(&ids));
        let manager = PlacementManager::new(domains, health, PlacementConfig::default()).unwrap();
        (memory, manager)
    }

    fn shares(k: usize, n: usize) -> Vec<Share> {
        ShareCodec::new(k, n)
            .unwrap()
            .encode(b"placement payload")
            .unwrap()
            .shares
    }

    fn max_copies(manager: &PlacementManager, set_id: SetId) -> usize {
        manager
            .occupancy(set_id)
            .values()
            .copied()
            .max()
            .unwrap_or(0)
    }

    #[test]
    fn test_duplicate_domain_rejected() {
        let a: DomainRef = Arc::new(MemoryDomain::new(DomainId(1)));
        let b: DomainRef = Arc::new(MemoryDomain::new(DomainId(1)));
        let health = Arc::new(HealthTracker::new(&[DomainId(1)]));
        assert!(PlacementManager::new(vec![a, b], health, PlacementConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_place_and_locate() {
        let (memory, manager) = setup(7);
        let set_id = SetId::new();
        let refs = manager.place(set_id, 4, &shares(4, 7)).await.unwrap();
        assert_eq!(refs.len(), 7);
        assert!(max_copies(&manager, set_id) < 4);

        let located = manager.locate(set_id).await.unwrap();
        assert_eq!(located, refs);
        let total: usize = memory.iter().map(|d| d.blob_count()).sum();
        assert_eq!(total, 7);
    }

    #[tokio::test]
    async fn test_place_rejects_when_domains_too_few() {
        let (_memory, manager) = setup(2);
        // K=2 allows one fragment per domain; 3 fragments need 3 domains
        let err = manager
            .place(SetId::new(), 2, &shares(2, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn test_place_substitutes_failed_domain() {
        let (memory, manager) = setup(5);
        memory[0].set_available(false);
        let set_id = SetId::new();
        let refs = manager.place(set_id, 3, &shares(3, 4)).await.unwrap();
        assert_eq!(refs.len(), 4);
        assert!(refs.iter().all(|r| r.domain != DomainId(0)));
        assert!(max_copies(&manager, set_id) < 3);
    }

    #[tokio::test]
    async fn test_place_rolls_back_when_impossible() {
        let (memory, manager) = setup(3);
        memory[1].set_available(false);
        memory[2].set_available(false);
        let err = manager
            .place(SetId::new(), 2, &shares(2, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DomainUnavailable(..)));
        assert_eq!(memory[0].blob_count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_verifies_checksum() {
        let (memory, manager) = setup(3);
        let set_id = SetId::new();
        let refs = manager.place(set_id, 2, &shares(2, 3)).await.unwrap();

        let fetched = manager.fetch(&refs[0]).await.unwrap();
        assert_eq!(fetched.share.index, 0);

        let target = &memory[refs[1].domain.0 as usize];
        assert!(target.corrupt(refs[1].blob));
        assert!(matches!(
            manager.fetch(&refs[1]).await,
            Err(Error::CorruptShares(_))
        ));
    }

    #[tokio::test]
    async fn test_rehome_moves_and_purges_source() {
        let (memory, manager) = setup(4);
        let set_id = SetId::new();
        let refs = manager.place(set_id, 2, &shares(2, 3)).await.unwrap();
        let before = refs[0].clone();

        let after = manager.rehome(before.key, &[]).await.unwrap();
        assert_ne!(after.domain, before.domain);
        assert_eq!(after.generation, 1);
        assert!(!memory[before.domain.0 as usize].holds(before.blob));
        assert!(memory[after.domain.0 as usize].holds(after.blob));
        assert!(max_copies(&manager, set_id) < 2);

        // Stale refs no longer fetch
        assert!(matches!(
            manager.fetch(&before).await,
            Err(Error::FragmentNotFound(_))
        ));
        assert!(manager.fetch(&after).await.is_ok());
    }

    #[tokio::test]
    async fn test_rehome_failed_write_keeps_source() {
        let (memory, manager) = setup(4);
        let set_id = SetId::new();
        let refs = manager.place(set_id, 2, &shares(2, 3)).await.unwrap();
        // Only the unused domain is a valid target; take it offline after health says usable
        let used: Vec<DomainId> = refs.iter().map(|r| r.domain).collect();
        let spare = (0..4u16).map(DomainId).find(|d| !used.contains(d)).unwrap();
        memory[spare.0 as usize].set_available(false);

        let source = refs[0].clone();
        let err = manager.rehome(source.key, &[]).await.unwrap_err();
        assert!(matches!(err, Error::HopFailed { target, .. } if target == spare));

        // Nothing moved and the reservation on the spare was released
        assert!(memory[source.domain.0 as usize].holds(source.blob));
        assert_eq!(manager.locate_fragment(source.key).await.unwrap(), source);
        assert_eq!(manager.occupancy(set_id).get(&spare), None);

        // The fragment can still be purged through the normal path
        let ticket = PurgeTicket::for_tests();
        assert!(manager.purge(source.key, &ticket).await.unwrap());
        assert!(!memory[source.domain.0 as usize].holds(source.blob));
    }

    #[tokio::test]
    async fn test_rehome_unconfirmed_purge() {
        let (memory, manager) = setup(4);
        let set_id = SetId::new();
        let refs = manager.place(set_id, 2, &shares(2, 3)).await.unwrap();
        let source = refs[0].clone();
        memory[source.domain.0 as usize].set_fail_deletes(true);

        let err = manager.rehome(source.key, &[]).await.unwrap_err();
        assert!(matches!(err, Error::PurgeUnconfirmed { .. }));
        assert!(err.is_tamper_signal());
        assert!(manager.has_orphans());

        // The fragment moved, but the stale copy still counts against its domain
        let moved = manager.locate_fragment(source.key).await.unwrap();
        assert_ne!(moved.domain, source.domain);
        assert_eq!(moved.generation, 1);
        assert_eq!(manager.occupancy(set_id).get(&source.domain), Some(&1));
        assert!(max_copies(&manager, set_id) < 2);
    }

    #[tokio::test]
    async fn test_orphaned_copy_purged_once_delete_succeeds() {
        let (memory, manager) = setup(4);
        let set_id = SetId::new();
        let refs = manager.place(set_id, 2, &shares(2, 3)).await.unwrap();
        let source = refs[0].clone();
        let source_domain = &memory[source.domain.0 as usize];
        source_domain.set_fail_deletes(true);
        assert!(manager.rehome(source.key, &[]).await.is_err());

        let ticket = PurgeTicket::for_tests();
        assert!(manager.purge_orphans(&ticket).await.is_empty());
        assert!(source_domain.holds(source.blob));
        assert!(manager.has_orphans());

        source_domain.set_fail_deletes(false);
        assert_eq!(manager.purge_orphans(&ticket).await, vec![source.key]);
        assert!(!source_domain.holds(source.blob));
        assert!(!manager.has_orphans());
        assert_eq!(manager.occupancy(set_id).get(&source.domain), None);
    }

    #[tokio::test]
    async fn test_recheck_restores_recovered_domain() {
        let memory = MemoryDomain::pool(3);
        let domains: Vec<DomainRef> = memory.iter().map(|d| d.clone() as DomainRef).collect();
        let ids: Vec<DomainId> = domains.iter().map(|d| d.id()).collect();
        let health = Arc::new(HealthTracker::with_max_failures(&ids, 1));
        let manager = PlacementManager::new(domains, health.clone(), PlacementConfig::default()).unwrap();

        // A transient outage marks the domain unavailable on its first failure
        memory[2].set_available(false);
        health.record_failure(DomainId(2), "domain offline");
        assert_eq!(health.unavailable_domains(), vec![DomainId(2)]);
        assert!(matches!(
            manager.place(SetId::new(), 2, &shares(2, 3)).await,
            Err(Error::InvalidParameters(_))
        ));

        assert!(manager.recheck_unavailable().await.is_empty());
        assert_eq!(health.unavailable_domains(), vec![DomainId(2)]);

        memory[2].set_available(true);
        assert_eq!(manager.recheck_unavailable().await, vec![DomainId(2)]);
        assert!(health.unavailable_domains().is_empty());

        // Three fragments at K=2 need all three domains again
        assert!(manager.place(SetId::new(), 2, &shares(2, 3)).await.is_ok());
    }

    #[tokio::test]
    async fn test_rehome_respects_avoid_list() {
        let (_memory, manager) = setup(5);
        let set_id = SetId::new();
        let refs = manager.place(set_id, 2, &shares(2, 3)).await.unwrap();
        let used: Vec<DomainId> = refs.iter().map(|r| r.domain).collect();
        let free: Vec<DomainId> = (0..5u16).map(DomainId).filter(|d| !used.contains(d)).collect();

        let after = manager.rehome(refs[0].key, &[free[0]]).await.unwrap();
        assert_eq!(after.domain, free[1]);
    }

    #[tokio::test]
    async fn test_purge_removes_bytes() {
        let (memory, manager) = setup(3);
        let set_id = SetId::new();
        let refs = manager.place(set_id, 2, &shares(2, 3)).await.unwrap();

        let ticket = PurgeTicket::for_tests();
        assert!(manager.purge(refs[2].key, &ticket).await.unwrap());
        assert!(!memory[refs[2].domain.0 as usize].holds(refs[2].blob));
        assert!(manager.locate_fragment(refs[2].key).await.is_err());
        // Purging twice is a no-op
        assert!(!manager.purge(refs[2].key, &ticket).await.unwrap());
        // A purged fragment cannot hop
        assert!(manager.rehome(refs[2].key, &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_sets_touching_and_fragments_in() {
        let (_memory, manager) = setup(3);
        let set_id = SetId::new();
        let refs = manager.place(set_id, 2, &shares(2, 3)).await.unwrap();

        let domain = refs[1].domain;
        assert_eq!(manager.sets_touching(&[domain]), vec![set_id]);
        let held = manager.fragments_in(&[domain]).await;
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].key, refs[1].key);
    }
}
