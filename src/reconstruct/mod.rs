//! Reconstruction service
//!
//! Gathers K live fragments of a set and decodes them. Fetches fan out in
//! parallel; once K succeed the rest are dropped. Before decoding, every
//! gathered fragment must be live at one checkpoint instant and still at the
//! generation it was fetched at, so a payload is never assembled from
//! fragments that were not valid together.

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::codec::{Fingerprint, Share, ShareCodec};
use crate::config::ReconstructionConfig;
use crate::error::{Error, Result};
use crate::expiration::{ExpirationManager, SetLiveness};
use crate::placement::{FragmentRef, PlacementManager};
use crate::types::{DomainId, SetId};

/// What the service needs to know about a set to decode it
#[derive(Debug, Clone)]
pub struct SetDescriptor {
    pub set_id: SetId,
    pub threshold: usize,
    pub total: usize,
    pub fingerprint: Fingerprint,
}

/// Result of one reconstruction request
#[derive(Debug)]
pub struct ReconstructAttempt {
    pub result: Result<Vec<u8>>,
    /// Domains that returned shares failing their checksum
    pub tampered: Vec<DomainId>,
    /// Set-level integrity failure (fingerprint mismatch after decode)
    pub fingerprint_mismatch: bool,
}

#[derive(Default)]
struct Observations {
    tampered: Vec<DomainId>,
    fingerprint_mismatch: bool,
}

/// Read path over placement and expiration
pub struct ReconstructionService {
    clock: Arc<dyn Clock>,
    placement: Arc<PlacementManager>,
    expiration: Arc<ExpirationManager>,
    config: ReconstructionConfig,
}

impl ReconstructionService {
    pub fn new(
        clock: Arc<dyn Clock>,
        placement: Arc<PlacementManager>,
        expiration: Arc<ExpirationManager>,
        config: ReconstructionConfig,
    ) -> Self {
        ReconstructionService {
            clock,
            placement,
            expiration,
            config,
        }
    }

    /// Reconstruct a set within `deadline`, abandoning the attempt if `cancel` fires
    pub async fn reconstruct(
        &self,
        set: &SetDescriptor,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> ReconstructAttempt {
        let observations = Mutex::new(Observations::default());

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            r = tokio::time::timeout(deadline, self.gather(set, &observations)) => {
                r.unwrap_or(Err(Error::Timeout))
            }
        };

        let observations = observations.into_inner();
        match &result {
            Ok(_) => debug!("Reconstructed set {}", set.set_id),
            Err(e) => debug!("Reconstruction of {} failed: {}", set.set_id, e),
        }

        ReconstructAttempt {
            result,
            tampered: observations.tampered,
            fingerprint_mismatch: observations.fingerprint_mismatch,
        }
    }

    async fn gather(&self, set: &SetDescriptor, observations: &Mutex<Observations>) -> Result<Vec<u8>> {
        let codec = ShareCodec::new(set.threshold, set.total)?;
        let k = set.threshold;

        // Shares held so far, with the ref they were fetched through
        let mut held: BTreeMap<u8, (FragmentRef, Share)> = BTreeMap::new();
        // Fragments not to retry within this request
        let mut excluded: HashSet<u8> = HashSet::new();
        let mut corrupt_seen = false;

        loop {
            let now = self.clock.now();
            match self.expiration.set_liveness(set.set_id, now) {
                SetLiveness::Active => {}
                SetLiveness::Expired => return Err(Error::SetExpired(set.set_id)),
                SetLiveness::Unknown => return Err(Error::SetNotFound(set.set_id)),
            }

            let refs = match self.placement.locate(set.set_id).await {
                Ok(refs) => refs,
                Err(Error::SetNotFound(id)) => return Err(Error::SetExpired(id)),
                Err(e) => return Err(e),
            };

            let mut candidates: Vec<FragmentRef> = refs
                .into_iter()
                .filter(|r| !held.contains_key(&r.key.index) && !excluded.contains(&r.key.index))
                .filter(|r| self.expiration.is_live(r.key, now))
                .collect();

            let available = held.len() + candidates.len();
            if available < k {
                return Err(if corrupt_seen {
                    Error::CorruptShares(format!(
                        "integrity failures left {} of {} required shares",
                        available, k
                    ))
                } else {
                    Error::InsufficientShares {
                        available,
                        required: k,
                    }
                });
            }

            let health = self.placement.health();
            candidates.sort_by_key(|r| (health.rank(r.domain), r.key.index));

            let needed = k - held.len();
            let mut queue = candidates.into_iter();
            let mut pending = FuturesUnordered::new();
            for r in queue.by_ref().take(needed + self.config.fetch_spares) {
                pending.push(self.fetch_one(r));
            }

            let mut raced_hop = false;
            while let Some((r, outcome)) = pending.next().await {
                match outcome {
                    Ok(share) => {
                        held.insert(r.key.index, (r, share));
                        if held.len() >= k {
                            break;
                        }
                        continue;
                    }
                    Err(Error::FragmentNotFound(_)) => {
                        // Hopped or purged since located
                        raced_hop = true;
                    }
                    Err(Error::CorruptShares(reason)) => {
                        warn!("Discarding share {} from {}: {}", r.key, r.domain, reason);
                        observations.lock().tampered.push(r.domain);
                        corrupt_seen = true;
                        excluded.insert(r.key.index);
                    }
                    Err(e) => {
                        debug!("Fetch of {} from {} failed: {}", r.key, r.domain, e);
                        excluded.insert(r.key.index);
                    }
                }
                if let Some(next) = queue.next() {
                    pending.push(self.fetch_one(next));
                }
            }
            // Dropping the remaining futures cancels their fetches
            drop(pending);

            if held.len() < k {
                if raced_hop {
                    continue;
                }
                let available = held.len();
                return Err(if corrupt_seen {
                    Error::CorruptShares(format!(
                        "integrity failures left {} of {} required shares",
                        available, k
                    ))
                } else {
                    Error::InsufficientShares {
                        available,
                        required: k,
                    }
                });
            }

            // Checkpoint: all held fragments live at one instant, none moved since fetch
            let checkpoint = self.clock.now();
            let mut stale = Vec::new();
            for (index, (r, _)) in held.iter() {
                let current = self.placement.locate_fragment(r.key).await.ok();
                let same_generation = current.map(|c| c.generation == r.generation).unwrap_or(false);
                if !same_generation || !self.expiration.is_live(r.key, checkpoint) {
                    stale.push(*index);
                }
            }
            if !stale.is_empty() {
                debug!(
                    "{} shares of {} failed the checkpoint, refetching",
                    stale.len(),
                    set.set_id
                );
                for index in stale {
                    held.remove(&index);
                }
                continue;
            }

            let shares: Vec<Share> = held.into_values().map(|(_, share)| share).collect();
            return match codec.decode(&shares, &set.fingerprint) {
                Ok(payload) => Ok(payload),
                Err(e @ Error::CorruptShares(_)) => {
                    observations.lock().fingerprint_mismatch = true;
                    Err(e)
                }
                Err(e) => Err(e),
            };
        }
    }

    async fn fetch_one(&self, r: FragmentRef) -> (FragmentRef, Result<Share>) {
        let outcome = self.placement.fetch(&r).await;
        let outcome = outcome.map(|fetched| fetched.share);
        (r, outcome)
    }
}
