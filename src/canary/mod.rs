//! Canary tokens
//!
//! Decoy blobs stored next to real fragments under the same kind of random
//! key and with random bytes of the same length, so a domain or a passive
//! observer cannot tell them apart. The store never reads a canary, so any
//! access to one is out of policy. The manager receives every domain access
//! event and trips a token once its access count in the sensitivity window
//! exceeds what its sensitivity allows.

pub mod odds;

pub use odds::{detection_probability, tokens_for_probability, tokens_for_ratio};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{Clock, MonoTime};
use crate::config::CanaryConfig;
use crate::domain::{AccessEvent, AccessKind, AccessObserver};
use crate::error::{Error, Result};
use crate::placement::{FragmentRef, PlacementManager};
use crate::types::{BlobId, DomainId, SetId, TokenId};

/// A deployed decoy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryToken {
    pub token_id: TokenId,
    pub domain: DomainId,
    pub blob: BlobId,
    pub created_at: DateTime<Utc>,
    /// Expected benign accesses per second
    pub sensitivity: f64,
    /// Set the token accompanies; unbound tokens rotate on a timer
    pub bound_to: Option<SetId>,
    #[serde(skip)]
    deployed_at: MonoTime,
}

/// A token's access count exceeded its sensitivity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryTrip {
    pub token_id: TokenId,
    pub domain: DomainId,
    pub kind: AccessKind,
    pub source_context: String,
    /// Accesses seen inside the sensitivity window
    pub accesses: usize,
    pub observed_at: DateTime<Utc>,
}

/// Listener invoked on every trip
pub type TripCallback = Arc<dyn Fn(&CanaryTrip) + Send + Sync>;

/// Tokens changed by one rotation pass
#[derive(Debug, Default)]
pub struct Rotation {
    pub retired: Vec<TokenId>,
    pub deployed: Vec<CanaryToken>,
}

/// Deploys decoys and watches for accesses to them
pub struct CanaryManager {
    clock: Arc<dyn Clock>,
    placement: Arc<PlacementManager>,
    config: CanaryConfig,
    tokens: DashMap<TokenId, CanaryToken>,
    by_blob: DashMap<BlobId, TokenId>,
    by_set: DashMap<SetId, Vec<TokenId>>,
    /// Recent access times per token
    hits: DashMap<TokenId, VecDeque<MonoTime>>,
    listeners: RwLock<Vec<TripCallback>>,
}

impl CanaryManager {
    pub fn new(clock: Arc<dyn Clock>, placement: Arc<PlacementManager>, config: CanaryConfig) -> Self {
        CanaryManager {
            clock,
            placement,
            config,
            tokens: DashMap::new(),
            by_blob: DashMap::new(),
            by_set: DashMap::new(),
            hits: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener for canary trips
    pub fn on_access<F>(&self, callback: F)
    where
        F: Fn(&CanaryTrip) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(callback));
    }

    /// Deploy an unbound token in `domain`
    ///
    /// # Errors
    /// - `InvalidParameters` for a negative or non-finite sensitivity
    /// - `UnknownDomain` / `DomainUnavailable` if the write fails
    pub async fn deploy(&self, domain: DomainId, sensitivity: f64) -> Result<CanaryToken> {
        self.deploy_token(domain, sensitivity, None, self.config.decoy_len)
            .await
    }

    async fn deploy_token(
        &self,
        domain_id: DomainId,
        sensitivity: f64,
        bound_to: Option<SetId>,
        len: usize,
    ) -> Result<CanaryToken> {
        if !sensitivity.is_finite() || sensitivity < 0.0 {
            return Err(Error::InvalidParameters(format!(
                "canary sensitivity must be a non-negative rate, got {}",
                sensitivity
            )));
        }
        let domain = self
            .placement
            .domain(domain_id)
            .ok_or(Error::UnknownDomain(domain_id))?;

        let mut decoy = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut decoy);

        let token = CanaryToken {
            token_id: TokenId::new(),
            domain: domain_id,
            blob: BlobId::new(),
            created_at: Utc::now(),
            sensitivity,
            bound_to,
            deployed_at: self.clock.now(),
        };
        domain.put(token.blob, &decoy).await?;

        self.by_blob.insert(token.blob, token.token_id);
        self.tokens.insert(token.token_id, token.clone());
        if let Some(set_id) = bound_to {
            self.by_set.entry(set_id).or_default().push(token.token_id);
        }

        debug!("Deployed canary {} in {}", token.token_id, domain_id);
        Ok(token)
    }

    /// Deploy bound tokens alongside a freshly placed set.
    ///
    /// Each domain holding fragments of the set gets `canary_ratio` tokens
    /// per fragment it holds (rounded up). Decoys match the share length.
    pub async fn deploy_for_set(
        &self,
        set_id: SetId,
        fragments: &[FragmentRef],
        share_len: usize,
    ) -> Vec<TokenId> {
        let mut per_domain: HashMap<DomainId, usize> = HashMap::new();
        for fragment in fragments {
            *per_domain.entry(fragment.domain).or_insert(0) += 1;
        }

        let mut deployed = Vec::new();
        for (domain, count) in per_domain {
            for _ in 0..tokens_for_ratio(count, self.config.canary_ratio) {
                match self
                    .deploy_token(domain, self.config.default_sensitivity, Some(set_id), share_len)
                    .await
                {
                    Ok(token) => deployed.push(token.token_id),
                    Err(e) => warn!("Canary for set {} in {} not deployed: {}", set_id, domain, e),
                }
            }
        }
        deployed
    }

    /// Remove a token and its decoy blob. The token stays tracked, and keeps
    /// tripping, until its domain confirms the delete.
    pub async fn retire(&self, token_id: TokenId) -> Result<()> {
        let token = self.token(token_id).ok_or(Error::TokenNotFound(token_id))?;
        if let Some(domain) = self.placement.domain(token.domain) {
            domain.delete(token.blob).await?;
        }

        self.tokens.remove(&token_id);
        self.by_blob.remove(&token.blob);
        self.hits.remove(&token_id);
        if let Some(set_id) = token.bound_to {
            let emptied = match self.by_set.get_mut(&set_id) {
                Some(mut ids) => {
                    ids.retain(|id| *id != token_id);
                    ids.is_empty()
                }
                None => false,
            };
            if emptied {
                self.by_set.remove_if(&set_id, |_, ids| ids.is_empty());
            }
        }
        debug!("Retired canary {}", token_id);
        Ok(())
    }

    /// Retire every token bound to a set. Returns the tokens actually
    /// removed; the others stay bound to the set.
    pub async fn retire_set(&self, set_id: SetId) -> Vec<TokenId> {
        let mut retired = Vec::new();
        for token_id in self.tokens_for_set(set_id) {
            match self.retire(token_id).await {
                Ok(()) => retired.push(token_id),
                Err(e) => warn!("Canary {} of set {} not retired: {}", token_id, set_id, e),
            }
        }
        retired
    }

    /// Re-register a token persisted by an earlier run. Its blob is assumed
    /// to still be in place.
    pub fn adopt(&self, mut token: CanaryToken) {
        token.deployed_at = self.clock.now();
        self.by_blob.insert(token.blob, token.token_id);
        if let Some(set_id) = token.bound_to {
            self.by_set.entry(set_id).or_default().push(token.token_id);
        }
        self.tokens.insert(token.token_id, token);
    }

    /// Replace unbound tokens older than the rotation interval with fresh
    /// ones in the same domain. A token whose decoy cannot be deleted stays
    /// in place and is retried on the next rotation.
    pub async fn rotate(&self) -> Rotation {
        let now = self.clock.now();
        let interval = Duration::from_millis(self.config.rotation_interval_ms);
        let due: Vec<CanaryToken> = self
            .tokens
            .iter()
            .filter(|t| t.bound_to.is_none() && now.saturating_since(t.deployed_at) >= interval)
            .map(|t| t.value().clone())
            .collect();

        let mut rotation = Rotation::default();
        for old in due {
            if let Err(e) = self.retire(old.token_id).await {
                warn!("Canary {} not rotated: {}", old.token_id, e);
                continue;
            }
            rotation.retired.push(old.token_id);
            match self.deploy(old.domain, old.sensitivity).await {
                Ok(token) => rotation.deployed.push(token),
                Err(e) => warn!("Canary rotation in {} failed: {}", old.domain, e),
            }
        }
        if !rotation.retired.is_empty() {
            info!(
                "Rotated {} canary tokens ({} replaced)",
                rotation.retired.len(),
                rotation.deployed.len()
            );
        }
        rotation
    }

    pub fn token(&self, token_id: TokenId) -> Option<CanaryToken> {
        self.tokens.get(&token_id).map(|t| t.value().clone())
    }

    pub fn tokens_for_set(&self, set_id: SetId) -> Vec<TokenId> {
        self.by_set
            .get(&set_id)
            .map(|t| t.value().clone())
            .unwrap_or_default()
    }

    /// Number of tokens in a domain
    pub fn tokens_in(&self, domain: DomainId) -> usize {
        self.tokens.iter().filter(|t| t.domain == domain).count()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Accesses a token tolerates within one sensitivity window
    fn allowance(&self, sensitivity: f64) -> usize {
        let window_secs = self.config.sensitivity_window_ms as f64 / 1000.0;
        (sensitivity * window_secs).floor() as usize
    }

    /// Record an access; returns a trip if the token's allowance is exceeded
    fn record_hit(&self, event: &AccessEvent) -> Option<CanaryTrip> {
        let token_id = *self.by_blob.get(&event.subject)?;
        let sensitivity = self.tokens.get(&token_id)?.sensitivity;

        let now = self.clock.now();
        let window = Duration::from_millis(self.config.sensitivity_window_ms);
        let mut hits = self.hits.entry(token_id).or_default();
        hits.push_back(now);
        while let Some(oldest) = hits.front() {
            if now.saturating_since(*oldest) > window {
                hits.pop_front();
            } else {
                break;
            }
        }

        let accesses = hits.len();
        if accesses <= self.allowance(sensitivity) {
            return None;
        }
        hits.clear();

        Some(CanaryTrip {
            token_id,
            domain: event.domain,
            kind: event.kind,
            source_context: event.source_context.clone(),
            accesses,
            observed_at: event.observed_at,
        })
    }
}

impl AccessObserver for CanaryManager {
    fn observe(&self, event: &AccessEvent) {
        let Some(trip) = self.record_hit(event) else {
            return;
        };
        warn!(
            "Canary {} in {} tripped by {:?} access from '{}'",
            trip.token_id, trip.domain, trip.kind, trip.source_context
        );
        let listeners: Vec<TripCallback> = self.listeners.read().clone();
        for listener in listeners {
            listener(&trip);
        }
    }
}
