//! Fragment store facade
//!
//! Wires the components together and runs their background tasks:
//!
//! - the expiration sweeper
//! - an event loop feeding canary trips, reconstruction outcomes and purge
//!   reports to the anomaly detector and the response coordinator
//! - the hop scheduler that periodically moves fragments between domains
//! - canary rotation and detector ticks
//! - health checks that return recovered domains to the placement pool
//!
//! Set records and canary tokens are persisted so liveness tracking can be
//! resumed after a restart. Share bytes live only in the storage domains.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::canary::{CanaryManager, CanaryTrip};
use crate::clock::{Clock, MonoTime, SystemClock};
use crate::codec::ShareCodec;
use crate::config::Config;
use crate::detector::{
    AlertSink, AnomalyAlert, AnomalyDetector, EscalationOutcome, EscalationState, LogAlertSink,
    ResponseCoordinator, Signal,
};
use crate::domain::{AccessObserver, DomainRef, HealthTracker};
use crate::error::{Error, Result};
use crate::expiration::{ExpirationManager, PurgeReport, SetLiveness};
use crate::metadata::{AuditEvent, AuditLog, FragmentMeta, MetadataStore, SetRecord};
use crate::placement::{AdoptedFragment, FragmentRef, PlacementManager};
use crate::policy::{PolicySource, SensitivityTier};
use crate::reconstruct::{ReconstructionService, SetDescriptor};
use crate::types::{DomainId, FragmentKey, SetId, TokenId};

/// Name of the sled database under the data directory
pub const STATE_DB: &str = "state.db";

/// Observable state of a fragment set
#[derive(Debug, Clone, Serialize)]
pub struct SetStatus {
    pub set_id: SetId,
    pub fragments_live: usize,
    pub total_fragments: usize,
    pub threshold: usize,
    /// Time until the set deadline, zero once expired
    pub remaining: Duration,
    pub deadline: Option<DateTime<Utc>>,
    pub expired: bool,
    pub escalation_state: EscalationState,
}

/// Outcome of [`FragmentStore::resume`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeSummary {
    /// Sets resumed with time remaining
    pub live: usize,
    /// Sets whose deadline passed while the store was down; purged by the next sweep
    pub expired: usize,
    pub canaries: usize,
}

enum StoreEvent {
    Trip(CanaryTrip),
    Signal(Signal),
}

struct StoreInner {
    config: Config,
    clock: Arc<dyn Clock>,
    placement: Arc<PlacementManager>,
    expiration: Arc<ExpirationManager>,
    reconstruction: ReconstructionService,
    canaries: Arc<CanaryManager>,
    detector: AnomalyDetector,
    response: ResponseCoordinator,
    policy: Arc<dyn PolicySource>,
    metadata: MetadataStore,
    audit: AuditLog,
    sets: DashMap<SetId, SetDescriptor>,
    events: mpsc::UnboundedSender<StoreEvent>,
    /// Wall clock time matching `origin_mono`, used to persist deadlines
    origin_wall: DateTime<Utc>,
    origin_mono: MonoTime,
}

/// Builder for [`FragmentStore`]
pub struct FragmentStoreBuilder {
    config: Config,
    domains: Vec<DomainRef>,
    clock: Option<Arc<dyn Clock>>,
    sink: Option<Arc<dyn AlertSink>>,
    policy: Option<Arc<dyn PolicySource>>,
    db: Option<sled::Db>,
}

impl FragmentStoreBuilder {
    pub fn domains(mut self, domains: Vec<DomainRef>) -> Self {
        self.domains = domains;
        self
    }

    pub fn domain(mut self, domain: DomainRef) -> Self {
        self.domains.push(domain);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Where escalation alerts are delivered besides subscribers. Defaults
    /// to the log.
    pub fn alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Override the per-tier defaults from the configuration
    pub fn policy(mut self, policy: Arc<dyn PolicySource>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Persist metadata and the audit log in an already opened database
    pub fn database(mut self, db: sled::Db) -> Self {
        self.db = Some(db);
        self
    }

    /// Build the store and start its background tasks. Must be called from
    /// within a Tokio runtime.
    pub fn build(self) -> Result<FragmentStore> {
        self.config.validate()?;

        let db = match self.db {
            Some(db) => db,
            None => match &self.config.data_dir {
                Some(dir) => {
                    self.config.ensure_directories()?;
                    sled::open(dir.join(STATE_DB))?
                }
                None => sled::Config::new().temporary(true).open()?,
            },
        };

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let domain_ids: Vec<DomainId> = self.domains.iter().map(|d| d.id()).collect();
        let health = Arc::new(HealthTracker::with_max_failures(
            &domain_ids,
            self.config.placement.max_consecutive_failures,
        ));
        let placement = Arc::new(PlacementManager::new(
            self.domains.clone(),
            health,
            self.config.placement.clone(),
        )?);
        let expiration = Arc::new(ExpirationManager::new(
            clock.clone(),
            placement.clone(),
            self.config.expiration.clone(),
        ));
        let reconstruction = ReconstructionService::new(
            clock.clone(),
            placement.clone(),
            expiration.clone(),
            self.config.reconstruction.clone(),
        );

        let (events, event_rx) = mpsc::unbounded_channel();
        let canaries = Arc::new(CanaryManager::new(
            clock.clone(),
            placement.clone(),
            self.config.canary.clone(),
        ));
        {
            let events = events.clone();
            canaries.on_access(move |trip| {
                let _ = events.send(StoreEvent::Trip(trip.clone()));
            });
        }
        for domain in &self.domains {
            domain.attach_observer(canaries.clone() as Arc<dyn AccessObserver>);
        }

        let detector = AnomalyDetector::new(clock.clone(), self.config.detector.clone());
        let response = ResponseCoordinator::new(
            clock.clone(),
            placement.clone(),
            expiration.clone(),
            self.config.detector.tighten_factor,
            self.config.detector.alert_buffer,
            self.sink.unwrap_or_else(|| Arc::new(LogAlertSink)),
        );

        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(self.config.policy.clone()));

        let inner = Arc::new(StoreInner {
            origin_wall: Utc::now(),
            origin_mono: clock.now(),
            metadata: MetadataStore::with_db(db.clone())?,
            audit: AuditLog::with_db(db)?,
            config: self.config,
            clock,
            placement,
            expiration,
            reconstruction,
            canaries,
            detector,
            response,
            policy,
            sets: DashMap::new(),
            events,
        });

        let store = FragmentStore {
            inner,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        };
        store.spawn_tasks(event_rx);
        info!(
            "Fragment store started with {} domains",
            store.inner.placement.domain_ids().len()
        );
        Ok(store)
    }
}

/// Temporal fragment store
pub struct FragmentStore {
    inner: Arc<StoreInner>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FragmentStore {
    pub fn builder(config: Config) -> FragmentStoreBuilder {
        FragmentStoreBuilder {
            config,
            domains: Vec::new(),
            clock: None,
            sink: None,
            policy: None,
            db: None,
        }
    }

    fn spawn_tasks(&self, event_rx: mpsc::UnboundedReceiver<StoreEvent>) {
        let mut tasks = self.tasks.lock();
        let (report_tx, report_rx) = mpsc::unbounded_channel();

        tasks.push(tokio::spawn(
            self.inner
                .expiration
                .clone()
                .run_sweeper(report_tx, self.cancel.clone()),
        ));
        tasks.push(tokio::spawn(run_event_loop(
            self.inner.clone(),
            event_rx,
            report_rx,
            self.cancel.clone(),
        )));

        let hop = self.inner.config.placement.hop_interval_ms;
        if hop > 0 {
            tasks.push(tokio::spawn(run_hop_scheduler(
                self.inner.clone(),
                Duration::from_millis(hop),
                self.cancel.clone(),
            )));
        }

        let recheck = self.inner.config.placement.recheck_interval_ms;
        if recheck > 0 {
            tasks.push(tokio::spawn(run_health_checks(
                self.inner.clone(),
                Duration::from_millis(recheck),
                self.cancel.clone(),
            )));
        }

        let rotation = self.inner.config.canary.rotation_interval_ms;
        if rotation > 0 {
            tasks.push(tokio::spawn(run_canary_rotation(
                self.inner.clone(),
                Duration::from_millis(rotation),
                self.cancel.clone(),
            )));
        }

        tasks.push(tokio::spawn(run_detector_ticks(
            self.inner.clone(),
            Duration::from_millis(self.inner.config.detector.correlation_window_ms),
            self.cancel.clone(),
        )));
    }

    /// Split `payload` into `total` fragments, any `threshold` of which
    /// reconstruct it, and place them across the storage domains. Every
    /// fragment expires `lifetime` from now.
    ///
    /// # Errors
    /// - `InvalidParameters` for bad K/N or a zero lifetime
    /// - `DomainUnavailable` if the fragments cannot all be placed
    pub async fn create_fragment_set(
        &self,
        payload: &[u8],
        total: usize,
        threshold: usize,
        lifetime: Duration,
    ) -> Result<SetId> {
        self.create(payload, total, threshold, lifetime, None).await
    }

    /// Create a set with the N, K and lifetime of a sensitivity tier
    pub async fn create_for_tier(&self, payload: &[u8], tier: SensitivityTier) -> Result<SetId> {
        let policy = self.inner.policy.policy_for(tier);
        policy.validate()?;
        self.create(
            payload,
            policy.total,
            policy.threshold,
            policy.lifetime(),
            Some(tier),
        )
        .await
    }

    async fn create(
        &self,
        payload: &[u8],
        total: usize,
        threshold: usize,
        lifetime: Duration,
        tier: Option<SensitivityTier>,
    ) -> Result<SetId> {
        if lifetime.is_zero() {
            return Err(Error::InvalidParameters(
                "lifetime must be greater than 0".to_string(),
            ));
        }
        let inner = &self.inner;
        let codec = ShareCodec::new(threshold, total)?;
        let encoded = codec.encode(payload)?;
        let set_id = SetId::new();

        let refs = inner.placement.place(set_id, threshold, &encoded.shares).await?;
        let share_len = encoded.shares.first().map(|s| s.data.len()).unwrap_or(0);
        drop(encoded.shares);

        let deadline = inner.clock.now() + lifetime;
        inner.expiration.register_set(set_id, total, deadline);
        inner.sets.insert(
            set_id,
            SetDescriptor {
                set_id,
                threshold,
                total,
                fingerprint: encoded.fingerprint.clone(),
            },
        );

        let tokens = inner.canaries.deploy_for_set(set_id, &refs, share_len).await;
        inner.persist_tokens(&tokens);

        let wall_deadline = inner.wall_time(deadline);
        let record = SetRecord {
            set_id,
            threshold,
            total,
            share_len,
            tier,
            created_at: Utc::now(),
            deadline: wall_deadline,
            fingerprint: encoded.fingerprint,
            fragments: refs
                .iter()
                .map(|r| FragmentMeta {
                    index: r.key.index,
                    domain: r.domain,
                    blob: r.blob,
                    valid_until: wall_deadline,
                    share_checksum: r.share_checksum,
                    generation: r.generation,
                })
                .collect(),
        };
        if let Err(e) = inner.metadata.put_set(&record) {
            error!("Set {} not persisted, purging it: {}", set_id, e);
            let report = inner.expiration.purge_set(set_id).await;
            inner.on_purged(&report, true).await;
            return Err(e);
        }

        inner.record(AuditEvent::Created {
            set_id,
            total,
            threshold,
            lifetime_ms: lifetime.as_millis() as u64,
        });
        info!(
            "Created set {} ({}-of-{}, {} canaries) for {:?}",
            set_id,
            threshold,
            total,
            tokens.len(),
            lifetime
        );
        Ok(set_id)
    }

    /// Reconstruct a set's payload within `deadline`
    pub async fn reconstruct(&self, set_id: SetId, deadline: Duration) -> Result<Vec<u8>> {
        self.reconstruct_with_cancel(set_id, deadline, &CancellationToken::new())
            .await
    }

    /// Reconstruct, abandoning the request when `cancel` fires
    pub async fn reconstruct_with_cancel(
        &self,
        set_id: SetId,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let inner = &self.inner;
        let Some(descriptor) = inner.sets.get(&set_id).map(|d| d.clone()) else {
            return match inner.expiration.set_liveness(set_id, inner.clock.now()) {
                SetLiveness::Expired => Err(Error::SetExpired(set_id)),
                _ => Err(Error::SetNotFound(set_id)),
            };
        };

        let attempt = inner
            .reconstruction
            .reconstruct(&descriptor, deadline, cancel)
            .await;

        for domain in &attempt.tampered {
            inner.signal(Signal::Tamper {
                set_id,
                domain: Some(*domain),
            });
        }
        if attempt.fingerprint_mismatch {
            inner.signal(Signal::Tamper {
                set_id,
                domain: None,
            });
        }

        match &attempt.result {
            Ok(_) => {
                inner.signal(Signal::ReconstructionOutcome {
                    set_id,
                    success: true,
                });
                inner.record(AuditEvent::Reconstructed { set_id });
            }
            Err(e) => {
                if e.is_reconstruction_failure() {
                    inner.signal(Signal::ReconstructionOutcome {
                        set_id,
                        success: false,
                    });
                }
                inner.record(AuditEvent::ReconstructFailed {
                    set_id,
                    error: e.to_string(),
                });
            }
        }
        attempt.result
    }

    /// Deploy an unbound canary token in `domain`
    pub async fn deploy_canary(&self, domain: DomainId, sensitivity: f64) -> Result<TokenId> {
        let token = self.inner.canaries.deploy(domain, sensitivity).await?;
        self.inner.metadata.put_canary(&token)?;
        Ok(token.token_id)
    }

    /// Liveness of a set's fragments
    pub fn status(&self, set_id: SetId) -> Result<SetStatus> {
        let inner = &self.inner;
        let now = inner.clock.now();
        let escalation_state = inner.detector.state();

        match inner.sets.get(&set_id) {
            Some(descriptor) => {
                let deadline = inner.expiration.set_deadline(set_id);
                let remaining = deadline
                    .map(|d| d.saturating_since(now))
                    .unwrap_or(Duration::ZERO);
                Ok(SetStatus {
                    set_id,
                    fragments_live: inner.expiration.live_fragments(set_id, now).len(),
                    total_fragments: descriptor.total,
                    threshold: descriptor.threshold,
                    remaining,
                    deadline: deadline.map(|d| inner.wall_time(d)),
                    expired: remaining.is_zero(),
                    escalation_state,
                })
            }
            None if inner.expiration.set_liveness(set_id, now) == SetLiveness::Expired => {
                Ok(SetStatus {
                    set_id,
                    fragments_live: 0,
                    total_fragments: 0,
                    threshold: 0,
                    remaining: Duration::ZERO,
                    deadline: None,
                    expired: true,
                    escalation_state,
                })
            }
            None => Err(Error::SetNotFound(set_id)),
        }
    }

    /// Stream of escalation alerts raised from now on
    pub fn subscribe(&self) -> broadcast::Receiver<AnomalyAlert> {
        self.inner.response.subscribe()
    }

    pub fn escalation_state(&self) -> EscalationState {
        self.inner.detector.state()
    }

    /// Restore tracking of sets and canaries persisted by an earlier run.
    ///
    /// Sets whose deadline passed while the store was down are registered
    /// already expired, so the sweeper purges their fragments right away.
    pub async fn resume(&self) -> Result<ResumeSummary> {
        let inner = &self.inner;
        let mut summary = ResumeSummary::default();

        for record in inner.metadata.list_sets()? {
            if inner.sets.contains_key(&record.set_id) {
                continue;
            }
            if record.fragments.is_empty() {
                inner.metadata.remove_set(record.set_id)?;
                continue;
            }

            let wall_now = Utc::now();
            let now = inner.clock.now();
            let to_mono = |wall: DateTime<Utc>| now + (wall - wall_now).to_std().unwrap_or(Duration::ZERO);

            inner.placement.adopt(
                record.set_id,
                record.threshold,
                record.total,
                record
                    .fragments
                    .iter()
                    .map(|f| AdoptedFragment {
                        index: f.index,
                        domain: f.domain,
                        blob: f.blob,
                        generation: f.generation,
                        share_checksum: f.share_checksum,
                    })
                    .collect(),
            );
            inner.expiration.register_set_with(
                record.set_id,
                to_mono(record.deadline),
                record
                    .fragments
                    .iter()
                    .map(|f| (f.index, to_mono(f.valid_until)))
                    .collect(),
            );
            inner.sets.insert(
                record.set_id,
                SetDescriptor {
                    set_id: record.set_id,
                    threshold: record.threshold,
                    total: record.total,
                    fingerprint: record.fingerprint.clone(),
                },
            );

            if record.is_expired(wall_now) {
                summary.expired += 1;
            } else {
                summary.live += 1;
            }
        }

        for token in inner.metadata.list_canaries()? {
            if inner.canaries.token(token.token_id).is_none() {
                inner.canaries.adopt(token);
                summary.canaries += 1;
            }
        }

        info!(
            "Resumed {} live sets, {} expired, {} canaries",
            summary.live, summary.expired, summary.canaries
        );
        Ok(summary)
    }

    /// Move every live fragment to another domain now
    pub async fn hop_all(&self) -> usize {
        self.inner.hop_all().await
    }

    /// Move one live fragment to another domain now.
    ///
    /// # Errors
    /// - `SetExpired` if the fragment is no longer live
    /// - `HopFailed` if the new copy could not be written; the fragment has
    ///   been purged
    /// - `PurgeUnconfirmed` if the old copy could not be deleted; the set is
    ///   escalated as compromised
    pub async fn rehome(&self, key: FragmentKey) -> Result<FragmentRef> {
        if !self.inner.expiration.is_live(key, self.inner.clock.now()) {
            return Err(Error::SetExpired(key.set_id));
        }
        self.inner.hop(key).await
    }

    pub fn placement(&self) -> &Arc<PlacementManager> {
        &self.inner.placement
    }

    pub fn expiration(&self) -> &Arc<ExpirationManager> {
        &self.inner.expiration
    }

    pub fn canaries(&self) -> &Arc<CanaryManager> {
        &self.inner.canaries
    }

    pub fn audit(&self) -> &AuditLog {
        &self.inner.audit
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.inner.metadata
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Stop the background tasks and flush persisted state
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        self.inner.metadata.flush()?;
        info!("Fragment store stopped");
        Ok(())
    }
}

impl Drop for FragmentStore {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl StoreInner {
    fn wall_time(&self, t: MonoTime) -> DateTime<Utc> {
        let offset = t.0 as i64 - self.origin_mono.0 as i64;
        self.origin_wall + chrono::Duration::microseconds(offset)
    }

    fn signal(&self, signal: Signal) {
        if self.events.send(StoreEvent::Signal(signal)).is_err() {
            debug!("Event loop stopped, signal dropped");
        }
    }

    fn record(&self, event: AuditEvent) {
        if let Err(e) = self.audit.append(event) {
            warn!("Audit entry not written: {}", e);
        }
    }

    fn persist_tokens(&self, tokens: &[TokenId]) {
        for token_id in tokens {
            if let Some(token) = self.canaries.token(*token_id) {
                if let Err(e) = self.metadata.put_canary(&token) {
                    warn!("Canary {} not persisted: {}", token_id, e);
                }
            }
        }
    }

    fn persist_location(&self, fragment: &FragmentRef) {
        let updated = self.metadata.update_set(fragment.key.set_id, |record| {
            if let Some(meta) = record.fragment_mut(fragment.key.index) {
                meta.domain = fragment.domain;
                meta.blob = fragment.blob;
                meta.generation = fragment.generation;
            }
        });
        if let Err(e) = updated {
            warn!("Location of {} not persisted: {}", fragment.key, e);
        }
    }

    async fn handle_event(&self, event: StoreEvent) {
        let signal = match event {
            StoreEvent::Trip(trip) => {
                self.record(AuditEvent::CanaryTripped {
                    token_id: trip.token_id,
                    domain: trip.domain,
                    source_context: trip.source_context.clone(),
                });
                Signal::CanaryAccess {
                    token: trip.token_id,
                    domain: trip.domain,
                }
            }
            StoreEvent::Signal(signal) => signal,
        };

        let Some(order) = self.detector.observe(signal) else {
            return;
        };
        let outcome = self.response.execute(&order).await;
        self.apply_outcome(&outcome).await;
    }

    async fn apply_outcome(&self, outcome: &EscalationOutcome) {
        let mut by_set: BTreeMap<SetId, Vec<(u8, MonoTime)>> = BTreeMap::new();
        for (key, valid_until) in &outcome.tightened {
            by_set.entry(key.set_id).or_default().push((key.index, *valid_until));
        }
        for (set_id, deadlines) in by_set {
            let set_deadline = self.expiration.set_deadline(set_id).map(|d| self.wall_time(d));
            let updated = self.metadata.update_set(set_id, |record| {
                for (index, valid_until) in deadlines {
                    if let Some(meta) = record.fragment_mut(index) {
                        meta.valid_until = self.wall_time(valid_until);
                    }
                }
                if let Some(deadline) = set_deadline {
                    record.deadline = deadline;
                }
            });
            if let Err(e) = updated {
                warn!("Tightened deadlines of {} not persisted: {}", set_id, e);
            }
        }

        for fragment in &outcome.rehomed {
            self.persist_location(fragment);
        }

        let alert = &outcome.alert;
        self.record(AuditEvent::Escalated {
            alert_id: alert.alert_id,
            domains: alert.domains.clone(),
            reason: alert.reason.clone(),
            tightened: alert.tightened,
            rehomed: alert.rehomed,
        });

        self.on_purged(&outcome.purges, true).await;
    }

    /// Drop bookkeeping for fully purged sets and raise unconfirmed purges
    async fn on_purged(&self, report: &PurgeReport, early: bool) {
        let mut dropped: BTreeMap<SetId, Vec<u8>> = BTreeMap::new();
        for key in &report.purged {
            if !report.expired_sets.contains(&key.set_id) {
                dropped.entry(key.set_id).or_default().push(key.index);
            }
        }
        for (set_id, indices) in dropped {
            let updated = self.metadata.update_set(set_id, |record| {
                record.fragments.retain(|f| !indices.contains(&f.index));
            });
            if let Err(e) = updated {
                warn!("Purged fragments of {} not persisted: {}", set_id, e);
            }
        }

        for set_id in &report.expired_sets {
            let retired = self.canaries.retire_set(*set_id).await;
            for token_id in &retired {
                if let Err(e) = self.metadata.remove_canary(*token_id) {
                    warn!("Canary record {} not removed: {}", token_id, e);
                }
            }
            self.sets.remove(set_id);
            if let Err(e) = self.metadata.remove_set(*set_id) {
                warn!("Record of purged set {} not removed: {}", set_id, e);
            }
            self.record(AuditEvent::Purged {
                set_id: *set_id,
                early,
            });
            debug!("Set {} purged, {} canaries retired", set_id, retired.len());
        }

        for (key, domain) in &report.unconfirmed {
            self.signal(Signal::PurgeUnconfirmed {
                set_id: key.set_id,
                domain: *domain,
            });
        }
    }

    async fn hop_all(&self) -> usize {
        let mut moved = 0;
        for set_id in self.placement.set_ids() {
            let Ok(fragments) = self.placement.locate(set_id).await else {
                continue;
            };
            for fragment in fragments {
                if !self.expiration.is_live(fragment.key, self.clock.now()) {
                    continue;
                }
                match self.hop(fragment.key).await {
                    Ok(_) => moved += 1,
                    Err(e) => debug!("Hop of {} skipped: {}", fragment.key, e),
                }
            }
        }
        moved
    }

    /// Move one fragment and keep persisted state and the detector in step
    /// with the outcome. A fragment that cannot be written elsewhere is
    /// purged, and a source copy that cannot be deleted is compromised.
    async fn hop(&self, key: FragmentKey) -> Result<FragmentRef> {
        match self.placement.rehome(key, &[]).await {
            Ok(moved) => {
                self.persist_location(&moved);
                Ok(moved)
            }
            Err(e @ Error::PurgeUnconfirmed { domain, .. }) => {
                error!("Hop of {} left a copy on {}: {}", key, domain, e);
                if let Ok(moved) = self.placement.locate_fragment(key).await {
                    self.persist_location(&moved);
                }
                self.signal(Signal::PurgeUnconfirmed {
                    set_id: key.set_id,
                    domain,
                });
                Err(e)
            }
            Err(e @ Error::HopFailed { .. }) => {
                warn!("{}, purging the fragment", e);
                match self.expiration.purge_now(key).await {
                    Ok(report) => self.on_purged(&report, true).await,
                    Err(Error::PurgeUnconfirmed { domain, .. }) => {
                        self.signal(Signal::PurgeUnconfirmed {
                            set_id: key.set_id,
                            domain,
                        });
                    }
                    Err(purge_err) => warn!("Purge of {} after failed hop: {}", key, purge_err),
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

async fn run_event_loop(
    inner: Arc<StoreInner>,
    mut events: mpsc::UnboundedReceiver<StoreEvent>,
    mut reports: mpsc::UnboundedReceiver<PurgeReport>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(event) = events.recv() => inner.handle_event(event).await,
            Some(report) = reports.recv() => {
                if report.late > 0 {
                    warn!(
                        "{} fragments purged past their grace period (worst {:?})",
                        report.late, report.max_latency
                    );
                }
                inner.on_purged(&report, false).await;
            }
            else => break,
        }
    }
    debug!("Event loop stopped");
}

async fn run_hop_scheduler(inner: Arc<StoreInner>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let moved = inner.hop_all().await;
                if moved > 0 {
                    debug!("Hop pass moved {} fragments", moved);
                }
            }
        }
    }
}

async fn run_health_checks(inner: Arc<StoreInner>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let recovered = inner.placement.recheck_unavailable().await;
                if !recovered.is_empty() {
                    info!("Domains back in the pool: {:?}", recovered);
                }
            }
        }
    }
}

async fn run_canary_rotation(inner: Arc<StoreInner>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let rotation = inner.canaries.rotate().await;
                for retired in rotation.retired {
                    if let Err(e) = inner.metadata.remove_canary(retired) {
                        warn!("Canary record {} not removed: {}", retired, e);
                    }
                }
                for token in rotation.deployed {
                    if let Err(e) = inner.metadata.put_canary(&token) {
                        warn!("Canary {} not persisted: {}", token.token_id, e);
                    }
                }
            }
        }
    }
}

async fn run_detector_ticks(inner: Arc<StoreInner>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last = inner.detector.state();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let state = inner.detector.tick();
                if state != last {
                    info!("Escalation state {} -> {}", last, state);
                    last = state;
                }
            }
        }
    }
}
