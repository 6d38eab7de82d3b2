//! Response coordinator
//!
//! Carries out escalation orders. Deadlines are tightened through the
//! expiration manager and fragments are moved through the placement
//! manager, so each resource keeps a single writer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{EscalationOrder, EscalationState};
use crate::clock::{Clock, MonoTime};
use crate::error::Error;
use crate::expiration::{ExpirationManager, PurgeReport};
use crate::placement::{FragmentRef, PlacementManager};
use crate::types::{DomainId, FragmentKey, SetId};

/// Escalation event published to subscribers and the alert sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyAlert {
    pub alert_id: Uuid,
    pub state: EscalationState,
    pub domains: Vec<DomainId>,
    pub sets: Vec<SetId>,
    pub reason: String,
    /// Fragments whose deadline was shortened
    pub tightened: usize,
    /// Fragments moved out of affected domains
    pub rehomed: usize,
    /// Sets destroyed as compromised
    pub purged_sets: Vec<SetId>,
    pub raised_at: DateTime<Utc>,
}

/// External receiver of escalation events
pub trait AlertSink: Send + Sync {
    fn deliver(&self, alert: &AnomalyAlert);
}

/// Sink that writes alerts to the log
#[derive(Debug, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn deliver(&self, alert: &AnomalyAlert) {
        warn!(
            alert_id = %alert.alert_id,
            domains = ?alert.domains,
            tightened = alert.tightened,
            rehomed = alert.rehomed,
            "Anomaly alert: {}",
            alert.reason
        );
    }
}

/// What an escalation changed
#[derive(Debug)]
pub struct EscalationOutcome {
    pub tightened: Vec<(FragmentKey, MonoTime)>,
    pub rehomed: Vec<FragmentRef>,
    pub purges: PurgeReport,
    pub alert: AnomalyAlert,
}

/// Executes escalation orders
pub struct ResponseCoordinator {
    clock: Arc<dyn Clock>,
    placement: Arc<PlacementManager>,
    expiration: Arc<ExpirationManager>,
    tighten_factor: f64,
    alerts: broadcast::Sender<AnomalyAlert>,
    sink: Arc<dyn AlertSink>,
}

impl ResponseCoordinator {
    pub fn new(
        clock: Arc<dyn Clock>,
        placement: Arc<PlacementManager>,
        expiration: Arc<ExpirationManager>,
        tighten_factor: f64,
        alert_buffer: usize,
        sink: Arc<dyn AlertSink>,
    ) -> Self {
        let (alerts, _) = broadcast::channel(alert_buffer.max(1));
        ResponseCoordinator {
            clock,
            placement,
            expiration,
            tighten_factor,
            alerts,
            sink,
        }
    }

    /// Stream of alerts raised from now on
    pub fn subscribe(&self) -> broadcast::Receiver<AnomalyAlert> {
        self.alerts.subscribe()
    }

    /// Carry out one order: purge compromised sets, tighten affected sets,
    /// move fragments out of affected domains, then publish the alert
    pub async fn execute(&self, order: &EscalationOrder) -> EscalationOutcome {
        let mut purges = PurgeReport::default();
        let mut purged_sets: BTreeSet<SetId> = BTreeSet::new();

        for set_id in &order.compromised {
            let report = self.expiration.purge_set(*set_id).await;
            purged_sets.extend(report.expired_sets.iter().copied());
            merge(&mut purges, report);
        }

        let mut affected: BTreeSet<SetId> = self
            .placement
            .sets_touching(&order.domains)
            .into_iter()
            .collect();
        affected.extend(order.sets.iter().copied());
        for set_id in &order.compromised {
            affected.remove(set_id);
        }

        let now = self.clock.now();
        let mut tightened = Vec::new();
        for set_id in &affected {
            tightened.extend(self.expiration.tighten_set(*set_id, now, self.tighten_factor));
        }
        debug!("Tightened {} fragments across {} sets", tightened.len(), affected.len());

        let mut rehomed = Vec::new();
        for fragment in self.placement.fragments_in(&order.domains).await {
            if !self.expiration.is_live(fragment.key, self.clock.now()) {
                continue;
            }
            match self.placement.rehome(fragment.key, &order.domains).await {
                Ok(moved) => rehomed.push(moved),
                Err(Error::PurgeUnconfirmed { key, domain, reason }) => {
                    error!(
                        "Fragment {} compromised on {} during escalation hop: {}",
                        key, domain, reason
                    );
                    purges.unconfirmed.push((key, domain));
                    let report = self.expiration.purge_set(key.set_id).await;
                    purged_sets.extend(report.expired_sets.iter().copied());
                    merge(&mut purges, report);
                }
                Err(Error::HopFailed { key, target, reason }) => {
                    // The fragment cannot leave a suspect domain, so it goes
                    warn!(
                        "Escalation hop of {} to {} failed ({}), purging it",
                        key, target, reason
                    );
                    match self.expiration.purge_now(key).await {
                        Ok(report) => merge(&mut purges, report),
                        Err(e) => {
                            error!("Purge of unmovable {} failed: {}", key, e);
                            purges.unconfirmed.push((key, fragment.domain));
                        }
                    }
                }
                Err(e) => warn!("Escalation hop of {} failed: {}", fragment.key, e),
            }
        }

        let alert = AnomalyAlert {
            alert_id: Uuid::new_v4(),
            state: EscalationState::Escalated,
            domains: order.domains.clone(),
            sets: affected.iter().copied().collect(),
            reason: order.reason.clone(),
            tightened: tightened.len(),
            rehomed: rehomed.len(),
            purged_sets: purged_sets.into_iter().collect(),
            raised_at: Utc::now(),
        };

        info!(
            "Escalation executed: {} tightened, {} rehomed, {} sets purged",
            alert.tightened,
            alert.rehomed,
            alert.purged_sets.len()
        );

        self.sink.deliver(&alert);
        if self.alerts.send(alert.clone()).is_err() {
            debug!("No alert subscribers");
        }

        EscalationOutcome {
            tightened,
            rehomed,
            purges,
            alert,
        }
    }
}

fn merge(into: &mut PurgeReport, other: PurgeReport) {
    into.purged.extend(other.purged);
    into.expired_sets.extend(other.expired_sets);
    into.unconfirmed.extend(other.unconfirmed);
    into.orphans_purged.extend(other.orphans_purged);
}
