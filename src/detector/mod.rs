//! Anomaly detector
//!
//! Classifies canary trips, reconstruction outcomes and integrity failures
//! and drives the escalation state machine:
//!
//! ```text
//! Normal --signal--> Suspected --independent signal--> Escalated --cooldown--> Normal
//!                        |                                  ^
//!                        +--- evidence ages out ---> Normal |
//!                                                           +-- further signals extend the cooldown
//! ```
//!
//! The detector never acts on fragments itself. Escalating produces an
//! [`EscalationOrder`] that the [`ResponseCoordinator`] carries out through
//! the expiration and placement managers.

pub mod response;
pub mod window;

pub use response::{AlertSink, AnomalyAlert, EscalationOutcome, LogAlertSink, ResponseCoordinator};
pub use window::FailureWindow;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{Clock, MonoTime};
use crate::config::DetectorConfig;
use crate::types::{DomainId, SetId, TokenId};

/// Escalation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationState {
    Normal,
    Suspected,
    Escalated,
}

impl fmt::Display for EscalationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationState::Normal => write!(f, "normal"),
            EscalationState::Suspected => write!(f, "suspected"),
            EscalationState::Escalated => write!(f, "escalated"),
        }
    }
}

/// Input to the detector
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// A canary token was accessed beyond its allowance
    CanaryAccess { token: TokenId, domain: DomainId },
    /// A reconstruction finished
    ReconstructionOutcome { set_id: SetId, success: bool },
    /// Share bytes or a decoded payload failed an integrity check
    Tamper { set_id: SetId, domain: Option<DomainId> },
    /// A domain did not acknowledge a purge; the fragment is compromised
    PurgeUnconfirmed { set_id: SetId, domain: DomainId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvidenceKind {
    Canary,
    ReconstructionAnomaly,
    Tamper,
}

#[derive(Debug, Clone)]
struct Evidence {
    kind: EvidenceKind,
    domain: Option<DomainId>,
    set_id: Option<SetId>,
    at: MonoTime,
    description: String,
}

impl Evidence {
    /// Whether two pieces of evidence corroborate each other.
    ///
    /// Canaries in the same domain are one bulk access, not two; a tamper
    /// signal usually causes the reconstruction failures that accompany it.
    fn independent_of(&self, other: &Evidence) -> bool {
        use EvidenceKind::*;
        match (self.kind, other.kind) {
            (Canary, Canary) | (Tamper, Tamper) => match (self.domain, other.domain) {
                (Some(a), Some(b)) => a != b,
                _ => false,
            },
            (Canary, _) | (_, Canary) => true,
            _ => false,
        }
    }
}

/// Instruction to the response coordinator
#[derive(Debug, Clone, PartialEq)]
pub struct EscalationOrder {
    /// Domains whose fragments must be tightened and moved
    pub domains: Vec<DomainId>,
    /// Sets implicated directly (integrity failures, unconfirmed purges)
    pub sets: Vec<SetId>,
    /// Sets to purge outright
    pub compromised: Vec<SetId>,
    pub reason: String,
    pub issued_at: MonoTime,
}

struct DetectorState {
    state: EscalationState,
    evidence: VecDeque<Evidence>,
    failures: FailureWindow,
    /// Time of the last signal while escalated
    last_signal: MonoTime,
    escalated_domains: BTreeSet<DomainId>,
    escalated_sets: BTreeSet<SetId>,
}

/// Escalation state machine
pub struct AnomalyDetector {
    clock: Arc<dyn Clock>,
    config: DetectorConfig,
    inner: Mutex<DetectorState>,
}

impl AnomalyDetector {
    pub fn new(clock: Arc<dyn Clock>, config: DetectorConfig) -> Self {
        let failures = FailureWindow::new(
            Duration::from_millis(config.failure_window_ms),
            config.failure_rate_threshold,
            config.failure_min_samples,
        );
        AnomalyDetector {
            clock,
            config,
            inner: Mutex::new(DetectorState {
                state: EscalationState::Normal,
                evidence: VecDeque::new(),
                failures,
                last_signal: MonoTime::ZERO,
                escalated_domains: BTreeSet::new(),
                escalated_sets: BTreeSet::new(),
            }),
        }
    }

    fn correlation_window(&self) -> Duration {
        Duration::from_millis(self.config.correlation_window_ms)
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(self.config.cooldown_ms)
    }

    /// Current state, after applying any due decay or cooldown
    pub fn state(&self) -> EscalationState {
        self.tick()
    }

    /// Apply time-based transitions
    pub fn tick(&self) -> EscalationState {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.tick_locked(&mut inner, now);
        inner.state
    }

    fn tick_locked(&self, inner: &mut DetectorState, now: MonoTime) {
        let window = self.correlation_window();
        while let Some(oldest) = inner.evidence.front() {
            if now.saturating_since(oldest.at) > window {
                inner.evidence.pop_front();
            } else {
                break;
            }
        }

        match inner.state {
            EscalationState::Suspected if inner.evidence.is_empty() => {
                info!("Suspicion cleared without corroboration, back to normal");
                inner.state = EscalationState::Normal;
            }
            EscalationState::Escalated if now.saturating_since(inner.last_signal) >= self.cooldown() => {
                info!(
                    "Cooldown elapsed, leaving escalation ({} domains were affected)",
                    inner.escalated_domains.len()
                );
                inner.state = EscalationState::Normal;
                inner.evidence.clear();
                inner.escalated_domains.clear();
                inner.escalated_sets.clear();
            }
            _ => {}
        }
    }

    fn classify(&self, inner: &mut DetectorState, signal: &Signal, now: MonoTime) -> Option<Evidence> {
        match signal {
            Signal::CanaryAccess { token, domain } => Some(Evidence {
                kind: EvidenceKind::Canary,
                domain: Some(*domain),
                set_id: None,
                at: now,
                description: format!("canary {} accessed in {}", token, domain),
            }),
            Signal::ReconstructionOutcome { set_id, success } => {
                inner.failures.record(now, *success);
                if !*success && inner.failures.is_anomalous(now) {
                    Some(Evidence {
                        kind: EvidenceKind::ReconstructionAnomaly,
                        domain: None,
                        set_id: Some(*set_id),
                        at: now,
                        description: format!(
                            "reconstruction failure rate {:.0}%",
                            inner.failures.failure_rate(now) * 100.0
                        ),
                    })
                } else {
                    None
                }
            }
            Signal::Tamper { set_id, domain } => Some(Evidence {
                kind: EvidenceKind::Tamper,
                domain: *domain,
                set_id: Some(*set_id),
                at: now,
                description: match domain {
                    Some(d) => format!("integrity failure on {} for set {}", d, set_id),
                    None => format!("fingerprint mismatch for set {}", set_id),
                },
            }),
            Signal::PurgeUnconfirmed { set_id, domain } => Some(Evidence {
                kind: EvidenceKind::Tamper,
                domain: Some(*domain),
                set_id: Some(*set_id),
                at: now,
                description: format!("purge unconfirmed on {} for set {}", domain, set_id),
            }),
        }
    }

    /// Feed one signal; returns an order when the signal escalates or
    /// widens an escalation
    pub fn observe(&self, signal: Signal) -> Option<EscalationOrder> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.tick_locked(&mut inner, now);

        let compromised = match &signal {
            Signal::PurgeUnconfirmed { set_id, .. } => Some(*set_id),
            _ => None,
        };
        let evidence = self.classify(&mut inner, &signal, now)?;
        debug!("Detector evidence: {}", evidence.description);

        // A compromised fragment is confirmed, not statistical: escalate at once
        if let Some(set_id) = compromised {
            if inner.state == EscalationState::Escalated && inner.escalated_sets.contains(&set_id) {
                inner.last_signal = now;
                return None;
            }
            return Some(self.escalate(&mut inner, vec![evidence], vec![set_id], now));
        }

        match inner.state {
            EscalationState::Normal => {
                warn!("Suspected intrusion: {}", evidence.description);
                inner.state = EscalationState::Suspected;
                inner.evidence.push_back(evidence);
                None
            }
            EscalationState::Suspected => {
                let corroborating: Vec<Evidence> = inner
                    .evidence
                    .iter()
                    .filter(|e| e.independent_of(&evidence))
                    .cloned()
                    .collect();
                if corroborating.is_empty() {
                    inner.evidence.push_back(evidence);
                    return None;
                }
                let mut all = corroborating;
                all.push(evidence);
                Some(self.escalate(&mut inner, all, Vec::new(), now))
            }
            EscalationState::Escalated => {
                inner.last_signal = now;
                let new_domain = evidence
                    .domain
                    .filter(|d| !inner.escalated_domains.contains(d));
                let new_set = evidence
                    .set_id
                    .filter(|s| !inner.escalated_sets.contains(s));
                inner.evidence.push_back(evidence.clone());
                if new_domain.is_none() && new_set.is_none() {
                    debug!("Escalation cooldown extended");
                    return None;
                }
                Some(self.escalate(&mut inner, vec![evidence], Vec::new(), now))
            }
        }
    }

    fn escalate(
        &self,
        inner: &mut DetectorState,
        evidence: Vec<Evidence>,
        compromised: Vec<SetId>,
        now: MonoTime,
    ) -> EscalationOrder {
        let domains: BTreeSet<DomainId> = evidence.iter().filter_map(|e| e.domain).collect();
        let sets: BTreeSet<SetId> = evidence.iter().filter_map(|e| e.set_id).collect();
        let reason = evidence
            .iter()
            .map(|e| e.description.as_str())
            .collect::<Vec<_>>()
            .join("; ");

        if inner.state != EscalationState::Escalated {
            warn!("ESCALATED: {}", reason);
        } else {
            warn!("Escalation widened: {}", reason);
        }

        inner.state = EscalationState::Escalated;
        inner.last_signal = now;
        inner.escalated_domains.extend(domains.iter().copied());
        inner.escalated_sets.extend(sets.iter().copied());
        for e in evidence {
            inner.evidence.push_back(e);
        }

        EscalationOrder {
            domains: domains.into_iter().collect(),
            sets: sets.into_iter().collect(),
            compromised,
            reason,
            issued_at: now,
        }
    }

    /// Domains named in the current escalation
    pub fn escalated_domains(&self) -> Vec<DomainId> {
        self.inner.lock().escalated_domains.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn detector() -> (Arc<ManualClock>, AnomalyDetector) {
        let clock = Arc::new(ManualClock::new());
        let detector = AnomalyDetector::new(clock.clone(), DetectorConfig::default());
        (clock, detector)
    }

    fn canary(domain: u16) -> Signal {
        Signal::CanaryAccess {
            token: TokenId::new(),
            domain: DomainId(domain),
        }
    }

    fn failure(set_id: SetId) -> Signal {
        Signal::ReconstructionOutcome {
            set_id,
            success: false,
        }
    }

    #[test]
    fn test_single_canary_is_only_suspected() {
        let (_clock, detector) = detector();
        assert_eq!(detector.state(), EscalationState::Normal);
        assert!(detector.observe(canary(1)).is_none());
        assert_eq!(detector.state(), EscalationState::Suspected);
    }

    #[test]
    fn test_same_domain_canaries_do_not_escalate() {
        let (_clock, detector) = detector();
        assert!(detector.observe(canary(1)).is_none());
        assert!(detector.observe(canary(1)).is_none());
        assert!(detector.observe(canary(1)).is_none());
        assert_eq!(detector.state(), EscalationState::Suspected);
    }

    #[test]
    fn test_two_domains_escalate() {
        let (clock, detector) = detector();
        detector.observe(canary(1));
        clock.advance(Duration::from_millis(30));
        let order = detector.observe(canary(2)).unwrap();

        assert_eq!(detector.state(), EscalationState::Escalated);
        assert_eq!(order.domains, vec![DomainId(1), DomainId(2)]);
        assert!(order.compromised.is_empty());
    }

    #[test]
    fn test_uncorroborated_suspicion_decays() {
        let (clock, detector) = detector();
        detector.observe(canary(1));
        clock.advance(Duration::from_millis(DetectorConfig::default().correlation_window_ms + 1));
        assert_eq!(detector.state(), EscalationState::Normal);

        // A later signal in another domain starts over
        assert!(detector.observe(canary(2)).is_none());
        assert_eq!(detector.state(), EscalationState::Suspected);
    }

    #[test]
    fn test_failure_rate_alone_only_suspects() {
        let (_clock, detector) = detector();
        let set_id = SetId::new();
        for _ in 0..3 {
            assert!(detector.observe(failure(set_id)).is_none());
        }
        assert_eq!(detector.state(), EscalationState::Normal);
        // Fourth failure reaches the minimum sample count
        assert!(detector.observe(failure(set_id)).is_none());
        assert_eq!(detector.state(), EscalationState::Suspected);
        assert!(detector.observe(failure(set_id)).is_none());
        assert_eq!(detector.state(), EscalationState::Suspected);
    }

    #[test]
    fn test_canary_plus_reconstruction_anomaly_escalates() {
        let (_clock, detector) = detector();
        let set_id = SetId::new();
        for _ in 0..4 {
            detector.observe(failure(set_id));
        }
        let order = detector.observe(canary(3)).unwrap();
        assert_eq!(order.domains, vec![DomainId(3)]);
        assert_eq!(order.sets, vec![set_id]);
    }

    #[test]
    fn test_successes_keep_rate_low() {
        let (_clock, detector) = detector();
        let set_id = SetId::new();
        for _ in 0..6 {
            detector.observe(Signal::ReconstructionOutcome {
                set_id,
                success: true,
            });
        }
        detector.observe(failure(set_id));
        assert_eq!(detector.state(), EscalationState::Normal);
    }

    #[test]
    fn test_purge_unconfirmed_escalates_immediately() {
        let (_clock, detector) = detector();
        let set_id = SetId::new();
        let order = detector
            .observe(Signal::PurgeUnconfirmed {
                set_id,
                domain: DomainId(4),
            })
            .unwrap();
        assert_eq!(detector.state(), EscalationState::Escalated);
        assert_eq!(order.compromised, vec![set_id]);
        assert_eq!(order.domains, vec![DomainId(4)]);

        // Retried purges of the same set do not re-issue orders
        assert!(detector
            .observe(Signal::PurgeUnconfirmed {
                set_id,
                domain: DomainId(4),
            })
            .is_none());
    }

    #[test]
    fn test_cooldown_returns_to_normal() {
        let (clock, detector) = detector();
        detector.observe(canary(1));
        detector.observe(canary(2)).unwrap();

        let cooldown = Duration::from_millis(DetectorConfig::default().cooldown_ms);
        clock.advance(cooldown / 2);
        // Known domain: extends the cooldown without a new order
        assert!(detector.observe(canary(1)).is_none());
        clock.advance(cooldown / 2);
        assert_eq!(detector.state(), EscalationState::Escalated);

        clock.advance(cooldown);
        assert_eq!(detector.state(), EscalationState::Normal);
        assert!(detector.escalated_domains().is_empty());
    }

    #[test]
    fn test_new_domain_widens_escalation() {
        let (_clock, detector) = detector();
        detector.observe(canary(1));
        detector.observe(canary(2)).unwrap();
        let order = detector.observe(canary(5)).unwrap();
        assert_eq!(order.domains, vec![DomainId(5)]);
        assert_eq!(
            detector.escalated_domains(),
            vec![DomainId(1), DomainId(2), DomainId(5)]
        );
    }

    #[test]
    fn test_tamper_then_failures_are_not_independent() {
        let (_clock, detector) = detector();
        let set_id = SetId::new();
        detector.observe(Signal::Tamper {
            set_id,
            domain: Some(DomainId(0)),
        });
        for _ in 0..4 {
            detector.observe(failure(set_id));
        }
        assert_eq!(detector.state(), EscalationState::Suspected);
    }
}
