//! Domain health monitoring
//!
//! Tracks the health status of each storage domain so placement can prefer
//! healthy domains and reconstruction can order its fetches.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::DomainId;

/// Default number of consecutive failures before marking a domain unavailable
pub const DEFAULT_MAX_FAILURES: u32 = 3;

/// Error rate threshold for degraded status (10%)
const DEGRADED_ERROR_RATE_THRESHOLD: f64 = 0.10;

/// Status of a single domain
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DomainStatus {
    /// Domain is healthy and available
    Healthy,
    /// Domain is degraded (high error rate but functional)
    Degraded,
    /// Domain is unavailable
    Unavailable,
}

/// Health information for a single domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainHealth {
    pub domain: DomainId,
    pub status: DomainStatus,
    /// Last successful operation timestamp (Unix seconds)
    pub last_success: Option<i64>,
    /// Last error message if any
    pub last_error: Option<String>,
    /// Consecutive failure count
    pub failure_count: u32,
    pub total_operations: u64,
    pub failed_operations: u64,
}

impl DomainHealth {
    /// Create new healthy domain record
    pub fn new(domain: DomainId) -> Self {
        Self {
            domain,
            status: DomainStatus::Healthy,
            last_success: None,
            last_error: None,
            failure_count: 0,
            total_operations: 0,
            failed_operations: 0,
        }
    }

    /// Calculate error rate
    pub fn error_rate(&self) -> f64 {
        if self.total_operations == 0 {
            return 0.0;
        }
        self.failed_operations as f64 / self.total_operations as f64
    }

    /// Whether placement and fetches may use this domain
    pub fn is_usable(&self) -> bool {
        self.status != DomainStatus::Unavailable
    }
}

/// Health tracker for the domain pool
pub struct HealthTracker {
    domains: RwLock<HashMap<DomainId, DomainHealth>>,
    max_failures_before_unavailable: u32,
}

impl HealthTracker {
    /// Create a tracker for the given domains
    pub fn new(domains: &[DomainId]) -> Self {
        Self::with_max_failures(domains, DEFAULT_MAX_FAILURES)
    }

    /// Create a tracker with a custom consecutive-failure threshold
    pub fn with_max_failures(domains: &[DomainId], max_failures: u32) -> Self {
        let map = domains
            .iter()
            .map(|&d| (d, DomainHealth::new(d)))
            .collect();

        Self {
            domains: RwLock::new(map),
            max_failures_before_unavailable: max_failures.max(1),
        }
    }

    fn now_unix_secs() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    /// Record a successful operation for a domain
    pub fn record_success(&self, domain: DomainId) {
        let mut domains = self.domains.write();
        if let Some(health) = domains.get_mut(&domain) {
            health.total_operations += 1;
            health.last_success = Some(Self::now_unix_secs());
            health.failure_count = 0;

            // A success proves the domain reachable again
            if health.error_rate() < DEGRADED_ERROR_RATE_THRESHOLD {
                health.status = DomainStatus::Healthy;
            } else {
                health.status = DomainStatus::Degraded;
            }
        }
    }

    /// Record a failed operation for a domain
    pub fn record_failure(&self, domain: DomainId, error: &str) {
        let mut domains = self.domains.write();
        if let Some(health) = domains.get_mut(&domain) {
            health.total_operations += 1;
            health.failed_operations += 1;
            health.failure_count += 1;
            health.last_error = Some(error.to_string());

            if health.failure_count >= self.max_failures_before_unavailable {
                health.status = DomainStatus::Unavailable;
            } else if health.error_rate() >= DEGRADED_ERROR_RATE_THRESHOLD {
                health.status = DomainStatus::Degraded;
            }
        }
    }

    /// Get health of a specific domain
    pub fn domain_health(&self, domain: DomainId) -> DomainHealth {
        self.domains
            .read()
            .get(&domain)
            .cloned()
            .unwrap_or_else(|| DomainHealth::new(domain))
    }

    pub fn status(&self, domain: DomainId) -> DomainStatus {
        self.domain_health(domain).status
    }

    /// Snapshot of every tracked domain, sorted by ID
    pub fn all(&self) -> Vec<DomainHealth> {
        let mut all: Vec<DomainHealth> = self.domains.read().values().cloned().collect();
        all.sort_by_key(|h| h.domain);
        all
    }

    /// Domains that are not unavailable
    pub fn usable_domains(&self) -> Vec<DomainId> {
        let mut usable: Vec<DomainId> = self
            .domains
            .read()
            .values()
            .filter(|h| h.is_usable())
            .map(|h| h.domain)
            .collect();
        usable.sort();
        usable
    }

    /// Domains currently marked unavailable, sorted
    pub fn unavailable_domains(&self) -> Vec<DomainId> {
        let mut down: Vec<DomainId> = self
            .domains
            .read()
            .values()
            .filter(|h| !h.is_usable())
            .map(|h| h.domain)
            .collect();
        down.sort();
        down
    }

    /// Rank for fetch ordering: healthy first, then degraded, then unavailable
    pub fn rank(&self, domain: DomainId) -> u8 {
        match self.status(domain) {
            DomainStatus::Healthy => 0,
            DomainStatus::Degraded => 1,
            DomainStatus::Unavailable => 2,
        }
    }

    /// Forget a domain's failure history once it answers a health check again
    pub fn reset_failures(&self, domain: DomainId) {
        let mut domains = self.domains.write();
        if let Some(health) = domains.get_mut(&domain) {
            health.failure_count = 0;
            health.failed_operations = 0;
            health.last_error = None;
            health.status = DomainStatus::Healthy;
        }
    }
}
