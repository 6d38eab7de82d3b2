//! Persisted state
//!
//! Only what is needed to resume liveness tracking after a restart is
//! persisted: set parameters, fingerprints and fragment locations. Share
//! bytes never leave the storage domains. The audit log records lifecycle
//! events for post-incident review.

mod audit;
mod store;

pub use audit::{AuditEntry, AuditEvent, AuditLog};
pub use store::MetadataStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::Fingerprint;
use crate::policy::SensitivityTier;
use crate::types::{BlobId, DomainId, SetId};

/// Persisted location and deadline of one fragment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentMeta {
    pub index: u8,
    pub domain: DomainId,
    pub blob: BlobId,
    pub valid_until: DateTime<Utc>,
    pub share_checksum: [u8; 32],
    pub generation: u64,
}

/// Persisted description of a fragment set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetRecord {
    pub set_id: SetId,
    pub threshold: usize,
    pub total: usize,
    pub share_len: usize,
    pub tier: Option<SensitivityTier>,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub fingerprint: Fingerprint,
    pub fragments: Vec<FragmentMeta>,
}

impl SetRecord {
    /// Whether the set deadline has passed at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }

    pub fn fragment_mut(&mut self, index: u8) -> Option<&mut FragmentMeta> {
        self.fragments.iter_mut().find(|f| f.index == index)
    }
}
