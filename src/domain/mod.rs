//! Storage domains
//!
//! A domain is an independent backend that holds opaque blobs. It knows
//! nothing about fragmentation policy: it stores bytes under a [`BlobId`],
//! returns them, and overwrites them on delete. Domains report every read,
//! existence check and enumeration to an attached [`AccessObserver`].

pub mod health;
pub mod memory;
pub mod sled_backend;

pub use health::{DomainHealth, DomainStatus, HealthTracker};
pub use memory::MemoryDomain;
pub use sled_backend::SledDomain;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::types::{BlobId, DomainId};

/// Source context used by the store for its own reads
pub const INTERNAL_CONTEXT: &str = "internal";

/// Kind of access a domain observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessKind {
    /// Blob bytes were read
    Read,
    /// Blob existence was checked
    Contains,
    /// Blob key was listed by an enumeration of the domain
    BulkScan,
}

/// Observation emitted by a storage domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessEvent {
    /// Blob that was touched (a fragment or a canary token)
    pub subject: BlobId,
    /// Domain that observed the access
    pub domain: DomainId,
    pub observed_at: DateTime<Utc>,
    pub kind: AccessKind,
    /// Opaque origin of the access (e.g. originating channel)
    pub source_context: String,
}

impl AccessEvent {
    pub fn new(subject: BlobId, domain: DomainId, kind: AccessKind, source_context: &str) -> Self {
        AccessEvent {
            subject,
            domain,
            observed_at: Utc::now(),
            kind,
            source_context: source_context.to_string(),
        }
    }

    /// Whether the access came from the store itself
    pub fn is_internal(&self) -> bool {
        self.source_context == INTERNAL_CONTEXT
    }
}

/// Receiver of domain access events
pub trait AccessObserver: Send + Sync {
    fn observe(&self, event: &AccessEvent);
}

/// Backend holding fragment and decoy blobs
#[async_trait]
pub trait StorageDomain: Send + Sync {
    /// Domain identifier
    fn id(&self) -> DomainId;

    /// Store bytes under `blob`, replacing any previous value
    async fn put(&self, blob: BlobId, bytes: &[u8]) -> Result<()>;

    /// Read the bytes stored under `blob`
    async fn get(&self, blob: BlobId, context: &str) -> Result<Option<Vec<u8>>>;

    /// Check whether `blob` exists without reading it
    async fn contains(&self, blob: BlobId, context: &str) -> Result<bool>;

    /// Overwrite and remove `blob`. Returns whether it existed.
    async fn delete(&self, blob: BlobId) -> Result<bool>;

    /// Enumerate every blob key held by the domain
    async fn scan(&self, context: &str) -> Result<Vec<BlobId>>;

    /// Attach the observer that receives this domain's access events
    fn attach_observer(&self, observer: Arc<dyn AccessObserver>);
}

/// Shared handle to a domain
pub type DomainRef = Arc<dyn StorageDomain>;

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Observer that records every event it sees
    #[derive(Default)]
    pub struct RecordingObserver {
        pub events: Mutex<Vec<AccessEvent>>,
    }

    impl AccessObserver for RecordingObserver {
        fn observe(&self, event: &AccessEvent) {
            self.events.lock().push(event.clone());
        }
    }
}
