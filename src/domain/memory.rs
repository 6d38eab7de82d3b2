//! In-process storage domain
//!
//! Holds blobs in memory. Supports failure injection so tests can take a
//! domain offline or make its deletes unconfirmable.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use zeroize::Zeroize;

use super::{AccessEvent, AccessKind, AccessObserver, StorageDomain};
use crate::error::{Error, Result};
use crate::types::{BlobId, DomainId};

/// Memory-backed storage domain
pub struct MemoryDomain {
    id: DomainId,
    blobs: RwLock<HashMap<BlobId, Vec<u8>>>,
    available: AtomicBool,
    fail_deletes: AtomicBool,
    /// Artificial read latency in microseconds
    read_latency_us: AtomicU64,
    reads: AtomicU64,
    observer: RwLock<Option<Arc<dyn AccessObserver>>>,
}

impl MemoryDomain {
    pub fn new(id: DomainId) -> Self {
        MemoryDomain {
            id,
            blobs: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            fail_deletes: AtomicBool::new(false),
            read_latency_us: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            observer: RwLock::new(None),
        }
    }

    /// Build `count` domains with IDs 0..count
    pub fn pool(count: u16) -> Vec<Arc<MemoryDomain>> {
        (0..count)
            .map(|i| Arc::new(MemoryDomain::new(DomainId(i))))
            .collect()
    }

    /// Take the domain online or offline
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make subsequent deletes fail (the purge cannot be confirmed)
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Delay every read by `latency`
    pub fn set_read_latency(&self, latency: Duration) {
        self.read_latency_us
            .store(latency.as_micros() as u64, Ordering::SeqCst);
    }

    /// Number of blobs held. Not reported as an access.
    pub fn blob_count(&self) -> usize {
        self.blobs.read().len()
    }

    /// Completed blob reads, of any context
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Whether `blob` is held. Not reported as an access.
    pub fn holds(&self, blob: BlobId) -> bool {
        self.blobs.read().contains_key(&blob)
    }

    /// Overwrite a blob's bytes in place without reporting it (tamper simulation)
    pub fn corrupt(&self, blob: BlobId) -> bool {
        match self.blobs.write().get_mut(&blob) {
            Some(bytes) if !bytes.is_empty() => {
                bytes[0] ^= 0xff;
                true
            }
            _ => false,
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::DomainUnavailable(self.id, "domain offline".to_string()))
        }
    }

    fn report(&self, blob: BlobId, kind: AccessKind, context: &str) {
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer.observe(&AccessEvent::new(blob, self.id, kind, context));
        }
    }
}

#[async_trait]
impl StorageDomain for MemoryDomain {
    fn id(&self) -> DomainId {
        self.id
    }

    async fn put(&self, blob: BlobId, bytes: &[u8]) -> Result<()> {
        self.check_available()?;
        let previous = self.blobs.write().insert(blob, bytes.to_vec());
        if let Some(mut old) = previous {
            old.zeroize();
        }
        Ok(())
    }

    async fn get(&self, blob: BlobId, context: &str) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        let latency = self.read_latency_us.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_micros(latency)).await;
            self.check_available()?;
        }
        let bytes = self.blobs.read().get(&blob).cloned();
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.report(blob, AccessKind::Read, context);
        Ok(bytes)
    }

    async fn contains(&self, blob: BlobId, context: &str) -> Result<bool> {
        self.check_available()?;
        let present = self.blobs.read().contains_key(&blob);
        self.report(blob, AccessKind::Contains, context);
        Ok(present)
    }

    async fn delete(&self, blob: BlobId) -> Result<bool> {
        self.check_available()?;
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Error::DomainUnavailable(
                self.id,
                "delete not acknowledged".to_string(),
            ));
        }
        let removed = self.blobs.write().remove(&blob);
        match removed {
            Some(mut bytes) => {
                bytes.zeroize();
                debug!("Domain {} purged blob {}", self.id, blob);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn scan(&self, context: &str) -> Result<Vec<BlobId>> {
        self.check_available()?;
        let keys: Vec<BlobId> = self.blobs.read().keys().copied().collect();
        for key in &keys {
            self.report(*key, AccessKind::BulkScan, context);
        }
        Ok(keys)
    }

    fn attach_observer(&self, observer: Arc<dyn AccessObserver>) {
        *self.observer.write() = Some(observer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::testing::RecordingObserver;

    #[tokio::test]
    async fn test_put_get_delete() {
        let domain = MemoryDomain::new(DomainId(1));
        let blob = BlobId::new();

        domain.put(blob, b"share bytes").await.unwrap();
        assert_eq!(domain.get(blob, "t").await.unwrap(), Some(b"share bytes".to_vec()));
        assert!(domain.delete(blob).await.unwrap());
        assert_eq!(domain.get(blob, "t").await.unwrap(), None);
        assert!(!domain.delete(blob).await.unwrap());
    }

    #[tokio::test]
    async fn test_offline_domain_errors() {
        let domain = MemoryDomain::new(DomainId(2));
        let blob = BlobId::new();
        domain.put(blob, b"x").await.unwrap();

        domain.set_available(false);
        assert!(matches!(
            domain.get(blob, "t").await,
            Err(Error::DomainUnavailable(DomainId(2), _))
        ));
        assert!(domain.put(BlobId::new(), b"y").await.is_err());

        domain.set_available(true);
        assert!(domain.get(blob, "t").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_blob() {
        let domain = MemoryDomain::new(DomainId(0));
        let blob = BlobId::new();
        domain.put(blob, b"x").await.unwrap();
        domain.set_fail_deletes(true);
        assert!(domain.delete(blob).await.is_err());
        assert!(domain.holds(blob));
    }

    #[tokio::test]
    async fn test_accesses_are_reported() {
        let domain = MemoryDomain::new(DomainId(3));
        let observer = Arc::new(RecordingObserver::default());
        domain.attach_observer(observer.clone());

        let a = BlobId::new();
        let b = BlobId::new();
        domain.put(a, b"a").await.unwrap();
        domain.put(b, b"b").await.unwrap();

        domain.get(a, "reader").await.unwrap();
        domain.contains(b, "checker").await.unwrap();
        let listed = domain.scan("scanner").await.unwrap();
        assert_eq!(listed.len(), 2);

        let events = observer.events.lock();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].kind, AccessKind::Read);
        assert_eq!(events[0].source_context, "reader");
        assert_eq!(events[1].kind, AccessKind::Contains);
        assert!(events[2..].iter().all(|e| e.kind == AccessKind::BulkScan));
        assert!(events.iter().all(|e| e.domain == DomainId(3)));
    }

    #[tokio::test]
    async fn test_writes_and_deletes_are_not_reported() {
        let domain = MemoryDomain::new(DomainId(4));
        let observer = Arc::new(RecordingObserver::default());
        domain.attach_observer(observer.clone());

        let blob = BlobId::new();
        domain.put(blob, b"z").await.unwrap();
        domain.delete(blob).await.unwrap();
        assert!(observer.events.lock().is_empty());
    }

    #[test]
    fn test_pool_ids() {
        let pool = MemoryDomain::pool(4);
        let ids: Vec<DomainId> = pool.iter().map(|d| d.id()).collect();
        assert_eq!(ids, vec![DomainId(0), DomainId(1), DomainId(2), DomainId(3)]);
    }
}
