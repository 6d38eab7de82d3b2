//! Sled-backed storage domain
//!
//! Each domain owns one tree in a sled database. Deletes overwrite the value
//! with zeros and flush before removing it, so the purged bytes do not linger
//! in the most recent log segment.

use async_trait::async_trait;
use parking_lot::RwLock;
use sled::{Db, Tree};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::{AccessEvent, AccessKind, AccessObserver, StorageDomain};
use crate::error::{Error, Result};
use crate::types::{BlobId, DomainId};

/// Persistent storage domain
pub struct SledDomain {
    id: DomainId,
    tree: Tree,
    observer: RwLock<Option<Arc<dyn AccessObserver>>>,
}

impl SledDomain {
    /// Open (or create) the tree for domain `id` in `db`
    pub fn open(db: &Db, id: DomainId) -> Result<Self> {
        let tree = db.open_tree(format!("domain:{}", id.0))?;
        info!("Opened sled domain {} ({} blobs)", id, tree.len());
        Ok(SledDomain {
            id,
            tree,
            observer: RwLock::new(None),
        })
    }

    /// Open a temporary database holding `count` domains
    #[cfg(test)]
    pub(crate) fn temporary_pool(count: u16) -> Result<Vec<Arc<SledDomain>>> {
        let db = sled::Config::new().temporary(true).open()?;
        (0..count)
            .map(|i| SledDomain::open(&db, DomainId(i)).map(Arc::new))
            .collect()
    }

    /// Number of blobs held. Not reported as an access.
    pub fn blob_count(&self) -> usize {
        self.tree.len()
    }

    fn report(&self, blob: BlobId, kind: AccessKind, context: &str) {
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer.observe(&AccessEvent::new(blob, self.id, kind, context));
        }
    }

    fn map_err(&self, e: sled::Error) -> Error {
        Error::DomainUnavailable(self.id, e.to_string())
    }
}

#[async_trait]
impl StorageDomain for SledDomain {
    fn id(&self) -> DomainId {
        self.id
    }

    async fn put(&self, blob: BlobId, bytes: &[u8]) -> Result<()> {
        self.tree
            .insert(blob.as_bytes(), bytes)
            .map_err(|e| self.map_err(e))?;
        Ok(())
    }

    async fn get(&self, blob: BlobId, context: &str) -> Result<Option<Vec<u8>>> {
        let value = self
            .tree
            .get(blob.as_bytes())
            .map_err(|e| self.map_err(e))?;
        self.report(blob, AccessKind::Read, context);
        Ok(value.map(|v| v.to_vec()))
    }

    async fn contains(&self, blob: BlobId, context: &str) -> Result<bool> {
        let present = self
            .tree
            .contains_key(blob.as_bytes())
            .map_err(|e| self.map_err(e))?;
        self.report(blob, AccessKind::Contains, context);
        Ok(present)
    }

    async fn delete(&self, blob: BlobId) -> Result<bool> {
        let key = blob.as_bytes();
        let existing_len = match self.tree.get(key).map_err(|e| self.map_err(e))? {
            Some(v) => v.len(),
            None => return Ok(false),
        };

        self.tree
            .insert(key, vec![0u8; existing_len])
            .map_err(|e| self.map_err(e))?;
        self.tree
            .flush_async()
            .await
            .map_err(|e| self.map_err(e))?;
        self.tree.remove(key).map_err(|e| self.map_err(e))?;
        self.tree
            .flush_async()
            .await
            .map_err(|e| self.map_err(e))?;

        debug!("Domain {} purged blob {}", self.id, blob);
        Ok(true)
    }

    async fn scan(&self, context: &str) -> Result<Vec<BlobId>> {
        let mut keys = Vec::new();
        for key in self.tree.iter().keys() {
            let key = key.map_err(|e| self.map_err(e))?;
            let uuid = Uuid::from_slice(&key)
                .map_err(|e| Error::Deserialization(format!("bad blob key: {}", e)))?;
            keys.push(BlobId(uuid));
        }
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
    async fn test_sled_put_get_delete() {
        let pool = SledDomain::temporary_pool(2).unwrap();
        let domain = &pool[1];
        assert_eq!(domain.id(), DomainId(1));

        let blob = BlobId::new();
        domain.put(blob, b"persistent share").await.unwrap();
        assert_eq!(domain.blob_count(), 1);
        assert_eq!(
            domain.get(blob, "t").await.unwrap(),
            Some(b"persistent share".to_vec())
        );

        assert!(domain.delete(blob).await.unwrap());
        assert_eq!(domain.get(blob, "t").await.unwrap(), None);
        assert_eq!(domain.blob_count(), 0);
    }

    #[tokio::test]
    async fn test_sled_domains_are_isolated() {
        let pool = SledDomain::temporary_pool(2).unwrap();
        let blob = BlobId::new();
        pool[0].put(blob, b"only here").await.unwrap();
        assert!(pool[0].contains(blob, "t").await.unwrap());
        assert!(!pool[1].contains(blob, "t").await.unwrap());
    }

    #[tokio::test]
    async fn test_sled_scan_reports_keys() {
        let pool = SledDomain::temporary_pool(1).unwrap();
        let domain = &pool[0];
        let observer = Arc::new(RecordingObserver::default());
        domain.attach_observer(observer.clone());

        let a = BlobId::new();
        let b = BlobId::new();
        domain.put(a, b"a").await.unwrap();
        domain.put(b, b"b").await.unwrap();

        let mut keys = domain.scan("scanner").await.unwrap();
        keys.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(keys, expected);
        assert_eq!(observer.events.lock().len(), 2);
    }
}
