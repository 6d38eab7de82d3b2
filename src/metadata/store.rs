//! Sled-based metadata store

use sled::{Db, Tree};
use std::path::Path;
use tracing::{debug, info};

use super::SetRecord;
use crate::canary::CanaryToken;
use crate::error::Result;
use crate::types::{SetId, TokenId};

const SETS_TREE: &str = "sets";
const CANARIES_TREE: &str = "canaries";

/// Set records and canary tokens keyed by ID, bincode encoded
pub struct MetadataStore {
    db: Db,
    sets: Tree,
    canaries: Tree,
}

impl MetadataStore {
    /// Open or create a metadata store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        Self::with_db(db)
    }

    /// Use an already opened database
    pub fn with_db(db: Db) -> Result<Self> {
        let sets = db.open_tree(SETS_TREE)?;
        let canaries = db.open_tree(CANARIES_TREE)?;
        info!(
            "Metadata store opened, {} set records, {} canaries",
            sets.len(),
            canaries.len()
        );
        Ok(MetadataStore { db, sets, canaries })
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db)
    }

    /// The underlying database
    pub fn db(&self) -> &Db {
        &self.db
    }

    fn key(set_id: SetId) -> [u8; 16] {
        *set_id.0.as_bytes()
    }

    /// Insert or replace a set record
    pub fn put_set(&self, record: &SetRecord) -> Result<()> {
        let data = bincode::serialize(record)?;
        self.sets.insert(Self::key(record.set_id), data)?;
        debug!("Saved set record {}", record.set_id);
        Ok(())
    }

    pub fn get_set(&self, set_id: SetId) -> Result<Option<SetRecord>> {
        match self.sets.get(Self::key(set_id))? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    /// Apply `f` to a stored record. Returns false if the set is unknown.
    pub fn update_set<F>(&self, set_id: SetId, f: F) -> Result<bool>
    where
        F: FnOnce(&mut SetRecord),
    {
        let Some(mut record) = self.get_set(set_id)? else {
            return Ok(false);
        };
        f(&mut record);
        self.put_set(&record)?;
        Ok(true)
    }

    pub fn remove_set(&self, set_id: SetId) -> Result<bool> {
        let removed = self.sets.remove(Self::key(set_id))?.is_some();
        if removed {
            debug!("Removed set record {}", set_id);
        }
        Ok(removed)
    }

    /// Every stored record
    pub fn list_sets(&self) -> Result<Vec<SetRecord>> {
        let mut records = Vec::new();
        for item in self.sets.iter() {
            let (_, data) = item?;
            records.push(bincode::deserialize(&data)?);
        }
        Ok(records)
    }

    pub fn put_canary(&self, token: &CanaryToken) -> Result<()> {
        let data = bincode::serialize(token)?;
        self.canaries.insert(token.token_id.0.as_bytes(), data)?;
        Ok(())
    }

    pub fn remove_canary(&self, token_id: TokenId) -> Result<()> {
        self.canaries.remove(token_id.0.as_bytes())?;
        Ok(())
    }

    pub fn list_canaries(&self) -> Result<Vec<CanaryToken>> {
        let mut tokens = Vec::new();
        for item in self.canaries.iter() {
            let (_, data) = item?;
            tokens.push(bincode::deserialize(&data)?);
        }
        Ok(tokens)
    }

    /// Number of set records
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
