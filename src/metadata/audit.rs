//! Append-only audit log

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use uuid::Uuid;

use crate::error::Result;
use crate::types::{DomainId, SetId, TokenId};

const AUDIT_TREE: &str = "audit";

/// Audited lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    Created {
        set_id: SetId,
        total: usize,
        threshold: usize,
        lifetime_ms: u64,
    },
    Reconstructed {
        set_id: SetId,
    },
    ReconstructFailed {
        set_id: SetId,
        error: String,
    },
    CanaryTripped {
        token_id: TokenId,
        domain: DomainId,
        source_context: String,
    },
    Escalated {
        alert_id: Uuid,
        domains: Vec<DomainId>,
        reason: String,
        tightened: usize,
        rehomed: usize,
    },
    Purged {
        set_id: SetId,
        early: bool,
    },
}

impl AuditEvent {
    /// Set the event concerns, if any
    pub fn set_id(&self) -> Option<SetId> {
        match self {
            AuditEvent::Created { set_id, .. }
            | AuditEvent::Reconstructed { set_id }
            | AuditEvent::ReconstructFailed { set_id, .. }
            | AuditEvent::Purged { set_id, .. } => Some(*set_id),
            _ => None,
        }
    }
}

/// One audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: AuditEvent,
}

/// Audit log in a sled tree. Keys come from `generate_id`, so iteration
/// order is append order.
pub struct AuditLog {
    db: Db,
    tree: Tree,
}

impl AuditLog {
    pub fn with_db(db: Db) -> Result<Self> {
        let tree = db.open_tree(AUDIT_TREE)?;
        Ok(AuditLog { db, tree })
    }

    /// Create an in-memory log (for testing)
    pub fn in_memory() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db)
    }

    /// Append an event, returning its entry ID
    pub fn append(&self, event: AuditEvent) -> Result<u64> {
        let id = self.db.generate_id()?;
        let entry = AuditEntry {
            id,
            at: Utc::now(),
            event,
        };
        let data = serde_json::to_vec(&entry)?;
        self.tree.insert(id.to_be_bytes(), data)?;
        Ok(id)
    }

    /// Every entry in append order
    pub fn entries(&self) -> Result<Vec<AuditEntry>> {
        let mut entries = Vec::new();
        for item in self.tree.iter() {
            let (_, data) = item?;
            entries.push(serde_json::from_slice(&data)?);
        }
        Ok(entries)
    }

    /// Entries about one set
    pub fn entries_for(&self, set_id: SetId) -> Result<Vec<AuditEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.event.set_id() == Some(set_id))
            .collect())
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_in_order() {
        let log = AuditLog::in_memory().unwrap();
        let set_id = SetId::new();
        log.append(AuditEvent::Created {
            set_id,
            total: 7,
            threshold: 4,
            lifetime_ms: 100,
        })
        .unwrap();
        log.append(AuditEvent::Reconstructed { set_id }).unwrap();
        log.append(AuditEvent::Purged {
            set_id,
            early: false,
        })
        .unwrap();

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.windows(2).all(|w| w[0].id < w[1].id));
        assert!(matches!(entries[0].event, AuditEvent::Created { total: 7, .. }));
        assert!(matches!(entries[2].event, AuditEvent::Purged { early: false, .. }));
    }

    #[test]
    fn test_entries_for_set() {
        let log = AuditLog::in_memory().unwrap();
        let a = SetId::new();
        let b = SetId::new();
        log.append(AuditEvent::Reconstructed { set_id: a }).unwrap();
        log.append(AuditEvent::Reconstructed { set_id: b }).unwrap();
        log.append(AuditEvent::CanaryTripped {
            token_id: TokenId::new(),
            domain: DomainId(1),
            source_context: "scan".to_string(),
        })
        .unwrap();

        assert_eq!(log.entries_for(a).unwrap().len(), 1);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_entries_are_json() {
        let log = AuditLog::in_memory().unwrap();
        let set_id = SetId::new();
        log.append(AuditEvent::ReconstructFailed {
            set_id,
            error: "Deadline exceeded".to_string(),
        })
        .unwrap();
        let entry = &log.entries().unwrap()[0];
        let json = serde_json::to_string(entry).unwrap();
        assert!(json.contains("\"event\":\"reconstruct_failed\""));
    }
}
