//! ephemvault - Temporal fragment store
//!
//! Splits sensitive payloads into K-of-N threshold shares, spreads them
//! across independent storage domains and guarantees they stop being
//! reconstructible once their lifetime ends. Canary tokens planted next to
//! real fragments feed an anomaly detector that shortens lifetimes and moves
//! fragments when an intrusion is suspected.

pub mod canary;
pub mod clock;
pub mod codec;
pub mod config;
pub mod detector;
pub mod domain;
pub mod error;
pub mod expiration;
pub mod metadata;
pub mod placement;
pub mod policy;
pub mod reconstruct;
pub mod store;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use store::{FragmentStore, FragmentStoreBuilder, ResumeSummary, SetStatus};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, MonoTime, SystemClock};
    pub use crate::config::Config;
    pub use crate::detector::{AnomalyAlert, EscalationState};
    pub use crate::domain::{DomainRef, MemoryDomain, SledDomain, StorageDomain};
    pub use crate::error::{Error, Result};
    pub use crate::policy::SensitivityTier;
    pub use crate::store::{FragmentStore, SetStatus};
    pub use crate::types::{DomainId, SetId, TokenId};
}
