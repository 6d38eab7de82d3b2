//! Error types for ephemvault

use std::io;
use thiserror::Error;

use crate::types::{DomainId, FragmentKey, SetId, TokenId};

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for ephemvault
#[derive(Error, Debug)]
pub enum Error {
    // Reconstruction errors
    #[error("Insufficient shares: {available} live, need {required}")]
    InsufficientShares { available: usize, required: usize },

    #[error("Fragment set expired: {0}")]
    SetExpired(SetId),

    #[error("Corrupt shares: {0}")]
    CorruptShares(String),

    #[error("Deadline exceeded")]
    Timeout,

    #[error("Request cancelled")]
    Cancelled,

    // Domain errors
    #[error("Domain {0} unavailable: {1}")]
    DomainUnavailable(DomainId, String),

    #[error("Unknown domain: {0}")]
    UnknownDomain(DomainId),

    #[error("Hop of {key} to domain {target} failed: {reason}")]
    HopFailed {
        key: FragmentKey,
        target: DomainId,
        reason: String,
    },

    #[error("Purge of {key} on domain {domain} could not be confirmed: {reason}")]
    PurgeUnconfirmed {
        key: FragmentKey,
        domain: DomainId,
        reason: String,
    },

    // Lookup errors
    #[error("Fragment set not found: {0}")]
    SetNotFound(SetId),

    #[error("Fragment not found: {0}")]
    FragmentNotFound(FragmentKey),

    #[error("Canary token not found: {0}")]
    TokenNotFound(TokenId),

    // Codec errors
    #[error("Invalid sharing parameters: {0}")]
    InvalidParameters(String),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error hints at tampering and should reach the anomaly detector
    pub fn is_tamper_signal(&self) -> bool {
        matches!(self, Error::CorruptShares(_) | Error::PurgeUnconfirmed { .. })
    }

    /// Whether retrying the same request can never succeed
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::SetExpired(_) | Error::SetNotFound(_) | Error::CorruptShares(_)
        )
    }

    /// Whether this error counts as a failed reconstruction for rate tracking
    pub fn is_reconstruction_failure(&self) -> bool {
        matches!(
            self,
            Error::InsufficientShares { .. }
                | Error::CorruptShares(_)
                | Error::Timeout
                | Error::DomainUnavailable(..)
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
