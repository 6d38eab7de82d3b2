//! Sharing policy per sensitivity tier
//!
//! The policy source supplies N, K and lifetime defaults when a caller does
//! not choose them explicitly.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::codec::ShareCodec;
use crate::config::PolicyConfig;
use crate::error::{Error, Result};

/// Sensitivity tier of a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensitivityTier {
    Low,
    Standard,
    High,
}

impl Default for SensitivityTier {
    fn default() -> Self {
        SensitivityTier::Standard
    }
}

impl std::str::FromStr for SensitivityTier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(SensitivityTier::Low),
            "standard" => Ok(SensitivityTier::Standard),
            "high" => Ok(SensitivityTier::High),
            other => Err(Error::InvalidConfig(format!("unknown tier: {}", other))),
        }
    }
}

/// Sharing parameters for one tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierPolicy {
    /// Total fragments (N)
    pub total: usize,
    /// Reconstruction threshold (K)
    pub threshold: usize,
    /// Fragment lifetime in milliseconds
    pub lifetime_ms: u64,
}

impl TierPolicy {
    pub fn lifetime(&self) -> Duration {
        Duration::from_millis(self.lifetime_ms)
    }

    pub fn validate(&self) -> Result<()> {
        ShareCodec::new(self.threshold, self.total)?;
        if self.lifetime_ms == 0 {
            return Err(Error::InvalidParameters(
                "lifetime_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Source of per-tier sharing defaults
pub trait PolicySource: Send + Sync {
    fn policy_for(&self, tier: SensitivityTier) -> TierPolicy;
}

impl PolicySource for PolicyConfig {
    fn policy_for(&self, tier: SensitivityTier) -> TierPolicy {
        self.tier(tier).clone()
    }
}
