//! Configuration management for ephemvault

use crate::error::{Error, Result};
use crate::placement::AssignmentStrategy;
use crate::policy::{SensitivityTier, TierPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default fragment lifetime (milliseconds)
pub const DEFAULT_LIFETIME_MS: u64 = 100;

/// Default bound on the Expiring -> Purged transition (microseconds)
pub const DEFAULT_GRACE_PERIOD_US: u64 = 500;

/// Default reconstruction deadline (milliseconds)
pub const DEFAULT_DEADLINE_MS: u64 = 20;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for fragment metadata and the audit log.
    /// When unset, both live in a temporary database.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Expiration settings
    #[serde(default)]
    pub expiration: ExpirationConfig,

    /// Placement settings
    #[serde(default)]
    pub placement: PlacementConfig,

    /// Canary token settings
    #[serde(default)]
    pub canary: CanaryConfig,

    /// Anomaly detector settings
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Reconstruction settings
    #[serde(default)]
    pub reconstruction: ReconstructionConfig,

    /// Sharing parameters per sensitivity tier
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Expiration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpirationConfig {
    /// Target bound for purging a fragment once it stops being live (microseconds)
    #[serde(default = "default_grace_period_us")]
    pub grace_period_us: u64,

    /// How long a purged set is remembered so lookups report it as expired (milliseconds)
    #[serde(default = "default_tombstone_retention_ms")]
    pub tombstone_retention_ms: u64,
}

fn default_grace_period_us() -> u64 {
    DEFAULT_GRACE_PERIOD_US
}

fn default_tombstone_retention_ms() -> u64 {
    60_000
}

impl Default for ExpirationConfig {
    fn default() -> Self {
        ExpirationConfig {
            grace_period_us: default_grace_period_us(),
            tombstone_retention_ms: default_tombstone_retention_ms(),
        }
    }
}

/// Per-domain placement weight
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainWeight {
    pub domain: u16,
    pub weight: u32,
}

/// Placement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementConfig {
    /// Fragment-to-domain assignment strategy
    #[serde(default)]
    pub strategy: AssignmentStrategy,

    /// Weights for the weighted strategy (domains not listed weigh 100)
    #[serde(default)]
    pub weights: Vec<DomainWeight>,

    /// Scheduled hop interval in milliseconds (0 disables scheduled hopping)
    #[serde(default)]
    pub hop_interval_ms: u64,

    /// How often unavailable domains are rechecked for recovery (0 disables)
    #[serde(default = "default_recheck_interval")]
    pub recheck_interval_ms: u64,

    /// Consecutive failures before a domain is considered unavailable
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
}

fn default_max_failures() -> u32 {
    3
}

fn default_recheck_interval() -> u64 {
    1_000
}

impl Default for PlacementConfig {
    fn default() -> Self {
        PlacementConfig {
            strategy: AssignmentStrategy::default(),
            weights: Vec::new(),
            hop_interval_ms: 0,
            recheck_interval_ms: default_recheck_interval(),
            max_consecutive_failures: default_max_failures(),
        }
    }
}

impl PlacementConfig {
    /// Configured weight for a domain
    pub fn weight_of(&self, domain: u16) -> u32 {
        self.weights
            .iter()
            .find(|w| w.domain == domain)
            .map(|w| w.weight)
            .unwrap_or(100)
    }
}

/// Canary token configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryConfig {
    /// Tokens deployed per real fragment in each domain
    #[serde(default = "default_canary_ratio")]
    pub canary_ratio: f64,

    /// Expected benign accesses per second for tokens deployed with a set
    #[serde(default)]
    pub default_sensitivity: f64,

    /// Window over which a token's accesses are compared to its sensitivity (milliseconds)
    #[serde(default = "default_sensitivity_window_ms")]
    pub sensitivity_window_ms: u64,

    /// Decoy size for tokens not bound to a set
    #[serde(default = "default_decoy_len")]
    pub decoy_len: usize,

    /// Rotation interval for unbound tokens (milliseconds, 0 disables rotation)
    #[serde(default = "default_rotation_interval_ms")]
    pub rotation_interval_ms: u64,
}

fn default_canary_ratio() -> f64 {
    1.0
}

fn default_sensitivity_window_ms() -> u64 {
    1_000
}

fn default_decoy_len() -> usize {
    64
}

fn default_rotation_interval_ms() -> u64 {
    60_000
}

impl Default for CanaryConfig {
    fn default() -> Self {
        CanaryConfig {
            canary_ratio: default_canary_ratio(),
            default_sensitivity: 0.0,
            sensitivity_window_ms: default_sensitivity_window_ms(),
            decoy_len: default_decoy_len(),
            rotation_interval_ms: default_rotation_interval_ms(),
        }
    }
}

/// Anomaly detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Window in which a second independent signal escalates (milliseconds)
    #[serde(default = "default_correlation_window_ms")]
    pub correlation_window_ms: u64,

    /// Rolling window for reconstruction outcomes (milliseconds)
    #[serde(default = "default_failure_window_ms")]
    pub failure_window_ms: u64,

    /// Failure rate at or above which reconstructions count as anomalous
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,

    /// Minimum outcomes in the window before the rate is considered
    #[serde(default = "default_failure_min_samples")]
    pub failure_min_samples: usize,

    /// Quiet period after which Escalated returns to Normal (milliseconds)
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Fraction of remaining lifetime kept when tightening, in (0, 1)
    #[serde(default = "default_tighten_factor")]
    pub tighten_factor: f64,

    /// Capacity of the alert broadcast channel
    #[serde(default = "default_alert_buffer")]
    pub alert_buffer: usize,
}

fn default_correlation_window_ms() -> u64 {
    100
}

fn default_failure_window_ms() -> u64 {
    1_000
}

fn default_failure_rate_threshold() -> f64 {
    0.5
}

fn default_failure_min_samples() -> usize {
    4
}

fn default_cooldown_ms() -> u64 {
    5_000
}

fn default_tighten_factor() -> f64 {
    0.5
}

fn default_alert_buffer() -> usize {
    64
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            correlation_window_ms: default_correlation_window_ms(),
            failure_window_ms: default_failure_window_ms(),
            failure_rate_threshold: default_failure_rate_threshold(),
            failure_min_samples: default_failure_min_samples(),
            cooldown_ms: default_cooldown_ms(),
            tighten_factor: default_tighten_factor(),
            alert_buffer: default_alert_buffer(),
        }
    }
}

/// Reconstruction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructionConfig {
    /// Fetches launched beyond K up front
    #[serde(default = "default_fetch_spares")]
    pub fetch_spares: usize,

    /// Deadline used when the caller does not supply one (milliseconds)
    #[serde(default = "default_deadline_ms")]
    pub default_deadline_ms: u64,
}

fn default_fetch_spares() -> usize {
    1
}

fn default_deadline_ms() -> u64 {
    DEFAULT_DEADLINE_MS
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        ReconstructionConfig {
            fetch_spares: default_fetch_spares(),
            default_deadline_ms: default_deadline_ms(),
        }
    }
}

/// Sharing parameters per sensitivity tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_low_tier")]
    pub low: TierPolicy,

    #[serde(default = "default_standard_tier")]
    pub standard: TierPolicy,

    #[serde(default = "default_high_tier")]
    pub high: TierPolicy,
}

fn default_low_tier() -> TierPolicy {
    TierPolicy {
        total: 5,
        threshold: 3,
        lifetime_ms: 500,
    }
}

fn default_standard_tier() -> TierPolicy {
    TierPolicy {
        total: 7,
        threshold: 4,
        lifetime_ms: DEFAULT_LIFETIME_MS,
    }
}

fn default_high_tier() -> TierPolicy {
    TierPolicy {
        total: 9,
        threshold: 6,
        lifetime_ms: 50,
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig {
            low: default_low_tier(),
            standard: default_standard_tier(),
            high: default_high_tier(),
        }
    }
}

impl PolicyConfig {
    pub fn tier(&self, tier: SensitivityTier) -> &TierPolicy {
        match tier {
            SensitivityTier::Low => &self.low,
            SensitivityTier::Standard => &self.standard,
            SensitivityTier::High => &self.high,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: None,
            expiration: ExpirationConfig::default(),
            placement: PlacementConfig::default(),
            canary: CanaryConfig::default(),
            detector: DetectorConfig::default(),
            reconstruction: ReconstructionConfig::default(),
            policy: PolicyConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("EPHEMVAULT_DATA_DIR") {
            let dir = dir.trim();
            if !dir.is_empty() {
                self.data_dir = Some(PathBuf::from(dir));
            }
        }

        if let Ok(level) = std::env::var("EPHEMVAULT_LOG_LEVEL") {
            let level = level.trim().to_string();
            if !level.is_empty() {
                self.logging.level = level;
            }
        }

        if let Ok(interval) = std::env::var("EPHEMVAULT_HOP_INTERVAL_MS") {
            if let Ok(ms) = interval.trim().parse::<u64>() {
                self.placement.hop_interval_ms = ms;
            }
        }

        if let Ok(ratio) = std::env::var("EPHEMVAULT_CANARY_RATIO") {
            if let Ok(r) = ratio.trim().parse::<f64>() {
                self.canary.canary_ratio = r;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.expiration.grace_period_us == 0 {
            return Err(Error::InvalidConfig(
                "grace_period_us must be greater than 0".to_string(),
            ));
        }

        let factor = self.detector.tighten_factor;
        if !(factor > 0.0 && factor < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "tighten_factor must be in (0, 1), got {}",
                factor
            )));
        }

        let rate = self.detector.failure_rate_threshold;
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "failure_rate_threshold must be in (0, 1], got {}",
                rate
            )));
        }

        if self.detector.correlation_window_ms == 0 {
            return Err(Error::InvalidConfig(
                "correlation_window_ms must be greater than 0".to_string(),
            ));
        }

        if self.detector.alert_buffer == 0 {
            return Err(Error::InvalidConfig(
                "alert_buffer must be greater than 0".to_string(),
            ));
        }

        if !(self.canary.canary_ratio >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "canary_ratio must be non-negative, got {}",
                self.canary.canary_ratio
            )));
        }

        if !(self.canary.default_sensitivity >= 0.0) {
            return Err(Error::InvalidConfig(
                "default_sensitivity must be non-negative".to_string(),
            ));
        }

        if self.canary.decoy_len == 0 {
            return Err(Error::InvalidConfig(
                "decoy_len must be greater than 0".to_string(),
            ));
        }

        for tier in [
            SensitivityTier::Low,
            SensitivityTier::Standard,
            SensitivityTier::High,
        ] {
            self.policy
                .tier(tier)
                .validate()
                .map_err(|e| Error::InvalidConfig(format!("{:?} tier: {}", tier, e)))?;
        }

        Ok(())
    }

    /// Ensure the data directory exists
    pub fn ensure_directories(&self) -> Result<()> {
        if let Some(dir) = &self.data_dir {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ephemvault")
            .join("config.json")
    }
}
