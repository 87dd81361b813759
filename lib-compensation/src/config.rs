//! Compensation Configuration
//!
//! Immutable rate tables and limits, loaded once from TOML and passed
//! explicitly to every component.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::{Amount, BasisPoints, BASIS_POINTS_DENOMINATOR};
use crate::unlock::{default_milestones, LevelUnlockEvaluator, Milestone, MAX_LEVEL};

/// Configuration loading/validation error
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Configuration parsing error: {0}")]
    Parsing(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid(reason.into())
    }
}

/// Boundary of the per-node daily matching cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CapWindow {
    /// Resets at local midnight for the given UTC offset
    CalendarDay { utc_offset_minutes: i32 },
    /// Trailing 24 hours from the moment of matching
    #[serde(rename = "rolling_24h")]
    Rolling24h,
}

impl CapWindow {
    const DAY_SECS: i64 = 86_400;

    /// Start of the window that contains `now` (unix seconds)
    pub fn window_start(&self, now: u64) -> u64 {
        match *self {
            CapWindow::CalendarDay { utc_offset_minutes } => {
                let offset = utc_offset_minutes as i64 * 60;
                let local = now as i64 + offset;
                let local_midnight = local - local.rem_euclid(Self::DAY_SECS);
                (local_midnight - offset).max(0) as u64
            }
            CapWindow::Rolling24h => now.saturating_sub(Self::DAY_SECS as u64),
        }
    }
}

impl Default for CapWindow {
    fn default() -> Self {
        CapWindow::CalendarDay { utc_offset_minutes: 0 }
    }
}

/// Binary matching parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinaryConfig {
    /// Payout rate applied to matched volume
    pub payout_bps: BasisPoints,
    /// Candidates below this volume are skipped
    pub min_match_volume: Amount,
    /// Maximum volume a node may match per cap window (`None` = unlimited)
    pub daily_cap: Option<Amount>,
    pub cap_window: CapWindow,
    /// Upper bound for a single wallet credit call
    pub credit_timeout_ms: u64,
    /// Defensive bound on parent-chain traversal
    pub max_tree_depth: u32,
}

impl Default for BinaryConfig {
    fn default() -> Self {
        Self {
            payout_bps: 1_000, // 10%
            min_match_volume: 1,
            daily_cap: None,
            cap_window: CapWindow::default(),
            credit_timeout_ms: 10_000,
            max_tree_depth: 100_000,
        }
    }
}

/// Level-income parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelIncomeConfig {
    /// Commission rate per level, index 0 = level 1
    pub percentages_bps: Vec<BasisPoints>,
}

impl LevelIncomeConfig {
    /// Rate for a 1-indexed level, 0 outside the table
    pub fn percentage_for_level(&self, level: u8) -> BasisPoints {
        if level == 0 {
            return 0;
        }
        self.percentages_bps.get(level as usize - 1).copied().unwrap_or(0)
    }

    pub fn max_levels(&self) -> u8 {
        self.percentages_bps.len().min(MAX_LEVEL as usize) as u8
    }
}

impl Default for LevelIncomeConfig {
    fn default() -> Self {
        // 10%, 5%, 3%, 2%, 2%, 1% x5, 0.5% x20
        let mut percentages_bps = vec![1_000, 500, 300, 200, 200];
        percentages_bps.extend(std::iter::repeat(100).take(5));
        percentages_bps.extend(std::iter::repeat(50).take(20));
        Self { percentages_bps }
    }
}

/// Level unlock milestone table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnlockConfig {
    pub milestones: Vec<Milestone>,
}

impl Default for UnlockConfig {
    fn default() -> Self {
        Self { milestones: default_milestones() }
    }
}

/// Batch scheduling parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often the scheduled trigger fires
    pub interval_secs: u64,
    /// Name of the run lease record
    pub lease_name: String,
    /// Lease lifetime; an expired lease can be taken over
    pub lease_ttl_secs: u64,
    /// Offset used to derive the period key of a scheduled run
    pub period_utc_offset_minutes: i32,
    /// Retry pending wallet credits after each run
    pub reconcile_after_run: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 86_400,
            lease_name: "binary-matching".to_string(),
            lease_ttl_secs: 2 * 3_600,
            period_utc_offset_minutes: 0,
            reconcile_after_run: true,
        }
    }
}

/// Persistent store location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
    pub cache_capacity_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/compensation"),
            cache_capacity_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompensationConfig {
    pub binary: BinaryConfig,
    pub level_income: LevelIncomeConfig,
    pub unlock: UnlockConfig,
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
}

impl CompensationConfig {
    /// Permissive config for tests: no cap, 1-unit minimum, short timeouts
    pub fn for_testing() -> Self {
        Self {
            binary: BinaryConfig {
                credit_timeout_ms: 1_000,
                ..BinaryConfig::default()
            },
            scheduler: SchedulerConfig {
                interval_secs: 1,
                lease_ttl_secs: 60,
                ..SchedulerConfig::default()
            },
            ..Self::default()
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(
            "Loaded compensation config from {} ({} levels, binary payout {} bps)",
            path.as_ref().display(),
            config.level_income.max_levels(),
            config.binary.payout_bps
        );
        Ok(config)
    }

    /// Cross-field validation
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.binary.payout_bps > BASIS_POINTS_DENOMINATOR {
            return Err(ConfigError::invalid(format!(
                "binary payout {} bps exceeds 100%",
                self.binary.payout_bps
            )));
        }
        if self.binary.daily_cap == Some(0) {
            return Err(ConfigError::invalid("binary daily cap of 0 would block every match; omit it for unlimited"));
        }
        if self.binary.credit_timeout_ms == 0 {
            return Err(ConfigError::invalid("credit timeout must be positive"));
        }
        if self.binary.max_tree_depth == 0 {
            return Err(ConfigError::invalid("max tree depth must be positive"));
        }
        if let CapWindow::CalendarDay { utc_offset_minutes } = self.binary.cap_window {
            if utc_offset_minutes.abs() > 14 * 60 {
                return Err(ConfigError::invalid(format!("UTC offset {} minutes out of range", utc_offset_minutes)));
            }
        }

        let levels = &self.level_income.percentages_bps;
        if levels.len() != MAX_LEVEL as usize {
            return Err(ConfigError::invalid(format!(
                "level income table needs {} entries, got {}",
                MAX_LEVEL,
                levels.len()
            )));
        }
        let total: u64 = levels.iter().sum();
        if total > BASIS_POINTS_DENOMINATOR {
            return Err(ConfigError::invalid(format!(
                "level income percentages sum to {} bps, more than 100%",
                total
            )));
        }

        LevelUnlockEvaluator::new(self.unlock.milestones.clone())?;

        if self.scheduler.interval_secs == 0 || self.scheduler.lease_ttl_secs == 0 {
            return Err(ConfigError::invalid("scheduler interval and lease ttl must be positive"));
        }
        if self.scheduler.lease_name.trim().is_empty() {
            return Err(ConfigError::invalid("scheduler lease name is empty"));
        }

        Ok(())
    }

    /// Evaluator for the configured milestone table
    pub fn unlock_evaluator(&self) -> Result<LevelUnlockEvaluator, ConfigError> {
        LevelUnlockEvaluator::new(self.unlock.milestones.clone())
    }
}
