//! Configuration management for shelf-updater
//!
//! This module handles loading and validating configuration from environment
//! variables and TOML files, and turns it into the immutable
//! [`RunConfiguration`] every run works from.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::models::{CategoryId, SourceId};
use crate::scheduler::selection::{UpdateScope, UpdateTarget};
use crate::scheduler::throttle::{ThrottlePolicy, MAX_GROWTH_FACTOR};
use crate::scheduler::window::FetchWindow;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Worker pool configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Candidate restriction flags
    #[serde(default)]
    pub restrictions: Restrictions,

    /// Categories updated when the whole library is targeted
    #[serde(default)]
    pub categories: CategoryFilter,

    /// Automatic download of new chapters
    #[serde(default)]
    pub auto_download: AutoDownloadPolicy,

    /// Per-source pacing overrides
    #[serde(default)]
    pub throttle: ThrottleConfig,

    /// Failure log output
    #[serde(default)]
    pub error_log: ErrorLogConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Item updates in flight across all sources
    pub global_concurrency: usize,

    /// Item updates in flight for a single source
    pub per_source_concurrency: usize,

    /// Give up waiting for a pool slot after this many seconds
    #[serde(default)]
    pub slot_timeout_secs: Option<u64>,

    /// Refresh title, cover and status before fetching chapters
    #[serde(default)]
    pub refresh_metadata: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            global_concurrency: 5,
            per_source_concurrency: 1,
            slot_timeout_secs: None,
            refresh_metadata: false,
        }
    }
}

/// Restriction flags applied by the candidate selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restrictions {
    #[serde(default = "enabled")]
    pub skip_completed: bool,
    #[serde(default)]
    pub skip_no_unread: bool,
    #[serde(default)]
    pub skip_not_started: bool,
    #[serde(default = "enabled")]
    pub skip_outside_fetch_window: bool,
}

fn enabled() -> bool {
    true
}

impl Restrictions {
    /// No restriction besides the update strategy
    pub fn none() -> Self {
        Self {
            skip_completed: false,
            skip_no_unread: false,
            skip_not_started: false,
            skip_outside_fetch_window: false,
        }
    }
}

impl Default for Restrictions {
    fn default() -> Self {
        Self {
            skip_completed: true,
            skip_no_unread: false,
            skip_not_started: false,
            skip_outside_fetch_window: true,
        }
    }
}

/// Category include/exclude lists for whole-library runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryFilter {
    /// Empty means every category
    #[serde(default)]
    pub include: BTreeSet<CategoryId>,
    /// Wins over `include`
    #[serde(default)]
    pub exclude: BTreeSet<CategoryId>,
}

/// Auto-download policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoDownloadPolicy {
    #[serde(default)]
    pub enabled: bool,
    /// Empty means every category
    #[serde(default)]
    pub include_categories: BTreeSet<CategoryId>,
    #[serde(default)]
    pub exclude_categories: BTreeSet<CategoryId>,
}

/// Pacing overrides keyed by source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThrottleConfig {
    #[serde(default)]
    pub sources: Vec<SourceThrottleConfig>,
}

/// Pacing policy of one source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceThrottleConfig {
    pub source: SourceId,
    pub policy: ThrottlePolicy,
}

/// Failure log output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLogConfig {
    /// Directory receiving one log file per run with failures
    pub dir: PathBuf,
}

impl Default for ErrorLogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

/// Immutable snapshot of everything a run needs, taken at run start
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfiguration {
    pub scope: UpdateScope,
    pub target: UpdateTarget,
    pub window: FetchWindow,
    pub restrictions: Restrictions,
    pub categories: CategoryFilter,
    pub auto_download: AutoDownloadPolicy,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub slot_timeout: Option<Duration>,
    pub refresh_metadata: bool,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_categories(key: &str) -> BTreeSet<CategoryId> {
    std::env::var(key)
        .map(|v| {
            v.split(',')
                .filter_map(|id| id.trim().parse::<u64>().ok())
                .map(CategoryId)
                .collect()
        })
        .unwrap_or_default()
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let scheduler = SchedulerConfig {
            global_concurrency: env_or(
                "SHELF_GLOBAL_CONCURRENCY",
                defaults.scheduler.global_concurrency,
            ),
            per_source_concurrency: env_or(
                "SHELF_PER_SOURCE_CONCURRENCY",
                defaults.scheduler.per_source_concurrency,
            ),
            slot_timeout_secs: std::env::var("SHELF_SLOT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok()),
            refresh_metadata: env_or("SHELF_REFRESH_METADATA", false),
        };

        let restrictions = Restrictions {
            skip_completed: env_or("SHELF_SKIP_COMPLETED", defaults.restrictions.skip_completed),
            skip_no_unread: env_or("SHELF_SKIP_NO_UNREAD", defaults.restrictions.skip_no_unread),
            skip_not_started: env_or(
                "SHELF_SKIP_NOT_STARTED",
                defaults.restrictions.skip_not_started,
            ),
            skip_outside_fetch_window: env_or(
                "SHELF_SKIP_OUTSIDE_FETCH_WINDOW",
                defaults.restrictions.skip_outside_fetch_window,
            ),
        };

        let categories = CategoryFilter {
            include: env_categories("SHELF_INCLUDE_CATEGORIES"),
            exclude: env_categories("SHELF_EXCLUDE_CATEGORIES"),
        };

        let auto_download = AutoDownloadPolicy {
            enabled: env_or("SHELF_AUTO_DOWNLOAD", false),
            include_categories: env_categories("SHELF_DOWNLOAD_INCLUDE_CATEGORIES"),
            exclude_categories: env_categories("SHELF_DOWNLOAD_EXCLUDE_CATEGORIES"),
        };

        let error_log = ErrorLogConfig {
            dir: std::env::var("SHELF_ERROR_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.error_log.dir),
        };

        let logging = LoggingConfig {
            level: std::env::var("SHELF_LOG_LEVEL").unwrap_or_else(|_| String::from("info")),
            format: std::env::var("SHELF_LOG_FORMAT").unwrap_or_else(|_| String::from("text")),
        };

        Ok(Self {
            scheduler,
            restrictions,
            categories,
            auto_download,
            throttle: ThrottleConfig::default(),
            error_log,
            logging,
        })
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.global_concurrency == 0 {
            anyhow::bail!("global_concurrency must be greater than 0");
        }

        if self.scheduler.per_source_concurrency == 0 {
            anyhow::bail!("per_source_concurrency must be greater than 0");
        }

        if self.scheduler.slot_timeout_secs == Some(0) {
            anyhow::bail!("slot_timeout_secs must be greater than 0 when set");
        }

        for entry in &self.throttle.sources {
            match &entry.policy {
                ThrottlePolicy::Unlimited => {}
                ThrottlePolicy::Adaptive(tuning) => {
                    if tuning.min_delay_ms > tuning.max_delay_ms {
                        anyhow::bail!(
                            "source {}: min_delay_ms must not exceed max_delay_ms",
                            entry.source
                        );
                    }
                    if !(1.0..=MAX_GROWTH_FACTOR).contains(&tuning.growth_factor) {
                        anyhow::bail!(
                            "source {}: growth_factor must be between 1.0 and {MAX_GROWTH_FACTOR}",
                            entry.source
                        );
                    }
                    if tuning.rapid_threshold == 0 {
                        anyhow::bail!("source {}: rapid_threshold must be greater than 0", entry.source);
                    }
                }
                ThrottlePolicy::Quota { per_second } => {
                    if *per_second == 0 {
                        anyhow::bail!("source {}: per_second must be greater than 0", entry.source);
                    }
                }
            }
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!("logging format must be 'text' or 'json'");
        }

        Ok(())
    }

    /// Throttle overrides as (source, policy) pairs
    pub fn throttle_policies(&self) -> Vec<(SourceId, ThrottlePolicy)> {
        self.throttle
            .sources
            .iter()
            .map(|entry| (entry.source, entry.policy.clone()))
            .collect()
    }

    /// Snapshot the configuration for one run
    #[must_use]
    pub fn run_configuration(
        &self,
        scope: UpdateScope,
        target: UpdateTarget,
        window: FetchWindow,
    ) -> RunConfiguration {
        RunConfiguration {
            scope,
            target,
            window,
            restrictions: self.restrictions,
            categories: self.categories.clone(),
            auto_download: self.auto_download.clone(),
            global_concurrency: self.scheduler.global_concurrency.max(1),
            per_source_concurrency: self.scheduler.per_source_concurrency.max(1),
            slot_timeout: self.scheduler.slot_timeout_secs.map(Duration::from_secs),
            refresh_metadata: self.scheduler.refresh_metadata,
        }
    }
}
