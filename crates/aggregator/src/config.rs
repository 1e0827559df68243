//! Aggregator configuration
//!
//! Configuration is a plain serde struct. [`AggregatorConfig::load`] layers
//! an optional YAML file under environment variables prefixed with
//! `AGGREGATOR_`, where `__` separates nested keys:
//!
//! ```text
//! AGGREGATOR_COMPLETION_SIZE=100
//! AGGREGATOR_OPTIMISTIC_LOCK_RETRY__MAXIMUM_RETRIES=5
//! ```

use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{AggregatorError, Result};
use crate::retry::OptimisticLockRetryPolicy;

/// Aggregate processor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Complete a group once it holds this many exchanges, zero disables
    #[serde(default)]
    pub completion_size: u64,

    /// Complete a group after this much inactivity, zero disables
    #[serde(default)]
    pub completion_timeout_ms: u64,

    /// Complete all groups periodically, zero disables
    #[serde(default)]
    pub completion_interval_ms: u64,

    /// Poll period of the timeout reaper
    #[serde(default = "default_timeout_checker_interval_ms")]
    pub completion_timeout_checker_interval_ms: u64,

    /// Evaluate completion against the incoming exchange before merging
    #[serde(default)]
    pub eager_check_completion: bool,

    /// Number of concurrent downstream deliveries
    #[serde(default = "default_delivery_pool_size")]
    pub delivery_pool_size: usize,

    /// Use compare-and-swap writes and retry on conflicts
    #[serde(default)]
    pub optimistic_locking: bool,

    /// Backoff applied between optimistic locking retries
    #[serde(default)]
    pub optimistic_lock_retry: OptimisticLockRetryPolicy,

    /// Silently drop exchanges without a valid correlation key
    #[serde(default)]
    pub ignore_invalid_correlation_keys: bool,

    /// Reject keys that already completed; `Some(0)` keeps every key,
    /// `Some(n)` keeps a bounded cache of `n` keys
    #[serde(default)]
    pub close_correlation_key_on_completion: Option<usize>,

    /// Drop groups completed by timeout instead of delivering them
    #[serde(default)]
    pub discard_on_completion_timeout: bool,

    /// Complete a group by discarding it when its merge fails
    #[serde(default)]
    pub discard_on_aggregation_failure: bool,

    /// Force completion of all other groups whenever a new group starts
    #[serde(default)]
    pub completion_on_new_correlation_group: bool,

    /// Complete all groups and wait for their delivery when stopping
    #[serde(default)]
    pub force_completion_on_stop: bool,

    /// Serialize merges, evictions and forced completions on one lock
    #[serde(default)]
    pub exclusive_aggregation: bool,

    /// Collect statistics
    #[serde(default = "default_true")]
    pub statistics_enabled: bool,
}

fn default_timeout_checker_interval_ms() -> u64 {
    1000
}

fn default_delivery_pool_size() -> usize {
    10
}

fn default_true() -> bool {
    true
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            completion_size: 0,
            completion_timeout_ms: 0,
            completion_interval_ms: 0,
            completion_timeout_checker_interval_ms: default_timeout_checker_interval_ms(),
            eager_check_completion: false,
            delivery_pool_size: default_delivery_pool_size(),
            optimistic_locking: false,
            optimistic_lock_retry: OptimisticLockRetryPolicy::default(),
            ignore_invalid_correlation_keys: false,
            close_correlation_key_on_completion: None,
            discard_on_completion_timeout: false,
            discard_on_aggregation_failure: false,
            completion_on_new_correlation_group: false,
            force_completion_on_stop: false,
            exclusive_aggregation: false,
            statistics_enabled: true,
        }
    }
}

impl AggregatorConfig {
    /// Load configuration from an optional YAML file and the environment
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        }

        // Override with environment variables (prefixed with AGGREGATOR_)
        figment = figment.merge(Env::prefixed("AGGREGATOR_").split("__"));

        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.delivery_pool_size == 0 {
            return Err(AggregatorError::configuration(
                "delivery_pool_size must be greater than 0",
            ));
        }

        if self.completion_timeout_checker_interval_ms == 0 {
            return Err(AggregatorError::configuration(
                "completion_timeout_checker_interval_ms must be greater than 0",
            ));
        }

        if self.completion_interval_ms > 0 && self.completion_timeout_ms > 0 {
            return Err(AggregatorError::configuration(
                "only one of completion_interval_ms or completion_timeout_ms can be used, not both",
            ));
        }

        Ok(())
    }

    pub fn completion_timeout(&self) -> Option<Duration> {
        (self.completion_timeout_ms > 0).then(|| Duration::from_millis(self.completion_timeout_ms))
    }

    pub fn completion_interval(&self) -> Option<Duration> {
        (self.completion_interval_ms > 0).then(|| Duration::from_millis(self.completion_interval_ms))
    }

    pub fn timeout_checker_interval(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_checker_interval_ms)
    }
}
