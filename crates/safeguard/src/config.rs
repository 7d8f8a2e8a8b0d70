//! Explicit configuration for the safety core.
//!
//! One [`SafetyConfig`] is built at startup and handed to each component
//! constructor. Durations are (de)serialized as integer milliseconds so the
//! config file stays readable.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Directory holding one entry per held lock
    pub lock_dir: PathBuf,
    /// Path of the JSON state document
    pub state_file: PathBuf,
    /// Directory holding one report file per handled error
    pub diagnostics_dir: PathBuf,
    /// Lock acquisition settings
    #[serde(default)]
    pub lock: LockConfig,
    /// Backoff settings for transient provider failures
    #[serde(default)]
    pub retry: RetryConfig,
    /// Dependency graph limits
    #[serde(default)]
    pub graph: GraphConfig,
    /// State document settings
    #[serde(default)]
    pub state: StateConfig,
    /// Error report settings
    #[serde(default)]
    pub report: ReportConfig,
}

impl SafetyConfig {
    /// Lay out every persisted path under a single root directory.
    pub fn under(root: &Path) -> Self {
        Self {
            lock_dir: root.join("locks"),
            state_file: root.join("state.json"),
            diagnostics_dir: root.join("diagnostics"),
            lock: LockConfig::default(),
            retry: RetryConfig::default(),
            graph: GraphConfig::default(),
            state: StateConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

/// Lock acquisition settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// How long `acquire` waits before giving up
    #[serde(with = "duration_ms", rename = "timeout_ms")]
    pub timeout: Duration,
    /// Sleep between acquisition attempts
    #[serde(with = "duration_ms", rename = "poll_interval_ms")]
    pub poll_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(with = "duration_ms", rename = "base_delay_ms")]
    pub base_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum delay between retries
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Fraction of the delay randomly added or removed (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with custom settings.
    pub fn new(max_attempts: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_factor,
            ..Default::default()
        }
    }

    /// Calculate the un-jittered delay for a given retry (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Create a config that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Dependency graph limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Maximum number of nodes visited before construction aborts
    pub max_nodes: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self { max_nodes: 10_000 }
    }
}

/// State document settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Operation log entries kept; older ones are dropped
    pub max_operation_log: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            max_operation_log: 1_000,
        }
    }
}

/// Error report settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Number of recent log lines captured per report
    pub log_tail_lines: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self { log_tail_lines: 200 }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
