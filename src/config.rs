//! Loading `config.toml` into the runtime settings.
//!
//! Every key is optional. Directories default to the resolved state
//! directory; durations are written in milliseconds.
//!
//! ```toml
//! state_dir = "~/.local/state/cloudsweep"
//! inventory = "~/inventory.json"
//!
//! [lock]
//! timeout_ms = 30000
//! poll_interval_ms = 500
//!
//! [retry]
//! max_attempts = 5
//! base_delay_ms = 2000
//! jitter = 0.25
//! ```

use crate::paths;
use anyhow::{Context, Result};
use safeguard::{GraphConfig, LockConfig, ReportConfig, RetryConfig, SafetyConfig, StateConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// On-disk shape of `config.toml`.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Root for locks, state and diagnostics
    pub state_dir: Option<String>,
    /// Override for the lock directory
    pub lock_dir: Option<String>,
    /// Override for the state document
    pub state_file: Option<String>,
    /// Override for the diagnostics directory
    pub diagnostics_dir: Option<String>,
    /// Default inventory file for `deps` and `delete`
    pub inventory: Option<String>,

    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

impl FileConfig {
    /// Parse a config file's contents
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid config.toml format")
    }

    /// Resolve into settings, using `default_root` when no state_dir is set
    pub fn resolve(self, default_root: &Path, source: Option<PathBuf>) -> Settings {
        let root = self
            .state_dir
            .as_deref()
            .map_or_else(|| default_root.to_path_buf(), paths::expand);

        let mut safety = SafetyConfig::under(&root);
        if let Some(dir) = &self.lock_dir {
            safety.lock_dir = paths::expand(dir);
        }
        if let Some(file) = &self.state_file {
            safety.state_file = paths::expand(file);
        }
        if let Some(dir) = &self.diagnostics_dir {
            safety.diagnostics_dir = paths::expand(dir);
        }
        safety.lock = self.lock;
        safety.retry = self.retry;
        safety.graph = self.graph;
        safety.state = self.state;
        safety.report = self.report;

        Settings {
            safety,
            inventory: self.inventory.as_deref().map(paths::expand),
            source,
        }
    }
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Configuration handed to the safety core
    pub safety: SafetyConfig,
    /// Default inventory file, if configured
    pub inventory: Option<PathBuf>,
    /// Config file the settings came from, if any
    pub source: Option<PathBuf>,
}

/// Load settings from `explicit`, or from the default config file if it exists.
pub fn load(explicit: Option<&Path>) -> Result<Settings> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => Some(paths::config_file()?).filter(|p| p.exists()),
    };

    let file = match &path {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Could not read {}", path.display()))?;
            log::debug!("Loaded config from {}", path.display());
            FileConfig::parse(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        }
        None => {
            log::debug!("No config file, using defaults");
            FileConfig::default()
        }
    };

    Ok(file.resolve(&paths::state_dir()?, path))
}
