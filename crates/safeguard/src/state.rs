//! Atomically replaced JSON state document.
//!
//! Every write reads the whole document, modifies it in memory, writes a temp
//! file beside it and renames it over the canonical path. Concurrent writers
//! may lose a race (last writer wins) but readers never see a torn document.
//! Repairing a corrupt document is serialized across processes by a guard
//! file next to it.

use crate::config::{SafetyConfig, StateConfig};
use crate::error::StateError;
use crate::fsutil;
use crate::process::{Owner, ProcessProbe, SystemProbe};
use crate::types::{ResourceId, ResourceState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const BACKUP_STAMP: &str = "%Y%m%dT%H%M%S%.3fZ";
/// How long a repair waits for another process's repair to finish
const REPAIR_WAIT: Duration = Duration::from_secs(10);
const REPAIR_POLL: Duration = Duration::from_millis(20);

// ============================================================================
// Document Structures
// ============================================================================

/// The whole persisted document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    /// Last known record per resource, keyed by `type/name`
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceRecord>,

    /// State transitions, oldest first
    #[serde(default)]
    pub operations: Vec<OperationEntry>,

    /// Last time stale locks were swept
    #[serde(default)]
    pub last_cleanup: Option<DateTime<Utc>>,
}

/// Last known record for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Lifecycle state
    pub state: ResourceState,

    /// When the record was last written
    pub timestamp: DateTime<Utc>,

    /// Caller-owned attributes
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ResourceRecord {
    fn observed(state: ResourceState) -> Self {
        Self {
            state,
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }
}

/// One state transition in the operation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationEntry {
    /// Resource key (`type/name`)
    pub resource: String,
    /// State before the transition
    pub from: ResourceState,
    /// State after the transition
    pub to: ResourceState,
    /// When the transition was written
    pub at: DateTime<Utc>,
    /// Process that wrote it
    pub pid: u32,
}

/// Result of [`StateStore::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// The document parses (or does not exist yet)
    Valid,
    /// The document exists but does not parse
    Corrupt(String),
}

impl Validation {
    /// Check if the document is usable.
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

// ============================================================================
// StateStore Implementation
// ============================================================================

/// Reader and writer of the state document.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    config: StateConfig,
}

impl StateStore {
    /// Create a store for the document at `path`.
    pub fn new(path: impl Into<PathBuf>, config: StateConfig) -> Self {
        Self {
            path: path.into(),
            config,
        }
    }

    /// Create a store from the top-level config.
    pub fn from_config(config: &SafetyConfig) -> Self {
        Self::new(&config.state_file, config.state)
    }

    /// Path of the canonical document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document. A missing document reads as empty.
    pub fn snapshot(&self) -> Result<StateDocument, StateError> {
        let Some(raw) = fsutil::read_optional(&self.path).map_err(|e| StateError::io(&self.path, e))?
        else {
            log::debug!("State document {} does not exist, using empty state", self.path.display());
            return Ok(StateDocument::default());
        };

        serde_json::from_slice(&raw).map_err(|e| StateError::Corrupt {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }

    /// Record `state` for `resource`.
    ///
    /// The operation log only grows when the state actually changes, so
    /// repeating an update leaves the document equal apart from the
    /// resource timestamp.
    pub fn update_resource_state(
        &self,
        resource: &ResourceId,
        state: ResourceState,
    ) -> Result<(), StateError> {
        let max_log = self.config.max_operation_log;
        self.modify(|doc| {
            let key = resource.key();
            let previous = doc.resources.get(&key).map_or(ResourceState::Unknown, |r| r.state);

            let record = doc
                .resources
                .entry(key.clone())
                .or_insert_with(|| ResourceRecord::observed(state));
            record.state = state;
            record.timestamp = Utc::now();

            if previous != state {
                doc.operations.push(OperationEntry {
                    resource: key,
                    from: previous,
                    to: state,
                    at: record.timestamp,
                    pid: std::process::id(),
                });
                if doc.operations.len() > max_log {
                    let excess = doc.operations.len() - max_log;
                    doc.operations.drain(..excess);
                }
            }
        })?;
        log::debug!("State of {resource} set to {state}");
        Ok(())
    }

    /// Merge `metadata` into the record for `resource`.
    ///
    /// Keys present in `metadata` replace existing ones; a resource seen for
    /// the first time is created in `unknown` state.
    pub fn update_resource_metadata(
        &self,
        resource: &ResourceId,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), StateError> {
        self.modify(|doc| {
            let record = doc
                .resources
                .entry(resource.key())
                .or_insert_with(|| ResourceRecord::observed(ResourceState::Unknown));
            record.metadata.extend(metadata);
            record.timestamp = Utc::now();
        })
    }

    /// State of `resource`, `unknown` if it was never recorded.
    pub fn read_resource_state(&self, resource: &ResourceId) -> Result<ResourceState, StateError> {
        Ok(self
            .read_resource(resource)?
            .map_or(ResourceState::Unknown, |r| r.state))
    }

    /// Full record for `resource`, if any.
    pub fn read_resource(&self, resource: &ResourceId) -> Result<Option<ResourceRecord>, StateError> {
        Ok(self.snapshot()?.resources.remove(&resource.key()))
    }

    /// Stamp the time of the last stale-lock sweep.
    pub fn mark_cleanup(&self) -> Result<(), StateError> {
        self.modify(|doc| doc.last_cleanup = Some(Utc::now()))
    }

    /// Check whether the document parses.
    pub fn validate(&self) -> Result<Validation, StateError> {
        match self.snapshot() {
            Ok(_) => Ok(Validation::Valid),
            Err(StateError::Corrupt { message, .. }) => Ok(Validation::Corrupt(message)),
            Err(e) => Err(e),
        }
    }

    /// Move a corrupt document aside and start a fresh one.
    ///
    /// Repairs are serialized through the guard file `<state>.repair`; a
    /// caller that finds it taken waits for the holder, then re-checks the
    /// document. Returns the backup path, or `None` when there was nothing
    /// to repair (the document is valid, or another process repaired it first).
    pub fn backup_and_repair(&self) -> Result<Option<PathBuf>, StateError> {
        self.repair(&Utc::now().format(BACKUP_STAMP).to_string())
    }

    fn repair(&self, stamp: &str) -> Result<Option<PathBuf>, StateError> {
        if self.validate()?.is_valid() {
            return Ok(None);
        }
        let Some(_guard) = self.lock_repair()? else {
            log::info!("State document already repaired by another process");
            return Ok(None);
        };
        if self.validate()?.is_valid() {
            log::info!("State document already repaired by another process");
            return Ok(None);
        }

        let Some(backup) = self.move_aside(stamp)? else {
            return Ok(None);
        };

        // Another writer may already have started a fresh document
        let empty = serde_json::to_vec_pretty(&StateDocument::default())?;
        fsutil::create_exclusive(&self.path, &empty).map_err(|e| StateError::io(&self.path, e))?;

        log::info!(
            "Moved corrupt state document to {} and reinitialized {}",
            backup.display(),
            self.path.display()
        );
        Ok(Some(backup))
    }

    /// Take the repair guard. `None` means the document became valid while waiting.
    fn lock_repair(&self) -> Result<Option<RepairGuard>, StateError> {
        let path = self.sibling("repair");
        let data = serde_json::to_vec(&Owner::current())?;
        let deadline = Instant::now() + REPAIR_WAIT;

        loop {
            if fsutil::create_exclusive(&path, &data).map_err(|e| StateError::io(&path, e))? {
                return Ok(Some(RepairGuard { path }));
            }
            clear_dead_guard(&path)?;
            if self.validate()?.is_valid() {
                return Ok(None);
            }
            if Instant::now() >= deadline {
                return Err(StateError::io(
                    &path,
                    io::Error::new(io::ErrorKind::TimedOut, "another repair is still in progress"),
                ));
            }
            thread::sleep(REPAIR_POLL);
        }
    }

    /// Hard-link the document to a backup name nobody else holds, then unlink it.
    fn move_aside(&self, stamp: &str) -> Result<Option<PathBuf>, StateError> {
        let base = format!("corrupt-{stamp}");
        let mut n = 0u32;
        loop {
            let backup = if n == 0 {
                self.sibling(&base)
            } else {
                self.sibling(&format!("{base}-{n}"))
            };
            match fs::hard_link(&self.path, &backup) {
                Ok(()) => {
                    fsutil::remove_if_exists(&self.path).map_err(|e| StateError::io(&self.path, e))?;
                    return Ok(Some(backup));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => n += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(StateError::io(&self.path, e)),
            }
        }
    }

    /// `<name>.<suffix>` next to the document.
    fn sibling(&self, suffix: &str) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map_or_else(|| "state.json".into(), |n| n.to_string_lossy().to_string());
        self.path.with_file_name(format!("{name}.{suffix}"))
    }

    /// Read whole, modify in memory, write temp, rename.
    ///
    /// A corrupt document is left in place and reported, never overwritten.
    fn modify(&self, f: impl FnOnce(&mut StateDocument)) -> Result<(), StateError> {
        let mut doc = self.snapshot()?;
        f(&mut doc);
        let data = serde_json::to_vec_pretty(&doc)?;
        fsutil::atomic_write(&self.path, &data).map_err(|e| StateError::io(&self.path, e))?;
        log::debug!("Wrote state document {}", self.path.display());
        Ok(())
    }
}

/// Held repair guard; the file is removed on drop.
struct RepairGuard {
    path: PathBuf,
}

impl Drop for RepairGuard {
    fn drop(&mut self) {
        if let Err(e) = fsutil::remove_if_exists(&self.path) {
            log::error!("Failed to drop repair guard {}: {e}", self.path.display());
        }
    }
}

/// Remove a repair guard left behind by a process that died mid-repair.
fn clear_dead_guard(path: &Path) -> Result<(), StateError> {
    let Some(raw) = fsutil::read_optional(path).map_err(|e| StateError::io(path, e))? else {
        return Ok(());
    };
    let dead = match serde_json::from_slice::<Owner>(&raw) {
        Ok(owner) => !SystemProbe.is_alive(&owner),
        Err(_) => true,
    };
    if !dead {
        return Ok(());
    }

    if fsutil::read_optional(path).map_err(|e| StateError::io(path, e))?.as_deref() == Some(raw.as_slice()) {
        log::warn!("Removing abandoned repair guard {}", path.display());
        fsutil::remove_if_exists(path).map_err(|e| StateError::io(path, e))?;
    }
    Ok(())
}
