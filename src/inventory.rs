//! File-backed resource provider.
//!
//! An inventory is a JSON file listing resources and what each one depends
//! on. Deletions are written back to the file, so consecutive invocations
//! see each other's results. Each write-back re-reads the file under a lock
//! named after it and removes only the deleted entry, so concurrent
//! invocations do not undo each other's deletions.
//!
//! ```json
//! {
//!   "resources": [
//!     { "type": "disk", "name": "disk-1" },
//!     { "type": "instance", "name": "vm-1", "depends_on": ["disk/disk-1"] }
//!   ]
//! }
//! ```

use anyhow::{Context, Result, bail};
use safeguard::{
    LockManager, MemoryProvider, ProviderError, ResourceDescriptor, ResourceId, ResourceProvider,
    fsutil,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Serialize, Deserialize)]
struct InventoryFile {
    #[serde(default)]
    resources: Vec<InventoryEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct InventoryEntry {
    #[serde(flatten)]
    id: ResourceId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    metadata: serde_json::Map<String, serde_json::Value>,
}

fn read_file(path: &Path) -> Result<InventoryFile> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Could not read inventory {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Invalid inventory format in {}", path.display()))
}

/// Provider reading and writing an inventory file.
pub struct InventoryProvider {
    path: PathBuf,
    resources: MemoryProvider,
    locks: LockManager,
    file_lock: ResourceId,
}

impl InventoryProvider {
    /// Load an inventory, checking that every dependency is listed.
    ///
    /// Write-backs are serialized through `locks`.
    pub fn load(path: &Path, locks: LockManager) -> Result<Self> {
        let file = read_file(path)?;

        let known: BTreeSet<ResourceId> = file.resources.iter().map(|e| e.id.clone()).collect();
        if known.len() != file.resources.len() {
            bail!("Inventory {} lists a resource more than once", path.display());
        }

        let resources = MemoryProvider::new();
        for entry in file.resources {
            let mut depends_on = Vec::with_capacity(entry.depends_on.len());
            for raw in &entry.depends_on {
                let dependency: ResourceId = raw
                    .parse()
                    .map_err(|e: String| anyhow::anyhow!("{}: {e}", entry.id))?;
                if !known.contains(&dependency) {
                    bail!("{} depends on {dependency}, which is not in the inventory", entry.id);
                }
                depends_on.push(dependency);
            }
            let mut descriptor = ResourceDescriptor::new(entry.id);
            descriptor.metadata = entry.metadata;
            resources.insert_descriptor(descriptor, depends_on);
        }

        // Every spelling of the path must map to the same lock
        let canonical = fs::canonicalize(path)
            .with_context(|| format!("Could not resolve {}", path.display()))?;

        log::debug!("Loaded {} resources from {}", known.len(), path.display());
        Ok(Self {
            path: path.to_path_buf(),
            resources,
            locks,
            file_lock: ResourceId::new("inventory", canonical.display().to_string()),
        })
    }

    /// Path the inventory was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove `id` from the file as it is on disk now, keeping everything
    /// else other writers put there. The caller holds the file lock.
    fn remove_from_file(&self, id: &ResourceId) -> Result<()> {
        let mut file = read_file(&self.path)?;
        file.resources.retain(|entry| entry.id != *id);
        for entry in &mut file.resources {
            entry
                .depends_on
                .retain(|raw| !raw.parse::<ResourceId>().is_ok_and(|dep| dep == *id));
        }

        let mut data = serde_json::to_vec_pretty(&file)?;
        data.push(b'\n');
        fsutil::atomic_write(&self.path, &data)
            .with_context(|| format!("Could not write inventory {}", self.path.display()))
    }
}

impl ResourceProvider for InventoryProvider {
    fn describe(&self, id: &ResourceId) -> Result<Option<ResourceDescriptor>, ProviderError> {
        self.resources.describe(id)
    }

    fn dependents_of(&self, id: &ResourceId) -> Result<Vec<ResourceId>, ProviderError> {
        self.resources.dependents_of(id)
    }

    fn delete(&self, id: &ResourceId) -> Result<(), ProviderError> {
        self.resources.delete(id)?;
        self.locks
            .with_lock(&self.file_lock, || self.remove_from_file(id))
            .map_err(|e| ProviderError::Other(e.to_string()))?
            .map_err(|e| ProviderError::Other(format!("{e:#}")))
    }
}
