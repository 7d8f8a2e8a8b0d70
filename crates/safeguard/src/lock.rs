//! Filesystem-backed mutual-exclusion locks.
//!
//! A lock on resource R is the file `<lock_dir>/<stem>.lock`; its existence
//! *is* the grant. Acquisition publishes a complete [`LockRecord`] with a
//! create-if-absent hard link, so two processes racing for the same lock can
//! never both succeed and nobody ever reads a half-written record.
//!
//! # Reclaiming stale locks
//!
//! When the recorded owner is dead, a waiter takes the per-lock guard
//! `<stem>.reclaim` (created the same way), re-reads the lock entry and
//! removes it only if it is byte-for-byte the record it judged stale. The
//! guard is then dropped and the waiter competes through the normal
//! create-if-absent path. A lock is therefore never removed by a non-owner
//! without that ownership check.

use crate::config::{LockConfig, SafetyConfig};
use crate::error::LockError;
use crate::fsutil;
use crate::process::{Owner, ProcessProbe, SystemProbe};
use crate::types::ResourceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const LOCK_EXT: &str = "lock";
const GUARD_EXT: &str = "reclaim";

/// Contents of a lock entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Locked resource
    pub resource: ResourceId,
    /// Process holding the lock
    pub owner: Owner,
    /// When the lock was granted
    pub acquired_at: DateTime<Utc>,
}

impl LockRecord {
    fn new(resource: ResourceId, owner: Owner) -> Self {
        Self {
            resource,
            owner,
            acquired_at: Utc::now(),
        }
    }

    fn to_bytes(&self) -> io::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(io::Error::other)
    }
}

/// A lock entry as seen by [`LockManager::list`].
#[derive(Debug, Clone)]
pub struct LockStatus {
    /// Path of the entry
    pub path: PathBuf,
    /// Parsed record, or `None` if the entry is unreadable
    pub record: Option<LockRecord>,
    /// Whether the owner passed the liveness probe
    pub alive: bool,
}

impl LockStatus {
    /// Whether the entry can be reclaimed.
    pub fn is_stale(&self) -> bool {
        !self.alive
    }
}

/// What sits at a lock path right now.
enum Entry {
    Missing,
    Held { record: LockRecord, raw: Vec<u8> },
    Unreadable { raw: Vec<u8> },
}

/// Locks taken by [`LockManager::acquire_all`].
///
/// Dropping the guard releases the locks in reverse acquisition order.
/// Failures are logged; use [`HeldLocks::release`] to observe them.
#[must_use = "the locks are released as soon as the guard is dropped"]
pub struct HeldLocks<'a> {
    manager: &'a LockManager,
    resources: Vec<ResourceId>,
}

impl HeldLocks<'_> {
    /// Resources held, in acquisition order.
    pub fn resources(&self) -> &[ResourceId] {
        &self.resources
    }

    /// Release every lock now, returning the first failure.
    pub fn release(mut self) -> Result<(), LockError> {
        let resources = std::mem::take(&mut self.resources);
        let mut first = None;
        for resource in resources.iter().rev() {
            if let Err(e) = self.manager.release(resource) {
                log::error!("Failed to release lock on {resource}: {e}");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl Drop for HeldLocks<'_> {
    fn drop(&mut self) {
        if self.resources.is_empty() {
            return;
        }
        if thread::panicking() {
            log::warn!("Releasing {} lock(s) while unwinding", self.resources.len());
        }
        let resources = std::mem::take(&mut self.resources);
        self.manager.release_in_reverse(&resources);
    }
}

impl std::fmt::Debug for HeldLocks<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeldLocks")
            .field("resources", &self.resources)
            .finish_non_exhaustive()
    }
}

/// Grants and releases named locks in a shared directory.
pub struct LockManager {
    dir: PathBuf,
    config: LockConfig,
    owner: Owner,
    probe: Box<dyn ProcessProbe>,
}

impl LockManager {
    /// Create a manager for `dir`, owned by the calling process.
    pub fn new(dir: impl Into<PathBuf>, config: LockConfig) -> Self {
        Self {
            dir: dir.into(),
            config,
            owner: Owner::current(),
            probe: Box::new(SystemProbe),
        }
    }

    /// Create a manager from the top-level config.
    pub fn from_config(config: &SafetyConfig) -> Self {
        Self::new(&config.lock_dir, config.lock)
    }

    /// Act as a different owner.
    pub fn with_owner(mut self, owner: Owner) -> Self {
        self.owner = owner;
        self
    }

    /// Use a different liveness probe.
    pub fn with_probe(mut self, probe: impl ProcessProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    /// The identity this manager acquires locks as.
    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    /// Directory holding the lock entries.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the lock entry for `resource`.
    pub fn lock_path(&self, resource: &ResourceId) -> PathBuf {
        self.dir.join(format!("{}.{LOCK_EXT}", resource.file_stem()))
    }

    /// Acquire using the configured timeout and poll interval.
    pub fn lock(&self, resource: &ResourceId) -> Result<LockRecord, LockError> {
        self.acquire(resource, self.config.timeout, self.config.poll_interval)
    }

    /// Block until the lock on `resource` is granted or `timeout` elapses.
    ///
    /// Each round tries an atomic create. If the entry exists and its owner is
    /// dead, the entry is reclaimed and the create retried at once; otherwise
    /// the caller sleeps `poll_interval` (never past the deadline).
    pub fn acquire(
        &self,
        resource: &ResourceId,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<LockRecord, LockError> {
        let path = self.lock_path(resource);
        let start = Instant::now();
        let deadline = start + timeout;
        let mut holder = String::from("unknown");

        loop {
            if let Some(record) = self.try_create(resource, &path)? {
                log::info!("Acquired lock on {resource}");
                return Ok(record);
            }

            match self.inspect(&path)? {
                // Released between our create and our read
                Entry::Missing => continue,
                Entry::Held { record, raw } => {
                    if self.probe.is_alive(&record.owner) {
                        holder = record.owner.to_string();
                        log::debug!("Lock on {resource} held by {holder}, waiting");
                    } else {
                        log::warn!(
                            "Lock on {resource} held by dead owner {}, reclaiming",
                            record.owner
                        );
                        if self.reclaim_entry(&path, &raw)? {
                            continue;
                        }
                    }
                }
                Entry::Unreadable { raw } => {
                    log::warn!("Unreadable lock entry {}, reclaiming", path.display());
                    if self.reclaim_entry(&path, &raw)? {
                        continue;
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::TimedOut {
                    resource: resource.clone(),
                    waited: now - start,
                    holder,
                });
            }
            thread::sleep(poll_interval.min(deadline - now));
        }
    }

    /// Single non-blocking attempt. Returns `Ok(None)` if the lock is held.
    pub fn try_acquire(&self, resource: &ResourceId) -> Result<Option<LockRecord>, LockError> {
        let path = self.lock_path(resource);
        let created = self.try_create(resource, &path)?;
        if created.is_some() {
            log::info!("Acquired lock on {resource}");
        }
        Ok(created)
    }

    /// Acquire every lock in `resources`, in sorted order.
    ///
    /// A fixed global order keeps two processes with overlapping sets from
    /// deadlocking. If any acquisition fails, the locks already taken are
    /// released before the error is returned. The returned guard releases
    /// everything in reverse order when dropped, including during a panic.
    pub fn acquire_all(&self, resources: &[ResourceId]) -> Result<HeldLocks<'_>, LockError> {
        let mut ordered = resources.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut held = HeldLocks {
            manager: self,
            resources: Vec::with_capacity(ordered.len()),
        };
        for resource in ordered {
            self.lock(&resource)?;
            held.resources.push(resource);
        }
        Ok(held)
    }

    fn release_in_reverse(&self, held: &[ResourceId]) {
        for resource in held.iter().rev() {
            if let Err(e) = self.release(resource) {
                log::error!("Failed to release lock on {resource}: {e}");
            }
        }
    }

    /// Run `f` while holding the lock on `resource`.
    ///
    /// The lock is released even if `f` panics.
    pub fn with_lock<T>(&self, resource: &ResourceId, f: impl FnOnce() -> T) -> Result<T, LockError> {
        let held = self.acquire_all(std::slice::from_ref(resource))?;
        let value = f();
        held.release()?;
        Ok(value)
    }

    /// Remove the lock entry if this process owns it.
    ///
    /// Fails with `NotOwner` (entry untouched) when another process holds it,
    /// and with `NotFound` when there is no entry.
    pub fn release(&self, resource: &ResourceId) -> Result<(), LockError> {
        let path = self.lock_path(resource);

        let record = match self.inspect(&path)? {
            Entry::Missing => {
                log::error!("Release of {resource} failed: no lock entry");
                return Err(LockError::NotFound {
                    resource: resource.clone(),
                });
            }
            Entry::Unreadable { .. } => {
                log::error!("Release of {resource} refused: lock entry is unreadable");
                return Err(LockError::NotOwner {
                    resource: resource.clone(),
                    owner: "<unreadable record>".to_string(),
                });
            }
            Entry::Held { record, .. } => record,
        };

        if !self.owner.same_process(&record.owner) {
            log::error!(
                "Release of {resource} refused: held by {}, not {}",
                record.owner,
                self.owner
            );
            return Err(LockError::NotOwner {
                resource: resource.clone(),
                owner: record.owner.to_string(),
            });
        }

        if !fsutil::remove_if_exists(&path).map_err(|e| LockError::io(&path, e))? {
            return Err(LockError::NotFound {
                resource: resource.clone(),
            });
        }
        log::info!("Released lock on {resource}");
        Ok(())
    }

    /// Release every lock owned by this process.
    ///
    /// Best effort: individual failures are logged and skipped. Returns the
    /// resources that were released.
    pub fn release_all(&self) -> Result<Vec<ResourceId>, LockError> {
        let mut released = Vec::new();
        for status in self.list()? {
            let Some(record) = status.record else {
                continue;
            };
            if !self.owner.same_process(&record.owner) {
                continue;
            }
            match self.release(&record.resource) {
                Ok(()) => released.push(record.resource),
                Err(e) => log::error!("Failed to release lock on {}: {e}", record.resource),
            }
        }
        Ok(released)
    }

    /// The current holder of `resource`, if any.
    pub fn holder(&self, resource: &ResourceId) -> Result<Option<LockRecord>, LockError> {
        match self.inspect(&self.lock_path(resource))? {
            Entry::Held { record, .. } => Ok(Some(record)),
            Entry::Missing | Entry::Unreadable { .. } => Ok(None),
        }
    }

    /// Reclaim the lock on `resource` if its owner is dead.
    ///
    /// Returns `true` if a stale entry was removed.
    pub fn reclaim_if_stale(&self, resource: &ResourceId) -> Result<bool, LockError> {
        let path = self.lock_path(resource);
        match self.inspect(&path)? {
            Entry::Missing => Ok(false),
            Entry::Held { record, raw } => {
                if self.probe.is_alive(&record.owner) {
                    Ok(false)
                } else {
                    log::warn!(
                        "Lock on {resource} held by dead owner {}, reclaiming",
                        record.owner
                    );
                    self.reclaim_entry(&path, &raw)
                }
            }
            Entry::Unreadable { raw } => self.reclaim_entry(&path, &raw),
        }
    }

    /// Every lock entry in the directory, with its liveness verdict.
    pub fn list(&self) -> Result<Vec<LockStatus>, LockError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LockError::io(&self.dir, e)),
        };

        let mut statuses = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| LockError::io(&self.dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOCK_EXT) {
                continue;
            }
            let status = match self.inspect(&path)? {
                Entry::Missing => continue,
                Entry::Held { record, .. } => LockStatus {
                    alive: self.probe.is_alive(&record.owner),
                    path,
                    record: Some(record),
                },
                Entry::Unreadable { .. } => LockStatus {
                    path,
                    record: None,
                    alive: false,
                },
            };
            statuses.push(status);
        }
        statuses.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(statuses)
    }

    /// Reclaim every stale entry. Returns the entries that were removed.
    pub fn sweep_stale(&self) -> Result<Vec<LockStatus>, LockError> {
        let mut reclaimed = Vec::new();
        for status in self.list()? {
            if !status.is_stale() {
                continue;
            }
            let raw = match fsutil::read_optional(&status.path) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => return Err(LockError::io(&status.path, e)),
            };
            if self.reclaim_entry(&status.path, &raw)? {
                reclaimed.push(status);
            }
        }
        if !reclaimed.is_empty() {
            log::info!("Swept {} stale lock(s)", reclaimed.len());
        }
        Ok(reclaimed)
    }

    fn try_create(&self, resource: &ResourceId, path: &Path) -> Result<Option<LockRecord>, LockError> {
        let record = LockRecord::new(resource.clone(), self.owner.clone());
        let data = record.to_bytes().map_err(|e| LockError::io(path, e))?;
        let created = fsutil::create_exclusive(path, &data).map_err(|e| LockError::io(path, e))?;
        Ok(created.then_some(record))
    }

    fn inspect(&self, path: &Path) -> Result<Entry, LockError> {
        let Some(raw) = fsutil::read_optional(path).map_err(|e| LockError::io(path, e))? else {
            return Ok(Entry::Missing);
        };
        match serde_json::from_slice::<LockRecord>(&raw) {
            Ok(record) => Ok(Entry::Held { record, raw }),
            Err(e) => {
                log::debug!("Lock entry {} does not parse: {e}", path.display());
                Ok(Entry::Unreadable { raw })
            }
        }
    }

    /// Remove the entry at `path` if it still holds exactly `expected`.
    ///
    /// Runs under the per-lock guard so two reclaimers cannot interleave.
    /// Returns `false` if the guard is busy or the entry changed.
    fn reclaim_entry(&self, path: &Path, expected: &[u8]) -> Result<bool, LockError> {
        let guard = path.with_extension(GUARD_EXT);
        let guard_record = LockRecord {
            resource: ResourceId::new("guard", path.display().to_string()),
            owner: self.owner.clone(),
            acquired_at: Utc::now(),
        };
        let guard_data = guard_record.to_bytes().map_err(|e| LockError::io(&guard, e))?;

        if !fsutil::create_exclusive(&guard, &guard_data).map_err(|e| LockError::io(&guard, e))? {
            self.clear_dead_guard(&guard)?;
            return Ok(false);
        }

        let outcome = match fsutil::read_optional(path) {
            Ok(Some(current)) if current == expected => fsutil::remove_if_exists(path)
                .map_err(|e| LockError::io(path, e)),
            Ok(_) => Ok(false),
            Err(e) => Err(LockError::io(path, e)),
        };

        if let Err(e) = fsutil::remove_if_exists(&guard) {
            log::error!("Failed to drop reclaim guard {}: {e}", guard.display());
        }

        if matches!(outcome, Ok(true)) {
            log::info!("Reclaimed stale lock {}", path.display());
        }
        outcome
    }

    /// Remove a reclaim guard left behind by a reclaimer that died.
    fn clear_dead_guard(&self, guard: &Path) -> Result<(), LockError> {
        let Some(raw) = fsutil::read_optional(guard).map_err(|e| LockError::io(guard, e))? else {
            return Ok(());
        };
        let dead = match serde_json::from_slice::<LockRecord>(&raw) {
            Ok(record) => !self.probe.is_alive(&record.owner),
            Err(_) => true,
        };
        if !dead {
            return Ok(());
        }

        // Re-check right before removal to narrow the window against a fresh guard
        if fsutil::read_optional(guard).map_err(|e| LockError::io(guard, e))?.as_deref()
            == Some(raw.as_slice())
        {
            log::warn!("Removing abandoned reclaim guard {}", guard.display());
            fsutil::remove_if_exists(guard).map_err(|e| LockError::io(guard, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Probe that declares a fixed set of pids dead.
    struct FixedProbe {
        dead: HashSet<u32>,
    }

    impl FixedProbe {
        fn dead(pids: &[u32]) -> Self {
            Self {
                dead: pids.iter().copied().collect(),
            }
        }
    }

    impl ProcessProbe for FixedProbe {
        fn is_alive(&self, owner: &Owner) -> bool {
            !self.dead.contains(&owner.pid)
        }
    }

    fn fake_owner(pid: u32) -> Owner {
        Owner {
            pid,
            label: format!("otherhost:cloudsweep[{pid}]"),
            start_time: None,
            boot_id: None,
        }
    }

    fn config() -> LockConfig {
        LockConfig {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(5),
        }
    }

    fn disk() -> ResourceId {
        ResourceId::new("disk", "disk-1")
    }

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path(), config());

        let record = locks.lock(&disk()).unwrap();
        assert_eq!(record.resource, disk());
        assert_eq!(record.owner.pid, std::process::id());
        assert!(locks.lock_path(&disk()).exists());
        assert_eq!(locks.holder(&disk()).unwrap().unwrap().owner, record.owner);

        locks.release(&disk()).unwrap();
        assert!(!locks.lock_path(&disk()).exists());
        assert!(locks.holder(&disk()).unwrap().is_none());
    }

    #[test]
    fn test_try_acquire_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let other = LockManager::new(dir.path(), config()).with_owner(fake_owner(4_000_001));
        let mine = LockManager::new(dir.path(), config());

        assert!(other.try_acquire(&disk()).unwrap().is_some());
        assert!(mine.try_acquire(&disk()).unwrap().is_none());
    }

    #[test]
    fn test_acquire_times_out_while_owner_alive() {
        let dir = tempfile::tempdir().unwrap();
        let other = LockManager::new(dir.path(), config()).with_owner(fake_owner(4_000_002));
        other.lock(&disk()).unwrap();

        let mine = LockManager::new(dir.path(), config()).with_probe(FixedProbe::dead(&[]));
        let start = Instant::now();
        let err = mine
            .acquire(&disk(), Duration::from_millis(60), Duration::from_millis(10))
            .unwrap_err();

        assert!(start.elapsed() >= Duration::from_millis(60));
        match err {
            LockError::TimedOut { resource, holder, .. } => {
                assert_eq!(resource, disk());
                assert!(holder.contains("4000002"), "{holder}");
            }
            other => panic!("expected TimedOut, got {other:?}"),
        }
        // The holder's entry is untouched
        assert_eq!(
            other.holder(&disk()).unwrap().unwrap().owner.pid,
            4_000_002
        );
    }

    #[test]
    fn test_release_by_non_owner_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let owner = LockManager::new(dir.path(), config());
        let intruder = LockManager::new(dir.path(), config()).with_owner(fake_owner(4_000_003));

        owner.lock(&disk()).unwrap();
        let err = intruder.release(&disk()).unwrap_err();
        assert!(matches!(err, LockError::NotOwner { .. }));
        assert!(owner.lock_path(&disk()).exists());

        owner.release(&disk()).unwrap();
    }

    #[test]
    fn test_release_without_lock_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path(), config());
        assert!(matches!(
            locks.release(&disk()).unwrap_err(),
            LockError::NotFound { .. }
        ));
    }

    #[test]
    fn test_stale_lock_is_reclaimed_within_one_poll_interval() {
        let dir = tempfile::tempdir().unwrap();
        let dead_pid = 4_000_004;
        LockManager::new(dir.path(), config())
            .with_owner(fake_owner(dead_pid))
            .lock(&disk())
            .unwrap();

        let poll = Duration::from_millis(500);
        let mine = LockManager::new(dir.path(), config()).with_probe(FixedProbe::dead(&[dead_pid]));
        let start = Instant::now();
        let record = mine.acquire(&disk(), Duration::from_secs(10), poll).unwrap();

        assert!(start.elapsed() < poll);
        assert_eq!(record.owner.pid, std::process::id());
        assert!(!dir.path().join(format!("{}.reclaim", disk().file_stem())).exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_lock_of_exited_process_is_reclaimed_with_system_probe() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        LockManager::new(dir.path(), config())
            .with_owner(fake_owner(pid))
            .lock(&disk())
            .unwrap();

        let mine = LockManager::new(dir.path(), config());
        assert!(mine.reclaim_if_stale(&disk()).unwrap());
        assert!(mine.try_acquire(&disk()).unwrap().is_some());
    }

    #[test]
    fn test_reclaim_if_stale_leaves_live_lock() {
        let dir = tempfile::tempdir().unwrap();
        LockManager::new(dir.path(), config())
            .with_owner(fake_owner(4_000_005))
            .lock(&disk())
            .unwrap();

        let mine = LockManager::new(dir.path(), config()).with_probe(FixedProbe::dead(&[]));
        assert!(!mine.reclaim_if_stale(&disk()).unwrap());
        assert!(mine.lock_path(&disk()).exists());
    }

    #[test]
    fn test_unreadable_entry_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path(), config());
        fs::create_dir_all(dir.path()).unwrap();
        fs::write(locks.lock_path(&disk()), b"{ not json").unwrap();

        let record = locks.lock(&disk()).unwrap();
        assert_eq!(record.owner.pid, std::process::id());
    }

    #[test]
    fn test_reclaim_skips_entry_that_changed() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path(), config());
        locks.lock(&disk()).unwrap();

        // Bytes that no longer match the live entry
        let path = locks.lock_path(&disk());
        assert!(!locks.reclaim_entry(&path, b"stale snapshot").unwrap());
        assert!(path.exists());
    }

    #[test]
    fn test_abandoned_guard_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let dead_pid = 4_000_006;
        let dead = LockManager::new(dir.path(), config()).with_owner(fake_owner(dead_pid));
        dead.lock(&disk()).unwrap();

        // A reclaimer that died while holding the guard
        let guard = dead.lock_path(&disk()).with_extension(GUARD_EXT);
        let guard_record = LockRecord::new(ResourceId::new("guard", "x"), fake_owner(dead_pid));
        fs::write(&guard, guard_record.to_bytes().unwrap()).unwrap();

        let mine = LockManager::new(dir.path(), config()).with_probe(FixedProbe::dead(&[dead_pid]));
        let record = mine.lock(&disk()).unwrap();
        assert_eq!(record.owner.pid, std::process::id());
        assert!(!guard.exists());
    }

    #[test]
    fn test_release_all_only_touches_own_locks() {
        let dir = tempfile::tempdir().unwrap();
        let mine = LockManager::new(dir.path(), config());
        let other = LockManager::new(dir.path(), config()).with_owner(fake_owner(4_000_007));

        let ids = [
            ResourceId::new("disk", "a"),
            ResourceId::new("disk", "b"),
            ResourceId::new("instance", "c"),
        ];
        for id in &ids {
            mine.lock(id).unwrap();
        }
        other.lock(&ResourceId::new("network", "shared")).unwrap();

        let mut released = mine.release_all().unwrap();
        released.sort();
        assert_eq!(released, ids.to_vec());

        let remaining = mine.list().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(
            remaining[0].record.as_ref().unwrap().resource,
            ResourceId::new("network", "shared")
        );
    }

    #[test]
    fn test_list_and_sweep_stale() {
        let dir = tempfile::tempdir().unwrap();
        let dead_pid = 4_000_008;
        LockManager::new(dir.path(), config())
            .with_owner(fake_owner(dead_pid))
            .lock(&ResourceId::new("disk", "orphan"))
            .unwrap();

        let mine = LockManager::new(dir.path(), config()).with_probe(FixedProbe::dead(&[dead_pid]));
        mine.lock(&ResourceId::new("disk", "live")).unwrap();

        let statuses = mine.list().unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses.iter().filter(|s| s.is_stale()).count(), 1);

        let swept = mine.sweep_stale().unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(
            swept[0].record.as_ref().unwrap().resource,
            ResourceId::new("disk", "orphan")
        );
        assert_eq!(mine.list().unwrap().len(), 1);
    }

    #[test]
    fn test_list_on_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path().join("absent"), config());
        assert!(locks.list().unwrap().is_empty());
    }

    #[test]
    fn test_acquire_all_rolls_back_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let other = LockManager::new(dir.path(), config()).with_owner(fake_owner(4_000_009));
        other.lock(&ResourceId::new("disk", "b")).unwrap();

        let mine = LockManager::new(
            dir.path(),
            LockConfig {
                timeout: Duration::from_millis(30),
                poll_interval: Duration::from_millis(5),
            },
        )
        .with_probe(FixedProbe::dead(&[]));

        let err = mine
            .acquire_all(&[ResourceId::new("disk", "c"), ResourceId::new("disk", "a"), ResourceId::new("disk", "b")])
            .unwrap_err();
        assert!(matches!(err, LockError::TimedOut { .. }));

        // "a" was taken first (sorted order) and must have been released
        assert!(mine.holder(&ResourceId::new("disk", "a")).unwrap().is_none());
        assert!(mine.holder(&ResourceId::new("disk", "c")).unwrap().is_none());
    }

    #[test]
    fn test_with_lock_releases_afterwards() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path(), config());
        let value = locks
            .with_lock(&disk(), || {
                assert!(locks.lock_path(&disk()).exists());
                7
            })
            .unwrap();
        assert_eq!(value, 7);
        assert!(!locks.lock_path(&disk()).exists());
    }

    #[test]
    fn test_with_lock_releases_when_closure_panics() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path(), config());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            locks.with_lock(&disk(), || {
                if locks.lock_path(&disk()).exists() {
                    panic!("interrupted while holding the lock");
                }
                0
            })
        }));

        assert!(result.is_err());
        assert!(!locks.lock_path(&disk()).exists());
        assert!(locks.try_acquire(&disk()).unwrap().is_some());
    }

    #[test]
    fn test_held_locks_release_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path(), config());
        let ids = [ResourceId::new("disk", "b"), ResourceId::new("disk", "a")];

        {
            let held = locks.acquire_all(&ids).unwrap();
            assert_eq!(held.resources(), &[ResourceId::new("disk", "a"), ResourceId::new("disk", "b")]);
            assert_eq!(locks.list().unwrap().len(), 2);
        }
        assert!(locks.list().unwrap().is_empty());
    }

    #[test]
    fn test_held_locks_release_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path(), config());
        let held = locks.acquire_all(&[disk()]).unwrap();

        fs::remove_file(locks.lock_path(&disk())).unwrap();
        assert!(matches!(held.release(), Err(LockError::NotFound { .. })));
    }

    #[test]
    fn test_mutual_exclusion_under_contention() {
        let dir = tempfile::tempdir().unwrap();
        let in_critical = Arc::new(AtomicUsize::new(0));
        let acquisitions = Arc::new(AtomicUsize::new(0));
        let releases = Arc::new(AtomicUsize::new(0));

        thread::scope(|s| {
            for _ in 0..8 {
                let in_critical = Arc::clone(&in_critical);
                let acquisitions = Arc::clone(&acquisitions);
                let releases = Arc::clone(&releases);
                let path = dir.path();
                s.spawn(move || {
                    let locks = LockManager::new(path, config());
                    for _ in 0..5 {
                        locks
                            .acquire(&disk(), Duration::from_secs(30), Duration::from_millis(1))
                            .unwrap();
                        acquisitions.fetch_add(1, Ordering::SeqCst);

                        let holders = in_critical.fetch_add(1, Ordering::SeqCst) + 1;
                        assert_eq!(holders, 1, "two holders at once");
                        thread::sleep(Duration::from_millis(1));
                        in_critical.fetch_sub(1, Ordering::SeqCst);

                        locks.release(&disk()).unwrap();
                        releases.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(acquisitions.load(Ordering::SeqCst), 40);
        assert_eq!(acquisitions.load(Ordering::SeqCst), releases.load(Ordering::SeqCst));
    }

    #[test]
    fn test_contended_reclaim_has_single_winner_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let dead_pid = 4_000_010;
        LockManager::new(dir.path(), config())
            .with_owner(fake_owner(dead_pid))
            .lock(&disk())
            .unwrap();

        let in_critical = Arc::new(AtomicUsize::new(0));
        thread::scope(|s| {
            for _ in 0..6 {
                let in_critical = Arc::clone(&in_critical);
                let path = dir.path();
                s.spawn(move || {
                    let locks =
                        LockManager::new(path, config()).with_probe(FixedProbe::dead(&[dead_pid]));
                    locks
                        .acquire(&disk(), Duration::from_secs(30), Duration::from_millis(1))
                        .unwrap();
                    assert_eq!(in_critical.fetch_add(1, Ordering::SeqCst), 0);
                    thread::sleep(Duration::from_millis(2));
                    in_critical.fetch_sub(1, Ordering::SeqCst);
                    locks.release(&disk()).unwrap();
                });
            }
        });

        assert!(!dir.path().join(format!("{}.lock", disk().file_stem())).exists());
    }
}
