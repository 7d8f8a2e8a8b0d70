//! Atomic filesystem primitives.
//!
//! These two functions are the only way shared files are mutated:
//! - [`atomic_write`]: write a temp file next to the target, fsync, rename over it
//! - [`create_exclusive`]: write a temp file, fsync, hard-link it to the target
//!
//! `link(2)` fails with `EEXIST` when the target exists, so `create_exclusive`
//! is a create-if-absent that also never exposes a half-written file.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;

fn parent_dir(target: &Path) -> &Path {
    match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn write_temp(dir: &Path, data: &[u8]) -> io::Result<NamedTempFile> {
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    Ok(temp)
}

/// fsync a directory so a rename or link inside it is durable.
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Ok(handle) = fs::File::open(dir) {
            let _ = handle.sync_all();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
}

/// Replace `target` with `data` in one atomic rename.
///
/// Readers see either the old content or the new content, never a mix.
pub fn atomic_write(target: &Path, data: &[u8]) -> io::Result<()> {
    let dir = parent_dir(target);
    fs::create_dir_all(dir)?;

    let temp = write_temp(dir, data)?;
    temp.persist(target).map_err(|e| e.error)?;
    sync_dir(dir);
    Ok(())
}

/// Create `target` holding `data`, only if nothing exists at that path.
///
/// Returns `Ok(false)` when the target already exists.
pub fn create_exclusive(target: &Path, data: &[u8]) -> io::Result<bool> {
    let dir = parent_dir(target);
    fs::create_dir_all(dir)?;

    // The temp file is unlinked on drop; the hard link keeps the content alive
    let temp = write_temp(dir, data)?;
    match fs::hard_link(temp.path(), target) {
        Ok(()) => {
            sync_dir(dir);
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

/// Read a file, mapping "not found" to `None`.
pub fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
