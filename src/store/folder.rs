//! Store directory setup.

use crate::error::Result;
use crate::migration::metadata::sidecar_paths;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Path of the store file named `name` inside `directory`.
#[must_use]
pub fn store_path(directory: &Path, name: &str) -> PathBuf {
    directory.join(format!("{name}.sqlite"))
}

/// Create `directory` if needed and remove entries that do not belong to the
/// store `name`.
///
/// An entry belongs to the store when its stem (name without the last
/// extension) ends with `name`, so `{name}.sqlite` and its `-wal`/`-shm`
/// sidecars are kept. Returns the removed paths.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or listed.
pub fn prepare_folder(directory: &Path, name: &str) -> Result<Vec<PathBuf>> {
    if !directory.exists() {
        fs::create_dir_all(directory)?;
        debug!(path = %directory.display(), "Created store directory");
        return Ok(Vec::new());
    }

    let mut removed = Vec::new();
    for path in stray_entries(directory, name)? {
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => {
                info!(path = %path.display(), "Removed stray store file");
                removed.push(path);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove stray store file"),
        }
    }
    Ok(removed)
}

/// Entries of `directory` that [`prepare_folder`] would remove.
///
/// # Errors
///
/// Returns an error if the directory cannot be listed.
pub fn stray_entries(directory: &Path, name: &str) -> Result<Vec<PathBuf>> {
    let mut stray = Vec::new();
    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        let belongs = path
            .file_stem()
            .is_some_and(|stem| stem.to_string_lossy().ends_with(name));
        if !belongs {
            stray.push(path);
        }
    }
    stray.sort();
    Ok(stray)
}

/// Move the store `name` and its sidecars from `legacy` into `directory`.
///
/// Nothing happens when the legacy store is absent or a store already
/// exists in `directory`. Returns whether the store was moved.
///
/// # Errors
///
/// Returns an error if a file cannot be moved.
pub fn relocate_legacy_store(legacy: &Path, directory: &Path, name: &str) -> Result<bool> {
    let source = store_path(legacy, name);
    let target = store_path(directory, name);
    if !source.is_file() || target.exists() || legacy == directory {
        return Ok(false);
    }

    fs::create_dir_all(directory)?;
    let sources = std::iter::once(source.clone()).chain(sidecar_paths(&source));
    let targets = std::iter::once(target.clone()).chain(sidecar_paths(&target));
    for (from, to) in sources.zip(targets) {
        if !from.exists() {
            continue;
        }
        if fs::rename(&from, &to).is_err() {
            fs::copy(&from, &to)?;
            fs::remove_file(&from)?;
        }
    }

    info!(from = %source.display(), to = %target.display(), "Relocated legacy store");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_prepare_folder_removes_only_strays() {
        let dir = TempDir::new().unwrap();
        for file in ["Notes.sqlite", "Notes.sqlite-wal", "stale.sqlite"] {
            fs::write(dir.path().join(file), b"").unwrap();
        }

        let removed = prepare_folder(dir.path(), "Notes").unwrap();

        assert_eq!(removed, vec![dir.path().join("stale.sqlite")]);
        assert!(dir.path().join("Notes.sqlite").exists());
        assert!(dir.path().join("Notes.sqlite-wal").exists());
        assert!(!dir.path().join("stale.sqlite").exists());
    }

    #[test]
    fn test_prepare_folder_creates_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");

        assert!(prepare_folder(&nested, "Notes").unwrap().is_empty());
        assert!(nested.is_dir());
    }

    #[test]
    fn test_relocate_legacy_store() {
        let legacy = TempDir::new().unwrap();
        let shared = TempDir::new().unwrap();
        fs::write(legacy.path().join("Notes.sqlite"), b"db").unwrap();
        fs::write(legacy.path().join("Notes.sqlite-wal"), b"wal").unwrap();

        assert!(relocate_legacy_store(legacy.path(), shared.path(), "Notes").unwrap());
        assert_eq!(fs::read(shared.path().join("Notes.sqlite")).unwrap(), b"db");
        assert!(shared.path().join("Notes.sqlite-wal").exists());
        assert!(!legacy.path().join("Notes.sqlite").exists());

        fs::write(legacy.path().join("Notes.sqlite"), b"older").unwrap();
        assert!(!relocate_legacy_store(legacy.path(), shared.path(), "Notes").unwrap());
        assert_eq!(fs::read(shared.path().join("Notes.sqlite")).unwrap(), b"db");
    }
}
