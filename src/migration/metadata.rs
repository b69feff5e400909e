//! Store file metadata and whole-file operations.
//!
//! The schema version a store was created with is recorded in SQLite's
//! `user_version` header field. Everything here works on the file as a
//! unit: reading the header, checkpointing the write-ahead log, and
//! destroying or replacing the file together with its sidecars.

use crate::error::{Error, Result};
use rusqlite::{Connection, OpenFlags};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Metadata embedded in a store file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMetadata {
    /// Schema identifier from `user_version`.
    pub version: i32,
    /// User tables present in the file.
    pub tables: Vec<String>,
    /// Current journal mode (`wal`, `delete`, ...).
    pub journal_mode: String,
}

impl StoreMetadata {
    /// Read the metadata of the store at `path`.
    ///
    /// Returns `None` if the file does not exist or is not a database.
    #[must_use]
    pub fn read(path: &Path) -> Option<Self> {
        if !path.is_file() {
            return None;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .ok()?;

        let read = || -> rusqlite::Result<Self> {
            let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
            let journal_mode: String =
                conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
            let tables = conn
                .prepare(
                    "SELECT name FROM sqlite_master
                     WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                     ORDER BY name",
                )?
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(Self {
                version,
                tables,
                journal_mode: journal_mode.to_lowercase(),
            })
        };

        match read() {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Store metadata unreadable");
                None
            }
        }
    }

    /// Whether the file carries no schema at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.version == 0 && self.tables.is_empty()
    }
}

/// Paths of the write-ahead log and shared-memory sidecars of a store.
#[must_use]
pub fn sidecar_paths(path: &Path) -> [PathBuf; 2] {
    let base = path.as_os_str().to_string_lossy();
    [
        PathBuf::from(format!("{base}-wal")),
        PathBuf::from(format!("{base}-shm")),
    ]
}

/// Fold any write-ahead log content into the main store file.
///
/// Opens the store once, checkpoints and switches it to rollback journaling,
/// then closes it. Stores that are not in WAL mode are left untouched.
///
/// # Errors
///
/// Returns `Checkpoint` if the store cannot be opened or checkpointed.
pub fn force_wal_checkpoint(path: &Path) -> Result<()> {
    let checkpoint = || -> rusqlite::Result<bool> {
        let conn = Connection::open(path)?;
        let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            return Ok(false);
        }
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        conn.pragma_update(None, "journal_mode", "DELETE")?;
        conn.close().map_err(|(_, e)| e)?;
        Ok(true)
    };

    match checkpoint() {
        Ok(true) => {
            info!(path = %path.display(), "Checkpointed write-ahead log");
            Ok(())
        }
        Ok(false) => Ok(()),
        Err(source) => Err(Error::Checkpoint {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Remove a store file and its sidecars. Missing files are ignored.
///
/// # Errors
///
/// Returns an error if an existing file cannot be removed.
pub fn destroy_store(path: &Path) -> Result<()> {
    for file in std::iter::once(path.to_path_buf()).chain(sidecar_paths(path)) {
        match fs::remove_file(&file) {
            Ok(()) => debug!(path = %file.display(), "Removed store file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Replace the store at `target` with the finished store at `source`.
///
/// The original is removed only after `source` is confirmed to exist, then
/// `source` is moved into place. Falls back to copy-and-remove when the two
/// paths live on different filesystems.
///
/// # Errors
///
/// Returns `ReplaceStore` if any file operation fails.
pub fn replace_store(target: &Path, source: &Path) -> Result<()> {
    let wrap = |source: std::io::Error| Error::ReplaceStore {
        path: target.to_path_buf(),
        source,
    };

    if !source.is_file() {
        return Err(wrap(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("migrated store missing at {}", source.display()),
        )));
    }

    destroy_store(target).map_err(|e| match e {
        Error::Io(io) => wrap(io),
        other => other,
    })?;

    if fs::rename(source, target).is_err() {
        fs::copy(source, target).map_err(wrap)?;
        fs::remove_file(source).map_err(wrap)?;
    }

    info!(path = %target.display(), "Replaced store with migrated copy");
    Ok(())
}
