//! Filesystem layout.
//!
//! Resolves the physical directory a store lives in from a logical folder
//! kind. Two layouts exist:
//! - **Local**: per-user platform directories (`directories::BaseDirs`)
//! - **Shared group**: one container directory shared by every process of an
//!   application group, with `Library/`, `Caches/` and `Documents/` inside
//!
//! Folders are created on first use.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory under the platform dirs that local layouts use.
const APP_DIR: &str = "storestack";

/// Directory holding group containers, under the local data dir.
const GROUP_CONTAINERS_DIR: &str = "group-containers";

/// Logical folder a store can be kept in.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum FolderKind {
    #[default]
    Library,
    Caches,
    Documents,
}

impl FolderKind {
    /// Directory name inside a group container.
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Library => "Library",
            Self::Caches => "Caches",
            Self::Documents => "Documents",
        }
    }
}

impl fmt::Display for FolderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Resolves folder kinds to directories.
pub trait FolderLayout: Send + Sync + fmt::Debug {
    /// Directory for `kind`, created if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    fn folder(&self, kind: FolderKind) -> Result<PathBuf>;

    /// Directory named `name` inside the folder for `kind`.
    ///
    /// # Errors
    ///
    /// Returns an error if the folder cannot be created.
    fn url(&self, name: &str, kind: FolderKind) -> Result<PathBuf> {
        Ok(self.folder(kind)?.join(name))
    }
}

/// Per-user platform directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalLayout {
    library: PathBuf,
    caches: PathBuf,
    documents: PathBuf,
}

impl LocalLayout {
    /// Resolve the current user's directories.
    ///
    /// # Errors
    ///
    /// Returns `Config` if no home directory can be determined.
    pub fn new() -> Result<Self> {
        let base = directories::BaseDirs::new()
            .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;
        let documents = directories::UserDirs::new()
            .and_then(|dirs| dirs.document_dir().map(Path::to_path_buf))
            .unwrap_or_else(|| base.home_dir().join("Documents"));

        Ok(Self {
            library: base.data_local_dir().join(APP_DIR),
            caches: base.cache_dir().join(APP_DIR),
            documents: documents.join(APP_DIR),
        })
    }

    /// A layout with every folder under `root`.
    #[cfg(test)]
    #[must_use]
    pub(crate) fn rooted(root: &Path) -> Self {
        Self {
            library: root.join(FolderKind::Library.dir_name()),
            caches: root.join(FolderKind::Caches.dir_name()),
            documents: root.join(FolderKind::Documents.dir_name()),
        }
    }

    fn path(&self, kind: FolderKind) -> &Path {
        match kind {
            FolderKind::Library => &self.library,
            FolderKind::Caches => &self.caches,
            FolderKind::Documents => &self.documents,
        }
    }
}

impl FolderLayout for LocalLayout {
    fn folder(&self, kind: FolderKind) -> Result<PathBuf> {
        create_if_needed(self.path(kind))
    }
}

/// Container shared by an application group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedGroupLayout {
    group: String,
    container: PathBuf,
}

impl SharedGroupLayout {
    /// Resolve the container of `group` under the local data directory.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the group is empty or no home directory exists.
    pub fn new(group: &str) -> Result<Self> {
        let base = directories::BaseDirs::new()
            .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;
        Self::with_container(
            group,
            &base
                .data_local_dir()
                .join(GROUP_CONTAINERS_DIR)
                .join(group),
        )
    }

    /// Use `container` as the group's container directory.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the group is empty.
    pub fn with_container(group: &str, container: &Path) -> Result<Self> {
        if group.trim().is_empty() {
            return Err(Error::Config("Application group must not be empty".to_string()));
        }
        Ok(Self {
            group: group.to_string(),
            container: container.to_path_buf(),
        })
    }

    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    #[must_use]
    pub fn container(&self) -> &Path {
        &self.container
    }
}

impl FolderLayout for SharedGroupLayout {
    fn folder(&self, kind: FolderKind) -> Result<PathBuf> {
        create_if_needed(&self.container.join(kind.dir_name()))
    }
}

/// The layout for an optional application group.
///
/// # Errors
///
/// Returns `Config` if the platform directories cannot be resolved.
pub fn layout_for(app_group: Option<&str>) -> Result<Box<dyn FolderLayout>> {
    match app_group {
        Some(group) => Ok(Box::new(SharedGroupLayout::new(group)?)),
        None => Ok(Box::new(LocalLayout::new()?)),
    }
}

fn create_if_needed(path: &Path) -> Result<PathBuf> {
    if !path.exists() {
        fs::create_dir_all(path)?;
        debug!(path = %path.display(), "Created folder");
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_shared_group_creates_folders() {
        let dir = TempDir::new().unwrap();
        let layout = SharedGroupLayout::with_container("group.notes", dir.path()).unwrap();

        let store_dir = layout.url("Notes", FolderKind::Library).unwrap();
        assert_eq!(store_dir, dir.path().join("Library").join("Notes"));
        assert!(dir.path().join("Library").is_dir());
        assert!(!dir.path().join("Caches").exists());

        assert!(layout.folder(FolderKind::Caches).unwrap().is_dir());
    }

    #[test]
    fn test_empty_group_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = SharedGroupLayout::with_container(" ", dir.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rooted_local_layout() {
        let dir = TempDir::new().unwrap();
        let layout = LocalLayout::rooted(dir.path());
        assert_eq!(
            layout.folder(FolderKind::Documents).unwrap(),
            dir.path().join("Documents")
        );
    }

    #[test]
    fn test_folder_kind_serde() {
        let kind: FolderKind = serde_json::from_str("\"caches\"").unwrap();
        assert_eq!(kind, FolderKind::Caches);
        assert_eq!(serde_json::to_string(&FolderKind::Library).unwrap(), "\"library\"");
    }
}
