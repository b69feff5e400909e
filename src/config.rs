//! Configuration management.
//!
//! A JSON file describes where models and the store live:
//!
//! ```json
//! {
//!   "name": "Notes",
//!   "models_dir": "/opt/notes/models",
//!   "folder": "library",
//!   "app_group": "group.notes",
//!   "pragmas": { "synchronous": "NORMAL" },
//!   "busy_timeout_ms": 5000
//! }
//! ```
//!
//! Every field is optional; command-line flags override the file.

use crate::error::{Error, Result};
use crate::layout::{FolderKind, FolderLayout, LocalLayout, layout_for};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "STORESTACK_CONFIG";

/// Settings for opening a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Store name, used as the file stem.
    pub name: Option<String>,
    /// Directory of `<id>.sql` models and `<from>-<to>.mapping.sql` mappings.
    pub models_dir: Option<PathBuf>,
    /// Explicit store directory. Overrides `folder` and `app_group`.
    pub store_dir: Option<PathBuf>,
    pub folder: FolderKind,
    /// Application group sharing the store. Unset means per-user folders.
    pub app_group: Option<String>,
    /// Pragmas applied when the store opens.
    pub pragmas: BTreeMap<String, String>,
    pub busy_timeout_ms: Option<u64>,
}

impl StackConfig {
    /// Directory the store `name` lives in.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the folder layout cannot be resolved.
    pub fn store_directory(&self, name: &str) -> Result<PathBuf> {
        match &self.store_dir {
            Some(dir) => Ok(dir.clone()),
            None => layout_for(self.app_group.as_deref())?.url(name, self.folder),
        }
    }

    /// Per-user directory a store kept before it moved into a shared group.
    ///
    /// `None` unless an application group is configured.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the local layout cannot be resolved.
    pub fn legacy_directory(&self, name: &str) -> Result<Option<PathBuf>> {
        if self.app_group.is_none() || self.store_dir.is_some() {
            return Ok(None);
        }
        Ok(Some(LocalLayout::new()?.url(name, self.folder)?))
    }

    #[must_use]
    pub fn busy_timeout(&self) -> Option<Duration> {
        self.busy_timeout_ms.map(Duration::from_millis)
    }
}

/// Default config file location: `~/.storestack/config.json`.
///
/// # Errors
///
/// Returns `Config` if no home directory can be determined.
pub fn default_config_path() -> Result<PathBuf> {
    directories::BaseDirs::new()
        .map(|b| b.home_dir().join(".storestack").join("config.json"))
        .ok_or_else(|| Error::Config("Could not determine home directory".into()))
}

/// Resolve the config file path.
///
/// Priority:
/// 1. `explicit` (the `--config` flag)
/// 2. `STORESTACK_CONFIG` environment variable
/// 3. `~/.storestack/config.json`
///
/// Returns the path and whether it must exist.
///
/// # Errors
///
/// Returns `Config` if the default location cannot be determined.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<(PathBuf, bool)> {
    if let Some(path) = explicit {
        return Ok((path.to_path_buf(), true));
    }

    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.is_empty() {
            return Ok((PathBuf::from(path), true));
        }
    }

    Ok((default_config_path()?, false))
}

/// Load the config, falling back to defaults when the default file is absent.
///
/// # Errors
///
/// Returns `Config` if an explicitly named file is missing or any file
/// cannot be read or parsed.
pub fn load_config(explicit: Option<&Path>) -> Result<StackConfig> {
    let (path, required) = resolve_config_path(explicit)?;

    if !path.exists() {
        if required {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        return Ok(StackConfig::default());
    }

    read_config(&path)
}

/// Read and parse one config file.
///
/// # Errors
///
/// Returns `Config` if the file cannot be read or parsed.
pub fn read_config(path: &Path) -> Result<StackConfig> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config file: {e}")))?;

    serde_json::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse config file: {e}")))
}

/// Write `config` to `path`, creating parent directories.
///
/// # Errors
///
/// Returns `Config` if the file cannot be written.
pub fn save_config(path: &Path, config: &StackConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::Config(format!("Failed to create config directory: {e}")))?;
    }

    let content = serde_json::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

    fs::write(path, content).map_err(|e| Error::Config(format!("Failed to write config file: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "name": "Notes", "folder": "caches" }"#).unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.name.as_deref(), Some("Notes"));
        assert_eq!(config.folder, FolderKind::Caches);
        assert!(config.pragmas.is_empty());
        assert_eq!(config.busy_timeout(), None);
    }

    #[test]
    fn test_explicit_missing_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = load_config(Some(&dir.path().join("missing.json"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_malformed_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        let err = read_config(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_save_and_store_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = StackConfig {
            name: Some("Notes".into()),
            store_dir: Some(dir.path().join("stores")),
            app_group: Some("group.notes".into()),
            busy_timeout_ms: Some(250),
            ..StackConfig::default()
        };
        save_config(&path, &config).unwrap();

        let loaded = read_config(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.store_directory("Notes").unwrap(), dir.path().join("stores"));
        assert_eq!(loaded.legacy_directory("Notes").unwrap(), None);
        assert_eq!(loaded.busy_timeout(), Some(Duration::from_millis(250)));
    }
}
