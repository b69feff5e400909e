//! Store resolution shared by the store commands.

use crate::cli::StoreArgs;
use crate::config::{StackConfig, load_config};
use crate::error::{Error, Result};
use crate::migration::{MigrationEngine, VersionChain};
use crate::schema::{ModelBundle, ModelSource};
use crate::store::{StoreDescriptor, store_path};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A store named on the command line, merged with the config file.
#[derive(Debug)]
pub struct StoreTarget {
    pub name: String,
    pub directory: PathBuf,
    pub legacy_directory: Option<PathBuf>,
    pub models: ModelBundle,
    pub pragmas: BTreeMap<String, String>,
    pub busy_timeout: Option<Duration>,
}

impl StoreTarget {
    /// Merge `args` over the config file and load the model directory.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if no store name or model directory is
    /// given, `ModelNotFound` if the model directory does not exist, or a
    /// config error.
    pub fn resolve(args: &StoreArgs, config_path: Option<&Path>) -> Result<Self> {
        let config = load_config(config_path)?;
        let merged = StackConfig {
            name: args.name.clone().or(config.name),
            models_dir: args.models.clone().or(config.models_dir),
            store_dir: args.store_dir.clone().or(config.store_dir),
            folder: args.folder.unwrap_or(config.folder),
            app_group: args.app_group.clone().or(config.app_group),
            pragmas: config.pragmas,
            busy_timeout_ms: config.busy_timeout_ms,
        };

        let name = merged.name.clone().ok_or_else(|| {
            Error::InvalidArgument(
                "No store name. Pass --name or set \"name\" in the config file".to_string(),
            )
        })?;
        let models_dir = merged.models_dir.clone().ok_or_else(|| {
            Error::InvalidArgument(
                "No model directory. Pass --models or set \"models_dir\" in the config file"
                    .to_string(),
            )
        })?;
        if !models_dir.is_dir() {
            return Err(Error::ModelNotFound {
                source_name: models_dir.display().to_string(),
            });
        }

        let target = Self {
            directory: merged.store_directory(&name)?,
            legacy_directory: merged.legacy_directory(&name)?,
            models: ModelBundle::load_dir(&models_dir)?,
            pragmas: merged.pragmas.clone(),
            busy_timeout: merged.busy_timeout(),
            name,
        };
        debug!(name = %target.name, directory = %target.directory.display(), "Resolved store");
        Ok(target)
    }

    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        store_path(&self.directory, &self.name)
    }

    /// Engine over the linear chain of the loaded models.
    ///
    /// # Errors
    ///
    /// Returns `ModelNotFound` if the model directory holds no models.
    pub fn engine(&self) -> Result<MigrationEngine> {
        let chain = VersionChain::linear(self.models.identifiers()).map_err(|_| {
            Error::ModelNotFound {
                source_name: self.models.name().to_string(),
            }
        })?;
        Ok(MigrationEngine::new(chain))
    }

    /// Descriptor for opening the store with the controller.
    ///
    /// # Errors
    ///
    /// See [`StoreTarget::engine`].
    pub fn descriptor(&self, migrate: bool) -> Result<StoreDescriptor> {
        let mut descriptor =
            StoreDescriptor::new(&self.name, Arc::new(self.models.clone()), &self.directory);
        if let Some(legacy) = &self.legacy_directory {
            descriptor = descriptor.with_legacy_directory(legacy);
        }
        if migrate {
            descriptor = descriptor.with_migrator(self.engine()?);
        }
        for (key, value) in &self.pragmas {
            descriptor = descriptor.with_option(key, value);
        }
        if let Some(timeout) = self.busy_timeout {
            descriptor = descriptor.with_busy_timeout(timeout);
        }
        Ok(descriptor)
    }
}
