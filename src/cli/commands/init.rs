//! Init command implementation.

use crate::cli::InitArgs;
use crate::config::{StackConfig, resolve_config_path, save_config};
use crate::error::{Error, Result};
use colored::Colorize;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Serialize)]
struct InitOutput {
    path: PathBuf,
    config: StackConfig,
}

/// Execute the init command.
///
/// Writes the store flags to the config file that later commands read, so
/// they can run without repeating them.
///
/// # Errors
///
/// Returns `Config` if the file exists and `--force` is not given, or if it
/// cannot be written.
pub fn execute(args: &InitArgs, config: Option<&Path>, json: bool) -> Result<()> {
    let (path, _) = resolve_config_path(config)?;
    if path.exists() && !args.force {
        return Err(Error::Config(format!(
            "Config file already exists: {} (use --force to overwrite)",
            path.display()
        )));
    }

    let store = &args.store;
    let config = StackConfig {
        name: store.name.clone(),
        models_dir: store.models.clone(),
        store_dir: store.store_dir.clone(),
        folder: store.folder.unwrap_or_default(),
        app_group: store.app_group.clone(),
        ..StackConfig::default()
    };
    save_config(&path, &config)?;
    info!(path = %path.display(), "Wrote config");

    let output = InitOutput { path, config };
    if json {
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    println!("{} {}", "Wrote".green().bold(), output.path.display());
    Ok(())
}
