//! Clean command implementation.

use super::target::StoreTarget;
use crate::cli::CleanArgs;
use crate::error::Result;
use crate::store::{prepare_folder, stray_entries};
use colored::Colorize;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Serialize)]
struct CleanOutput {
    directory: PathBuf,
    removed: Vec<PathBuf>,
    dry_run: bool,
}

/// Execute the clean command.
///
/// # Errors
///
/// Returns an error if the store directory cannot be listed.
pub fn execute(args: &CleanArgs, config: Option<&Path>, json: bool) -> Result<()> {
    let target = StoreTarget::resolve(&args.store, config)?;

    let removed = if args.dry_run {
        if target.directory.is_dir() {
            stray_entries(&target.directory, &target.name)?
        } else {
            Vec::new()
        }
    } else {
        prepare_folder(&target.directory, &target.name)?
    };

    let output = CleanOutput {
        directory: target.directory,
        removed,
        dry_run: args.dry_run,
    };

    if json {
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    if output.removed.is_empty() {
        println!("{}", "Nothing to clean".dimmed());
        return Ok(());
    }

    let verb = if output.dry_run { "Would remove" } else { "Removed" };
    for path in &output.removed {
        println!("{} {}", verb.yellow(), path.display());
    }
    Ok(())
}
