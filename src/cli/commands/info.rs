//! Info command implementation.

use super::target::StoreTarget;
use crate::cli::StoreArgs;
use crate::error::Result;
use crate::migration::StoreMetadata;
use crate::schema::ModelSource;
use colored::Colorize;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Serialize)]
struct InfoOutput {
    name: String,
    path: PathBuf,
    exists: bool,
    size_bytes: Option<u64>,
    sha256: Option<String>,
    version: Option<i32>,
    journal_mode: Option<String>,
    tables: Vec<String>,
    compatible: bool,
    current_version: i32,
    plan: Vec<(i32, i32)>,
    models: Vec<ModelOutput>,
}

#[derive(Serialize)]
struct ModelOutput {
    identifier: i32,
    fingerprint: String,
    has_custom_mapping: bool,
}

/// Execute the info command. Never modifies the store.
///
/// # Errors
///
/// Returns an error if the store cannot be resolved or the models are empty.
pub fn execute(args: &StoreArgs, config: Option<&Path>, json: bool) -> Result<()> {
    let target = StoreTarget::resolve(args, config)?;
    let engine = target.engine()?;
    let path = target.store_path();
    let metadata = StoreMetadata::read(&path);
    let compatible_version = engine.compatible_version(&path, &target.models);
    let current_version = engine.chain().current();

    let plan = match compatible_version {
        Some(version) => engine.chain().plan(version, current_version)?,
        None => Vec::new(),
    };

    let models = target
        .models
        .models()
        .into_iter()
        .map(|model| ModelOutput {
            identifier: model.identifier(),
            fingerprint: model.fingerprint(),
            has_custom_mapping: engine
                .chain()
                .next(model.identifier())
                .is_some_and(|next| target.models.custom_mapping(model.identifier(), next).is_some()),
        })
        .collect();

    let output = InfoOutput {
        name: target.name.clone(),
        exists: path.is_file(),
        size_bytes: fs::metadata(&path).ok().map(|m| m.len()),
        sha256: file_sha256(&path),
        version: metadata.as_ref().map(|m| m.version),
        journal_mode: metadata.as_ref().map(|m| m.journal_mode.clone()),
        tables: metadata.map(|m| m.tables).unwrap_or_default(),
        compatible: compatible_version.is_some(),
        current_version,
        plan,
        models,
        path,
    };

    if json {
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    print_human(&output);
    Ok(())
}

fn print_human(output: &InfoOutput) {
    println!("{} {}", "Store".cyan().bold(), output.name.bold());
    println!("  path: {}", output.path.display());

    if !output.exists {
        println!("  {}", "not created yet".dimmed());
    } else {
        match output.version {
            Some(version) => println!("  version: {version}"),
            None => println!("  version: {}", "unreadable".red()),
        }
        if let Some(mode) = &output.journal_mode {
            println!("  journal: {mode}");
        }
        if let Some(size) = output.size_bytes {
            println!("  size: {size} bytes");
        }
        if let Some(sha) = &output.sha256 {
            println!("  sha256: {}", sha.dimmed());
        }
        if !output.tables.is_empty() {
            println!("  tables: {}", output.tables.join(", "));
        }
    }

    println!();
    println!("{}", "Models".cyan().bold());
    for model in &output.models {
        let marker = if model.identifier == output.current_version {
            "current".green().to_string()
        } else {
            String::new()
        };
        let mapping = if model.has_custom_mapping {
            " custom mapping".dimmed().to_string()
        } else {
            String::new()
        };
        println!(
            "  {:>4}  {}  {marker}{mapping}",
            model.identifier,
            &model.fingerprint[..12]
        );
    }

    println!();
    if output.exists && !output.compatible {
        println!("{}", "Store matches no known model and would be discarded".yellow());
    } else if output.plan.is_empty() {
        println!("{}", "No migration needed".green());
    } else {
        let steps: Vec<String> = output.plan.iter().map(|(f, t)| format!("{f} -> {t}")).collect();
        println!("Migration needed: {}", steps.join(", ").yellow());
    }
}

fn file_sha256(path: &Path) -> Option<String> {
    let bytes = fs::read(path).ok()?;
    let digest = Sha256::digest(&bytes);
    Some(digest.iter().map(|b| format!("{b:02x}")).collect())
}
