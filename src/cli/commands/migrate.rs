//! Migrate command implementation.

use super::target::StoreTarget;
use crate::cli::MigrateArgs;
use crate::error::{Error, Result};
use crate::migration::{MigrationReport, StoreMetadata};
use colored::Colorize;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Serialize)]
struct PlanOutput {
    store: PathBuf,
    from: Option<i32>,
    to: i32,
    steps: Vec<(i32, i32)>,
    dry_run: bool,
}

/// Execute the migrate command.
///
/// # Errors
///
/// Returns the migration error; these are fatal (exit code 3).
pub fn execute(args: &MigrateArgs, config: Option<&Path>, json: bool) -> Result<()> {
    let target = StoreTarget::resolve(&args.store, config)?;
    let engine = target.engine()?;
    let path = target.store_path();
    let to = args.to.unwrap_or_else(|| engine.chain().current());
    if !engine.chain().contains(to) {
        return Err(Error::ModelVersionMissing { version: to });
    }

    if args.dry_run {
        let from = engine.compatible_version(&path, &target.models);
        let steps = match from {
            Some(from) => engine.chain().plan(from, to)?,
            None => Vec::new(),
        };
        let output = PlanOutput {
            store: path,
            from,
            to,
            steps,
            dry_run: true,
        };
        if json {
            println!("{}", serde_json::to_string(&output)?);
        } else {
            print_plan(&output);
        }
        return Ok(());
    }

    if !engine.requires_migration(&path, &target.models, to)? {
        let from = StoreMetadata::read(&path).map(|m| m.version);
        let report = MigrationReport {
            store: path,
            from: from.unwrap_or(0),
            to,
            steps: Vec::new(),
        };
        return print_report(&report, json);
    }

    let report = engine.migrate_store(&path, &target.models, to)?;
    print_report(&report, json)
}

fn print_plan(output: &PlanOutput) {
    match output.from {
        None => println!("{}", "Store is missing or unrecognized; nothing to migrate".dimmed()),
        Some(_) if output.steps.is_empty() => {
            println!("{}", format!("Store already at version {}", output.to).green());
        }
        Some(from) => {
            println!("Would migrate {} from {from} to {}:", output.store.display(), output.to);
            for (step_from, step_to) in &output.steps {
                println!("  {step_from} -> {step_to}");
            }
        }
    }
}

fn print_report(report: &MigrationReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(report)?);
        return Ok(());
    }

    if report.is_noop() {
        println!("{}", "No migration needed".green());
        return Ok(());
    }

    for step in &report.steps {
        println!(
            "  {} -> {}  {} mapping, {} rows, {} ms",
            step.from,
            step.to,
            step.mapping,
            step.rows,
            step.duration_ms
        );
    }
    println!(
        "{} {} from {} to {}",
        "Migrated".green().bold(),
        report.store.display(),
        report.from,
        report.to
    );
    Ok(())
}
