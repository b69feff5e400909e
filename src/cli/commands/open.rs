//! Open command implementation.

use super::target::StoreTarget;
use crate::cli::OpenArgs;
use crate::error::{Error, Result};
use crate::migration::MigrationReport;
use crate::schema::ModelSource;
use crate::store::{Store, StoreState};
use colored::Colorize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Serialize)]
struct OpenOutput {
    name: String,
    path: PathBuf,
    state: StoreState,
    model_version: i32,
    migration: Option<MigrationReport>,
    tables: BTreeMap<String, u64>,
}

/// Execute the open command.
///
/// Runs the full controller lifecycle: configure (with migration unless
/// disabled), start, read table counts on the main context, close.
///
/// # Errors
///
/// Returns configuration, migration or open errors from the controller.
pub fn execute(args: &OpenArgs, config: Option<&Path>, json: bool) -> Result<()> {
    let target = StoreTarget::resolve(&args.store, config)?;
    let model = target
        .models
        .current_model()
        .ok_or_else(|| Error::ModelNotFound {
            source_name: target.models.name().to_string(),
        })?;
    let store = Store::new(target.descriptor(!args.no_migrate)?)?;

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| Error::Other(format!("Failed to create async runtime: {e}")))?;
    rt.block_on(store.launch())?;

    let mut tables = BTreeMap::new();
    let main = store.main_context()?;
    for table in model.table_layout()?.into_keys() {
        let count = main.count(&table)?;
        tables.insert(table, count);
    }

    let output = OpenOutput {
        name: target.name.clone(),
        path: store.store_path(),
        state: store.state(),
        model_version: model.identifier(),
        migration: store.migration_report(),
        tables,
    };
    store.close()?;
    info!(name = %output.name, "Store opened and closed");

    if json {
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    println!(
        "{} {} at version {}",
        "Opened".green().bold(),
        output.path.display(),
        output.model_version
    );
    if let Some(report) = output.migration.as_ref().filter(|r| !r.is_noop()) {
        println!(
            "  migrated {} -> {} in {} steps",
            report.from,
            report.to,
            report.steps.len()
        );
    }
    for (table, count) in &output.tables {
        println!("  {table}: {count} rows");
    }
    Ok(())
}
