//! Transformations from one schema model to the next.
//!
//! A mapping runs on the freshly created output database of a migration
//! step, with the step's input attached as schema `src`. An explicit
//! custom script wins; otherwise a mapping is inferred from the shape of
//! the two models.

use super::{quote_ident, ModelSource, SchemaModel};
use crate::error::{Error, Result};
use rusqlite::Connection;
use tracing::{debug, warn};

/// Column copy plan for one table shared by both models.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMapping {
    pub table: String,
    pub columns: Vec<String>,
}

/// How records in a source schema become records in a destination schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mapping {
    /// Script shipped with the models.
    Custom { script: String },
    /// Structural copy of shared tables and columns.
    Inferred { tables: Vec<TableMapping> },
}

impl Mapping {
    /// Resolve the mapping for `source -> destination`.
    ///
    /// # Errors
    ///
    /// Returns `MappingNotFound` when no custom mapping ships with the models
    /// and none can be inferred.
    pub fn resolve(
        source: &SchemaModel,
        destination: &SchemaModel,
        models: &dyn ModelSource,
    ) -> Result<Self> {
        if let Some(script) = models.custom_mapping(source.identifier(), destination.identifier()) {
            debug!(
                from = source.identifier(),
                to = destination.identifier(),
                "Using custom mapping"
            );
            return Ok(Self::Custom { script });
        }

        Self::infer(source, destination)?.ok_or(Error::MappingNotFound {
            from: source.identifier(),
            to: destination.identifier(),
        })
    }

    /// Infer a mapping from the table layouts of both models.
    ///
    /// Returns `None` when a shared table gains a required column the
    /// source cannot supply.
    ///
    /// # Errors
    ///
    /// Returns an error if either model's DDL fails to load.
    pub fn infer(source: &SchemaModel, destination: &SchemaModel) -> Result<Option<Self>> {
        let source_layout = source.table_layout()?;
        let destination_layout = destination.table_layout()?;

        let mut tables = Vec::new();
        for (table, columns) in &destination_layout {
            let Some(source_columns) = source_layout.get(table) else {
                continue;
            };

            let shared: Vec<String> = columns
                .iter()
                .filter(|c| {
                    source_columns
                        .iter()
                        .any(|s| s.name.eq_ignore_ascii_case(&c.name))
                })
                .map(|c| c.name.clone())
                .collect();

            if let Some(required) = columns
                .iter()
                .find(|c| !shared.contains(&c.name) && !c.can_be_omitted())
            {
                debug!(table = %table, column = %required.name, "Cannot infer mapping for required column");
                return Ok(None);
            }

            if !shared.is_empty() {
                tables.push(TableMapping {
                    table: table.clone(),
                    columns: shared,
                });
            }
        }

        for table in source_layout.keys() {
            if !destination_layout.contains_key(table) {
                warn!(table = %table, "Table is not part of the destination model and will be dropped");
            }
        }

        Ok(Some(Self::Inferred { tables }))
    }

    /// Short label used in reports and logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Custom { .. } => "custom",
            Self::Inferred { .. } => "inferred",
        }
    }

    /// Run the mapping against `conn`, which must have the input attached as `src`.
    ///
    /// Returns the number of rows copied by an inferred mapping. Custom scripts
    /// report the rows touched by their final statement.
    pub(crate) fn apply(&self, conn: &Connection) -> rusqlite::Result<usize> {
        match self {
            Self::Custom { script } => {
                conn.execute_batch(script)?;
                Ok(usize::try_from(conn.changes()).unwrap_or(0))
            }
            Self::Inferred { tables } => {
                let mut copied = 0;
                for mapping in tables {
                    let columns = mapping
                        .columns
                        .iter()
                        .map(|c| quote_ident(c))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let table = quote_ident(&mapping.table);
                    let rows = conn.execute(
                        &format!(
                            "INSERT INTO main.{table} ({columns}) SELECT {columns} FROM src.{table}"
                        ),
                        [],
                    )?;
                    debug!(table = %mapping.table, rows, "Copied table");
                    copied += rows;
                }
                Ok(copied)
            }
        }
    }
}
