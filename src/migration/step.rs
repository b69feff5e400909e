//! A single pairwise migration step.

use crate::error::{Error, Result};
use crate::schema::{Mapping, ModelSource, SchemaModel};
use rusqlite::Connection;
use std::path::Path;
use std::time::Instant;
use tracing::info;

/// Source model, destination model and the mapping between them.
///
/// Built right before it runs and dropped right after.
#[derive(Debug)]
pub(crate) struct MigrationStep {
    pub source: SchemaModel,
    pub destination: SchemaModel,
    pub mapping: Mapping,
}

/// Outcome of one executed step.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StepReport {
    pub from: i32,
    pub to: i32,
    pub mapping: &'static str,
    pub rows: usize,
    pub duration_ms: u64,
}

impl MigrationStep {
    /// Materialize both models and resolve the mapping for `from -> to`.
    ///
    /// # Errors
    ///
    /// Returns `ModelVersionMissing` or `MappingNotFound`.
    pub fn build(from: i32, to: i32, models: &dyn ModelSource) -> Result<Self> {
        let source = models
            .model(from)
            .ok_or(Error::ModelVersionMissing { version: from })?;
        let destination = models
            .model(to)
            .ok_or(Error::ModelVersionMissing { version: to })?;
        let mapping = Mapping::resolve(&source, &destination, models)?;

        Ok(Self {
            source,
            destination,
            mapping,
        })
    }

    /// Transform the store at `input` into a new store at `output`.
    ///
    /// `input` is only read. `output` must not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `MigrationStep` wrapping the underlying database error.
    pub fn execute(&self, input: &Path, output: &Path) -> Result<StepReport> {
        let from = self.source.identifier();
        let to = self.destination.identifier();
        let started = Instant::now();

        info!(from, to, mapping = self.mapping.kind(), "Migrating store");

        let run = || -> rusqlite::Result<usize> {
            let mut conn = Connection::open(output)?;
            conn.pragma_update(None, "journal_mode", "DELETE")?;
            conn.execute_batch(self.destination.ddl())?;
            conn.execute(
                "ATTACH DATABASE ?1 AS src",
                [input.to_string_lossy().as_ref()],
            )?;

            let tx = conn.transaction()?;
            let rows = self.mapping.apply(&tx)?;
            tx.pragma_update(None, "user_version", to)?;
            tx.commit()?;

            conn.execute("DETACH DATABASE src", [])?;
            conn.close().map_err(|(_, e)| e)?;
            Ok(rows)
        };

        let rows = run().map_err(|source| Error::MigrationStep { from, to, source })?;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(from, to, rows, duration_ms, "Migration step complete");

        Ok(StepReport {
            from,
            to,
            mapping: self.mapping.kind(),
            rows,
            duration_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ModelBundle;
    use tempfile::TempDir;

    #[test]
    fn test_step_writes_new_file_and_keeps_input() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.sqlite");
        let output = dir.path().join("out.sqlite");
        {
            let conn = Connection::open(&input).unwrap();
            conn.execute_batch(
                "CREATE TABLE notes (id INTEGER PRIMARY KEY, title TEXT NOT NULL);
                 INSERT INTO notes VALUES (1, 'first');
                 PRAGMA user_version = 1;",
            )
            .unwrap();
        }
        let before = std::fs::read(&input).unwrap();

        let bundle = ModelBundle::new("Notes")
            .with_model(1, "CREATE TABLE notes (id INTEGER PRIMARY KEY, title TEXT NOT NULL);")
            .with_model(
                2,
                "CREATE TABLE notes (id INTEGER PRIMARY KEY, title TEXT NOT NULL, body TEXT);",
            );
        let step = MigrationStep::build(1, 2, &bundle).unwrap();
        let report = step.execute(&input, &output).unwrap();

        assert_eq!(report.rows, 1);
        assert_eq!(report.mapping, "inferred");
        assert_eq!(std::fs::read(&input).unwrap(), before);

        let conn = Connection::open(&output).unwrap();
        let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0)).unwrap();
        assert_eq!(version, 2);
        let title: String = conn
            .query_row("SELECT title FROM notes WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(title, "first");
    }

    #[test]
    fn test_build_requires_both_models() {
        let bundle = ModelBundle::new("Notes").with_model(1, "CREATE TABLE a (x);");
        let err = MigrationStep::build(1, 2, &bundle).unwrap_err();
        assert!(matches!(err, Error::ModelVersionMissing { version: 2 }));
    }
}
