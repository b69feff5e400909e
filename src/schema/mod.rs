//! Schema models and the registry that resolves them.
//!
//! A [`SchemaModel`] is one point-in-time shape of the store: an integer
//! identifier (written to the store's `user_version`) and the DDL that
//! creates it. A [`ModelSource`] resolves identifiers to models and
//! supplies explicit custom mappings between adjacent versions.
//!
//! # Submodules
//!
//! - [`mapping`] - Custom and inferred transformations between two models

pub mod mapping;

pub use mapping::{Mapping, TableMapping};

use crate::error::{Error, Result};
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::debug;

/// One versioned schema descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaModel {
    identifier: i32,
    name: String,
    ddl: String,
}

/// Column shape as reported by `pragma_table_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub decl_type: String,
    pub not_null: bool,
    pub has_default: bool,
    pub primary_key: bool,
}

impl ColumnInfo {
    /// Whether a row can be inserted without naming this column.
    #[must_use]
    pub fn can_be_omitted(&self) -> bool {
        if self.primary_key && self.decl_type.eq_ignore_ascii_case("INTEGER") {
            return true;
        }
        !self.not_null || self.has_default
    }
}

/// Tables of a model, keyed by table name.
pub type TableLayout = BTreeMap<String, Vec<ColumnInfo>>;

impl SchemaModel {
    /// Create a model from its identifier and DDL.
    #[must_use]
    pub fn new(identifier: i32, name: &str, ddl: &str) -> Self {
        Self {
            identifier,
            name: name.to_string(),
            ddl: ddl.to_string(),
        }
    }

    #[must_use]
    pub fn identifier(&self) -> i32 {
        self.identifier
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn ddl(&self) -> &str {
        &self.ddl
    }

    /// SHA-256 of the DDL, hex encoded.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.ddl.as_bytes());
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Discover the table layout by loading the DDL into a scratch database.
    ///
    /// # Errors
    ///
    /// Returns an error if the DDL does not execute.
    pub fn table_layout(&self) -> Result<TableLayout> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(&self.ddl)?;
        read_table_layout(&conn, "main").map_err(Error::from)
    }
}

/// Quote an SQL identifier (table or column name).
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Read the user tables of an attached schema (`main`, `src`, ...).
pub(crate) fn read_table_layout(conn: &Connection, schema: &str) -> rusqlite::Result<TableLayout> {
    let tables: Vec<String> = conn
        .prepare(&format!(
            "SELECT name FROM {schema}.sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name"
        ))?
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;

    let mut layout = TableLayout::new();
    for table in tables {
        let columns = conn
            .prepare("SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1, ?2)")?
            .query_map([table.as_str(), schema], |row| {
                Ok(ColumnInfo {
                    name: row.get(0)?,
                    decl_type: row.get(1)?,
                    not_null: row.get::<_, i64>(2)? != 0,
                    has_default: row.get::<_, Option<String>>(3)?.is_some(),
                    primary_key: row.get::<_, i64>(4)? != 0,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        layout.insert(table, columns);
    }
    Ok(layout)
}

/// Resolves schema versions to models and mappings.
///
/// Stands in for the resource bundle that ships compiled models with an
/// application. Implementations must be shareable across threads since
/// configuration runs off the caller's thread.
pub trait ModelSource: Send + Sync + fmt::Debug {
    /// Name of the model set; also used in diagnostics.
    fn name(&self) -> &str;

    /// All versioned models, in any order.
    fn models(&self) -> Vec<SchemaModel>;

    /// Model with the given identifier.
    fn model(&self, identifier: i32) -> Option<SchemaModel> {
        self.models().into_iter().find(|m| m.identifier() == identifier)
    }

    /// The model a store is opened with: the highest identifier.
    fn current_model(&self) -> Option<SchemaModel> {
        self.models().into_iter().max_by_key(SchemaModel::identifier)
    }

    /// Explicit mapping script for `from -> to`, if one ships with the models.
    fn custom_mapping(&self, from: i32, to: i32) -> Option<String>;
}

/// In-memory model registry, optionally loaded from a directory.
///
/// Directory layout:
/// - `<id>.sql` - a schema model with identifier `<id>`
/// - `<from>-<to>.mapping.sql` - a custom mapping script
#[derive(Debug, Clone, Default)]
pub struct ModelBundle {
    name: String,
    models: BTreeMap<i32, SchemaModel>,
    mappings: HashMap<(i32, i32), String>,
}

impl ModelBundle {
    /// Create an empty bundle.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Register a model.
    #[must_use]
    pub fn with_model(mut self, identifier: i32, ddl: &str) -> Self {
        let model = SchemaModel::new(identifier, &format!("{} {identifier}", self.name), ddl);
        self.models.insert(identifier, model);
        self
    }

    /// Register a custom mapping script.
    #[must_use]
    pub fn with_mapping(mut self, from: i32, to: i32, script: &str) -> Self {
        self.mappings.insert((from, to), script.to_string());
        self
    }

    /// Identifiers of the registered models, ascending.
    #[must_use]
    pub fn identifiers(&self) -> Vec<i32> {
        self.models.keys().copied().collect()
    }

    /// Load a bundle from a model directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let name = dir
            .file_name()
            .map_or_else(|| "models".to_string(), |n| n.to_string_lossy().to_string());
        let mut bundle = Self::new(&name);

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if let Some(pair) = file_name.strip_suffix(".mapping.sql") {
                let Some((from, to)) = pair.split_once('-') else {
                    continue;
                };
                let (Ok(from), Ok(to)) = (from.parse::<i32>(), to.parse::<i32>()) else {
                    continue;
                };
                debug!(from, to, "Loaded custom mapping");
                bundle = bundle.with_mapping(from, to, &fs::read_to_string(&path)?);
            } else if let Some(id) = file_name.strip_suffix(".sql") {
                let Ok(id) = id.parse::<i32>() else {
                    continue;
                };
                debug!(version = id, "Loaded schema model");
                bundle = bundle.with_model(id, &fs::read_to_string(&path)?);
            }
        }

        Ok(bundle)
    }
}

impl ModelSource for ModelBundle {
    fn name(&self) -> &str {
        &self.name
    }

    fn models(&self) -> Vec<SchemaModel> {
        self.models.values().cloned().collect()
    }

    fn model(&self, identifier: i32) -> Option<SchemaModel> {
        self.models.get(&identifier).cloned()
    }

    fn custom_mapping(&self, from: i32, to: i32) -> Option<String> {
        self.mappings.get(&(from, to)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_table_layout() {
        let model = SchemaModel::new(
            1,
            "Notes 1",
            "CREATE TABLE notes (id INTEGER PRIMARY KEY, title TEXT NOT NULL, body TEXT DEFAULT '');",
        );
        let layout = model.table_layout().unwrap();
        let columns = &layout["notes"];
        assert_eq!(columns.len(), 3);
        assert!(columns[0].primary_key);
        assert!(columns[0].can_be_omitted());
        assert!(!columns[1].can_be_omitted());
        assert!(columns[2].can_be_omitted());
    }

    #[test]
    fn test_current_model_is_highest() {
        let bundle = ModelBundle::new("Notes")
            .with_model(2, "CREATE TABLE a (x);")
            .with_model(1, "CREATE TABLE a (x);")
            .with_model(3, "CREATE TABLE a (x, y);");
        assert_eq!(bundle.current_model().unwrap().identifier(), 3);
        assert_eq!(bundle.identifiers(), vec![1, 2, 3]);
        assert!(bundle.model(4).is_none());
    }

    #[test]
    fn test_load_dir() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("1.sql"), "CREATE TABLE a (x);").unwrap();
        fs::write(dir.path().join("2.sql"), "CREATE TABLE a (x, y);").unwrap();
        fs::write(dir.path().join("1-2.mapping.sql"), "INSERT INTO a SELECT x, 0 FROM src.a;").unwrap();
        fs::write(dir.path().join("README.md"), "ignored").unwrap();
        fs::write(dir.path().join("draft.sql"), "ignored").unwrap();

        let bundle = ModelBundle::load_dir(dir.path()).unwrap();
        assert_eq!(bundle.identifiers(), vec![1, 2]);
        assert!(bundle.custom_mapping(1, 2).is_some());
        assert!(bundle.custom_mapping(2, 3).is_none());
    }

    #[test]
    fn test_fingerprint_tracks_ddl() {
        let a = SchemaModel::new(1, "a", "CREATE TABLE a (x);");
        let b = SchemaModel::new(2, "b", "CREATE TABLE a (x);");
        let c = SchemaModel::new(1, "a", "CREATE TABLE a (y);");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }
}
