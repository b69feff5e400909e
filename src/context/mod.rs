//! Context tree.
//!
//! A store has exactly one main context, which owns the SQLite connection
//! and whose commits are durable. Private contexts are derived from it (or
//! from each other) and buffer changes until they are saved into their
//! parent. Each context runs its work on its own [`SerialQueue`].

mod propagate;
pub mod queue;

pub use queue::SerialQueue;

use crate::error::{Error, Result};
use crate::notify::{NotificationBus, SaveInfo};
use crate::schema::quote_ident;
use chrono::Utc;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, TransactionBehavior, params_from_iter};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// A fetched row, keyed by column name.
pub type Record = serde_json::Map<String, serde_json::Value>;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique context identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Concurrency domain of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextKind {
    /// The root; bound to the UI-affine queue, commits are durable.
    Main,
    /// A background context whose saves only reach its parent.
    Private,
}

/// One pending write: a parameterized SQL statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Change {
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Append a positional parameter.
    #[must_use]
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }
}

struct ContextInner {
    id: ContextId,
    kind: ContextKind,
    label: String,
    parent: Option<Context>,
    queue: SerialQueue,
    main_queue: SerialQueue,
    pending: Mutex<Vec<Change>>,
    conn: Mutex<Option<Connection>>,
    bus: Arc<NotificationBus>,
}

/// Handle to a context. Cheap to clone; clones refer to the same context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("parent", &self.inner.parent.as_ref().map(Context::id))
            .finish_non_exhaustive()
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Context {}

impl Context {
    /// Create the main context over an open store connection, bound to
    /// `queue`.
    pub(crate) fn main(conn: Connection, queue: SerialQueue, bus: Arc<NotificationBus>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: ContextId::next(),
                kind: ContextKind::Main,
                label: "main".to_string(),
                parent: None,
                main_queue: queue.clone(),
                queue,
                pending: Mutex::new(Vec::new()),
                conn: Mutex::new(Some(conn)),
                bus,
            }),
        }
    }

    /// Derive a private context whose parent is `self`.
    ///
    /// # Errors
    ///
    /// Returns an error if the context's queue cannot be spawned.
    pub fn new_child(&self, label: &str) -> Result<Self> {
        let child = Self {
            inner: Arc::new(ContextInner {
                id: ContextId::next(),
                kind: ContextKind::Private,
                label: label.to_string(),
                parent: Some(self.clone()),
                queue: SerialQueue::new(label)?,
                main_queue: self.inner.main_queue.clone(),
                pending: Mutex::new(Vec::new()),
                conn: Mutex::new(None),
                bus: Arc::clone(&self.inner.bus),
            }),
        };
        debug!(id = %child.id(), parent = %self.id(), label, "Created private context");
        Ok(child)
    }

    #[must_use]
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    #[must_use]
    pub fn kind(&self) -> ContextKind {
        self.inner.kind
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    #[must_use]
    pub fn parent(&self) -> Option<&Context> {
        self.inner.parent.as_ref()
    }

    /// The execution domain of this context.
    #[must_use]
    pub fn queue(&self) -> &SerialQueue {
        &self.inner.queue
    }

    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.pending().is_empty()
    }

    /// Number of changes waiting to be saved.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Run `job` on this context's queue without waiting.
    ///
    /// # Errors
    ///
    /// Returns `ContextUnavailable` if the queue has stopped.
    pub fn perform<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        let ctx = self.clone();
        self.inner.queue.perform(move || job(&ctx))
    }

    /// Run `job` on this context's queue and wait for its result.
    ///
    /// # Errors
    ///
    /// Returns `ContextUnavailable` if the queue has stopped or `job` panicked.
    pub fn perform_and_wait<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce(&Context) -> R + Send + 'static,
        R: Send + 'static,
    {
        let ctx = self.clone();
        self.inner.queue.perform_and_wait(move || job(&ctx))
    }

    /// Queue a change for the next save.
    ///
    /// # Errors
    ///
    /// Returns `ContextUnavailable` if the queue has stopped.
    pub fn record(&self, change: Change) -> Result<()> {
        self.perform_and_wait(move |ctx| ctx.pending().push(change))
    }

    /// Queue an insert of `values` into `entity`.
    ///
    /// # Errors
    ///
    /// Returns `ContextUnavailable` if the queue has stopped.
    pub fn insert(&self, entity: &str, values: &Record) -> Result<()> {
        let change = if values.is_empty() {
            Change::new(format!("INSERT INTO {} DEFAULT VALUES", quote_ident(entity)))
        } else {
            let columns: Vec<String> = values.keys().map(|k| quote_ident(k)).collect();
            let slots: Vec<String> = (1..=values.len()).map(|i| format!("?{i}")).collect();
            Change {
                sql: format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    quote_ident(entity),
                    columns.join(", "),
                    slots.join(", ")
                ),
                params: values.values().map(json_to_sql).collect(),
            }
        };
        self.record(change)
    }

    /// Queue an update of the rows of `entity` where `key_column = key`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `values` is empty.
    pub fn update(
        &self,
        entity: &str,
        key_column: &str,
        key: &serde_json::Value,
        values: &Record,
    ) -> Result<()> {
        if values.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "update of '{entity}' sets no attributes"
            )));
        }

        let assignments: Vec<String> = values
            .keys()
            .enumerate()
            .map(|(i, column)| format!("{} = ?{}", quote_ident(column), i + 1))
            .collect();
        let mut params: Vec<Value> = values.values().map(json_to_sql).collect();
        params.push(json_to_sql(key));

        self.record(Change {
            sql: format!(
                "UPDATE {} SET {} WHERE {} = ?{}",
                quote_ident(entity),
                assignments.join(", "),
                quote_ident(key_column),
                params.len()
            ),
            params,
        })
    }

    /// Queue a delete of the rows of `entity` where `key_column = key`.
    ///
    /// # Errors
    ///
    /// Returns `ContextUnavailable` if the queue has stopped.
    pub fn delete(&self, entity: &str, key_column: &str, key: &serde_json::Value) -> Result<()> {
        self.record(
            Change::new(format!(
                "DELETE FROM {} WHERE {} = ?1",
                quote_ident(entity),
                quote_ident(key_column)
            ))
            .bind(json_to_sql(key)),
        )
    }

    /// Save this context one level up.
    ///
    /// A private context hands its changes to its parent. The main context
    /// commits them to the store in a single transaction. Returns the number
    /// of changes saved; zero means there was nothing to do.
    ///
    /// The changes are taken on this context's queue and handed over from
    /// the calling thread, so the caller may itself be running on the
    /// parent's queue.
    ///
    /// # Errors
    ///
    /// Returns `Save` if the main context's transaction fails. The changes
    /// then remain pending in the main context.
    pub fn save(&self) -> Result<usize> {
        let Some(parent) = self.parent() else {
            return self.perform_and_wait(Context::commit_pending)?;
        };

        let changes = self.perform_and_wait(Context::take_pending)?;
        if changes.is_empty() {
            return Ok(0);
        }
        let count = changes.len();
        let from = self.id();
        parent.perform_and_wait(move |parent| parent.receive(from, changes))?;
        Ok(count)
    }

    /// Remove and return the pending changes. Runs on this context's queue.
    fn take_pending(&self) -> Vec<Change> {
        std::mem::take(&mut *self.pending())
    }

    /// Append changes handed over by the child `from`. Runs on this
    /// context's queue.
    fn receive(&self, from: ContextId, changes: Vec<Change>) {
        debug!(%from, to = %self.id(), count = changes.len(), "Handed changes to parent");
        self.pending().extend(changes);
    }

    /// Commit the pending changes of the main context. Runs on its queue.
    fn commit_pending(&self) -> Result<usize> {
        let changes = self.take_pending();
        if changes.is_empty() {
            return Ok(0);
        }
        self.commit(changes)
    }

    fn commit(&self, changes: Vec<Change>) -> Result<usize> {
        let count = changes.len();
        let result = {
            let mut guard = self.connection();
            match guard.as_mut() {
                Some(conn) => apply_changes(conn, &changes),
                None => return Err(Error::ContextUnavailable(self.inner.label.clone())),
            }
        };

        if let Err(source) = result {
            warn!(context = %self.id(), error = %source, "Commit failed, keeping changes pending");
            let mut pending = self.pending();
            let newer = std::mem::replace(&mut *pending, changes);
            pending.extend(newer);
            return Err(Error::Save {
                context: self.id().to_string(),
                source,
            });
        }

        debug!(context = %self.id(), count, "Committed changes to store");
        let info = SaveInfo {
            context: self.id(),
            changes: count,
            committed_at: Utc::now(),
        };
        self.inner.bus.post_saved(self, &info);
        Ok(count)
    }

    /// Fetch the committed rows of `entity`.
    ///
    /// With an `attribute`, only rows whose attribute equals `value` are
    /// returned; a missing or null `value` matches NULL.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if a value is given without an attribute.
    pub fn fetch(
        &self,
        entity: &str,
        attribute: Option<&str>,
        value: Option<serde_json::Value>,
    ) -> Result<Vec<Record>> {
        self.query(entity, attribute, value, None)
    }

    /// Fetch the first matching row, if any. See [`Context::fetch`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if a value is given without an attribute.
    pub fn fetch_one(
        &self,
        entity: &str,
        attribute: Option<&str>,
        value: Option<serde_json::Value>,
    ) -> Result<Option<Record>> {
        Ok(self
            .query(entity, attribute, value, Some(1))?
            .into_iter()
            .next())
    }

    /// Number of committed rows in `entity`.
    ///
    /// # Errors
    ///
    /// Returns an error if the table does not exist.
    pub fn count(&self, entity: &str) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(entity));
        self.root().perform_and_wait(move |root| -> Result<u64> {
            let guard = root.connection();
            let conn = guard
                .as_ref()
                .ok_or_else(|| Error::ContextUnavailable(root.inner.label.clone()))?;
            let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(u64::try_from(count).unwrap_or_default())
        })?
    }

    fn query(
        &self,
        entity: &str,
        attribute: Option<&str>,
        value: Option<serde_json::Value>,
        limit: Option<usize>,
    ) -> Result<Vec<Record>> {
        let mut sql = format!("SELECT * FROM {}", quote_ident(entity));
        let mut params = Vec::new();
        match (attribute, value) {
            (None, Some(_)) => {
                return Err(Error::InvalidArgument(format!(
                    "fetch on '{entity}' has a value but no attribute"
                )));
            }
            (None, None) => {}
            (Some(attribute), None | Some(serde_json::Value::Null)) => {
                sql.push_str(&format!(" WHERE {} IS NULL", quote_ident(attribute)));
            }
            (Some(attribute), Some(value)) => {
                sql.push_str(&format!(" WHERE {} = ?1", quote_ident(attribute)));
                params.push(json_to_sql(&value));
            }
        }
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        self.root().perform_and_wait(move |root| -> Result<Vec<Record>> {
            let guard = root.connection();
            let conn = guard
                .as_ref()
                .ok_or_else(|| Error::ContextUnavailable(root.inner.label.clone()))?;
            let mut stmt = conn.prepare(&sql)?;
            let columns: Vec<String> = stmt.column_names().iter().map(ToString::to_string).collect();
            let rows = stmt
                .query_map(params_from_iter(params.iter()), |row| {
                    let mut record = Record::new();
                    for (i, column) in columns.iter().enumerate() {
                        record.insert(column.clone(), sql_to_json(row.get_ref(i)?));
                    }
                    Ok(record)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?
    }

    /// Close the store connection owned by the main context.
    pub(crate) fn close(&self) -> Result<()> {
        self.perform_and_wait(|ctx| -> Result<()> {
            if let Some(conn) = ctx.connection().take() {
                conn.close().map_err(|(_, e)| Error::Database(e))?;
                debug!(context = %ctx.id(), "Closed store connection");
            }
            Ok(())
        })?
    }

    pub(crate) fn bus(&self) -> &Arc<NotificationBus> {
        &self.inner.bus
    }

    pub(crate) fn main_queue(&self) -> &SerialQueue {
        &self.inner.main_queue
    }

    fn root(&self) -> &Context {
        let mut ctx = self;
        while let Some(parent) = ctx.parent() {
            ctx = parent;
        }
        ctx
    }

    fn pending(&self) -> MutexGuard<'_, Vec<Change>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn connection(&self) -> MutexGuard<'_, Option<Connection>> {
        self.inner
            .conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn apply_changes(conn: &mut Connection, changes: &[Change]) -> rusqlite::Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    for change in changes {
        tx.execute(&change.sql, params_from_iter(change.params.iter()))?;
    }
    tx.commit()
}

fn json_to_sql(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Integer(i64::from(*b)),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(Value::Integer)
            .or_else(|| n.as_f64().map(Value::Real))
            .unwrap_or(Value::Null),
        serde_json::Value::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => i.into(),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned().into(),
        ValueRef::Blob(b) => b.iter().map(|byte| format!("{byte:02x}")).collect::<String>().into(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn main_context() -> Context {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE notes (id INTEGER PRIMARY KEY, title TEXT NOT NULL, body TEXT);",
        )
        .unwrap();
        Context::main(
            conn,
            SerialQueue::new("main").unwrap(),
            Arc::new(NotificationBus::new()),
        )
    }

    fn note(id: i64, title: &str) -> Record {
        let mut record = Record::new();
        record.insert("id".into(), json!(id));
        record.insert("title".into(), json!(title));
        record
    }

    #[test]
    fn test_main_save_commits() {
        let main = main_context();
        main.insert("notes", &note(1, "first")).unwrap();
        assert!(main.has_changes());
        assert!(main.fetch("notes", None, None).unwrap().is_empty());

        assert_eq!(main.save().unwrap(), 1);
        assert!(!main.has_changes());

        let found = main.fetch_one("notes", Some("id"), Some(json!(1))).unwrap().unwrap();
        assert_eq!(found["title"], "first");
        assert_eq!(found["body"], serde_json::Value::Null);
    }

    #[test]
    fn test_private_save_reaches_parent_only() {
        let main = main_context();
        let child = main.new_child("writer").unwrap();
        assert_eq!(child.kind(), ContextKind::Private);
        assert_eq!(child.parent(), Some(&main));

        child.insert("notes", &note(1, "draft")).unwrap();
        assert_eq!(child.save().unwrap(), 1);

        assert!(!child.has_changes());
        assert_eq!(main.pending_count(), 1);
        assert!(child.fetch("notes", None, None).unwrap().is_empty());
    }

    #[test]
    fn test_failed_commit_keeps_changes() {
        let main = main_context();
        main.insert("notes", &note(1, "first")).unwrap();
        main.insert("notes", &note(1, "duplicate")).unwrap();

        let err = main.save().unwrap_err();
        assert!(matches!(err, Error::Save { .. }));
        assert_eq!(main.pending_count(), 2);
        assert!(main.fetch("notes", None, None).unwrap().is_empty());
    }

    #[test]
    fn test_update_and_delete() {
        let main = main_context();
        main.insert("notes", &note(1, "first")).unwrap();
        main.insert("notes", &note(2, "second")).unwrap();
        let mut changes = Record::new();
        changes.insert("body".into(), json!("edited"));
        main.update("notes", "id", &json!(1), &changes).unwrap();
        main.delete("notes", "id", &json!(2)).unwrap();
        main.save().unwrap();

        let rows = main.fetch("notes", None, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["body"], "edited");
        assert_eq!(main.fetch("notes", Some("body"), None).unwrap().len(), 0);

        let err = main.update("notes", "id", &json!(1), &Record::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_fetch_value_without_attribute() {
        let main = main_context();
        let err = main.fetch("notes", None, Some(json!(1))).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_closed_context_is_unavailable() {
        let main = main_context();
        main.close().unwrap();
        let err = main.fetch("notes", None, None).unwrap_err();
        assert!(matches!(err, Error::ContextUnavailable(_)));
    }
}
