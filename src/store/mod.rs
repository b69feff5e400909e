//! Store controller.
//!
//! Owns one store file through its lifecycle:
//!
//! ```text
//! NotStarted -> Configuring -> NotStarted (configured) -> Running -> Started
//!                    \                                         \
//!                     `-> Error (fatal migration failure)       `-> Started, degraded
//! ```
//!
//! Configuration relocates a legacy store, cleans the store directory and
//! runs the migrator. Starting opens the store on the main queue, creates
//! the main context and releases the startup gate.

pub mod folder;
pub mod gate;

pub use folder::{prepare_folder, relocate_legacy_store, store_path, stray_entries};
pub use gate::StartupGate;

use crate::context::{Context, SerialQueue};
use crate::error::{Error, Result};
use crate::migration::{MigrationReport, StoreMigrator};
use crate::notify::{NotificationBus, SaveInfo, StoreEvent};
use crate::schema::{ModelSource, SchemaModel};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Default time a connection waits on a locked store.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of a [`Store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreState {
    NotStarted,
    Configuring,
    Running,
    Started,
    Error,
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not started",
            Self::Configuring => "configuring",
            Self::Running => "running",
            Self::Started => "started",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Everything needed to configure a store.
#[derive(Clone)]
pub struct StoreDescriptor {
    name: String,
    model_source: Arc<dyn ModelSource>,
    directory: PathBuf,
    legacy_directory: Option<PathBuf>,
    migrator: Option<Arc<dyn StoreMigrator>>,
    options: BTreeMap<String, String>,
    busy_timeout: Duration,
}

impl fmt::Debug for StoreDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreDescriptor")
            .field("name", &self.name)
            .field("model_source", &self.model_source.name())
            .field("directory", &self.directory)
            .field("legacy_directory", &self.legacy_directory)
            .field("migrator", &self.migrator)
            .field("options", &self.options)
            .field("busy_timeout", &self.busy_timeout)
            .finish()
    }
}

impl StoreDescriptor {
    /// Describe the store `name` built from `model_source`, kept in `directory`.
    pub fn new(name: &str, model_source: Arc<dyn ModelSource>, directory: &Path) -> Self {
        Self {
            name: name.to_string(),
            model_source,
            directory: directory.to_path_buf(),
            legacy_directory: None,
            migrator: None,
            options: BTreeMap::new(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    /// Directory a previous release kept the store in.
    #[must_use]
    pub fn with_legacy_directory(mut self, dir: &Path) -> Self {
        self.legacy_directory = Some(dir.to_path_buf());
        self
    }

    #[must_use]
    pub fn with_migrator(mut self, migrator: impl StoreMigrator + 'static) -> Self {
        self.migrator = Some(Arc::new(migrator));
        self
    }

    /// Pragma applied to the store connection when it opens.
    #[must_use]
    pub fn with_option(mut self, key: &str, value: &str) -> Self {
        self.options.insert(key.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    #[must_use]
    pub fn model_source(&self) -> &Arc<dyn ModelSource> {
        &self.model_source
    }

    /// Path of the store file.
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        store_path(&self.directory, &self.name)
    }
}

/// Outcome of a successful configuration.
#[derive(Debug, Clone)]
struct Prepared {
    path: PathBuf,
    model: SchemaModel,
    migration: Option<MigrationReport>,
}

struct Lifecycle {
    state: StoreState,
    prepared: Option<Prepared>,
    main: Option<Context>,
    open_error: Option<String>,
}

/// Explicit handle to one store. Share it with `Arc`.
pub struct Store {
    descriptor: StoreDescriptor,
    lifecycle: Mutex<Lifecycle>,
    main_queue: SerialQueue,
    bus: Arc<NotificationBus>,
    gate: StartupGate,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.descriptor.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Create a store handle. Nothing touches the disk until [`Store::configure`].
    ///
    /// # Errors
    ///
    /// Returns an error if the main queue cannot be spawned.
    pub fn new(descriptor: StoreDescriptor) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            descriptor,
            lifecycle: Mutex::new(Lifecycle {
                state: StoreState::NotStarted,
                prepared: None,
                main: None,
                open_error: None,
            }),
            main_queue: SerialQueue::new("main")?,
            bus: Arc::new(NotificationBus::new()),
            gate: StartupGate::new(),
        }))
    }

    #[must_use]
    pub fn descriptor(&self) -> &StoreDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn state(&self) -> StoreState {
        self.lifecycle().state
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.state() == StoreState::Started
    }

    /// Whether configuration has succeeded.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.lifecycle().prepared.is_some()
    }

    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        self.descriptor.store_path()
    }

    /// The UI-affine queue the main context and startup completions run on.
    #[must_use]
    pub fn main_queue(&self) -> &SerialQueue {
        &self.main_queue
    }

    /// Report of the migration run during configuration, if one ran.
    #[must_use]
    pub fn migration_report(&self) -> Option<MigrationReport> {
        self.lifecycle()
            .prepared
            .as_ref()
            .and_then(|p| p.migration.clone())
    }

    /// The error the store failed to open with, if it started degraded.
    #[must_use]
    pub fn open_error(&self) -> Option<Error> {
        self.lifecycle()
            .open_error
            .clone()
            .map(|message| Error::StoreOpen {
                path: self.store_path(),
                message,
            })
    }

    /// Prepare the store for opening.
    ///
    /// Cleans the store directory, moves a legacy store into it, migrates
    /// the store to the current model if a migrator is set and resolves the
    /// model the store will be opened with. Blocks on disk I/O; run it off
    /// the main queue.
    ///
    /// Calling it again once configured is a no-op.
    ///
    /// # Errors
    ///
    /// Configuration errors (`InvalidDescriptor`, `ModelNotFound`) leave the
    /// store `NotStarted` so the caller may retry. Migration errors are fatal
    /// and move the store to `Error`.
    pub fn configure(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle();
            match lifecycle.state {
                StoreState::NotStarted if lifecycle.prepared.is_none() => {
                    lifecycle.state = StoreState::Configuring;
                }
                StoreState::Error => {
                    return Err(Error::Other(format!(
                        "store '{}' failed to configure and cannot be reused",
                        self.descriptor.name
                    )));
                }
                state => {
                    debug!(%state, "Store already configured");
                    return Ok(());
                }
            }
        }

        let result = self.prepare();
        let mut lifecycle = self.lifecycle();
        match result {
            Ok(prepared) => {
                info!(
                    name = %self.descriptor.name,
                    model = prepared.model.identifier(),
                    path = %prepared.path.display(),
                    "Store configured"
                );
                lifecycle.prepared = Some(prepared);
                lifecycle.state = StoreState::NotStarted;
                Ok(())
            }
            Err(e) => {
                lifecycle.state = if e.is_fatal() {
                    StoreState::Error
                } else {
                    StoreState::NotStarted
                };
                warn!(name = %self.descriptor.name, error = %e, state = %lifecycle.state, "Store configuration failed");
                Err(e)
            }
        }
    }

    fn prepare(&self) -> Result<Prepared> {
        let descriptor = &self.descriptor;
        if descriptor.name.trim().is_empty() {
            return Err(Error::InvalidDescriptor(
                "store name must not be empty".to_string(),
            ));
        }

        prepare_folder(&descriptor.directory, &descriptor.name)?;
        if let Some(legacy) = &descriptor.legacy_directory {
            relocate_legacy_store(legacy, &descriptor.directory, &descriptor.name)?;
        }

        let path = descriptor.store_path();
        let models = descriptor.model_source.as_ref();
        let migration = match &descriptor.migrator {
            Some(migrator) if migrator.requires_migration(&path, models)? => {
                Some(migrator.migrate_store(&path, models)?)
            }
            _ => None,
        };

        let model = models.current_model().ok_or_else(|| Error::ModelNotFound {
            source_name: models.name().to_string(),
        })?;

        Ok(Prepared {
            path,
            model,
            migration,
        })
    }

    /// Open the store and create the main context.
    ///
    /// The store is opened on the main queue. Once `Started`, save
    /// listeners are armed and queued startup completions run on the main
    /// queue. Calling it while `Running` or `Started` is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `NotConfigured` before a successful [`Store::configure`].
    /// If the store file cannot be opened the store still reaches `Started`,
    /// degraded, and the open error is returned here and by every context
    /// accessor.
    pub fn start(&self) -> Result<()> {
        let prepared = {
            let mut lifecycle = self.lifecycle();
            match (lifecycle.state, lifecycle.prepared.clone()) {
                (StoreState::Running | StoreState::Started, _) => return Ok(()),
                (StoreState::NotStarted, Some(prepared)) => {
                    lifecycle.state = StoreState::Running;
                    prepared
                }
                _ => return Err(Error::NotConfigured),
            }
        };

        let options = self.descriptor.options.clone();
        let busy_timeout = self.descriptor.busy_timeout;
        let queue = self.main_queue.clone();
        let bus = Arc::clone(&self.bus);
        let opened = self
            .main_queue
            .perform_and_wait(move || {
                open_store(&prepared.path, &prepared.model, &options, busy_timeout)
                    .map(|conn| Context::main(conn, queue, bus))
            })
            .and_then(|result| result);

        let outcome = {
            let mut lifecycle = self.lifecycle();
            lifecycle.state = StoreState::Started;
            match opened {
                Ok(main) => {
                    lifecycle.main = Some(main);
                    lifecycle.open_error = None;
                    self.bus.arm_save_listeners();
                    info!(name = %self.descriptor.name, "Store started");
                    Ok(())
                }
                Err(e) => {
                    let message = match e {
                        Error::StoreOpen { message, .. } => message,
                        other => other.to_string(),
                    };
                    warn!(name = %self.descriptor.name, error = %message, "Store started degraded");
                    lifecycle.open_error = Some(message.clone());
                    Err(Error::StoreOpen {
                        path: self.store_path(),
                        message,
                    })
                }
            }
        };

        self.gate.release(&self.main_queue);
        outcome
    }

    /// Run [`Store::configure`] on the blocking pool.
    ///
    /// # Errors
    ///
    /// See [`Store::configure`].
    pub async fn configure_async(self: &Arc<Self>) -> Result<()> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.configure())
            .await
            .map_err(|e| Error::Other(format!("configure task failed: {e}")))?
    }

    /// Run [`Store::start`] on the blocking pool.
    ///
    /// # Errors
    ///
    /// See [`Store::start`].
    pub async fn start_async(self: &Arc<Self>) -> Result<()> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.start())
            .await
            .map_err(|e| Error::Other(format!("start task failed: {e}")))?
    }

    /// Configure and start the store.
    ///
    /// # Errors
    ///
    /// See [`Store::configure`] and [`Store::start`].
    pub async fn launch(self: &Arc<Self>) -> Result<()> {
        self.configure_async().await?;
        self.start_async().await
    }

    /// Close the store connection.
    ///
    /// Contexts handed out earlier become unavailable. The store may be
    /// started again.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails to close.
    pub fn close(&self) -> Result<()> {
        let main = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state == StoreState::Started {
                lifecycle.state = StoreState::NotStarted;
            }
            lifecycle.open_error = None;
            lifecycle.main.take()
        };

        if let Some(main) = main {
            main.close()?;
            info!(name = %self.descriptor.name, "Store closed");
        }
        Ok(())
    }

    /// Run `completion` once the store has started.
    ///
    /// Runs immediately on the calling thread if the store has already
    /// started, otherwise later on the main queue.
    pub fn on_ready<F>(&self, completion: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.gate.on_ready(completion);
    }

    pub fn add_change_listener<F>(&self, listener: F)
    where
        F: Fn(&Context) + Send + Sync + 'static,
    {
        self.bus.add_change_listener(listener);
    }

    pub fn add_save_listener<F>(&self, listener: F)
    where
        F: Fn(&Context, &SaveInfo) + Send + Sync + 'static,
    {
        self.bus.add_save_listener(listener);
    }

    /// Receive commits as [`StoreEvent`] values.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.bus.subscribe()
    }

    /// The durable root context.
    ///
    /// # Errors
    ///
    /// Returns `NotStarted` before start, or the open error of a degraded store.
    pub fn main_context(&self) -> Result<Context> {
        let lifecycle = self.lifecycle();
        if lifecycle.state != StoreState::Started {
            return Err(Error::NotStarted);
        }
        if let Some(message) = &lifecycle.open_error {
            return Err(Error::StoreOpen {
                path: self.store_path(),
                message: message.clone(),
            });
        }
        lifecycle.main.clone().ok_or(Error::NotStarted)
    }

    /// A new private context whose parent is the main context.
    ///
    /// # Errors
    ///
    /// See [`Store::main_context`].
    pub fn private_context(&self) -> Result<Context> {
        self.main_context()?.new_child("private")
    }

    /// Run `job` on the main context without waiting.
    ///
    /// # Errors
    ///
    /// See [`Store::main_context`].
    pub fn perform_on_main<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        self.main_context()?.perform(job)
    }

    /// Run `job` on the main context and wait for its result.
    ///
    /// # Errors
    ///
    /// See [`Store::main_context`].
    pub fn perform_and_wait_on_main<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce(&Context) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.main_context()?.perform_and_wait(job)
    }

    /// Run `job` on a new private context without waiting.
    ///
    /// # Errors
    ///
    /// See [`Store::main_context`].
    pub fn perform_on_private<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        self.private_context()?.perform(job)
    }

    /// Run `job` on a new private context and wait for its result.
    ///
    /// # Errors
    ///
    /// See [`Store::main_context`].
    pub fn perform_and_wait_on_private<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce(&Context) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.private_context()?.perform_and_wait(job)
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Open the store file and make sure it holds `model`.
///
/// A fresh file gets the model's schema. A file written with a different
/// model is refused.
fn open_store(
    path: &Path,
    model: &SchemaModel,
    options: &BTreeMap<String, String>,
    busy_timeout: Duration,
) -> Result<Connection> {
    let open = || -> rusqlite::Result<std::result::Result<Connection, String>> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        for (key, value) in options {
            conn.pragma_update(None, key, value)?;
        }

        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        let tables: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            [],
            |row| row.get(0),
        )?;

        if version == 0 && tables == 0 {
            conn.execute_batch(model.ddl())?;
            conn.pragma_update(None, "user_version", model.identifier())?;
            info!(path = %path.display(), model = model.identifier(), "Created store");
        } else if version != model.identifier() {
            return Ok(Err(format!(
                "store was written with model {version}, expected {}",
                model.identifier()
            )));
        }
        Ok(Ok(conn))
    };

    match open() {
        Ok(Ok(conn)) => Ok(conn),
        Ok(Err(message)) => Err(Error::StoreOpen {
            path: path.to_path_buf(),
            message,
        }),
        Err(e) => Err(Error::StoreOpen {
            path: path.to_path_buf(),
            message: e.to_string(),
        }),
    }
}
