//! storestack - persistence stack for SQLite stores
//!
//! Manages one store file through its whole life: directory setup,
//! progressive schema migration, opening, a tree of contexts for concurrent
//! work, and commit notifications.
//!
//! # Architecture
//!
//! - [`schema`] - Versioned schema models and mappings between them
//! - [`migration`] - Step-by-step migration along a version chain
//! - [`store`] - Store controller: configure, start, context access
//! - [`context`] - Main and private contexts, commit propagation
//! - [`notify`] - Change and save listeners, event channel
//! - [`layout`] - Folder layout (per-user or shared group)
//! - [`config`] - Configuration file
//! - [`cli`] - Command-line interface using clap
//! - [`error`] - Error types and handling
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use storestack::migration::{MigrationEngine, VersionChain};
//! use storestack::schema::ModelBundle;
//! use storestack::store::{Store, StoreDescriptor};
//!
//! # fn main() -> storestack::Result<()> {
//! let models = ModelBundle::load_dir(Path::new("models"))?;
//! let engine = MigrationEngine::new(VersionChain::linear(models.identifiers())?);
//! let store = Store::new(
//!     StoreDescriptor::new("Notes", Arc::new(models), Path::new("data")).with_migrator(engine),
//! )?;
//!
//! store.configure()?;
//! store.start()?;
//!
//! let writer = store.private_context()?;
//! writer.insert("notes", &serde_json::Map::new())?;
//! writer.save_to_store()?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod layout;
pub mod migration;
pub mod notify;
pub mod schema;
pub mod store;

pub use context::{Change, Context, ContextId, ContextKind, Record};
pub use error::{Error, ErrorCode, Result};
pub use migration::{MigrationEngine, MigrationVersion, Migrator, StoreMigrator, VersionChain};
pub use notify::{NotificationBus, SaveInfo, StoreEvent};
pub use schema::{ModelBundle, ModelSource, SchemaModel};
pub use store::{Store, StoreDescriptor, StoreState};
