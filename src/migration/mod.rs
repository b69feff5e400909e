//! Progressive store migration.
//!
//! Walks a store forward through every intermediate schema version, one
//! pairwise step at a time. Each step reads the previous step's output and
//! writes a fresh temporary store; the original file is replaced only once
//! the whole chain has succeeded.
//!
//! # Submodules
//!
//! - [`metadata`] - Store header metadata, WAL checkpoint, destroy/replace
//! - [`step`] - One pairwise transformation

pub mod metadata;
pub mod step;

pub use metadata::{StoreMetadata, destroy_store, force_wal_checkpoint, replace_store};
pub use step::StepReport;

use crate::error::{Error, Result};
use crate::schema::ModelSource;
use serde::Serialize;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use step::MigrationStep;
use tracing::{debug, info, warn};

/// A finite, ordered set of schema versions.
///
/// Implemented by an application's version enum. Exactly one version is
/// `current`, and following `next_version` from any version must end there.
pub trait MigrationVersion: Copy + Eq + Debug + Send + Sync + 'static {
    /// Every version, oldest first.
    fn all() -> &'static [Self];

    /// The latest version.
    fn current() -> Self;

    /// The version that follows this one, `None` for the current version.
    fn next_version(self) -> Option<Self>;

    /// Integer identity written to the store's metadata.
    fn identifier(self) -> i32;
}

/// One link of the next-version relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct VersionLink {
    id: i32,
    next: Option<i32>,
}

/// Runtime view of a next-version relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionChain {
    links: Vec<VersionLink>,
    current: i32,
}

impl VersionChain {
    /// Build the chain of a version enum.
    #[must_use]
    pub fn from_versions<V: MigrationVersion>() -> Self {
        let links = V::all()
            .iter()
            .map(|v| VersionLink {
                id: v.identifier(),
                next: v.next_version().map(MigrationVersion::identifier),
            })
            .collect();
        Self {
            links,
            current: V::current().identifier(),
        }
    }

    /// Build a linear chain where each identifier links to the next larger one.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `ids` is empty.
    pub fn linear(ids: impl IntoIterator<Item = i32>) -> Result<Self> {
        let mut ids: Vec<i32> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();

        let current = *ids
            .last()
            .ok_or_else(|| Error::InvalidArgument("version chain is empty".into()))?;
        let links = ids
            .iter()
            .enumerate()
            .map(|(i, &id)| VersionLink {
                id,
                next: ids.get(i + 1).copied(),
            })
            .collect();

        Ok(Self { links, current })
    }

    /// Identifier of the current version.
    #[must_use]
    pub fn current(&self) -> i32 {
        self.current
    }

    /// Whether `id` is part of the chain.
    #[must_use]
    pub fn contains(&self, id: i32) -> bool {
        self.links.iter().any(|l| l.id == id)
    }

    /// The version following `id`.
    #[must_use]
    pub fn next(&self, id: i32) -> Option<i32> {
        self.links.iter().find(|l| l.id == id).and_then(|l| l.next)
    }

    /// Ordered `(from, to)` pairs leading from `from` to `to`.
    ///
    /// # Errors
    ///
    /// Returns `UnreachableVersion` if the relation dead-ends or cycles
    /// before reaching `to`.
    pub fn plan(&self, from: i32, to: i32) -> Result<Vec<(i32, i32)>> {
        let mut steps = Vec::new();
        let mut cursor = from;

        while cursor != to {
            if steps.len() >= self.links.len() {
                return Err(Error::UnreachableVersion { from, to });
            }
            let next = self
                .next(cursor)
                .ok_or(Error::UnreachableVersion { from, to })?;
            steps.push((cursor, next));
            cursor = next;
        }

        Ok(steps)
    }
}

/// Summary of one migration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub store: PathBuf,
    pub from: i32,
    pub to: i32,
    pub steps: Vec<StepReport>,
}

impl MigrationReport {
    /// Whether the store was already at the target version.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Migrates store files along a [`VersionChain`].
#[derive(Debug, Clone)]
pub struct MigrationEngine {
    chain: VersionChain,
    work_dir: Option<PathBuf>,
}

impl MigrationEngine {
    /// Create an engine for `chain`.
    #[must_use]
    pub fn new(chain: VersionChain) -> Self {
        Self {
            chain,
            work_dir: None,
        }
    }

    /// Place temporary step outputs under `dir` instead of next to the store.
    #[must_use]
    pub fn with_work_dir(mut self, dir: &Path) -> Self {
        self.work_dir = Some(dir.to_path_buf());
        self
    }

    #[must_use]
    pub fn chain(&self) -> &VersionChain {
        &self.chain
    }

    /// The chain version the store at `store` was written with.
    ///
    /// A version qualifies when it is part of the chain and the model source
    /// has a model for it.
    #[must_use]
    pub fn compatible_version(&self, store: &Path, models: &dyn ModelSource) -> Option<i32> {
        let metadata = StoreMetadata::read(store)?;
        let version = metadata.version;
        (self.chain.contains(version) && models.model(version).is_some()).then_some(version)
    }

    /// Whether the store at `store` must be migrated to reach `target`.
    ///
    /// A missing store needs no migration. A store whose metadata matches no
    /// known model is destroyed and treated as fresh.
    ///
    /// # Errors
    ///
    /// Returns an error if an unrecognized store cannot be removed.
    pub fn requires_migration(
        &self,
        store: &Path,
        models: &dyn ModelSource,
        target: i32,
    ) -> Result<bool> {
        let Some(metadata) = StoreMetadata::read(store) else {
            if store.exists() {
                warn!(path = %store.display(), "Store is not a database, discarding");
                destroy_store(store)?;
            }
            return Ok(false);
        };

        if let Some(version) = self.compatible_version(store, models) {
            debug!(version, target, "Store version resolved");
            return Ok(version != target);
        }

        warn!(
            path = %store.display(),
            version = metadata.version,
            "Store matches no known schema model, discarding"
        );
        destroy_store(store)?;
        Ok(false)
    }

    /// Migrate the store at `store` to `target`, step by step.
    ///
    /// # Errors
    ///
    /// All errors are fatal (see [`Error::is_fatal`]) except I/O failures
    /// creating the work directory. The original file is untouched on error.
    pub fn migrate_store(
        &self,
        store: &Path,
        models: &dyn ModelSource,
        target: i32,
    ) -> Result<MigrationReport> {
        let from = self
            .compatible_version(store, models)
            .ok_or_else(|| Error::UnknownStoreVersion {
                path: store.to_path_buf(),
            })?;

        let mut report = MigrationReport {
            store: store.to_path_buf(),
            from,
            to: target,
            steps: Vec::new(),
        };
        if from == target {
            debug!(version = from, "Store already at target version");
            return Ok(report);
        }

        let plan = self.chain.plan(from, target)?;
        force_wal_checkpoint(store)?;

        let work_root = match &self.work_dir {
            Some(dir) => dir.clone(),
            None => store
                .parent()
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf),
        };
        let work = tempfile::Builder::new()
            .prefix(".migration-")
            .tempdir_in(&work_root)?;

        info!(from, to = target, steps = plan.len(), "Starting progressive migration");

        let mut current = store.to_path_buf();
        for (source, destination) in plan {
            let step = MigrationStep::build(source, destination, models)?;
            let output = work
                .path()
                .join(format!("{}.sqlite", uuid::Uuid::new_v4()));
            report.steps.push(step.execute(&current, &output)?);
            current = output;
        }

        replace_store(store, &current)?;
        info!(from, to = target, "Progressive migration complete");
        Ok(report)
    }
}

/// Object-safe migrator used by the store controller.
///
/// Always targets the chain's current version.
pub trait StoreMigrator: Send + Sync + Debug {
    /// Whether the store needs migrating to the current version.
    ///
    /// # Errors
    ///
    /// Returns an error if an unrecognized store cannot be removed.
    fn requires_migration(&self, store: &Path, models: &dyn ModelSource) -> Result<bool>;

    /// Migrate the store to the current version.
    ///
    /// # Errors
    ///
    /// See [`MigrationEngine::migrate_store`].
    fn migrate_store(&self, store: &Path, models: &dyn ModelSource) -> Result<MigrationReport>;
}

impl StoreMigrator for MigrationEngine {
    fn requires_migration(&self, store: &Path, models: &dyn ModelSource) -> Result<bool> {
        MigrationEngine::requires_migration(self, store, models, self.chain.current())
    }

    fn migrate_store(&self, store: &Path, models: &dyn ModelSource) -> Result<MigrationReport> {
        MigrationEngine::migrate_store(self, store, models, self.chain.current())
    }
}

/// Typed migrator over an application's version enum.
#[derive(Debug, Clone)]
pub struct Migrator<V> {
    engine: MigrationEngine,
    _versions: PhantomData<fn() -> V>,
}

impl<V: MigrationVersion> Default for Migrator<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: MigrationVersion> Migrator<V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            engine: MigrationEngine::new(VersionChain::from_versions::<V>()),
            _versions: PhantomData,
        }
    }

    /// See [`MigrationEngine::with_work_dir`].
    #[must_use]
    pub fn with_work_dir(mut self, dir: &Path) -> Self {
        self.engine = self.engine.with_work_dir(dir);
        self
    }

    #[must_use]
    pub fn current(&self) -> V {
        V::current()
    }

    /// The version the store at `store` was written with.
    #[must_use]
    pub fn compatible_version(&self, store: &Path, models: &dyn ModelSource) -> Option<V> {
        let id = self.engine.compatible_version(store, models)?;
        V::all().iter().copied().find(|v| v.identifier() == id)
    }

    /// See [`MigrationEngine::requires_migration`].
    ///
    /// # Errors
    ///
    /// Returns an error if an unrecognized store cannot be removed.
    pub fn requires_migration(&self, store: &Path, models: &dyn ModelSource, target: V) -> Result<bool> {
        self.engine
            .requires_migration(store, models, target.identifier())
    }

    /// See [`MigrationEngine::migrate_store`].
    ///
    /// # Errors
    ///
    /// See [`MigrationEngine::migrate_store`].
    pub fn migrate_store(
        &self,
        store: &Path,
        models: &dyn ModelSource,
        target: V,
    ) -> Result<MigrationReport> {
        self.engine.migrate_store(store, models, target.identifier())
    }
}

impl<V: MigrationVersion> StoreMigrator for Migrator<V> {
    fn requires_migration(&self, store: &Path, models: &dyn ModelSource) -> Result<bool> {
        Migrator::requires_migration(self, store, models, V::current())
    }

    fn migrate_store(&self, store: &Path, models: &dyn ModelSource) -> Result<MigrationReport> {
        Migrator::migrate_store(self, store, models, V::current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ModelBundle;
    use rusqlite::Connection;
    use std::fs;
    use tempfile::TempDir;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum NotesVersion {
        V1,
        V2,
        V3,
    }

    impl MigrationVersion for NotesVersion {
        fn all() -> &'static [Self] {
            &[Self::V1, Self::V2, Self::V3]
        }

        fn current() -> Self {
            Self::V3
        }

        fn next_version(self) -> Option<Self> {
            match self {
                Self::V1 => Some(Self::V2),
                Self::V2 => Some(Self::V3),
                Self::V3 => None,
            }
        }

        fn identifier(self) -> i32 {
            match self {
                Self::V1 => 1,
                Self::V2 => 2,
                Self::V3 => 3,
            }
        }
    }

    /// Each model carries a `trail` table; each custom mapping copies the
    /// previous trail and appends its own hop.
    fn trail_bundle() -> ModelBundle {
        ModelBundle::new("Notes")
            .with_model(1, "CREATE TABLE trail (hop TEXT NOT NULL);")
            .with_model(2, "CREATE TABLE trail (hop TEXT NOT NULL); CREATE TABLE tags (name TEXT);")
            .with_model(3, "CREATE TABLE trail (hop TEXT NOT NULL); CREATE TABLE tags (name TEXT, color TEXT);")
            .with_mapping(1, 2, "INSERT INTO trail SELECT hop FROM src.trail; INSERT INTO trail VALUES ('1->2');")
            .with_mapping(2, 3, "INSERT INTO trail SELECT hop FROM src.trail; INSERT INTO trail VALUES ('2->3');")
    }

    fn create_store(path: &Path, version: i32, ddl: &str) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(ddl).unwrap();
        conn.execute("INSERT INTO trail VALUES ('origin')", []).unwrap();
        conn.pragma_update(None, "user_version", version).unwrap();
    }

    fn read_trail(path: &Path) -> Vec<String> {
        let conn = Connection::open(path).unwrap();
        conn.prepare("SELECT hop FROM trail ORDER BY rowid")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap()
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_chain_plan() {
        let chain = VersionChain::from_versions::<NotesVersion>();
        assert_eq!(chain.current(), 3);
        assert_eq!(chain.plan(1, 3).unwrap(), vec![(1, 2), (2, 3)]);
        assert!(chain.plan(3, 3).unwrap().is_empty());
        assert!(matches!(
            chain.plan(3, 1),
            Err(Error::UnreachableVersion { from: 3, to: 1 })
        ));
    }

    #[test]
    fn test_linear_chain_of_n_versions() {
        let chain = VersionChain::linear([5, 1, 3, 2, 4]).unwrap();
        let plan = chain.plan(1, 5).unwrap();
        assert_eq!(plan.len(), 4);
        assert!(plan.windows(2).all(|w| w[0].1 == w[1].0 && w[0].0 < w[1].0));
        assert!(VersionChain::linear([]).is_err());
    }

    #[test]
    fn test_plan_detects_cycle() {
        let chain = VersionChain {
            links: vec![
                VersionLink { id: 1, next: Some(2) },
                VersionLink { id: 2, next: Some(1) },
                VersionLink { id: 3, next: None },
            ],
            current: 3,
        };
        assert!(matches!(chain.plan(1, 3), Err(Error::UnreachableVersion { .. })));
    }

    #[test]
    fn test_migrate_v1_to_v3_runs_every_step() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("Notes.sqlite");
        let bundle = trail_bundle();
        create_store(&store, 1, bundle.model(1).unwrap().ddl());

        let migrator = Migrator::<NotesVersion>::new();
        assert!(migrator.requires_migration(&store, &bundle, NotesVersion::V3).unwrap());

        let report = migrator.migrate_store(&store, &bundle, NotesVersion::V3).unwrap();
        let hops: Vec<(i32, i32)> = report.steps.iter().map(|s| (s.from, s.to)).collect();
        assert_eq!(hops, vec![(1, 2), (2, 3)]);

        assert_eq!(read_trail(&store), vec!["origin", "1->2", "2->3"]);
        assert_eq!(StoreMetadata::read(&store).unwrap().version, 3);
        assert_eq!(
            migrator.compatible_version(&store, &bundle),
            Some(NotesVersion::V3)
        );
        assert_eq!(dir_entries(dir.path()), vec!["Notes.sqlite".to_string()]);
    }

    #[test]
    fn test_migrate_at_target_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("Notes.sqlite");
        let bundle = trail_bundle();
        create_store(&store, 3, bundle.model(3).unwrap().ddl());
        let before = fs::read(&store).unwrap();

        let migrator = Migrator::<NotesVersion>::new();
        assert!(!migrator.requires_migration(&store, &bundle, NotesVersion::V3).unwrap());
        let report = migrator.migrate_store(&store, &bundle, NotesVersion::V3).unwrap();

        assert!(report.is_noop());
        assert_eq!(fs::read(&store).unwrap(), before);
    }

    #[test]
    fn test_unreachable_target_fails_before_mutation() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("Notes.sqlite");
        let bundle = trail_bundle();
        create_store(&store, 3, bundle.model(3).unwrap().ddl());
        let before = fs::read(&store).unwrap();

        let err = Migrator::<NotesVersion>::new()
            .migrate_store(&store, &bundle, NotesVersion::V1)
            .unwrap_err();

        assert!(err.is_fatal());
        assert!(matches!(err, Error::UnreachableVersion { from: 3, to: 1 }));
        assert_eq!(fs::read(&store).unwrap(), before);
        assert_eq!(dir_entries(dir.path()), vec!["Notes.sqlite".to_string()]);
    }

    #[test]
    fn test_failing_second_step_leaves_original_untouched() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("Notes.sqlite");
        let bundle = trail_bundle().with_mapping(2, 3, "INSERT INTO missing_table VALUES (1);");
        create_store(&store, 1, bundle.model(1).unwrap().ddl());
        let before = fs::read(&store).unwrap();
        let modified = fs::metadata(&store).unwrap().modified().unwrap();

        let err = Migrator::<NotesVersion>::new()
            .migrate_store(&store, &bundle, NotesVersion::V3)
            .unwrap_err();

        assert!(matches!(err, Error::MigrationStep { from: 2, to: 3, .. }));
        assert!(err.is_fatal());
        assert_eq!(fs::read(&store).unwrap(), before);
        assert_eq!(fs::metadata(&store).unwrap().modified().unwrap(), modified);
        assert_eq!(dir_entries(dir.path()), vec!["Notes.sqlite".to_string()]);
    }

    #[test]
    fn test_unknown_store_is_discarded() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("Notes.sqlite");
        let bundle = trail_bundle();
        create_store(&store, 42, bundle.model(1).unwrap().ddl());

        let migrator = Migrator::<NotesVersion>::new();
        assert!(!migrator.requires_migration(&store, &bundle, NotesVersion::V3).unwrap());
        assert!(!store.exists());
    }

    #[test]
    fn test_missing_store_needs_no_migration() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("Notes.sqlite");
        let migrator = Migrator::<NotesVersion>::new();
        assert!(!migrator.requires_migration(&store, &trail_bundle(), NotesVersion::V3).unwrap());
    }

    #[test]
    fn test_migrate_unknown_version_is_fatal() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("Notes.sqlite");
        let bundle = trail_bundle();
        create_store(&store, 9, bundle.model(1).unwrap().ddl());

        let err = MigrationEngine::new(VersionChain::from_versions::<NotesVersion>())
            .migrate_store(&store, &bundle, 3)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownStoreVersion { .. }));
        assert!(err.is_fatal());
        assert!(store.exists());
    }

    #[test]
    fn test_migrate_from_wal_store() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("Notes.sqlite");
        let bundle = trail_bundle();
        {
            let conn = Connection::open(&store).unwrap();
            conn.pragma_update(None, "journal_mode", "WAL").unwrap();
        }
        create_store(&store, 2, bundle.model(2).unwrap().ddl());

        let engine: &dyn StoreMigrator = &Migrator::<NotesVersion>::new();
        assert!(engine.requires_migration(&store, &bundle).unwrap());
        let report = engine.migrate_store(&store, &bundle).unwrap();

        assert_eq!(report.steps.len(), 1);
        assert_eq!(read_trail(&store), vec!["origin", "2->3"]);
    }
}
