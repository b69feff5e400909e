//! Error types for storestack.
//!
//! Provides structured error handling with:
//! - Machine-readable error codes (`ErrorCode`)
//! - Category-based exit codes (2=store, 3=migration, 4=validation, etc.)
//! - A fatal flag for migration failures the host should not continue past
//! - Context-aware recovery hints
//! - Structured JSON output for piped / non-TTY consumers

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias for storestack operations.
pub type Result<T> = std::result::Result<T, Error>;

// ── Error Code ────────────────────────────────────────────────

/// Machine-readable error codes grouped by category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Store (exit 2)
    DatabaseError,
    StoreOpenFailed,

    // Migration (exit 3)
    UnknownStoreVersion,
    UnreachableVersion,
    ModelNotFound,
    MappingNotFound,
    MigrationFailed,

    // Validation (exit 4)
    InvalidDescriptor,
    InvalidArgument,

    // Save (exit 5)
    SaveFailed,

    // Lifecycle (exit 6)
    NotConfigured,
    NotStarted,
    ContextUnavailable,

    // Config (exit 7)
    ConfigError,

    // I/O (exit 8)
    IoError,
    JsonError,

    // Internal (exit 1)
    InternalError,
}

impl ErrorCode {
    /// Machine-readable SCREAMING_SNAKE code string.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::DatabaseError => "DATABASE_ERROR",
            Self::StoreOpenFailed => "STORE_OPEN_FAILED",
            Self::UnknownStoreVersion => "UNKNOWN_STORE_VERSION",
            Self::UnreachableVersion => "UNREACHABLE_VERSION",
            Self::ModelNotFound => "MODEL_NOT_FOUND",
            Self::MappingNotFound => "MAPPING_NOT_FOUND",
            Self::MigrationFailed => "MIGRATION_FAILED",
            Self::InvalidDescriptor => "INVALID_DESCRIPTOR",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::SaveFailed => "SAVE_FAILED",
            Self::NotConfigured => "NOT_CONFIGURED",
            Self::NotStarted => "NOT_STARTED",
            Self::ContextUnavailable => "CONTEXT_UNAVAILABLE",
            Self::ConfigError => "CONFIG_ERROR",
            Self::IoError => "IO_ERROR",
            Self::JsonError => "JSON_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Category-based exit code (1-8).
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::InternalError => 1,
            Self::DatabaseError | Self::StoreOpenFailed => 2,
            Self::UnknownStoreVersion
            | Self::UnreachableVersion
            | Self::ModelNotFound
            | Self::MappingNotFound
            | Self::MigrationFailed => 3,
            Self::InvalidDescriptor | Self::InvalidArgument => 4,
            Self::SaveFailed => 5,
            Self::NotConfigured | Self::NotStarted | Self::ContextUnavailable => 6,
            Self::ConfigError => 7,
            Self::IoError | Self::JsonError => 8,
        }
    }

    /// Whether the caller can succeed by retrying with corrected input.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InvalidDescriptor
                | Self::InvalidArgument
                | Self::ConfigError
                | Self::NotConfigured
                | Self::NotStarted
                | Self::SaveFailed
                | Self::DatabaseError
        )
    }

    /// Whether the error belongs to the migration category.
    ///
    /// A store whose on-disk schema cannot be proven compatible must not be
    /// opened. The host decides whether to abort or shut down in order.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.exit_code() == 3
    }
}

// ── Error Enum ────────────────────────────────────────────────

/// Errors that can occur in storestack operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid store descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Error loading model from model source '{source_name}'")]
    ModelNotFound { source_name: String },

    #[error("No schema model for version {version}")]
    ModelVersionMissing { version: i32 },

    #[error("Expected mapping not present: {from} -> {to}")]
    MappingNotFound { from: i32, to: i32 },

    #[error("Unknown store version at {}", path.display())]
    UnknownStoreVersion { path: PathBuf },

    #[error("Version {to} is not reachable from version {from}")]
    UnreachableVersion { from: i32, to: i32 },

    #[error("Failed attempting to migrate from {from} to {to}: {source}")]
    MigrationStep {
        from: i32,
        to: i32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Failed to force WAL checkpoint for {}: {source}", path.display())]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Failed to replace store at {}: {source}", path.display())]
    ReplaceStore {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open store at {}: {message}", path.display())]
    StoreOpen { path: PathBuf, message: String },

    #[error("Store is not configured")]
    NotConfigured,

    #[error("Store is not started")]
    NotStarted,

    #[error("Context {0} is no longer running")]
    ContextUnavailable(String),

    #[error("Failed to save context {context}: {source}")]
    Save {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Map this error to its structured `ErrorCode`.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidDescriptor(_) => ErrorCode::InvalidDescriptor,
            Self::ModelNotFound { .. } => ErrorCode::ConfigError,
            Self::ModelVersionMissing { .. } => ErrorCode::ModelNotFound,
            Self::MappingNotFound { .. } => ErrorCode::MappingNotFound,
            Self::UnknownStoreVersion { .. } => ErrorCode::UnknownStoreVersion,
            Self::UnreachableVersion { .. } => ErrorCode::UnreachableVersion,
            Self::MigrationStep { .. } | Self::Checkpoint { .. } | Self::ReplaceStore { .. } => {
                ErrorCode::MigrationFailed
            }
            Self::StoreOpen { .. } => ErrorCode::StoreOpenFailed,
            Self::NotConfigured => ErrorCode::NotConfigured,
            Self::NotStarted => ErrorCode::NotStarted,
            Self::ContextUnavailable(_) => ErrorCode::ContextUnavailable,
            Self::Save { .. } => ErrorCode::SaveFailed,
            Self::Database(_) => ErrorCode::DatabaseError,
            Self::Io(_) => ErrorCode::IoError,
            Self::Json(_) => ErrorCode::JsonError,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::Config(_) => ErrorCode::ConfigError,
            Self::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Category-based exit code, delegating to the `ErrorCode`.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        self.error_code().exit_code()
    }

    /// True for migration failures; see [`ErrorCode::is_fatal`].
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.error_code().is_fatal()
    }

    /// Context-aware recovery hint for humans.
    ///
    /// Returns `None` if no actionable suggestion exists.
    #[must_use]
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::InvalidDescriptor(_) => {
                Some("Provide a non-empty store name and an existing store directory".to_string())
            }
            Self::ModelNotFound { source_name } => Some(format!(
                "Model source '{source_name}' has no schema models. \
                 Models are loaded from '<id>.sql' files."
            )),
            Self::ModelVersionMissing { version } => {
                Some(format!("Add '{version}.sql' to the model directory"))
            }
            Self::MappingNotFound { from, to } => Some(format!(
                "The change cannot be inferred. Add '{from}-{to}.mapping.sql' to the model directory"
            )),
            Self::UnknownStoreVersion { path } => {
                let name = path.file_stem().unwrap_or_default().to_string_lossy();
                let dir = path.parent().unwrap_or(Path::new("."));
                Some(format!(
                    "Inspect the store with `storestack info --name {name} --store-dir {}`",
                    dir.display()
                ))
            }
            Self::UnreachableVersion { .. } => {
                Some("Check the next-version links of the version set".to_string())
            }
            Self::NotConfigured => Some("Call configure() before start()".to_string()),
            Self::NotStarted => {
                Some("Wait for the store with on_ready() before using contexts".to_string())
            }
            Self::MigrationStep { .. }
            | Self::Checkpoint { .. }
            | Self::ReplaceStore { .. }
            | Self::StoreOpen { .. }
            | Self::ContextUnavailable(_)
            | Self::Save { .. }
            | Self::Database(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::InvalidArgument(_)
            | Self::Config(_)
            | Self::Other(_) => None,
        }
    }

    /// Structured JSON representation for machine consumption.
    #[must_use]
    pub fn to_structured_json(&self) -> serde_json::Value {
        let code = self.error_code();
        let mut obj = serde_json::json!({
            "error": {
                "code": code.as_str(),
                "message": self.to_string(),
                "retryable": code.is_retryable(),
                "fatal": code.is_fatal(),
                "exit_code": code.exit_code(),
            }
        });

        if let Some(hint) = self.hint() {
            obj["error"]["hint"] = serde_json::Value::String(hint);
        }

        obj
    }
}
