//! Error types and Result aliases for Shoebox.
//!
//! This module defines the error hierarchy used throughout the crate.
//! All public functions return `Result<T, Error>` or `Result<T>`.

use thiserror::Error;

/// Result type alias using Shoebox's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Shoebox operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Database/storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Embedding lifecycle error.
    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    /// Similarity search error.
    #[error("search error: {0}")]
    Search(#[from] SearchError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Storage-specific errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// `SQLite` database error.
    #[error("database error: {0}")]
    Database(String),

    /// Record not found.
    #[error("not found: {entity} with id '{id}'")]
    NotFound { entity: &'static str, id: String },

    /// No registered migration step leads out of this version.
    #[error("no migration step registered from schema version {from}")]
    MissingMigrationStep { from: i64 },

    /// A migration step failed; the whole upgrade chain was abandoned.
    /// The store must not be opened at an inconsistent version.
    #[error("migration to version {version} aborted: {reason}")]
    MigrationAborted { version: i64, reason: String },

    /// The store was written by a newer release. Never downgrade silently.
    #[error("store is at unknown schema version {found} (latest known is {latest})")]
    UnknownSchemaVersion { found: i64, latest: i64 },

    /// Unique-path constraint violation. The insert mutated nothing.
    #[error("an item with source path '{0}' already exists")]
    DuplicatePath(String),

    /// Vector payload does not match its declared dimension.
    #[error("corrupt vector payload: {0}")]
    CorruptVector(String),

    /// Live schema does not match the declared snapshot after a migration.
    #[error("schema verification failed: {0}")]
    SchemaMismatch(String),
}

/// Embedding-specific errors.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    /// Generation attempt failed. Retryable; recorded in the attempt counter.
    #[error("embedding generation failed after {attempts} attempt(s): {reason}")]
    Generation { attempts: i64, reason: String },

    /// The embedding model cannot be used at all. Surfaced explicitly,
    /// never degraded into an empty or stale result.
    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),

    /// Worker pool error.
    #[error("worker pool error: {0}")]
    WorkerPool(String),
}

/// Search-specific errors.
#[derive(Error, Debug)]
pub enum SearchError {
    /// Query vector length differs from a candidate's. Per-candidate:
    /// the candidate is excluded and reported, never coerced.
    #[error("dimension mismatch for candidate {id}: expected {expected}, got {actual}")]
    DimensionMismatch {
        id: i64,
        expected: usize,
        actual: usize,
    },

    /// Query produced no usable vector.
    #[error("query embedding failed: {0}")]
    QueryEmbedding(String),
}

impl Error {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl StorageError {
    /// Create a not-found error.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}
