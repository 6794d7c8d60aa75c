//! Shoebox: local-first media library store.
//!
//! Persists imported media items in `SQLite` with a versioned, forward-only
//! schema migration chain, a synchronously maintained full-text projection,
//! and per-item embedding vectors with staleness/retry tracking for
//! similarity search.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod embeddings;
pub mod error;
pub mod observability;
pub mod search;
pub mod storage;

pub use config::Config;
pub use error::{EmbeddingError, Error, Result, SearchError, StorageError};
