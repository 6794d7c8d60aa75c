//! `SQLite` storage for the media library.
//!
//! This module provides persistent storage for:
//! - Library items with scalar metadata
//! - The full-text projection of item text columns
//! - Embedding vectors with staleness/retry state
//! - Versioned, forward-only schema migrations

mod connection;
pub mod embeddings;
pub mod fts;
mod items;
pub mod migrations;
mod models;
pub mod schema;

pub use connection::Database;
pub use embeddings::{
    count_regeneration_pending, decode_vector, encode_vector, get_embedding,
    list_regeneration_pending, load_candidates, mark_item_stale, mark_model_stale, mark_stale,
    record_failed_attempt, upsert_embedding, Candidate,
};
pub use items::{
    count_items, delete_item, get_item, get_item_by_path, insert_item, list_items, record_view,
    set_favorite, update_item_text,
};
pub use migrations::{current_version, upgrade, upgrade_to_latest, MigrationStep, LATEST_VERSION};
pub use models::{EmbeddingPurpose, EmbeddingRow, ItemRecord};
pub use schema::verify_schema;

use crate::Result;

/// Initialize storage: run the migration chain and verify the result.
///
/// Takes the exclusive lock for the duration of the upgrade; migrations
/// never run concurrently with readers or writers. A failed migration
/// leaves this function with an error and the store must not be used.
///
/// # Errors
///
/// Returns an error if a migration step fails, the store is at an
/// unknown version, or the migrated structure does not match its
/// declared snapshot.
pub fn init_storage(db: &Database) -> Result<()> {
    db.begin_exclusive()?;

    let result = migrations::upgrade_to_latest(db)
        .and_then(|version| db.with_conn(|conn| schema::verify_schema(conn, version)));

    let unlock = db.end_exclusive();
    result?;
    unlock?;

    tracing::info!(version = LATEST_VERSION, "Storage initialized");
    Ok(())
}
