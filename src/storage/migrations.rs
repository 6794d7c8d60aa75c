//! Versioned, forward-only schema migrations.
//!
//! Each released on-disk layout has an integer schema version. A
//! [`MigrationStep`] is a plain data value `(from_version, to_version,
//! apply)`; the registry in [`steps`] is an ordered list covering every
//! version gap exactly once, and the chain from any version to the latest
//! is resolved by lookup, not dispatch.
//!
//! Guarantees:
//! - each step runs in one immediate transaction together with its
//!   `schema_migrations` row, so a failed step rolls back completely and
//!   the store stays at the last fully applied version;
//! - columns a step does not touch keep their exact prior value,
//!   including the NULL vs empty distinction for strings and blobs;
//! - steps that change the full-text column set rebuild the projection
//!   from current items content before completing;
//! - a store written by a newer release is rejected, never downgraded.

use rusqlite::Connection;

use super::fts;
use crate::error::StorageError;
use crate::storage::Database;
use crate::Result;

/// Latest schema version this build knows how to produce.
pub const LATEST_VERSION: i64 = 5;

/// One forward migration: `from_version` → `to_version = from_version + 1`.
#[derive(Debug)]
pub struct MigrationStep {
    /// Version this step upgrades from.
    pub from_version: i64,
    /// Version this step produces.
    pub to_version: i64,
    /// The transformation, applied inside one transaction.
    pub apply: fn(&Connection) -> Result<()>,
}

/// The ordered migration registry.
///
/// Steps must exactly cover every gap `0..LATEST_VERSION` with no
/// duplicates; `resolve_chain` depends on it.
#[must_use]
pub fn steps() -> &'static [MigrationStep] {
    &[
        MigrationStep {
            from_version: 0,
            to_version: 1,
            apply: migrate_to_v1,
        },
        MigrationStep {
            from_version: 1,
            to_version: 2,
            apply: migrate_to_v2,
        },
        MigrationStep {
            from_version: 2,
            to_version: 3,
            apply: migrate_to_v3,
        },
        MigrationStep {
            from_version: 3,
            to_version: 4,
            apply: migrate_to_v4,
        },
        MigrationStep {
            from_version: 4,
            to_version: 5,
            apply: migrate_to_v5,
        },
    ]
}

/// Resolve the contiguous chain of steps from `from` to `to`.
///
/// # Errors
///
/// Returns `MissingMigrationStep` if any intermediate version has no
/// registered step.
fn resolve_chain(from: i64, to: i64) -> Result<Vec<&'static MigrationStep>> {
    let registry = steps();
    let mut chain = Vec::new();
    let mut version = from;

    while version < to {
        let step = registry
            .iter()
            .find(|s| s.from_version == version)
            .ok_or(StorageError::MissingMigrationStep { from: version })?;
        debug_assert_eq!(step.to_version, version + 1);
        chain.push(step);
        version = step.to_version;
    }

    Ok(chain)
}

/// Ensure the version bookkeeping table exists.
fn ensure_version_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )
    .map_err(|e| StorageError::Database(format!("failed to create migrations table: {e}")))?;
    Ok(())
}

/// Get the current schema version. 0 means a fresh store.
///
/// # Errors
///
/// Returns an error if the version cannot be read.
pub fn current_version(conn: &Connection) -> Result<i64> {
    ensure_version_table(conn)?;
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|e| StorageError::Database(format!("failed to read schema version: {e}")).into())
}

/// Record a migration as applied. Runs inside the step's transaction.
fn record_migration(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)",
        rusqlite::params![version, chrono::Utc::now().timestamp()],
    )
    .map_err(|e| StorageError::Database(format!("failed to record migration: {e}")))?;
    Ok(())
}

/// Apply the migration chain from version `from` to version `to`.
///
/// Applying to an already-current store (`from == to`) is a no-op
/// success. Each step runs in its own immediate transaction together
/// with its version record; the first failure rolls that step back and
/// abandons the rest of the chain.
///
/// # Errors
///
/// - `UnknownSchemaVersion` if `from > to` (the store was written by a
///   newer release);
/// - `MissingMigrationStep` if the registry does not cover the range;
/// - `MigrationAborted` if a step fails.
pub fn upgrade(db: &Database, from: i64, to: i64) -> Result<()> {
    // Bookkeeping table must exist before any step records into it.
    db.with_conn(ensure_version_table)?;

    if from == to {
        tracing::debug!(version = from, "Schema already current, nothing to migrate");
        return Ok(());
    }
    if from > to {
        return Err(StorageError::UnknownSchemaVersion {
            found: from,
            latest: to,
        }
        .into());
    }

    // Validate the whole chain before touching the store.
    let chain = resolve_chain(from, to)?;
    tracing::info!(from, to, steps = chain.len(), "Applying schema migrations");

    for step in chain {
        db.with_transaction(|conn| {
            (step.apply)(conn).map_err(|e| {
                crate::Error::from(StorageError::MigrationAborted {
                    version: step.to_version,
                    reason: e.to_string(),
                })
            })?;
            record_migration(conn, step.to_version)
        })?;
        tracing::info!(version = step.to_version, "Migration step applied");
    }

    Ok(())
}

/// Upgrade the store to the latest schema version.
///
/// Returns the version the store is at afterwards.
///
/// # Errors
///
/// Returns an error if the store is at an unknown (future) version or
/// if any step fails.
pub fn upgrade_to_latest(db: &Database) -> Result<i64> {
    let current = db.with_conn(current_version)?;

    if current > LATEST_VERSION {
        return Err(StorageError::UnknownSchemaVersion {
            found: current,
            latest: LATEST_VERSION,
        }
        .into());
    }

    upgrade(db, current, LATEST_VERSION)?;
    Ok(LATEST_VERSION)
}

/// v1: initial layout. Items with inline embedding blob, plus the
/// full-text projection over (title, extracted_text).
fn migrate_to_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_path TEXT NOT NULL,
            title TEXT NOT NULL,
            caption TEXT,
            extracted_text TEXT,
            mime_type TEXT NOT NULL,
            width INTEGER,
            height INTEGER,
            byte_size INTEGER NOT NULL,
            imported_at INTEGER NOT NULL,
            embedding BLOB
        );

        CREATE INDEX idx_items_source_path ON items(source_path);
        CREATE INDEX idx_items_imported_at ON items(imported_at);
        ",
    )
    .map_err(StorageError::from)?;

    fts::create_projection(conn, &["title", "extracted_text"])?;
    fts::rebuild_all(conn)
}

/// v2: usage-tracking columns. Every pre-existing row gets the declared
/// default (0 for the flags and counter, NULL for the timestamp).
fn migrate_to_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        ALTER TABLE items ADD COLUMN favorite INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE items ADD COLUMN view_count INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE items ADD COLUMN last_viewed_at INTEGER;
        ",
    )
    .map_err(StorageError::from)?;
    Ok(())
}

/// v3: source_path becomes unique. Fails (aborting the chain) if the
/// store already holds duplicate paths; nothing is committed in that
/// case.
fn migrate_to_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        DROP INDEX idx_items_source_path;
        CREATE UNIQUE INDEX idx_items_source_path ON items(source_path);
        ",
    )
    .map_err(StorageError::from)?;
    Ok(())
}

/// v4: embeddings move out of the items table. Every non-NULL inline
/// blob (empty included) becomes one embeddings row flagged for
/// regeneration; legacy vectors are never trusted as current. The
/// inline column is dropped afterwards.
fn migrate_to_v4(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE embeddings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            item_id INTEGER NOT NULL REFERENCES items(id) ON DELETE CASCADE,
            purpose TEXT NOT NULL,
            vector BLOB NOT NULL,
            dimension INTEGER NOT NULL,
            model_version TEXT NOT NULL,
            source_hash TEXT,
            generated_at INTEGER NOT NULL,
            needs_regeneration INTEGER NOT NULL DEFAULT 0,
            indexing_attempts INTEGER NOT NULL DEFAULT 0,
            last_attempt_at INTEGER,
            UNIQUE(item_id, purpose)
        );

        CREATE INDEX idx_embeddings_needs_regeneration
            ON embeddings(needs_regeneration);
        ",
    )
    .map_err(StorageError::from)?;

    let backfilled = conn
        .execute(
            "INSERT INTO embeddings (item_id, purpose, vector, dimension, model_version,
                 source_hash, generated_at, needs_regeneration, indexing_attempts,
                 last_attempt_at)
             SELECT id, 'visual', embedding, length(embedding) / 4, 'legacy',
                 NULL, strftime('%s', 'now'), 1, 0, NULL
             FROM items WHERE embedding IS NOT NULL",
            [],
        )
        .map_err(StorageError::from)?;

    conn.execute_batch("ALTER TABLE items DROP COLUMN embedding")
        .map_err(StorageError::from)?;

    tracing::info!(backfilled, "Inline embeddings moved to embeddings table");
    Ok(())
}

/// v5: the full-text projection grows the caption column. Changing the
/// indexed set means drop, recreate, and full rebuild from items.
fn migrate_to_v5(conn: &Connection) -> Result<()> {
    fts::drop_projection(conn)?;
    fts::create_projection(conn, &["title", "caption", "extracted_text"])?;
    fts::rebuild_all(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{schema, Database};

    fn open_at_version(version: i64) -> Database {
        let db = Database::open_in_memory().unwrap();
        upgrade(&db, 0, version).unwrap();
        db
    }

    /// Seed a v1 store with the classic mixed population: NULL vs empty
    /// strings and blobs, one legacy embedding.
    fn seed_v1_items(db: &Database) {
        db.with_transaction(|conn| {
            let legacy_blob: Vec<u8> = [0.5f32, -0.5, 1.0]
                .iter()
                .flat_map(|f| f.to_le_bytes())
                .collect();
            conn.execute(
                "INSERT INTO items (source_path, title, caption, extracted_text, mime_type, \
                 width, height, byte_size, imported_at, embedding)
                 VALUES
                 ('/import/a.png', 'sunset', NULL, 'golden hour', 'image/png', 800, 600, 1000, 1700000001, ?1),
                 ('/import/b.png', 'skyline', '', NULL, 'image/png', 800, 600, 2000, 1700000002, NULL),
                 ('/import/c.gif', 'loop', 'short caption', '', 'image/gif', 100, 100, 3000, 1700000003, NULL),
                 ('/import/d.jpg', 'portrait', NULL, NULL, 'image/jpeg', 400, 400, 4000, 1700000004, NULL),
                 ('/import/e.jpg', 'landscape', 'wide', 'mountains far away', 'image/jpeg', 1200, 300, 5000, 1700000005, NULL)",
                rusqlite::params![legacy_blob],
            )
            .map_err(StorageError::from)?;
            fts::rebuild_all(conn)
        })
        .unwrap();
    }

    #[test]
    fn test_full_chain_on_empty_store() {
        let db = Database::open_in_memory().unwrap();
        let version = upgrade_to_latest(&db).unwrap();
        assert_eq!(version, LATEST_VERSION);

        db.with_conn(|conn| {
            schema::verify_schema(conn, LATEST_VERSION)?;
            let items: i64 = conn
                .query_row("SELECT COUNT(*) FROM items", [], |r| r.get(0))
                .map_err(StorageError::from)?;
            let embeddings: i64 = conn
                .query_row("SELECT COUNT(*) FROM embeddings", [], |r| r.get(0))
                .map_err(StorageError::from)?;
            assert_eq!(items, 0);
            assert_eq!(embeddings, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_upgrade_standalone_on_fresh_store() {
        // No prior version read; upgrade must self-provision its
        // bookkeeping table.
        let db = Database::open_in_memory().unwrap();
        upgrade(&db, 0, 1).unwrap();
        assert_eq!(db.with_conn(current_version).unwrap(), 1);
    }

    #[test]
    fn test_upgrade_same_version_is_noop() {
        let db = open_at_version(LATEST_VERSION);
        upgrade(&db, LATEST_VERSION, LATEST_VERSION).unwrap();
        assert_eq!(db.with_conn(current_version).unwrap(), LATEST_VERSION);
    }

    #[test]
    fn test_upgrade_to_latest_idempotent() {
        let db = Database::open_in_memory().unwrap();
        upgrade_to_latest(&db).unwrap();
        upgrade_to_latest(&db).unwrap();
        assert_eq!(db.with_conn(current_version).unwrap(), LATEST_VERSION);
    }

    #[test]
    fn test_future_version_is_fatal() {
        let db = open_at_version(LATEST_VERSION);
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?, 0)",
                [LATEST_VERSION + 3],
            )
            .map_err(StorageError::from)?;
            Ok(())
        })
        .unwrap();

        let err = upgrade_to_latest(&db).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Storage(StorageError::UnknownSchemaVersion { found, .. })
                if found == LATEST_VERSION + 3
        ));
    }

    #[test]
    fn test_missing_step_is_fatal() {
        let err = resolve_chain(0, LATEST_VERSION + 1).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Storage(StorageError::MissingMigrationStep { from })
                if from == LATEST_VERSION
        ));
    }

    #[test]
    fn test_registry_covers_every_gap_exactly_once() {
        let registry = steps();
        assert_eq!(registry.len() as i64, LATEST_VERSION);
        for (i, step) in registry.iter().enumerate() {
            assert_eq!(step.from_version, i as i64);
            assert_eq!(step.to_version, step.from_version + 1);
        }
    }

    #[test]
    fn test_chain_preserves_rows_and_untouched_columns() {
        let db = open_at_version(1);
        seed_v1_items(&db);

        upgrade_to_latest(&db).unwrap();

        db.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM items", [], |r| r.get(0))
                .map_err(StorageError::from)?;
            assert_eq!(count, 5);

            // Untouched columns keep exact prior values, including the
            // NULL vs empty-string distinction.
            let (caption_b, text_b): (Option<String>, Option<String>) = conn
                .query_row(
                    "SELECT caption, extracted_text FROM items WHERE source_path = '/import/b.png'",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .map_err(StorageError::from)?;
            assert_eq!(caption_b, Some(String::new()));
            assert_eq!(text_b, None);

            let (title_a, width_a, imported_a): (String, i64, i64) = conn
                .query_row(
                    "SELECT title, width, imported_at FROM items WHERE source_path = '/import/a.png'",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .map_err(StorageError::from)?;
            assert_eq!(title_a, "sunset");
            assert_eq!(width_a, 800);
            assert_eq!(imported_a, 1_700_000_001);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_added_columns_get_declared_defaults() {
        let db = open_at_version(1);
        seed_v1_items(&db);

        upgrade_to_latest(&db).unwrap();

        db.with_conn(|conn| {
            let defaulted: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM items
                     WHERE favorite = 0 AND view_count = 0 AND last_viewed_at IS NULL",
                    [],
                    |r| r.get(0),
                )
                .map_err(StorageError::from)?;
            assert_eq!(defaulted, 5);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_legacy_blob_backfilled_as_regeneration_needed() {
        let db = open_at_version(1);
        seed_v1_items(&db);

        upgrade_to_latest(&db).unwrap();

        db.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM embeddings", [], |r| r.get(0))
                .map_err(StorageError::from)?;
            assert_eq!(count, 1);

            let (purpose, payload, dimension, model, needs_regen, attempts): (
                String,
                Vec<u8>,
                i64,
                String,
                i64,
                i64,
            ) = conn
                .query_row(
                    "SELECT e.purpose, e.vector, e.dimension, e.model_version, \
                     e.needs_regeneration, e.indexing_attempts
                     FROM embeddings e JOIN items i ON i.id = e.item_id
                     WHERE i.source_path = '/import/a.png'",
                    [],
                    |r| {
                        Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
                    },
                )
                .map_err(StorageError::from)?;
            assert_eq!(purpose, "visual");
            let expected: Vec<u8> = [0.5f32, -0.5, 1.0]
                .iter()
                .flat_map(|f| f.to_le_bytes())
                .collect();
            assert_eq!(payload, expected);
            assert_eq!(dimension, 3);
            assert_eq!(model, "legacy");
            assert_eq!(needs_regen, 1);
            assert_eq!(attempts, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_empty_blob_backfilled_with_zero_dimension() {
        let db = open_at_version(1);
        db.with_transaction(|conn| {
            conn.execute(
                "INSERT INTO items (source_path, title, mime_type, byte_size, imported_at, \
                 embedding)
                 VALUES ('/import/z.png', 'zero', 'image/png', 10, 1700000000, x'')",
                [],
            )
            .map_err(StorageError::from)?;
            fts::rebuild_all(conn)
        })
        .unwrap();

        upgrade_to_latest(&db).unwrap();

        db.with_conn(|conn| {
            let (dimension, needs_regen): (i64, i64) = conn
                .query_row(
                    "SELECT dimension, needs_regeneration FROM embeddings",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .map_err(StorageError::from)?;
            assert_eq!(dimension, 0);
            assert_eq!(needs_regen, 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_unique_path_enforced_after_v3() {
        let db = open_at_version(1);
        seed_v1_items(&db);
        upgrade_to_latest(&db).unwrap();

        let result = db.with_transaction(|conn| {
            conn.execute(
                "INSERT INTO items (source_path, title, mime_type, byte_size, imported_at)
                 VALUES ('/import/a.png', 'dupe', 'image/png', 1, 1700000000)",
                [],
            )
            .map_err(StorageError::from)?;
            Ok(())
        });
        assert!(result.is_err());

        let count: i64 = db
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM items", [], |r| r.get(0))
                    .map_err(|e| StorageError::from(e).into())
            })
            .unwrap();
        assert_eq!(count, 5);
    }

    #[test]
    fn test_v3_aborts_on_preexisting_duplicates() {
        let db = open_at_version(2);
        db.with_transaction(|conn| {
            conn.execute_batch(
                "INSERT INTO items (source_path, title, mime_type, byte_size, imported_at)
                 VALUES ('/same/path.png', 'one', 'image/png', 1, 1700000000),
                        ('/same/path.png', 'two', 'image/png', 2, 1700000001)",
            )
            .map_err(StorageError::from)?;
            fts::rebuild_all(conn)
        })
        .unwrap();

        let err = upgrade(&db, 2, 3).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Storage(StorageError::MigrationAborted { version: 3, .. })
        ));

        // Nothing committed: still at v2, both rows intact.
        assert_eq!(db.with_conn(current_version).unwrap(), 2);
        let count: i64 = db
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM items", [], |r| r.get(0))
                    .map_err(|e| StorageError::from(e).into())
            })
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_fts_queryable_after_full_chain() {
        let db = open_at_version(1);
        seed_v1_items(&db);
        upgrade_to_latest(&db).unwrap();

        db.with_conn(|conn| {
            // Column present since v1 still indexed.
            assert_eq!(fts::search_text(conn, "sunset", 10)?.len(), 1);
            // Caption only became indexed at v5.
            assert_eq!(fts::search_text(conn, "wide", 10)?.len(), 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_cascade_delete_removes_embeddings() {
        let db = open_at_version(1);
        seed_v1_items(&db);
        upgrade_to_latest(&db).unwrap();

        db.with_transaction(|conn| {
            conn.execute("DELETE FROM items WHERE source_path = '/import/a.png'", [])
                .map_err(StorageError::from)?;
            Ok(())
        })
        .unwrap();

        let count: i64 = db
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM embeddings", [], |r| r.get(0))
                    .map_err(|e| StorageError::from(e).into())
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_schema_verified_at_every_version() {
        for version in 1..=LATEST_VERSION {
            let db = open_at_version(version);
            db.with_conn(|conn| schema::verify_schema(conn, version))
                .unwrap_or_else(|e| panic!("verification failed at v{version}: {e}"));
        }
    }
}
