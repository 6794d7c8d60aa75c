//! Item CRUD operations.
//!
//! Every write that touches an indexed text column calls the full-text
//! hooks from [`super::fts`] inside the same transaction, and every text
//! change marks the item's embeddings stale. Callers are expected to run
//! these functions through `Database::with_transaction`.

use rusqlite::{Connection, Row};

use super::models::{now_unix, ItemRecord};
use super::{embeddings, fts};
use crate::error::StorageError;
use crate::Result;

const ITEM_COLUMNS: &str = "id, source_path, title, caption, extracted_text, mime_type, \
                            width, height, byte_size, imported_at, favorite, view_count, \
                            last_viewed_at";

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<ItemRecord> {
    Ok(ItemRecord {
        id: Some(row.get(0)?),
        source_path: row.get(1)?,
        title: row.get(2)?,
        caption: row.get(3)?,
        extracted_text: row.get(4)?,
        mime_type: row.get(5)?,
        width: row.get(6)?,
        height: row.get(7)?,
        byte_size: row.get(8)?,
        imported_at: row.get(9)?,
        favorite: row.get::<_, i64>(10)? != 0,
        view_count: row.get(11)?,
        last_viewed_at: row.get(12)?,
    })
}

fn map_insert_error(e: &rusqlite::Error, path: &str) -> StorageError {
    if let rusqlite::Error::SqliteFailure(code, _) = e {
        if code.code == rusqlite::ErrorCode::ConstraintViolation {
            return StorageError::DuplicatePath(path.to_string());
        }
    }
    StorageError::Database(e.to_string())
}

/// Insert an item and index it into the full-text projection.
///
/// Returns the assigned id.
///
/// # Errors
///
/// Returns `DuplicatePath` if an item with the same source path exists;
/// the transaction rollback guarantees nothing was mutated.
pub fn insert_item(conn: &Connection, item: &ItemRecord) -> Result<i64> {
    conn.execute(
        "INSERT INTO items (source_path, title, caption, extracted_text, mime_type, width, \
         height, byte_size, imported_at, favorite, view_count, last_viewed_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            item.source_path,
            item.title,
            item.caption,
            item.extracted_text,
            item.mime_type,
            item.width,
            item.height,
            item.byte_size,
            item.imported_at,
            i64::from(item.favorite),
            item.view_count,
            item.last_viewed_at,
        ],
    )
    .map_err(|e| map_insert_error(&e, &item.source_path))?;

    let id = conn.last_insert_rowid();
    fts::index_item(conn, id)?;

    tracing::debug!(id, path = %item.source_path, "Item inserted");
    Ok(id)
}

/// Update an item's text columns, re-projecting it and marking its
/// embeddings stale in the same transaction.
///
/// # Errors
///
/// Returns `NotFound` if the item does not exist.
pub fn update_item_text(
    conn: &Connection,
    id: i64,
    title: &str,
    caption: Option<&str>,
    extracted_text: Option<&str>,
) -> Result<()> {
    let updated = conn
        .execute(
            "UPDATE items SET title = ?, caption = ?, extracted_text = ? WHERE id = ?",
            rusqlite::params![title, caption, extracted_text, id],
        )
        .map_err(StorageError::from)?;

    if updated == 0 {
        return Err(StorageError::not_found("item", id.to_string()).into());
    }

    fts::reindex_item(conn, id)?;
    embeddings::mark_item_stale(conn, id)?;
    Ok(())
}

/// Delete an item. Its projection row goes in the same transaction and
/// its embeddings go by foreign-key cascade.
///
/// # Errors
///
/// Returns `NotFound` if the item does not exist.
pub fn delete_item(conn: &Connection, id: i64) -> Result<()> {
    fts::deindex_item(conn, id)?;

    let deleted = conn
        .execute("DELETE FROM items WHERE id = ?", [id])
        .map_err(StorageError::from)?;

    if deleted == 0 {
        return Err(StorageError::not_found("item", id.to_string()).into());
    }

    tracing::debug!(id, "Item deleted");
    Ok(())
}

/// Get an item by id.
///
/// # Errors
///
/// Returns `NotFound` if no such item exists.
pub fn get_item(conn: &Connection, id: i64) -> Result<ItemRecord> {
    conn.query_row(
        &format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?"),
        [id],
        |row| item_from_row(row),
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => {
            StorageError::not_found("item", id.to_string()).into()
        }
        other => StorageError::from(other).into(),
    })
}

/// Get an item by its source path.
///
/// # Errors
///
/// Returns `NotFound` if no such item exists.
pub fn get_item_by_path(conn: &Connection, path: &str) -> Result<ItemRecord> {
    conn.query_row(
        &format!("SELECT {ITEM_COLUMNS} FROM items WHERE source_path = ?"),
        [path],
        |row| item_from_row(row),
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => StorageError::not_found("item", path).into(),
        other => StorageError::from(other).into(),
    })
}

/// List items, newest import first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list_items(conn: &Connection, limit: usize) -> Result<Vec<ItemRecord>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM items ORDER BY imported_at DESC, id DESC LIMIT ?"
        ))
        .map_err(StorageError::from)?;

    let items = stmt
        .query_map([i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
            item_from_row(row)
        })
        .map_err(StorageError::from)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(StorageError::from)?;

    Ok(items)
}

/// Count all items.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn count_items(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))
        .map_err(|e| StorageError::from(e).into())
}

/// Record a view: bump the counter and stamp the time.
///
/// # Errors
///
/// Returns `NotFound` if the item does not exist.
pub fn record_view(conn: &Connection, id: i64) -> Result<()> {
    let updated = conn
        .execute(
            "UPDATE items SET view_count = view_count + 1, last_viewed_at = ? WHERE id = ?",
            rusqlite::params![now_unix(), id],
        )
        .map_err(StorageError::from)?;

    if updated == 0 {
        return Err(StorageError::not_found("item", id.to_string()).into());
    }
    Ok(())
}

/// Set or clear the favorite flag.
///
/// # Errors
///
/// Returns `NotFound` if the item does not exist.
pub fn set_favorite(conn: &Connection, id: i64, favorite: bool) -> Result<()> {
    let updated = conn
        .execute(
            "UPDATE items SET favorite = ? WHERE id = ?",
            rusqlite::params![i64::from(favorite), id],
        )
        .map_err(StorageError::from)?;

    if updated == 0 {
        return Err(StorageError::not_found("item", id.to_string()).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{migrations, Database};

    fn setup_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        migrations::upgrade_to_latest(&db).unwrap();
        db
    }

    fn sample_item(path: &str) -> ItemRecord {
        ItemRecord::new(path, "beach sunset", "image/png", 1024)
            .with_caption("evening walk")
            .with_extracted_text("golden hour light")
    }

    #[test]
    fn test_insert_and_get() {
        let db = setup_db();
        let id = db
            .with_transaction(|conn| insert_item(conn, &sample_item("/import/a.png")))
            .unwrap();

        let item = db.with_conn(|conn| get_item(conn, id)).unwrap();
        assert_eq!(item.source_path, "/import/a.png");
        assert_eq!(item.title, "beach sunset");
        assert_eq!(item.caption.as_deref(), Some("evening walk"));
    }

    #[test]
    fn test_insert_duplicate_path_fails_without_mutation() {
        let db = setup_db();
        db.with_transaction(|conn| insert_item(conn, &sample_item("/import/a.png")))
            .unwrap();

        let err = db
            .with_transaction(|conn| insert_item(conn, &sample_item("/import/a.png")))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Storage(StorageError::DuplicatePath(ref p)) if p == "/import/a.png"
        ));

        assert_eq!(db.with_conn(count_items).unwrap(), 1);
    }

    #[test]
    fn test_insert_is_searchable() {
        let db = setup_db();
        let id = db
            .with_transaction(|conn| insert_item(conn, &sample_item("/import/a.png")))
            .unwrap();

        db.with_conn(|conn| {
            assert_eq!(fts::search_text(conn, "sunset", 10)?, vec![id]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_update_text_reprojects_and_marks_stale() {
        let db = setup_db();
        let id = db
            .with_transaction(|conn| {
                let id = insert_item(conn, &sample_item("/import/a.png"))?;
                embeddings::upsert_embedding(
                    conn,
                    id,
                    crate::storage::EmbeddingPurpose::Textual,
                    &[1.0, 0.0],
                    "model-v1",
                    Some("hash"),
                )?;
                Ok(id)
            })
            .unwrap();

        db.with_transaction(|conn| {
            update_item_text(conn, id, "city skyline", None, Some("neon signs"))
        })
        .unwrap();

        db.with_conn(|conn| {
            assert!(fts::search_text(conn, "sunset", 10)?.is_empty());
            assert_eq!(fts::search_text(conn, "skyline", 10)?, vec![id]);

            let row = embeddings::get_embedding(
                conn,
                id,
                crate::storage::EmbeddingPurpose::Textual,
            )?
            .unwrap();
            assert!(row.needs_regeneration);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_delete_removes_item_and_projection() {
        let db = setup_db();
        let id = db
            .with_transaction(|conn| insert_item(conn, &sample_item("/import/a.png")))
            .unwrap();

        db.with_transaction(|conn| delete_item(conn, id)).unwrap();

        db.with_conn(|conn| {
            assert!(get_item(conn, id).is_err());
            assert!(fts::search_text(conn, "sunset", 10)?.is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_delete_missing_item() {
        let db = setup_db();
        let err = db.with_transaction(|conn| delete_item(conn, 404)).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Storage(StorageError::NotFound { .. })
        ));
    }

    #[test]
    fn test_list_items_newest_first() {
        let db = setup_db();
        db.with_transaction(|conn| {
            let mut older = sample_item("/import/old.png");
            older.imported_at = 1_700_000_000;
            insert_item(conn, &older)?;

            let mut newer = sample_item("/import/new.png");
            newer.imported_at = 1_700_000_100;
            insert_item(conn, &newer)?;
            Ok(())
        })
        .unwrap();

        let items = db.with_conn(|conn| list_items(conn, 10)).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].source_path, "/import/new.png");
    }

    #[test]
    fn test_record_view_and_favorite() {
        let db = setup_db();
        let id = db
            .with_transaction(|conn| insert_item(conn, &sample_item("/import/a.png")))
            .unwrap();

        db.with_transaction(|conn| {
            record_view(conn, id)?;
            record_view(conn, id)?;
            set_favorite(conn, id, true)
        })
        .unwrap();

        let item = db.with_conn(|conn| get_item(conn, id)).unwrap();
        assert_eq!(item.view_count, 2);
        assert!(item.last_viewed_at.is_some());
        assert!(item.favorite);
    }

    #[test]
    fn test_get_item_by_path() {
        let db = setup_db();
        db.with_transaction(|conn| insert_item(conn, &sample_item("/import/a.png")))
            .unwrap();

        let item = db
            .with_conn(|conn| get_item_by_path(conn, "/import/a.png"))
            .unwrap();
        assert_eq!(item.title, "beach sunset");

        assert!(db
            .with_conn(|conn| get_item_by_path(conn, "/missing.png"))
            .is_err());
    }
}
