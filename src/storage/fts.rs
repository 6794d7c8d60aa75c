//! Full-text projection of the items table.
//!
//! `items_fts` is an fts5 virtual table carrying a searchable copy of a
//! declared subset of item text columns. It is kept consistent by explicit
//! hook functions called inside the same transaction as every items write;
//! there are no triggers and no out-of-band rebuilds on the normal write
//! path. `rebuild_all` exists for migrations that change the indexed
//! column set.
//!
//! The fts5 rowid is the item id, so hooks and queries never need a
//! mapping table.

use rusqlite::Connection;

use crate::error::StorageError;
use crate::Result;

/// Name of the full-text projection table.
pub const FTS_TABLE: &str = "items_fts";

/// Create the projection table indexing the given item columns.
///
/// Used by migration steps only; replacing the column set means dropping
/// and recreating the table, then calling [`rebuild_all`].
///
/// # Errors
///
/// Returns an error if the table cannot be created.
pub fn create_projection(conn: &Connection, columns: &[&str]) -> Result<()> {
    let sql = format!(
        "CREATE VIRTUAL TABLE {FTS_TABLE} USING fts5({})",
        columns.join(", ")
    );
    conn.execute(&sql, [])
        .map_err(|e| StorageError::Database(format!("failed to create fts table: {e}")))?;

    tracing::debug!(columns = ?columns, "Created full-text projection");
    Ok(())
}

/// Drop the projection table if it exists.
///
/// # Errors
///
/// Returns an error if the drop fails.
pub fn drop_projection(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {FTS_TABLE}"))
        .map_err(|e| StorageError::Database(format!("failed to drop fts table: {e}")).into())
}

/// Read the column set the live projection currently indexes.
///
/// Derived from the virtual table itself so hooks keep working across
/// schema versions that change the indexed columns.
///
/// # Errors
///
/// Returns an error if the projection table does not exist.
pub fn projection_columns(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({FTS_TABLE})"))
        .map_err(StorageError::from)?;

    let columns: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(StorageError::from)?
        .filter_map(std::result::Result::ok)
        .collect();

    if columns.is_empty() {
        return Err(StorageError::Database(format!("{FTS_TABLE} table not found")).into());
    }

    Ok(columns)
}

/// Index one item into the projection.
///
/// Must run in the same transaction as the items insert. Reads the
/// indexed columns straight from the items row; NULL text columns are
/// projected as empty strings.
///
/// # Errors
///
/// Returns an error if the projection write fails.
pub fn index_item(conn: &Connection, item_id: i64) -> Result<()> {
    let columns = projection_columns(conn)?;
    let select: Vec<String> = columns
        .iter()
        .map(|c| format!("COALESCE({c}, '')"))
        .collect();

    let sql = format!(
        "INSERT INTO {FTS_TABLE} (rowid, {}) SELECT id, {} FROM items WHERE id = ?",
        columns.join(", "),
        select.join(", ")
    );

    let inserted = conn
        .execute(&sql, [item_id])
        .map_err(|e| StorageError::Database(format!("failed to index item: {e}")))?;

    if inserted == 0 {
        return Err(StorageError::not_found("item", item_id.to_string()).into());
    }

    Ok(())
}

/// Remove one item from the projection.
///
/// Must run in the same transaction as the items delete.
///
/// # Errors
///
/// Returns an error if the projection write fails.
pub fn deindex_item(conn: &Connection, item_id: i64) -> Result<()> {
    conn.execute(&format!("DELETE FROM {FTS_TABLE} WHERE rowid = ?"), [item_id])
        .map_err(|e| StorageError::Database(format!("failed to deindex item: {e}")))?;
    Ok(())
}

/// Re-project one item after its text columns changed.
///
/// Must run in the same transaction as the items update.
///
/// # Errors
///
/// Returns an error if the projection write fails.
pub fn reindex_item(conn: &Connection, item_id: i64) -> Result<()> {
    deindex_item(conn, item_id)?;
    index_item(conn, item_id)
}

/// Truncate the projection and regenerate it from current items content.
///
/// Used by migration steps that change the indexed column set. Tolerates
/// an empty items table.
///
/// # Errors
///
/// Returns an error if the rebuild fails.
pub fn rebuild_all(conn: &Connection) -> Result<()> {
    let columns = projection_columns(conn)?;
    let select: Vec<String> = columns
        .iter()
        .map(|c| format!("COALESCE({c}, '')"))
        .collect();

    conn.execute_batch(&format!("DELETE FROM {FTS_TABLE}"))
        .map_err(|e| StorageError::Database(format!("failed to truncate fts table: {e}")))?;

    let rows = conn
        .execute(
            &format!(
                "INSERT INTO {FTS_TABLE} (rowid, {}) SELECT id, {} FROM items",
                columns.join(", "),
                select.join(", ")
            ),
            [],
        )
        .map_err(|e| StorageError::Database(format!("failed to rebuild fts table: {e}")))?;

    tracing::info!(rows, columns = ?columns, "Full-text projection rebuilt");
    Ok(())
}

/// Full-text search over the projection.
///
/// Returns matching item ids ranked by bm25 relevance.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn search_text(conn: &Connection, query: &str, limit: usize) -> Result<Vec<i64>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT rowid FROM {FTS_TABLE} WHERE {FTS_TABLE} MATCH ? ORDER BY rank LIMIT ?"
        ))
        .map_err(StorageError::from)?;

    let ids = stmt
        .query_map(
            rusqlite::params![query, i64::try_from(limit).unwrap_or(i64::MAX)],
            |row| row.get::<_, i64>(0),
        )
        .map_err(StorageError::from)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(StorageError::from)?;

    Ok(ids)
}
