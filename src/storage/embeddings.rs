//! Embedding persistence: at most one vector per (item, purpose).
//!
//! Rows track staleness (`needs_regeneration`) and retry state
//! (`indexing_attempts`, `last_attempt_at`). A stale row is never
//! deleted; it keeps serving the last-known vector until regeneration
//! succeeds. Rows disappear only by cascade with their item.
//!
//! Vector payloads are little-endian `f32`, `dimension * 4` bytes; the
//! dimension is stored alongside and checked on every decode.

use rusqlite::{Connection, Row};

use super::models::{now_unix, EmbeddingPurpose, EmbeddingRow};
use crate::error::StorageError;
use crate::Result;

/// Encode a vector into its stored payload.
#[must_use]
pub fn encode_vector(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Decode a stored payload, checking it against its declared dimension.
///
/// # Errors
///
/// Returns `CorruptVector` if `payload.len() != dimension * 4`.
pub fn decode_vector(payload: &[u8], dimension: usize) -> Result<Vec<f32>> {
    if payload.len() != dimension * 4 {
        return Err(StorageError::CorruptVector(format!(
            "payload is {} bytes, dimension {dimension} requires {}",
            payload.len(),
            dimension * 4
        ))
        .into());
    }

    Ok(payload
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

const EMBEDDING_COLUMNS: &str = "id, item_id, purpose, vector, dimension, model_version, \
                                 source_hash, generated_at, needs_regeneration, \
                                 indexing_attempts, last_attempt_at";

fn embedding_from_row(row: &Row<'_>) -> Result<EmbeddingRow> {
    let purpose_str: String = row.get(2).map_err(StorageError::from)?;
    let purpose = EmbeddingPurpose::parse(&purpose_str).ok_or_else(|| {
        StorageError::Database(format!("unknown embedding purpose '{purpose_str}'"))
    })?;
    let payload: Vec<u8> = row.get(3).map_err(StorageError::from)?;
    let dimension: i64 = row.get(4).map_err(StorageError::from)?;
    let dimension = usize::try_from(dimension)
        .map_err(|_| StorageError::CorruptVector(format!("negative dimension {dimension}")))?;
    let vector = decode_vector(&payload, dimension)?;

    Ok(EmbeddingRow {
        id: row.get(0).map_err(StorageError::from)?,
        item_id: row.get(1).map_err(StorageError::from)?,
        purpose,
        vector,
        dimension,
        model_version: row.get(5).map_err(StorageError::from)?,
        source_hash: row.get(6).map_err(StorageError::from)?,
        generated_at: row.get(7).map_err(StorageError::from)?,
        needs_regeneration: row.get::<_, i64>(8).map_err(StorageError::from)? != 0,
        indexing_attempts: row.get(9).map_err(StorageError::from)?,
        last_attempt_at: row.get(10).map_err(StorageError::from)?,
    })
}

/// Get the embedding for (item, purpose), if one exists.
///
/// # Errors
///
/// Returns an error if the query fails or the payload is corrupt.
pub fn get_embedding(
    conn: &Connection,
    item_id: i64,
    purpose: EmbeddingPurpose,
) -> Result<Option<EmbeddingRow>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {EMBEDDING_COLUMNS} FROM embeddings WHERE item_id = ? AND purpose = ?"
        ))
        .map_err(StorageError::from)?;

    let mut rows = stmt
        .query(rusqlite::params![item_id, purpose.as_str()])
        .map_err(StorageError::from)?;

    match rows.next().map_err(StorageError::from)? {
        Some(row) => Ok(Some(embedding_from_row(row)?)),
        None => Ok(None),
    }
}

/// Store a freshly generated vector for (item, purpose).
///
/// Upserts exactly one row per key: clears `needs_regeneration`, resets
/// the attempt counter, and stamps hash, model version, and time.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn upsert_embedding(
    conn: &Connection,
    item_id: i64,
    purpose: EmbeddingPurpose,
    vector: &[f32],
    model_version: &str,
    source_hash: Option<&str>,
) -> Result<()> {
    let payload = encode_vector(vector);

    conn.execute(
        "INSERT INTO embeddings (item_id, purpose, vector, dimension, model_version, \
         source_hash, generated_at, needs_regeneration, indexing_attempts, last_attempt_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0, NULL)
         ON CONFLICT(item_id, purpose) DO UPDATE SET
             vector = excluded.vector,
             dimension = excluded.dimension,
             model_version = excluded.model_version,
             source_hash = excluded.source_hash,
             generated_at = excluded.generated_at,
             needs_regeneration = 0,
             indexing_attempts = 0,
             last_attempt_at = NULL",
        rusqlite::params![
            item_id,
            purpose.as_str(),
            payload,
            i64::try_from(vector.len()).unwrap_or(i64::MAX),
            model_version,
            source_hash,
            now_unix(),
        ],
    )
    .map_err(StorageError::from)?;

    tracing::debug!(item_id, %purpose, dim = vector.len(), "Embedding stored");
    Ok(())
}

/// Flag one (item, purpose) vector as out of date. The vector itself is
/// kept; search can keep using it until regeneration succeeds.
///
/// No-op if the key has no embedding row yet.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn mark_stale(conn: &Connection, item_id: i64, purpose: EmbeddingPurpose) -> Result<()> {
    conn.execute(
        "UPDATE embeddings SET needs_regeneration = 1 WHERE item_id = ? AND purpose = ?",
        rusqlite::params![item_id, purpose.as_str()],
    )
    .map_err(StorageError::from)?;
    Ok(())
}

/// Flag every vector of an item as out of date. Called when the item's
/// content changes.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn mark_item_stale(conn: &Connection, item_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE embeddings SET needs_regeneration = 1 WHERE item_id = ?",
        [item_id],
    )
    .map_err(StorageError::from)?;
    Ok(())
}

/// Flag every vector not produced by the active model version. Called
/// once when the configured model changes.
///
/// Returns the number of rows flagged.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn mark_model_stale(conn: &Connection, active_model_version: &str) -> Result<usize> {
    let flagged = conn
        .execute(
            "UPDATE embeddings SET needs_regeneration = 1
             WHERE model_version != ? AND needs_regeneration = 0",
            [active_model_version],
        )
        .map_err(StorageError::from)?;

    if flagged > 0 {
        tracing::info!(flagged, model = active_model_version, "Stale model vectors flagged");
    }
    Ok(flagged)
}

/// Record a failed generation attempt for (item, purpose).
///
/// Increments the attempt counter and stamps the time; the stale flag
/// stays set and any existing vector is untouched. If the key has no row
/// yet, an empty-payload row is created so the retry state is visible;
/// a zero-length payload is the stored form of "no usable vector yet".
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn record_failed_attempt(
    conn: &Connection,
    item_id: i64,
    purpose: EmbeddingPurpose,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO embeddings (item_id, purpose, vector, dimension, model_version, \
         source_hash, generated_at, needs_regeneration, indexing_attempts, last_attempt_at)
         VALUES (?1, ?2, x'', 0, '', NULL, ?3, 1, 1, ?3)
         ON CONFLICT(item_id, purpose) DO UPDATE SET
             needs_regeneration = 1,
             indexing_attempts = indexing_attempts + 1,
             last_attempt_at = excluded.last_attempt_at",
        rusqlite::params![item_id, purpose.as_str(), now_unix()],
    )
    .map_err(StorageError::from)?;

    conn.query_row(
        "SELECT indexing_attempts FROM embeddings WHERE item_id = ? AND purpose = ?",
        rusqlite::params![item_id, purpose.as_str()],
        |row| row.get(0),
    )
    .map_err(|e| StorageError::from(e).into())
}

/// List embeddings flagged for regeneration, oldest attempt first so
/// callers can drive backoff from `indexing_attempts`/`last_attempt_at`.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list_regeneration_pending(conn: &Connection, limit: usize) -> Result<Vec<EmbeddingRow>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {EMBEDDING_COLUMNS} FROM embeddings
             WHERE needs_regeneration = 1
             ORDER BY COALESCE(last_attempt_at, 0) ASC, id ASC
             LIMIT ?"
        ))
        .map_err(StorageError::from)?;

    let mut out = Vec::new();
    let mut rows = stmt
        .query([i64::try_from(limit).unwrap_or(i64::MAX)])
        .map_err(StorageError::from)?;
    while let Some(row) = rows.next().map_err(StorageError::from)? {
        out.push(embedding_from_row(row)?);
    }

    Ok(out)
}

/// A ranked-search candidate: item id, decoded vector, staleness flag.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub item_id: i64,
    pub vector: Vec<f32>,
    pub needs_regeneration: bool,
}

/// Load every candidate vector for a purpose. Read-only; observes the
/// committed snapshot at query time.
///
/// # Errors
///
/// Returns an error if the query fails or any payload is corrupt.
pub fn load_candidates(conn: &Connection, purpose: EmbeddingPurpose) -> Result<Vec<Candidate>> {
    let mut stmt = conn
        .prepare(
            "SELECT item_id, vector, dimension, needs_regeneration
             FROM embeddings WHERE purpose = ? ORDER BY item_id ASC",
        )
        .map_err(StorageError::from)?;

    let mut out = Vec::new();
    let mut rows = stmt
        .query([purpose.as_str()])
        .map_err(StorageError::from)?;
    while let Some(row) = rows.next().map_err(StorageError::from)? {
        let item_id: i64 = row.get(0).map_err(StorageError::from)?;
        let payload: Vec<u8> = row.get(1).map_err(StorageError::from)?;
        let dimension: i64 = row.get(2).map_err(StorageError::from)?;
        let needs_regeneration: i64 = row.get(3).map_err(StorageError::from)?;
        let dimension = usize::try_from(dimension)
            .map_err(|_| StorageError::CorruptVector(format!("negative dimension {dimension}")))?;
        out.push(Candidate {
            item_id,
            vector: decode_vector(&payload, dimension)?,
            needs_regeneration: needs_regeneration != 0,
        });
    }

    Ok(out)
}

/// Count embeddings flagged for regeneration.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn count_regeneration_pending(conn: &Connection) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM embeddings WHERE needs_regeneration = 1",
        [],
        |row| row.get(0),
    )
    .map_err(|e| StorageError::from(e).into())
}
