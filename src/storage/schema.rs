//! Declarative schema snapshots and live-structure verification.
//!
//! Every schema version has one declarative description of the tables,
//! columns, indexes, and foreign keys it is supposed to contain. After a
//! migration chain runs, [`verify_schema`] checks the live database
//! structure against the snapshot for the target version via the sqlite
//! pragmas, catching a migration that committed but produced the wrong
//! shape.

use rusqlite::Connection;
use std::collections::HashMap;

use crate::error::StorageError;
use crate::storage::migrations::LATEST_VERSION;
use crate::Result;

/// Declared column: name, affinity as written in the DDL, NOT NULL flag.
#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub ty: &'static str,
    pub not_null: bool,
}

/// Declared named index.
#[derive(Debug, Clone)]
pub struct IndexSpec {
    pub name: &'static str,
    pub columns: Vec<&'static str>,
    pub unique: bool,
}

/// Declared foreign key with its ON DELETE action.
#[derive(Debug, Clone)]
pub struct ForeignKeySpec {
    pub column: &'static str,
    pub references_table: &'static str,
    pub references_column: &'static str,
    pub on_delete: &'static str,
}

/// Declared table.
#[derive(Debug, Clone)]
pub struct TableSpec {
    pub name: &'static str,
    pub columns: Vec<ColumnSpec>,
    pub indexes: Vec<IndexSpec>,
    /// Column sets that must be covered by a unique index, however the
    /// index was created (named or table-constraint autoindex).
    pub unique_sets: Vec<Vec<&'static str>>,
    pub foreign_keys: Vec<ForeignKeySpec>,
}

/// Declared schema for one version: regular tables plus the column set
/// of the full-text projection.
#[derive(Debug, Clone)]
pub struct SchemaSnapshot {
    pub version: i64,
    pub tables: Vec<TableSpec>,
    pub fts_columns: Vec<&'static str>,
}

fn col(name: &'static str, ty: &'static str, not_null: bool) -> ColumnSpec {
    ColumnSpec { name, ty, not_null }
}

/// Build the declarative snapshot for a schema version.
///
/// Returns `None` for version 0 (a fresh store has no declared layout)
/// and for versions newer than [`LATEST_VERSION`].
#[must_use]
pub fn snapshot(version: i64) -> Option<SchemaSnapshot> {
    if !(1..=LATEST_VERSION).contains(&version) {
        return None;
    }

    let mut items_columns = vec![
        // `id` is a rowid alias; sqlite reports it without NOT NULL.
        col("id", "INTEGER", false),
        col("source_path", "TEXT", true),
        col("title", "TEXT", true),
        col("caption", "TEXT", false),
        col("extracted_text", "TEXT", false),
        col("mime_type", "TEXT", true),
        col("width", "INTEGER", false),
        col("height", "INTEGER", false),
        col("byte_size", "INTEGER", true),
        col("imported_at", "INTEGER", true),
    ];
    if version < 4 {
        items_columns.push(col("embedding", "BLOB", false));
    }
    if version >= 2 {
        items_columns.push(col("favorite", "INTEGER", true));
        items_columns.push(col("view_count", "INTEGER", true));
        items_columns.push(col("last_viewed_at", "INTEGER", false));
    }

    let items = TableSpec {
        name: "items",
        columns: items_columns,
        indexes: vec![
            IndexSpec {
                name: "idx_items_source_path",
                columns: vec!["source_path"],
                unique: version >= 3,
            },
            IndexSpec {
                name: "idx_items_imported_at",
                columns: vec!["imported_at"],
                unique: false,
            },
        ],
        unique_sets: if version >= 3 {
            vec![vec!["source_path"]]
        } else {
            Vec::new()
        },
        foreign_keys: Vec::new(),
    };

    let mut tables = vec![items];

    if version >= 4 {
        tables.push(TableSpec {
            name: "embeddings",
            columns: vec![
                col("id", "INTEGER", false),
                col("item_id", "INTEGER", true),
                col("purpose", "TEXT", true),
                col("vector", "BLOB", true),
                col("dimension", "INTEGER", true),
                col("model_version", "TEXT", true),
                col("source_hash", "TEXT", false),
                col("generated_at", "INTEGER", true),
                col("needs_regeneration", "INTEGER", true),
                col("indexing_attempts", "INTEGER", true),
                col("last_attempt_at", "INTEGER", false),
            ],
            indexes: vec![IndexSpec {
                name: "idx_embeddings_needs_regeneration",
                columns: vec!["needs_regeneration"],
                unique: false,
            }],
            unique_sets: vec![vec!["item_id", "purpose"]],
            foreign_keys: vec![ForeignKeySpec {
                column: "item_id",
                references_table: "items",
                references_column: "id",
                on_delete: "CASCADE",
            }],
        });
    }

    let fts_columns = if version >= 5 {
        vec!["title", "caption", "extracted_text"]
    } else {
        vec!["title", "extracted_text"]
    };

    Some(SchemaSnapshot {
        version,
        tables,
        fts_columns,
    })
}

/// Verify that the live database structure matches the snapshot for the
/// given version.
///
/// Checks, per declared table: column set with affinities and NOT NULL
/// flags, named indexes with columns and uniqueness, declared unique
/// column sets, and foreign-key target/columns/on-delete action. The
/// full-text projection is checked for its declared column set.
///
/// # Errors
///
/// Returns `SchemaMismatch` describing the first divergence found.
pub fn verify_schema(conn: &Connection, version: i64) -> Result<()> {
    let snapshot = snapshot(version).ok_or(StorageError::UnknownSchemaVersion {
        found: version,
        latest: LATEST_VERSION,
    })?;

    for table in &snapshot.tables {
        verify_columns(conn, table)?;
        verify_indexes(conn, table)?;
        verify_foreign_keys(conn, table)?;
    }

    verify_fts(conn, &snapshot.fts_columns)?;

    tracing::debug!(version, "Schema verification passed");
    Ok(())
}

fn mismatch(msg: String) -> crate::Error {
    StorageError::SchemaMismatch(msg).into()
}

fn verify_columns(conn: &Connection, table: &TableSpec) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", table.name))
        .map_err(StorageError::from)?;

    // name -> (declared type, notnull)
    let live: HashMap<String, (String, bool)> = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(1)?,
                (row.get::<_, String>(2)?, row.get::<_, i64>(3)? != 0),
            ))
        })
        .map_err(StorageError::from)?
        .collect::<std::result::Result<_, _>>()
        .map_err(StorageError::from)?;

    if live.is_empty() {
        return Err(mismatch(format!("table '{}' not found", table.name)));
    }

    if live.len() != table.columns.len() {
        return Err(mismatch(format!(
            "table '{}' has {} columns, expected {}",
            table.name,
            live.len(),
            table.columns.len()
        )));
    }

    for expected in &table.columns {
        let Some((ty, not_null)) = live.get(expected.name) else {
            return Err(mismatch(format!(
                "table '{}' is missing column '{}'",
                table.name, expected.name
            )));
        };
        if !ty.eq_ignore_ascii_case(expected.ty) {
            return Err(mismatch(format!(
                "column '{}.{}' has type {ty}, expected {}",
                table.name, expected.name, expected.ty
            )));
        }
        if *not_null != expected.not_null {
            return Err(mismatch(format!(
                "column '{}.{}' not-null is {not_null}, expected {}",
                table.name, expected.name, expected.not_null
            )));
        }
    }

    Ok(())
}

fn index_columns(conn: &Connection, index_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA index_info({index_name})"))
        .map_err(StorageError::from)?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(2))
        .map_err(StorageError::from)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(StorageError::from)?;
    Ok(columns)
}

fn verify_indexes(conn: &Connection, table: &TableSpec) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA index_list({})", table.name))
        .map_err(StorageError::from)?;

    // name -> (unique, origin)
    let live: HashMap<String, (bool, String)> = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(1)?,
                (row.get::<_, i64>(2)? != 0, row.get::<_, String>(3)?),
            ))
        })
        .map_err(StorageError::from)?
        .collect::<std::result::Result<_, _>>()
        .map_err(StorageError::from)?;

    for expected in &table.indexes {
        let Some((unique, _)) = live.get(expected.name) else {
            return Err(mismatch(format!(
                "index '{}' on '{}' not found",
                expected.name, table.name
            )));
        };
        if *unique != expected.unique {
            return Err(mismatch(format!(
                "index '{}' uniqueness is {unique}, expected {}",
                expected.name, expected.unique
            )));
        }
        let columns = index_columns(conn, expected.name)?;
        if columns != expected.columns {
            return Err(mismatch(format!(
                "index '{}' covers {columns:?}, expected {:?}",
                expected.name, expected.columns
            )));
        }
    }

    // Declared unique sets may be satisfied by any unique index,
    // including sqlite autoindexes from table constraints.
    for set in &table.unique_sets {
        let mut covered = false;
        for (name, (unique, _)) in &live {
            if *unique && index_columns(conn, name)? == *set {
                covered = true;
                break;
            }
        }
        if !covered {
            return Err(mismatch(format!(
                "no unique index covers {set:?} on '{}'",
                table.name
            )));
        }
    }

    Ok(())
}

fn verify_foreign_keys(conn: &Connection, table: &TableSpec) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA foreign_key_list({})", table.name))
        .map_err(StorageError::from)?;

    // (from column) -> (target table, target column, on_delete)
    let live: HashMap<String, (String, String, String)> = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(3)?,
                (
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(6)?,
                ),
            ))
        })
        .map_err(StorageError::from)?
        .collect::<std::result::Result<_, _>>()
        .map_err(StorageError::from)?;

    if live.len() != table.foreign_keys.len() {
        return Err(mismatch(format!(
            "table '{}' has {} foreign keys, expected {}",
            table.name,
            live.len(),
            table.foreign_keys.len()
        )));
    }

    for expected in &table.foreign_keys {
        let Some((target, to, on_delete)) = live.get(expected.column) else {
            return Err(mismatch(format!(
                "no foreign key on '{}.{}'",
                table.name, expected.column
            )));
        };
        if target != expected.references_table
            || to != expected.references_column
            || !on_delete.eq_ignore_ascii_case(expected.on_delete)
        {
            return Err(mismatch(format!(
                "foreign key '{}.{}' is {target}({to}) ON DELETE {on_delete}, \
                 expected {}({}) ON DELETE {}",
                table.name,
                expected.column,
                expected.references_table,
                expected.references_column,
                expected.on_delete
            )));
        }
    }

    Ok(())
}

fn verify_fts(conn: &Connection, expected: &[&str]) -> Result<()> {
    let live = super::fts::projection_columns(conn)?;
    if live != expected {
        return Err(mismatch(format!(
            "full-text projection indexes {live:?}, expected {expected:?}"
        )));
    }
    Ok(())
}
