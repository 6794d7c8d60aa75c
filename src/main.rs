//! Shoebox - local-first media library store.
//!
//! Command-line entry point.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use std::sync::Arc;

use clap::{Parser, Subcommand};
use shoebox::embeddings::{DeterministicProvider, EmbeddingLifecycle};
use shoebox::observability::init_tracing;
use shoebox::search::SearchEngine;
use shoebox::storage::{self, init_storage, Database, EmbeddingPurpose, ItemRecord};
use shoebox::{Config, Error, Result};

/// Shoebox - local-first media library store
#[derive(Parser, Debug)]
#[command(name = "shoebox")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Data directory for the `SQLite` database
    #[arg(short, long, env = "SHOEBOX_DATA_DIR", default_value = "./data")]
    data_dir: std::path::PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "SHOEBOX_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, env = "SHOEBOX_LOG_JSON")]
    log_json: bool,

    /// Active embedding model version
    #[arg(long, env = "SHOEBOX_MODEL_VERSION", default_value = "clip-vit-b32-v1")]
    model_version: String,

    /// Dimension of vectors produced by the active model
    #[arg(long, env = "SHOEBOX_EMBEDDING_DIM", default_value = "512")]
    embedding_dim: usize,

    /// Number of embedding worker threads
    #[arg(long, env = "SHOEBOX_EMBEDDING_THREADS", default_value = "4")]
    embedding_threads: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import a media file into the library and index it
    Import {
        /// Path of the file to import
        path: std::path::PathBuf,

        /// Display title; defaults to the file name
        #[arg(short, long)]
        title: Option<String>,

        /// Caption to store alongside the item
        #[arg(short, long)]
        caption: Option<String>,
    },

    /// Search the library
    Search {
        /// Query text
        query: String,

        /// Use keyword full-text search instead of similarity
        #[arg(short, long)]
        keyword: bool,

        /// Maximum number of results
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// List library items, newest import first
    List {
        /// Maximum number of items
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },

    /// Regenerate embeddings flagged as stale
    Reindex {
        /// Maximum number of embeddings to regenerate
        #[arg(short = 'n', long, default_value = "100")]
        limit: usize,
    },

    /// Show library and index status
    Status,

    /// Run pending schema migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_level, cli.log_json);

    let config = Config {
        data_dir: cli.data_dir,
        log_level: cli.log_level,
        model_version: cli.model_version,
        embedding_dim: cli.embedding_dim,
        embedding_threads: cli.embedding_threads,
        ..Config::default()
    };
    config.validate()?;
    tracing::debug!(?config, "Configuration loaded");

    std::fs::create_dir_all(&config.data_dir)?;
    let db = Database::open(config.database_path())?;
    init_storage(&db)?;

    match cli.command {
        Command::Import {
            path,
            title,
            caption,
        } => import(&db, &config, &path, title, caption).await,
        Command::Search {
            query,
            keyword,
            limit,
            json,
        } => search(&db, &config, &query, keyword, limit, json).await,
        Command::List { limit } => list(&db, limit),
        Command::Reindex { limit } => reindex(&db, &config, limit).await,
        Command::Status => status(&db),
        Command::Migrate => {
            // init_storage already brought the store to the latest
            // version; report it and stop.
            let version = db.with_conn(storage::current_version)?;
            println!("schema version {version}");
            Ok(())
        }
    }
}

async fn import(
    db: &Database,
    config: &Config,
    path: &std::path::Path,
    title: Option<String>,
    caption: Option<String>,
) -> Result<()> {
    let metadata = std::fs::metadata(path)?;
    let title = title.unwrap_or_else(|| {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string())
    });
    let mime_type = guess_mime(path);

    let mut record = ItemRecord::new(
        path.display().to_string(),
        title,
        mime_type,
        i64::try_from(metadata.len()).unwrap_or(i64::MAX),
    );
    if let Some(caption) = caption {
        record = record.with_caption(caption);
    }

    let id = db.with_transaction(|conn| storage::insert_item(conn, &record))?;
    tracing::info!(id, path = %path.display(), "Item imported");

    let lifecycle = EmbeddingLifecycle::new(
        db.clone(),
        Arc::new(DeterministicProvider::new(config.embedding_dim)),
        config.model_version.clone(),
        config.embedding_threads,
    )?;
    let outcome = lifecycle
        .ensure_embedding(id, EmbeddingPurpose::Textual)
        .await?;
    tracing::info!(id, ?outcome, "Embedding ensured");

    println!("imported item {id}");
    Ok(())
}

async fn search(
    db: &Database,
    config: &Config,
    query: &str,
    keyword: bool,
    limit: usize,
    json: bool,
) -> Result<()> {
    let engine = SearchEngine::new(
        db.clone(),
        Arc::new(DeterministicProvider::new(config.embedding_dim)),
        config,
    )?;

    if keyword {
        let items = engine.search_keyword(query, limit)?;
        if json {
            println!(
                "{}",
                serde_json::to_string_pretty(&items).map_err(|e| Error::internal(e.to_string()))?
            );
            return Ok(());
        }
        for item in items {
            println!("{}\t{}", item.id.unwrap_or_default(), item.title);
        }
        return Ok(());
    }

    let results = engine
        .search_similar(query, EmbeddingPurpose::Textual, Some(limit))
        .await?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&results).map_err(|e| Error::internal(e.to_string()))?
        );
        return Ok(());
    }
    for hit in &results.hits {
        let stale = if hit.regeneration_needed { " (stale)" } else { "" };
        println!(
            "{:.4}\t{}\t{}{stale}",
            hit.score,
            hit.item.id.unwrap_or_default(),
            hit.item.title
        );
    }
    if !results.mismatched.is_empty() {
        eprintln!(
            "{} stored vector(s) skipped: dimension mismatch, regeneration needed",
            results.mismatched.len()
        );
    }
    Ok(())
}

fn list(db: &Database, limit: usize) -> Result<()> {
    let items = db.with_conn(|conn| storage::list_items(conn, limit))?;
    for item in items {
        let fav = if item.favorite { "*" } else { " " };
        println!(
            "{}{}\t{}\t{}",
            fav,
            item.id.unwrap_or_default(),
            item.title,
            item.source_path
        );
    }
    Ok(())
}

async fn reindex(db: &Database, config: &Config, limit: usize) -> Result<()> {
    let pending = db.with_conn(|conn| storage::list_regeneration_pending(conn, limit))?;
    if pending.is_empty() {
        println!("nothing to regenerate");
        return Ok(());
    }

    let lifecycle = EmbeddingLifecycle::new(
        db.clone(),
        Arc::new(DeterministicProvider::new(config.embedding_dim)),
        config.model_version.clone(),
        config.embedding_threads,
    )?;

    let mut regenerated = 0usize;
    let mut failed = 0usize;
    for row in pending {
        match lifecycle.ensure_embedding(row.item_id, row.purpose).await {
            Ok(_) => regenerated += 1,
            Err(e) => {
                tracing::warn!(item_id = row.item_id, error = %e, "Regeneration failed");
                failed += 1;
            }
        }
    }

    println!("regenerated {regenerated}, failed {failed}");
    Ok(())
}

fn status(db: &Database) -> Result<()> {
    let version = db.with_conn(storage::current_version)?;
    let items = db.with_conn(storage::count_items)?;
    let pending = db.with_conn(storage::count_regeneration_pending)?;
    db.health_check()?;

    println!("schema version: {version}");
    println!("items: {items}");
    println!("embeddings pending regeneration: {pending}");
    Ok(())
}

fn guess_mime(path: &std::path::Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        _ => "application/octet-stream",
    }
}
