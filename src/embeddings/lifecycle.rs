//! Embedding lifecycle: staleness decisions, generation attempts, and
//! per-key serialization.
//!
//! An embedding is up to date when its model version matches the active
//! one and its source-text hash matches the item's current content.
//! Anything else is missing or stale and goes through the provider.
//! Failures are absorbed into persisted retry state (attempt counter,
//! last-attempt timestamp, stale flag); a permanently failing item
//! stays visible and eligible for retry indefinitely.
//!
//! At most one generation attempt per (item, purpose) is in flight at a
//! time; overlapping requests are answered with
//! [`EmbeddingOutcome::InFlight`] instead of racing the counter.

use std::collections::HashSet;
use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use super::provider::{EmbeddingProvider, EmbeddingWorkerPool, ProviderError};
use crate::error::EmbeddingError;
use crate::storage::{self, Database, EmbeddingPurpose};
use crate::Result;

/// Result of an `ensure_embedding` call that did not error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingOutcome {
    /// A current vector already exists; nothing was done.
    UpToDate,
    /// A new vector was generated and stored.
    Generated,
    /// Another attempt for this (item, purpose) is already running;
    /// this request was coalesced into it.
    InFlight,
    /// The scheduler cancelled the attempt. Not counted as a failure.
    Cancelled,
}

/// Snapshot of an item's indexing state, published after every change.
#[derive(Debug, Clone, Serialize)]
pub struct IndexingStatus {
    /// Item this status describes.
    pub item_id: i64,
    /// A usable, current vector exists.
    pub indexed: bool,
    /// A generation attempt is in flight right now.
    pub pending: bool,
    /// At least one stored vector is flagged for regeneration.
    pub regeneration_needed: bool,
    /// Highest attempt count across the item's embeddings.
    pub attempts: i64,
}

/// Hash of the source text an embedding is generated from.
#[must_use]
pub fn source_hash(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

type InFlightKey = (i64, EmbeddingPurpose);

/// Removes its key from the in-flight set on drop, so a panicking or
/// cancelled attempt never wedges the key.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<InFlightKey>>>,
    key: InFlightKey,
}

impl InFlightGuard {
    fn try_acquire(set: &Arc<Mutex<HashSet<InFlightKey>>>, key: InFlightKey) -> Option<Self> {
        if set.lock().insert(key) {
            Some(Self {
                set: Arc::clone(set),
                key,
            })
        } else {
            None
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

/// Embedding lifecycle manager.
///
/// Thread-safe and cheap to clone.
#[derive(Clone)]
pub struct EmbeddingLifecycle {
    inner: Arc<LifecycleInner>,
}

struct LifecycleInner {
    db: Database,
    pool: EmbeddingWorkerPool,
    /// Active model version, fixed at construction. Staleness
    /// comparisons use this value, never global state.
    model_version: String,
    in_flight: Arc<Mutex<HashSet<InFlightKey>>>,
    status_tx: broadcast::Sender<IndexingStatus>,
}

impl EmbeddingLifecycle {
    /// Create a lifecycle manager over the given store and provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker pool cannot be started.
    pub fn new(
        db: Database,
        provider: Arc<dyn EmbeddingProvider>,
        model_version: impl Into<String>,
        num_workers: usize,
    ) -> Result<Self> {
        let pool = EmbeddingWorkerPool::new(provider, num_workers)?;
        let (status_tx, _) = broadcast::channel(256);

        Ok(Self {
            inner: Arc::new(LifecycleInner {
                db,
                pool,
                model_version: model_version.into(),
                in_flight: Arc::new(Mutex::new(HashSet::new())),
                status_tx,
            }),
        })
    }

    /// The active model version this manager compares against.
    #[must_use]
    pub fn model_version(&self) -> &str {
        &self.inner.model_version
    }

    /// Make sure (item, purpose) has a current vector.
    ///
    /// No-op if the stored vector is up to date. Otherwise runs one
    /// generation attempt through the provider: success upserts the
    /// vector and clears retry state; failure records the attempt and
    /// returns a retryable `Generation` error; cancellation records
    /// nothing. A concurrent attempt for the same key yields
    /// [`EmbeddingOutcome::InFlight`] without touching the counter.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the item does not exist;
    /// - `ModelUnavailable`, surfaced without counting an attempt;
    /// - `Generation` after the failed attempt has been persisted.
    pub async fn ensure_embedding(
        &self,
        item_id: i64,
        purpose: EmbeddingPurpose,
    ) -> Result<EmbeddingOutcome> {
        let item = self.inner.db.with_conn(|conn| storage::get_item(conn, item_id))?;
        let text = item.embedding_source_text();
        let hash = source_hash(&text);

        let existing = self
            .inner
            .db
            .with_conn(|conn| storage::get_embedding(conn, item_id, purpose))?;

        if let Some(row) = &existing {
            if !row.needs_regeneration
                && row.model_version == self.inner.model_version
                && row.source_hash.as_deref() == Some(hash.as_str())
            {
                return Ok(EmbeddingOutcome::UpToDate);
            }
        }

        let Some(_guard) = InFlightGuard::try_acquire(&self.inner.in_flight, (item_id, purpose))
        else {
            tracing::debug!(item_id, %purpose, "Generation already in flight, coalescing");
            return Ok(EmbeddingOutcome::InFlight);
        };

        self.publish_status(item_id);

        match self.inner.pool.embed_one(text).await? {
            Ok(vector) => {
                self.inner.db.with_transaction(|conn| {
                    storage::upsert_embedding(
                        conn,
                        item_id,
                        purpose,
                        &vector,
                        &self.inner.model_version,
                        Some(&hash),
                    )
                })?;
                drop(_guard);
                self.publish_status(item_id);
                tracing::debug!(item_id, %purpose, "Embedding generated");
                Ok(EmbeddingOutcome::Generated)
            }
            Err(ProviderError::Cancelled) => {
                tracing::debug!(item_id, %purpose, "Generation cancelled, attempt not counted");
                Ok(EmbeddingOutcome::Cancelled)
            }
            Err(ProviderError::ModelUnavailable(model)) => {
                // An unusable model is a visible error state, not a
                // per-record failure.
                Err(EmbeddingError::ModelUnavailable(model).into())
            }
            Err(ProviderError::Failed(reason)) => {
                let attempts = self.inner.db.with_transaction(|conn| {
                    storage::record_failed_attempt(conn, item_id, purpose)
                })?;
                drop(_guard);
                self.publish_status(item_id);
                tracing::warn!(item_id, %purpose, attempts, reason, "Embedding generation failed");
                Err(EmbeddingError::Generation { attempts, reason }.into())
            }
        }
    }

    /// Flag (item, purpose) as stale after upstream content changed.
    /// The stored vector is kept for search until regeneration succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn mark_stale(&self, item_id: i64, purpose: EmbeddingPurpose) -> Result<()> {
        self.inner
            .db
            .with_transaction(|conn| storage::mark_stale(conn, item_id, purpose))?;
        self.publish_status(item_id);
        Ok(())
    }

    /// Flag every vector not produced by the active model version.
    /// Called once after a model upgrade; returns the number flagged.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn mark_model_changed(&self) -> Result<usize> {
        self.inner
            .db
            .with_transaction(|conn| storage::mark_model_stale(conn, &self.inner.model_version))
    }

    /// Current indexing status for an item.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn indexing_status(&self, item_id: i64) -> Result<IndexingStatus> {
        let mut indexed = false;
        let mut regeneration_needed = false;
        let mut attempts = 0;

        for purpose in [EmbeddingPurpose::Visual, EmbeddingPurpose::Textual] {
            let row = self
                .inner
                .db
                .with_conn(|conn| storage::get_embedding(conn, item_id, purpose))?;
            if let Some(row) = row {
                if !row.needs_regeneration && row.dimension > 0 {
                    indexed = true;
                }
                regeneration_needed |= row.needs_regeneration;
                attempts = attempts.max(row.indexing_attempts);
            }
        }

        let pending = {
            let in_flight = self.inner.in_flight.lock();
            in_flight.iter().any(|(id, _)| *id == item_id)
        };

        Ok(IndexingStatus {
            item_id,
            indexed,
            pending,
            regeneration_needed,
            attempts,
        })
    }

    /// Stream of status snapshots for one item, emitted after every
    /// attempt, upsert, or stale-marking.
    pub fn observe_indexing_status(
        &self,
        item_id: i64,
    ) -> impl Stream<Item = IndexingStatus> + Send {
        BroadcastStream::new(self.inner.status_tx.subscribe()).filter_map(move |res| match res {
            Ok(status) if status.item_id == item_id => Some(status),
            _ => None,
        })
    }

    fn publish_status(&self, item_id: i64) {
        if let Ok(status) = self.indexing_status(item_id) {
            // Nobody listening is fine.
            let _ = self.inner.status_tx.send(status);
        }
    }
}

impl std::fmt::Debug for EmbeddingLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingLifecycle")
            .field("model_version", &self.inner.model_version)
            .finish_non_exhaustive()
    }
}
