//! Search entry points: keyword lookup over the full-text projection
//! and similarity search over stored embedding vectors.

pub mod similarity;

pub use similarity::{cosine_similarity, rank_candidates, MismatchedCandidate, ScoredMatch};

use std::sync::Arc;

use serde::Serialize;

use crate::config::Config;
use crate::embeddings::{EmbeddingProvider, EmbeddingWorkerPool, ProviderError};
use crate::error::{EmbeddingError, SearchError};
use crate::storage::{self, Database, EmbeddingPurpose, ItemRecord};
use crate::Result;

/// One similarity hit with its hydrated item.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    /// The matched item.
    pub item: ItemRecord,
    /// Cosine similarity against the query.
    pub score: f32,
    /// The matched vector was stale at query time. The hit is still
    /// valid; a fresher vector may rank it differently later.
    pub regeneration_needed: bool,
}

/// Similarity results plus candidates that could not be scored.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    /// Hits above the threshold, best first.
    pub hits: Vec<SearchHit>,
    /// Candidates excluded for dimension mismatch. Non-empty results
    /// here mean some stored vectors need regeneration under the
    /// active model before they can be searched.
    pub mismatched: Vec<MismatchedCandidate>,
}

/// Query front end over the store.
///
/// Owns its own worker pool for query embedding so a long backfill of
/// item embeddings never queues ahead of an interactive search.
pub struct SearchEngine {
    db: Database,
    pool: EmbeddingWorkerPool,
    default_top_k: usize,
    threshold: f32,
}

impl SearchEngine {
    /// Create a search engine over the given store and provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker pool cannot be started.
    pub fn new(db: Database, provider: Arc<dyn EmbeddingProvider>, config: &Config) -> Result<Self> {
        let pool = EmbeddingWorkerPool::new(provider, config.embedding_threads)?;
        Ok(Self {
            db,
            pool,
            default_top_k: config.search_top_k,
            threshold: config.search_threshold,
        })
    }

    /// Similarity search: embed `query` and rank every stored vector
    /// for `purpose` against it.
    ///
    /// Stale vectors participate and are flagged on their hits.
    /// Candidates with a mismatched dimension are reported in the
    /// result instead of being silently dropped.
    ///
    /// # Errors
    ///
    /// Returns `ModelUnavailable` or `QueryEmbedding` when the query
    /// cannot be embedded. A failed query embedding is never reported
    /// as an empty result set.
    pub async fn search_similar(
        &self,
        query: &str,
        purpose: EmbeddingPurpose,
        top_k: Option<usize>,
    ) -> Result<SearchResults> {
        let query_vector = match self.pool.embed_one(query.to_string()).await? {
            Ok(vector) => vector,
            Err(ProviderError::ModelUnavailable(model)) => {
                return Err(EmbeddingError::ModelUnavailable(model).into());
            }
            Err(ProviderError::Failed(reason)) => {
                return Err(SearchError::QueryEmbedding(reason).into());
            }
            Err(ProviderError::Cancelled) => {
                return Err(SearchError::QueryEmbedding("cancelled".to_string()).into());
            }
        };

        let candidates = self
            .db
            .with_conn(|conn| storage::load_candidates(conn, purpose))?;

        let top_k = top_k.unwrap_or(self.default_top_k);
        let outcome = rank_candidates(&query_vector, &candidates, top_k, self.threshold);

        for mismatch in &outcome.mismatched {
            let error = SearchError::from(mismatch.clone());
            tracing::warn!(%purpose, %error, "Candidate excluded from ranking");
        }

        let mut hits = Vec::with_capacity(outcome.matches.len());
        for matched in outcome.matches {
            let item = self
                .db
                .with_conn(|conn| storage::get_item(conn, matched.item_id))?;
            hits.push(SearchHit {
                item,
                score: matched.score,
                regeneration_needed: matched.regeneration_needed,
            });
        }

        tracing::debug!(hits = hits.len(), %purpose, "Similarity search complete");
        Ok(SearchResults {
            hits,
            mismatched: outcome.mismatched,
        })
    }

    /// Keyword search over the full-text projection, best rank first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query is malformed or the store cannot
    /// be read.
    pub fn search_keyword(&self, query: &str, limit: usize) -> Result<Vec<ItemRecord>> {
        let ids = self
            .db
            .with_conn(|conn| storage::fts::search_text(conn, query, limit))?;

        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            items.push(self.db.with_conn(|conn| storage::get_item(conn, id))?);
        }
        Ok(items)
    }
}
