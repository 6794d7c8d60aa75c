//! Embedding generation and lifecycle management.
//!
//! [`provider`] defines the generation backend trait and the worker
//! pool that runs it off the async runtime. [`lifecycle`] decides when
//! a vector is stale, serializes attempts per key, and persists retry
//! state.

pub mod lifecycle;
pub mod provider;

pub use lifecycle::{source_hash, EmbeddingLifecycle, EmbeddingOutcome, IndexingStatus};
pub use provider::{
    deterministic_embedding, DeterministicProvider, EmbeddingProvider, EmbeddingWorkerPool,
    ProviderError,
};
