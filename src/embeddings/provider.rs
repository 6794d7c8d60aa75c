//! Embedding generation seam and worker pool.
//!
//! Model inference is an external collaborator behind the
//! [`EmbeddingProvider`] trait; this crate only manages the lifecycle of
//! its results. Providers are blocking functions, so they run on a
//! dedicated thread pool fed through a bounded channel and bridged back
//! to async callers with oneshot channels.

use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use thiserror::Error;

use crate::error::EmbeddingError;
use crate::Result;

/// Why a single generation attempt produced no vector.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    /// The model cannot be used at all. Surfaced to the caller,
    /// not recorded as a per-record failed attempt.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// This attempt failed; retryable and counted.
    #[error("{0}")]
    Failed(String),

    /// The attempt was cancelled by the scheduler. Not counted.
    #[error("attempt cancelled")]
    Cancelled,
}

/// External embedding-generation collaborator.
///
/// `generate` may block; it always runs on a worker thread.
pub trait EmbeddingProvider: Send + Sync {
    /// Produce a vector for the given content.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] describing why no vector was produced.
    fn generate(&self, content: &str) -> std::result::Result<Vec<f32>, ProviderError>;
}

struct GenerateRequest {
    content: String,
    response_tx: tokio::sync::oneshot::Sender<std::result::Result<Vec<f32>, ProviderError>>,
}

/// Worker pool running provider calls off the async runtime.
pub struct EmbeddingWorkerPool {
    request_tx: Sender<GenerateRequest>,
    _workers: Vec<std::thread::JoinHandle<()>>,
}

impl EmbeddingWorkerPool {
    /// Create a pool of `num_workers` threads serving the provider.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker thread cannot be spawned.
    pub fn new(provider: Arc<dyn EmbeddingProvider>, num_workers: usize) -> Result<Self> {
        let (request_tx, request_rx): (Sender<GenerateRequest>, Receiver<GenerateRequest>) =
            bounded(100);

        let request_rx = Arc::new(Mutex::new(request_rx));
        let mut workers = Vec::with_capacity(num_workers);

        for i in 0..num_workers {
            let provider = Arc::clone(&provider);
            let rx = Arc::clone(&request_rx);

            let handle = std::thread::Builder::new()
                .name(format!("embedding-worker-{i}"))
                .spawn(move || worker_loop(&provider, &rx))
                .map_err(|e| EmbeddingError::WorkerPool(format!("failed to spawn worker: {e}")))?;

            workers.push(handle);
        }

        tracing::info!(num_workers, "Embedding worker pool started");

        Ok(Self {
            request_tx,
            _workers: workers,
        })
    }

    /// Generate one vector asynchronously.
    ///
    /// # Errors
    ///
    /// Returns the provider's error, or `WorkerPool` if the pool is gone.
    pub async fn embed_one(
        &self,
        content: String,
    ) -> Result<std::result::Result<Vec<f32>, ProviderError>> {
        let (response_tx, response_rx) = tokio::sync::oneshot::channel();

        self.request_tx
            .send(GenerateRequest {
                content,
                response_tx,
            })
            .map_err(|_| EmbeddingError::WorkerPool("worker pool closed".to_string()))?;

        response_rx
            .await
            .map_err(|_| EmbeddingError::WorkerPool("worker dropped response".to_string()).into())
    }
}

fn worker_loop(provider: &Arc<dyn EmbeddingProvider>, request_rx: &Arc<Mutex<Receiver<GenerateRequest>>>) {
    loop {
        let request = {
            let rx = request_rx.lock();
            if let Ok(req) = rx.recv() {
                req
            } else {
                tracing::debug!("Embedding worker shutting down");
                return;
            }
        };

        let result = provider.generate(&request.content);

        // Ignore error if the caller stopped waiting.
        let _ = request.response_tx.send(result);
    }
}

/// Deterministic stand-in provider: hashes the content into a fixed-size
/// L2-normalized vector. Used by the CLI when no model backend is wired
/// and by tests.
#[derive(Debug, Clone)]
pub struct DeterministicProvider {
    dimension: usize,
}

impl DeterministicProvider {
    /// Create a provider producing vectors of the given dimension.
    #[must_use]
    pub const fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl EmbeddingProvider for DeterministicProvider {
    fn generate(&self, content: &str) -> std::result::Result<Vec<f32>, ProviderError> {
        Ok(deterministic_embedding(content, self.dimension))
    }
}

/// Derive a deterministic L2-normalized vector from text.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn deterministic_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let hash = blake3::hash(text.as_bytes());
    let mut seed = u64::from_le_bytes(hash.as_bytes()[..8].try_into().unwrap_or_default());

    let mut embedding = Vec::with_capacity(dimension);
    for _ in 0..dimension {
        seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        let value = (((seed >> 33) as f32) / (u32::MAX as f32)).mul_add(2.0, -1.0);
        embedding.push(value);
    }

    let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut embedding {
            *v /= norm;
        }
    }

    embedding
}
