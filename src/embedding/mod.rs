//! Embedding provider abstraction and implementations.
//!
//! This module defines the interface for turning passages and queries into
//! vectors, and provides two implementations: the hosted OpenAI embeddings
//! API and local models through fastembed.
//!
//! Passages and queries must be embedded by the same provider; retrieval
//! compares them with a raw dot product, which is only meaningful when both
//! vectors come from the same model.

pub mod fastembed;
pub mod openai;

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur during embedding operations.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Network or API communication error
    #[error("API request failed: {0}")]
    ApiError(String),

    /// Invalid input text (e.g., empty)
    #[error("Invalid input text: {0}")]
    InvalidInput(String),

    /// Configuration error (e.g., missing API key, unknown model)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The service answered with a different number of vectors than inputs
    #[error("Expected {expected} embeddings, received {received}")]
    CountMismatch { expected: usize, received: usize },

    /// Other unexpected errors
    #[error("Unexpected error: {0}")]
    Other(String),
}

/// Result type for embedding operations.
pub type EmbeddingResult<T> = Result<T, EmbeddingError>;

/// Trait for text embedding providers.
///
/// The trait is async to support API-based embedding services. Implementors
/// must be shareable across tasks.
///
/// # Example Usage
/// ```ignore
/// let provider = OpenAIEmbedding::new(api_key, None);
/// let vectors = provider.embed_batch(&["first passage", "second passage"]).await?;
/// let probe = provider.embed_query("fabricated passage").await?;
/// ```
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding vector for a single text.
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>>;

    /// Generate embeddings for document passages, in input order.
    ///
    /// # Errors
    /// Returns `EmbeddingError` if any embedding generation fails
    async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vec<f32>>>;

    /// Generate the embedding used as a retrieval probe.
    ///
    /// Defaults to [`embed`](Self::embed); providers whose models use
    /// different encodings for queries and documents override this.
    async fn embed_query(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
        self.embed(text).await
    }

    /// Number of dimensions in the vectors this provider produces.
    fn dimension(&self) -> usize;

    /// Model identifier, recorded alongside cached embeddings.
    fn model_name(&self) -> &str;
}

/// Runtime-selected embedding backend.
///
/// The binaries choose a provider from configuration; this enum lets the
/// pipeline stay generic without boxing.
pub enum DynamicEmbeddingProvider {
    FastEmbed(self::fastembed::FastEmbedProvider),
    OpenAI(self::openai::OpenAIEmbedding),
}

#[async_trait]
impl EmbeddingProvider for DynamicEmbeddingProvider {
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
        match self {
            DynamicEmbeddingProvider::FastEmbed(p) => p.embed(text).await,
            DynamicEmbeddingProvider::OpenAI(p) => p.embed(text).await,
        }
    }

    async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vec<f32>>> {
        match self {
            DynamicEmbeddingProvider::FastEmbed(p) => p.embed_batch(texts).await,
            DynamicEmbeddingProvider::OpenAI(p) => p.embed_batch(texts).await,
        }
    }

    async fn embed_query(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
        match self {
            DynamicEmbeddingProvider::FastEmbed(p) => p.embed_query(text).await,
            DynamicEmbeddingProvider::OpenAI(p) => p.embed_query(text).await,
        }
    }

    fn dimension(&self) -> usize {
        match self {
            DynamicEmbeddingProvider::FastEmbed(p) => p.dimension(),
            DynamicEmbeddingProvider::OpenAI(p) => p.dimension(),
        }
    }

    fn model_name(&self) -> &str {
        match self {
            DynamicEmbeddingProvider::FastEmbed(p) => p.model_name(),
            DynamicEmbeddingProvider::OpenAI(p) => p.model_name(),
        }
    }
}

/// Check that a batch response lines up with its request.
pub(crate) fn ensure_count(expected: usize, vectors: &[Vec<f32>]) -> EmbeddingResult<()> {
    if vectors.len() != expected {
        return Err(EmbeddingError::CountMismatch {
            expected,
            received: vectors.len(),
        });
    }
    Ok(())
}
