//! FastEmbed embedding provider implementation.
//!
//! Runs ONNX embedding models locally through the fastembed library, so a
//! paper can be embedded without a hosted embedding service. Inference is
//! CPU-bound and is moved off the async runtime with `spawn_blocking`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{ensure_count, EmbeddingError, EmbeddingProvider, EmbeddingResult};

/// Passages per inference batch.
const DEFAULT_BATCH_SIZE: usize = 32;

/// Local embedding provider backed by a fastembed model.
#[derive(Clone)]
pub struct FastEmbedProvider {
    /// The embedding model instance, shared with blocking inference tasks
    model: Arc<Mutex<TextEmbedding>>,

    model_name: String,
    embedding_dimension: usize,
    batch_size: usize,
}

/// Resolve a model name as given on the command line or in config.
///
/// Accepts the fastembed enum names (`BGESmallENV15`) as well as the
/// Hugging Face style names (`BAAI/bge-small-en-v1.5`), case-insensitively.
pub fn parse_model(name: &str) -> EmbeddingResult<EmbeddingModel> {
    let key: String = name
        .rsplit('/')
        .next()
        .unwrap_or(name)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();

    let model = match key.as_str() {
        "allminilml6v2" => EmbeddingModel::AllMiniLML6V2,
        "bgesmallenv15" => EmbeddingModel::BGESmallENV15,
        "bgebaseenv15" => EmbeddingModel::BGEBaseENV15,
        "bgelargeenv15" => EmbeddingModel::BGELargeENV15,
        "nomicembedtextv1" => EmbeddingModel::NomicEmbedTextV1,
        "nomicembedtextv15" => EmbeddingModel::NomicEmbedTextV15,
        "paraphrasemlminilml12v2" | "paraphrasemultilingualminilml12v2" => {
            EmbeddingModel::ParaphraseMLMiniLML12V2
        }
        "paraphrasemlmpnetbasev2" | "paraphrasemultilingualmpnetbasev2" => {
            EmbeddingModel::ParaphraseMLMpnetBaseV2
        }
        _ => {
            return Err(EmbeddingError::ConfigError(format!(
                "Unknown FastEmbed model: {name}"
            )))
        }
    };
    Ok(model)
}

/// Output dimension of a supported model.
pub fn model_dimension(model: &EmbeddingModel) -> usize {
    match model {
        EmbeddingModel::BGEBaseENV15
        | EmbeddingModel::NomicEmbedTextV1
        | EmbeddingModel::NomicEmbedTextV15
        | EmbeddingModel::ParaphraseMLMpnetBaseV2 => 768,
        EmbeddingModel::BGELargeENV15 => 1024,
        _ => 384,
    }
}

impl FastEmbedProvider {
    /// Load a model, downloading it into `cache_dir` on first use.
    ///
    /// # Arguments
    /// * `model` - Model to load (defaults to BGESmallENV15)
    /// * `cache_dir` - Directory for model files (fastembed's default if None)
    ///
    /// # Errors
    /// Returns `EmbeddingError::ConfigError` if the model cannot be loaded
    pub fn new(model: Option<EmbeddingModel>, cache_dir: Option<PathBuf>) -> EmbeddingResult<Self> {
        let model_type = model.unwrap_or(EmbeddingModel::BGESmallENV15);
        let model_name = format!("{:?}", model_type);
        let embedding_dimension = model_dimension(&model_type);

        let mut init_options = InitOptions::new(model_type);
        if let Some(dir) = cache_dir {
            debug!("FastEmbed cache directory: {}", dir.display());
            init_options = init_options.with_cache_dir(dir);
        }

        let text_embedding = TextEmbedding::try_new(init_options).map_err(|e| {
            EmbeddingError::ConfigError(format!("Failed to initialize FastEmbed model: {}", e))
        })?;

        info!(model = %model_name, dimension = embedding_dimension, "Loaded FastEmbed model");

        Ok(Self {
            model: Arc::new(Mutex::new(text_embedding)),
            model_name,
            embedding_dimension,
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    /// Load a model by name; see [`parse_model`].
    pub fn from_name(name: &str, cache_dir: Option<PathBuf>) -> EmbeddingResult<Self> {
        Self::new(Some(parse_model(name)?), cache_dir)
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    async fn run(&self, texts: Vec<String>) -> EmbeddingResult<Vec<Vec<f32>>> {
        let expected = texts.len();
        let model = Arc::clone(&self.model);
        let batch_size = self.batch_size;

        let vectors = tokio::task::spawn_blocking(move || {
            let model = model.blocking_lock();
            model.embed(texts, Some(batch_size))
        })
        .await
        .map_err(|e| EmbeddingError::Other(format!("Embedding task failed: {}", e)))?
        .map_err(|e| EmbeddingError::Other(format!("Embedding generation failed: {}", e)))?;

        ensure_count(expected, &vectors)?;
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("Text cannot be empty".to_string()));
        }

        self.run(vec![text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Other("No embedding generated".to_string()))
    }

    async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        if texts.iter().any(|t| t.trim().is_empty()) {
            return Err(EmbeddingError::InvalidInput("All texts must be non-empty".to_string()));
        }

        self.run(texts.iter().map(|&s| s.to_string()).collect()).await
    }

    fn dimension(&self) -> usize {
        self.embedding_dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

// TextEmbedding does not implement Debug
impl std::fmt::Debug for FastEmbedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedProvider")
            .field("model_name", &self.model_name)
            .field("embedding_dimension", &self.embedding_dimension)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}
