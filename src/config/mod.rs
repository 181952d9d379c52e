//! Application configuration.
//!
//! [`AppConfig`] starts from defaults, is overridden by environment
//! variables in [`AppConfig::from_env`], and is finally adjusted by the
//! binaries from their command-line flags. It also knows how to build the
//! runtime-selected collaborators (embedding provider, chat model, paper
//! source, cache) that the pipeline is generic over.
//!
//! | Variable | Field |
//! |---|---|
//! | `OPENAI_API_KEY` | `api_key` |
//! | `OPENAI_BASE_URL` | `base_url` |
//! | `PAPER_QA_EMBEDDING_BACKEND` | `embedding.backend` (`openai` or `fast-embed`) |
//! | `PAPER_QA_EMBEDDING_MODEL` | `embedding.model` |
//! | `PAPER_QA_CHAT_MODEL` | `chat_model` |
//! | `PAPER_QA_TIMEOUT_SECS` | `request_timeout_secs` |
//! | `PAPER_QA_TOP_K` | `top_k` |
//! | `PAPER_QA_CHUNK_POLICY` | `segmenter.chunk_policy` |
//! | `PAPER_QA_ON_PAPER_FAILURE` | `failure_policy` (`abort` or `skip`) |
//! | `PAPER_QA_CACHE_DIR` | `cache_dir` |
//! | `PAPER_QA_WORK_DIR` | `work_dir` |
//! | `PAPER_QA_CONVERTER` | `converter` |
//! | `PAPER_QA_CONVERTED_DIR` | `converted_dir` |

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::cache::PaperCache;
use crate::embedding::fastembed::FastEmbedProvider;
use crate::embedding::openai::OpenAIEmbedding;
use crate::embedding::{DynamicEmbeddingProvider, EmbeddingError, EmbeddingProvider};
use crate::generation::openai::{OpenAIChat, DEFAULT_CHAT_MODEL};
use crate::generation::GenerationError;
use crate::pipeline::{PaperFailurePolicy, PipelineConfig};
use crate::retrieval::DEFAULT_TOP_K;
use crate::segment::SegmenterConfig;
use crate::source::arxiv::DEFAULT_CONVERTER;
use crate::source::{ArxivSource, ConverterCommand, DynamicPaperSource, JsonDirSource, SourceError};

/// Errors raised while turning configuration into live components.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("OPENAI_API_KEY is required for {0}")]
    MissingApiKey(&'static str),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Which embedding service to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmbeddingBackend {
    #[default]
    #[serde(rename = "openai")]
    OpenAI,
    FastEmbed,
}

impl FromStr for EmbeddingBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(EmbeddingBackend::OpenAI),
            "fast-embed" | "fastembed" | "fast_embed" => Ok(EmbeddingBackend::FastEmbed),
            other => Err(format!("unknown embedding backend: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub backend: EmbeddingBackend,

    /// Model name; the backend's default if None
    pub model: Option<String>,

    /// Where FastEmbed keeps downloaded model files
    pub model_cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub embedding: EmbeddingConfig,
    pub chat_model: String,

    /// OpenAI-compatible endpoint for both embeddings and chat
    pub base_url: Option<String>,

    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    pub request_timeout_secs: u64,
    pub top_k: usize,
    pub segmenter: SegmenterConfig,
    pub failure_policy: PaperFailurePolicy,

    /// Persist processed papers here; in-memory only if None
    pub cache_dir: Option<PathBuf>,

    /// Download and conversion scratch space
    pub work_dir: PathBuf,

    /// Converter command line with placeholders
    pub converter: String,

    /// Read pre-converted JSON from here instead of downloading
    pub converted_dir: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("paper-qa")
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            embedding: EmbeddingConfig::default(),
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            base_url: None,
            api_key: None,
            request_timeout_secs: 120,
            top_k: DEFAULT_TOP_K,
            segmenter: SegmenterConfig::default(),
            failure_policy: PaperFailurePolicy::default(),
            cache_dir: Some(data_dir.join("papers")),
            work_dir: data_dir.join("work"),
            converter: DEFAULT_CONVERTER.to_string(),
            converted_dir: None,
        }
    }
}

/// Parse `value`, keeping `current` and warning when it does not parse.
fn parse_or_keep<T>(key: &str, value: &str, current: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value.parse() {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("Ignoring {}={:?}: {}", key, value, e);
            current
        }
    }
}

impl AppConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(key) = lookup("OPENAI_API_KEY").filter(|k| !k.is_empty()) {
            config.api_key = Some(key);
        }
        if let Some(url) = lookup("OPENAI_BASE_URL").filter(|u| !u.is_empty()) {
            config.base_url = Some(url);
        }
        if let Some(value) = lookup("PAPER_QA_EMBEDDING_BACKEND") {
            config.embedding.backend =
                parse_or_keep("PAPER_QA_EMBEDDING_BACKEND", &value, config.embedding.backend);
        }
        if let Some(model) = lookup("PAPER_QA_EMBEDDING_MODEL") {
            config.embedding.model = Some(model);
        }
        if let Some(model) = lookup("PAPER_QA_CHAT_MODEL") {
            config.chat_model = model;
        }
        if let Some(value) = lookup("PAPER_QA_TIMEOUT_SECS") {
            config.request_timeout_secs =
                parse_or_keep("PAPER_QA_TIMEOUT_SECS", &value, config.request_timeout_secs);
        }
        if let Some(value) = lookup("PAPER_QA_TOP_K") {
            // Zero would retrieve nothing to answer from
            match value.parse::<NonZeroUsize>() {
                Ok(top_k) => config.top_k = top_k.get(),
                Err(e) => warn!("Ignoring PAPER_QA_TOP_K={:?}: {}", value, e),
            }
        }
        if let Some(value) = lookup("PAPER_QA_CHUNK_POLICY") {
            config.segmenter.chunk_policy =
                parse_or_keep("PAPER_QA_CHUNK_POLICY", &value, config.segmenter.chunk_policy);
        }
        if let Some(value) = lookup("PAPER_QA_ON_PAPER_FAILURE") {
            config.failure_policy =
                parse_or_keep("PAPER_QA_ON_PAPER_FAILURE", &value, config.failure_policy);
        }
        if let Some(dir) = lookup("PAPER_QA_CACHE_DIR") {
            // An empty value disables persistence
            config.cache_dir = (!dir.is_empty()).then(|| PathBuf::from(dir));
        }
        if let Some(dir) = lookup("PAPER_QA_WORK_DIR") {
            config.work_dir = PathBuf::from(dir);
        }
        if let Some(command) = lookup("PAPER_QA_CONVERTER") {
            config.converter = command;
        }
        if let Some(dir) = lookup("PAPER_QA_CONVERTED_DIR") {
            config.converted_dir = Some(PathBuf::from(dir));
        }

        config
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            top_k: self.top_k,
            request_timeout: self.request_timeout(),
            failure_policy: self.failure_policy,
            segmenter: self.segmenter,
        }
    }

    fn require_api_key(&self, purpose: &'static str) -> ConfigResult<String> {
        self.api_key
            .clone()
            .ok_or(ConfigError::MissingApiKey(purpose))
    }

    /// Build the configured embedding provider.
    ///
    /// FastEmbed downloads its model on first use, which can take a while.
    pub fn embedding_provider(&self) -> ConfigResult<DynamicEmbeddingProvider> {
        match self.embedding.backend {
            EmbeddingBackend::OpenAI => {
                let api_key = self.require_api_key("OpenAI embeddings")?;
                let mut provider = OpenAIEmbedding::new(api_key, self.embedding.model.clone())
                    .with_timeout(self.request_timeout())?;
                if let Some(url) = &self.base_url {
                    provider = provider.with_base_url(url.as_str());
                }
                info!(model = provider.model_name(), "Using OpenAI embeddings");
                Ok(DynamicEmbeddingProvider::OpenAI(provider))
            }
            EmbeddingBackend::FastEmbed => {
                let cache_dir = self.embedding.model_cache_dir.clone();
                let provider = match &self.embedding.model {
                    Some(name) => FastEmbedProvider::from_name(name, cache_dir)?,
                    None => FastEmbedProvider::new(None, cache_dir)?,
                };
                Ok(DynamicEmbeddingProvider::FastEmbed(provider))
            }
        }
    }

    /// Build the chat model used for expansion and synthesis.
    pub fn chat_model(&self) -> ConfigResult<OpenAIChat> {
        let api_key = self.require_api_key("the chat model")?;
        let mut chat = OpenAIChat::new(api_key, Some(self.chat_model.clone()))
            .with_timeout(self.request_timeout())?;
        if let Some(url) = &self.base_url {
            chat = chat.with_base_url(url.as_str());
        }
        Ok(chat)
    }

    /// Build the paper source: pre-converted JSON if `converted_dir` is set,
    /// otherwise arXiv download plus the converter.
    pub fn paper_source(&self) -> ConfigResult<DynamicPaperSource> {
        if let Some(dir) = &self.converted_dir {
            info!("Reading converted papers from {}", dir.display());
            return Ok(DynamicPaperSource::JsonDir(JsonDirSource::new(dir.clone())));
        }

        let converter = ConverterCommand::parse(&self.converter)?;
        let source = ArxivSource::with_timeout(self.work_dir.clone(), self.request_timeout())?
            .with_converter(converter);
        Ok(DynamicPaperSource::Arxiv(source))
    }

    pub fn paper_cache(&self) -> PaperCache {
        match &self.cache_dir {
            Some(dir) => PaperCache::persistent(dir.clone()),
            None => PaperCache::new(),
        }
    }
}
