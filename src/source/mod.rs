//! Paper sources.
//!
//! A [`PaperSource`] turns an arXiv identifier into a [`ParsedPaper`]: the
//! abstract and the body paragraphs with their section labels and equation
//! references. Parsing LaTeX is not done here; sources either run an
//! external converter over the downloaded e-print or read its output from
//! disk.

pub mod arxiv;
pub mod json;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{ConvertedDocument, ParsedPaper};

pub use arxiv::{ArxivSource, ConverterCommand};
pub use json::JsonDirSource;

/// Errors that can occur when fetching a paper.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The paper source could not be downloaded
    #[error("Download failed for {paper_id}: {message}")]
    DownloadFailure { paper_id: String, message: String },

    /// The converter failed or produced unusable output
    #[error("Parse failed for {paper_id}: {message}")]
    ParseFailure { paper_id: String, message: String },

    /// No converted document exists for the paper
    #[error("Paper not found: {0}")]
    NotFound(String),

    /// The identifier is not a plausible arXiv id
    #[error("Invalid paper id: {0:?}")]
    InvalidPaperId(String),

    /// Local filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for paper source operations.
pub type SourceResult<T> = Result<T, SourceError>;

/// Trait for fetching parsed papers by identifier.
#[async_trait]
pub trait PaperSource: Send + Sync {
    /// Fetch and parse a paper.
    ///
    /// # Errors
    /// Returns `SourceError::DownloadFailure` or `SourceError::NotFound` when
    /// the paper cannot be obtained, `SourceError::ParseFailure` when it
    /// cannot be turned into structured text.
    async fn fetch(&self, paper_id: &str) -> SourceResult<ParsedPaper>;

    /// Human-readable name of this source, for logging.
    fn name(&self) -> &str;
}

/// Runtime-selected paper source.
#[derive(Debug, Clone)]
pub enum DynamicPaperSource {
    Arxiv(ArxivSource),
    JsonDir(JsonDirSource),
}

#[async_trait]
impl PaperSource for DynamicPaperSource {
    async fn fetch(&self, paper_id: &str) -> SourceResult<ParsedPaper> {
        match self {
            DynamicPaperSource::Arxiv(s) => s.fetch(paper_id).await,
            DynamicPaperSource::JsonDir(s) => s.fetch(paper_id).await,
        }
    }

    fn name(&self) -> &str {
        match self {
            DynamicPaperSource::Arxiv(s) => s.name(),
            DynamicPaperSource::JsonDir(s) => s.name(),
        }
    }
}

/// Validate an arXiv identifier and derive a file stem from it.
///
/// New-style ids (`2203.11618`, `2203.11618v2`) are used as-is; old-style
/// ids (`hep-th/9901001`) have their slash replaced with an underscore.
pub fn file_stem(paper_id: &str) -> SourceResult<String> {
    let valid = !paper_id.is_empty()
        && paper_id.len() <= 64
        && !paper_id.starts_with(['.', '/'])
        && !paper_id.ends_with('/')
        && !paper_id.contains("..")
        && paper_id.matches('/').count() <= 1
        && paper_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/'));

    if !valid {
        return Err(SourceError::InvalidPaperId(paper_id.to_string()));
    }
    Ok(paper_id.replace('/', "_"))
}

/// Read a converter output file into a parsed paper.
pub async fn read_document(path: &Path, paper_id: &str) -> SourceResult<ParsedPaper> {
    let data = tokio::fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            SourceError::NotFound(format!("{} ({})", paper_id, path.display()))
        } else {
            SourceError::Io(e)
        }
    })?;

    let document: ConvertedDocument =
        serde_json::from_str(&data).map_err(|e| SourceError::ParseFailure {
            paper_id: paper_id.to_string(),
            message: format!("invalid converter output {}: {e}", path.display()),
        })?;

    Ok(ParsedPaper::from_document(paper_id, document))
}
