//! Paper QA - Retrieval-augmented question answering over arXiv papers.
//!
//! Given a rough question about a paper, the library fabricates a plausible
//! passage with a language model, uses that passage as a semantic search
//! probe over the real passages of a set of papers, and answers the refined
//! question from the best matches.
//!
//! # Architecture
//!
//! The system is organized into several key modules:
//!
//! - **models**: Core data structures (RawSpan, ParsedPaper, ProcessedPaper, Answer, etc.)
//! - **source**: Paper download and external LaTeX-to-JSON conversion
//! - **segment**: Splitting paper bodies into bounded-length passages
//! - **embedding**: Passage and query embedding (OpenAI or FastEmbed)
//! - **retrieval**: Dot-product top-k ranking over a combined corpus
//! - **generation**: Chat model abstraction and OpenAI client
//! - **expansion**: Hypothetical-document query expansion
//! - **synthesis**: Final answer generation
//! - **cache**: Per-paper cache, optionally persisted to disk
//! - **pipeline**: Orchestration of one question end to end
//! - **config**: Environment-driven configuration and component wiring
//!
//! # Workflow
//!
//! ## Per paper (cached)
//!
//! 1. Download the e-print and convert it to structured JSON
//! 2. Substitute equations, merge spans by section, split long passages
//! 3. Embed every passage
//!
//! ## Per question
//!
//! 1. Expand the question against the center paper's abstract
//! 2. Embed the fabricated passage
//! 3. Rank all activated papers' passages by dot product
//! 4. Synthesize a Markdown answer from the top-k passages
//!
//! # Example
//!
//! ```ignore
//! use paper_qa::{config::AppConfig, models::PaperSelection, pipeline::QaPipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::from_env();
//!     let pipeline = QaPipeline::new(
//!         config.paper_source()?,
//!         config.embedding_provider()?,
//!         config.chat_model()?,
//!         config.paper_cache(),
//!         config.pipeline_config(),
//!     );
//!
//!     let papers = vec![PaperSelection::active("2203.11618")];
//!     let answer = pipeline.answer("objective to maximize", "2203.11618", &papers).await?;
//!     println!("{}", answer.answer);
//!     Ok(())
//! }
//! ```

// Public modules
pub mod cache;
pub mod config;
pub mod embedding;
pub mod expansion;
pub mod generation;
pub mod models;
pub mod pipeline;
pub mod retrieval;
pub mod segment;
pub mod source;
pub mod synthesis;

// Re-export commonly used types at the crate root
pub use cache::PaperCache;
pub use config::AppConfig;
pub use embedding::EmbeddingProvider;
pub use generation::ChatModel;
pub use models::{Answer, PaperSelection, ParsedPaper, ProcessedPaper, RawSpan, RetrievedPassage};
pub use pipeline::{PaperLoader, PipelineConfig, PipelineError, PipelineStage, QaPipeline};
pub use segment::{ChunkPolicy, Segmenter, SegmenterConfig};
pub use source::PaperSource;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Paper whose abstract frames questions when none is given
pub const DEFAULT_CENTER_PAPER: &str = "2203.11618";
