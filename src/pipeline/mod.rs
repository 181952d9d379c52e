//! Question answering pipeline.
//!
//! Wires the components together for one question:
//!
//! 1. Load the center paper for its abstract.
//! 2. Load every activated paper (fetch, segment, embed), through the cache.
//! 3. Expand the rough question into a refined question and a fabricated
//!    passage.
//! 4. Embed the fabricated passage and retrieve the top-k real passages.
//! 5. Synthesize an answer from the abstract, refined question and passages.
//!
//! Every call to an external service runs under the configured timeout. A
//! failure at any stage fails the whole question; no partial answer is
//! returned.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::PaperCache;
use crate::embedding::{EmbeddingError, EmbeddingProvider};
use crate::expansion::{ExpansionError, QueryExpander};
use crate::generation::{ChatModel, GenerationError};
use crate::models::{Answer, PaperSelection, ParsedPaper, ProcessedPaper};
use crate::retrieval::{vector_norm, Corpus, RetrievalError, DEFAULT_TOP_K};
use crate::segment::{Segmenter, SegmenterConfig};
use crate::source::{PaperSource, SourceError};
use crate::synthesis::AnswerSynthesizer;

/// Default timeout for each external call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Largest tolerated deviation of the query embedding norm from 1.
const NORM_TOLERANCE: f32 = 1e-2;

/// What to do when a paper cannot be downloaded or parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaperFailurePolicy {
    /// Fail the question
    #[default]
    Abort,

    /// Leave the paper out of the corpus and continue
    Skip,
}

impl std::str::FromStr for PaperFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "abort" => Ok(PaperFailurePolicy::Abort),
            "skip" => Ok(PaperFailurePolicy::Skip),
            other => Err(format!("unknown paper failure policy: {other}")),
        }
    }
}

/// Pipeline tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Passages handed to synthesis
    pub top_k: usize,

    /// Timeout applied to every download, embedding and chat call
    pub request_timeout: Duration,

    pub failure_policy: PaperFailurePolicy,
    pub segmenter: SegmenterConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            failure_policy: PaperFailurePolicy::default(),
            segmenter: SegmenterConfig::default(),
        }
    }
}

/// Step of the pipeline at which an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Download,
    Parse,
    PassageEmbedding,
    Expansion,
    QueryEmbedding,
    Retrieval,
    Synthesis,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Download => "download",
            PipelineStage::Parse => "parse",
            PipelineStage::PassageEmbedding => "passage embedding",
            PipelineStage::Expansion => "query expansion",
            PipelineStage::QueryEmbedding => "query embedding",
            PipelineStage::Retrieval => "retrieval",
            PipelineStage::Synthesis => "answer synthesis",
        };
        f.write_str(name)
    }
}

/// Errors that fail a question.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Download failed for {paper_id}: {message}")]
    DownloadFailure { paper_id: String, message: String },

    #[error("Parse failed for {paper_id}: {message}")]
    ParseFailure { paper_id: String, message: String },

    #[error("Invalid paper id: {0:?}")]
    InvalidPaperId(String),

    #[error("Embedding service failed during {stage}: {source}")]
    EmbeddingServiceFailure {
        stage: PipelineStage,
        #[source]
        source: EmbeddingError,
    },

    #[error("Malformed generation ({reason}): {response:?}")]
    MalformedGeneration { reason: String, response: String },

    #[error("Chat model failed during {stage}: {source}")]
    GenerationFailure {
        stage: PipelineStage,
        #[source]
        source: GenerationError,
    },

    #[error("Insufficient corpus: requested {requested} passages, {available} available")]
    InsufficientCorpus { requested: usize, available: usize },

    #[error("Retrieval failed: {0}")]
    Retrieval(RetrievalError),

    #[error("top-k must be at least 1")]
    InvalidTopK,

    #[error("Timed out after {after:?} during {stage}")]
    Timeout { stage: PipelineStage, after: Duration },
}

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    /// Stage the error belongs to.
    pub fn stage(&self) -> PipelineStage {
        match self {
            PipelineError::DownloadFailure { .. } | PipelineError::InvalidPaperId(_) => {
                PipelineStage::Download
            }
            PipelineError::ParseFailure { .. } => PipelineStage::Parse,
            PipelineError::EmbeddingServiceFailure { stage, .. }
            | PipelineError::GenerationFailure { stage, .. }
            | PipelineError::Timeout { stage, .. } => *stage,
            PipelineError::MalformedGeneration { .. } => PipelineStage::Expansion,
            PipelineError::InsufficientCorpus { .. }
            | PipelineError::Retrieval(_)
            | PipelineError::InvalidTopK => PipelineStage::Retrieval,
        }
    }

    /// Whether the error concerns a single paper, so that the skip policy
    /// may drop that paper instead of failing the question.
    pub fn is_paper_failure(&self) -> bool {
        matches!(
            self,
            PipelineError::DownloadFailure { .. }
                | PipelineError::ParseFailure { .. }
                | PipelineError::InvalidPaperId(_)
        ) || matches!(
            self,
            PipelineError::Timeout {
                stage: PipelineStage::Download,
                ..
            }
        )
    }
}

impl From<SourceError> for PipelineError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::DownloadFailure { paper_id, message } => {
                PipelineError::DownloadFailure { paper_id, message }
            }
            SourceError::ParseFailure { paper_id, message } => {
                PipelineError::ParseFailure { paper_id, message }
            }
            SourceError::NotFound(what) => PipelineError::DownloadFailure {
                paper_id: what,
                message: "not found".to_string(),
            },
            SourceError::InvalidPaperId(id) => PipelineError::InvalidPaperId(id),
            SourceError::Io(e) => PipelineError::DownloadFailure {
                paper_id: String::new(),
                message: e.to_string(),
            },
        }
    }
}

impl From<ExpansionError> for PipelineError {
    fn from(err: ExpansionError) -> Self {
        match err {
            ExpansionError::MalformedGeneration { reason, response } => {
                PipelineError::MalformedGeneration { reason, response }
            }
            ExpansionError::Generation(source) => PipelineError::GenerationFailure {
                stage: PipelineStage::Expansion,
                source,
            },
        }
    }
}

/// Run `fut` under `after`, reporting a timeout against `stage`.
async fn timed<T>(
    after: Duration,
    stage: PipelineStage,
    fut: impl Future<Output = T>,
) -> PipelineResult<T> {
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| PipelineError::Timeout { stage, after })
}

/// Turns paper ids into processed papers: fetch, segment, embed.
///
/// Both the parsed and the processed form go through the cache, so a paper
/// is fetched and embedded at most once until it is invalidated.
pub struct PaperLoader<S: PaperSource, E: EmbeddingProvider> {
    source: S,
    embedder: E,
    segmenter: Segmenter,
    cache: PaperCache,
    request_timeout: Duration,
}

impl<S: PaperSource, E: EmbeddingProvider> PaperLoader<S, E> {
    pub fn new(
        source: S,
        embedder: E,
        cache: PaperCache,
        segmenter: SegmenterConfig,
        request_timeout: Duration,
    ) -> Self {
        Self {
            source,
            embedder,
            segmenter: Segmenter::new(segmenter),
            cache,
            request_timeout,
        }
    }

    pub fn cache(&self) -> &PaperCache {
        &self.cache
    }

    pub fn embedder(&self) -> &E {
        &self.embedder
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Whether a processed paper for the active embedding model and
    /// segmenter settings is cached.
    pub async fn is_cached(&self, paper_id: &str) -> bool {
        self.cache
            .get(paper_id, self.embedder.model_name(), self.segmenter.config())
            .await
            .is_some()
    }

    /// Fetch a paper's parsed form, through the cache.
    pub async fn load_parsed(&self, paper_id: &str) -> PipelineResult<Arc<ParsedPaper>> {
        if let Some(paper) = self.cache.get_parsed(paper_id).await {
            debug!(paper_id, "Parsed paper cache hit");
            return Ok(paper);
        }

        info!(paper_id, source = self.source.name(), "Fetching paper");
        let paper = timed(
            self.request_timeout,
            PipelineStage::Download,
            self.source.fetch(paper_id),
        )
        .await??;
        Ok(self.cache.insert_parsed(paper).await)
    }

    /// Segment and embed a paper, through the cache.
    ///
    /// Blank passages are dropped before embedding.
    pub async fn load_paper(&self, paper_id: &str) -> PipelineResult<Arc<ProcessedPaper>> {
        let model_name = self.embedder.model_name();
        let segmenter = self.segmenter.config();
        if let Some(paper) = self.cache.get(paper_id, model_name, segmenter).await {
            debug!(paper_id, passages = paper.len(), "Processed paper cache hit");
            return Ok(paper);
        }

        let parsed = self.load_parsed(paper_id).await?;
        let passages: Vec<String> = self
            .segmenter
            .segment(&parsed.body_text)
            .into_iter()
            .filter(|p| !p.trim().is_empty())
            .collect();

        let embeddings = if passages.is_empty() {
            warn!(paper_id, "Paper produced no passages");
            Vec::new()
        } else {
            let texts: Vec<&str> = passages.iter().map(String::as_str).collect();
            timed(
                self.request_timeout,
                PipelineStage::PassageEmbedding,
                self.embedder.embed_batch(&texts),
            )
            .await?
            .map_err(|source| PipelineError::EmbeddingServiceFailure {
                stage: PipelineStage::PassageEmbedding,
                source,
            })?
        };

        let received = embeddings.len();
        let expected = passages.len();
        let paper = ProcessedPaper::new(
            paper_id.to_string(),
            parsed.abstract_text.clone(),
            passages,
            embeddings,
            model_name.to_string(),
        )
        .ok_or(PipelineError::EmbeddingServiceFailure {
            stage: PipelineStage::PassageEmbedding,
            source: EmbeddingError::CountMismatch { expected, received },
        })?
        .with_segmenter(*segmenter);

        info!(paper_id, passages = paper.len(), "Processed paper");
        Ok(self.cache.insert(paper).await)
    }
}

/// Answers questions about a set of papers.
pub struct QaPipeline<S: PaperSource, E: EmbeddingProvider, M: ChatModel> {
    loader: PaperLoader<S, E>,
    expander: QueryExpander<Arc<M>>,
    synthesizer: AnswerSynthesizer<Arc<M>>,
    config: PipelineConfig,
}

impl<S: PaperSource, E: EmbeddingProvider, M: ChatModel> QaPipeline<S, E, M> {
    /// Create a pipeline. The same chat model serves expansion and synthesis.
    pub fn new(source: S, embedder: E, model: M, cache: PaperCache, config: PipelineConfig) -> Self {
        let model = Arc::new(model);
        info!(
            source = source.name(),
            embedding_model = embedder.model_name(),
            chat_model = model.model_name(),
            top_k = config.top_k,
            "Initialized QA pipeline"
        );

        Self {
            loader: PaperLoader::new(
                source,
                embedder,
                cache,
                config.segmenter,
                config.request_timeout,
            ),
            expander: QueryExpander::new(Arc::clone(&model)),
            synthesizer: AnswerSynthesizer::new(model),
            config,
        }
    }

    pub fn loader(&self) -> &PaperLoader<S, E> {
        &self.loader
    }

    pub fn cache(&self) -> &PaperCache {
        self.loader.cache()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Change the number of retrieved passages for later questions.
    pub fn set_top_k(&mut self, top_k: usize) {
        self.config.top_k = top_k;
    }

    async fn timed<T>(
        &self,
        stage: PipelineStage,
        fut: impl Future<Output = T>,
    ) -> PipelineResult<T> {
        timed(self.config.request_timeout, stage, fut).await
    }

    /// Load the activated papers in list order, each id once.
    ///
    /// Returns the loaded papers and the ids dropped under
    /// [`PaperFailurePolicy::Skip`].
    async fn load_corpus(
        &self,
        selections: &[PaperSelection],
    ) -> PipelineResult<(Vec<Arc<ProcessedPaper>>, Vec<String>)> {
        let mut seen = HashSet::new();
        let mut papers = Vec::new();
        let mut skipped = Vec::new();

        for selection in selections.iter().filter(|s| s.activated) {
            if !seen.insert(selection.paper_id.as_str()) {
                continue;
            }

            match self.loader.load_paper(&selection.paper_id).await {
                Ok(paper) => papers.push(paper),
                Err(e)
                    if e.is_paper_failure()
                        && self.config.failure_policy == PaperFailurePolicy::Skip =>
                {
                    warn!("Skipping paper {}: {}", selection.paper_id, e);
                    skipped.push(selection.paper_id.clone());
                }
                Err(e) => return Err(e),
            }
        }

        Ok((papers, skipped))
    }

    /// Answer a question about the center paper using the activated papers.
    ///
    /// The center paper supplies the abstract given to both model calls; it
    /// only contributes passages if it is also activated in `selections`.
    pub async fn answer(
        &self,
        query: &str,
        center_id: &str,
        selections: &[PaperSelection],
    ) -> PipelineResult<Answer> {
        if self.config.top_k == 0 {
            return Err(PipelineError::InvalidTopK);
        }

        let center = self.loader.load_parsed(center_id).await?;
        let (papers, skipped_papers) = self.load_corpus(selections).await?;

        let corpus = Corpus::from_papers(&papers);
        if corpus.is_empty() {
            return Err(PipelineError::InsufficientCorpus {
                requested: self.config.top_k,
                available: 0,
            });
        }

        let expansion = self
            .timed(
                PipelineStage::Expansion,
                self.expander.expand(&center.abstract_text, query),
            )
            .await??;

        let probe = self
            .timed(
                PipelineStage::QueryEmbedding,
                self.loader.embedder.embed_query(&expansion.fabricated_passage),
            )
            .await?
            .map_err(|source| PipelineError::EmbeddingServiceFailure {
                stage: PipelineStage::QueryEmbedding,
                source,
            })?;

        let norm = vector_norm(&probe);
        if (norm - 1.0).abs() > NORM_TOLERANCE {
            warn!(norm, "Query embedding is not unit length; dot-product scores are unnormalized");
        }

        let retrieved = corpus
            .retrieve(&probe, self.config.top_k)
            .map_err(|e| match e {
                RetrievalError::InsufficientCorpus {
                    requested,
                    available,
                } => PipelineError::InsufficientCorpus {
                    requested,
                    available,
                },
                other => PipelineError::Retrieval(other),
            })?;
        if retrieved.is_empty() {
            return Err(PipelineError::InsufficientCorpus {
                requested: self.config.top_k,
                available: corpus.len(),
            });
        }

        let texts: Vec<&str> = retrieved.iter().map(|r| r.text.as_str()).collect();
        let answer = self
            .timed(
                PipelineStage::Synthesis,
                self.synthesizer.synthesize(
                    &center.abstract_text,
                    &expansion.refined_question,
                    &texts,
                ),
            )
            .await?
            .map_err(|source| PipelineError::GenerationFailure {
                stage: PipelineStage::Synthesis,
                source,
            })?;

        info!(
            papers = corpus.papers().len(),
            passages = corpus.len(),
            retrieved = retrieved.len(),
            "Answered question"
        );

        Ok(Answer {
            query: query.to_string(),
            refined_question: expansion.refined_question,
            fabricated_passage: expansion.fabricated_passage,
            retrieved,
            answer,
            papers: corpus.papers().to_vec(),
            skipped_papers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::embedding::EmbeddingResult;
    use crate::generation::{ChatMessage, GenerationResult};
    use crate::models::RawSpan;
    use crate::source::SourceResult;

    struct MockSource {
        papers: HashMap<String, ParsedPaper>,
        fetches: AtomicUsize,
        delay: Option<Duration>,
    }

    impl MockSource {
        fn new(papers: Vec<ParsedPaper>) -> Self {
            Self {
                papers: papers.into_iter().map(|p| (p.paper_id.clone(), p)).collect(),
                fetches: AtomicUsize::new(0),
                delay: None,
            }
        }
    }

    #[async_trait]
    impl PaperSource for MockSource {
        async fn fetch(&self, paper_id: &str) -> SourceResult<ParsedPaper> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.papers
                .get(paper_id)
                .cloned()
                .ok_or_else(|| SourceError::DownloadFailure {
                    paper_id: paper_id.to_string(),
                    message: "404".to_string(),
                })
        }

        fn name(&self) -> &str {
            "mock"
        }
    }

    /// One-hot vectors keyed on marker words.
    struct MockEmbedder {
        batches: AtomicUsize,
    }

    fn one_hot(text: &str) -> Vec<f32> {
        if text.contains("alpha") {
            vec![1.0, 0.0, 0.0]
        } else if text.contains("beta") {
            vec![0.0, 1.0, 0.0]
        } else {
            vec![0.0, 0.0, 1.0]
        }
    }

    #[async_trait]
    impl EmbeddingProvider for MockEmbedder {
        async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
            Ok(one_hot(text))
        }

        async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vec<f32>>> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|t| one_hot(t)).collect())
        }

        fn dimension(&self) -> usize {
            3
        }

        fn model_name(&self) -> &str {
            "mock-embed"
        }
    }

    /// Answers expansion prompts (four messages) and synthesis prompts (two).
    struct MockChat {
        expansion: String,
        synthesis_prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatModel for MockChat {
        async fn complete(&self, messages: &[ChatMessage]) -> GenerationResult<String> {
            if messages.len() == 4 {
                return Ok(self.expansion.clone());
            }
            let prompt = messages.last().map(|m| m.content.clone()).unwrap_or_default();
            self.synthesis_prompts.lock().unwrap().push(prompt);
            Ok("Final answer".to_string())
        }

        fn model_name(&self) -> &str {
            "mock-chat"
        }
    }

    fn paper(id: &str, abstract_text: &str, spans: Vec<RawSpan>) -> ParsedPaper {
        ParsedPaper {
            paper_id: id.to_string(),
            abstract_text: abstract_text.to_string(),
            body_text: spans,
        }
    }

    /// Long enough to stay a passage of its own.
    fn long(marker: &str) -> String {
        format!("{marker} {}", "x".repeat(320))
    }

    fn library() -> Vec<ParsedPaper> {
        vec![
            paper(
                "2203.11618",
                "Center abstract.",
                vec![
                    RawSpan::new(long("alpha"), "Method"),
                    RawSpan::new(long("gamma"), "Results"),
                ],
            ),
            paper(
                "2101.00001",
                "Other abstract.",
                vec![RawSpan::new(long("beta"), "Related")],
            ),
        ]
    }

    fn chat(expansion: &str) -> Arc<MockChat> {
        Arc::new(MockChat {
            expansion: expansion.to_string(),
            synthesis_prompts: Mutex::new(Vec::new()),
        })
    }

    type MockPipeline = QaPipeline<MockSource, MockEmbedder, Arc<MockChat>>;

    fn pipeline_with(source: MockSource, config: PipelineConfig, chat: Arc<MockChat>) -> MockPipeline {
        QaPipeline::new(
            source,
            MockEmbedder {
                batches: AtomicUsize::new(0),
            },
            chat,
            PaperCache::new(),
            config,
        )
    }

    fn pipeline(source: MockSource, config: PipelineConfig) -> MockPipeline {
        pipeline_with(
            source,
            config,
            chat("Decoded thought: What is alpha?\n\nPassage: alpha is a method"),
        )
    }

    #[tokio::test]
    async fn test_answer_retrieves_best_passage_first() {
        let model = chat("Decoded thought: What is alpha?\n\nPassage: alpha is a method");
        let qa = pipeline_with(
            MockSource::new(library()),
            PipelineConfig::default(),
            Arc::clone(&model),
        );
        let selections = vec![
            PaperSelection::active("2203.11618"),
            PaperSelection::active("2101.00001"),
        ];

        let answer = qa.answer("alpha?", "2203.11618", &selections).await.unwrap();

        assert_eq!(answer.refined_question, " What is alpha?");
        assert_eq!(answer.fabricated_passage, " alpha is a method");
        assert_eq!(answer.answer, "Final answer");
        assert_eq!(answer.papers, vec!["2203.11618", "2101.00001"]);
        // Corpus has 3 passages, all retrieved, alpha first then index order
        assert_eq!(answer.retrieved.len(), 3);
        assert_eq!(answer.retrieved[0].text, long("alpha"));
        assert_eq!(answer.retrieved[0].score, 1.0);
        assert_eq!(answer.retrieved[1].corpus_index, 1);
        assert_eq!(answer.retrieved[2].paper_id, "2101.00001");

        let prompts = model.synthesis_prompts.lock().unwrap().clone();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("Paper Abstract: Center abstract."));
        assert!(prompts[0].contains("Question:  What is alpha?"));
        assert!(prompts[0].contains(&format!("Passage 0 - <<{}>>", long("alpha"))));
    }

    #[tokio::test]
    async fn test_top_k_degrades_to_corpus_size() {
        let config = PipelineConfig {
            top_k: 10,
            ..PipelineConfig::default()
        };
        let qa = pipeline(MockSource::new(library()), config);
        let answer = qa
            .answer("q", "2203.11618", &[PaperSelection::active("2101.00001")])
            .await
            .unwrap();
        assert_eq!(answer.retrieved.len(), 1);
    }

    #[tokio::test]
    async fn test_zero_top_k_rejected_before_model_calls() {
        let model = chat("Decoded thought: q\n\nPassage: alpha");
        let config = PipelineConfig {
            top_k: 0,
            ..PipelineConfig::default()
        };
        let qa = pipeline_with(MockSource::new(library()), config, Arc::clone(&model));

        let err = qa
            .answer("q", "2203.11618", &[PaperSelection::active("2203.11618")])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTopK));
        assert_eq!(err.stage(), PipelineStage::Retrieval);
        assert!(model.synthesis_prompts.lock().unwrap().is_empty());
        assert_eq!(qa.loader.source.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_inactive_papers_contribute_nothing() {
        let qa = pipeline(MockSource::new(library()), PipelineConfig::default());
        let selections = vec![
            PaperSelection::inactive("2203.11618"),
            PaperSelection::active("2101.00001"),
        ];
        let answer = qa.answer("q", "2203.11618", &selections).await.unwrap();
        assert_eq!(answer.papers, vec!["2101.00001"]);
        assert!(answer.retrieved.iter().all(|r| r.paper_id == "2101.00001"));
    }

    #[tokio::test]
    async fn test_no_active_papers_is_insufficient_corpus() {
        let qa = pipeline(MockSource::new(library()), PipelineConfig::default());
        let err = qa
            .answer("q", "2203.11618", &[PaperSelection::inactive("2101.00001")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InsufficientCorpus { available: 0, .. }
        ));
        assert_eq!(err.stage(), PipelineStage::Retrieval);
    }

    #[tokio::test]
    async fn test_duplicates_loaded_once() {
        let qa = pipeline(MockSource::new(library()), PipelineConfig::default());
        let selections = vec![
            PaperSelection::active("2101.00001"),
            PaperSelection::active("2101.00001"),
        ];
        let answer = qa.answer("q", "2203.11618", &selections).await.unwrap();
        assert_eq!(answer.papers, vec!["2101.00001"]);
        assert_eq!(answer.retrieved.len(), 1);
        // Center paper plus one other
        assert_eq!(qa.loader.source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_reused_across_questions() {
        let qa = pipeline(MockSource::new(library()), PipelineConfig::default());
        let selections = vec![PaperSelection::active("2203.11618")];

        qa.answer("q1", "2203.11618", &selections).await.unwrap();
        qa.answer("q2", "2203.11618", &selections).await.unwrap();
        assert_eq!(qa.loader.source.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(qa.loader.embedder.batches.load(Ordering::SeqCst), 1);

        qa.cache().invalidate("2203.11618").await.unwrap();
        qa.answer("q3", "2203.11618", &selections).await.unwrap();
        assert_eq!(qa.loader.source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_paper_aborts_by_default() {
        let qa = pipeline(MockSource::new(library()), PipelineConfig::default());
        let selections = vec![
            PaperSelection::active("2203.11618"),
            PaperSelection::active("9999.99999"),
        ];
        let err = qa.answer("q", "2203.11618", &selections).await.unwrap_err();
        assert!(matches!(err, PipelineError::DownloadFailure { .. }));
        assert_eq!(err.stage(), PipelineStage::Download);
    }

    #[tokio::test]
    async fn test_missing_paper_skipped_under_skip_policy() {
        let config = PipelineConfig {
            failure_policy: PaperFailurePolicy::Skip,
            ..PipelineConfig::default()
        };
        let qa = pipeline(MockSource::new(library()), config);
        let selections = vec![
            PaperSelection::active("9999.99999"),
            PaperSelection::active("2203.11618"),
        ];
        let answer = qa.answer("q", "2203.11618", &selections).await.unwrap();
        assert_eq!(answer.skipped_papers, vec!["9999.99999"]);
        assert_eq!(answer.papers, vec!["2203.11618"]);
    }

    #[tokio::test]
    async fn test_center_paper_failure_is_fatal_even_when_skipping() {
        let config = PipelineConfig {
            failure_policy: PaperFailurePolicy::Skip,
            ..PipelineConfig::default()
        };
        let qa = pipeline(MockSource::new(library()), config);
        let result = qa
            .answer("q", "9999.99999", &[PaperSelection::active("2203.11618")])
            .await;
        assert!(matches!(result, Err(PipelineError::DownloadFailure { .. })));
    }

    #[tokio::test]
    async fn test_malformed_expansion_is_fatal_after_retry() {
        let model = chat("no blank line here");
        let qa = pipeline_with(
            MockSource::new(library()),
            PipelineConfig::default(),
            Arc::clone(&model),
        );

        let err = qa
            .answer("q", "2203.11618", &[PaperSelection::active("2203.11618")])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MalformedGeneration { .. }));
        assert_eq!(err.stage(), PipelineStage::Expansion);
        assert!(model.synthesis_prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_slow_source_times_out() {
        let mut source = MockSource::new(library());
        source.delay = Some(Duration::from_secs(10));
        let config = PipelineConfig {
            request_timeout: Duration::from_millis(50),
            ..PipelineConfig::default()
        };
        let qa = pipeline(source, config);

        let err = qa
            .answer("q", "2203.11618", &[PaperSelection::active("2203.11618")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Timeout {
                stage: PipelineStage::Download,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_blank_passages_not_embedded() {
        let source = MockSource::new(vec![paper(
            "1111.11111",
            "abs",
            vec![RawSpan::new("   ", "A"), RawSpan::new(long("alpha"), "B")],
        )]);
        let qa = pipeline(source, PipelineConfig::default());
        let processed = qa.loader().load_paper("1111.11111").await.unwrap();
        assert_eq!(processed.passages, vec![long("alpha")]);
        assert_eq!(processed.model_name, "mock-embed");
    }

    #[test]
    fn test_failure_policy_from_str() {
        assert_eq!("Skip".parse::<PaperFailurePolicy>(), Ok(PaperFailurePolicy::Skip));
        assert_eq!("abort".parse::<PaperFailurePolicy>(), Ok(PaperFailurePolicy::Abort));
        assert!("retry".parse::<PaperFailurePolicy>().is_err());
    }
}
