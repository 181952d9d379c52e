//! Core data models for the paper QA system.
//!
//! This module contains the data structures shared across the pipeline:
//! parsed paper bodies as produced by the external LaTeX converter, the
//! per-paper processed form kept in the cache, and the results returned to
//! callers after a question has been answered.

use serde::{Deserialize, Deserializer, Serialize};

use crate::segment::SegmenterConfig;

/// A passage of paper prose, with equation references already substituted.
///
/// Passages carry no identity of their own; within a [`ProcessedPaper`] or a
/// combined corpus they are identified by position only.
pub type Passage = String;

/// An equation reference embedded in a span's text.
///
/// The converter leaves an opaque `ref_id` in the paragraph text wherever an
/// inline equation appeared, and records the equation's LaTeX source here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EqSpan {
    /// Placeholder token as it appears in the span text
    pub ref_id: String,

    /// LaTeX source of the equation (without `$` delimiters)
    pub latex: String,
}

/// One structural unit of a paper body (typically a paragraph).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawSpan {
    /// Paragraph text containing equation placeholders
    pub text: String,

    /// Section label; spans outside any section carry an empty label
    #[serde(default, deserialize_with = "null_as_empty")]
    pub section: String,

    /// Inline equations referenced from `text`
    #[serde(default)]
    pub eq_spans: Vec<EqSpan>,
}

impl RawSpan {
    /// Create a span without equation references.
    pub fn new(text: impl Into<String>, section: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            section: section.into(),
            eq_spans: Vec::new(),
        }
    }

    /// Attach an equation reference to this span.
    pub fn with_equation(mut self, ref_id: impl Into<String>, latex: impl Into<String>) -> Self {
        self.eq_spans.push(EqSpan {
            ref_id: ref_id.into(),
            latex: latex.into(),
        });
        self
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// A fragment of the abstract as emitted by the converter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbstractFragment {
    pub text: String,
}

/// The `latex_parse` section of the converter output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatexParse {
    #[serde(rename = "abstract", default)]
    pub abstract_fragments: Vec<AbstractFragment>,

    #[serde(default)]
    pub body_text: Vec<RawSpan>,
}

/// Top-level document produced by the external LaTeX-to-JSON converter.
///
/// Only the fields the pipeline consumes are modelled; everything else in the
/// converter output is ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertedDocument {
    pub latex_parse: LatexParse,
}

/// A paper after download and parsing, before segmentation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedPaper {
    /// arXiv identifier (e.g. "2203.11618")
    pub paper_id: String,

    /// Abstract text, fragments concatenated without separator
    pub abstract_text: String,

    /// Body paragraphs in document order
    pub body_text: Vec<RawSpan>,
}

impl ParsedPaper {
    /// Build a parsed paper from converter output.
    pub fn from_document(paper_id: impl Into<String>, document: ConvertedDocument) -> Self {
        let abstract_text = document
            .latex_parse
            .abstract_fragments
            .iter()
            .map(|fragment| fragment.text.as_str())
            .collect::<String>();

        Self {
            paper_id: paper_id.into(),
            abstract_text,
            body_text: document.latex_parse.body_text,
        }
    }
}

/// A segmented and embedded paper, ready to join a retrieval corpus.
///
/// `embeddings[i]` is the embedding of `passages[i]`; the constructor
/// enforces that both sequences have the same length.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessedPaper {
    pub paper_id: String,
    pub abstract_text: String,
    pub passages: Vec<Passage>,
    pub embeddings: Vec<Vec<f32>>,

    /// Embedding model that produced `embeddings`
    pub model_name: String,

    /// Segmenter settings that produced `passages`
    #[serde(default)]
    pub segmenter: SegmenterConfig,
}

impl ProcessedPaper {
    /// Assemble a processed paper, returning `None` if passages and
    /// embeddings are not aligned.
    pub fn new(
        paper_id: String,
        abstract_text: String,
        passages: Vec<Passage>,
        embeddings: Vec<Vec<f32>>,
        model_name: String,
    ) -> Option<Self> {
        if passages.len() != embeddings.len() {
            return None;
        }
        Some(Self {
            paper_id,
            abstract_text,
            passages,
            embeddings,
            model_name,
            segmenter: SegmenterConfig::default(),
        })
    }

    /// Record the segmenter settings the passages were cut with.
    pub fn with_segmenter(mut self, segmenter: SegmenterConfig) -> Self {
        self.segmenter = segmenter;
        self
    }

    /// Whether this paper was built by `model_name` from passages cut with
    /// `segmenter`.
    pub fn produced_by(&self, model_name: &str, segmenter: &SegmenterConfig) -> bool {
        self.model_name == model_name && self.segmenter == *segmenter
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }
}

/// One row of the paper table: a paper identifier and whether its passages
/// take part in retrieval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaperSelection {
    pub paper_id: String,
    pub activated: bool,
}

impl PaperSelection {
    pub fn active(paper_id: impl Into<String>) -> Self {
        Self {
            paper_id: paper_id.into(),
            activated: true,
        }
    }

    pub fn inactive(paper_id: impl Into<String>) -> Self {
        Self {
            paper_id: paper_id.into(),
            activated: false,
        }
    }
}

/// A passage selected by the retriever, with its provenance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievedPassage {
    /// Paper the passage came from
    pub paper_id: String,

    /// Position of the passage within its paper's passage list
    pub local_index: usize,

    /// Position of the passage within the combined query corpus
    pub corpus_index: usize,

    /// Raw dot-product score against the query embedding
    pub score: f32,

    pub text: Passage,
}

/// Refined question and fabricated passage produced by query expansion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Expansion {
    pub refined_question: String,
    pub fabricated_passage: String,
}

/// The complete outcome of one question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub query: String,
    pub refined_question: String,
    pub fabricated_passage: String,
    pub retrieved: Vec<RetrievedPassage>,
    pub answer: String,

    /// Papers that contributed passages, in corpus order
    pub papers: Vec<String>,

    /// Papers dropped under the skip failure policy
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_papers: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_span_deserializes_converter_shape() {
        let json = r#"{
            "text": "See EQREF0 for details",
            "cite_spans": [],
            "section": "Method",
            "eq_spans": [{"ref_id": "EQREF0", "latex": "x^2", "start": 4, "end": 10}]
        }"#;
        let span: RawSpan = serde_json::from_str(json).unwrap();
        assert_eq!(span.section, "Method");
        assert_eq!(span.eq_spans.len(), 1);
        assert_eq!(span.eq_spans[0].latex, "x^2");
    }

    #[test]
    fn test_raw_span_null_section_and_missing_equations() {
        let span: RawSpan = serde_json::from_str(r#"{"text": "t", "section": null}"#).unwrap();
        assert_eq!(span.section, "");
        assert!(span.eq_spans.is_empty());
    }

    #[test]
    fn test_parsed_paper_concatenates_abstract() {
        let json = r#"{
            "paper_id": "x",
            "latex_parse": {
                "abstract": [{"text": "First part. "}, {"text": "Second part."}],
                "body_text": [{"text": "Body", "section": "Intro", "eq_spans": []}]
            }
        }"#;
        let document: ConvertedDocument = serde_json::from_str(json).unwrap();
        let paper = ParsedPaper::from_document("2203.11618", document);
        assert_eq!(paper.abstract_text, "First part. Second part.");
        assert_eq!(paper.body_text.len(), 1);
        assert_eq!(paper.paper_id, "2203.11618");
    }

    #[test]
    fn test_processed_paper_rejects_misaligned_embeddings() {
        let aligned = ProcessedPaper::new(
            "p".to_string(),
            String::new(),
            vec!["a".to_string(), "b".to_string()],
            vec![vec![1.0], vec![2.0]],
            "m".to_string(),
        );
        assert_eq!(aligned.map(|p| p.len()), Some(2));

        let misaligned = ProcessedPaper::new(
            "p".to_string(),
            String::new(),
            vec!["a".to_string()],
            vec![],
            "m".to_string(),
        );
        assert!(misaligned.is_none());
    }

    #[test]
    fn test_produced_by_checks_model_and_segmenter() {
        let paper = ProcessedPaper::new(
            "p".to_string(),
            String::new(),
            vec!["a".to_string()],
            vec![vec![1.0]],
            "m".to_string(),
        )
        .unwrap();
        let contiguous = SegmenterConfig::default();
        let source_compatible = SegmenterConfig {
            chunk_policy: crate::segment::ChunkPolicy::SourceCompatible,
            ..SegmenterConfig::default()
        };

        assert!(paper.produced_by("m", &contiguous));
        assert!(!paper.produced_by("other", &contiguous));
        assert!(!paper.produced_by("m", &source_compatible));

        let paper = paper.with_segmenter(source_compatible);
        assert!(paper.produced_by("m", &source_compatible));
    }

    #[test]
    fn test_processed_paper_without_segmenter_field_loads_default() {
        let json = r#"{
            "paper_id": "p",
            "abstract_text": "",
            "passages": ["a"],
            "embeddings": [[1.0]],
            "model_name": "m"
        }"#;
        let paper: ProcessedPaper = serde_json::from_str(json).unwrap();
        assert_eq!(paper.segmenter, SegmenterConfig::default());
    }
}
