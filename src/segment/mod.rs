//! Passage segmentation.
//!
//! Turns the body paragraphs of a parsed paper into passages suitable for
//! embedding. Segmentation runs in three steps:
//!
//! 1. Equation placeholders in each span are replaced with `$latex$`.
//! 2. Spans are merged left to right: a span joins the previous passage when
//!    it belongs to the same section, or when it is short and the previous
//!    passage still has room.
//! 3. Passages that grew too long are cut into fixed-size chunks.
//!
//! All lengths are counted in characters, never bytes, and chunk boundaries
//! always fall on character boundaries.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{Passage, RawSpan};

/// Spans shorter than this are merged into the previous passage.
pub const DEFAULT_SHORT_SPAN: usize = 300;

/// A short span is only merged while the previous passage is below this.
pub const DEFAULT_MERGE_CEILING: usize = 1800;

/// Passages at or above this length are chunked.
pub const DEFAULT_SPLIT_THRESHOLD: usize = 1800;

/// Maximum chunk length for passages that get split.
pub const DEFAULT_MAX_CHUNK: usize = 1200;

/// How over-long passages are cut into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkPolicy {
    /// Consecutive chunks of `max_chunk` characters starting at offset 0,
    /// covering the whole passage with no gaps or overlaps.
    #[default]
    Contiguous,

    /// Chunk offsets are drawn from `length..max_chunk`. Because the split
    /// threshold exceeds the chunk size this range is empty, and every
    /// over-long passage produces no output at all.
    SourceCompatible,
}

impl std::str::FromStr for ChunkPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "contiguous" => Ok(ChunkPolicy::Contiguous),
            "source-compatible" | "source_compatible" => Ok(ChunkPolicy::SourceCompatible),
            other => Err(format!("unknown chunk policy: {other}")),
        }
    }
}

/// Thresholds controlling the merge and split passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmenterConfig {
    pub short_span: usize,
    pub merge_ceiling: usize,
    pub split_threshold: usize,
    pub max_chunk: usize,
    pub chunk_policy: ChunkPolicy,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            short_span: DEFAULT_SHORT_SPAN,
            merge_ceiling: DEFAULT_MERGE_CEILING,
            split_threshold: DEFAULT_SPLIT_THRESHOLD,
            max_chunk: DEFAULT_MAX_CHUNK,
            chunk_policy: ChunkPolicy::Contiguous,
        }
    }
}

/// Splits raw body spans into passages.
#[derive(Debug, Clone, Default)]
pub struct Segmenter {
    config: SegmenterConfig,
}

impl Segmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    /// Segment a paper body into passages, in traversal order.
    pub fn segment(&self, spans: &[RawSpan]) -> Vec<Passage> {
        let merged = self.merge(spans);
        let merged_count = merged.len();
        let passages = self.split(merged);

        debug!(
            spans = spans.len(),
            merged = merged_count,
            passages = passages.len(),
            policy = ?self.config.chunk_policy,
            "Segmented paper body"
        );

        passages
    }

    /// Merge pass: one left-to-right traversal over substituted spans.
    pub fn merge(&self, spans: &[RawSpan]) -> Vec<Passage> {
        let mut merged: Vec<Passage> = Vec::new();
        // Character length of `merged.last()`
        let mut last_len = 0usize;
        let mut prev_section: Option<&str> = None;

        for span in spans {
            let text = substitute_equations(span);
            let text_len = char_len(&text);
            let same_section = prev_section == Some(span.section.as_str());

            match merged.last_mut() {
                Some(last)
                    if same_section
                        || (text_len < self.config.short_span
                            && last_len < self.config.merge_ceiling) =>
                {
                    last.push_str(&text);
                    last_len += text_len;
                }
                _ => {
                    merged.push(text);
                    last_len = text_len;
                }
            }

            prev_section = Some(span.section.as_str());
        }

        merged
    }

    /// Split pass: keep short passages, chunk long ones per the policy.
    pub fn split(&self, merged: Vec<Passage>) -> Vec<Passage> {
        let mut passages = Vec::with_capacity(merged.len());

        for passage in merged {
            let len = char_len(&passage);
            if len < self.config.split_threshold {
                passages.push(passage);
                continue;
            }

            match self.config.chunk_policy {
                ChunkPolicy::Contiguous => {
                    passages.extend(chunk_contiguous(&passage, self.config.max_chunk));
                }
                ChunkPolicy::SourceCompatible => {
                    let chunks = chunk_source_compatible(&passage, self.config.max_chunk);
                    if chunks.is_empty() {
                        debug!(length = len, "Dropped long passage");
                    }
                    passages.extend(chunks);
                }
            }
        }

        passages
    }
}

/// Segment spans with the default thresholds and chunk policy.
pub fn segment(spans: &[RawSpan]) -> Vec<Passage> {
    Segmenter::default().segment(spans)
}

/// Replace every equation placeholder in the span with `$latex$`.
///
/// Placeholders are substituted in `eq_spans` order. Empty placeholders are
/// ignored.
pub fn substitute_equations(span: &RawSpan) -> String {
    span.eq_spans
        .iter()
        .filter(|eq| !eq.ref_id.is_empty())
        .fold(span.text.clone(), |text, eq| {
            text.replace(&eq.ref_id, &format!("${}$", eq.latex))
        })
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Byte offset of the `n`th character, or the string length past the end.
fn byte_offset(text: &str, n: usize) -> usize {
    text.char_indices()
        .nth(n)
        .map(|(offset, _)| offset)
        .unwrap_or(text.len())
}

fn chunk_contiguous(passage: &str, max_chunk: usize) -> Vec<Passage> {
    let max_chunk = max_chunk.max(1);
    let mut chunks = Vec::new();
    let mut rest = passage;

    while !rest.is_empty() {
        let end = byte_offset(rest, max_chunk);
        chunks.push(rest[..end].to_string());
        rest = &rest[end..];
    }

    chunks
}

fn chunk_source_compatible(passage: &str, max_chunk: usize) -> Vec<Passage> {
    let len = char_len(passage);
    (len..max_chunk)
        .map(|start| {
            let from = byte_offset(passage, start);
            let to = byte_offset(passage, start + max_chunk);
            passage[from..to].to_string()
        })
        .collect()
}
