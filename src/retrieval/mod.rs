//! Passage retrieval and ranking.
//!
//! Ranks corpus embeddings against a query embedding by raw inner product
//! and selects the top-k. Vectors are not normalized here: when the
//! embedding service returns unit vectors the inner product equals cosine
//! similarity, otherwise vector magnitude influences the ranking.
//!
//! Ties are broken by corpus position, lowest first.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{Passage, ProcessedPaper, RetrievedPassage};

/// Default number of passages retrieved per question.
pub const DEFAULT_TOP_K: usize = 3;

/// Errors that can occur during retrieval.
#[derive(Debug, Error, PartialEq)]
pub enum RetrievalError {
    /// The corpus holds fewer passages than requested
    #[error("Insufficient corpus: requested {requested} passages, {available} available")]
    InsufficientCorpus { requested: usize, available: usize },

    /// A corpus vector does not match the query's dimension
    #[error("Embedding {index} has dimension {found}, query has {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },
}

/// Result type for retrieval operations.
pub type RetrievalResult<T> = Result<T, RetrievalError>;

/// Inner product of two equal-length vectors.
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Euclidean length of a vector.
pub fn vector_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Score every corpus vector against the query.
pub fn score_all(corpus: &[Vec<f32>], query: &[f32]) -> RetrievalResult<Vec<f32>> {
    corpus
        .iter()
        .enumerate()
        .map(|(index, embedding)| {
            if embedding.len() != query.len() {
                return Err(RetrievalError::DimensionMismatch {
                    index,
                    expected: query.len(),
                    found: embedding.len(),
                });
            }
            Ok(dot_product(embedding, query))
        })
        .collect()
}

/// Indices and scores ordered by descending score, stable on ties.
fn rank(scores: &[f32]) -> Vec<(usize, f32)> {
    let mut ranked: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
    // sort_by is stable: equal scores keep ascending index order
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked
}

/// Return the indices of the `k` corpus vectors most similar to the query.
///
/// # Errors
/// Returns `RetrievalError::InsufficientCorpus` if the corpus is empty or
/// holds fewer than `k` vectors, and `RetrievalError::DimensionMismatch` if
/// a corpus vector has a different length than the query.
pub fn retrieve(corpus: &[Vec<f32>], query: &[f32], k: usize) -> RetrievalResult<Vec<usize>> {
    Ok(retrieve_scored(corpus, query, k)?
        .into_iter()
        .map(|(index, _)| index)
        .collect())
}

/// Like [`retrieve`], also returning each selected vector's score.
pub fn retrieve_scored(
    corpus: &[Vec<f32>],
    query: &[f32],
    k: usize,
) -> RetrievalResult<Vec<(usize, f32)>> {
    if corpus.is_empty() || corpus.len() < k {
        return Err(RetrievalError::InsufficientCorpus {
            requested: k,
            available: corpus.len(),
        });
    }

    let scores = score_all(corpus, query)?;
    let mut ranked = rank(&scores);
    ranked.truncate(k);
    Ok(ranked)
}

/// Retrieve at most `k` vectors, degrading `k` to the corpus size.
///
/// Only an empty corpus is an error.
pub fn retrieve_up_to(
    corpus: &[Vec<f32>],
    query: &[f32],
    k: usize,
) -> RetrievalResult<Vec<(usize, f32)>> {
    if corpus.is_empty() {
        return Err(RetrievalError::InsufficientCorpus {
            requested: k,
            available: 0,
        });
    }

    let effective = k.min(corpus.len());
    if effective < k {
        warn!(
            requested = k,
            available = corpus.len(),
            "Corpus smaller than top-k, retrieving fewer passages"
        );
    }
    retrieve_scored(corpus, query, effective)
}

/// Passages and embeddings of several papers, concatenated for one query.
///
/// Papers appear in the order they were supplied, so a corpus index maps
/// back to the same paper and local passage on every run.
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    passages: Vec<Passage>,
    embeddings: Vec<Vec<f32>>,
    /// (paper id, index within that paper) for every corpus entry
    origins: Vec<(String, usize)>,
    papers: Vec<String>,
}

impl Corpus {
    /// Concatenate processed papers in the given order.
    pub fn from_papers(papers: &[Arc<ProcessedPaper>]) -> Self {
        let mut corpus = Corpus::default();
        for paper in papers {
            corpus.push_paper(paper);
        }
        debug!(
            papers = corpus.papers.len(),
            passages = corpus.len(),
            "Assembled retrieval corpus"
        );
        corpus
    }

    fn push_paper(&mut self, paper: &ProcessedPaper) {
        for (local, (passage, embedding)) in
            paper.passages.iter().zip(paper.embeddings.iter()).enumerate()
        {
            self.passages.push(passage.clone());
            self.embeddings.push(embedding.clone());
            self.origins.push((paper.paper_id.clone(), local));
        }
        self.papers.push(paper.paper_id.clone());
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    pub fn passages(&self) -> &[Passage] {
        &self.passages
    }

    pub fn embeddings(&self) -> &[Vec<f32>] {
        &self.embeddings
    }

    /// Paper ids in corpus order.
    pub fn papers(&self) -> &[String] {
        &self.papers
    }

    /// Paper id and local index of a corpus entry.
    pub fn origin(&self, index: usize) -> Option<(&str, usize)> {
        self.origins
            .get(index)
            .map(|(paper, local)| (paper.as_str(), *local))
    }

    /// Retrieve up to `k` passages for the query embedding.
    pub fn retrieve(&self, query: &[f32], k: usize) -> RetrievalResult<Vec<RetrievedPassage>> {
        let ranked = retrieve_up_to(&self.embeddings, query, k)?;

        Ok(ranked
            .into_iter()
            .map(|(index, score)| {
                let (paper_id, local_index) = &self.origins[index];
                RetrievedPassage {
                    paper_id: paper_id.clone(),
                    local_index: *local_index,
                    corpus_index: index,
                    score,
                    text: self.passages[index].clone(),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn five_vectors() -> Vec<Vec<f32>> {
        vec![
            vec![0.1, 0.0, 0.0],
            vec![0.9, 0.1, 0.0],
            vec![0.5, 0.5, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![2.0, 0.0, 0.0],
        ]
    }

    fn paper(id: &str, passages: &[&str], embeddings: Vec<Vec<f32>>) -> Arc<ProcessedPaper> {
        Arc::new(
            ProcessedPaper::new(
                id.to_string(),
                format!("abstract of {id}"),
                passages.iter().map(|p| p.to_string()).collect(),
                embeddings,
                "mock".to_string(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_dot_product() {
        assert_eq!(dot_product(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]), 32.0);
        assert_eq!(dot_product(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn test_vector_norm() {
        assert!((vector_norm(&[3.0, 4.0]) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_retrieve_top_k_descending() {
        let corpus = five_vectors();
        let query = vec![1.0, 0.0, 0.0];

        let indices = retrieve(&corpus, &query, 3).unwrap();
        assert_eq!(indices, vec![4, 1, 2]);

        let scored = retrieve_scored(&corpus, &query, 5).unwrap();
        assert_eq!(scored.len(), 5);
        for pair in scored.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
    }

    #[test]
    fn test_magnitude_affects_ranking() {
        // Index 4 points the same way as index 0 but is longer.
        let corpus = five_vectors();
        let indices = retrieve(&corpus, &[1.0, 0.0, 0.0], 1).unwrap();
        assert_eq!(indices, vec![4]);
    }

    #[test]
    fn test_ties_keep_index_order() {
        let corpus = vec![
            vec![0.0, 1.0],
            vec![1.0, 0.0],
            vec![0.2, 0.0],
            vec![1.0, 0.0],
            vec![0.0, 0.0],
        ];
        let indices = retrieve(&corpus, &[1.0, 0.0], 3).unwrap();
        assert_eq!(indices, vec![1, 3, 2]);
    }

    #[test]
    fn test_nan_scores_do_not_break_ranking() {
        let mut corpus: Vec<Vec<f32>> = (0..40).map(|i| vec![(i % 7) as f32, 0.0]).collect();
        corpus[3] = vec![f32::NAN, 0.0];
        corpus[17] = vec![f32::NAN, 0.0];

        let ranked = retrieve_scored(&corpus, &[1.0, 0.0], 40).unwrap();
        assert_eq!(ranked.len(), 40);

        let finite: Vec<(usize, f32)> = ranked.into_iter().filter(|(_, s)| !s.is_nan()).collect();
        assert_eq!(finite.len(), 38);
        assert!(finite.windows(2).all(|w| w[0].1 > w[1].1 || (w[0].1 == w[1].1 && w[0].0 < w[1].0)));
    }

    #[test]
    fn test_insufficient_corpus() {
        let result = retrieve(&[vec![1.0, 0.0]], &[1.0, 0.0], 3);
        assert_eq!(
            result,
            Err(RetrievalError::InsufficientCorpus {
                requested: 3,
                available: 1
            })
        );
    }

    #[test]
    fn test_empty_corpus_is_insufficient() {
        let result = retrieve(&[], &[1.0], 0);
        assert!(matches!(result, Err(RetrievalError::InsufficientCorpus { .. })));
        assert!(retrieve_up_to(&[], &[1.0], 3).is_err());
    }

    #[test]
    fn test_dimension_mismatch() {
        let corpus = vec![vec![1.0, 0.0], vec![1.0]];
        let result = retrieve(&corpus, &[1.0, 0.0], 1);
        assert_eq!(
            result,
            Err(RetrievalError::DimensionMismatch {
                index: 1,
                expected: 2,
                found: 1
            })
        );
    }

    #[test]
    fn test_retrieve_up_to_degrades_k() {
        let ranked = retrieve_up_to(&[vec![1.0], vec![2.0]], &[1.0], 3).unwrap();
        assert_eq!(ranked.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![1, 0]);
    }

    #[test]
    fn test_corpus_preserves_paper_order_and_origins() {
        let a = paper("a", &["a0", "a1"], vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        let b = paper("b", &["b0"], vec![vec![0.5, 0.5]]);

        let corpus = Corpus::from_papers(&[b.clone(), a.clone()]);
        assert_eq!(corpus.len(), 3);
        assert_eq!(corpus.papers(), &["b".to_string(), "a".to_string()]);
        assert_eq!(corpus.passages(), &["b0", "a0", "a1"]);
        assert_eq!(corpus.origin(0), Some(("b", 0)));
        assert_eq!(corpus.origin(2), Some(("a", 1)));
        assert_eq!(corpus.origin(3), None);
    }

    #[test]
    fn test_corpus_retrieve_maps_provenance() {
        let a = paper("a", &["a0", "a1"], vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        let b = paper("b", &["b0"], vec![vec![0.0, 3.0]]);
        let corpus = Corpus::from_papers(&[a, b]);

        let retrieved = corpus.retrieve(&[0.0, 1.0], 2).unwrap();
        assert_eq!(retrieved.len(), 2);
        assert_eq!(retrieved[0].paper_id, "b");
        assert_eq!(retrieved[0].local_index, 0);
        assert_eq!(retrieved[0].corpus_index, 2);
        assert_eq!(retrieved[0].text, "b0");
        assert_eq!(retrieved[1].text, "a1");
        assert_eq!(retrieved[1].score, 1.0);
    }
}
