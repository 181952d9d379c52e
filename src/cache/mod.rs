//! Per-paper cache.
//!
//! Keeps parsed and processed papers for the lifetime of the process, keyed
//! by arXiv identifier. Processed papers can additionally be persisted as
//! `{dir}/{stem}.json` so later runs skip download, conversion and
//! embedding. A persisted entry produced by a different embedding model or
//! segmenter configuration is treated as a miss.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::models::{ParsedPaper, ProcessedPaper};
use crate::segment::SegmenterConfig;
use crate::source::{file_stem, SourceError};

/// Errors that can occur in cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Invalid paper id: {0:?}")]
    InvalidPaperId(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

impl From<SourceError> for CacheError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::InvalidPaperId(id) => CacheError::InvalidPaperId(id),
            SourceError::Io(e) => CacheError::Io(e),
            other => CacheError::InvalidPaperId(other.to_string()),
        }
    }
}

/// Cache of parsed and processed papers.
///
/// Cloning shares the underlying maps.
#[derive(Debug, Clone, Default)]
pub struct PaperCache {
    parsed: Arc<RwLock<HashMap<String, Arc<ParsedPaper>>>>,
    processed: Arc<RwLock<HashMap<String, Arc<ProcessedPaper>>>>,
    persist_dir: Option<PathBuf>,
}

impl PaperCache {
    /// In-memory cache only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache that also persists processed papers under `dir`.
    pub fn persistent(dir: impl Into<PathBuf>) -> Self {
        Self {
            persist_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn persist_dir(&self) -> Option<&Path> {
        self.persist_dir.as_deref()
    }

    pub async fn get_parsed(&self, paper_id: &str) -> Option<Arc<ParsedPaper>> {
        self.parsed.read().await.get(paper_id).cloned()
    }

    pub async fn insert_parsed(&self, paper: ParsedPaper) -> Arc<ParsedPaper> {
        let paper = Arc::new(paper);
        self.parsed
            .write()
            .await
            .insert(paper.paper_id.clone(), Arc::clone(&paper));
        paper
    }

    /// Look up a processed paper embedded with `model_name` from passages
    /// cut with `segmenter`.
    ///
    /// Checks memory first, then the persist directory. Entries made with a
    /// different model or segmenter configuration are ignored.
    pub async fn get(
        &self,
        paper_id: &str,
        model_name: &str,
        segmenter: &SegmenterConfig,
    ) -> Option<Arc<ProcessedPaper>> {
        if let Some(paper) = self.processed.read().await.get(paper_id) {
            if paper.produced_by(model_name, segmenter) {
                return Some(Arc::clone(paper));
            }
            debug!(
                paper_id,
                cached_model = %paper.model_name,
                active_model = model_name,
                "Ignoring cached paper built with other settings"
            );
            return None;
        }

        let paper = match self.load(paper_id).await {
            Ok(Some(paper)) => paper,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to read cached paper {}: {}", paper_id, e);
                return None;
            }
        };

        if !paper.produced_by(model_name, segmenter) {
            debug!(
                paper_id,
                cached_model = %paper.model_name,
                active_model = model_name,
                "Ignoring persisted paper built with other settings"
            );
            return None;
        }

        let paper = Arc::new(paper);
        self.processed
            .write()
            .await
            .insert(paper_id.to_string(), Arc::clone(&paper));
        Some(paper)
    }

    /// Store a processed paper, persisting it when a directory is set.
    ///
    /// A failed write is logged; the in-memory entry is kept either way.
    pub async fn insert(&self, paper: ProcessedPaper) -> Arc<ProcessedPaper> {
        let paper = Arc::new(paper);
        self.processed
            .write()
            .await
            .insert(paper.paper_id.clone(), Arc::clone(&paper));

        if let Err(e) = self.store(&paper).await {
            warn!("Failed to persist paper {}: {}", paper.paper_id, e);
        }
        paper
    }

    /// Forget one paper, in memory and on disk.
    pub async fn invalidate(&self, paper_id: &str) -> CacheResult<()> {
        self.parsed.write().await.remove(paper_id);
        self.processed.write().await.remove(paper_id);

        if let Some(path) = self.path_for(paper_id)? {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "Removed cached paper"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Forget every paper, in memory and on disk.
    pub async fn clear(&self) -> CacheResult<()> {
        self.parsed.write().await.clear();
        self.processed.write().await.clear();

        let Some(dir) = &self.persist_dir else {
            return Ok(());
        };

        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }

    /// Identifiers of processed papers currently held in memory.
    pub async fn paper_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.processed.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn path_for(&self, paper_id: &str) -> CacheResult<Option<PathBuf>> {
        let Some(dir) = &self.persist_dir else {
            return Ok(None);
        };
        Ok(Some(dir.join(format!("{}.json", file_stem(paper_id)?))))
    }

    async fn load(&self, paper_id: &str) -> CacheResult<Option<ProcessedPaper>> {
        let Some(path) = self.path_for(paper_id)? else {
            return Ok(None);
        };

        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let paper: ProcessedPaper = serde_json::from_str(&data)?;
        if paper.passages.len() != paper.embeddings.len() {
            warn!("Cached paper {} has misaligned embeddings, ignoring", paper_id);
            return Ok(None);
        }
        debug!(path = %path.display(), passages = paper.len(), "Loaded cached paper");
        Ok(Some(paper))
    }

    /// Atomic write via temp file + rename.
    async fn store(&self, paper: &ProcessedPaper) -> CacheResult<()> {
        let Some(path) = self.path_for(&paper.paper_id)? else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let data = serde_json::to_vec(paper)?;
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        debug!(path = %path.display(), bytes = data.len(), "Persisted paper");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processed(id: &str, model: &str) -> ProcessedPaper {
        ProcessedPaper::new(
            id.to_string(),
            "Abstract.".to_string(),
            vec!["p0".to_string(), "p1".to_string()],
            vec![vec![1.0, 0.0], vec![0.0, 1.0]],
            model.to_string(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_memory_round_trip() {
        let cache = PaperCache::new();
        assert!(cache.get("2203.11618", "m", &SegmenterConfig::default()).await.is_none());

        cache.insert(processed("2203.11618", "m")).await;
        let hit = cache.get("2203.11618", "m", &SegmenterConfig::default()).await.unwrap();
        assert_eq!(hit.passages.len(), 2);
        assert_eq!(cache.paper_ids().await, vec!["2203.11618".to_string()]);
    }

    #[tokio::test]
    async fn test_model_mismatch_is_miss() {
        let cache = PaperCache::new();
        cache.insert(processed("2203.11618", "ada")).await;
        assert!(cache.get("2203.11618", "bge", &SegmenterConfig::default()).await.is_none());
    }

    #[tokio::test]
    async fn test_segmenter_mismatch_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let source_compatible = SegmenterConfig {
            chunk_policy: crate::segment::ChunkPolicy::SourceCompatible,
            ..SegmenterConfig::default()
        };

        let cache = PaperCache::persistent(dir.path());
        cache.insert(processed("2203.11618", "m")).await;
        assert!(cache.get("2203.11618", "m", &source_compatible).await.is_none());

        let fresh = PaperCache::persistent(dir.path());
        assert!(fresh.get("2203.11618", "m", &source_compatible).await.is_none());
        assert!(fresh
            .get("2203.11618", "m", &SegmenterConfig::default())
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_parsed_entries() {
        let cache = PaperCache::new();
        let paper = ParsedPaper {
            paper_id: "1".to_string(),
            abstract_text: "abs".to_string(),
            body_text: Vec::new(),
        };
        cache.insert_parsed(paper.clone()).await;
        assert_eq!(*cache.get_parsed("1").await.unwrap(), paper);

        cache.invalidate("1").await.unwrap();
        assert!(cache.get_parsed("1").await.is_none());
    }

    #[tokio::test]
    async fn test_persisted_entry_survives_new_cache() {
        let dir = tempfile::tempdir().unwrap();

        let cache = PaperCache::persistent(dir.path());
        cache.insert(processed("hep-th/9901001", "m")).await;
        assert!(dir.path().join("hep-th_9901001.json").exists());
        assert!(!dir.path().join("hep-th_9901001.json.tmp").exists());

        let fresh = PaperCache::persistent(dir.path());
        let hit = fresh.get("hep-th/9901001", "m", &SegmenterConfig::default()).await.unwrap();
        assert_eq!(*hit, processed("hep-th/9901001", "m"));

        let other_model = PaperCache::persistent(dir.path());
        assert!(other_model.get("hep-th/9901001", "other", &SegmenterConfig::default()).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PaperCache::persistent(dir.path());
        cache.insert(processed("2203.11618", "m")).await;

        cache.invalidate("2203.11618").await.unwrap();
        assert!(cache.get("2203.11618", "m", &SegmenterConfig::default()).await.is_none());
        assert!(!dir.path().join("2203.11618.json").exists());

        // Invalidating an absent entry is fine
        cache.invalidate("2203.11618").await.unwrap();
    }

    #[tokio::test]
    async fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PaperCache::persistent(dir.path());
        cache.insert(processed("a1", "m")).await;
        cache.insert(processed("b2", "m")).await;
        std::fs::write(dir.path().join("notes.txt"), "keep").unwrap();

        cache.clear().await.unwrap();
        assert!(cache.paper_ids().await.is_empty());
        assert!(PaperCache::persistent(dir.path()).get("a1", "m", &SegmenterConfig::default()).await.is_none());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x1.json"), "not json").unwrap();
        let cache = PaperCache::persistent(dir.path());
        assert!(cache.get("x1", "m", &SegmenterConfig::default()).await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_id_rejected_on_disk_access() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PaperCache::persistent(dir.path());
        assert!(matches!(
            cache.invalidate("../x").await,
            Err(CacheError::InvalidPaperId(_))
        ));
    }
}
