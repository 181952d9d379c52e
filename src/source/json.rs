//! Pre-converted documents on disk.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use super::{file_stem, read_document, PaperSource, SourceResult};
use crate::models::ParsedPaper;

/// Reads `{dir}/{stem}.json` files written by an earlier conversion run.
#[derive(Debug, Clone)]
pub struct JsonDirSource {
    dir: PathBuf,
}

impl JsonDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the document for `paper_id`.
    pub fn path_for(&self, paper_id: &str) -> SourceResult<PathBuf> {
        Ok(self.dir.join(format!("{}.json", file_stem(paper_id)?)))
    }
}

#[async_trait]
impl PaperSource for JsonDirSource {
    async fn fetch(&self, paper_id: &str) -> SourceResult<ParsedPaper> {
        let path = self.path_for(paper_id)?;
        debug!(path = %path.display(), "Reading converted document");
        read_document(&path, paper_id).await
    }

    fn name(&self) -> &str {
        "json-dir"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceError;

    const DOCUMENT: &str = r#"{
        "latex_parse": {
            "abstract": [{"text": "We study "}, {"text": "decoding."}],
            "body_text": [
                {"text": "Intro text.", "section": "Introduction", "eq_spans": []},
                {"text": "Using EQREF1.", "section": null,
                 "eq_spans": [{"ref_id": "EQREF1", "latex": "x^2"}]}
            ]
        }
    }"#;

    #[tokio::test]
    async fn test_fetch_reads_document() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("2203.11618.json"), DOCUMENT).unwrap();

        let source = JsonDirSource::new(dir.path());
        let paper = source.fetch("2203.11618").await.unwrap();

        assert_eq!(paper.paper_id, "2203.11618");
        assert_eq!(paper.abstract_text, "We study decoding.");
        assert_eq!(paper.body_text.len(), 2);
        assert_eq!(paper.body_text[1].section, "");
        assert_eq!(paper.body_text[1].eq_spans[0].latex, "x^2");
    }

    #[tokio::test]
    async fn test_fetch_old_style_id() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hep-th_9901001.json"), DOCUMENT).unwrap();

        let source = JsonDirSource::new(dir.path());
        let paper = source.fetch("hep-th/9901001").await.unwrap();
        assert_eq!(paper.paper_id, "hep-th/9901001");
    }

    #[tokio::test]
    async fn test_fetch_missing() {
        let dir = tempfile::tempdir().unwrap();
        let source = JsonDirSource::new(dir.path());
        assert!(matches!(
            source.fetch("2101.00001").await,
            Err(SourceError::NotFound(_))
        ));
    }
}
