//! arXiv e-print source.
//!
//! Downloads the LaTeX source archive of a paper from arXiv and runs an
//! external LaTeX-to-JSON converter over it. The converter is any command
//! that reads the archive and writes `{output_dir}/{stem}.json` in the
//! `latex_parse` layout; by default the `doc2json` tex2json processor.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{file_stem, read_document, PaperSource, SourceError, SourceResult};
use crate::models::ParsedPaper;

/// Default arXiv host.
pub const DEFAULT_ARXIV_URL: &str = "https://arxiv.org";

/// Default converter invocation.
pub const DEFAULT_CONVERTER: &str =
    "python -m doc2json.tex2json.process_tex -i {input} -t {temp_dir} -o {output_dir}";

const USER_AGENT: &str = concat!("paper-qa/", env!("CARGO_PKG_VERSION"));

/// Longest stderr excerpt kept in a parse failure message.
const STDERR_EXCERPT: usize = 2000;

/// External converter command with `{input}`, `{output_dir}`, `{temp_dir}`
/// and `{id}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConverterCommand {
    program: String,
    args: Vec<String>,
}

impl ConverterCommand {
    /// Parse a whitespace-separated command line.
    pub fn parse(command_line: &str) -> SourceResult<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| SourceError::ParseFailure {
            paper_id: String::new(),
            message: "converter command is empty".to_string(),
        })?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    /// Program and arguments with placeholders filled in.
    pub fn render(
        &self,
        input: &Path,
        output_dir: &Path,
        temp_dir: &Path,
        paper_id: &str,
    ) -> (String, Vec<String>) {
        let input = input.to_string_lossy();
        let output_dir = output_dir.to_string_lossy();
        let temp_dir = temp_dir.to_string_lossy();

        let args = self
            .args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input)
                    .replace("{output_dir}", &output_dir)
                    .replace("{temp_dir}", &temp_dir)
                    .replace("{id}", paper_id)
            })
            .collect();

        (self.program.clone(), args)
    }
}

impl Default for ConverterCommand {
    fn default() -> Self {
        // DEFAULT_CONVERTER is non-empty
        let mut parts = DEFAULT_CONVERTER.split_whitespace().map(str::to_string);
        Self {
            program: parts.next().unwrap_or_default(),
            args: parts.collect(),
        }
    }
}

/// Fetches papers from arXiv and converts them locally.
#[derive(Debug, Clone)]
pub struct ArxivSource {
    client: reqwest::Client,
    base_url: String,

    /// Holds downloaded archives, converter scratch space and output
    work_dir: PathBuf,

    converter: ConverterCommand,
}

impl ArxivSource {
    /// Create a source that keeps its files under `work_dir`.
    pub fn new(work_dir: impl Into<PathBuf>) -> SourceResult<Self> {
        Self::with_timeout(work_dir, Duration::from_secs(120))
    }

    /// Create a source whose downloads time out after `timeout`.
    pub fn with_timeout(work_dir: impl Into<PathBuf>, timeout: Duration) -> SourceResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::DownloadFailure {
                paper_id: String::new(),
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url: DEFAULT_ARXIV_URL.to_string(),
            work_dir: work_dir.into(),
            converter: ConverterCommand::default(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_converter(mut self, converter: ConverterCommand) -> Self {
        self.converter = converter;
        self
    }

    fn output_dir(&self) -> PathBuf {
        self.work_dir.join("output")
    }

    fn temp_dir(&self) -> PathBuf {
        self.work_dir.join("tmp")
    }

    /// Download the e-print archive to `{work_dir}/{stem}.gz`.
    async fn download(&self, paper_id: &str, stem: &str) -> SourceResult<PathBuf> {
        let url = format!("{}/e-print/{}", self.base_url, paper_id);
        let failure = |message: String| SourceError::DownloadFailure {
            paper_id: paper_id.to_string(),
            message,
        };

        info!("Downloading {}", url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| failure(e.to_string()))?;

        if !response.status().is_success() {
            return Err(failure(format!("{url} returned {}", response.status())));
        }

        let bytes = response.bytes().await.map_err(|e| failure(e.to_string()))?;
        if bytes.is_empty() {
            return Err(failure(format!("{url} returned an empty body")));
        }

        let archive = self.work_dir.join(format!("{stem}.gz"));
        tokio::fs::write(&archive, &bytes).await?;
        debug!(bytes = bytes.len(), path = %archive.display(), "Saved e-print");
        Ok(archive)
    }

    /// Run the converter over a downloaded archive.
    async fn convert(&self, paper_id: &str, archive: &Path) -> SourceResult<PathBuf> {
        let output_dir = self.output_dir();
        let temp_dir = self.temp_dir();
        tokio::fs::create_dir_all(&output_dir).await?;
        tokio::fs::create_dir_all(&temp_dir).await?;

        let (program, args) = self.converter.render(archive, &output_dir, &temp_dir, paper_id);
        debug!(program = %program, args = ?args, "Running converter");

        let failure = |message: String| SourceError::ParseFailure {
            paper_id: paper_id.to_string(),
            message,
        };

        // Dropping the future on timeout must not leave the converter running
        let output = Command::new(&program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| failure(format!("failed to run converter '{program}': {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failure(format!(
                "converter exited with {}: {}",
                output.status,
                tail(stderr.trim(), STDERR_EXCERPT)
            )));
        }

        let stem = archive
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(output_dir.join(format!("{stem}.json")))
    }
}

/// Last `max_chars` characters of `text`.
fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    match text.char_indices().nth(count - max_chars) {
        Some((offset, _)) => &text[offset..],
        None => text,
    }
}

#[async_trait]
impl PaperSource for ArxivSource {
    async fn fetch(&self, paper_id: &str) -> SourceResult<ParsedPaper> {
        let stem = file_stem(paper_id)?;
        tokio::fs::create_dir_all(&self.work_dir).await?;

        let archive = self.download(paper_id, &stem).await?;
        let json_path = self.convert(paper_id, &archive).await?;

        read_document(&json_path, paper_id).await.map_err(|e| match e {
            SourceError::NotFound(_) => SourceError::ParseFailure {
                paper_id: paper_id.to_string(),
                message: format!("converter produced no output at {}", json_path.display()),
            },
            other => other,
        })
    }

    fn name(&self) -> &str {
        "arxiv"
    }
}
