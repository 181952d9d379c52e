//! Prefetch binary entry point.
//!
//! Downloads, converts, segments and embeds a list of papers into the
//! persistent cache, so later questions about them start immediately.
//!
//! # Examples
//!
//! Prefetch two papers:
//! ```bash
//! prefetch 2203.11618 2210.15097
//! ```
//!
//! Read ids from a file, one per line, and re-embed with FastEmbed:
//! ```bash
//! prefetch --input papers.txt --embedding fast-embed --force
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use paper_qa::{
    config::{AppConfig, EmbeddingBackend},
    pipeline::PaperLoader,
    segment::ChunkPolicy,
    EmbeddingProvider,
};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Prefetch CLI for filling the paper cache
#[derive(Parser, Debug)]
#[command(
    name = "prefetch",
    version,
    about = "Download and embed papers into the persistent cache",
    long_about = "Fetches each paper, converts it, splits it into passages and embeds them, \
                  storing the result in the cache directory used by `ask`.

EXAMPLES:
  Prefetch papers by id:
    prefetch 2203.11618 2210.15097

  Ids from a file, forcing re-processing:
    prefetch --input papers.txt --force

  Use pre-converted documents and local embeddings:
    prefetch --converted-dir ./output --embedding fast-embed 2203.11618"
)]
struct PrefetchArgs {
    /// Paper ids to prefetch
    #[arg(value_name = "ID")]
    ids: Vec<String>,

    /// File with one paper id per line (blank lines and # comments ignored)
    #[arg(short, long, value_name = "FILE")]
    input: Option<PathBuf>,

    /// Re-process papers that are already cached
    #[arg(long)]
    force: bool,

    /// Embedding backend: openai or fast-embed
    #[arg(long, value_name = "BACKEND")]
    embedding: Option<EmbeddingBackend>,

    /// Embedding model name
    #[arg(long, value_name = "MODEL")]
    embedding_model: Option<String>,

    /// FastEmbed model cache directory
    #[arg(long, value_name = "DIR")]
    model_cache_dir: Option<PathBuf>,

    /// How over-long passages are chunked: contiguous or source-compatible
    #[arg(long, value_name = "POLICY")]
    chunk_policy: Option<ChunkPolicy>,

    /// Directory for persisted processed papers
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Read pre-converted JSON documents from this directory instead of arXiv
    #[arg(long, value_name = "DIR")]
    converted_dir: Option<PathBuf>,

    /// Timeout for each external request, in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Logging verbosity level
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: String,
}

/// Counters shown in the final summary
#[derive(Debug, Default)]
struct PrefetchStats {
    total: usize,
    processed: usize,
    cached: usize,
    failed: usize,
    passages: usize,
}

/// Initialize logging subsystem with the specified level
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    Ok(())
}

/// Environment configuration with command-line overrides applied
fn build_config(args: &PrefetchArgs) -> AppConfig {
    let mut config = AppConfig::from_env();

    if let Some(backend) = args.embedding {
        config.embedding.backend = backend;
    }
    if let Some(model) = &args.embedding_model {
        config.embedding.model = Some(model.clone());
    }
    if let Some(dir) = &args.model_cache_dir {
        config.embedding.model_cache_dir = Some(dir.clone());
    }
    if let Some(policy) = args.chunk_policy {
        config.segmenter.chunk_policy = policy;
    }
    if let Some(dir) = &args.cache_dir {
        config.cache_dir = Some(dir.clone());
    }
    if let Some(dir) = &args.converted_dir {
        config.converted_dir = Some(dir.clone());
    }
    if let Some(secs) = args.timeout {
        config.request_timeout_secs = secs;
    }

    config
}

/// Parse an id list: one id per line, `#` starts a comment.
fn parse_id_list(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Ids from the command line followed by ids from `--input`, each once.
async fn collect_ids(args: &PrefetchArgs) -> Result<Vec<String>> {
    let mut ids = args.ids.clone();

    if let Some(path) = &args.input {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read id list {:?}", path))?;
        ids.extend(parse_id_list(&contents));
    }

    let mut seen = std::collections::HashSet::new();
    ids.retain(|id| seen.insert(id.clone()));
    Ok(ids)
}

/// Create a progress bar for tracking prefetching
fn create_progress_bar(total: usize) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} papers | {msg}")
            .context("Invalid progress bar template")?
            .progress_chars("##-"),
    );
    Ok(pb)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = PrefetchArgs::parse();

    init_logging(&args.log_level).context("Failed to initialize logging")?;

    info!("Starting paper prefetch");
    debug!("CLI arguments: {:?}", args);

    let start_time = Instant::now();

    let ids = collect_ids(&args).await?;
    if ids.is_empty() {
        anyhow::bail!(
            "No paper ids given.\n\
             Pass ids as arguments or use --input FILE."
        );
    }

    let config = build_config(&args);
    let cache_dir = config.cache_dir.clone().ok_or_else(|| {
        anyhow::anyhow!(
            "Prefetching needs a cache directory.\n\
             Set PAPER_QA_CACHE_DIR or pass --cache-dir."
        )
    })?;
    info!("Cache directory: {}", cache_dir.display());

    let source = config
        .paper_source()
        .context("Failed to set up paper source")?;
    let embedder = config
        .embedding_provider()
        .context("Failed to create embedding provider")?;
    info!(
        "Using embedding model: {} (dimension: {})",
        embedder.model_name(),
        embedder.dimension()
    );

    let loader = PaperLoader::new(
        source,
        embedder,
        config.paper_cache(),
        config.segmenter,
        config.request_timeout(),
    );

    let mut stats = PrefetchStats {
        total: ids.len(),
        ..PrefetchStats::default()
    };
    let progress = create_progress_bar(ids.len())?;

    for id in &ids {
        progress.set_message(id.clone());

        if args.force {
            if let Err(e) = loader.cache().invalidate(id).await {
                warn!("Failed to invalidate {}: {}", id, e);
            }
        } else if loader.is_cached(id).await {
            debug!("{} already cached", id);
            stats.cached += 1;
            progress.inc(1);
            continue;
        }

        match loader.load_paper(id).await {
            Ok(paper) => {
                stats.processed += 1;
                stats.passages += paper.len();
            }
            Err(e) => {
                stats.failed += 1;
                progress.println(format!("{} failed during {}: {}", id, e.stage(), e));
            }
        }
        progress.inc(1);
    }

    progress.finish_with_message("done");

    let elapsed = start_time.elapsed();
    println!("\n╔════════════════════════════════════════╗");
    println!("║      Prefetch Completed                ║");
    println!("╠════════════════════════════════════════╣");
    println!("║ Total papers:         {:>16} ║", stats.total);
    println!("║ Processed:            {:>16} ║", stats.processed);
    println!("║ Already cached:       {:>16} ║", stats.cached);
    println!("║ Failed:               {:>16} ║", stats.failed);
    println!("║ New passages:         {:>16} ║", stats.passages);
    println!("║ Elapsed time:         {:>13.2?} ║", elapsed);
    println!("╚════════════════════════════════════════╝");

    if stats.failed > 0 {
        warn!(
            "{} papers failed to process - check logs for details",
            stats.failed
        );
    }

    info!("Prefetch completed");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id_list() {
        let ids = parse_id_list("2203.11618\n\n# comment\nhep-th/9901001  # old style\n  2210.15097  \n");
        assert_eq!(ids, vec!["2203.11618", "hep-th/9901001", "2210.15097"]);
    }

    #[tokio::test]
    async fn test_collect_ids_deduplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ids.txt");
        std::fs::write(&path, "b2\na1\n").unwrap();

        let args = PrefetchArgs::parse_from([
            "prefetch",
            "a1",
            "--input",
            path.to_str().unwrap(),
        ]);
        assert_eq!(collect_ids(&args).await.unwrap(), vec!["a1", "b2"]);
    }
}
