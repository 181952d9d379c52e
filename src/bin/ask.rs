//! Question answering binary entry point.
//!
//! Asks a question about a paper and answers it from the passages of a set
//! of papers. Supports both single-question and interactive REPL modes, with
//! Markdown or JSON output.
//!
//! # Examples
//!
//! Single question about the default paper:
//! ```bash
//! ask --query "objective to maximize"
//! ```
//!
//! Several papers, one listed but deactivated, JSON output:
//! ```bash
//! ask --center 2203.11618 --paper 2210.15097 --inactive 2101.00001 \
//!     --query "how is the amateur model chosen" --format json
//! ```
//!
//! Interactive mode:
//! ```bash
//! ask --interactive
//! ```

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Color, ContentArrangement, Table};
use paper_qa::{
    config::{AppConfig, EmbeddingBackend},
    embedding::DynamicEmbeddingProvider,
    generation::openai::OpenAIChat,
    models::{Answer, PaperSelection, RetrievedPassage},
    pipeline::{PaperFailurePolicy, PipelineError, QaPipeline},
    segment::ChunkPolicy,
    source::DynamicPaperSource,
    EmbeddingProvider, DEFAULT_CENTER_PAPER,
};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

type Pipeline = QaPipeline<DynamicPaperSource, DynamicEmbeddingProvider, OpenAIChat>;

/// Output format for answers
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Answer and passage table for the terminal
    Markdown,
    /// Machine-readable JSON format
    Json,
}

/// Ask questions about arXiv papers
#[derive(Parser, Debug)]
#[command(
    name = "ask",
    version,
    about = "Answer questions about arXiv papers from their own passages",
    long_about = "Expands a rough question into a fabricated passage, retrieves the most \
                  similar real passages from the selected papers, and answers from them.

EXAMPLES:
  Single question:
    ask --query \"objective to maximize\"

  Compare against another paper:
    ask --center 2203.11618 --paper 2210.15097 --query \"decoding objective\"

  Interactive mode:
    ask --interactive"
)]
struct Args {
    /// Question (required for single-question mode, omitted in interactive mode)
    #[arg(long, value_name = "TEXT", conflicts_with = "interactive")]
    query: Option<String>,

    /// Paper whose abstract frames the question
    #[arg(long, value_name = "ID", default_value = DEFAULT_CENTER_PAPER)]
    center: String,

    /// Additional paper to retrieve from (repeatable)
    #[arg(long = "paper", value_name = "ID")]
    papers: Vec<String>,

    /// Paper to list but leave out of retrieval (repeatable)
    #[arg(long = "inactive", value_name = "ID")]
    inactive: Vec<String>,

    /// Number of passages to retrieve
    #[arg(long, value_name = "N")]
    top_k: Option<NonZeroUsize>,

    /// Output format
    #[arg(long, value_enum, default_value = "markdown")]
    format: OutputFormat,

    /// Enable interactive REPL mode
    #[arg(long, short = 'i')]
    interactive: bool,

    /// Embedding backend: openai or fast-embed
    #[arg(long, value_name = "BACKEND")]
    embedding: Option<EmbeddingBackend>,

    /// Embedding model name
    #[arg(long, value_name = "MODEL")]
    embedding_model: Option<String>,

    /// Chat model name
    #[arg(long, value_name = "MODEL")]
    chat_model: Option<String>,

    /// How over-long passages are chunked: contiguous or source-compatible
    #[arg(long, value_name = "POLICY")]
    chunk_policy: Option<ChunkPolicy>,

    /// What to do when a paper fails to download or parse: abort or skip
    #[arg(long, value_name = "POLICY")]
    on_paper_failure: Option<PaperFailurePolicy>,

    /// Directory for persisted processed papers
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Keep processed papers in memory only
    #[arg(long, conflicts_with = "cache_dir")]
    no_persist: bool,

    /// Read pre-converted JSON documents from this directory instead of arXiv
    #[arg(long, value_name = "DIR")]
    converted_dir: Option<PathBuf>,

    /// Timeout for each external request, in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Logging verbosity level
    #[arg(long, default_value = "warn", value_name = "LEVEL")]
    log_level: String,
}

/// Setup logging with the specified level
fn setup_logging(log_level: &str) {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .init();
}

/// Environment configuration with command-line overrides applied
fn build_config(args: &Args) -> AppConfig {
    let mut config = AppConfig::from_env();

    if let Some(backend) = args.embedding {
        config.embedding.backend = backend;
    }
    if let Some(model) = &args.embedding_model {
        config.embedding.model = Some(model.clone());
    }
    if let Some(model) = &args.chat_model {
        config.chat_model = model.clone();
    }
    if let Some(top_k) = args.top_k {
        config.top_k = top_k.get();
    }
    if let Some(policy) = args.chunk_policy {
        config.segmenter.chunk_policy = policy;
    }
    if let Some(policy) = args.on_paper_failure {
        config.failure_policy = policy;
    }
    if let Some(dir) = &args.cache_dir {
        config.cache_dir = Some(dir.clone());
    }
    if args.no_persist {
        config.cache_dir = None;
    }
    if let Some(dir) = &args.converted_dir {
        config.converted_dir = Some(dir.clone());
    }
    if let Some(secs) = args.timeout {
        config.request_timeout_secs = secs;
    }

    config
}

/// Initial paper table: the center paper, then `--paper`, then `--inactive`.
///
/// The center paper is activated unless it was passed to `--inactive`.
fn initial_selection(center: &str, papers: &[String], inactive: &[String]) -> Vec<PaperSelection> {
    let mut selection = Vec::new();
    if !inactive.iter().any(|id| id == center) {
        selection.push(PaperSelection::active(center));
    }
    for id in papers {
        if !selection.iter().any(|s| &s.paper_id == id) {
            selection.push(PaperSelection::active(id.as_str()));
        }
    }
    for id in inactive {
        if !selection.iter().any(|s| &s.paper_id == id) {
            selection.push(PaperSelection::inactive(id.as_str()));
        }
    }
    selection
}

/// Cut `text` to at most `max` characters, marking the cut.
fn truncate(text: &str, max: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        return flat;
    }
    let cut: String = flat.chars().take(max.saturating_sub(3)).collect();
    format!("{cut}...")
}

/// Name the failing stage alongside the error
fn describe(err: PipelineError) -> anyhow::Error {
    let stage = err.stage();
    anyhow::Error::new(err).context(format!("Question failed during {stage}"))
}

/// Execute one question
async fn ask(
    pipeline: &Pipeline,
    query: &str,
    center: &str,
    selection: &[PaperSelection],
) -> Result<Answer> {
    debug!("Asking: {}", query);
    pipeline
        .answer(query, center, selection)
        .await
        .map_err(describe)
}

/// Format retrieved passages as a table
fn format_passages_table(passages: &[RetrievedPassage]) -> String {
    if passages.is_empty() {
        return "No passages retrieved.".to_string();
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("Rank").add_attribute(Attribute::Bold),
        Cell::new("Paper").add_attribute(Attribute::Bold),
        Cell::new("Passage").add_attribute(Attribute::Bold),
        Cell::new("Score").add_attribute(Attribute::Bold),
        Cell::new("Excerpt").add_attribute(Attribute::Bold),
    ]);

    for (idx, passage) in passages.iter().enumerate() {
        table.add_row(vec![
            Cell::new(idx + 1),
            Cell::new(&passage.paper_id).fg(Color::Cyan),
            Cell::new(passage.local_index),
            Cell::new(format!("{:.4}", passage.score)),
            Cell::new(truncate(&passage.text, 80)),
        ]);
    }

    table.to_string()
}

/// Format the paper table
fn format_papers_table(selection: &[PaperSelection], center: &str, cached: &[String]) -> String {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("Paper").add_attribute(Attribute::Bold),
        Cell::new("Activated").add_attribute(Attribute::Bold),
        Cell::new("Cached").add_attribute(Attribute::Bold),
    ]);

    for paper in selection {
        let label = if paper.paper_id == center {
            format!("{} (center)", paper.paper_id)
        } else {
            paper.paper_id.clone()
        };
        let (activated, color) = if paper.activated {
            ("yes", Color::Green)
        } else {
            ("no", Color::DarkGrey)
        };
        let is_cached = cached.iter().any(|id| id == &paper.paper_id);

        table.add_row(vec![
            Cell::new(label),
            Cell::new(activated).fg(color),
            Cell::new(if is_cached { "yes" } else { "no" }),
        ]);
    }

    table.to_string()
}

/// Print an answer in the requested format
fn print_answer(answer: &Answer, format: OutputFormat, elapsed_secs: f64) -> Result<()> {
    match format {
        OutputFormat::Markdown => {
            println!("## Question\n\n{}\n", answer.refined_question.trim());
            println!("## Answer\n\n{}\n", answer.answer.trim());
            println!("## Retrieved passages\n");
            println!("{}", format_passages_table(&answer.retrieved));
            if !answer.skipped_papers.is_empty() {
                println!("\nSkipped papers: {}", answer.skipped_papers.join(", "));
            }
            println!(
                "\nSearched {} papers in {:.2}s",
                answer.papers.len(),
                elapsed_secs
            );
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(answer)
                .with_context(|| "Failed to serialize answer to JSON")?;
            println!("{}", json);
        }
    }
    Ok(())
}

/// Display the full text of the last retrieved passages
fn display_passages(answer: &Answer) {
    println!("\nFabricated passage:\n{}", answer.fabricated_passage.trim());
    for (idx, passage) in answer.retrieved.iter().enumerate() {
        println!("\n{}", "═".repeat(80));
        println!(
            "Rank {} | {} passage {} | score {:.4}",
            idx + 1,
            passage.paper_id,
            passage.local_index,
            passage.score
        );
        println!("{}", passage.text);
    }
    println!("{}", "═".repeat(80));
}

fn print_help() {
    println!("Commands:");
    println!("  <question>        - Ask about the center paper");
    println!("  /papers           - List papers and whether they are activated");
    println!("  /add ID           - Add and activate a paper");
    println!("  /toggle ID        - Activate or deactivate a paper");
    println!("  /remove ID        - Remove a paper from the list");
    println!("  /center ID        - Ask about a different paper");
    println!("  /top N            - Retrieve N passages");
    println!("  /format FORMAT    - markdown or json");
    println!("  /passages         - Show full text of the last retrieved passages");
    println!("  /clear-cache [ID] - Forget one or all processed papers");
    println!("  /help             - Show this help");
    println!("  Ctrl+D or Ctrl+C  - Exit");
}

/// Run interactive REPL mode
async fn run_interactive(
    mut pipeline: Pipeline,
    mut center: String,
    mut selection: Vec<PaperSelection>,
    mut format: OutputFormat,
) -> Result<()> {
    println!("Interactive Paper QA (center paper: {})", center);
    print_help();
    println!();

    let mut rl = DefaultEditor::new().with_context(|| "Failed to create readline editor")?;
    let mut last_answer: Option<Answer> = None;

    loop {
        let readline = rl.readline("Ask> ");
        match readline {
            Ok(line) => {
                let line = line.trim();

                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line).ok();

                if line.starts_with('/') {
                    let parts: Vec<&str> = line.split_whitespace().collect();
                    match (parts[0], parts.get(1).copied()) {
                        ("/help", _) => print_help(),
                        ("/papers", _) => {
                            let cached = pipeline.cache().paper_ids().await;
                            println!("{}", format_papers_table(&selection, &center, &cached));
                        }
                        ("/add", Some(id)) => {
                            match selection.iter_mut().find(|s| s.paper_id == id) {
                                Some(existing) => existing.activated = true,
                                None => selection.push(PaperSelection::active(id)),
                            }
                            println!("Activated {}", id);
                        }
                        ("/toggle", Some(id)) => {
                            match selection.iter_mut().find(|s| s.paper_id == id) {
                                Some(existing) => {
                                    existing.activated = !existing.activated;
                                    println!(
                                        "{} is now {}",
                                        id,
                                        if existing.activated { "active" } else { "inactive" }
                                    );
                                }
                                None => eprintln!("Paper {} is not in the list", id),
                            }
                        }
                        ("/remove", Some(id)) => {
                            let before = selection.len();
                            selection.retain(|s| s.paper_id != id);
                            if selection.len() < before {
                                println!("Removed {}", id);
                            } else {
                                eprintln!("Paper {} is not in the list", id);
                            }
                        }
                        ("/center", Some(id)) => {
                            center = id.to_string();
                            println!("Center paper set to {}", center);
                        }
                        ("/top", Some(n)) => match n.parse::<usize>() {
                            Ok(n) if n > 0 => {
                                pipeline.set_top_k(n);
                                println!("Set top-k to {}", n);
                            }
                            _ => eprintln!("Invalid number: must be a positive integer"),
                        },
                        ("/format", Some(name)) => match OutputFormat::from_str(name, true) {
                            Ok(f) => {
                                format = f;
                                println!("Set output format to {}", name);
                            }
                            Err(_) => eprintln!("Invalid format: must be 'markdown' or 'json'"),
                        },
                        ("/passages", _) => match &last_answer {
                            Some(answer) => display_passages(answer),
                            None => eprintln!("No question asked yet"),
                        },
                        ("/clear-cache", id) => {
                            let result = match id {
                                Some(id) => pipeline.cache().invalidate(id).await,
                                None => pipeline.cache().clear().await,
                            };
                            match result {
                                Ok(()) => println!("Cache cleared"),
                                Err(e) => eprintln!("Failed to clear cache: {}", e),
                            }
                        }
                        (command @ ("/add" | "/toggle" | "/remove" | "/center" | "/top" | "/format"), None) => {
                            eprintln!("Usage: {} ARG. Type /help for available commands.", command);
                        }
                        (other, _) => {
                            eprintln!("Unknown command: {}. Type /help for available commands.", other)
                        }
                    }
                } else {
                    let start = Instant::now();
                    match ask(&pipeline, line, &center, &selection).await {
                        Ok(answer) => {
                            if let Err(e) = print_answer(&answer, format, start.elapsed().as_secs_f64()) {
                                eprintln!("Error formatting answer: {}", e);
                            }
                            last_answer = Some(answer);
                        }
                        Err(e) => eprintln!("{:#}", e),
                    }
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                error!("Error reading input: {}", err);
                break;
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level);

    if !args.interactive && args.query.is_none() {
        anyhow::bail!(
            "Either --query or --interactive must be specified.\n\
             Use --help for usage information."
        );
    }

    let config = build_config(&args);
    debug!(
        backend = ?config.embedding.backend,
        chat_model = %config.chat_model,
        top_k = config.top_k,
        cache_dir = ?config.cache_dir,
        "Resolved configuration"
    );

    let source = config
        .paper_source()
        .with_context(|| "Failed to set up paper source")?;
    let embedder = config
        .embedding_provider()
        .with_context(|| "Failed to create embedding provider")?;
    let chat = config
        .chat_model()
        .with_context(|| "Failed to create chat model")?;

    info!(
        "Using embedding model: {} (dimension: {})",
        embedder.model_name(),
        embedder.dimension()
    );

    let pipeline = QaPipeline::new(
        source,
        embedder,
        chat,
        config.paper_cache(),
        config.pipeline_config(),
    );
    let selection = initial_selection(&args.center, &args.papers, &args.inactive);

    match &args.query {
        Some(query) if !args.interactive => {
            let start = Instant::now();
            let answer = ask(&pipeline, query, &args.center, &selection).await?;
            print_answer(&answer, args.format, start.elapsed().as_secs_f64())?;
        }
        _ => run_interactive(pipeline, args.center.clone(), selection, args.format).await?,
    }

    Ok(())
}
