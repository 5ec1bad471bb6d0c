//! CLI binary for edgequake-pdfrag.
//!
//! A thin shim over the library crate: `ingest` maps flags to
//! `IngestionConfig` and writes into a JSON index snapshot, `query` loads the
//! snapshot and prints the selected context.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_pdfrag::{
    resolve_document, BackoffConfig, ContextRetriever, DirectoryAssetStore, IngestionConfig,
    IngestionProgressCallback, IngestionReport, Ingestor, InMemoryVectorIndex, IntentClassifier,
    LlmInferenceService, ModelIntentClassifier, PageStatus, ProgressCallback, RateLimitedClient,
    RetrievalConfig, RuleBasedClassifier,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar plus one log line per finished page. Pages finish out
/// of order, so start times are tracked per page.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
}

impl CliProgressCallback {
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Opening PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Ingesting");
        self.bar.reset_eta();
    }

    fn elapsed_secs(&self, page_index: usize) -> f64 {
        self.start_times
            .lock()
            .unwrap()
            .remove(&page_index)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl IngestionProgressCallback for CliProgressCallback {
    fn on_ingestion_start(&self, document_id: &str, total_pages: usize) {
        self.activate_bar(total_pages);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Ingesting '{document_id}' ({total_pages} pages)…"))
        ));
    }

    fn on_page_start(&self, page_index: usize, _total: usize) {
        self.start_times
            .lock()
            .unwrap()
            .insert(page_index, Instant::now());
        self.bar.set_message(format!("page {}", page_index + 1));
    }

    fn on_page_complete(&self, page_index: usize, total: usize, status: &PageStatus) {
        let secs = self.elapsed_secs(page_index);
        let mark = if status.is_degraded() {
            yellow("◐")
        } else {
            green("✓")
        };
        let note = match status {
            PageStatus::Degraded { reasons } => format!("{} degraded", reasons.len()),
            _ => String::new(),
        };
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<12}  {}",
            mark,
            page_index + 1,
            total,
            yellow(&note),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page_index: usize, total: usize, error: &str) {
        let secs = self.elapsed_secs(page_index);

        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}  {}",
            red("✗"),
            page_index + 1,
            total,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_ingestion_complete(&self, total_pages: usize, ok_pages: usize, failed_pages: usize) {
        self.bar.finish_and_clear();
        if failed_pages == 0 {
            eprintln!("{} {} pages ingested", green("✔"), bold(&ok_pages.to_string()));
        } else {
            eprintln!(
                "{} {}/{} pages ingested  ({} failed)",
                if failed_pages == total_pages {
                    red("✘")
                } else {
                    cyan("⚠")
                },
                bold(&ok_pages.to_string()),
                total_pages,
                red(&failed_pages.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Ingest a report into a local index snapshot
  pdfrag ingest report.pdf --index rag.json

  # Ingest from a URL with an explicit document id
  pdfrag ingest https://example.com/outlook.pdf --index rag.json --doc-id outlook

  # Ask for one specific visual
  pdfrag query "show me the inflation chart" --index rag.json

  # Every table, as JSON
  pdfrag query "show me all the tables" --index rag.json --json

  # Let the model classify the query instead of the keyword rules
  pdfrag query "what drove GDP growth?" --index rag.json --model-intent

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Directory containing libpdfium
  RUST_LOG                Log filter, overrides --verbose / --quiet
"#;

/// Multi-modal retrieval over PDF documents.
#[derive(Parser, Debug)]
#[command(
    name = "pdfrag",
    version,
    about = "Ingest PDFs (text, tables, charts, figures) and query them with intent-aware retrieval",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PDFRAG_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "PDFRAG_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest a PDF file or URL into the index.
    Ingest(IngestArgs),
    /// Retrieve context for a question.
    Query(QueryArgs),
}

#[derive(Args, Debug)]
struct ProviderArgs {
    /// Vision/text model ID (e.g. gpt-4.1-mini, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Attempts per inference call, including the first.
    #[arg(long, env = "PDFRAG_MAX_ATTEMPTS", default_value_t = 4)]
    max_attempts: u32,

    /// First retry delay in milliseconds; doubles per retry.
    #[arg(long, env = "PDFRAG_BASE_DELAY_MS", default_value_t = 500)]
    base_delay_ms: u64,
}

#[derive(Args, Debug)]
struct IngestArgs {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// JSON index snapshot; created when missing.
    #[arg(long, env = "PDFRAG_INDEX")]
    index: PathBuf,

    /// Directory that receives the cropped visuals.
    #[arg(long, env = "PDFRAG_ASSETS", default_value = "pdfrag-assets")]
    assets: PathBuf,

    /// Document id; defaults to the file name.
    #[arg(long, env = "PDFRAG_DOC_ID")]
    doc_id: Option<String>,

    /// Pages processed concurrently.
    #[arg(short, long, env = "PDFRAG_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Rendering DPI (72–400).
    #[arg(long, env = "PDFRAG_DPI", default_value_t = 200,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Minimum detection confidence (0–1).
    #[arg(long, env = "PDFRAG_MIN_CONFIDENCE", default_value_t = 0.5)]
    min_confidence: f32,

    /// Skip captions for charts and figures.
    #[arg(long, env = "PDFRAG_NO_CAPTIONS")]
    no_captions: bool,

    /// Skip table-to-markup reconstruction.
    #[arg(long, env = "PDFRAG_NO_TABLES")]
    no_tables: bool,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PDFRAG_PASSWORD")]
    password: Option<String>,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "PDFRAG_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Print the ingestion report as JSON.
    #[arg(long, env = "PDFRAG_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "PDFRAG_NO_PROGRESS")]
    no_progress: bool,

    #[command(flatten)]
    provider: ProviderArgs,
}

#[derive(Args, Debug)]
struct QueryArgs {
    /// The question.
    text: String,

    /// JSON index snapshot written by `ingest`.
    #[arg(long, env = "PDFRAG_INDEX")]
    index: PathBuf,

    /// Restrict retrieval to one document.
    #[arg(long, env = "PDFRAG_DOC_ID")]
    doc_id: Option<String>,

    /// Text chunks to return.
    #[arg(long, env = "PDFRAG_TOP_K", default_value_t = 5)]
    top_k: usize,

    /// Classify the query with the model instead of keyword rules.
    #[arg(long, env = "PDFRAG_MODEL_INTENT")]
    model_intent: bool,

    /// Print the retrieval result as JSON.
    #[arg(long, env = "PDFRAG_JSON")]
    json: bool,

    #[command(flatten)]
    provider: ProviderArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs while it is shown.
    let show_progress = match &cli.command {
        Command::Ingest(a) => !cli.quiet && !a.no_progress && !a.json,
        Command::Query(_) => false,
    };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Ingest(args) => run_ingest(args, cli.quiet, show_progress).await,
        Command::Query(args) => run_query(args, cli.quiet).await,
    }
}

async fn run_ingest(args: IngestArgs, quiet: bool, show_progress: bool) -> Result<()> {
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new_dynamic() as Arc<dyn IngestionProgressCallback>)
    } else {
        None
    };
    let config = build_ingestion_config(&args, progress_cb)?;

    let document = resolve_document(&args.input, args.doc_id.as_deref(), args.download_timeout)
        .await
        .context("Failed to load document")?;

    let index = Arc::new(
        InMemoryVectorIndex::load_or_default(&args.index)
            .await
            .context("Failed to load index snapshot")?,
    );
    let assets = Arc::new(DirectoryAssetStore::new(&args.assets));
    let ingestor = Ingestor::from_config(config, index.clone(), assets)
        .context("Failed to set up inference providers")?;

    // Ctrl-C stops new pages; finished pages stay in the snapshot.
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let report = ingestor
        .ingest_with_cancellation(&document, cancel)
        .await
        .context("Ingestion failed")?;

    index
        .save(&args.index)
        .await
        .context("Failed to save index snapshot")?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise report")?
        );
    } else if !quiet {
        print_summary(&report, &args.index);
    }
    Ok(())
}

fn print_summary(report: &IngestionReport, index_path: &std::path::Path) {
    let s = &report.stats;
    eprintln!(
        "{}  {} records ({} text, {} visuals)  {}ms  →  {}",
        if report.is_complete() {
            green("✔")
        } else {
            cyan("⚠")
        },
        s.records_written,
        s.text_chunks,
        s.visuals,
        s.total_duration_ms,
        bold(&index_path.display().to_string()),
    );
    for page in &report.pages {
        if let PageStatus::Degraded { reasons } = &page.status {
            for r in reasons {
                eprintln!("   {} page {}: {:?}", yellow("◐"), page.page_index + 1, r);
            }
        }
    }
    for (page, error) in report.failed() {
        eprintln!("   {} page {}: {}", red("✗"), page + 1, dim(&error.to_string()));
    }
    if report.cancelled {
        eprintln!("   {}", yellow("cancelled; partial ingestion kept"));
    }
}

async fn run_query(args: QueryArgs, quiet: bool) -> Result<()> {
    let index = Arc::new(
        InMemoryVectorIndex::load(&args.index)
            .await
            .with_context(|| format!("Failed to load index {:?}", args.index))?,
    );

    let mut config = IngestionConfig::builder()
        .backoff(backoff(&args.provider))
        .build()
        .context("Invalid configuration")?;
    config.model = args.provider.model.clone();
    config.provider_name = args.provider.provider.clone();
    let service =
        LlmInferenceService::from_config(&config).context("Failed to set up inference providers")?;
    let client = RateLimitedClient::new(Arc::new(service), config.backoff);

    let classifier: Box<dyn IntentClassifier> = if args.model_intent {
        Box::new(ModelIntentClassifier::new(client.clone()))
    } else {
        Box::new(RuleBasedClassifier::new())
    };
    let intent = classifier.classify(&args.text).await;

    let retrieval = RetrievalConfig::builder()
        .text_top_k(args.top_k)
        .build()
        .context("Invalid configuration")?;
    let retriever = ContextRetriever::new(client, index, retrieval);
    let mut query = edgequake_pdfrag::Query::new(args.text.clone(), intent);
    if let Some(doc) = &args.doc_id {
        query = query.with_document(doc.clone());
    }
    let result = retriever.retrieve(&query).await.context("Query failed")?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&result).context("Failed to serialise result")?
        );
    } else {
        if !quiet {
            eprintln!("{} intent: {}", cyan("◆"), bold(&result.intent.to_string()));
        }
        println!("{}", result.format_context());
    }
    Ok(())
}

fn backoff(args: &ProviderArgs) -> BackoffConfig {
    BackoffConfig {
        base_delay_ms: args.base_delay_ms,
        max_attempts: args.max_attempts,
        ..BackoffConfig::default()
    }
}

/// Map CLI args to `IngestionConfig`.
fn build_ingestion_config(
    args: &IngestArgs,
    progress: Option<ProgressCallback>,
) -> Result<IngestionConfig> {
    let mut builder = IngestionConfig::builder()
        .dpi(args.dpi)
        .min_confidence(args.min_confidence)
        .structure_tables(!args.no_tables)
        .caption_visuals(!args.no_captions)
        .backoff(backoff(&args.provider));
    if let Some(n) = args.concurrency {
        builder = builder.concurrency(n);
    }
    if let Some(pwd) = &args.password {
        builder = builder.password(pwd.clone());
    }
    if let Some(model) = &args.provider.model {
        builder = builder.model(model.clone());
    }
    if let Some(name) = &args.provider.provider {
        builder = builder.provider_name(name.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    builder.build().context("Invalid configuration")
}
