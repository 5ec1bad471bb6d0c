//! # edgequake-pdfrag
//!
//! Multi-modal retrieval over PDF documents. Pages are rendered, a vision
//! model finds the tables, charts and figures on them, and every piece
//! (text chunks, visual crops, table markup) lands in a vector index as its
//! own record. Queries are classified by how much visual content they expect
//! and answered with the matching mix of text and crops.
//!
//! ## Ingestion
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input    local file, URL or bytes (%PDF checked)
//!  ├─ 2. Render   rasterise + text layer via pdfium (worker thread)
//!  ├─ 3. Detect   one vision call per page → validated regions
//!  ├─ 4. Crop     visual regions cut out; tables → pipe-table markup
//!  ├─ 5. Embed    text chunks + visual descriptors, batched
//!  └─ 6. Index    per-page upsert, as soon as the page is done
//! ```
//!
//! Pages run on a bounded pool. A page that fails is reported, never
//! propagated: [`Ingestor::ingest`] always returns an [`IngestionReport`]
//! unless the document itself is unusable.
//!
//! ## Retrieval
//!
//! ```text
//! query ─▶ IntentClassifier ─▶ ContextRetriever ─▶ RetrievalResult
//! ```
//!
//! | intent | visuals |
//! |--------|---------|
//! | text-only | none |
//! | specific-visual | the single best match of the kind |
//! | broad-visual | every match of the kind above the cutoff |
//! | data-grounded | best co-located (or semantically closest) visual |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdfrag::{
//!     ContextRetriever, Document, IngestionConfig, Ingestor, InMemoryAssetStore,
//!     InMemoryVectorIndex, RetrievalConfig, RuleBasedClassifier,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let index = Arc::new(InMemoryVectorIndex::new());
//!     let ingestor = Ingestor::from_config(
//!         IngestionConfig::default(),
//!         index.clone(),
//!         Arc::new(InMemoryAssetStore::new()),
//!     )?;
//!     let document = edgequake_pdfrag::resolve_document("report.pdf", None, 60).await?;
//!     let report = ingestor.ingest(&document).await?;
//!     eprintln!("{} records", report.stats.records_written);
//!
//!     let retriever = ContextRetriever::new(
//!         ingestor.client().clone(),
//!         index,
//!         RetrievalConfig::default(),
//!     );
//!     let result = retriever.ask(&RuleBasedClassifier, "show me all the tables").await?;
//!     println!("{}", result.format_context());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdfrag` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! ```toml
//! edgequake-pdfrag = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod assets;
pub mod config;
pub mod document;
pub mod error;
pub mod index;
pub mod inference;
pub mod ingest;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod retrieval;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use assets::{AssetStore, DirectoryAssetStore, InMemoryAssetStore};
pub use config::{
    BackoffConfig, IngestionConfig, IngestionConfigBuilder, RetrievalConfig,
    RetrievalConfigBuilder,
};
pub use document::{BoundingBox, DetectedElement, Document, ElementKind, Page, VisualAsset};
pub use error::{IndexError, InferenceError, PageError, PdfRagError, QueryError, QueryStage};
pub use index::{IndexRecord, InMemoryVectorIndex, RecordFilter, ScoredRecord, VectorIndex};
pub use inference::{
    InferenceRequest, InferenceResponse, InferenceService, InferenceTask, LlmInferenceService,
    RateLimitedClient,
};
pub use ingest::Ingestor;
pub use output::{DegradeReason, IngestionReport, IngestionStats, PageReport, PageStatus};
pub use pipeline::input::resolve_document;
pub use progress::{IngestionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use retrieval::{
    ContextRetriever, Intent, IntentClassifier, ModelIntentClassifier, Query, RetrievalResult,
    RuleBasedClassifier, TextMatch, VisualMatch,
};
pub use stream::{IngestionStream, PageReportStream};
