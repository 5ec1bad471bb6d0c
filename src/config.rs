//! Configuration types for ingestion and retrieval.
//!
//! Ingestion behaviour is controlled through [`IngestionConfig`] and query
//! behaviour through [`RetrievalConfig`], each built via its builder. Every
//! threshold the pipeline uses (confidence floor, overlap suppression,
//! similarity cut-offs) lives here so it can be tuned per corpus instead of
//! being baked into the selection logic.

use crate::error::PdfRagError;
use crate::progress::ProgressCallback;
use edgequake_llm::{EmbeddingProvider, LLMProvider};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Exponential backoff policy for the rate-limited inference client.
///
/// Delay before retry `n` (1-based) is `base_delay_ms * 2^(n-1)`, capped at
/// `max_delay_ms`. `max_attempts` counts the first call too, so the default
/// policy makes at most four calls: wait 500 ms → 1 s → 2 s in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry, in milliseconds. Default: 500.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds. Default: 8000.
    pub max_delay_ms: u64,
    /// Total attempts per request, including the first. Default: 4.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            max_attempts: 4,
        }
    }
}

impl BackoffConfig {
    /// Delay for the given retry number (1 = first retry), capped.
    pub fn delay_for_retry(&self, retry: u32) -> u64 {
        let shift = retry.saturating_sub(1).min(32);
        self.base_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_delay_ms)
    }
}

/// Configuration for document ingestion.
///
/// Built via [`IngestionConfig::builder()`] or [`IngestionConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_pdfrag::IngestionConfig;
///
/// let config = IngestionConfig::builder()
///     .dpi(200)
///     .concurrency(4)
///     .min_confidence(0.6)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct IngestionConfig {
    /// Rendering DPI used when rasterising each page. Range: 72–400. Default: 200.
    ///
    /// Table cells are the smallest text the vision model has to read; 200 DPI
    /// keeps them legible on A4/Letter pages.
    pub dpi: u32,

    /// Maximum rendered image dimension (width or height) in pixels. Default: 2400.
    pub max_rendered_pixels: u32,

    /// Number of pages processed concurrently. Default: `min(available_parallelism, 8)`.
    pub concurrency: usize,

    /// Maximum inference calls in flight across all pages. Default: 8.
    ///
    /// A page task issues several calls (layout, one per table, captions), so
    /// this is the knob that tracks the provider's concurrency limit.
    pub max_inflight_requests: usize,

    /// Detected elements below this confidence are discarded. Default: 0.5.
    pub min_confidence: f32,

    /// IoU above which two non-text regions count as duplicates. Default: 0.5.
    pub overlap_threshold: f32,

    /// Run the table-structuring pass on table crops. Default: true.
    pub structure_tables: bool,

    /// Ask for a short caption of chart and figure crops. Default: true.
    pub caption_visuals: bool,

    /// Text chunk size in characters. Default: 1000.
    pub chunk_size: usize,

    /// Overlap between consecutive text chunks in characters. Default: 200.
    pub chunk_overlap: usize,

    /// Texts per embedding request. Default: 50.
    pub embed_batch_size: usize,

    /// Sampling temperature for vision calls. Default: 0.0.
    pub temperature: f32,

    /// Maximum tokens the model may generate per call. Default: 4096.
    pub max_tokens: usize,

    /// Retry policy for inference calls.
    pub backoff: BackoffConfig,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// LLM model identifier, e.g. "gpt-4.1-mini". If None, uses provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed vision provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Pre-constructed embedding provider. Falls back to the environment.
    pub embedding_provider: Option<Arc<dyn EmbeddingProvider>>,

    /// Per-page progress events.
    pub progress_callback: Option<ProgressCallback>,
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(8)
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            dpi: 200,
            max_rendered_pixels: 2400,
            concurrency: default_concurrency(),
            max_inflight_requests: 8,
            min_confidence: 0.5,
            overlap_threshold: 0.5,
            structure_tables: true,
            caption_visuals: true,
            chunk_size: 1000,
            chunk_overlap: 200,
            embed_batch_size: 50,
            temperature: 0.0,
            max_tokens: 4096,
            backoff: BackoffConfig::default(),
            password: None,
            model: None,
            provider_name: None,
            provider: None,
            embedding_provider: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for IngestionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestionConfig")
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("concurrency", &self.concurrency)
            .field("max_inflight_requests", &self.max_inflight_requests)
            .field("min_confidence", &self.min_confidence)
            .field("overlap_threshold", &self.overlap_threshold)
            .field("structure_tables", &self.structure_tables)
            .field("caption_visuals", &self.caption_visuals)
            .field("chunk_size", &self.chunk_size)
            .field("chunk_overlap", &self.chunk_overlap)
            .field("embed_batch_size", &self.embed_batch_size)
            .field("backoff", &self.backoff)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field(
                "embedding_provider",
                &self
                    .embedding_provider
                    .as_ref()
                    .map(|_| "<dyn EmbeddingProvider>"),
            )
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

impl IngestionConfig {
    /// Create a new builder for `IngestionConfig`.
    pub fn builder() -> IngestionConfigBuilder {
        IngestionConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`IngestionConfig`].
#[derive(Debug)]
pub struct IngestionConfigBuilder {
    config: IngestionConfig,
}

impl IngestionConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn max_inflight_requests(mut self, n: usize) -> Self {
        self.config.max_inflight_requests = n.max(1);
        self
    }

    pub fn min_confidence(mut self, c: f32) -> Self {
        self.config.min_confidence = c;
        self
    }

    pub fn overlap_threshold(mut self, t: f32) -> Self {
        self.config.overlap_threshold = t;
        self
    }

    pub fn structure_tables(mut self, v: bool) -> Self {
        self.config.structure_tables = v;
        self
    }

    pub fn caption_visuals(mut self, v: bool) -> Self {
        self.config.caption_visuals = v;
        self
    }

    pub fn chunk_size(mut self, n: usize) -> Self {
        self.config.chunk_size = n;
        self
    }

    pub fn chunk_overlap(mut self, n: usize) -> Self {
        self.config.chunk_overlap = n;
        self
    }

    pub fn embed_batch_size(mut self, n: usize) -> Self {
        self.config.embed_batch_size = n.max(1);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.config.embedding_provider = Some(provider);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<IngestionConfig, PdfRagError> {
        let c = &self.config;
        if !(0.0..=1.0).contains(&c.min_confidence) {
            return Err(PdfRagError::InvalidConfig(format!(
                "min_confidence must be within 0–1, got {}",
                c.min_confidence
            )));
        }
        if !(0.0..=1.0).contains(&c.overlap_threshold) {
            return Err(PdfRagError::InvalidConfig(format!(
                "overlap_threshold must be within 0–1, got {}",
                c.overlap_threshold
            )));
        }
        if c.chunk_size == 0 {
            return Err(PdfRagError::InvalidConfig("chunk_size must be ≥ 1".into()));
        }
        if c.chunk_overlap >= c.chunk_size {
            return Err(PdfRagError::InvalidConfig(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                c.chunk_overlap, c.chunk_size
            )));
        }
        if c.backoff.max_attempts == 0 {
            return Err(PdfRagError::InvalidConfig(
                "backoff.max_attempts must be ≥ 1".into(),
            ));
        }
        if c.backoff.max_delay_ms < c.backoff.base_delay_ms {
            return Err(PdfRagError::InvalidConfig(
                "backoff.max_delay_ms must be ≥ backoff.base_delay_ms".into(),
            ));
        }
        Ok(self.config)
    }
}

/// Configuration for query-time retrieval and visual selection.
///
/// # Example
/// ```rust
/// use edgequake_pdfrag::RetrievalConfig;
///
/// let config = RetrievalConfig::builder()
///     .text_top_k(8)
///     .broad_min_similarity(0.25)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Number of text chunks returned for every query. Default: 5.
    pub text_top_k: usize,

    /// Candidate visuals fetched before intent-specific selection. Default: 50.
    pub visual_pool_size: usize,

    /// Minimum similarity for a specific-visual match. Default: 0.25.
    pub specific_min_similarity: f32,

    /// Minimum similarity for a visual to be included in a broad request. Default: 0.2.
    pub broad_min_similarity: f32,

    /// Minimum similarity for a non-co-located visual in a data-grounded
    /// answer. Default: 0.3.
    pub grounded_min_similarity: f32,

    /// Pages either side of a top text hit that count as co-located. Default: 1.
    pub page_window: usize,

    /// Look up table markup for selected table visuals. Default: true.
    pub attach_table_markup: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            text_top_k: 5,
            visual_pool_size: 50,
            specific_min_similarity: 0.25,
            broad_min_similarity: 0.2,
            grounded_min_similarity: 0.3,
            page_window: 1,
            attach_table_markup: true,
        }
    }
}

impl RetrievalConfig {
    /// Create a new builder for `RetrievalConfig`.
    pub fn builder() -> RetrievalConfigBuilder {
        RetrievalConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`RetrievalConfig`].
#[derive(Debug)]
pub struct RetrievalConfigBuilder {
    config: RetrievalConfig,
}

impl RetrievalConfigBuilder {
    pub fn text_top_k(mut self, k: usize) -> Self {
        self.config.text_top_k = k;
        self
    }

    pub fn visual_pool_size(mut self, n: usize) -> Self {
        self.config.visual_pool_size = n.max(1);
        self
    }

    pub fn specific_min_similarity(mut self, s: f32) -> Self {
        self.config.specific_min_similarity = s;
        self
    }

    pub fn broad_min_similarity(mut self, s: f32) -> Self {
        self.config.broad_min_similarity = s;
        self
    }

    pub fn grounded_min_similarity(mut self, s: f32) -> Self {
        self.config.grounded_min_similarity = s;
        self
    }

    pub fn page_window(mut self, pages: usize) -> Self {
        self.config.page_window = pages;
        self
    }

    pub fn attach_table_markup(mut self, v: bool) -> Self {
        self.config.attach_table_markup = v;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<RetrievalConfig, PdfRagError> {
        let c = &self.config;
        for (name, value) in [
            ("specific_min_similarity", c.specific_min_similarity),
            ("broad_min_similarity", c.broad_min_similarity),
            ("grounded_min_similarity", c.grounded_min_similarity),
        ] {
            if !(-1.0..=1.0).contains(&value) {
                return Err(PdfRagError::InvalidConfig(format!(
                    "{name} must be a cosine similarity within -1–1, got {value}"
                )));
            }
        }
        Ok(self.config)
    }
}
