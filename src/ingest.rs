//! Eager (whole-document) ingestion entry points.
//!
//! [`Ingestor::ingest`] drives every page through the pipeline and returns
//! once all of them finished, failed or were abandoned. Per-page outcomes are
//! collected into an [`IngestionReport`]; only document-level problems
//! (unreadable PDF, index unreachable before the first write) are `Err`.
//!
//! Use [`Ingestor::ingest_stream`](crate::stream) to receive page reports as
//! they complete instead.

use crate::assets::AssetStore;
use crate::config::IngestionConfig;
use crate::document::Document;
use crate::error::PdfRagError;
use crate::index::VectorIndex;
use crate::inference::{InferenceService, LlmInferenceService, RateLimitedClient};
use crate::output::{IngestionReport, PageReport};
use crate::pipeline::render::{PageRenderer, PdfiumRenderer};
use crate::stream::IngestionStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Ingests documents into a vector index.
///
/// Holds shared handles only, so it is cheap to clone and can ingest several
/// documents at once. All inference calls of all pages go through one
/// [`RateLimitedClient`], which therefore sees the whole load when backing off.
///
/// # Example
///
/// ```rust,no_run
/// use edgequake_pdfrag::{Document, IngestionConfig, Ingestor, InMemoryAssetStore, InMemoryVectorIndex};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let index = Arc::new(InMemoryVectorIndex::new());
/// let ingestor = Ingestor::from_config(
///     IngestionConfig::default(),
///     index.clone(),
///     Arc::new(InMemoryAssetStore::new()),
/// )?;
/// let document = Document::from_bytes("report", std::fs::read("report.pdf")?)?;
/// let report = ingestor.ingest(&document).await?;
/// eprintln!("{} pages, {} failed", report.stats.total_pages, report.stats.failed_pages);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Ingestor {
    pub(crate) renderer: Arc<dyn PageRenderer>,
    pub(crate) client: RateLimitedClient,
    pub(crate) index: Arc<dyn VectorIndex>,
    pub(crate) assets: Arc<dyn AssetStore>,
    pub(crate) config: Arc<IngestionConfig>,
}

impl Ingestor {
    /// Build an ingestor around `service`, wrapping it in a rate-limited
    /// client configured from `config.backoff` and `config.max_inflight_requests`.
    pub fn new(
        renderer: Arc<dyn PageRenderer>,
        service: Arc<dyn InferenceService>,
        index: Arc<dyn VectorIndex>,
        assets: Arc<dyn AssetStore>,
        config: IngestionConfig,
    ) -> Self {
        let client = RateLimitedClient::new(service, config.backoff)
            .with_max_inflight(config.max_inflight_requests);
        Self::with_client(renderer, client, index, assets, config)
    }

    /// Build an ingestor around an existing client (shares its backoff state).
    pub fn with_client(
        renderer: Arc<dyn PageRenderer>,
        client: RateLimitedClient,
        index: Arc<dyn VectorIndex>,
        assets: Arc<dyn AssetStore>,
        config: IngestionConfig,
    ) -> Self {
        Self {
            renderer,
            client,
            index,
            assets,
            config: Arc::new(config),
        }
    }

    /// pdfium renderer + `edgequake-llm` providers resolved from `config`.
    pub fn from_config(
        config: IngestionConfig,
        index: Arc<dyn VectorIndex>,
        assets: Arc<dyn AssetStore>,
    ) -> Result<Self, PdfRagError> {
        let service = LlmInferenceService::from_config(&config)?;
        Ok(Self::new(
            Arc::new(PdfiumRenderer::new()),
            Arc::new(service),
            index,
            assets,
            config,
        ))
    }

    pub fn config(&self) -> &IngestionConfig {
        &self.config
    }

    pub fn client(&self) -> &RateLimitedClient {
        &self.client
    }

    /// Ingest every page of `document`.
    ///
    /// Records of a previous ingestion of the same document id are removed
    /// first, so re-ingesting converges to the same index content.
    pub async fn ingest(&self, document: &Document) -> Result<IngestionReport, PdfRagError> {
        self.ingest_with_cancellation(document, CancellationToken::new())
            .await
    }

    /// Like [`ingest`](Self::ingest), stopping early when `cancel` fires.
    ///
    /// Pages that had not finished are reported as `Cancelled`; records
    /// already written stay in the index.
    pub async fn ingest_with_cancellation(
        &self,
        document: &Document,
        cancel: CancellationToken,
    ) -> Result<IngestionReport, PdfRagError> {
        let start = Instant::now();
        let IngestionStream {
            document_id,
            total_pages,
            pages,
        } = self.ingest_stream(document, cancel.clone()).await?;

        let reports: Vec<PageReport> = pages.collect().await;
        let report = IngestionReport::from_pages(
            document_id,
            total_pages,
            reports,
            cancel.is_cancelled(),
            start.elapsed().as_millis() as u64,
        );

        let s = &report.stats;
        info!(
            "Ingested '{}': {}/{} pages ok ({} degraded, {} failed), {} records in {}ms",
            report.document_id,
            s.succeeded_pages + s.degraded_pages,
            s.total_pages,
            s.degraded_pages,
            s.failed_pages,
            s.records_written,
            s.total_duration_ms
        );
        if let Some(cb) = &self.config.progress_callback {
            cb.on_ingestion_complete(
                s.total_pages,
                s.succeeded_pages + s.degraded_pages,
                s.failed_pages,
            );
        }

        Ok(report)
    }
}
