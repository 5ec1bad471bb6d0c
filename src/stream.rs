//! Streaming ingestion: per-page reports as pages complete.
//!
//! Each page is one task: render → detect → crop & structure → chunk →
//! embed → write. Tasks run on a bounded pool (`buffer_unordered` with
//! `config.concurrency`) and write their own records as soon as they finish,
//! so a failed or slow page never holds back or corrupts another page's
//! writes. Reports arrive in completion order; sort by `page_index` if order
//! matters.

use crate::assets::AssetStore;
use crate::config::IngestionConfig;
use crate::document::{Document, Page, VisualAsset};
use crate::error::{PageError, PdfRagError};
use crate::index::{IndexRecord, IndexWriter};
use crate::inference::{InferenceTask, RateLimitedClient};
use crate::ingest::Ingestor;
use crate::output::{DegradeReason, PageReport, PageStatus};
use crate::pipeline::chunk::chunk_text;
use crate::pipeline::crop::Cropper;
use crate::pipeline::detect::LayoutDetector;
use crate::pipeline::encode::encode_png;
use crate::pipeline::render::{PageRenderer, Resolution};
use futures::stream::{self, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A boxed stream of page reports.
pub type PageReportStream = Pin<Box<dyn Stream<Item = PageReport> + Send>>;

/// An ingestion in progress.
pub struct IngestionStream {
    pub document_id: String,
    pub total_pages: usize,
    /// One report per page, in completion order.
    pub pages: PageReportStream,
}

impl Ingestor {
    /// Start ingesting `document`, yielding a [`PageReport`] per page.
    ///
    /// Document-level work happens before the stream is returned: the page
    /// count is read and the document's previous records are deleted. Those
    /// are the only failures reported as `Err`.
    pub async fn ingest_stream(
        &self,
        document: &Document,
        cancel: CancellationToken,
    ) -> Result<IngestionStream, PdfRagError> {
        let document = match (&self.config.password, document.password()) {
            (Some(pwd), None) => document.clone().with_password(pwd.clone()),
            _ => document.clone(),
        };
        let total_pages = self.renderer.page_count(&document).await?;
        let document_id = document.id().to_string();
        info!("Ingesting '{}': {} pages", document_id, total_pages);

        let removed = self.index.delete(&document_id).await?;
        if removed > 0 {
            info!("Removed {} records from a previous ingestion", removed);
        }
        if let Err(e) = self.assets.delete_document(&document_id).await {
            warn!("Could not clear previous crops of '{}': {}", document_id, e);
        }

        if let Some(cb) = &self.config.progress_callback {
            cb.on_ingestion_start(&document_id, total_pages);
        }

        let concurrency = self.config.concurrency.max(1);
        let task = Arc::new(PageTask {
            document,
            total_pages,
            renderer: Arc::clone(&self.renderer),
            detector: LayoutDetector::new(
                self.client.clone(),
                self.config.min_confidence,
                self.config.overlap_threshold,
            ),
            cropper: Cropper::new(
                self.client.clone(),
                self.config.structure_tables,
                self.config.caption_visuals,
            ),
            client: self.client.clone(),
            writer: IndexWriter::for_index(Arc::clone(&self.index), concurrency * 2),
            assets: Arc::clone(&self.assets),
            config: Arc::clone(&self.config),
        });

        let pages = stream::iter(0..total_pages)
            .map(move |page_index| {
                let task = Arc::clone(&task);
                let cancel = cancel.clone();
                async move { task.run(page_index, cancel).await }
            })
            .buffer_unordered(concurrency);

        Ok(IngestionStream {
            document_id,
            total_pages,
            pages: Box::pin(pages),
        })
    }
}

/// Everything one page task needs, shared by all page tasks of a document.
struct PageTask {
    document: Document,
    total_pages: usize,
    renderer: Arc<dyn PageRenderer>,
    detector: LayoutDetector,
    cropper: Cropper,
    client: RateLimitedClient,
    writer: IndexWriter,
    assets: Arc<dyn AssetStore>,
    config: Arc<IngestionConfig>,
}

impl PageTask {
    /// Run one page to a report. Never fails: errors become `Failed` reports.
    async fn run(&self, page_index: usize, cancel: CancellationToken) -> PageReport {
        let start = Instant::now();
        let cb = self.config.progress_callback.as_ref();

        let outcome = if cancel.is_cancelled() {
            Err(PageError::Cancelled { page: page_index })
        } else {
            if let Some(cb) = cb {
                cb.on_page_start(page_index, self.total_pages);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(PageError::Cancelled { page: page_index }),
                r = self.process(page_index) => r,
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(mut report) => {
                report.duration_ms = duration_ms;
                if let Some(cb) = cb {
                    cb.on_page_complete(page_index, self.total_pages, &report.status);
                }
                report
            }
            Err(e) => {
                warn!("Page {} failed: {}", page_index + 1, e);
                if let Some(cb) = cb {
                    cb.on_page_error(page_index, self.total_pages, &e.to_string());
                }
                PageReport::failed(e, duration_ms)
            }
        }
    }

    async fn process(&self, page_index: usize) -> Result<PageReport, PageError> {
        let document_id = self.document.id();
        let resolution = Resolution {
            dpi: self.config.dpi,
            max_pixels: self.config.max_rendered_pixels,
        };

        // ── Render ───────────────────────────────────────────────────────
        let rendered = self
            .renderer
            .render(&self.document, page_index, resolution)
            .await?;
        let encoded = encode_png(&rendered.image).map_err(|e| PageError::RenderFailed {
            page: page_index,
            detail: format!("image encoding failed: {e}"),
        })?;

        // ── Detect ───────────────────────────────────────────────────────
        let detection = self
            .detector
            .detect(document_id, page_index, &encoded)
            .await?;
        let mut reasons = Vec::new();
        if let Some(detail) = detection.parse_error {
            reasons.push(DegradeReason::DetectionParse { detail });
        }
        let page = Page {
            index: page_index,
            image: rendered.image,
            text: rendered.text,
            elements: detection.elements,
        };

        // ── Crop & structure ─────────────────────────────────────────────
        let crops = futures::future::try_join_all(
            page.visual_elements().map(|e| self.cropper.crop(&page.image, e)),
        )
        .await?;
        let mut visuals: Vec<VisualAsset> = Vec::with_capacity(crops.len());
        for outcome in crops {
            reasons.extend(outcome.degraded);
            visuals.push(outcome.asset);
        }

        // ── Text ─────────────────────────────────────────────────────────
        let page_text = page.indexable_text();
        let chunks = chunk_text(&page_text, self.config.chunk_size, self.config.chunk_overlap);

        // ── Embed ────────────────────────────────────────────────────────
        let markups: Vec<(usize, String)> = visuals
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.structured_content.clone().map(|m| (i, markup_text(v, &m))))
            .collect();
        let mut inputs: Vec<String> = chunks.clone();
        inputs.extend(visuals.iter().map(VisualAsset::descriptor));
        inputs.extend(markups.iter().map(|(_, m)| m.clone()));

        let mut vectors = self
            .client
            .embed_batched(inputs, self.config.embed_batch_size)
            .await
            .map_err(|e| PageError::InferenceFailed {
                page: page_index,
                stage: InferenceTask::Embed.to_string(),
                detail: e.to_string(),
            })?
            .into_iter();

        // ── Store crops + build records ──────────────────────────────────
        let mut records = Vec::with_capacity(chunks.len() + visuals.len() + markups.len());
        for (n, chunk) in chunks.iter().enumerate() {
            let embedding = next_vector(&mut vectors, page_index)?;
            records.push(IndexRecord::text_chunk(
                document_id,
                page_index,
                n,
                chunk.clone(),
                embedding,
            ));
        }
        for visual in &visuals {
            let embedding = next_vector(&mut vectors, page_index)?;
            let asset_ref = self
                .assets
                .put(document_id, visual)
                .await
                .map_err(|e| PageError::IndexWriteFailed {
                    page: page_index,
                    detail: format!("storing crop {} failed: {e}", visual.element_id),
                })?;
            records.push(IndexRecord::visual(
                document_id,
                page_index,
                &visual.element_id,
                visual.kind,
                asset_ref,
                visual.confidence,
                visual.title.clone(),
                embedding,
            ));
        }
        for (i, markup) in markups {
            let embedding = next_vector(&mut vectors, page_index)?;
            let visual = &visuals[i];
            records.push(IndexRecord::table_markup(
                document_id,
                page_index,
                &visual.element_id,
                markup,
                visual.confidence,
                visual.title.clone(),
                embedding,
            ));
        }

        // ── Write ────────────────────────────────────────────────────────
        let records_written = records.len();
        self.writer
            .write(records)
            .await
            .map_err(|e| PageError::IndexWriteFailed {
                page: page_index,
                detail: e.to_string(),
            })?;

        let tables_structured = visuals
            .iter()
            .filter(|v| v.structured_content.is_some())
            .count();
        debug!(
            "Page {}: {} elements, {} chunks, {} visuals, {} records",
            page_index + 1,
            page.elements.len(),
            chunks.len(),
            visuals.len(),
            records_written
        );

        Ok(PageReport {
            page_index,
            status: if reasons.is_empty() {
                PageStatus::Succeeded
            } else {
                PageStatus::Degraded { reasons }
            },
            elements: page.elements,
            text_chunks: chunks.len(),
            visuals: visuals.len(),
            tables_structured,
            records_written,
            duration_ms: 0,
        })
    }
}

/// Content of a table-markup record: title line (if any) + markup.
fn markup_text(visual: &VisualAsset, markup: &str) -> String {
    match visual.title.as_deref() {
        Some(title) if !markup.contains(title) => format!("{title}\n{markup}"),
        _ => markup.to_string(),
    }
}

fn next_vector(
    vectors: &mut impl Iterator<Item = Vec<f32>>,
    page_index: usize,
) -> Result<Vec<f32>, PageError> {
    vectors.next().ok_or_else(|| PageError::InferenceFailed {
        page: page_index,
        stage: InferenceTask::Embed.to_string(),
        detail: "fewer embeddings than inputs".into(),
    })
}
