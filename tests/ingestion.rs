//! Ingestion orchestration against scripted inference and a fake renderer.
//!
//! No pdfium, no network: pages are blank images with a fixed text layer
//! and every inference call is answered from a script.

mod common;

use async_trait::async_trait;
use common::{fake_document, instant_client, FakeRenderer, ScriptedInference};
use edgequake_pdfrag::index::Modality;
use edgequake_pdfrag::{
    DegradeReason, ElementKind, IndexError, IndexRecord, InMemoryAssetStore,
    InMemoryVectorIndex, InferenceError, InferenceTask, IngestionConfig,
    IngestionProgressCallback, Ingestor, PageError, PageStatus, PdfRagError, RecordFilter,
    ScoredRecord, VectorIndex,
};
use futures::StreamExt;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TABLE_AND_CHART: &str = r#"{"elements": [
  {"kind": "table", "bbox": [0.05, 0.10, 0.95, 0.45], "confidence": 0.96, "title": "Key indicators"},
  {"kind": "chart", "bbox": [0.05, 0.55, 0.95, 0.90], "confidence": 0.91, "title": "Inflation Trends"},
  {"kind": "chart", "bbox": [0.06, 0.56, 0.94, 0.89], "confidence": 0.60, "title": "duplicate"},
  {"kind": "figure", "bbox": [0.10, 0.92, 0.20, 0.98], "confidence": 0.20}
]}"#;

fn ingestor(
    renderer: FakeRenderer,
    service: Arc<ScriptedInference>,
    index: Arc<dyn VectorIndex>,
    config: IngestionConfig,
) -> Ingestor {
    Ingestor::with_client(
        Arc::new(renderer),
        instant_client(service),
        index,
        Arc::new(InMemoryAssetStore::new()),
        config,
    )
}

fn config(concurrency: usize) -> IngestionConfig {
    IngestionConfig::builder()
        .concurrency(concurrency)
        .build()
        .unwrap()
}

#[tokio::test]
async fn one_failed_render_leaves_other_pages_ingested() {
    let service = Arc::new(ScriptedInference::new().layout(1, TABLE_AND_CHART));
    let index = Arc::new(InMemoryVectorIndex::new());
    let ingestor = ingestor(
        FakeRenderer::new(5).failing_page(3),
        service,
        index.clone(),
        config(3),
    );

    let report = ingestor.ingest(&fake_document("outlook")).await.unwrap();

    assert_eq!(report.stats.total_pages, 5);
    assert_eq!(report.stats.succeeded_pages + report.stats.degraded_pages, 4);
    assert_eq!(report.stats.failed_pages, 1);
    let failed = report.failed();
    assert_eq!(failed[0].0, 3);
    assert!(matches!(failed[0].1, PageError::RenderFailed { page: 3, .. }));
    assert!(!report.is_complete());

    // Pages are reported in order even though they finished out of order.
    let order: Vec<usize> = report.pages.iter().map(|p| p.page_index).collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4]);

    // Nothing was written for the failed page.
    let records = index.records().await;
    assert!(records.iter().all(|r| r.payload.page_index != 3));
    assert_eq!(records.len(), report.stats.records_written);
}

#[tokio::test]
async fn page_with_visuals_writes_text_visual_and_markup_records() {
    let service = Arc::new(ScriptedInference::new().layout(0, TABLE_AND_CHART));
    let index = Arc::new(InMemoryVectorIndex::new());
    let ingestor = ingestor(FakeRenderer::new(1), service.clone(), index.clone(), config(1));

    let report = ingestor.ingest(&fake_document("outlook")).await.unwrap();
    let page = &report.pages[0];
    assert_eq!(page.status, PageStatus::Succeeded);

    // Low-confidence figure dropped, overlapping duplicate chart suppressed.
    let kinds: Vec<ElementKind> = page.elements.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![ElementKind::Table, ElementKind::Chart]);
    assert_eq!(page.visuals, 2);
    assert_eq!(page.tables_structured, 1);
    assert_eq!(page.text_chunks, 1);
    assert_eq!(page.records_written, 4);

    let records = index.records().await;
    for r in &records {
        r.validate().unwrap();
        assert_eq!(r.payload.page_index, 0);
    }
    let visual_refs: Vec<&IndexRecord> = records
        .iter()
        .filter(|r| r.modality() == Modality::Asset)
        .collect();
    assert_eq!(visual_refs.len(), 2);
    assert!(visual_refs
        .iter()
        .all(|r| r.payload.asset_ref.as_deref().unwrap().starts_with("outlook/page-1/")));
    let markup = records
        .iter()
        .find(|r| r.id.ends_with(":markup"))
        .unwrap();
    assert!(markup.payload.content.as_deref().unwrap().contains("| GDP | 2.1% |"));
    assert_eq!(markup.payload.title.as_deref(), Some("Key indicators"));

    for e in &page.elements {
        let b = e.bbox;
        assert!((0.0..=1.0).contains(&b.x0) && (0.0..=1.0).contains(&b.x1));
        assert!((0.0..=1.0).contains(&b.y0) && (0.0..=1.0).contains(&b.y1));
    }

    assert_eq!(service.calls(InferenceTask::DetectLayout), 1);
    assert_eq!(service.calls(InferenceTask::StructureTable), 1);
    assert_eq!(service.calls(InferenceTask::Caption), 1);
}

#[tokio::test]
async fn unparseable_layout_degrades_the_page() {
    let service = Arc::new(ScriptedInference::new().layout(0, "I could not find any regions."));
    let index = Arc::new(InMemoryVectorIndex::new());
    let ingestor = ingestor(FakeRenderer::new(2), service, index.clone(), config(2));

    let report = ingestor.ingest(&fake_document("doc")).await.unwrap();

    assert_eq!(report.degraded(), vec![0]);
    assert_eq!(report.succeeded(), vec![1]);
    match &report.pages[0].status {
        PageStatus::Degraded { reasons } => {
            assert!(matches!(reasons[0], DegradeReason::DetectionParse { .. }))
        }
        other => panic!("unexpected status {other:?}"),
    }
    assert!(report.pages[0].elements.is_empty());
    // The text layer is still indexed.
    assert_eq!(report.pages[0].text_chunks, 1);
    assert!(report.is_complete());
}

#[tokio::test]
async fn failed_table_structuring_keeps_the_crop() {
    let service = Arc::new(
        ScriptedInference::new()
            .layout(0, TABLE_AND_CHART)
            .fail(
                InferenceTask::StructureTable,
                InferenceError::Fatal {
                    detail: "400 invalid request".into(),
                },
            ),
    );
    let index = Arc::new(InMemoryVectorIndex::new());
    let ingestor = ingestor(FakeRenderer::new(1), service, index.clone(), config(1));

    let report = ingestor.ingest(&fake_document("doc")).await.unwrap();
    let page = &report.pages[0];
    match &page.status {
        PageStatus::Degraded { reasons } => assert!(reasons
            .iter()
            .any(|r| matches!(r, DegradeReason::TableUnstructured { .. }))),
        other => panic!("unexpected status {other:?}"),
    }
    assert_eq!(page.tables_structured, 0);

    let tables = index
        .query(&[1.0; 8], &RecordFilter::kinds([ElementKind::Table]), 10)
        .await
        .unwrap();
    assert_eq!(tables.len(), 1);
    assert!(tables[0].record.payload.asset_ref.is_some());
    assert!(tables[0].record.payload.content.is_none());
}

#[tokio::test]
async fn embedding_failure_fails_every_page() {
    let service = Arc::new(ScriptedInference::new().fail(
        InferenceTask::Embed,
        InferenceError::Fatal {
            detail: "401 unauthorized".into(),
        },
    ));
    let index = Arc::new(InMemoryVectorIndex::new());
    let ingestor = ingestor(FakeRenderer::new(3), service, index.clone(), config(2));

    let report = ingestor.ingest(&fake_document("doc")).await.unwrap();
    assert_eq!(report.stats.failed_pages, 3);
    for (_, e) in report.failed() {
        match e {
            PageError::InferenceFailed { stage, .. } => assert_eq!(stage, "embed"),
            other => panic!("unexpected error {other:?}"),
        }
    }
    assert!(index.is_empty().await);
}

#[tokio::test]
async fn reingesting_converges_to_the_same_records() {
    let service = Arc::new(
        ScriptedInference::new()
            .layout(0, TABLE_AND_CHART)
            .layout(2, TABLE_AND_CHART),
    );
    let index = Arc::new(InMemoryVectorIndex::new());
    let ingestor = ingestor(FakeRenderer::new(3), service, index.clone(), config(3));
    let doc = fake_document("outlook");

    ingestor.ingest(&doc).await.unwrap();
    let first = index.records().await;
    ingestor.ingest(&doc).await.unwrap();
    let second = index.records().await;

    let content = |records: &[IndexRecord]| -> BTreeSet<String> {
        records
            .iter()
            .map(|r| serde_json::to_string(&(&r.payload, &r.embedding)).unwrap())
            .collect()
    };
    assert!(!first.is_empty());
    assert_eq!(first.len(), second.len());
    assert_eq!(content(&first), content(&second));
}

#[tokio::test]
async fn similar_document_ids_keep_their_own_crops() {
    let service = Arc::new(ScriptedInference::new().layout(0, TABLE_AND_CHART));
    let index = Arc::new(InMemoryVectorIndex::new());
    let assets = Arc::new(InMemoryAssetStore::new());
    let ingestor = Ingestor::with_client(
        Arc::new(FakeRenderer::new(1)),
        instant_client(service),
        index.clone(),
        assets.clone(),
        config(1),
    );

    ingestor.ingest(&fake_document("q1:report")).await.unwrap();
    ingestor.ingest(&fake_document("q1_report")).await.unwrap();

    let records = index.records().await;
    let refs: Vec<(&str, &str)> = records
        .iter()
        .filter_map(|r| Some((r.payload.document_id.as_str(), r.payload.asset_ref.as_deref()?)))
        .collect();
    assert_eq!(refs.len(), 4);
    assert_eq!(assets.len().await, 4);
    for (doc, asset_ref) in refs {
        assert!(assets.get(asset_ref).await.is_some(), "{doc}: {asset_ref} is gone");
    }
    let distinct: BTreeSet<&str> = records
        .iter()
        .filter_map(|r| r.payload.asset_ref.as_deref())
        .collect();
    assert_eq!(distinct.len(), 4);
}

#[tokio::test]
async fn cancellation_reports_partial_ingestion() {
    let service = Arc::new(ScriptedInference::new());
    let index = Arc::new(InMemoryVectorIndex::new());
    let ingestor = ingestor(
        FakeRenderer::new(6).with_delay(Duration::from_millis(200)),
        service,
        index.clone(),
        config(1),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let report = ingestor
        .ingest_with_cancellation(&fake_document("doc"), cancel)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.pages.len(), 6);
    assert!(report
        .failed()
        .iter()
        .all(|(_, e)| matches!(e, PageError::Cancelled { .. })));
    assert_eq!(report.stats.failed_pages, 6);
    assert!(index.is_empty().await);
}

#[tokio::test]
async fn stream_yields_one_report_per_page() {
    let service = Arc::new(ScriptedInference::new());
    let index = Arc::new(InMemoryVectorIndex::new());
    let ingestor = ingestor(FakeRenderer::new(4), service, index, config(2));

    let stream = ingestor
        .ingest_stream(&fake_document("doc"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stream.total_pages, 4);
    assert_eq!(stream.document_id, "doc");

    let mut pages: Vec<usize> = stream.pages.map(|r| r.page_index).collect().await;
    pages.sort_unstable();
    assert_eq!(pages, vec![0, 1, 2, 3]);
}

#[derive(Default)]
struct Counting {
    started: AtomicUsize,
    done: AtomicUsize,
    errors: AtomicUsize,
    finished: AtomicUsize,
}

impl IngestionProgressCallback for Counting {
    fn on_page_start(&self, _page_index: usize, _total_pages: usize) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }
    fn on_page_complete(&self, _page_index: usize, _total_pages: usize, _status: &PageStatus) {
        self.done.fetch_add(1, Ordering::SeqCst);
    }
    fn on_page_error(&self, _page_index: usize, _total_pages: usize, _error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
    fn on_ingestion_complete(&self, total: usize, ok: usize, failed: usize) {
        assert_eq!(total, ok + failed);
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn progress_callback_sees_every_page() {
    let counting = Arc::new(Counting::default());
    let config = IngestionConfig::builder()
        .concurrency(2)
        .progress_callback(counting.clone())
        .build()
        .unwrap();
    let ingestor = ingestor(
        FakeRenderer::new(4).failing_page(0),
        Arc::new(ScriptedInference::new()),
        Arc::new(InMemoryVectorIndex::new()),
        config,
    );

    ingestor.ingest(&fake_document("doc")).await.unwrap();

    assert_eq!(counting.started.load(Ordering::SeqCst), 4);
    assert_eq!(counting.done.load(Ordering::SeqCst), 3);
    assert_eq!(counting.errors.load(Ordering::SeqCst), 1);
    assert_eq!(counting.finished.load(Ordering::SeqCst), 1);
}

// ── Index backends ───────────────────────────────────────────────────────

/// Rejects overlapping upserts, like a store without concurrent inserts.
struct SingleWriterIndex {
    inner: InMemoryVectorIndex,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

#[async_trait]
impl VectorIndex for SingleWriterIndex {
    async fn upsert(&self, records: Vec<IndexRecord>) -> Result<(), IndexError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let result = self.inner.upsert(records).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn query(
        &self,
        embedding: &[f32],
        filter: &RecordFilter,
        top_k: usize,
    ) -> Result<Vec<ScoredRecord>, IndexError> {
        self.inner.query(embedding, filter, top_k).await
    }

    async fn delete(&self, document_id: &str) -> Result<usize, IndexError> {
        self.inner.delete(document_id).await
    }

    fn supports_concurrent_writes(&self) -> bool {
        false
    }
}

#[tokio::test]
async fn writes_are_serialised_when_the_index_requires_it() {
    let index = Arc::new(SingleWriterIndex {
        inner: InMemoryVectorIndex::new(),
        active: AtomicUsize::new(0),
        max_active: AtomicUsize::new(0),
    });
    let ingestor = ingestor(
        FakeRenderer::new(8),
        Arc::new(ScriptedInference::new()),
        index.clone(),
        config(8),
    );

    let report = ingestor.ingest(&fake_document("doc")).await.unwrap();

    assert!(report.is_complete());
    assert_eq!(index.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(index.inner.len().await, 8);
}

struct UnreachableIndex;

#[async_trait]
impl VectorIndex for UnreachableIndex {
    async fn upsert(&self, _records: Vec<IndexRecord>) -> Result<(), IndexError> {
        Err(IndexError::Unavailable {
            detail: "connection refused".into(),
        })
    }

    async fn query(
        &self,
        _embedding: &[f32],
        _filter: &RecordFilter,
        _top_k: usize,
    ) -> Result<Vec<ScoredRecord>, IndexError> {
        Err(IndexError::Unavailable {
            detail: "connection refused".into(),
        })
    }

    async fn delete(&self, _document_id: &str) -> Result<usize, IndexError> {
        Err(IndexError::Unavailable {
            detail: "connection refused".into(),
        })
    }
}

#[tokio::test]
async fn unreachable_index_is_fatal_before_ingestion_starts() {
    let service = Arc::new(ScriptedInference::new());
    let ingestor = ingestor(
        FakeRenderer::new(2),
        service.clone(),
        Arc::new(UnreachableIndex),
        config(2),
    );

    let err = ingestor.ingest(&fake_document("doc")).await.unwrap_err();
    assert!(matches!(err, PdfRagError::Index(IndexError::Unavailable { .. })));
    assert_eq!(service.calls(InferenceTask::DetectLayout), 0);
}
