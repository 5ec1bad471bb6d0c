//! Context-aware retrieval: similarity search plus intent-specific selection.
//!
//! Every query gets the top text hits: page text chunks and table markup.
//! Visual selection then depends on the [`Intent`]:
//!
//! | intent            | visuals returned                                          |
//! |-------------------|-----------------------------------------------------------|
//! | text-only         | none                                                      |
//! | specific-visual   | the single best record of the kind                        |
//! | broad-visual      | every record of the kind above the broad cutoff           |
//! | data-grounded     | one: best co-located with the top text, else best overall |
//!
//! An index failure fails the query with the stage that failed. Finding
//! nothing above a cutoff is a normal, empty result.

use crate::config::RetrievalConfig;
use crate::document::ElementKind;
use crate::error::{IndexError, InferenceError, QueryError, QueryStage};
use crate::index::{rank_order, Modality, RecordFilter, ScoredRecord, VectorIndex};
use crate::inference::RateLimitedClient;
use crate::retrieval::intent::{Intent, IntentClassifier};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info};

/// A question plus its classified intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    pub intent: Intent,
    /// Restrict retrieval to one document.
    pub document_id: Option<String>,
}

impl Query {
    pub fn new(text: impl Into<String>, intent: Intent) -> Self {
        Self {
            text: text.into(),
            intent,
            document_id: None,
        }
    }

    pub fn with_document(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }
}

/// A selected text hit: a page text chunk or the markup of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextMatch {
    pub score: f32,
    pub record_id: String,
    /// `Table` for markup hits.
    pub kind: ElementKind,
    /// Table the markup belongs to; `None` for text chunks.
    pub element_id: Option<String>,
    pub document_id: String,
    pub page_index: usize,
    pub content: String,
}

/// A selected visual crop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualMatch {
    pub score: f32,
    pub element_id: String,
    pub kind: ElementKind,
    pub document_id: String,
    pub page_index: usize,
    /// Reference returned by the asset store.
    pub asset_ref: String,
    pub title: Option<String>,
    pub confidence: Option<f32>,
    /// Table markup recorded for the same element, when available.
    pub markup: Option<String>,
    /// Chosen because it sits next to the top text hits.
    pub co_located: bool,
}

/// Outcome of a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub query: String,
    pub intent: Intent,
    /// Every candidate considered, in rank order.
    pub ranked: Vec<ScoredRecord>,
    /// Selected text chunks, best first.
    pub text: Vec<TextMatch>,
    /// Selected visuals, best first.
    pub visuals: Vec<VisualMatch>,
}

impl RetrievalResult {
    /// `true` when nothing cleared the cutoffs.
    pub fn is_no_match(&self) -> bool {
        self.text.is_empty() && self.visuals.is_empty()
    }

    /// Render the selected context with page citations for an answering
    /// prompt.
    pub fn format_context(&self) -> String {
        if self.is_no_match() {
            return "No relevant context found.".to_string();
        }
        let mut out = String::new();
        if !self.text.is_empty() {
            out.push_str("## Text\n\n");
            for (n, t) in self.text.iter().enumerate() {
                let source = match t.kind {
                    ElementKind::TextBlock => String::new(),
                    kind => format!(", {kind} markup"),
                };
                let _ = writeln!(
                    out,
                    "[{}] ({}, page {}{})\n{}\n",
                    n + 1,
                    t.document_id,
                    t.page_index + 1,
                    source,
                    t.content.trim()
                );
            }
        }
        if !self.visuals.is_empty() {
            out.push_str("## Visuals\n\n");
            for v in &self.visuals {
                let _ = write!(out, "- {} on page {}", v.kind, v.page_index + 1);
                if let Some(title) = &v.title {
                    let _ = write!(out, ": {title}");
                }
                let _ = writeln!(out, " [{}]", v.asset_ref);
                if let Some(markup) = &v.markup {
                    let _ = writeln!(out, "\n{}\n", markup.trim());
                }
            }
        }
        out.trim_end().to_string()
    }
}

/// Runs similarity search and intent-specific selection.
#[derive(Clone)]
pub struct ContextRetriever {
    client: RateLimitedClient,
    index: Arc<dyn VectorIndex>,
    config: RetrievalConfig,
}

impl ContextRetriever {
    pub fn new(
        client: RateLimitedClient,
        index: Arc<dyn VectorIndex>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            client,
            index,
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Classify `text` with `classifier`, then [`retrieve`](Self::retrieve).
    pub async fn ask(
        &self,
        classifier: &dyn IntentClassifier,
        text: &str,
    ) -> Result<RetrievalResult, QueryError> {
        let intent = classifier.classify(text).await;
        self.retrieve(&Query::new(text, intent)).await
    }

    /// Retrieve context for `query`.
    pub async fn retrieve(&self, query: &Query) -> Result<RetrievalResult, QueryError> {
        let embedding = self.embed_query(&query.text).await?;
        let base = match &query.document_id {
            Some(id) => RecordFilter::default().with_document(id.clone()),
            None => RecordFilter::default(),
        };

        let (text_hits, visual_hits, visuals) = match query.intent {
            Intent::TextOnly => {
                let text_hits = self.search_text(&embedding, &base).await?;
                (text_hits, Vec::new(), Vec::new())
            }
            Intent::SpecificVisual(kind) => {
                let kinds = [kind];
                let (text_hits, pool) = tokio::try_join!(
                    self.search_text(&embedding, &base),
                    self.search_visuals(&embedding, &base, &kinds, None),
                )?;
                let selected = self.select_specific(&pool);
                (text_hits, pool, selected)
            }
            Intent::BroadVisual(kind) => {
                let kinds = [kind];
                let (text_hits, pool) = tokio::try_join!(
                    self.search_text(&embedding, &base),
                    self.search_visuals(&embedding, &base, &kinds, None),
                )?;
                let selected = self.select_broad(&pool);
                (text_hits, pool, selected)
            }
            Intent::DataGrounded => {
                let (text_hits, mut pool) = tokio::try_join!(
                    self.search_text(&embedding, &base),
                    self.search_visuals(&embedding, &base, &ElementKind::VISUAL, None),
                )?;
                let nearby = match self.co_located_scope(&text_hits) {
                    Some((document_id, pages)) => {
                        let scoped = base.clone().with_document(document_id);
                        self.search_visuals(&embedding, &scoped, &ElementKind::VISUAL, Some(pages))
                            .await?
                    }
                    None => Vec::new(),
                };
                let selected = self.select_grounded(&nearby, &pool);
                for hit in nearby {
                    if !pool.iter().any(|p| p.record.id == hit.record.id) {
                        pool.push(hit);
                    }
                }
                (text_hits, pool, selected)
            }
        };

        let mut visuals: Vec<VisualMatch> = visuals;
        if self.config.attach_table_markup {
            self.attach_markup(&embedding, &base, &mut visuals).await?;
        }

        let text: Vec<TextMatch> = text_hits.iter().map(text_match).collect();
        let mut ranked: Vec<ScoredRecord> = text_hits.into_iter().chain(visual_hits).collect();
        ranked.sort_by(rank_order);

        info!(
            "Query '{}' ({}): {} text chunks, {} visuals",
            query.text,
            query.intent,
            text.len(),
            visuals.len()
        );
        Ok(RetrievalResult {
            query: query.text.clone(),
            intent: query.intent,
            ranked,
            text,
            visuals,
        })
    }

    // ── Search ───────────────────────────────────────────────────────────

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, QueryError> {
        let inference = |source| QueryError::Inference {
            stage: QueryStage::Embedding,
            source,
        };
        let mut vectors = self
            .client
            .embed(vec![text.to_string()])
            .await
            .map_err(inference)?;
        match vectors.pop() {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(inference(InferenceError::UnexpectedResponse {
                detail: "empty query embedding".into(),
            })),
        }
    }

    async fn search_text(
        &self,
        embedding: &[f32],
        base: &RecordFilter,
    ) -> Result<Vec<ScoredRecord>, QueryError> {
        if self.config.text_top_k == 0 {
            return Ok(Vec::new());
        }
        let filter = RecordFilter {
            kinds: vec![ElementKind::TextBlock, ElementKind::Table],
            modality: Some(Modality::Content),
            ..base.clone()
        };
        self.index
            .query(embedding, &filter, self.config.text_top_k)
            .await
            .map_err(|source| index_error(QueryStage::TextSearch, source))
    }

    async fn search_visuals(
        &self,
        embedding: &[f32],
        base: &RecordFilter,
        kinds: &[ElementKind],
        pages: Option<Vec<usize>>,
    ) -> Result<Vec<ScoredRecord>, QueryError> {
        let filter = RecordFilter {
            kinds: kinds.to_vec(),
            pages,
            modality: Some(Modality::Asset),
            ..base.clone()
        };
        let hits = self
            .index
            .query(embedding, &filter, self.config.visual_pool_size)
            .await
            .map_err(|source| index_error(QueryStage::VisualSearch, source))?;
        debug!("Visual search ({:?}): {} candidates", kinds, hits.len());
        Ok(hits)
    }

    /// Document of the top text hit and the pages within `page_window` of
    /// that document's hits.
    fn co_located_scope(&self, text_hits: &[ScoredRecord]) -> Option<(String, Vec<usize>)> {
        let document_id = &text_hits.first()?.record.payload.document_id;
        let w = self.config.page_window;
        let pages: BTreeSet<usize> = text_hits
            .iter()
            .filter(|h| &h.record.payload.document_id == document_id)
            .flat_map(|h| {
                let p = h.record.payload.page_index;
                p.saturating_sub(w)..=p.saturating_add(w)
            })
            .collect();
        Some((document_id.clone(), pages.into_iter().collect()))
    }

    // ── Selection ────────────────────────────────────────────────────────

    /// The single best match; equal scores go to the higher detection
    /// confidence.
    fn select_specific(&self, pool: &[ScoredRecord]) -> Vec<VisualMatch> {
        pool.iter()
            .filter(|h| h.score >= self.config.specific_min_similarity)
            .min_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| {
                        let conf = |h: &ScoredRecord| h.record.payload.confidence.unwrap_or(0.0);
                        conf(b).partial_cmp(&conf(a)).unwrap_or(Ordering::Equal)
                    })
                    .then_with(|| rank_order(a, b))
            })
            .map(|h| visual_match(h, false))
            .into_iter()
            .collect()
    }

    fn select_broad(&self, pool: &[ScoredRecord]) -> Vec<VisualMatch> {
        let mut selected: Vec<&ScoredRecord> = pool
            .iter()
            .filter(|h| h.score >= self.config.broad_min_similarity)
            .collect();
        selected.sort_by(|a, b| rank_order(a, b));
        selected.into_iter().map(|h| visual_match(h, false)).collect()
    }

    /// Best co-located visual (tables first), otherwise the best semantic
    /// match above the grounded cutoff.
    fn select_grounded(&self, nearby: &[ScoredRecord], pool: &[ScoredRecord]) -> Vec<VisualMatch> {
        let co_located = nearby
            .iter()
            .filter(|h| h.record.payload.kind == ElementKind::Table)
            .min_by(|a, b| rank_order(a, b))
            .or_else(|| nearby.iter().min_by(|a, b| rank_order(a, b)));
        if let Some(hit) = co_located {
            return vec![visual_match(hit, true)];
        }
        pool.iter()
            .filter(|h| h.score >= self.config.grounded_min_similarity)
            .min_by(|a, b| rank_order(a, b))
            .map(|h| visual_match(h, false))
            .into_iter()
            .collect()
    }

    /// Fill `markup` for selected tables from their markup records.
    async fn attach_markup(
        &self,
        embedding: &[f32],
        base: &RecordFilter,
        visuals: &mut [VisualMatch],
    ) -> Result<(), QueryError> {
        let ids: Vec<String> = visuals
            .iter()
            .filter(|v| v.kind == ElementKind::Table)
            .map(|v| v.element_id.clone())
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        let filter = RecordFilter {
            kinds: vec![ElementKind::Table],
            element_ids: Some(ids.clone()),
            modality: Some(Modality::Content),
            ..base.clone()
        };
        let hits = self
            .index
            .query(embedding, &filter, ids.len())
            .await
            .map_err(|source| index_error(QueryStage::VisualSearch, source))?;
        let markup: HashMap<String, String> = hits
            .into_iter()
            .filter_map(|h| {
                let p = h.record.payload;
                Some((p.element_id?, p.content?))
            })
            .collect();
        for v in visuals.iter_mut() {
            if let Some(m) = markup.get(&v.element_id) {
                v.markup = Some(m.clone());
            }
        }
        Ok(())
    }
}

fn index_error(stage: QueryStage, source: IndexError) -> QueryError {
    QueryError::Index { stage, source }
}

fn text_match(hit: &ScoredRecord) -> TextMatch {
    let p = &hit.record.payload;
    TextMatch {
        score: hit.score,
        record_id: hit.record.id.clone(),
        kind: p.kind,
        element_id: p.element_id.clone(),
        document_id: p.document_id.clone(),
        page_index: p.page_index,
        content: p.content.clone().unwrap_or_default(),
    }
}

fn visual_match(hit: &ScoredRecord, co_located: bool) -> VisualMatch {
    let p = &hit.record.payload;
    VisualMatch {
        score: hit.score,
        element_id: p.element_id.clone().unwrap_or_else(|| hit.record.id.clone()),
        kind: p.kind,
        document_id: p.document_id.clone(),
        page_index: p.page_index,
        asset_ref: p.asset_ref.clone().unwrap_or_default(),
        title: p.title.clone(),
        confidence: p.confidence,
        markup: None,
        co_located,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexRecord;

    fn visual(page: usize, element: &str, score: f32, confidence: f32) -> ScoredRecord {
        ScoredRecord {
            score,
            record: IndexRecord::visual(
                "doc",
                page,
                element,
                ElementKind::Chart,
                format!("doc/page-{}/{element}.png", page + 1),
                confidence,
                None,
                vec![1.0],
            ),
        }
    }

    fn retriever(config: RetrievalConfig) -> ContextRetriever {
        use crate::config::BackoffConfig;
        use crate::index::InMemoryVectorIndex;
        use crate::inference::{InferenceRequest, InferenceResponse, InferenceService};
        use async_trait::async_trait;

        struct Never;
        #[async_trait]
        impl InferenceService for Never {
            async fn invoke(&self, _: &InferenceRequest) -> Result<InferenceResponse, InferenceError> {
                Err(InferenceError::Fatal { detail: "unused".into() })
            }
        }
        ContextRetriever::new(
            RateLimitedClient::new(Arc::new(Never), BackoffConfig::default()),
            Arc::new(InMemoryVectorIndex::new()),
            config,
        )
    }

    #[test]
    fn specific_tie_goes_to_higher_confidence() {
        let r = retriever(RetrievalConfig::default());
        let pool = vec![visual(0, "doc:p0:e0", 0.8, 0.6), visual(3, "doc:p3:e0", 0.8, 0.95)];
        let picked = r.select_specific(&pool);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].element_id, "doc:p3:e0");
    }

    #[test]
    fn specific_below_cutoff_is_no_match() {
        let r = retriever(RetrievalConfig::default());
        assert!(r.select_specific(&[visual(0, "doc:p0:e0", 0.1, 0.9)]).is_empty());
    }

    #[test]
    fn co_location_follows_the_top_document() {
        let r = retriever(RetrievalConfig::default());
        let hits = vec![
            ScoredRecord {
                score: 0.9,
                record: IndexRecord::text_chunk("doc", 0, 0, "a".into(), vec![1.0]),
            },
            ScoredRecord {
                score: 0.85,
                record: IndexRecord::text_chunk("other", 9, 0, "c".into(), vec![1.0]),
            },
            ScoredRecord {
                score: 0.8,
                record: IndexRecord::text_chunk("doc", 5, 0, "b".into(), vec![1.0]),
            },
        ];
        let (doc, pages) = r.co_located_scope(&hits).unwrap();
        assert_eq!(doc, "doc");
        assert_eq!(pages, vec![0, 1, 4, 5, 6]);
        assert!(r.co_located_scope(&[]).is_none());
    }

    #[test]
    fn grounded_prefers_co_located_table() {
        let r = retriever(RetrievalConfig::default());
        let chart = visual(2, "doc:p2:e0", 0.9, 0.9);
        let mut table = visual(2, "doc:p2:e1", 0.1, 0.9);
        table.record.payload.kind = ElementKind::Table;
        let picked = r.select_grounded(&[chart.clone(), table], &[chart.clone()]);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].element_id, "doc:p2:e1");
        assert!(picked[0].co_located);

        let far = r.select_grounded(&[], &[visual(9, "doc:p9:e0", 0.2, 0.9)]);
        assert!(far.is_empty());
    }

    #[test]
    fn context_lists_text_and_visuals_with_pages() {
        let result = RetrievalResult {
            query: "q".into(),
            intent: Intent::DataGrounded,
            ranked: vec![],
            text: vec![
                TextMatch {
                    score: 0.9,
                    record_id: "doc:p1:t0".into(),
                    kind: ElementKind::TextBlock,
                    element_id: None,
                    document_id: "doc".into(),
                    page_index: 1,
                    content: "GDP grew 2.1%.".into(),
                },
                TextMatch {
                    score: 0.6,
                    record_id: "doc:p4:e2:markup".into(),
                    kind: ElementKind::Table,
                    element_id: Some("doc:p4:e2".into()),
                    document_id: "doc".into(),
                    page_index: 4,
                    content: "| CPI | 3.4 |".into(),
                },
            ],
            visuals: vec![VisualMatch {
                markup: Some("| GDP | 2.1 |".into()),
                title: Some("Key indicators".into()),
                kind: ElementKind::Table,
                ..visual_match(&visual(1, "doc:p1:e0", 0.7, 0.9), true)
            }],
        };
        let ctx = result.format_context();
        assert!(ctx.contains("[1] (doc, page 2)\nGDP grew 2.1%."));
        assert!(ctx.contains("[2] (doc, page 5, table markup)\n| CPI | 3.4 |"));
        assert!(ctx.contains("table on page 2: Key indicators [doc/page-2/doc:p1:e0.png]"));
        assert!(ctx.contains("| GDP | 2.1 |"));

        let empty = RetrievalResult { text: vec![], visuals: vec![], ..result };
        assert!(empty.is_no_match());
        assert_eq!(empty.format_context(), "No relevant context found.");
    }
}
