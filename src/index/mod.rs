//! Vector index boundary: records, filters and the [`VectorIndex`] trait.
//!
//! The vector database itself is an external collaborator. This module fixes
//! the contract the pipeline relies on:
//!
//! * `upsert` — insert or replace self-contained [`IndexRecord`]s
//! * `query`  — similarity search with kind / document / page / element
//!   predicates as first-class filters
//! * `delete` — remove every record of a document
//!
//! [`InMemoryVectorIndex`] is the reference implementation used by the CLI
//! and the test suite. [`IndexWriter`] funnels writes through a single task
//! for backends that cannot take concurrent inserts.

mod memory;
mod writer;

pub use memory::InMemoryVectorIndex;
pub use writer::IndexWriter;

use crate::document::ElementKind;
use crate::error::IndexError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Metadata stored next to each embedding.
///
/// Invariant (checked by [`IndexRecord::validate`]): for visual kinds exactly
/// one of `content` / `asset_ref` is set; text-block records carry only
/// `content`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPayload {
    pub kind: ElementKind,
    pub document_id: String,
    /// Zero-based page index.
    pub page_index: usize,
    /// Detected element this record came from; `None` for page text chunks.
    pub element_id: Option<String>,
    /// Text chunk or table markup.
    pub content: Option<String>,
    /// Reference to the stored crop.
    pub asset_ref: Option<String>,
    /// Detection confidence of the source element.
    pub confidence: Option<f32>,
    /// Title read from the source element.
    pub title: Option<String>,
}

/// One retrievable unit: an embedding plus its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    /// Deterministic identifier derived from document / page / element.
    pub id: String,
    pub embedding: Vec<f32>,
    pub payload: RecordPayload,
}

/// Which side of the content/asset split a record is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    /// Records carrying text or markup content.
    Content,
    /// Records carrying a visual asset reference.
    Asset,
}

impl IndexRecord {
    /// A chunk of page text.
    pub fn text_chunk(
        document_id: &str,
        page_index: usize,
        chunk_index: usize,
        content: String,
        embedding: Vec<f32>,
    ) -> Self {
        Self {
            id: format!("{document_id}:p{page_index}:t{chunk_index}"),
            embedding,
            payload: RecordPayload {
                kind: ElementKind::TextBlock,
                document_id: document_id.to_string(),
                page_index,
                element_id: None,
                content: Some(content),
                asset_ref: None,
                confidence: None,
                title: None,
            },
        }
    }

    /// The crop of a visual element.
    #[allow(clippy::too_many_arguments)]
    pub fn visual(
        document_id: &str,
        page_index: usize,
        element_id: &str,
        kind: ElementKind,
        asset_ref: String,
        confidence: f32,
        title: Option<String>,
        embedding: Vec<f32>,
    ) -> Self {
        Self {
            id: format!("{element_id}:visual"),
            embedding,
            payload: RecordPayload {
                kind,
                document_id: document_id.to_string(),
                page_index,
                element_id: Some(element_id.to_string()),
                content: None,
                asset_ref: Some(asset_ref),
                confidence: Some(confidence),
                title,
            },
        }
    }

    /// Structured markup reconstructed from a table crop.
    pub fn table_markup(
        document_id: &str,
        page_index: usize,
        element_id: &str,
        markup: String,
        confidence: f32,
        title: Option<String>,
        embedding: Vec<f32>,
    ) -> Self {
        Self {
            id: format!("{element_id}:markup"),
            embedding,
            payload: RecordPayload {
                kind: ElementKind::Table,
                document_id: document_id.to_string(),
                page_index,
                element_id: Some(element_id.to_string()),
                content: Some(markup),
                asset_ref: None,
                confidence: Some(confidence),
                title,
            },
        }
    }

    pub fn modality(&self) -> Modality {
        if self.payload.asset_ref.is_some() {
            Modality::Asset
        } else {
            Modality::Content
        }
    }

    /// Check the payload invariants.
    pub fn validate(&self) -> Result<(), IndexError> {
        let invalid = |detail: &str| IndexError::InvalidRecord {
            id: self.id.clone(),
            detail: detail.to_string(),
        };
        let p = &self.payload;
        if self.embedding.is_empty() {
            return Err(invalid("embedding is empty"));
        }
        if self.embedding.iter().any(|v| !v.is_finite()) {
            return Err(invalid("embedding contains non-finite values"));
        }
        match (p.kind.is_visual(), p.content.is_some(), p.asset_ref.is_some()) {
            (true, true, true) | (true, false, false) => Err(invalid(
                "visual records carry exactly one of content or asset reference",
            )),
            (false, false, _) => Err(invalid("text records require content")),
            (false, _, true) => Err(invalid("text records cannot reference an asset")),
            _ => Ok(()),
        }
    }
}

/// Query predicates. Empty / `None` fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordFilter {
    pub kinds: Vec<ElementKind>,
    pub document_id: Option<String>,
    /// Restrict to these zero-based page indices.
    pub pages: Option<Vec<usize>>,
    /// Restrict to records derived from these elements.
    pub element_ids: Option<Vec<String>>,
    pub modality: Option<Modality>,
}

impl RecordFilter {
    pub fn kinds(kinds: impl IntoIterator<Item = ElementKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn text() -> Self {
        Self::kinds([ElementKind::TextBlock])
    }

    pub fn with_document(mut self, id: impl Into<String>) -> Self {
        self.document_id = Some(id.into());
        self
    }

    pub fn with_pages(mut self, pages: Vec<usize>) -> Self {
        self.pages = Some(pages);
        self
    }

    pub fn with_elements(mut self, ids: Vec<String>) -> Self {
        self.element_ids = Some(ids);
        self
    }

    pub fn with_modality(mut self, modality: Modality) -> Self {
        self.modality = Some(modality);
        self
    }

    /// `true` when `record` satisfies every predicate.
    pub fn matches(&self, record: &IndexRecord) -> bool {
        let p = &record.payload;
        if !self.kinds.is_empty() && !self.kinds.contains(&p.kind) {
            return false;
        }
        if let Some(doc) = &self.document_id {
            if &p.document_id != doc {
                return false;
            }
        }
        if let Some(pages) = &self.pages {
            if !pages.contains(&p.page_index) {
                return false;
            }
        }
        if let Some(ids) = &self.element_ids {
            match &p.element_id {
                Some(e) if ids.contains(e) => {}
                _ => return false,
            }
        }
        if let Some(m) = self.modality {
            if record.modality() != m {
                return false;
            }
        }
        true
    }
}

/// A record with its similarity to the query embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub score: f32,
    pub record: IndexRecord,
}

impl ScoredRecord {
    fn tie_key(&self) -> &str {
        self.record
            .payload
            .element_id
            .as_deref()
            .unwrap_or(&self.record.id)
    }
}

/// Deterministic result order: similarity desc, page asc, element id asc.
///
/// Text chunks have no element id; their record id stands in.
pub fn rank_order(a: &ScoredRecord, b: &ScoredRecord) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.record.payload.page_index.cmp(&b.record.payload.page_index))
        .then_with(|| a.tie_key().cmp(b.tie_key()))
        .then_with(|| a.record.id.cmp(&b.record.id))
}

/// Cosine similarity; 0.0 when either vector has zero magnitude or the
/// dimensions differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Storage backend for embeddings with metadata filtering.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace records by id.
    async fn upsert(&self, records: Vec<IndexRecord>) -> Result<(), IndexError>;

    /// The `top_k` records matching `filter`, ordered by [`rank_order`].
    async fn query(
        &self,
        embedding: &[f32],
        filter: &RecordFilter,
        top_k: usize,
    ) -> Result<Vec<ScoredRecord>, IndexError>;

    /// Remove every record of `document_id`; returns how many were removed.
    async fn delete(&self, document_id: &str) -> Result<usize, IndexError>;

    /// Whether `upsert` may be called from several tasks at once.
    ///
    /// When `false` the orchestrator serialises writes through an
    /// [`IndexWriter`] queue.
    fn supports_concurrent_writes(&self) -> bool {
        true
    }
}
