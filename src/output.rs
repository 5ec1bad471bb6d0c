//! Ingestion report types.
//!
//! [`IngestionReport`] is always produced, even when every page failed:
//! per-page outcomes are data, not errors. Pages are sorted by index no
//! matter which order their tasks finished in.

use crate::document::DetectedElement;
use crate::error::PageError;
use serde::{Deserialize, Serialize};

/// Why a page was ingested with less than full fidelity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DegradeReason {
    /// The layout response was unusable; the page has no detected elements.
    DetectionParse { detail: String },
    /// A table crop was kept without markup.
    TableUnstructured { element_id: String, detail: String },
}

/// Terminal state of one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PageStatus {
    Succeeded,
    Degraded { reasons: Vec<DegradeReason> },
    Failed { error: PageError },
}

impl PageStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, PageStatus::Failed { .. })
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, PageStatus::Degraded { .. })
    }
}

/// Result of processing one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageReport {
    /// Zero-based page index.
    pub page_index: usize,
    pub status: PageStatus,
    /// Elements kept after confidence filtering and overlap suppression.
    pub elements: Vec<DetectedElement>,
    /// Text chunks written for this page.
    pub text_chunks: usize,
    /// Visual crops written for this page.
    pub visuals: usize,
    /// Tables that received structured markup.
    pub tables_structured: usize,
    /// Total records upserted for this page.
    pub records_written: usize,
    /// Wall-clock time for the page task.
    pub duration_ms: u64,
}

impl PageReport {
    /// A report for a page that failed before producing anything.
    pub fn failed(error: PageError, duration_ms: u64) -> Self {
        Self {
            page_index: error.page(),
            status: PageStatus::Failed { error },
            elements: Vec::new(),
            text_chunks: 0,
            visuals: 0,
            tables_structured: 0,
            records_written: 0,
            duration_ms,
        }
    }
}

/// Aggregate counters over all pages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionStats {
    pub total_pages: usize,
    pub succeeded_pages: usize,
    pub degraded_pages: usize,
    pub failed_pages: usize,
    pub records_written: usize,
    pub visuals: usize,
    pub text_chunks: usize,
    pub total_duration_ms: u64,
}

/// Outcome of ingesting one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionReport {
    pub document_id: String,
    /// Per-page reports, sorted by page index.
    pub pages: Vec<PageReport>,
    pub stats: IngestionStats,
    /// `true` when ingestion was cancelled; unfinished pages are `Cancelled`
    /// failures and records already written stay valid.
    pub cancelled: bool,
}

impl IngestionReport {
    /// Aggregate page reports into a document report.
    pub fn from_pages(
        document_id: impl Into<String>,
        total_pages: usize,
        mut pages: Vec<PageReport>,
        cancelled: bool,
        total_duration_ms: u64,
    ) -> Self {
        pages.sort_by_key(|p| p.page_index);

        let stats = IngestionStats {
            total_pages,
            succeeded_pages: pages
                .iter()
                .filter(|p| p.status == PageStatus::Succeeded)
                .count(),
            degraded_pages: pages.iter().filter(|p| p.status.is_degraded()).count(),
            failed_pages: pages.iter().filter(|p| p.status.is_failed()).count(),
            records_written: pages.iter().map(|p| p.records_written).sum(),
            visuals: pages.iter().map(|p| p.visuals).sum(),
            text_chunks: pages.iter().map(|p| p.text_chunks).sum(),
            total_duration_ms,
        };

        Self {
            document_id: document_id.into(),
            pages,
            stats,
            cancelled,
        }
    }

    /// Indices of pages that completed without degradation.
    pub fn succeeded(&self) -> Vec<usize> {
        self.pages
            .iter()
            .filter(|p| p.status == PageStatus::Succeeded)
            .map(|p| p.page_index)
            .collect()
    }

    /// Indices of pages ingested with partial detection or missing markup.
    pub fn degraded(&self) -> Vec<usize> {
        self.pages
            .iter()
            .filter(|p| p.status.is_degraded())
            .map(|p| p.page_index)
            .collect()
    }

    /// Failed pages with their reasons.
    pub fn failed(&self) -> Vec<(usize, &PageError)> {
        self.pages
            .iter()
            .filter_map(|p| match &p.status {
                PageStatus::Failed { error } => Some((p.page_index, error)),
                _ => None,
            })
            .collect()
    }

    /// `true` when every page either succeeded or degraded.
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.stats.failed_pages == 0
    }
}
