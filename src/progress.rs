//! Progress-callback trait for per-page ingestion events.
//!
//! Inject an [`Arc<dyn IngestionProgressCallback>`] via
//! [`crate::config::IngestionConfigBuilder::progress_callback`] to receive
//! events as the orchestrator processes each page. Pages run concurrently,
//! so events for different pages arrive from different tasks in any order.
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdfrag::{IngestionConfig, IngestionProgressCallback, PageStatus};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     done: AtomicUsize,
//! }
//!
//! impl IngestionProgressCallback for CountingCallback {
//!     fn on_page_complete(&self, page_index: usize, total_pages: usize, status: &PageStatus) {
//!         let n = self.done.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("page {} ({n}/{total_pages}): {status:?}", page_index + 1);
//!     }
//! }
//!
//! let config = IngestionConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { done: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::output::PageStatus;
use std::sync::Arc;

/// Called by the ingestion orchestrator as it processes each page.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Implementations must protect shared mutable state
/// (`Mutex`, atomics): page events are delivered concurrently.
pub trait IngestionProgressCallback: Send + Sync {
    /// Called once before any page task is dispatched.
    fn on_ingestion_start(&self, document_id: &str, total_pages: usize) {
        let _ = (document_id, total_pages);
    }

    /// Called when a page task starts rendering.
    ///
    /// `page_index` is zero-based.
    fn on_page_start(&self, page_index: usize, total_pages: usize) {
        let _ = (page_index, total_pages);
    }

    /// Called when a page finished as succeeded or degraded.
    fn on_page_complete(&self, page_index: usize, total_pages: usize, status: &PageStatus) {
        let _ = (page_index, total_pages, status);
    }

    /// Called when a page failed (render, inference, or index write).
    fn on_page_error(&self, page_index: usize, total_pages: usize, error: &str) {
        let _ = (page_index, total_pages, error);
    }

    /// Called once after every page has been attempted or abandoned.
    fn on_ingestion_complete(&self, total_pages: usize, ok_pages: usize, failed_pages: usize) {
        let _ = (total_pages, ok_pages, failed_pages);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl IngestionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::IngestionConfig`].
pub type ProgressCallback = Arc<dyn IngestionProgressCallback>;
