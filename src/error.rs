//! Error types for the edgequake-pdfrag library.
//!
//! Failures are split by the scope they affect:
//!
//! * [`PdfRagError`] — **Fatal**: nothing can proceed (bad input file, wrong
//!   password, provider not configured, index unreachable before ingestion
//!   starts). Returned as `Err(PdfRagError)` from the top-level entry points.
//!
//! * [`PageError`] — **Page-scoped**: one page could not be rendered, parsed
//!   or written. Stored inside [`crate::output::PageReport`] so the rest of
//!   the document is still ingested and reported.
//!
//! * [`InferenceError`] — the classification every call to the external
//!   vision/text service is reduced to. The rate-limited client retries the
//!   retryable variants and wraps the last one in
//!   [`InferenceError::RetriesExhausted`].
//!
//! * [`IndexError`] / [`QueryError`] — vector-index failures, and query-time
//!   failures tagged with the [`QueryStage`] that failed.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-pdfrag library.
#[derive(Debug, Error)]
pub enum PdfRagError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    /// The bytes were read, but they are not a PDF.
    #[error("Input '{source_name}' is not a valid PDF\nFirst bytes: {magic:?}")]
    NotAPdf { source_name: String, magic: [u8; 4] },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and the document cannot be opened.
    #[error("PDF '{document_id}' is corrupt: {detail}")]
    CorruptPdf { document_id: String, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{document_id}' is encrypted and requires a password.")]
    PasswordRequired { document_id: String },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{document_id}'")]
    WrongPassword { document_id: String },

    // ── Provider errors ───────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Index / query errors ──────────────────────────────────────────────
    /// The vector index failed outside of a single page's scope.
    #[error("Vector index error: {0}")]
    Index(#[from] IndexError),

    /// A query failed; the stage that failed is part of the error.
    #[error(transparent)]
    Query(#[from] QueryError),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH or place libpdfium next to the binary."
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

static RE_THROTTLE_STATUS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b429\b").unwrap());
static RE_FATAL_STATUS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b40[0134]\b").unwrap());

/// Outcome classification of a failed call to the inference service.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InferenceError {
    /// Upstream signalled rate limiting (HTTP 429 or equivalent).
    #[error("throttled by inference service: {detail}")]
    Throttled {
        /// Server-requested delay, when the service provided one.
        retry_after_ms: Option<u64>,
        detail: String,
    },

    /// Retryable network or server fault (timeouts, 5xx, connection resets).
    #[error("transient inference failure: {detail}")]
    Transient { detail: String },

    /// Non-retryable fault: malformed request, authentication failure.
    #[error("fatal inference failure: {detail}")]
    Fatal { detail: String },

    /// Backoff gave up; `last` is the error of the final attempt.
    #[error("inference failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<InferenceError>,
    },

    /// The response did not have the shape the task requires.
    #[error("unexpected inference response: {detail}")]
    UnexpectedResponse { detail: String },
}

impl InferenceError {
    /// `true` for the variants the rate-limited client retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InferenceError::Throttled { .. } | InferenceError::Transient { .. }
        )
    }

    /// Classify a provider error message into an [`InferenceError`].
    ///
    /// Providers surface HTTP failures as formatted strings, so the
    /// classification keys on status codes and well-known phrases. Anything
    /// unrecognised is treated as transient; the attempt budget bounds it.
    pub fn from_provider_message(message: impl Into<String>) -> Self {
        let detail = message.into();
        let lower = detail.to_lowercase();

        if RE_THROTTLE_STATUS.is_match(&lower)
            || lower.contains("rate limit")
            || lower.contains("ratelimit")
            || lower.contains("too many requests")
            || lower.contains("quota")
        {
            return InferenceError::Throttled {
                retry_after_ms: None,
                detail,
            };
        }

        let fatal_markers = [
            "unauthorized",
            "forbidden",
            "invalid api key",
            "invalid_api_key",
            "authentication",
            "invalid request",
            "invalid_request",
            "content_filter",
            "not configured",
        ];
        if RE_FATAL_STATUS.is_match(&lower) || fatal_markers.iter().any(|m| lower.contains(m)) {
            return InferenceError::Fatal { detail };
        }

        InferenceError::Transient { detail }
    }
}

/// A non-fatal error scoped to a single page.
///
/// Stored in [`crate::output::PageReport`]; sibling pages keep going.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum PageError {
    /// Page rasterisation failed (corrupt page data, pdfium error).
    #[error("Page {page}: rasterisation failed: {detail}")]
    RenderFailed { page: usize, detail: String },

    /// The layout response could not be parsed into elements.
    ///
    /// The page is ingested with zero detected elements.
    #[error("Page {page}: layout response could not be parsed: {detail}")]
    DetectionParse { page: usize, detail: String },

    /// An inference call needed by this page failed for good.
    #[error("Page {page}: inference failed during {stage}: {detail}")]
    InferenceFailed {
        page: usize,
        stage: String,
        detail: String,
    },

    /// Embedding or writing this page's records to the index failed.
    #[error("Page {page}: index write failed: {detail}")]
    IndexWriteFailed { page: usize, detail: String },

    /// Ingestion was cancelled before this page finished.
    #[error("Page {page}: cancelled")]
    Cancelled { page: usize },
}

impl PageError {
    /// Zero-based page index the error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::RenderFailed { page, .. }
            | PageError::DetectionParse { page, .. }
            | PageError::InferenceFailed { page, .. }
            | PageError::IndexWriteFailed { page, .. }
            | PageError::Cancelled { page } => *page,
        }
    }
}

/// Errors raised by a [`crate::index::VectorIndex`] implementation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum IndexError {
    /// The backing store could not be reached or refused the operation.
    #[error("index unavailable: {detail}")]
    Unavailable { detail: String },

    /// A record violated the payload invariants and was rejected.
    #[error("invalid record '{id}': {detail}")]
    InvalidRecord { id: String, detail: String },

    /// Loading or saving an index snapshot failed.
    #[error("index snapshot error at '{path}': {detail}")]
    Snapshot { path: PathBuf, detail: String },
}

/// The query-time stage that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStage {
    /// Computing the query embedding.
    Embedding,
    /// Similarity search over text records.
    TextSearch,
    /// Similarity search over visual records.
    VisualSearch,
}

impl fmt::Display for QueryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryStage::Embedding => "query embedding",
            QueryStage::TextSearch => "text search",
            QueryStage::VisualSearch => "visual search",
        };
        f.write_str(s)
    }
}

/// A query failed closed at `stage`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueryError {
    /// The query embedding could not be computed.
    #[error("{stage} failed: {source}")]
    Inference {
        stage: QueryStage,
        #[source]
        source: InferenceError,
    },

    /// The index failed while searching.
    #[error("{stage} failed: {source}")]
    Index {
        stage: QueryStage,
        #[source]
        source: IndexError,
    },
}

impl QueryError {
    /// The stage at which the query failed.
    pub fn stage(&self) -> QueryStage {
        match self {
            QueryError::Inference { stage, .. } | QueryError::Index { stage, .. } => *stage,
        }
    }
}
