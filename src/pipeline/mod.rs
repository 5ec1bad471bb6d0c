//! Pipeline stages for PDF ingestion.
//!
//! Each submodule implements exactly one transformation step, so each is
//! testable on its own and backends (renderer, inference service) can be
//! swapped without touching the other stages.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ encode ──▶ detect ──▶ crop ──▶ (embed + index)
//! (path/URL) (pdfium)  (PNG/b64)  (layout)   (crop, table markup, caption)
//!              │
//!              └──▶ chunk (page text layer)
//! ```
//!
//! 1. [`input`]  — load a path, URL or byte buffer as a [`crate::Document`]
//! 2. [`render`] — rasterise one page and read its text layer; runs on
//!    the one pdfium worker thread, which keeps the open document
//! 3. [`encode`] — PNG-encode and base64-wrap images for request bodies
//! 4. [`detect`] — one layout call per page, parsed into typed elements
//! 5. [`crop`]   — crop visual regions; table structuring and captions
//! 6. [`chunk`]  — split the text layer into overlapping chunks
//! 7. [`postprocess`] — deterministic cleanup of model output

pub mod chunk;
pub mod crop;
pub mod detect;
pub mod encode;
pub mod input;
pub mod postprocess;
pub mod render;
