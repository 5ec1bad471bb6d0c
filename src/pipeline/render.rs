//! PDF rasterisation: one page → `DynamicImage` + text layer, via pdfium.
//!
//! ## Why a dedicated thread?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state, blocks for the whole render and (with `thread_safe`) serialises
//! every call behind one global lock. All pdfium work therefore runs on one
//! process-wide worker thread: it binds the library once and keeps the
//! document it opened last, so rendering N pages parses the file once
//! instead of N times. Tokio workers only wait on a oneshot reply.
//!
//! ## Why cap pixels as well as DPI?
//!
//! Page sizes vary wildly: an A0 poster at 200 DPI is over 6,000 px wide.
//! `max_pixels` caps the longest edge so memory stays bounded whatever the
//! physical page size.

use crate::document::Document;
use crate::error::{PageError, PdfRagError};
use async_trait::async_trait;
use image::DynamicImage;
use once_cell::sync::OnceCell;
use pdfium_render::prelude::*;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Render resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub dpi: u32,
    /// Longest edge in pixels.
    pub max_pixels: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            dpi: 200,
            max_pixels: 2400,
        }
    }
}

/// A rasterised page and its embedded text.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub index: usize,
    pub image: DynamicImage,
    /// Text layer; empty for scanned pages.
    pub text: String,
}

/// Turns document pages into images. Deterministic for identical inputs.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Number of pages. Failure here is fatal for the document.
    async fn page_count(&self, document: &Document) -> Result<usize, PdfRagError>;

    /// Render one page. Failure is scoped to that page.
    async fn render(
        &self,
        document: &Document,
        page_index: usize,
        resolution: Resolution,
    ) -> Result<RenderedPage, PageError>;
}

/// [`PageRenderer`] backed by pdfium. Every instance shares the one worker
/// thread, started on first use.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfiumRenderer;

impl PdfiumRenderer {
    pub fn new() -> Self {
        Self
    }

    fn submit(&self, job: Job) -> Result<(), String> {
        worker()?
            .send(job)
            .map_err(|_| "pdfium thread has stopped".to_string())
    }
}

static WORKER: OnceCell<mpsc::Sender<Job>> = OnceCell::new();

fn worker() -> Result<&'static mpsc::Sender<Job>, String> {
    WORKER.get_or_try_init(|| {
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("pdfium".into())
            .spawn(move || run_worker(rx))
            .map_err(|e| format!("cannot start pdfium thread: {e}"))?;
        Ok(tx)
    })
}

enum Job {
    PageCount {
        document: Document,
        reply: oneshot::Sender<Result<usize, PdfRagError>>,
    },
    Render {
        document: Document,
        page_index: usize,
        resolution: Resolution,
        reply: oneshot::Sender<Result<RenderedPage, PageError>>,
    },
}

impl Job {
    fn reject(self, detail: &str) {
        match self {
            Job::PageCount { reply, .. } => {
                let _ = reply.send(Err(PdfRagError::PdfiumBindingFailed(detail.to_string())));
            }
            Job::Render {
                page_index, reply, ..
            } => {
                let _ = reply.send(Err(PageError::RenderFailed {
                    page: page_index,
                    detail: detail.to_string(),
                }));
            }
        }
    }
}

/// Identity of an opened document: the same shared bytes and password.
struct DocumentKey {
    bytes: Arc<[u8]>,
    password: Option<String>,
}

impl DocumentKey {
    fn of(document: &Document) -> Self {
        Self {
            bytes: Arc::clone(document.shared_bytes()),
            password: document.password().map(str::to_string),
        }
    }

    fn matches(&self, document: &Document) -> bool {
        Arc::ptr_eq(&self.bytes, document.shared_bytes())
            && self.password.as_deref() == document.password()
    }
}

struct OpenDocument<'p> {
    key: DocumentKey,
    pdf: PdfDocument<'p>,
}

fn run_worker(jobs: mpsc::Receiver<Job>) {
    let pdfium = match bind_pdfium() {
        Ok(pdfium) => pdfium,
        Err(detail) => {
            warn!("pdfium unavailable: {detail}");
            for job in jobs {
                job.reject(&detail);
            }
            return;
        }
    };
    debug!("pdfium bound");

    let mut open: Option<OpenDocument<'_>> = None;
    for job in jobs {
        // A panic drops the reply, which the caller sees as a failure.
        let served = panic::catch_unwind(AssertUnwindSafe(|| serve(&pdfium, &mut open, job)));
        if served.is_err() {
            warn!("pdfium job panicked; dropping the open document");
            open = None;
        }
    }
}

fn serve<'p>(pdfium: &'p Pdfium, open: &mut Option<OpenDocument<'p>>, job: Job) {
    match job {
        Job::PageCount { document, reply } => {
            let result = open_cached(pdfium, open, &document)
                .map(|pdf| pdf.pages().len() as usize)
                .map_err(|e| open_error(document.id(), document.password().is_some(), e));
            if let Ok(count) = &result {
                info!("PDF '{}' loaded: {} pages", document.id(), count);
            }
            let _ = reply.send(result);
        }
        Job::Render {
            document,
            page_index,
            resolution,
            reply,
        } => {
            let result = match open_cached(pdfium, open, &document) {
                Ok(pdf) => render_page(pdf, page_index, resolution),
                Err(e) => Err(PageError::RenderFailed {
                    page: page_index,
                    detail: format!("{e:?}"),
                }),
            };
            let _ = reply.send(result);
        }
    }
}

/// The parsed document, reusing the open one when it is the same.
fn open_cached<'a, 'p>(
    pdfium: &'p Pdfium,
    slot: &'a mut Option<OpenDocument<'p>>,
    document: &Document,
) -> Result<&'a PdfDocument<'p>, PdfiumError> {
    let open = match slot.take() {
        Some(open) if open.key.matches(document) => open,
        stale => {
            drop(stale);
            let pdf = pdfium.load_pdf_from_byte_vec(document.bytes().to_vec(), document.password())?;
            debug!("Parsed '{}' ({} bytes)", document.id(), document.bytes().len());
            OpenDocument {
                key: DocumentKey::of(document),
                pdf,
            }
        }
    };
    Ok(&slot.insert(open).pdf)
}

/// Bind pdfium: `PDFIUM_LIB_PATH`, then next to the executable, then the system library.
fn bind_pdfium() -> Result<Pdfium, String> {
    let mut attempts = Vec::new();
    if let Ok(dir) = std::env::var("PDFIUM_LIB_PATH") {
        attempts.push(Pdfium::pdfium_platform_library_name_at_path(&dir));
    }
    attempts.push(Pdfium::pdfium_platform_library_name_at_path("./"));

    for path in attempts {
        if let Ok(bindings) = Pdfium::bind_to_library(&path) {
            return Ok(Pdfium::new(bindings));
        }
    }
    Pdfium::bind_to_system_library()
        .map(Pdfium::new)
        .map_err(|e| format!("{e:?}"))
}

fn open_error(document_id: &str, has_password: bool, err: PdfiumError) -> PdfRagError {
    let err_str = format!("{err:?}");
    if err_str.contains("Password") || err_str.contains("password") {
        if has_password {
            PdfRagError::WrongPassword {
                document_id: document_id.to_string(),
            }
        } else {
            PdfRagError::PasswordRequired {
                document_id: document_id.to_string(),
            }
        }
    } else {
        PdfRagError::CorruptPdf {
            document_id: document_id.to_string(),
            detail: err_str,
        }
    }
}

fn render_page(
    pdf: &PdfDocument<'_>,
    page_index: usize,
    resolution: Resolution,
) -> Result<RenderedPage, PageError> {
    let fail = |detail: String| PageError::RenderFailed {
        page: page_index,
        detail,
    };

    let index = u16::try_from(page_index).map_err(|_| fail("page index out of range".into()))?;
    let page = pdf.pages().get(index).map_err(|e| fail(format!("{e:?}")))?;

    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(resolution.dpi as f32 / 72.0)
        .set_maximum_width(resolution.max_pixels as i32)
        .set_maximum_height(resolution.max_pixels as i32);

    let bitmap = page
        .render_with_config(&render_config)
        .map_err(|e| fail(format!("{e:?}")))?;
    let image = bitmap.as_image();

    // A missing text layer is normal for scanned pages.
    let text = page.text().map(|t| t.all()).unwrap_or_default();

    debug!(
        "Rendered page {} → {}x{} px, {} chars of text",
        page_index + 1,
        image.width(),
        image.height(),
        text.len()
    );

    Ok(RenderedPage {
        index: page_index,
        image,
        text,
    })
}

#[async_trait]
impl PageRenderer for PdfiumRenderer {
    async fn page_count(&self, document: &Document) -> Result<usize, PdfRagError> {
        let (reply, result) = oneshot::channel();
        self.submit(Job::PageCount {
            document: document.clone(),
            reply,
        })
        .map_err(PdfRagError::Internal)?;
        result
            .await
            .map_err(|_| PdfRagError::Internal("page count job was dropped".into()))?
    }

    async fn render(
        &self,
        document: &Document,
        page_index: usize,
        resolution: Resolution,
    ) -> Result<RenderedPage, PageError> {
        let fail = |detail: String| PageError::RenderFailed {
            page: page_index,
            detail,
        };
        let (reply, result) = oneshot::channel();
        self.submit(Job::Render {
            document: document.clone(),
            page_index,
            resolution,
            reply,
        })
        .map_err(fail)?;
        result
            .await
            .map_err(|_| fail("render job was dropped".into()))?
    }
}
