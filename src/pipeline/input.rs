//! Input resolution: a user-supplied path, URL or byte buffer → [`Document`].
//!
//! pdfium renders straight from memory, so downloads never touch disk. The
//! `%PDF` magic is checked before anything else so callers get a meaningful
//! error rather than a pdfium failure deep inside a page task.

use crate::document::Document;
use crate::error::PdfRagError;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Load a document from a local path or HTTP(S) URL.
///
/// `document_id` defaults to the file name stem (see [`document_id_for`]).
pub async fn resolve_document(
    input: &str,
    document_id: Option<&str>,
    timeout_secs: u64,
) -> Result<Document, PdfRagError> {
    let id = document_id
        .map(str::to_string)
        .unwrap_or_else(|| document_id_for(input));

    let bytes = if is_url(input) {
        download_url(input, timeout_secs).await?
    } else {
        read_local(Path::new(input)).await?
    };

    Document::from_bytes(id, bytes).map_err(|e| match e {
        PdfRagError::NotAPdf { magic, .. } => PdfRagError::NotAPdf {
            source_name: input.to_string(),
            magic,
        },
        other => other,
    })
}

/// Derive a document id from a path or URL: the file stem, lower-cased, with
/// anything outside `[a-z0-9._-]` replaced by `-`.
pub fn document_id_for(input: &str) -> String {
    let last = if is_url(input) {
        reqwest::Url::parse(input)
            .ok()
            .and_then(|u| {
                u.path_segments()
                    .and_then(|mut s| s.next_back().map(str::to_string))
            })
            .unwrap_or_default()
    } else {
        Path::new(input)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };

    let stem = Path::new(&last)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let id: String = stem
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let id = id.trim_matches('-').to_string();
    if id.is_empty() {
        "document".to_string()
    } else {
        id
    }
}

async fn read_local(path: &Path) -> Result<Vec<u8>, PdfRagError> {
    let path_buf = PathBuf::from(path);
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            debug!("Read local PDF: {} ({} bytes)", path.display(), bytes.len());
            Ok(bytes)
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(PdfRagError::PermissionDenied { path: path_buf })
        }
        Err(_) => Err(PdfRagError::FileNotFound { path: path_buf }),
    }
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<Vec<u8>, PdfRagError> {
    info!("Downloading PDF from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| PdfRagError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            PdfRagError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            PdfRagError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(PdfRagError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| PdfRagError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    info!("Downloaded {} bytes", bytes.len());
    Ok(bytes.to_vec())
}
