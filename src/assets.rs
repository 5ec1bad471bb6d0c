//! Storage for cropped visuals.
//!
//! The index only stores a reference to each crop. An [`AssetStore`] takes
//! the PNG bytes and hands back that reference; how the bytes are kept is up
//! to the implementation.

use crate::document::VisualAsset;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

/// Directory name for a document id: percent-encoded, so distinct ids never
/// share a directory. Dot-only ids are encoded too.
fn document_dir(document_id: &str) -> String {
    let dir = urlencoding::encode(document_id).into_owned();
    if dir.chars().all(|c| c == '.') {
        dir.replace('.', "%2E")
    } else {
        dir
    }
}

/// Reference for a crop: `{document}/page-{n}/{element}.png`, `n` one-based.
pub fn asset_reference(document_id: &str, asset: &VisualAsset) -> String {
    let element = asset.element_id.rsplit(':').next().unwrap_or(&asset.element_id);
    format!(
        "{}/page-{}/{}.png",
        document_dir(document_id),
        asset.page_index + 1,
        element
    )
}

/// Write-once store for crop images.
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Store the crop and return the reference to record in the index.
    async fn put(&self, document_id: &str, asset: &VisualAsset) -> io::Result<String>;

    /// Drop every crop of a document. Returns how many were removed.
    async fn delete_document(&self, document_id: &str) -> io::Result<usize>;
}

/// Keeps crops in memory.
#[derive(Debug, Default)]
pub struct InMemoryAssetStore {
    assets: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, reference: &str) -> Option<Vec<u8>> {
        self.assets.read().await.get(reference).cloned()
    }

    pub async fn len(&self) -> usize {
        self.assets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.assets.read().await.is_empty()
    }
}

#[async_trait]
impl AssetStore for InMemoryAssetStore {
    async fn put(&self, document_id: &str, asset: &VisualAsset) -> io::Result<String> {
        let reference = asset_reference(document_id, asset);
        self.assets
            .write()
            .await
            .insert(reference.clone(), asset.png.clone());
        Ok(reference)
    }

    async fn delete_document(&self, document_id: &str) -> io::Result<usize> {
        let mut assets = self.assets.write().await;
        let before = assets.len();
        let prefix = format!("{}/", document_dir(document_id));
        assets.retain(|k, _| !k.starts_with(&prefix));
        Ok(before - assets.len())
    }
}

/// Writes crops under a root directory, one sub-directory per document.
#[derive(Debug, Clone)]
pub struct DirectoryAssetStore {
    root: PathBuf,
}

impl DirectoryAssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path for a reference returned by [`AssetStore::put`].
    pub fn path_for(&self, reference: &str) -> PathBuf {
        self.root.join(reference)
    }
}

#[async_trait]
impl AssetStore for DirectoryAssetStore {
    async fn put(&self, document_id: &str, asset: &VisualAsset) -> io::Result<String> {
        let reference = asset_reference(document_id, asset);
        let path = self.path_for(&reference);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &asset.png).await?;
        debug!("Wrote {} ({} bytes)", path.display(), asset.png.len());
        Ok(reference)
    }

    async fn delete_document(&self, document_id: &str) -> io::Result<usize> {
        let dir = self.root.join(document_dir(document_id));
        match tokio::fs::metadata(&dir).await {
            Ok(m) if m.is_dir() => {
                let count = count_files(&dir).await?;
                tokio::fs::remove_dir_all(&dir).await?;
                Ok(count)
            }
            Ok(_) => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e),
        }
    }
}

async fn count_files(dir: &Path) -> io::Result<usize> {
    let mut count = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&d).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                stack.push(entry.path());
            } else {
                count += 1;
            }
        }
    }
    Ok(count)
}
