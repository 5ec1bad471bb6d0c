//! In-memory vector index using cosine similarity.
//!
//! Records live in a `HashMap` behind a `tokio::sync::RwLock`, so concurrent
//! upserts from page tasks need no external locking. The whole index can be
//! snapshotted to JSON so the CLI can ingest and query in separate runs.

use super::{cosine_similarity, rank_order, IndexRecord, RecordFilter, ScoredRecord, VectorIndex};
use crate::error::IndexError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// An in-memory [`VectorIndex`].
#[derive(Debug, Default)]
pub struct InMemoryVectorIndex {
    records: RwLock<HashMap<String, IndexRecord>>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    records: Vec<IndexRecord>,
}

const SNAPSHOT_VERSION: u32 = 1;

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Every record, sorted by id.
    pub async fn records(&self) -> Vec<IndexRecord> {
        let mut all: Vec<IndexRecord> = self.records.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Load a snapshot written by [`save`](Self::save).
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let path = path.as_ref();
        let snapshot_err = |detail: String| IndexError::Snapshot {
            path: path.to_path_buf(),
            detail,
        };

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| snapshot_err(e.to_string()))?;
        let snapshot: Snapshot =
            serde_json::from_slice(&bytes).map_err(|e| snapshot_err(e.to_string()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(snapshot_err(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        let records = snapshot
            .records
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect::<HashMap<_, _>>();
        info!("Loaded {} records from {}", records.len(), path.display());

        Ok(Self {
            records: RwLock::new(records),
        })
    }

    /// Load `path` if it exists, otherwise start empty.
    pub async fn load_or_default(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        if tokio::fs::try_exists(path.as_ref()).await.unwrap_or(false) {
            Self::load(path).await
        } else {
            Ok(Self::new())
        }
    }

    /// Write a JSON snapshot atomically (temp file in the same directory, then rename).
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), IndexError> {
        let path = path.as_ref().to_path_buf();
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            records: self.records().await,
        };
        let count = snapshot.records.len();

        let target = path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), String> {
            let dir = match target.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => std::path::PathBuf::from("."),
            };
            std::fs::create_dir_all(&dir).map_err(|e| e.to_string())?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| e.to_string())?;
            serde_json::to_writer(&mut tmp, &snapshot).map_err(|e| e.to_string())?;
            tmp.flush().map_err(|e| e.to_string())?;
            tmp.persist(&target).map_err(|e| e.to_string())?;
            Ok(())
        })
        .await
        .map_err(|e| IndexError::Snapshot {
            path: path.clone(),
            detail: format!("snapshot task panicked: {e}"),
        })?
        .map_err(|detail| IndexError::Snapshot {
            path: path.clone(),
            detail,
        })?;

        debug!("Saved {} records to {}", count, path.display());
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, records: Vec<IndexRecord>) -> Result<(), IndexError> {
        for record in &records {
            record.validate()?;
        }
        let mut store = self.records.write().await;
        for record in records {
            store.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn query(
        &self,
        embedding: &[f32],
        filter: &RecordFilter,
        top_k: usize,
    ) -> Result<Vec<ScoredRecord>, IndexError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let store = self.records.read().await;
        let mut scored: Vec<ScoredRecord> = store
            .values()
            .filter(|r| filter.matches(r))
            .map(|r| ScoredRecord {
                score: cosine_similarity(&r.embedding, embedding),
                record: r.clone(),
            })
            .collect();

        scored.sort_by(rank_order);
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn delete(&self, document_id: &str) -> Result<usize, IndexError> {
        let mut store = self.records.write().await;
        let before = store.len();
        store.retain(|_, r| r.payload.document_id != document_id);
        Ok(before - store.len())
    }
}
