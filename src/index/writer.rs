//! Write path used by the ingestion orchestrator.
//!
//! Backends that accept concurrent inserts are written to directly. For the
//! rest, a single writer task owns the index and drains an `mpsc` queue, so
//! page tasks still run concurrently while their upserts are serialised.

use super::{IndexRecord, VectorIndex};
use crate::error::IndexError;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

struct WriteJob {
    records: Vec<IndexRecord>,
    reply: oneshot::Sender<Result<(), IndexError>>,
}

/// Handle page tasks use to upsert their records.
#[derive(Clone)]
pub enum IndexWriter {
    /// Call `upsert` directly from each page task.
    Direct(Arc<dyn VectorIndex>),
    /// Send jobs to the single writer task.
    Queued(mpsc::Sender<WriteJob>),
}

impl IndexWriter {
    /// Pick the write strategy the index supports.
    ///
    /// Spawns the writer task when a queue is needed; the task exits once
    /// every clone of the returned writer has been dropped.
    pub fn for_index(index: Arc<dyn VectorIndex>, queue_depth: usize) -> Self {
        if index.supports_concurrent_writes() {
            return IndexWriter::Direct(index);
        }

        let (tx, mut rx) = mpsc::channel::<WriteJob>(queue_depth.max(1));
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let n = job.records.len();
                let result = index.upsert(job.records).await;
                debug!("Single-writer upsert of {} records: ok={}", n, result.is_ok());
                // The page task may have been abandoned; nothing to report to.
                let _ = job.reply.send(result);
            }
        });
        IndexWriter::Queued(tx)
    }

    /// Upsert `records`, waiting for the write to land.
    pub async fn write(&self, records: Vec<IndexRecord>) -> Result<(), IndexError> {
        if records.is_empty() {
            return Ok(());
        }
        match self {
            IndexWriter::Direct(index) => index.upsert(records).await,
            IndexWriter::Queued(tx) => {
                let (reply, rx) = oneshot::channel();
                tx.send(WriteJob { records, reply })
                    .await
                    .map_err(|_| IndexError::Unavailable {
                        detail: "index writer task has stopped".into(),
                    })?;
                rx.await.map_err(|_| IndexError::Unavailable {
                    detail: "index writer dropped the write".into(),
                })?
            }
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, IndexWriter::Queued(_))
    }
}
