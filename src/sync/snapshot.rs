//! Snapshot/recovery service.
//!
//! Folds the oldest part of a document's operation log into a new snapshot off
//! the document's serializer task, persists it, and hands it back to the owning
//! actor as an `InstallSnapshot` command. The actor never waits for it.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::document::Snapshot;
use super::operation::CommittedOperation;
use super::store::DocumentCommand;
use super::{DocumentId, SyncError, SyncResult};
use crate::storage::{DocumentMetadata, SnapshotRecord, SnapshotStore};

/// Work item sent by a document actor whose log grew past the threshold
pub struct CompactionJob {
    pub document_id: DocumentId,
    /// Snapshot the operations start from
    pub base: Snapshot,
    /// Consecutive committed operations, none newer than the low-water mark
    pub operations: Vec<CommittedOperation>,
    /// Command queue of the owning actor
    pub reply: mpsc::UnboundedSender<DocumentCommand>,
}

/// Apply `operations` on top of `base`, checking that versions are consecutive.
pub fn fold(base: &Snapshot, operations: &[CommittedOperation]) -> SyncResult<Snapshot> {
    let mut content = base.content.clone();
    let mut version = base.version;

    for committed in operations {
        if committed.version != version + 1 {
            return Err(SyncError::Internal(format!(
                "gap in operation log of {}: expected version {}, found {}",
                base.document_id,
                version + 1,
                committed.version
            )));
        }
        content = committed.operation.payload.apply(&content)?;
        version = committed.version;
    }

    Ok(Snapshot {
        document_id: base.document_id.clone(),
        content,
        version,
    })
}

/// Handle to the background compaction task
#[derive(Clone)]
pub struct SnapshotService {
    jobs: mpsc::UnboundedSender<CompactionJob>,
    storage: Option<Arc<SnapshotStore>>,
}

impl SnapshotService {
    /// Spawn the compaction task. Must be called inside a tokio runtime.
    pub fn spawn(storage: Option<Arc<SnapshotStore>>) -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<CompactionJob>();
        let task_storage = storage.clone();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let storage = task_storage.clone();
                let document_id = job.document_id.clone();
                let reply = job.reply.clone();

                // Folding and sled writes are blocking work
                let outcome = tokio::task::spawn_blocking(move || compact(job, storage.as_deref())).await;

                let command = match outcome {
                    Ok(Ok(snapshot)) => {
                        debug!(document_id = %document_id, version = snapshot.version, "Compaction finished");
                        DocumentCommand::InstallSnapshot { snapshot }
                    }
                    Ok(Err(e)) => {
                        error!(document_id = %document_id, error = %e, "Compaction failed");
                        DocumentCommand::CompactionAborted
                    }
                    Err(e) => {
                        error!(document_id = %document_id, error = %e, "Compaction task panicked");
                        DocumentCommand::CompactionAborted
                    }
                };

                if reply.send(command).is_err() {
                    debug!(document_id = %document_id, "Document closed before compaction finished");
                }
            }
            info!("Snapshot service stopped");
        });

        Self { jobs, storage }
    }

    /// Queue a compaction job; false when the service has stopped
    pub fn submit(&self, job: CompactionJob) -> bool {
        self.jobs.send(job).is_ok()
    }

    /// Register a new document so later snapshots update its metadata
    pub fn register(&self, document_id: &str, session_id: &str, owner_id: &str) {
        if let Some(storage) = &self.storage {
            let meta = DocumentMetadata::new(document_id, session_id, owner_id);
            if let Err(e) = storage.save_metadata(&meta) {
                warn!(document_id = %document_id, error = %e, "Failed to save document metadata");
            }
        }
    }
}

fn compact(job: CompactionJob, storage: Option<&SnapshotStore>) -> SyncResult<Snapshot> {
    let snapshot = fold(&job.base, &job.operations)?;

    if let Some(storage) = storage {
        storage.save_snapshot(&SnapshotRecord {
            document_id: snapshot.document_id.clone(),
            content: snapshot.content.clone(),
            version: snapshot.version,
            taken_at: chrono::Utc::now().timestamp_millis(),
        })?;
    }

    Ok(snapshot)
}
