//! Document store: one serializer task per document.
//!
//! Every [`Document`] is moved into its own tokio task that drains a command
//! queue in arrival order, so all mutations of one document are serialized
//! while different documents proceed in parallel. Callers talk to the task
//! through a [`DocumentHandle`] and await replies on oneshot channels.
//!
//! After each commit the task publishes to the [`BroadcastRouter`] before it
//! takes the next command, so subscribers see operations in commit order.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::document::{AppliedResult, Document, Snapshot};
use super::operation::{CommittedOperation, Operation};
use super::router::BroadcastRouter;
use super::snapshot::{CompactionJob, SnapshotService};
use super::{document_id, DocumentId, ParticipantId, SyncError, SyncResult};

/// Default number of logged operations that triggers compaction
pub const DEFAULT_COMPACTION_THRESHOLD: usize = 200;

/// Commands understood by a document task
pub enum DocumentCommand {
    Apply {
        operation: Operation,
        reply: oneshot::Sender<SyncResult<AppliedResult>>,
    },
    /// Current content; tracks `participant_id` at the returned version
    Snapshot {
        participant_id: Option<ParticipantId>,
        reply: oneshot::Sender<Snapshot>,
    },
    /// Committed operations newer than `version`; tracks the caller at the latest one
    OperationsSince {
        participant_id: Option<ParticipantId>,
        version: u64,
        reply: oneshot::Sender<SyncResult<Vec<CommittedOperation>>>,
    },
    Acknowledge {
        participant_id: ParticipantId,
        version: u64,
    },
    /// Start tracking a subscriber for the low-water mark
    Track {
        participant_id: ParticipantId,
    },
    Forget {
        participant_id: ParticipantId,
    },
    /// Result of a finished compaction
    InstallSnapshot {
        snapshot: Snapshot,
    },
    CompactionAborted,
    /// Drain queued commands and hand back the final document
    Close {
        reply: oneshot::Sender<Document>,
    },
}

/// Sender side of a document task's queue
#[derive(Clone)]
pub struct DocumentHandle {
    document_id: DocumentId,
    tx: mpsc::UnboundedSender<DocumentCommand>,
}

impl DocumentHandle {
    fn send(&self, command: DocumentCommand) -> SyncResult<()> {
        self.tx
            .send(command)
            .map_err(|_| SyncError::DocumentNotFound(self.document_id.clone()))
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> DocumentCommand) -> SyncResult<T> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply))?;
        rx.await.map_err(|_| {
            SyncError::Internal(format!("document task for {} stopped", self.document_id))
        })
    }
}

struct DocumentTask {
    document: Document,
    router: Arc<BroadcastRouter>,
    snapshots: SnapshotService,
    compaction_threshold: usize,
    compacting: bool,
    queue: mpsc::WeakUnboundedSender<DocumentCommand>,
}

impl DocumentTask {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<DocumentCommand>) {
        let document_id = self.document.id().to_string();
        debug!(document_id = %document_id, "Document task started");

        while let Some(command) = rx.recv().await {
            if let DocumentCommand::Close { reply } = command {
                rx.close();
                while let Ok(pending) = rx.try_recv() {
                    if !matches!(pending, DocumentCommand::Close { .. }) {
                        self.handle(pending);
                    }
                }
                info!(
                    document_id = %document_id,
                    session_id = %self.document.session_id(),
                    version = self.document.version(),
                    "Document closed"
                );
                let _ = reply.send(self.document);
                return;
            }
            self.handle(command);
        }

        debug!(document_id = %document_id, "Document task stopped");
    }

    fn handle(&mut self, command: DocumentCommand) {
        match command {
            DocumentCommand::Apply { operation, reply } => {
                let result = self.document.apply(operation);
                match &result {
                    Ok(applied) if !applied.duplicate => {
                        self.router.publish(self.document.id(), &applied.committed());
                        self.maybe_compact();
                    }
                    Ok(_) => debug!(document_id = %self.document.id(), "Duplicate submission"),
                    Err(e) => debug!(document_id = %self.document.id(), error = %e, "Operation rejected"),
                }
                let _ = reply.send(result);
            }
            DocumentCommand::Snapshot { participant_id, reply } => {
                let snapshot = self.document.snapshot();
                if let Some(participant_id) = participant_id {
                    self.document.acknowledge(&participant_id, snapshot.version);
                }
                let _ = reply.send(snapshot);
            }
            DocumentCommand::OperationsSince {
                participant_id,
                version,
                reply,
            } => {
                let result = self.document.operations_since(version);
                if let (Ok(_), Some(participant_id)) = (&result, participant_id) {
                    self.document.acknowledge(&participant_id, self.document.version());
                }
                let _ = reply.send(result);
            }
            DocumentCommand::Acknowledge {
                participant_id,
                version,
            } => {
                self.document.acknowledge(&participant_id, version);
                self.maybe_compact();
            }
            DocumentCommand::Track { participant_id } => {
                if self.document.track(&participant_id) {
                    debug!(
                        document_id = %self.document.id(),
                        participant_id = %participant_id,
                        version = self.document.version(),
                        "Tracking subscriber"
                    );
                }
            }
            DocumentCommand::Forget { participant_id } => {
                if self.document.forget(&participant_id) {
                    self.maybe_compact();
                }
            }
            DocumentCommand::InstallSnapshot { snapshot } => {
                self.compacting = false;
                let version = snapshot.version;
                if self.document.install_snapshot(snapshot) {
                    debug!(
                        document_id = %self.document.id(),
                        version,
                        remaining = self.document.log_len(),
                        "Installed snapshot"
                    );
                }
            }
            DocumentCommand::CompactionAborted => {
                self.compacting = false;
            }
            DocumentCommand::Close { .. } => {}
        }
    }

    fn maybe_compact(&mut self) {
        if self.compacting || self.document.log_len() <= self.compaction_threshold {
            return;
        }
        let Some((base, operations)) = self.document.compaction_input() else {
            return;
        };
        let Some(reply) = self.queue.upgrade() else {
            return;
        };

        let job = CompactionJob {
            document_id: self.document.id().to_string(),
            base,
            operations,
            reply,
        };
        if self.snapshots.submit(job) {
            self.compacting = true;
        } else {
            warn!(document_id = %self.document.id(), "Snapshot service unavailable");
        }
    }
}

/// Registry of live document tasks
pub struct DocumentStore {
    documents: DashMap<DocumentId, DocumentHandle>,
    router: Arc<BroadcastRouter>,
    snapshots: SnapshotService,
    compaction_threshold: usize,
}

impl DocumentStore {
    pub fn new(router: Arc<BroadcastRouter>, snapshots: SnapshotService) -> Self {
        Self {
            documents: DashMap::new(),
            router,
            snapshots,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
        }
    }

    pub fn with_compaction_threshold(mut self, threshold: usize) -> Self {
        self.compaction_threshold = threshold;
        self
    }

    /// Create the document owned by `owner_id` in a session and start its task.
    ///
    /// Idempotent: an existing document keeps its content and id.
    pub fn create_document(&self, session_id: &str, owner_id: &str, initial_content: &str) -> DocumentId {
        let id = document_id(session_id, owner_id);
        self.documents.entry(id.clone()).or_insert_with(|| {
            let document = Document::with_content(id.clone(), session_id, owner_id, initial_content);
            let (tx, rx) = mpsc::unbounded_channel();
            let task = DocumentTask {
                document,
                router: self.router.clone(),
                snapshots: self.snapshots.clone(),
                compaction_threshold: self.compaction_threshold,
                compacting: false,
                queue: tx.downgrade(),
            };
            tokio::spawn(task.run(rx));
            self.snapshots.register(&id, session_id, owner_id);
            info!(document_id = %id, "Document created");
            DocumentHandle {
                document_id: id.clone(),
                tx,
            }
        });
        id
    }

    fn handle(&self, document_id: &str) -> SyncResult<DocumentHandle> {
        self.documents
            .get(document_id)
            .map(|h| h.clone())
            .ok_or_else(|| SyncError::DocumentNotFound(document_id.to_string()))
    }

    pub fn contains(&self, document_id: &str) -> bool {
        self.documents.contains_key(document_id)
    }

    /// Current content and version; tracks `participant_id` for the low-water mark
    pub async fn get_snapshot(&self, document_id: &str, participant_id: Option<&str>) -> SyncResult<Snapshot> {
        let participant_id = participant_id.map(str::to_string);
        self.handle(document_id)?
            .request(|reply| DocumentCommand::Snapshot {
                participant_id,
                reply,
            })
            .await
    }

    /// Submit an operation and wait for it to be committed
    pub async fn apply_operation(&self, document_id: &str, operation: Operation) -> SyncResult<AppliedResult> {
        self.handle(document_id)?
            .request(|reply| DocumentCommand::Apply { operation, reply })
            .await?
    }

    pub async fn operations_since(
        &self,
        document_id: &str,
        participant_id: Option<&str>,
        version: u64,
    ) -> SyncResult<Vec<CommittedOperation>> {
        let participant_id = participant_id.map(str::to_string);
        self.handle(document_id)?
            .request(|reply| DocumentCommand::OperationsSince {
                participant_id,
                version,
                reply,
            })
            .await?
    }

    /// Record the version a client holds (fire-and-forget)
    pub fn acknowledge(&self, document_id: &str, participant_id: &str, version: u64) -> SyncResult<()> {
        self.handle(document_id)?.send(DocumentCommand::Acknowledge {
            participant_id: participant_id.to_string(),
            version,
        })
    }

    /// Track a subscriber at the document's current version (fire-and-forget)
    pub fn track(&self, document_id: &str, participant_id: &str) {
        if let Ok(handle) = self.handle(document_id) {
            let _ = handle.send(DocumentCommand::Track {
                participant_id: participant_id.to_string(),
            });
        }
    }

    /// Stop tracking a client in the low-water mark (fire-and-forget)
    pub fn forget(&self, document_id: &str, participant_id: &str) {
        if let Ok(handle) = self.handle(document_id) {
            let _ = handle.send(DocumentCommand::Forget {
                participant_id: participant_id.to_string(),
            });
        }
    }

    /// Stop a document's task after it drained its queue; returns the final state
    pub async fn close(&self, document_id: &str) -> SyncResult<Document> {
        let (_, handle) = self
            .documents
            .remove(document_id)
            .ok_or_else(|| SyncError::DocumentNotFound(document_id.to_string()))?;
        self.router.drop_document(document_id);
        handle.request(|reply| DocumentCommand::Close { reply }).await
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }
}
