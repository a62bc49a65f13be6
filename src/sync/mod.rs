//! Synchronization core for live coding classrooms.
//!
//! This module implements the real-time collaboration engine:
//! - Operational transformation for concurrent text edits
//! - One serialized document owner per participant document
//! - Session membership, share state and presence tracking
//! - Fan-out of committed operations and presence changes
//! - Log compaction into snapshots with low-water mark protection
//! - Binary WebSocket protocol for client/server messages

pub mod client;
pub mod document;
pub mod operation;
pub mod presence;
pub mod protocol;
pub mod router;
pub mod server;
pub mod session;
pub mod snapshot;
pub mod store;

pub use document::{AppliedResult, Document, Snapshot};
pub use operation::{CommittedOperation, Operation, TextOperation};
pub use server::{SyncServer, SyncServerConfig};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use operation::OperationError;

/// Unique identifier for a class session
pub type SessionId = String;

/// Unique identifier for a participant (teacher or student)
pub type ParticipantId = String;

/// Unique identifier for a document, one per (session, participant) pair
pub type DocumentId = String;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Build the stable document id for a participant's document in a session.
pub fn document_id(session_id: &str, participant_id: &str) -> DocumentId {
    format!("{}/{}", session_id, participant_id)
}

/// Errors that can occur during synchronization
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncError {
    /// Structurally malformed edit; the client must recompute against a fresh snapshot
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Requested version range was folded into a snapshot
    #[error("Stale snapshot: version {requested} is older than the oldest retained version {oldest}")]
    StaleSnapshot { requested: u64, oldest: u64 },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Missed heartbeats downgraded the participant to offline
    #[error("Presence timeout: {0}")]
    PresenceTimeout(ParticipantId),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Document not found: {0}")]
    DocumentNotFound(DocumentId),

    #[error("Participant not found: {0}")]
    ParticipantNotFound(ParticipantId),

    #[error("Participant {0} already joined session {1}")]
    AlreadyJoined(ParticipantId, SessionId),

    #[error("Session is full: {0}")]
    SessionFull(SessionId),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Whether retrying the same request unchanged may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransportFailure(_) | SyncError::Storage(_))
    }

    /// Whether the client must rebuild its replica from a fresh snapshot.
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            SyncError::StaleSnapshot { .. }
                | SyncError::InvalidOperation(_)
                | SyncError::PresenceTimeout(_)
        )
    }
}

impl From<OperationError> for SyncError {
    fn from(err: OperationError) -> Self {
        SyncError::InvalidOperation(err.to_string())
    }
}

impl From<crate::storage::StorageError> for SyncError {
    fn from(err: crate::storage::StorageError) -> Self {
        SyncError::Storage(err.to_string())
    }
}
