//! Client-side replica of a document.
//!
//! Models what a connected editor does with the stream it receives: local
//! edits are applied immediately, at most one submission is in flight, and
//! edits made while waiting are composed into a buffer. Remote commits are
//! transformed against the pending edits before they touch local content.
//!
//! Used by the server's tests and by native clients embedding this crate.

use serde::{Deserialize, Serialize};

use super::document::Snapshot;
use super::operation::{CommittedOperation, Operation, TextOperation};
use super::{DocumentId, ParticipantId, SyncError, SyncResult};

/// Submission state of a replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaState {
    /// Nothing pending
    Synchronized,
    /// One operation sent, no reply yet
    AwaitingAck { inflight: Operation },
    /// One operation sent and further local edits waiting behind it
    AwaitingWithBuffer {
        inflight: Operation,
        buffer: TextOperation,
    },
}

/// Outcome of rebuilding a replica from a fresh snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resync {
    /// Nothing was pending
    Clean,
    /// Pending edits could not be replayed and are handed back to the editor
    Diverged { pending: Vec<TextOperation> },
}

#[derive(Debug, Clone)]
pub struct ClientReplica {
    participant_id: ParticipantId,
    document_id: DocumentId,
    content: String,
    server_version: u64,
    next_seq: u64,
    connected: bool,
    state: ReplicaState,
}

impl ClientReplica {
    pub fn new(participant_id: impl Into<ParticipantId>, snapshot: Snapshot) -> Self {
        Self {
            participant_id: participant_id.into(),
            document_id: snapshot.document_id,
            content: snapshot.content,
            server_version: snapshot.version,
            next_seq: 1,
            connected: true,
            state: ReplicaState::Synchronized,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Last server version this replica has incorporated
    pub fn server_version(&self) -> u64 {
        self.server_version
    }

    pub fn state(&self) -> &ReplicaState {
        &self.state
    }

    pub fn is_synchronized(&self) -> bool {
        self.state == ReplicaState::Synchronized
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn content_len(&self) -> usize {
        self.content.chars().count()
    }

    fn next_operation(&mut self, payload: TextOperation) -> Operation {
        let operation = Operation::new(
            self.participant_id.clone(),
            self.next_seq,
            self.server_version,
            payload,
        );
        self.next_seq += 1;
        operation
    }

    /// Apply a local edit; returns the operation to submit, if one should be sent now
    pub fn apply_local(&mut self, payload: TextOperation) -> SyncResult<Option<Operation>> {
        self.content = payload.apply(&self.content)?;

        let state = std::mem::replace(&mut self.state, ReplicaState::Synchronized);
        let (state, outgoing) = match state {
            ReplicaState::Synchronized => {
                let operation = self.next_operation(payload);
                (
                    ReplicaState::AwaitingAck {
                        inflight: operation.clone(),
                    },
                    self.connected.then_some(operation),
                )
            }
            ReplicaState::AwaitingAck { inflight } => (
                ReplicaState::AwaitingWithBuffer {
                    inflight,
                    buffer: payload,
                },
                None,
            ),
            ReplicaState::AwaitingWithBuffer { inflight, buffer } => (
                ReplicaState::AwaitingWithBuffer {
                    inflight,
                    buffer: buffer.compose(&payload)?,
                },
                None,
            ),
        };
        self.state = state;
        Ok(outgoing)
    }

    /// Build and apply an insert at `offset`
    pub fn insert(&mut self, offset: usize, text: &str) -> SyncResult<Option<Operation>> {
        let payload = TextOperation::insert_at(self.content_len(), offset, text)?;
        self.apply_local(payload)
    }

    /// Build and apply a delete of `len` chars at `offset`
    pub fn delete(&mut self, offset: usize, len: usize) -> SyncResult<Option<Operation>> {
        let payload = TextOperation::delete_at(self.content_len(), offset, len)?;
        self.apply_local(payload)
    }

    /// Server accepted our in-flight operation at `version`.
    ///
    /// Acks for anything but the current in-flight operation are stale and
    /// ignored. Returns the buffered operation to submit next, if any.
    pub fn on_ack(&mut self, client_seq: u64, version: u64) -> Option<Operation> {
        let inflight_seq = match &self.state {
            ReplicaState::Synchronized => return None,
            ReplicaState::AwaitingAck { inflight } | ReplicaState::AwaitingWithBuffer { inflight, .. } => {
                inflight.client_seq
            }
        };
        if client_seq != inflight_seq {
            return None;
        }

        self.server_version = self.server_version.max(version);
        match std::mem::replace(&mut self.state, ReplicaState::Synchronized) {
            ReplicaState::AwaitingWithBuffer { buffer, .. } => {
                let operation = self.next_operation(buffer);
                self.state = ReplicaState::AwaitingAck {
                    inflight: operation.clone(),
                };
                self.connected.then_some(operation)
            }
            _ => None,
        }
    }

    /// Incorporate a committed operation from the server.
    ///
    /// Our own in-flight operation showing up (during replay) counts as its
    /// ack. Returns an operation to submit when that ack released the buffer.
    pub fn on_remote(&mut self, committed: &CommittedOperation) -> SyncResult<Option<Operation>> {
        if committed.version <= self.server_version {
            return Ok(None);
        }
        if committed.version != self.server_version + 1 {
            return Err(SyncError::InvalidOperation(format!(
                "missed versions {}..{} of {}",
                self.server_version + 1,
                committed.version,
                self.document_id
            )));
        }

        let remote = &committed.operation;
        if remote.author_id == self.participant_id {
            if let Some(inflight) = self.inflight() {
                if inflight.client_seq == remote.client_seq {
                    return Ok(self.on_ack(remote.client_seq, committed.version));
                }
            }
        }

        // The server orders our pending edits after `remote` unless we win the tie-break
        let local_first = self.participant_id.as_str() < remote.author_id.as_str();
        let state = std::mem::replace(&mut self.state, ReplicaState::Synchronized);
        let (state, to_apply) = match state {
            ReplicaState::Synchronized => (ReplicaState::Synchronized, remote.payload.clone()),
            ReplicaState::AwaitingAck { mut inflight } => {
                let (inflight_prime, remote_prime) =
                    TextOperation::transform(&inflight.payload, &remote.payload, local_first)?;
                inflight.payload = inflight_prime;
                inflight.base_version = committed.version;
                (ReplicaState::AwaitingAck { inflight }, remote_prime)
            }
            ReplicaState::AwaitingWithBuffer {
                mut inflight,
                buffer,
            } => {
                let (inflight_prime, remote_prime) =
                    TextOperation::transform(&inflight.payload, &remote.payload, local_first)?;
                let (buffer_prime, remote_second) =
                    TextOperation::transform(&buffer, &remote_prime, local_first)?;
                inflight.payload = inflight_prime;
                inflight.base_version = committed.version;
                (
                    ReplicaState::AwaitingWithBuffer {
                        inflight,
                        buffer: buffer_prime,
                    },
                    remote_second,
                )
            }
        };

        self.content = to_apply.apply(&self.content)?;
        self.state = state;
        self.server_version = committed.version;
        Ok(None)
    }

    fn inflight(&self) -> Option<&Operation> {
        match &self.state {
            ReplicaState::Synchronized => None,
            ReplicaState::AwaitingAck { inflight } | ReplicaState::AwaitingWithBuffer { inflight, .. } => {
                Some(inflight)
            }
        }
    }

    /// Transport dropped; pending edits are kept for resubmission
    pub fn on_disconnect(&mut self) {
        self.connected = false;
    }

    /// Catch up after reconnecting using `operations_since(server_version)`.
    ///
    /// Returns the operation to (re)submit. A still-pending in-flight
    /// operation is resent with its original sequence number so the server
    /// can drop it if it had already been committed.
    pub fn resync(&mut self, replay: &[CommittedOperation]) -> SyncResult<Option<Operation>> {
        self.connected = true;
        let mut released = None;
        for committed in replay {
            if let Some(operation) = self.on_remote(committed)? {
                released = Some(operation);
            }
        }
        Ok(released.or_else(|| self.inflight().cloned()))
    }

    /// Adopt a fresh snapshot when replay is impossible (e.g. `StaleSnapshot`)
    pub fn reset(&mut self, snapshot: Snapshot) -> Resync {
        self.connected = true;
        self.content = snapshot.content;
        self.server_version = snapshot.version;

        match std::mem::replace(&mut self.state, ReplicaState::Synchronized) {
            ReplicaState::Synchronized => Resync::Clean,
            ReplicaState::AwaitingAck { inflight } => Resync::Diverged {
                pending: vec![inflight.payload],
            },
            ReplicaState::AwaitingWithBuffer { inflight, buffer } => Resync::Diverged {
                pending: vec![inflight.payload, buffer],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::document::Document;

    fn replica(id: &str, doc: &Document) -> ClientReplica {
        ClientReplica::new(id, doc.snapshot())
    }

    /// Commit on the server-side document
    fn submit(doc: &mut Document, op: Operation) -> CommittedOperation {
        doc.apply(op).unwrap().committed()
    }

    #[test]
    fn test_local_edits_buffer_while_awaiting() {
        let doc = Document::with_content("s/x", "s", "x", "");
        let mut x = replica("x", &doc);

        let first = x.insert(0, "a").unwrap();
        assert!(first.is_some());
        assert!(x.insert(1, "b").unwrap().is_none());
        assert!(x.insert(2, "c").unwrap().is_none());
        assert_eq!(x.content(), "abc");

        match x.state() {
            ReplicaState::AwaitingWithBuffer { buffer, .. } => {
                assert_eq!(buffer.apply("a").unwrap(), "abc")
            }
            other => panic!("unexpected state {:?}", other),
        }

        let next = x.on_ack(1, 1).unwrap();
        assert_eq!(next.client_seq, 2);
        assert_eq!(next.base_version, 1);
        assert!(x.on_ack(2, 2).is_none());
        assert!(x.is_synchronized());
    }

    #[test]
    fn test_stale_ack_is_ignored() {
        let doc = Document::new("s/x", "s", "x");
        let mut x = replica("x", &doc);
        x.insert(0, "a").unwrap();
        x.on_ack(1, 1);
        x.insert(1, "b").unwrap();

        assert!(x.on_ack(1, 1).is_none());
        assert!(!x.is_synchronized());
        assert_eq!(x.server_version(), 1);
    }

    #[test]
    fn test_two_replicas_converge() {
        let mut server = Document::with_content("s/t", "s", "t", "let v = [];");
        let mut x = replica("x", &server);
        let mut y = replica("y", &server);

        let ox = x.insert(0, "foo").unwrap().unwrap();
        let oy = y.insert(0, "bar").unwrap().unwrap();
        let oy2 = y.insert(12, "!").unwrap();
        assert!(oy2.is_none());

        let cx = submit(&mut server, ox);
        let cy = submit(&mut server, oy);

        x.on_ack(cx.operation.client_seq, cx.version);
        x.on_remote(&cy).unwrap();

        y.on_remote(&cx).unwrap();
        let oy2 = y.on_ack(cy.operation.client_seq, cy.version).unwrap();
        let cy2 = submit(&mut server, oy2);
        y.on_ack(cy2.operation.client_seq, cy2.version);
        x.on_remote(&cy2).unwrap();

        assert_eq!(server.content(), "foobarlet v = [!];");
        assert_eq!(x.content(), server.content());
        assert_eq!(y.content(), server.content());
        assert!(x.is_synchronized() && y.is_synchronized());
    }

    #[test]
    fn test_version_gap_is_reported() {
        let mut server = Document::new("s/t", "s", "t");
        let mut x = replica("x", &server);
        let c1 = submit(&mut server, Operation::new("y", 1, 0, TextOperation::insert_at(0, 0, "a").unwrap()));
        let c2 = submit(&mut server, Operation::new("y", 2, 1, TextOperation::insert_at(1, 1, "b").unwrap()));

        let err = x.on_remote(&c2).unwrap_err();
        assert!(err.requires_resync());
        x.on_remote(&c1).unwrap();
        x.on_remote(&c1).unwrap();
        x.on_remote(&c2).unwrap();
        assert_eq!(x.content(), "ab");
    }

    #[test]
    fn test_resync_recognises_own_commit() {
        let mut server = Document::new("s/x", "s", "x");
        let mut x = replica("x", &server);

        let op = x.insert(0, "hello").unwrap().unwrap();
        x.on_disconnect();
        // Landed on the server, but the ack was lost
        submit(&mut server, op);
        assert!(x.insert(5, "!").unwrap().is_none());

        let replay = server.operations_since(x.server_version()).unwrap();
        let resend = x.resync(&replay).unwrap().unwrap();
        assert_eq!(resend.client_seq, 2);
        assert_eq!(resend.base_version, 1);

        let committed = submit(&mut server, resend);
        x.on_ack(committed.operation.client_seq, committed.version);
        assert_eq!(server.content(), "hello!");
        assert_eq!(x.content(), "hello!");
    }

    #[test]
    fn test_resync_resends_unacknowledged_inflight() {
        let mut server = Document::new("s/x", "s", "x");
        let mut x = replica("x", &server);

        let op = x.insert(0, "abc").unwrap().unwrap();
        x.on_disconnect();
        assert!(x.insert(3, "d").unwrap().is_none());

        let replay = server.operations_since(x.server_version()).unwrap();
        let resend = x.resync(&replay).unwrap().unwrap();
        assert_eq!(resend, op);

        // Submitting twice is harmless
        let first = server.apply(resend.clone()).unwrap();
        let second = server.apply(resend).unwrap();
        assert!(second.duplicate);
        assert_eq!(first.version, second.version);
        assert_eq!(server.content(), "abc");
    }

    #[test]
    fn test_reset_hands_back_pending_edits() {
        let server = Document::with_content("s/x", "s", "x", "base");
        let mut x = replica("x", &server);
        x.insert(4, "1").unwrap();
        x.insert(5, "2").unwrap();

        let mut fresh = server.snapshot();
        fresh.content = "rebuilt".to_string();
        fresh.version = 40;
        match x.reset(fresh) {
            Resync::Diverged { pending } => assert_eq!(pending.len(), 2),
            Resync::Clean => panic!("pending edits were dropped"),
        }
        assert_eq!(x.content(), "rebuilt");
        assert_eq!(x.server_version(), 40);
        assert!(x.is_synchronized());
        assert_eq!(x.reset(server.snapshot()), Resync::Clean);
    }
}
