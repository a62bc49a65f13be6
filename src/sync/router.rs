//! Fan-out of committed operations and presence changes.
//!
//! The router only reads committed results; it never mutates documents or
//! presence. Each attached participant has one unbounded outbound channel,
//! drained by its WebSocket writer task. Messages for participants that are
//! offline or detached are dropped, never queued: a reconnecting client
//! resynchronizes through snapshot plus replay instead.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::operation::CommittedOperation;
use super::presence::{PresenceDelta, PresenceManager};
use super::protocol::ServerMessage;
use super::{DocumentId, ParticipantId, SyncError};

/// Outbound message channel of one participant connection
pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

pub struct BroadcastRouter {
    connections: DashMap<ParticipantId, Outbound>,
    subscriptions: DashMap<DocumentId, HashSet<ParticipantId>>,
    presence: Arc<PresenceManager>,
}

impl BroadcastRouter {
    pub fn new(presence: Arc<PresenceManager>) -> Self {
        Self {
            connections: DashMap::new(),
            subscriptions: DashMap::new(),
            presence,
        }
    }

    /// Attach a participant's outbound channel, replacing any previous one
    pub fn attach(&self, participant_id: &str, tx: Outbound) {
        if self.connections.insert(participant_id.to_string(), tx).is_some() {
            debug!(participant_id = %participant_id, "Replaced outbound channel");
        }
    }

    /// Detach a participant's channel and drop its subscriptions
    pub fn detach(&self, participant_id: &str) {
        self.connections.remove(participant_id);
        self.unsubscribe_all(participant_id);
    }

    /// Detach only if `tx` is still the attached channel
    pub fn detach_channel(&self, participant_id: &str, tx: &Outbound) -> bool {
        let removed = self
            .connections
            .remove_if(participant_id, |_, current| current.same_channel(tx))
            .is_some();
        if removed {
            self.unsubscribe_all(participant_id);
        }
        removed
    }

    pub fn is_attached(&self, participant_id: &str) -> bool {
        self.connections.contains_key(participant_id)
    }

    /// Replace the set of documents a participant receives.
    ///
    /// New documents are added before stale ones are removed, so a document
    /// in both sets keeps its subscriber throughout.
    pub fn set_subscriptions(&self, participant_id: &str, documents: &[DocumentId]) {
        let wanted: HashSet<&str> = documents.iter().map(String::as_str).collect();
        for document_id in documents {
            self.subscriptions
                .entry(document_id.clone())
                .or_default()
                .insert(participant_id.to_string());
        }

        let stale: Vec<DocumentId> = self
            .subscriptions
            .iter()
            .filter(|entry| !wanted.contains(entry.key().as_str()) && entry.value().contains(participant_id))
            .map(|entry| entry.key().clone())
            .collect();
        for document_id in stale {
            self.unsubscribe(participant_id, &document_id);
        }
    }

    fn unsubscribe(&self, participant_id: &str, document_id: &str) {
        if let Some(mut subscribers) = self.subscriptions.get_mut(document_id) {
            subscribers.remove(participant_id);
        }
        self.subscriptions
            .remove_if(document_id, |_, subscribers| subscribers.is_empty());
    }

    fn unsubscribe_all(&self, participant_id: &str) {
        let documents: Vec<DocumentId> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.value().contains(participant_id))
            .map(|entry| entry.key().clone())
            .collect();
        for document_id in documents {
            self.unsubscribe(participant_id, &document_id);
        }
    }

    /// Drop every subscription to a document
    pub fn drop_document(&self, document_id: &str) {
        self.subscriptions.remove(document_id);
    }

    /// Current subscribers of a document
    pub fn subscribers(&self, document_id: &str) -> Vec<ParticipantId> {
        self.subscriptions
            .get(document_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Deliver a committed operation to every online subscriber except its author.
    ///
    /// Called from the document's serializer, so per-document order matches
    /// commit order. Returns the number of recipients.
    pub fn publish(&self, document_id: &str, committed: &CommittedOperation) -> usize {
        let author = committed.operation.author_id.as_str();
        let recipients: Vec<ParticipantId> = self
            .subscribers(document_id)
            .into_iter()
            .filter(|p| p != author)
            .collect();

        let message = ServerMessage::OperationCommitted {
            document_id: document_id.to_string(),
            committed: committed.clone(),
        };
        let delivered = recipients
            .iter()
            .filter(|p| self.deliver_if_online(p, message.clone()))
            .count();

        debug!(
            document_id = %document_id,
            version = committed.version,
            delivered,
            "Published operation"
        );
        delivered
    }

    /// Deliver a presence change to every online participant of a session
    pub fn publish_presence(&self, session_id: &str, delta: &PresenceDelta) -> usize {
        let Some(session) = self.presence.get(session_id) else {
            return 0;
        };
        let message = ServerMessage::PresenceChanged {
            session_id: session_id.to_string(),
            delta: delta.clone(),
        };
        session
            .online_ids()
            .iter()
            .filter(|p| self.send_to(p, message.clone()))
            .count()
    }

    /// Send a message to every online participant of a session
    pub fn broadcast_session(&self, session_id: &str, message: &ServerMessage) -> usize {
        let Some(session) = self.presence.get(session_id) else {
            return 0;
        };
        session
            .online_ids()
            .iter()
            .filter(|p| self.send_to(p, message.clone()))
            .count()
    }

    fn deliver_if_online(&self, participant_id: &str, message: ServerMessage) -> bool {
        if !self.presence.is_online(participant_id) {
            return false;
        }
        self.send_to(participant_id, message)
    }

    /// Send directly to one participant; a closed channel is detached
    pub fn send_to(&self, participant_id: &str, message: ServerMessage) -> bool {
        let sent = match self.connections.get(participant_id) {
            Some(tx) => tx.send(message).is_ok(),
            None => return false,
        };
        if !sent {
            let err = SyncError::TransportFailure(format!("outbound channel of {} closed", participant_id));
            warn!(participant_id = %participant_id, error = %err, "Detaching participant");
            self.detach(participant_id);
        }
        sent
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
