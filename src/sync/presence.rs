//! Presence tracking for classroom sessions.
//!
//! This module holds live connection metadata that is never part of document content:
//! - Participant role, display name and color
//! - Online/offline state driven by heartbeats and a periodic sweep
//! - Cursor position within a document
//!
//! Every mutation returns the [`PresenceDelta`] it produced so the caller can hand it
//! to the broadcast router; in-process observers can also subscribe to a
//! per-session event stream.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use super::{DocumentId, ParticipantId, SessionId, SyncError};

/// Participant role within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Teacher,
    Student,
}

impl Role {
    pub fn is_teacher(&self) -> bool {
        matches!(self, Role::Teacher)
    }
}

/// Connection state as seen by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Online,
    Offline,
}

/// Cursor position in a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    /// Document the cursor is in
    pub document_id: DocumentId,
    /// Character offset
    pub offset: usize,
    /// Selection end offset (if selecting)
    pub selection_end: Option<usize>,
    /// Timestamp of last update (milliseconds since epoch)
    pub updated_at_ms: i64,
}

impl Cursor {
    pub fn new(document_id: impl Into<DocumentId>, offset: usize) -> Self {
        Self {
            document_id: document_id.into(),
            offset,
            selection_end: None,
            updated_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_selection(mut self, end: usize) -> Self {
        self.selection_end = Some(end);
        self
    }

    /// Selection as an ordered `(start, end)` range, if any
    pub fn selection_range(&self) -> Option<(usize, usize)> {
        self.selection_end
            .map(|end| (self.offset.min(end), self.offset.max(end)))
    }
}

/// Complete presence information for a participant
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub participant_id: ParticipantId,
    pub session_id: SessionId,
    /// Display name
    pub name: String,
    pub role: Role,
    /// Assigned color (hex)
    pub color: String,
    pub connection_state: ConnectionState,
    pub cursor: Option<Cursor>,
    /// When the participant first joined (unix seconds)
    pub joined_at: i64,
    /// Last heartbeat or activity (milliseconds since epoch)
    pub last_seen_ms: i64,
    /// Runtime-only last heartbeat instant (not serialized)
    #[serde(skip)]
    last_seen_instant: Option<Instant>,
}

impl Presence {
    pub fn new(
        participant_id: impl Into<String>,
        session_id: impl Into<String>,
        name: impl Into<String>,
        role: Role,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            participant_id: participant_id.into(),
            session_id: session_id.into(),
            name: name.into(),
            role,
            color: generate_participant_color(),
            connection_state: ConnectionState::Online,
            cursor: None,
            joined_at: now.timestamp(),
            last_seen_ms: now.timestamp_millis(),
            last_seen_instant: Some(Instant::now()),
        }
    }

    pub fn is_online(&self) -> bool {
        self.connection_state == ConnectionState::Online
    }

    /// Refresh the last-seen timestamps
    pub fn touch(&mut self, now: Instant) {
        self.last_seen_ms = chrono::Utc::now().timestamp_millis();
        self.last_seen_instant = Some(now);
    }

    /// Get the last-seen instant (for runtime use)
    pub fn last_seen(&self) -> Instant {
        self.last_seen_instant.unwrap_or_else(Instant::now)
    }

    fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        self.is_online() && now.saturating_duration_since(self.last_seen()) > timeout
    }
}

/// A single presence change, as broadcast to session participants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PresenceDelta {
    Joined {
        participant_id: ParticipantId,
        name: String,
        role: Role,
        color: String,
    },
    Left {
        participant_id: ParticipantId,
    },
    ConnectionChanged {
        participant_id: ParticipantId,
        state: ConnectionState,
    },
    CursorMoved {
        participant_id: ParticipantId,
        cursor: Cursor,
    },
}

impl PresenceDelta {
    pub fn participant_id(&self) -> &str {
        match self {
            PresenceDelta::Joined { participant_id, .. }
            | PresenceDelta::Left { participant_id }
            | PresenceDelta::ConnectionChanged { participant_id, .. }
            | PresenceDelta::CursorMoved { participant_id, .. } => participant_id,
        }
    }

    fn joined(presence: &Presence) -> Self {
        PresenceDelta::Joined {
            participant_id: presence.participant_id.clone(),
            name: presence.name.clone(),
            role: presence.role,
            color: presence.color.clone(),
        }
    }
}

/// A presence change tagged with its session, for in-process observers
#[derive(Debug, Clone)]
pub struct PresenceEvent {
    pub session_id: SessionId,
    pub delta: PresenceDelta,
}

/// Result of a heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Participant was already online
    Refreshed,
    /// Participant had timed out and is online again
    Recovered,
}

/// Errors related to presence operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum PresenceError {
    #[error("Participant not found: {0}")]
    ParticipantNotFound(ParticipantId),

    #[error("Participant {0} already present in session {1}")]
    ParticipantExists(ParticipantId, SessionId),
}

impl From<PresenceError> for SyncError {
    fn from(err: PresenceError) -> Self {
        match err {
            PresenceError::ParticipantNotFound(id) => SyncError::ParticipantNotFound(id),
            PresenceError::ParticipantExists(id, session) => SyncError::AlreadyJoined(id, session),
        }
    }
}

/// Presence table for one session
#[derive(Debug)]
pub struct SessionPresence {
    session_id: SessionId,
    participants: DashMap<ParticipantId, Presence>,
    event_tx: broadcast::Sender<PresenceEvent>,
}

impl SessionPresence {
    pub fn new(session_id: impl Into<String>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            session_id: session_id.into(),
            participants: DashMap::new(),
            event_tx,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Subscribe to presence events
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, delta: PresenceDelta) -> PresenceDelta {
        let _ = self.event_tx.send(PresenceEvent {
            session_id: self.session_id.clone(),
            delta: delta.clone(),
        });
        delta
    }

    /// Add a new participant
    pub fn add(&self, presence: Presence) -> Result<PresenceDelta, PresenceError> {
        let participant_id = presence.participant_id.clone();
        if self.participants.contains_key(&participant_id) {
            return Err(PresenceError::ParticipantExists(
                participant_id,
                self.session_id.clone(),
            ));
        }

        let delta = PresenceDelta::joined(&presence);
        self.participants.insert(participant_id, presence);
        Ok(self.emit(delta))
    }

    /// Remove a participant
    pub fn remove(&self, participant_id: &str) -> Option<Presence> {
        let removed = self.participants.remove(participant_id).map(|(_, p)| p);
        if removed.is_some() {
            self.emit(PresenceDelta::Left {
                participant_id: participant_id.to_string(),
            });
        }
        removed
    }

    /// Refresh a participant's last-seen time, bringing it back online if needed
    pub fn heartbeat(&self, participant_id: &str, now: Instant) -> Result<HeartbeatOutcome, PresenceError> {
        let recovered = {
            let mut entry = self
                .participants
                .get_mut(participant_id)
                .ok_or_else(|| PresenceError::ParticipantNotFound(participant_id.to_string()))?;
            entry.touch(now);
            let recovered = !entry.is_online();
            entry.connection_state = ConnectionState::Online;
            recovered
        };

        if recovered {
            self.emit(PresenceDelta::ConnectionChanged {
                participant_id: participant_id.to_string(),
                state: ConnectionState::Online,
            });
            Ok(HeartbeatOutcome::Recovered)
        } else {
            Ok(HeartbeatOutcome::Refreshed)
        }
    }

    /// Mark a participant offline; returns the delta if its state changed
    pub fn mark_offline(&self, participant_id: &str) -> Option<PresenceDelta> {
        {
            let mut entry = self.participants.get_mut(participant_id)?;
            if !entry.is_online() {
                return None;
            }
            entry.connection_state = ConnectionState::Offline;
            entry.cursor = None;
        }
        Some(self.emit(PresenceDelta::ConnectionChanged {
            participant_id: participant_id.to_string(),
            state: ConnectionState::Offline,
        }))
    }

    /// Update cursor position for a participant
    pub fn update_cursor(&self, participant_id: &str, cursor: Cursor) -> Result<PresenceDelta, PresenceError> {
        {
            let mut entry = self
                .participants
                .get_mut(participant_id)
                .ok_or_else(|| PresenceError::ParticipantNotFound(participant_id.to_string()))?;
            entry.cursor = Some(cursor.clone());
            entry.touch(Instant::now());
        }
        Ok(self.emit(PresenceDelta::CursorMoved {
            participant_id: participant_id.to_string(),
            cursor,
        }))
    }

    /// Mark every participant whose last heartbeat is older than `timeout` offline
    pub fn sweep(&self, now: Instant, timeout: Duration) -> Vec<(ParticipantId, PresenceDelta)> {
        let expired: Vec<ParticipantId> = self
            .participants
            .iter()
            .filter(|e| e.is_expired(now, timeout))
            .map(|e| e.participant_id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.mark_offline(&id).map(|delta| (id, delta)))
            .collect()
    }

    /// Get presence for a specific participant
    pub fn get(&self, participant_id: &str) -> Option<Presence> {
        self.participants.get(participant_id).map(|p| p.clone())
    }

    /// Get all presences
    pub fn all(&self) -> Vec<Presence> {
        self.participants.iter().map(|e| e.value().clone()).collect()
    }

    pub fn is_online(&self, participant_id: &str) -> bool {
        self.participants
            .get(participant_id)
            .map_or(false, |p| p.is_online())
    }

    /// Ids of all online participants
    pub fn online_ids(&self) -> Vec<ParticipantId> {
        self.participants
            .iter()
            .filter(|e| e.is_online())
            .map(|e| e.participant_id.clone())
            .collect()
    }

    pub fn online_count(&self) -> usize {
        self.participants.iter().filter(|e| e.is_online()).count()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

/// Presence across all sessions, with a participant -> session index
pub struct PresenceManager {
    sessions: DashMap<SessionId, Arc<SessionPresence>>,
    index: DashMap<ParticipantId, SessionId>,
}

impl PresenceManager {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            index: DashMap::new(),
        }
    }

    /// Get or create the presence table of a session
    pub fn get_or_create(&self, session_id: &str) -> Arc<SessionPresence> {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(SessionPresence::new(session_id)))
            .clone()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionPresence>> {
        self.sessions.get(session_id).map(|p| p.clone())
    }

    /// Add a participant to a session's table and index it
    pub fn register(&self, presence: Presence) -> Result<PresenceDelta, PresenceError> {
        let session = self.get_or_create(&presence.session_id);
        let participant_id = presence.participant_id.clone();
        let session_id = presence.session_id.clone();
        let delta = session.add(presence)?;
        self.index.insert(participant_id, session_id);
        Ok(delta)
    }

    /// Remove a participant from its session
    pub fn unregister(&self, participant_id: &str) -> Option<Presence> {
        let (_, session_id) = self.index.remove(participant_id)?;
        self.get(&session_id)?.remove(participant_id)
    }

    /// Session a participant currently belongs to
    pub fn session_of(&self, participant_id: &str) -> Option<SessionId> {
        self.index.get(participant_id).map(|s| s.clone())
    }

    pub fn is_online(&self, participant_id: &str) -> bool {
        self.session_of(participant_id)
            .and_then(|session_id| self.get(&session_id))
            .map_or(false, |session| session.is_online(participant_id))
    }

    /// Remove a session's presence table and all of its index entries
    pub fn remove(&self, session_id: &str) -> Option<Arc<SessionPresence>> {
        let (_, session) = self.sessions.remove(session_id)?;
        self.index.retain(|_, s| s.as_str() != session_id);
        Some(session)
    }

    /// Sweep every session; returns `(session, participant, delta)` for each timeout
    pub fn sweep_at(&self, now: Instant, timeout: Duration) -> Vec<(SessionId, ParticipantId, PresenceDelta)> {
        let sessions: Vec<Arc<SessionPresence>> = self.sessions.iter().map(|e| e.value().clone()).collect();
        sessions
            .into_iter()
            .flat_map(|session| {
                let session_id = session.session_id.clone();
                session
                    .sweep(now, timeout)
                    .into_iter()
                    .map(move |(participant, delta)| (session_id.clone(), participant, delta))
            })
            .collect()
    }

    /// Total number of participants across all sessions
    pub fn total_participant_count(&self) -> usize {
        self.sessions.iter().map(|p| p.len()).sum()
    }

    pub fn total_online_count(&self) -> usize {
        self.sessions.iter().map(|p| p.online_count()).sum()
    }
}

impl Default for PresenceManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper to generate a random color for a participant
pub fn generate_participant_color() -> String {
    use rand::Rng;
    let colors = [
        "#3b82f6", // blue
        "#ef4444", // red
        "#22c55e", // green
        "#f59e0b", // amber
        "#8b5cf6", // violet
        "#ec4899", // pink
        "#06b6d4", // cyan
        "#f97316", // orange
        "#14b8a6", // teal
        "#84cc16", // lime
        "#6366f1", // indigo
        "#0ea5e9", // sky
    ];
    let idx = rand::thread_rng().gen_range(0..colors.len());
    colors[idx].to_string()
}
