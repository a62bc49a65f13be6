//! SyncServer: the facade tying sessions, presence, documents and fan-out together.
//!
//! Every transport goes through this type. It owns:
//! - DashMap of live class sessions
//! - The presence manager and broadcast router shared with document tasks
//! - The document store (one serialized task per participant document)
//! - Resume tokens for reconnecting transports
//!
//! Capability checks are delegated to [`ClassSession`]; document mutation
//! only ever happens inside a document task.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::document::{AppliedResult, Snapshot};
use super::operation::{CommittedOperation, Operation};
use super::presence::{
    ConnectionState, Cursor, HeartbeatOutcome, Presence, PresenceDelta, PresenceManager, Role,
};
use super::protocol::{ParticipantInfo, ServerMessage, SyncProtocol};
use super::router::{BroadcastRouter, Outbound};
use super::session::{ClassSession, ShareState, Subscription, SummaryReport, ViewMode};
use super::snapshot::SnapshotService;
use super::store::{DocumentStore, DEFAULT_COMPACTION_THRESHOLD};
use super::{document_id, DocumentId, ParticipantId, SessionId, SyncError, SyncResult};
use crate::storage::{ArchivedDocument, SessionArchive, SnapshotStore, StorageStats};

/// Session ids are short enough to read out in class, so collisions are retried
const SESSION_ID_LEN: usize = 8;
const MAX_SESSION_ID_ATTEMPTS: usize = 16;

fn short_session_id() -> SessionId {
    uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(SESSION_ID_LEN)
        .collect()
}

/// Configuration for the SyncServer
#[derive(Debug, Clone)]
pub struct SyncServerConfig {
    /// Participants without a heartbeat for this long are marked offline
    pub heartbeat_timeout: Duration,
    /// How often the presence sweep runs
    pub sweep_interval: Duration,
    /// How often the snapshot store is flushed
    pub flush_interval: Duration,
    /// Log length above which a document is compacted
    pub compaction_threshold: usize,
    /// Roster limit per session, teacher included
    pub max_participants_per_session: usize,
    /// Maximum number of concurrent sessions
    pub max_sessions: usize,
    /// Time clients get to flush edits after `SessionEnding`
    pub end_session_grace: Duration,
}

impl Default for SyncServerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            flush_interval: Duration::from_secs(5),
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            max_participants_per_session: 60,
            max_sessions: 500,
            end_session_grace: Duration::from_secs(2),
        }
    }
}

impl SyncServerConfig {
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_compaction_threshold(mut self, threshold: usize) -> Self {
        self.compaction_threshold = threshold;
        self
    }

    pub fn with_max_participants(mut self, max: usize) -> Self {
        self.max_participants_per_session = max;
        self
    }

    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    pub fn with_end_session_grace(mut self, grace: Duration) -> Self {
        self.end_session_grace = grace;
        self
    }
}

/// Summary of a live session, as listed over HTTP
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub teacher_id: ParticipantId,
    pub problem_id: Option<String>,
    pub created_at: i64,
    pub participant_count: usize,
    pub online_count: usize,
    pub share_state: ShareState,
    pub view_mode: ViewMode,
}

/// Session summary plus the presence of every participant
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetail {
    #[serde(flatten)]
    pub info: SessionInfo,
    pub presence: Vec<Presence>,
}

/// The main synchronization server
pub struct SyncServer {
    config: SyncServerConfig,
    /// Live class sessions
    sessions: DashMap<SessionId, Arc<ClassSession>>,
    presence: Arc<PresenceManager>,
    router: Arc<BroadcastRouter>,
    documents: DocumentStore,
    /// Resume token -> (session, participant)
    resume_tokens: DashMap<String, (SessionId, ParticipantId)>,
    storage: Option<Arc<SnapshotStore>>,
    started_at: Instant,
    shutdown_tx: broadcast::Sender<()>,
}

impl SyncServer {
    /// Create a new sync server. Spawns the snapshot service, so it must be
    /// called inside a tokio runtime.
    pub fn new(storage: Option<Arc<SnapshotStore>>, config: SyncServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let presence = Arc::new(PresenceManager::new());
        let router = Arc::new(BroadcastRouter::new(presence.clone()));
        let documents = DocumentStore::new(router.clone(), SnapshotService::spawn(storage.clone()))
            .with_compaction_threshold(config.compaction_threshold);

        Self {
            config,
            sessions: DashMap::new(),
            presence,
            router,
            documents,
            resume_tokens: DashMap::new(),
            storage,
            started_at: Instant::now(),
            shutdown_tx,
        }
    }

    /// Create with default configuration
    pub fn with_storage(storage: Arc<SnapshotStore>) -> Self {
        Self::new(Some(storage), SyncServerConfig::default())
    }

    pub fn config(&self) -> &SyncServerConfig {
        &self.config
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn presence(&self) -> &Arc<PresenceManager> {
        &self.presence
    }

    pub fn router(&self) -> &Arc<BroadcastRouter> {
        &self.router
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.documents
    }

    pub fn storage(&self) -> Option<&Arc<SnapshotStore>> {
        self.storage.as_ref()
    }

    fn session(&self, session_id: &str) -> SyncResult<Arc<ClassSession>> {
        self.sessions
            .get(session_id)
            .map(|s| s.clone())
            .ok_or_else(|| SyncError::SessionNotFound(session_id.to_string()))
    }

    /// Live session the participant is currently a member of
    fn active_session_of(&self, participant_id: &str) -> Option<SessionId> {
        self.sessions
            .iter()
            .find(|entry| {
                let session = entry.value();
                !session.is_ending()
                    && session
                        .record(participant_id)
                        .map_or(false, |r| !r.has_left())
            })
            .map(|entry| entry.key().clone())
    }

    /// Session of a joined participant
    fn joined_session(&self, participant_id: &str) -> SyncResult<Arc<ClassSession>> {
        let session_id = self
            .presence
            .session_of(participant_id)
            .ok_or_else(|| SyncError::ParticipantNotFound(participant_id.to_string()))?;
        self.session(&session_id)
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Start a class; the teacher's document exists from the start
    pub fn start_session(&self, teacher_id: &str, problem_id: Option<String>) -> SyncResult<SessionId> {
        if self.sessions.len() >= self.config.max_sessions {
            return Err(SyncError::Internal(format!(
                "session limit of {} reached",
                self.config.max_sessions
            )));
        }
        if let Some(existing) = self.active_session_of(teacher_id) {
            return Err(SyncError::AlreadyJoined(teacher_id.to_string(), existing));
        }

        let session_id = self
            .claim_session_id(std::iter::repeat_with(short_session_id), |id| {
                ClassSession::new(id, teacher_id, self.config.max_participants_per_session)
                    .with_problem(problem_id.clone())
            })
            .ok_or_else(|| SyncError::Internal("no free session id".to_string()))?;
        self.documents.create_document(&session_id, teacher_id, "");

        info!(session_id = %session_id, teacher_id = %teacher_id, "Session started");
        Ok(session_id)
    }

    /// Insert a session under the first candidate id not already taken
    fn claim_session_id<I, F>(&self, candidates: I, build: F) -> Option<SessionId>
    where
        I: IntoIterator<Item = SessionId>,
        F: Fn(&str) -> ClassSession,
    {
        for candidate in candidates.into_iter().take(MAX_SESSION_ID_ATTEMPTS) {
            match self.sessions.entry(candidate) {
                Entry::Vacant(slot) => {
                    let session_id = slot.key().clone();
                    slot.insert(Arc::new(build(&session_id)));
                    return Some(session_id);
                }
                Entry::Occupied(taken) => {
                    warn!(session_id = %taken.key(), "Session id collision, retrying");
                }
            }
        }
        None
    }

    /// Join a session (or rejoin after a disconnect) with an outbound channel
    pub fn join(
        &self,
        session_id: &str,
        participant_id: &str,
        name: &str,
        role: Role,
        tx: Outbound,
    ) -> SyncResult<Subscription> {
        let session = self.session(session_id)?;
        if let Some(other) = self.active_session_of(participant_id) {
            if other != session_id {
                return Err(SyncError::AlreadyJoined(participant_id.to_string(), other));
            }
        }

        let kind = session.join(participant_id, name, role)?;
        let own_document = self.documents.create_document(session_id, participant_id, "");

        let session_presence = self.presence.get_or_create(session_id);
        let delta = if session_presence.get(participant_id).is_some() {
            match session_presence.heartbeat(participant_id, Instant::now())? {
                HeartbeatOutcome::Recovered => Some(PresenceDelta::ConnectionChanged {
                    participant_id: participant_id.to_string(),
                    state: ConnectionState::Online,
                }),
                HeartbeatOutcome::Refreshed => None,
            }
        } else {
            Some(self.presence.register(Presence::new(participant_id, session_id, name, role))?)
        };

        self.router.attach(participant_id, tx);
        let documents = session.subscriptions_for(participant_id);
        self.subscribe(participant_id, &documents);

        if let Some(delta) = delta {
            self.router.publish_presence(session_id, &delta);
        }
        if role == Role::Student {
            // A new student document shows up in the teacher's grid
            self.refresh_subscriptions(&session, session.teacher_id(), false);
        }

        let color = session_presence
            .get(participant_id)
            .map(|p| p.color)
            .unwrap_or_default();

        info!(
            session_id = %session_id,
            participant_id = %participant_id,
            kind = ?kind,
            "Participant joined"
        );

        Ok(Subscription {
            session_id: session_id.to_string(),
            participant_id: participant_id.to_string(),
            role,
            color,
            own_document,
            documents,
            share_state: session.share_state(),
            view_mode: session.view_mode(),
            problem_id: session.problem_id(),
            writable: !session.is_read_only(participant_id),
            resume_token: self.issue_resume_token(session_id, participant_id),
        })
    }

    /// Re-attach a reconnecting transport using an earlier resume token
    pub fn resume(&self, token: &str, tx: Outbound) -> SyncResult<Subscription> {
        let (session_id, participant_id) = self
            .resume_tokens
            .get(token)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SyncError::Unauthorized("unknown resume token".to_string()))?;
        let record = self
            .session(&session_id)?
            .record(&participant_id)
            .ok_or_else(|| SyncError::ParticipantNotFound(participant_id.clone()))?;

        debug!(session_id = %session_id, participant_id = %participant_id, "Resuming participant");
        self.join(&session_id, &participant_id, &record.name, record.role, tx)
    }

    fn issue_resume_token(&self, session_id: &str, participant_id: &str) -> String {
        let mut random_bytes = [0u8; 32];
        rand::thread_rng().fill(&mut random_bytes);
        let mut hasher = Sha256::new();
        hasher.update(random_bytes);
        hasher.update(session_id.as_bytes());
        hasher.update(participant_id.as_bytes());
        let token = hex::encode(hasher.finalize());

        self.resume_tokens.retain(|_, (_, p)| p.as_str() != participant_id);
        self.resume_tokens
            .insert(token.clone(), (session_id.to_string(), participant_id.to_string()));
        token
    }

    /// Leave a session for good; the participant's document and report line stay
    pub fn leave(&self, participant_id: &str) -> SyncResult<SessionId> {
        let session = self.joined_session(participant_id)?;
        session.leave(participant_id);

        for document_id in session.document_ids() {
            self.documents.forget(&document_id, participant_id);
        }
        self.router.detach(participant_id);
        self.resume_tokens.retain(|_, (_, p)| p.as_str() != participant_id);

        if self.presence.unregister(participant_id).is_some() {
            let delta = PresenceDelta::Left {
                participant_id: participant_id.to_string(),
            };
            self.router.publish_presence(session.id(), &delta);
        }
        if session.is_student(participant_id) {
            self.refresh_subscriptions(&session, session.teacher_id(), false);
        }

        info!(session_id = %session.id(), participant_id = %participant_id, "Participant left");
        Ok(session.id().to_string())
    }

    /// Transport dropped. Only acts if `tx` is still the participant's channel.
    pub fn disconnect(&self, participant_id: &str, tx: &Outbound) {
        if !self.router.detach_channel(participant_id, tx) {
            return;
        }
        let Some(session_id) = self.presence.session_of(participant_id) else {
            return;
        };

        if let Ok(session) = self.session(&session_id) {
            for document_id in session.document_ids() {
                self.documents.forget(&document_id, participant_id);
            }
        }
        if let Some(session_presence) = self.presence.get(&session_id) {
            if let Some(delta) = session_presence.mark_offline(participant_id) {
                self.router.publish_presence(&session_id, &delta);
            }
        }
        info!(session_id = %session_id, participant_id = %participant_id, "Participant disconnected");
    }

    /// End a session: flush window, close documents, archive, report
    pub async fn end_session(&self, session_id: &str) -> SyncResult<SummaryReport> {
        let session = self.session(session_id)?;
        if !session.begin_ending() {
            return Err(SyncError::SessionNotFound(session_id.to_string()));
        }

        let grace_ms = self.config.end_session_grace.as_millis() as u64;
        self.router.broadcast_session(
            session_id,
            &ServerMessage::SessionEnding {
                session_id: session_id.to_string(),
                grace_ms,
            },
        );
        if grace_ms > 0 {
            tokio::time::sleep(self.config.end_session_grace).await;
        }

        let mut archived = Vec::new();
        for document_id in session.document_ids() {
            match self.documents.close(&document_id).await {
                Ok(document) => archived.push(ArchivedDocument {
                    document_id: document.id().to_string(),
                    owner_id: document.owner_id().to_string(),
                    content: document.content().to_string(),
                    version: document.version(),
                    created_at: document.created_at(),
                    updated_at: document.updated_at(),
                }),
                Err(e) => warn!(document_id = %document_id, error = %e, "Failed to close document"),
            }
        }

        let versions: HashMap<&str, u64> = archived
            .iter()
            .map(|d| (d.document_id.as_str(), d.version))
            .collect();
        let report = session.summary(Instant::now(), |id| versions.get(id).copied().unwrap_or(0));

        if let Some(storage) = &self.storage {
            let archive = SessionArchive {
                session_id: session_id.to_string(),
                teacher_id: session.teacher_id().to_string(),
                problem_id: session.problem_id(),
                started_at: session.created_at(),
                ended_at: chrono::Utc::now().timestamp(),
                documents: archived,
                report: report.clone(),
            };
            if let Err(e) = storage.archive_session(&archive) {
                error!(session_id = %session_id, error = %e, "Failed to archive session");
            }
        }

        let recipients = self
            .presence
            .remove(session_id)
            .map(|p| p.online_ids())
            .unwrap_or_default();
        let ended = ServerMessage::SessionEnded {
            session_id: session_id.to_string(),
            report: report.clone(),
        };
        for participant_id in &recipients {
            self.router.send_to(participant_id, ended.clone());
        }
        for participant_id in session.participant_ids() {
            self.router.detach(&participant_id);
        }
        self.resume_tokens.retain(|_, (s, _)| s.as_str() != session_id);
        self.sessions.remove(session_id);

        info!(
            session_id = %session_id,
            students = report.total_students,
            average_progress = report.average_progress,
            "Session ended"
        );
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    /// Refresh presence; a participant that had timed out is told to resync
    pub fn heartbeat(&self, participant_id: &str) -> SyncResult<HeartbeatOutcome> {
        let session_id = self
            .presence
            .session_of(participant_id)
            .ok_or_else(|| SyncError::ParticipantNotFound(participant_id.to_string()))?;
        let session_presence = self
            .presence
            .get(&session_id)
            .ok_or_else(|| SyncError::SessionNotFound(session_id.clone()))?;

        let outcome = session_presence.heartbeat(participant_id, Instant::now())?;
        if outcome == HeartbeatOutcome::Recovered {
            let delta = PresenceDelta::ConnectionChanged {
                participant_id: participant_id.to_string(),
                state: ConnectionState::Online,
            };
            self.router.publish_presence(&session_id, &delta);
            self.router.send_to(
                participant_id,
                SyncProtocol::sync_error(&SyncError::PresenceTimeout(participant_id.to_string()), None),
            );
            info!(session_id = %session_id, participant_id = %participant_id, "Participant back online");
        }
        Ok(outcome)
    }

    pub fn update_cursor(
        &self,
        participant_id: &str,
        document_id: &str,
        offset: usize,
        selection_end: Option<usize>,
    ) -> SyncResult<()> {
        let session = self.joined_session(participant_id)?;
        session.check_read(participant_id, document_id)?;

        let mut cursor = Cursor::new(document_id, offset);
        if let Some(end) = selection_end {
            cursor = cursor.with_selection(end);
        }
        let delta = self
            .presence
            .get_or_create(session.id())
            .update_cursor(participant_id, cursor)?;
        self.router.publish_presence(session.id(), &delta);
        Ok(())
    }

    /// Mark participants without a recent heartbeat offline as of `now`
    pub fn sweep_presence_at(&self, now: Instant) -> usize {
        let timed_out = self.presence.sweep_at(now, self.config.heartbeat_timeout);
        for (session_id, participant_id, delta) in &timed_out {
            if let Ok(session) = self.session(session_id) {
                for document_id in session.document_ids() {
                    self.documents.forget(&document_id, participant_id);
                }
            }
            self.router.publish_presence(session_id, delta);
            warn!(
                session_id = %session_id,
                participant_id = %participant_id,
                error = %SyncError::PresenceTimeout(participant_id.clone()),
                "Participant timed out"
            );
        }
        timed_out.len()
    }

    pub fn sweep_presence(&self) -> usize {
        self.sweep_presence_at(Instant::now())
    }

    // ------------------------------------------------------------------
    // Teacher controls
    // ------------------------------------------------------------------

    /// Route `documents` to the participant and hold their logs for it
    fn subscribe(&self, participant_id: &str, documents: &[DocumentId]) {
        self.router.set_subscriptions(participant_id, documents);
        for document_id in documents {
            self.documents.track(document_id, participant_id);
        }
    }

    /// Recompute one participant's subscriptions and tell it about the result

    fn refresh_subscriptions(&self, session: &ClassSession, participant_id: &str, notify: bool) {
        if !self.router.is_attached(participant_id) {
            return;
        }
        let documents = session.subscriptions_for(participant_id);
        self.subscribe(participant_id, &documents);
        if notify {
            self.router.send_to(
                participant_id,
                ServerMessage::ShareStateChanged {
                    session_id: session.id().to_string(),
                    state: session.share_state(),
                    documents,
                    writable: !session.is_read_only(participant_id),
                },
            );
        }
    }

    /// Change who is mirrored to the class; every participant is re-subscribed
    pub fn set_share_state(&self, participant_id: &str, state: ShareState) -> SyncResult<bool> {
        let session = self.joined_session(participant_id)?;
        let changed = session.set_share_state(participant_id, state)?;
        if changed {
            for member in session.participant_ids() {
                self.refresh_subscriptions(&session, &member, true);
            }
            info!(session_id = %session.id(), state = ?session.share_state(), "Share state changed");
        }
        Ok(changed)
    }

    /// Switch the teacher between grid and detail view
    pub fn set_view_mode(&self, participant_id: &str, mode: ViewMode) -> SyncResult<bool> {
        let session = self.joined_session(participant_id)?;
        let changed = session.set_view_mode(participant_id, mode)?;
        if changed {
            self.refresh_subscriptions(&session, participant_id, true);
            debug!(session_id = %session.id(), mode = ?session.view_mode(), "View mode changed");
        }
        Ok(changed)
    }

    pub fn select_problem(&self, participant_id: &str, problem_id: Option<String>) -> SyncResult<()> {
        let session = self.joined_session(participant_id)?;
        session.select_problem(participant_id, problem_id.clone())?;
        self.router.broadcast_session(
            session.id(),
            &ServerMessage::ProblemSelected {
                session_id: session.id().to_string(),
                problem_id,
            },
        );
        Ok(())
    }

    pub fn report_progress(&self, participant_id: &str, tests_passed: u32, total_tests: u32) -> SyncResult<()> {
        self.joined_session(participant_id)?
            .report_progress(participant_id, tests_passed, total_tests)
    }

    // ------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------

    /// Submit an edit on behalf of a participant
    pub async fn submit(
        &self,
        participant_id: &str,
        document_id: &str,
        operation: Operation,
    ) -> SyncResult<AppliedResult> {
        if operation.author_id != participant_id {
            return Err(SyncError::Unauthorized(format!(
                "{} may not submit operations authored by {}",
                participant_id, operation.author_id
            )));
        }
        let session = self.joined_session(participant_id)?;
        session.check_write(participant_id, document_id)?;

        let applied = self.documents.apply_operation(document_id, operation).await?;
        debug!(
            document_id = %document_id,
            participant_id = %participant_id,
            version = applied.version,
            duplicate = applied.duplicate,
            "Operation applied"
        );
        Ok(applied)
    }

    pub async fn get_snapshot(&self, participant_id: &str, document_id: &str) -> SyncResult<Snapshot> {
        self.joined_session(participant_id)?
            .check_read(participant_id, document_id)?;
        self.documents
            .get_snapshot(document_id, Some(participant_id))
            .await
    }

    pub async fn operations_since(
        &self,
        participant_id: &str,
        document_id: &str,
        version: u64,
    ) -> SyncResult<Vec<CommittedOperation>> {
        self.joined_session(participant_id)?
            .check_read(participant_id, document_id)?;
        self.documents
            .operations_since(document_id, Some(participant_id), version)
            .await
    }

    /// Record the version a client has applied
    pub fn acknowledge(&self, participant_id: &str, document_id: &str, version: u64) -> SyncResult<()> {
        self.joined_session(participant_id)?
            .check_read(participant_id, document_id)?;
        self.documents.acknowledge(document_id, participant_id, version)
    }

    /// Current content of a participant's document, falling back to the archive
    pub async fn document_snapshot(&self, session_id: &str, participant_id: &str) -> SyncResult<Snapshot> {
        let id: DocumentId = document_id(session_id, participant_id);
        if self.documents.contains(&id) {
            return self.documents.get_snapshot(&id, None).await;
        }

        let Some(storage) = &self.storage else {
            return Err(SyncError::DocumentNotFound(id));
        };
        let archived = storage
            .load_archive(session_id)?
            .and_then(|archive| archive.documents.into_iter().find(|d| d.document_id == id));
        if let Some(d) = archived {
            return Ok(Snapshot {
                document_id: d.document_id,
                content: d.content,
                version: d.version,
            });
        }

        // Closed but not archived: serve the last compaction snapshot
        storage
            .load_snapshot(&id)?
            .map(|record| Snapshot {
                document_id: record.document_id,
                content: record.content,
                version: record.version,
            })
            .ok_or(SyncError::DocumentNotFound(id))
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    fn session_info(&self, session: &ClassSession) -> SessionInfo {
        SessionInfo {
            session_id: session.id().to_string(),
            teacher_id: session.teacher_id().to_string(),
            problem_id: session.problem_id(),
            created_at: session.created_at(),
            participant_count: session.participant_count(),
            online_count: self
                .presence
                .get(session.id())
                .map_or(0, |p| p.online_count()),
            share_state: session.share_state(),
            view_mode: session.view_mode(),
        }
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| self.session_info(entry.value()))
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    pub fn session_detail(&self, session_id: &str) -> SyncResult<SessionDetail> {
        let session = self.session(session_id)?;
        let presence = self
            .presence
            .get(session_id)
            .map(|p| p.all())
            .unwrap_or_default();
        Ok(SessionDetail {
            info: self.session_info(&session),
            presence,
        })
    }

    /// Participants of a session as sent in `SessionJoined`
    pub fn participants(&self, session_id: &str) -> Vec<ParticipantInfo> {
        self.presence
            .get(session_id)
            .map(|p| {
                p.all()
                    .into_iter()
                    .map(|presence| ParticipantInfo {
                        online: presence.is_online(),
                        participant_id: presence.participant_id,
                        name: presence.name,
                        role: presence.role,
                        color: presence.color,
                        joined_at: presence.joined_at,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn session_exists(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            active_sessions: self.sessions.len(),
            connections: self.router.connection_count(),
            participants: self.presence.total_participant_count(),
            online_participants: self.presence.total_online_count(),
            open_documents: self.documents.document_count(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            storage: self.storage.as_ref().map(|storage| storage.stats()),
        }
    }

    /// Start background tasks (presence sweep, storage flush)
    pub fn start_background_tasks(self: Arc<Self>) -> BackgroundTaskHandles {
        let server = self.clone();
        let sweep_interval = server.config.sweep_interval;

        let sweep_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            let mut shutdown = server.shutdown_receiver();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let timed_out = server.sweep_presence();
                        if timed_out > 0 {
                            debug!("Presence sweep marked {} participants offline", timed_out);
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Presence sweep shutting down");
                        break;
                    }
                }
            }
        });

        let server = self;
        let flush_interval = server.config.flush_interval;

        let flush_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(flush_interval);
            let mut shutdown = server.shutdown_receiver();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Some(storage) = &server.storage {
                            if let Err(e) = storage.flush() {
                                error!("Failed to flush snapshot store: {}", e);
                            }
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Flush task shutting down");
                        if let Some(storage) = &server.storage {
                            let _ = storage.flush();
                        }
                        break;
                    }
                }
            }
        });

        BackgroundTaskHandles {
            sweep_task: sweep_handle,
            flush_task: flush_handle,
        }
    }
}

/// Server statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    pub active_sessions: usize,
    pub connections: usize,
    pub participants: usize,
    pub online_participants: usize,
    pub open_documents: usize,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageStats>,
}

/// Handles for background tasks
pub struct BackgroundTaskHandles {
    pub sweep_task: tokio::task::JoinHandle<()>,
    pub flush_task: tokio::task::JoinHandle<()>,
}

impl BackgroundTaskHandles {
    /// Wait for all tasks to complete
    pub async fn wait(self) {
        let _ = tokio::join!(self.sweep_task, self.flush_task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageConfig;
    use crate::sync::client::ClientReplica;
    use crate::sync::operation::TextOperation;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    type Inbox = mpsc::UnboundedReceiver<ServerMessage>;

    fn test_config() -> SyncServerConfig {
        SyncServerConfig::default().with_end_session_grace(Duration::ZERO)
    }

    fn test_server() -> SyncServer {
        SyncServer::new(None, test_config())
    }

    fn test_server_with_storage() -> (TempDir, SyncServer) {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig::new(dir.path().join("test.sled").to_string_lossy().to_string());
        let storage = Arc::new(SnapshotStore::open(config).unwrap());
        (dir, SyncServer::new(Some(storage), test_config()))
    }

    fn connect(server: &SyncServer, session: &str, id: &str, role: Role) -> (Subscription, Outbound, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = server.join(session, id, id, role, tx.clone()).unwrap();
        (subscription, tx, rx)
    }

    fn drain(rx: &mut Inbox) -> Vec<ServerMessage> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn committed_for(messages: &[ServerMessage], document: &str) -> Vec<CommittedOperation> {
        messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::OperationCommitted {
                    document_id,
                    committed,
                } if document_id == document => Some(committed.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_start_and_join() {
        let server = test_server();
        let session = server.start_session("teacher", Some("p1".to_string())).unwrap();

        let (teacher, _t_tx, _t_rx) = connect(&server, &session, "teacher", Role::Teacher);
        let (alice, _a_tx, _a_rx) = connect(&server, &session, "alice", Role::Student);

        assert_eq!(teacher.own_document, document_id(&session, "teacher"));
        assert_eq!(alice.documents, vec![document_id(&session, "alice")]);
        assert_eq!(alice.problem_id.as_deref(), Some("p1"));
        assert!(alice.writable);
        assert_eq!(alice.resume_token.len(), 64);

        let stats = server.stats();
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.open_documents, 2);
        assert_eq!(server.participants(&session).len(), 2);
    }

    #[tokio::test]
    async fn test_join_rejections() {
        let server = SyncServer::new(None, test_config().with_max_participants(2));
        let first = server.start_session("teacher", None).unwrap();
        let second = server.start_session("other-teacher", None).unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            server.join(&first, "mallory", "Mallory", Role::Teacher, tx.clone()),
            Err(SyncError::Unauthorized(_))
        ));

        server.join(&first, "alice", "Alice", Role::Student, tx.clone()).unwrap();
        assert!(matches!(
            server.join(&second, "alice", "Alice", Role::Student, tx.clone()),
            Err(SyncError::AlreadyJoined(_, _))
        ));
        assert!(matches!(
            server.join(&first, "bob", "Bob", Role::Student, tx.clone()),
            Err(SyncError::SessionFull(_))
        ));
        assert!(matches!(
            server.join("missing", "bob", "Bob", Role::Student, tx),
            Err(SyncError::SessionNotFound(_))
        ));
        assert!(matches!(
            server.start_session("teacher", None),
            Err(SyncError::AlreadyJoined(_, _))
        ));
    }

    #[tokio::test]
    async fn test_session_id_collision_is_retried() {
        let server = test_server();
        let taken = server.start_session("teacher", None).unwrap();
        assert_eq!(taken.len(), 8);

        let candidates = vec![taken.clone(), taken.clone(), "fresh001".to_string()];
        let claimed = server.claim_session_id(candidates, |id| ClassSession::new(id, "other", 10));
        assert_eq!(claimed.as_deref(), Some("fresh001"));
        assert_eq!(server.session(&taken).unwrap().teacher_id(), "teacher");

        let exhausted = server.claim_session_id(vec![taken.clone()], |id| ClassSession::new(id, "third", 10));
        assert!(exhausted.is_none());
        assert_eq!(server.list_sessions().len(), 2);
    }

    #[tokio::test]
    async fn test_join_holds_log_for_subscribers() {
        let server = SyncServer::new(None, test_config().with_compaction_threshold(2));
        let session = server.start_session("teacher", None).unwrap();
        let (_t, _t_tx, _t_rx) = connect(&server, &session, "teacher", Role::Teacher);
        let (_a, _a_tx, _a_rx) = connect(&server, &session, "alice", Role::Student);

        let alice_doc = document_id(&session, "alice");
        for seq in 1..=5u64 {
            let len = (seq - 1) as usize;
            let op = Operation::new("alice", seq, seq - 1, TextOperation::insert_at(len, len, "x").unwrap());
            server.submit("alice", &alice_doc, op).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The teacher's grid has not seen anything yet, so nothing may be folded
        let replay = server.operations_since("teacher", &alice_doc, 0).await.unwrap();
        assert_eq!(replay.len(), 5);
        assert_eq!(replay.last().map(|c| c.version), Some(5));
    }

    #[tokio::test]
    async fn test_students_cannot_write_foreign_documents() {
        let server = test_server();
        let session = server.start_session("teacher", None).unwrap();
        let (_t, _t_tx, _t_rx) = connect(&server, &session, "teacher", Role::Teacher);
        let (_a, _a_tx, _a_rx) = connect(&server, &session, "alice", Role::Student);
        let (_b, _b_tx, _b_rx) = connect(&server, &session, "bob", Role::Student);

        let bob_doc = document_id(&session, "bob");
        let op = Operation::new("alice", 1, 0, TextOperation::insert_at(0, 0, "x").unwrap());
        assert!(matches!(
            server.submit("alice", &bob_doc, op).await,
            Err(SyncError::Unauthorized(_))
        ));

        // Authors cannot be spoofed either
        let op = Operation::new("bob", 1, 0, TextOperation::insert_at(0, 0, "x").unwrap());
        assert!(matches!(
            server.submit("alice", &bob_doc, op).await,
            Err(SyncError::Unauthorized(_))
        ));

        assert!(matches!(
            server.get_snapshot("alice", &bob_doc).await,
            Err(SyncError::Unauthorized(_))
        ));
        assert_ok!(server.get_snapshot("teacher", &bob_doc).await);
        assert!(matches!(
            server.set_share_state("alice", ShareState::TeacherShared),
            Err(SyncError::Unauthorized(_))
        ));
    }

    /// Concurrent inserts at the same offset from the same base version
    #[tokio::test]
    async fn test_scenario_concurrent_inserts_converge() {
        let server = test_server();
        let session = server.start_session("teacher", None).unwrap();
        let doc = document_id(&session, "teacher");
        let store = server.documents();

        for (i, ch) in "print".chars().enumerate() {
            let op = Operation::new(
                "teacher",
                i as u64 + 1,
                i as u64,
                TextOperation::insert_at(i, i, &ch.to_string()).unwrap(),
            );
            store.apply_operation(&doc, op).await.unwrap();
        }

        let base = store.get_snapshot(&doc, None).await.unwrap();
        assert_eq!(base.version, 5);
        let mut x = ClientReplica::new("x", base.clone());
        let mut y = ClientReplica::new("y", base);

        let ox = x.insert(0, "foo").unwrap().unwrap();
        let oy = y.insert(0, "bar").unwrap().unwrap();

        let cx = store.apply_operation(&doc, ox).await.unwrap();
        let cy = store.apply_operation(&doc, oy).await.unwrap();
        assert_eq!(cx.version, 6);
        assert_eq!(cy.version, 7);
        assert_eq!(
            cy.operation.payload,
            TextOperation::insert_at(8, 3, "bar").unwrap()
        );

        x.on_ack(cx.operation.client_seq, cx.version);
        x.on_remote(&cy.committed()).unwrap();
        y.on_remote(&cx.committed()).unwrap();
        y.on_ack(cy.operation.client_seq, cy.version);

        let server_content = store.get_snapshot(&doc, None).await.unwrap().content;
        assert_eq!(server_content, "foobarprint");
        assert_eq!(x.content(), server_content);
        assert_eq!(y.content(), server_content);
    }

    #[tokio::test]
    async fn test_scenario_receipt_order_does_not_matter() {
        let server = test_server();
        let session = server.start_session("teacher", None).unwrap();
        let doc = document_id(&session, "teacher");
        let store = server.documents();

        let oy = Operation::new("y", 1, 0, TextOperation::insert_at(0, 0, "bar").unwrap());
        let ox = Operation::new("x", 1, 0, TextOperation::insert_at(0, 0, "foo").unwrap());
        store.apply_operation(&doc, oy).await.unwrap();
        store.apply_operation(&doc, ox).await.unwrap();

        let snapshot = store.get_snapshot(&doc, None).await.unwrap();
        assert_eq!(snapshot.content, "foobar");
        assert_eq!(snapshot.version, 2);
    }

    /// Teacher shares a student's document, then stops sharing
    #[tokio::test]
    async fn test_scenario_student_share_and_revert() {
        let server = test_server();
        let session = server.start_session("teacher", None).unwrap();
        let (_t, _t_tx, mut teacher_rx) = connect(&server, &session, "teacher", Role::Teacher);
        let (_s41, _tx41, mut rx41) = connect(&server, &session, "41", Role::Student);
        let (_s42, _tx42, mut rx42) = connect(&server, &session, "42", Role::Student);
        let (_s43, _tx43, mut rx43) = connect(&server, &session, "43", Role::Student);
        let doc41 = document_id(&session, "41");
        let doc42 = document_id(&session, "42");
        drain(&mut teacher_rx);
        drain(&mut rx41);
        drain(&mut rx42);
        drain(&mut rx43);

        assert!(server
            .set_share_state("teacher", ShareState::StudentShared("42".to_string()))
            .unwrap());

        match drain(&mut rx41).as_slice() {
            [ServerMessage::ShareStateChanged {
                documents, writable, ..
            }] => {
                assert!(!writable);
                assert!(documents.contains(&doc42));
            }
            other => panic!("unexpected messages {:?}", other),
        }
        let for_42 = drain(&mut rx42);
        assert!(matches!(
            for_42.as_slice(),
            [ServerMessage::ShareStateChanged { writable: true, .. }]
        ));

        let blocked = Operation::new("41", 1, 0, TextOperation::insert_at(0, 0, "x").unwrap());
        assert!(matches!(
            server.submit("41", &doc41, blocked).await,
            Err(SyncError::Unauthorized(_))
        ));

        let shared = Operation::new("42", 1, 0, TextOperation::insert_at(0, 0, "fn solve()").unwrap());
        server.submit("42", &doc42, shared).await.unwrap();

        assert_eq!(committed_for(&drain(&mut rx41), &doc42).len(), 1);
        assert_eq!(committed_for(&drain(&mut rx43), &doc42).len(), 1);
        assert_eq!(committed_for(&drain(&mut teacher_rx), &doc42).len(), 1);
        assert!(drain(&mut rx42).is_empty());

        assert!(server.set_share_state("teacher", ShareState::None).unwrap());
        match drain(&mut rx41).as_slice() {
            [ServerMessage::ShareStateChanged {
                documents, writable, ..
            }] => {
                assert!(writable);
                assert_eq!(documents, &vec![doc41.clone()]);
            }
            other => panic!("unexpected messages {:?}", other),
        }
        drain(&mut rx43);

        let more = Operation::new("42", 2, 1, TextOperation::insert_at(10, 10, " {}").unwrap());
        server.submit("42", &doc42, more).await.unwrap();
        assert!(committed_for(&drain(&mut rx41), &doc42).is_empty());
        assert!(committed_for(&drain(&mut rx43), &doc42).is_empty());
        assert_eq!(committed_for(&drain(&mut teacher_rx), &doc42).len(), 1);

        let allowed = Operation::new("41", 1, 0, TextOperation::insert_at(0, 0, "x").unwrap());
        assert_eq!(server.submit("41", &doc41, allowed).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_detail_view_narrows_teacher_subscriptions() {
        let server = test_server();
        let session = server.start_session("teacher", None).unwrap();
        let (_t, _t_tx, mut teacher_rx) = connect(&server, &session, "teacher", Role::Teacher);
        let (_a, _a_tx, _a_rx) = connect(&server, &session, "alice", Role::Student);
        let (_b, _b_tx, _b_rx) = connect(&server, &session, "bob", Role::Student);
        let alice_doc = document_id(&session, "alice");
        let bob_doc = document_id(&session, "bob");

        assert!(server
            .set_view_mode("teacher", ViewMode::Detail("alice".to_string()))
            .unwrap());
        assert!(matches!(
            server.get_snapshot("teacher", &bob_doc).await,
            Err(SyncError::Unauthorized(_))
        ));
        drain(&mut teacher_rx);

        let op = Operation::new("bob", 1, 0, TextOperation::insert_at(0, 0, "b").unwrap());
        server.submit("bob", &bob_doc, op).await.unwrap();
        let op = Operation::new("alice", 1, 0, TextOperation::insert_at(0, 0, "a").unwrap());
        server.submit("alice", &alice_doc, op).await.unwrap();

        let seen = drain(&mut teacher_rx);
        assert!(committed_for(&seen, &bob_doc).is_empty());
        assert_eq!(committed_for(&seen, &alice_doc).len(), 1);
    }

    /// A student times out, reconnects and catches up on the shared document
    #[tokio::test]
    async fn test_scenario_timeout_reconnect_and_replay() {
        let server = test_server();
        let session = server.start_session("teacher", None).unwrap();
        let (_t, _t_tx, _t_rx) = connect(&server, &session, "teacher", Role::Teacher);
        let (student, student_tx, mut student_rx) = connect(&server, &session, "s1", Role::Student);
        let teacher_doc = document_id(&session, "teacher");

        server.set_share_state("teacher", ShareState::TeacherShared).unwrap();
        let snapshot = server.get_snapshot("s1", &teacher_doc).await.unwrap();
        let mut mirror = ClientReplica::new("s1", snapshot);

        let mut teacher_text = String::new();
        let mut seq = 0;
        let mut type_text = |text: &str| {
            seq += 1;
            let op = Operation::new(
                "teacher",
                seq,
                seq - 1,
                TextOperation::insert_at(teacher_text.chars().count(), teacher_text.chars().count(), text).unwrap(),
            );
            teacher_text.push_str(text);
            op
        };

        let op = type_text("fn main() {\n");
        server.submit("teacher", &teacher_doc, op).await.unwrap();
        for committed in committed_for(&drain(&mut student_rx), &teacher_doc) {
            mirror.on_remote(&committed).unwrap();
        }
        assert_eq!(mirror.server_version(), 1);

        // No heartbeat for longer than the timeout
        let later = Instant::now() + server.config().heartbeat_timeout + Duration::from_secs(1);
        assert!(server.sweep_presence_at(later) >= 1);
        assert!(!server.presence().is_online("s1"));
        server.disconnect("s1", &student_tx);
        mirror.on_disconnect();

        for line in ["    let x = 1;\n", "    println!(\"{}\", x);\n", "}\n"] {
            let op = type_text(line);
            server.submit("teacher", &teacher_doc, op).await.unwrap();
        }
        assert!(committed_for(&drain(&mut student_rx), &teacher_doc).is_empty());

        let (tx, mut new_rx) = mpsc::unbounded_channel();
        let resumed = server.resume(&student.resume_token, tx).unwrap();
        assert!(server.presence().is_online("s1"));
        assert!(resumed.documents.contains(&teacher_doc));
        assert!(!resumed.writable);

        let missed = server
            .operations_since("s1", &teacher_doc, mirror.server_version())
            .await
            .unwrap();
        assert_eq!(missed.len(), 3);
        mirror.resync(&missed).unwrap();

        let current = server.get_snapshot("s1", &teacher_doc).await.unwrap();
        assert_eq!(mirror.content(), current.content);
        assert_eq!(mirror.server_version(), current.version);
        assert!(drain(&mut new_rx)
            .iter()
            .all(|m| !matches!(m, ServerMessage::OperationCommitted { .. })));
    }

    #[tokio::test]
    async fn test_reconnect_resubmits_pending_edits_once() {
        let server = test_server();
        let session = server.start_session("teacher", None).unwrap();
        let (student, student_tx, _rx) = connect(&server, &session, "s1", Role::Student);
        let doc = student.own_document.clone();

        let mut replica = ClientReplica::new("s1", server.get_snapshot("s1", &doc).await.unwrap());
        let op = replica.insert(0, "hello").unwrap().unwrap();
        // Lands on the server, but the ack is lost with the connection
        server.submit("s1", &doc, op).await.unwrap();
        server.disconnect("s1", &student_tx);
        replica.on_disconnect();
        assert!(replica.insert(5, " world").unwrap().is_none());

        let (tx, _new_rx) = mpsc::unbounded_channel();
        server.resume(&student.resume_token, tx).unwrap();
        let missed = server
            .operations_since("s1", &doc, replica.server_version())
            .await
            .unwrap();
        let resend = replica.resync(&missed).unwrap().unwrap();
        let applied = server.submit("s1", &doc, resend).await.unwrap();
        replica.on_ack(applied.operation.client_seq, applied.version);

        let current = server.get_snapshot("s1", &doc).await.unwrap();
        assert_eq!(current.content, "hello world");
        assert_eq!(current.version, 2);
        assert_eq!(replica.content(), current.content);
    }

    #[tokio::test]
    async fn test_heartbeat_after_timeout_sends_notice() {
        let server = test_server();
        let session = server.start_session("teacher", None).unwrap();
        let (_t, _t_tx, mut teacher_rx) = connect(&server, &session, "teacher", Role::Teacher);
        let (_s, _s_tx, mut student_rx) = connect(&server, &session, "s1", Role::Student);

        assert_eq!(server.heartbeat("s1").unwrap(), HeartbeatOutcome::Refreshed);
        let later = Instant::now() + server.config().heartbeat_timeout + Duration::from_secs(1);
        server.sweep_presence_at(later);
        drain(&mut student_rx);
        drain(&mut teacher_rx);

        assert_eq!(server.heartbeat("s1").unwrap(), HeartbeatOutcome::Recovered);
        assert!(drain(&mut student_rx).iter().any(|m| matches!(
            m,
            ServerMessage::Error {
                code: crate::sync::protocol::ErrorCode::PresenceTimeout,
                ..
            }
        )));
        assert_err!(server.heartbeat("nobody"));
    }

    #[tokio::test]
    async fn test_teacher_disconnect_keeps_session() {
        let server = test_server();
        let session = server.start_session("teacher", None).unwrap();
        let (_t, teacher_tx, _t_rx) = connect(&server, &session, "teacher", Role::Teacher);
        let (student, _s_tx, _s_rx) = connect(&server, &session, "s1", Role::Student);

        server.disconnect("teacher", &teacher_tx);
        assert!(server.session_exists(&session));

        let op = Operation::new("s1", 1, 0, TextOperation::insert_at(0, 0, "still here").unwrap());
        assert_eq!(server.submit("s1", &student.own_document, op).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_leave_frees_participant_for_another_session() {
        let server = test_server();
        let first = server.start_session("t1", None).unwrap();
        let second = server.start_session("t2", None).unwrap();
        let (_s, _tx, _rx) = connect(&server, &first, "alice", Role::Student);

        assert_eq!(server.leave("alice").unwrap(), first);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert_ok!(server.join(&second, "alice", "Alice", Role::Student, tx));
    }

    #[tokio::test]
    async fn test_select_problem_is_broadcast() {
        let server = test_server();
        let session = server.start_session("teacher", None).unwrap();
        let (_t, _t_tx, _t_rx) = connect(&server, &session, "teacher", Role::Teacher);
        let (_s, _s_tx, mut student_rx) = connect(&server, &session, "s1", Role::Student);
        drain(&mut student_rx);

        server.select_problem("teacher", Some("valid-parentheses".to_string())).unwrap();
        assert!(matches!(
            drain(&mut student_rx).as_slice(),
            [ServerMessage::ProblemSelected { problem_id: Some(_), .. }]
        ));
        assert_err!(server.select_problem("s1", None));
    }

    #[tokio::test]
    async fn test_end_session_reports_and_archives() {
        let (_dir, server) = test_server_with_storage();
        let session = server.start_session("teacher", Some("climbing-stairs".to_string())).unwrap();
        let (_t, _t_tx, mut teacher_rx) = connect(&server, &session, "teacher", Role::Teacher);
        let (alice, _a_tx, mut alice_rx) = connect(&server, &session, "alice", Role::Student);
        let (_b, _b_tx, _b_rx) = connect(&server, &session, "bob", Role::Student);

        let op = Operation::new("alice", 1, 0, TextOperation::insert_at(0, 0, "return n;").unwrap());
        server.submit("alice", &alice.own_document, op).await.unwrap();
        server.report_progress("alice", 9, 10).unwrap();
        server.report_progress("bob", 2, 10).unwrap();
        drain(&mut alice_rx);

        let report = server.end_session(&session).await.unwrap();
        assert_eq!(report.total_students, 2);
        assert_eq!(report.completed_count, 1);
        assert_eq!(report.struggling_count, 1);
        assert_eq!(report.average_progress, 55);
        let alice_line = report
            .participants
            .iter()
            .find(|p| p.participant_id == "alice")
            .unwrap();
        assert_eq!(alice_line.final_version, 1);
        assert_eq!(alice_line.progress, 90);

        let received = drain(&mut alice_rx);
        assert!(matches!(received.first(), Some(ServerMessage::SessionEnding { .. })));
        assert!(matches!(received.last(), Some(ServerMessage::SessionEnded { .. })));
        assert!(drain(&mut teacher_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::SessionEnded { .. })));

        assert!(!server.session_exists(&session));
        assert_eq!(server.documents().document_count(), 0);
        assert_err!(server.end_session(&session).await);

        let archived = server.document_snapshot(&session, "alice").await.unwrap();
        assert_eq!(archived.content, "return n;");
        let archive = server.storage().unwrap().load_archive(&session).unwrap().unwrap();
        assert_eq!(archive.documents.len(), 3);
        assert_eq!(archive.problem_id.as_deref(), Some("climbing-stairs"));
        let alice_doc = archive
            .documents
            .iter()
            .find(|d| d.owner_id == "alice")
            .unwrap();
        assert!(alice_doc.created_at > 0);
        assert!(alice_doc.updated_at >= alice_doc.created_at);
    }

    #[tokio::test]
    async fn test_document_snapshot_for_analysis() {
        let server = test_server();
        let session = server.start_session("teacher", None).unwrap();
        let (alice, _tx, _rx) = connect(&server, &session, "alice", Role::Student);

        let op = Operation::new("alice", 1, 0, TextOperation::insert_at(0, 0, "x = 1").unwrap());
        server.submit("alice", &alice.own_document, op).await.unwrap();

        let snapshot = server.document_snapshot(&session, "alice").await.unwrap();
        assert_eq!(snapshot.content, "x = 1");
        assert_eq!(snapshot.version, 1);
        assert!(matches!(
            server.document_snapshot(&session, "nobody").await,
            Err(SyncError::DocumentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_document_served_from_compaction_snapshot() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig::new(dir.path().join("test.sled").to_string_lossy().to_string());
        let storage = Arc::new(SnapshotStore::open(config).unwrap());
        let server = SyncServer::new(Some(storage.clone()), test_config().with_compaction_threshold(2));
        let session = server.start_session("teacher", None).unwrap();
        let (alice, _tx, _rx) = connect(&server, &session, "alice", Role::Student);
        let doc = alice.own_document.clone();

        for seq in 1..=3u64 {
            let len = (seq - 1) as usize;
            let op = Operation::new("alice", seq, seq - 1, TextOperation::insert_at(len, len, "x").unwrap());
            server.submit("alice", &doc, op).await.unwrap();
        }
        server.acknowledge("alice", &doc, 3).unwrap();

        let mut persisted = None;
        for _ in 0..100 {
            persisted = storage.load_snapshot(&doc).unwrap();
            if persisted.as_ref().map(|r| r.version) == Some(3) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(persisted.map(|r| r.version), Some(3));

        server.documents().close(&doc).await.unwrap();
        let snapshot = server.document_snapshot(&session, "alice").await.unwrap();
        assert_eq!(snapshot.content, "xxx");
        assert_eq!(snapshot.version, 3);

        let stats = server.stats();
        assert!(stats.storage.unwrap().snapshot_count >= 1);
    }

    #[tokio::test]
    async fn test_list_and_detail() {
        let server = test_server();
        let session = server.start_session("teacher", None).unwrap();
        let (_s, _tx, _rx) = connect(&server, &session, "alice", Role::Student);

        let sessions = server.list_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].participant_count, 2);
        assert_eq!(sessions[0].online_count, 1);

        let detail = server.session_detail(&session).unwrap();
        assert_eq!(detail.presence.len(), 1);
        assert_err!(server.session_detail("missing"));
    }
}
