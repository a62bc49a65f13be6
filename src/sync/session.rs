//! Class session membership, share state and end-of-class reporting.
//!
//! A [`ClassSession`] owns the roster of a class and the session-wide flags
//! that decide who may write which document and which documents each
//! participant is subscribed to. Capability checks live here so every
//! transport goes through the same rules.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::presence::Role;
use super::{document_id, DocumentId, ParticipantId, SessionId, SyncError, SyncResult};

/// Progress at or above which a student counts as completed
pub const COMPLETED_THRESHOLD: u32 = 80;

/// Progress below which a student counts as struggling
pub const STRUGGLING_THRESHOLD: u32 = 50;

/// Whose document is force-mirrored to the rest of the class
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ShareState {
    #[default]
    None,
    TeacherShared,
    StudentShared(ParticipantId),
}

/// What the teacher is currently looking at
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ViewMode {
    /// All student documents side by side
    #[default]
    Grid,
    /// A single student's document
    Detail(ParticipantId),
}

/// What a participant receives when it joins a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub role: Role,
    pub color: String,
    /// The participant's own document
    pub own_document: DocumentId,
    /// Every document the participant currently receives operations for
    pub documents: Vec<DocumentId>,
    pub share_state: ShareState,
    pub view_mode: ViewMode,
    pub problem_id: Option<String>,
    /// Whether the participant may write its own document right now
    pub writable: bool,
    /// Token a reconnecting transport presents to re-attach
    pub resume_token: String,
}

/// Whether a join created a new roster entry or re-attached an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    New,
    Rejoined,
}

/// Roster entry of a session participant
#[derive(Debug, Clone)]
pub struct ParticipantRecord {
    pub participant_id: ParticipantId,
    pub name: String,
    pub role: Role,
    pub document_id: DocumentId,
    /// Unix seconds of the first join
    pub joined_at: i64,
    /// Closed attendance intervals, summed
    attended: Duration,
    /// Start of the current attendance interval; `None` after leaving
    present_since: Option<Instant>,
    pub tests_passed: u32,
    pub total_tests: u32,
}

impl ParticipantRecord {
    fn new(session_id: &str, participant_id: &str, name: &str, role: Role) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            name: name.to_string(),
            role,
            document_id: document_id(session_id, participant_id),
            joined_at: chrono::Utc::now().timestamp(),
            attended: Duration::ZERO,
            present_since: Some(Instant::now()),
            tests_passed: 0,
            total_tests: 0,
        }
    }

    pub fn has_left(&self) -> bool {
        self.present_since.is_none()
    }

    fn mark_left(&mut self, now: Instant) -> bool {
        match self.present_since.take() {
            Some(since) => {
                self.attended += now.saturating_duration_since(since);
                true
            }
            None => false,
        }
    }

    fn mark_present(&mut self, now: Instant) {
        if self.present_since.is_none() {
            self.present_since = Some(now);
        }
    }

    /// Percentage of passing tests, 0 when no tests were reported
    pub fn progress(&self) -> u32 {
        if self.total_tests == 0 {
            0
        } else {
            let passed = u64::from(self.tests_passed.min(self.total_tests));
            (passed * 100 / u64::from(self.total_tests)) as u32
        }
    }

    /// Total time present in the session, up to `now` while still present
    pub fn time_spent_secs(&self, now: Instant) -> u64 {
        let current = self
            .present_since
            .map_or(Duration::ZERO, |since| now.saturating_duration_since(since));
        (self.attended + current).as_secs()
    }
}

/// Per-participant line of the end-of-class report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSummary {
    pub participant_id: ParticipantId,
    pub name: String,
    pub role: Role,
    pub final_version: u64,
    pub tests_passed: u32,
    pub total_tests: u32,
    /// 0 to 100
    pub progress: u32,
    pub time_spent_secs: u64,
}

/// End-of-class report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryReport {
    pub session_id: SessionId,
    pub generated_at: i64,
    pub participants: Vec<ParticipantSummary>,
    pub total_students: usize,
    /// Rounded mean progress over students
    pub average_progress: u32,
    pub completed_count: usize,
    pub struggling_count: usize,
}

impl SummaryReport {
    pub fn empty(session_id: impl Into<SessionId>) -> Self {
        Self::from_participants(session_id, Vec::new())
    }

    /// Build a report and compute the class aggregates over students
    pub fn from_participants(session_id: impl Into<SessionId>, participants: Vec<ParticipantSummary>) -> Self {
        let students: Vec<&ParticipantSummary> = participants
            .iter()
            .filter(|p| p.role == Role::Student)
            .collect();

        let total_students = students.len();
        let average_progress = if total_students == 0 {
            0
        } else {
            let sum: u32 = students.iter().map(|s| s.progress).sum();
            (sum as f64 / total_students as f64).round() as u32
        };
        let completed_count = students
            .iter()
            .filter(|s| s.progress >= COMPLETED_THRESHOLD)
            .count();
        let struggling_count = students
            .iter()
            .filter(|s| s.progress < STRUGGLING_THRESHOLD)
            .count();

        Self {
            session_id: session_id.into(),
            generated_at: chrono::Utc::now().timestamp(),
            participants,
            total_students,
            average_progress,
            completed_count,
            struggling_count,
        }
    }
}

/// A live class: roster, share state and teacher view
pub struct ClassSession {
    id: SessionId,
    teacher_id: ParticipantId,
    created_at: i64,
    max_participants: usize,
    participants: RwLock<Vec<ParticipantRecord>>,
    share_state: RwLock<ShareState>,
    view_mode: RwLock<ViewMode>,
    problem_id: RwLock<Option<String>>,
    ending: AtomicBool,
}

impl ClassSession {
    /// Create a session; the teacher is on the roster from the start
    pub fn new(id: impl Into<SessionId>, teacher_id: impl Into<ParticipantId>, max_participants: usize) -> Self {
        let id = id.into();
        let teacher_id = teacher_id.into();
        let teacher = ParticipantRecord::new(&id, &teacher_id, &teacher_id, Role::Teacher);
        Self {
            created_at: chrono::Utc::now().timestamp(),
            participants: RwLock::new(vec![teacher]),
            id,
            teacher_id,
            max_participants,
            share_state: RwLock::new(ShareState::None),
            view_mode: RwLock::new(ViewMode::Grid),
            problem_id: RwLock::new(None),
            ending: AtomicBool::new(false),
        }
    }

    pub fn with_problem(self, problem_id: Option<String>) -> Self {
        *self.problem_id.write() = problem_id;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn teacher_id(&self) -> &str {
        &self.teacher_id
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn teacher_document(&self) -> DocumentId {
        document_id(&self.id, &self.teacher_id)
    }

    /// Add a participant, or re-attach one that joined before
    pub fn join(&self, participant_id: &str, name: &str, role: Role) -> SyncResult<JoinKind> {
        if self.is_ending() {
            return Err(SyncError::SessionNotFound(self.id.clone()));
        }
        let is_teacher = participant_id == self.teacher_id;
        if role.is_teacher() != is_teacher {
            return Err(SyncError::Unauthorized(if role.is_teacher() {
                format!("session {} already has a teacher", self.id)
            } else {
                format!("{} is the teacher of session {}", participant_id, self.id)
            }));
        }

        let mut participants = self.participants.write();
        if let Some(record) = participants
            .iter_mut()
            .find(|r| r.participant_id == participant_id)
        {
            record.name = name.to_string();
            record.mark_present(Instant::now());
            return Ok(JoinKind::Rejoined);
        }

        if participants.len() >= self.max_participants {
            return Err(SyncError::SessionFull(self.id.clone()));
        }
        participants.push(ParticipantRecord::new(&self.id, participant_id, name, role));
        Ok(JoinKind::New)
    }

    /// Record that a participant left; its document and report line are kept
    pub fn leave(&self, participant_id: &str) -> bool {
        let mut participants = self.participants.write();
        participants
            .iter_mut()
            .find(|r| r.participant_id == participant_id)
            .map_or(false, |record| record.mark_left(Instant::now()))
    }

    pub fn record(&self, participant_id: &str) -> Option<ParticipantRecord> {
        self.participants
            .read()
            .iter()
            .find(|r| r.participant_id == participant_id)
            .cloned()
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.participants
            .read()
            .iter()
            .any(|r| r.participant_id == participant_id)
    }

    pub fn role_of(&self, participant_id: &str) -> Option<Role> {
        self.participants
            .read()
            .iter()
            .find(|r| r.participant_id == participant_id)
            .map(|r| r.role)
    }

    pub fn is_student(&self, participant_id: &str) -> bool {
        self.role_of(participant_id) == Some(Role::Student)
    }

    /// Participant ids in join order
    pub fn participant_ids(&self) -> Vec<ParticipantId> {
        self.participants
            .read()
            .iter()
            .map(|r| r.participant_id.clone())
            .collect()
    }

    pub fn student_ids(&self) -> Vec<ParticipantId> {
        self.participants
            .read()
            .iter()
            .filter(|r| r.role == Role::Student)
            .map(|r| r.participant_id.clone())
            .collect()
    }

    pub fn document_ids(&self) -> Vec<DocumentId> {
        self.participants
            .read()
            .iter()
            .map(|r| r.document_id.clone())
            .collect()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.read().len()
    }

    pub fn share_state(&self) -> ShareState {
        self.share_state.read().clone()
    }

    pub fn view_mode(&self) -> ViewMode {
        self.view_mode.read().clone()
    }

    pub fn problem_id(&self) -> Option<String> {
        self.problem_id.read().clone()
    }

    fn require_teacher(&self, requester: &str, action: &str) -> SyncResult<()> {
        if requester != self.teacher_id {
            return Err(SyncError::Unauthorized(format!(
                "only the teacher may {}",
                action
            )));
        }
        Ok(())
    }

    /// Change the share state; returns false when it was already set
    pub fn set_share_state(&self, requester: &str, state: ShareState) -> SyncResult<bool> {
        self.require_teacher(requester, "change the share state")?;
        if let ShareState::StudentShared(student) = &state {
            if !self.is_student(student) {
                return Err(SyncError::ParticipantNotFound(student.clone()));
            }
        }

        let mut current = self.share_state.write();
        if *current == state {
            return Ok(false);
        }
        *current = state;
        Ok(true)
    }

    /// Change the teacher's view; returns false when it was already set
    pub fn set_view_mode(&self, requester: &str, mode: ViewMode) -> SyncResult<bool> {
        self.require_teacher(requester, "change the view mode")?;
        if let ViewMode::Detail(student) = &mode {
            if !self.is_student(student) {
                return Err(SyncError::ParticipantNotFound(student.clone()));
            }
        }

        let mut current = self.view_mode.write();
        if *current == mode {
            return Ok(false);
        }
        *current = mode;
        Ok(true)
    }

    pub fn select_problem(&self, requester: &str, problem_id: Option<String>) -> SyncResult<()> {
        self.require_teacher(requester, "select the problem")?;
        *self.problem_id.write() = problem_id;
        Ok(())
    }

    /// Store the latest test results a participant reported
    pub fn report_progress(&self, participant_id: &str, tests_passed: u32, total_tests: u32) -> SyncResult<()> {
        let mut participants = self.participants.write();
        let record = participants
            .iter_mut()
            .find(|r| r.participant_id == participant_id)
            .ok_or_else(|| SyncError::ParticipantNotFound(participant_id.to_string()))?;
        record.total_tests = total_tests;
        record.tests_passed = tests_passed.min(total_tests);
        Ok(())
    }

    /// Whether the participant's own document is currently a read-only mirror
    pub fn is_read_only(&self, participant_id: &str) -> bool {
        if participant_id == self.teacher_id {
            return false;
        }
        match &*self.share_state.read() {
            ShareState::None => false,
            ShareState::TeacherShared => true,
            ShareState::StudentShared(student) => student != participant_id,
        }
    }

    pub fn can_write(&self, participant_id: &str, document_id: &str) -> bool {
        self.record(participant_id)
            .map_or(false, |r| r.document_id == document_id)
            && !self.is_read_only(participant_id)
    }

    pub fn check_write(&self, participant_id: &str, document_id: &str) -> SyncResult<()> {
        if self.can_write(participant_id, document_id) {
            Ok(())
        } else {
            Err(SyncError::Unauthorized(format!(
                "{} may not write {}",
                participant_id, document_id
            )))
        }
    }

    /// The document currently mirrored to the class, if any
    pub fn shared_document(&self) -> Option<DocumentId> {
        match &*self.share_state.read() {
            ShareState::None => None,
            ShareState::TeacherShared => Some(self.teacher_document()),
            ShareState::StudentShared(student) => Some(document_id(&self.id, student)),
        }
    }

    /// Documents a participant receives operations for
    pub fn subscriptions_for(&self, participant_id: &str) -> Vec<DocumentId> {
        let Some(record) = self.record(participant_id) else {
            return Vec::new();
        };

        let mut documents = vec![record.document_id.clone()];
        if record.role.is_teacher() {
            match self.view_mode() {
                ViewMode::Grid => {
                    documents.extend(self.student_ids().iter().map(|s| document_id(&self.id, s)))
                }
                ViewMode::Detail(student) => documents.push(document_id(&self.id, &student)),
            }
        }
        if let Some(shared) = self.shared_document() {
            documents.push(shared);
        }

        let mut seen = std::collections::HashSet::new();
        documents.retain(|d| seen.insert(d.clone()));
        documents
    }

    pub fn can_read(&self, participant_id: &str, document_id: &str) -> bool {
        self.subscriptions_for(participant_id)
            .iter()
            .any(|d| d == document_id)
    }

    pub fn check_read(&self, participant_id: &str, document_id: &str) -> SyncResult<()> {
        if self.can_read(participant_id, document_id) {
            Ok(())
        } else {
            Err(SyncError::Unauthorized(format!(
                "{} may not read {}",
                participant_id, document_id
            )))
        }
    }

    /// Mark the session as ending; returns false if it already was
    pub fn begin_ending(&self) -> bool {
        !self.ending.swap(true, Ordering::SeqCst)
    }

    pub fn is_ending(&self) -> bool {
        self.ending.load(Ordering::SeqCst)
    }

    /// Build the report; `final_version` looks up each document's last version
    pub fn summary<F>(&self, now: Instant, final_version: F) -> SummaryReport
    where
        F: Fn(&str) -> u64,
    {
        let participants = self
            .participants
            .read()
            .iter()
            .map(|r| ParticipantSummary {
                participant_id: r.participant_id.clone(),
                name: r.name.clone(),
                role: r.role,
                final_version: final_version(&r.document_id),
                tests_passed: r.tests_passed,
                total_tests: r.total_tests,
                progress: r.progress(),
                time_spent_secs: r.time_spent_secs(now),
            })
            .collect();
        SummaryReport::from_participants(self.id.clone(), participants)
    }
}
