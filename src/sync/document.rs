//! Authoritative state of a single participant document.
//!
//! A [`Document`] is owned by exactly one serializer task (see [`super::store`]),
//! so none of its methods need interior locking. It keeps:
//! - The current content and version
//! - The base snapshot the operation log starts from
//! - The committed operation log since that snapshot
//! - Per-author sequence numbers for de-duplication
//! - Per-client acknowledged versions for the low-water mark

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use super::operation::{self, CommittedOperation, Operation, TextOperation};
use super::{DocumentId, ParticipantId, SessionId, SyncError, SyncResult};

/// Content of a document at a given version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub document_id: DocumentId,
    pub content: String,
    pub version: u64,
}

impl Snapshot {
    pub fn empty(document_id: impl Into<DocumentId>) -> Self {
        Self {
            document_id: document_id.into(),
            content: String::new(),
            version: 0,
        }
    }
}

/// Outcome of an accepted (or already accepted) operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedResult {
    pub document_id: DocumentId,
    /// Version produced by the operation
    pub version: u64,
    /// The operation as committed, rebased onto `version - 1`
    pub operation: Operation,
    /// True when the submission was recognised as a resend
    pub duplicate: bool,
}

impl AppliedResult {
    pub fn committed(&self) -> CommittedOperation {
        CommittedOperation {
            version: self.version,
            operation: self.operation.clone(),
        }
    }
}

/// A participant document and its operation log
#[derive(Debug, Clone)]
pub struct Document {
    id: DocumentId,
    session_id: SessionId,
    owner_id: ParticipantId,
    content: String,
    version: u64,
    base: Snapshot,
    log: VecDeque<CommittedOperation>,
    /// Highest committed client sequence number and the version it produced, per author
    last_seq: HashMap<ParticipantId, (u64, u64)>,
    acknowledged: HashMap<ParticipantId, u64>,
    created_at: i64,
    updated_at: i64,
}

impl Document {
    pub fn new(id: impl Into<DocumentId>, session_id: impl Into<SessionId>, owner_id: impl Into<ParticipantId>) -> Self {
        Self::with_content(id, session_id, owner_id, "")
    }

    /// Create a document seeded with starter content at version 0
    pub fn with_content(
        id: impl Into<DocumentId>,
        session_id: impl Into<SessionId>,
        owner_id: impl Into<ParticipantId>,
        content: &str,
    ) -> Self {
        let id = id.into();
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            base: Snapshot {
                document_id: id.clone(),
                content: content.to_string(),
                version: 0,
            },
            id,
            session_id: session_id.into(),
            owner_id: owner_id.into(),
            content: content.to_string(),
            version: 0,
            log: VecDeque::new(),
            last_seq: HashMap::new(),
            acknowledged: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Version of the snapshot the log starts from
    pub fn base_version(&self) -> u64 {
        self.base.version
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn updated_at(&self) -> i64 {
        self.updated_at
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            document_id: self.id.clone(),
            content: self.content.clone(),
            version: self.version,
        }
    }

    /// Rebase an operation onto the current version and commit it.
    pub fn apply(&mut self, operation: Operation) -> SyncResult<AppliedResult> {
        if let Some(result) = self.find_duplicate(&operation) {
            return Ok(result);
        }

        if operation.base_version > self.version {
            return Err(SyncError::InvalidOperation(format!(
                "base version {} is ahead of document version {}",
                operation.base_version, self.version
            )));
        }
        if operation.base_version < self.base.version {
            return Err(SyncError::StaleSnapshot {
                requested: operation.base_version,
                oldest: self.base.version,
            });
        }

        let start = (operation.base_version - self.base.version) as usize;
        let concurrent = &self.log.make_contiguous()[start..];
        let mut rebased = operation::rebase(&operation, concurrent)?;
        rebased.base_version = self.version;

        self.content = rebased.payload.apply(&self.content)?;
        self.version += 1;
        self.updated_at = chrono::Utc::now().timestamp_millis();

        self.last_seq
            .insert(rebased.author_id.clone(), (rebased.client_seq, self.version));
        self.acknowledged.insert(rebased.author_id.clone(), self.version);

        let committed = CommittedOperation {
            version: self.version,
            operation: rebased,
        };
        self.log.push_back(committed.clone());

        Ok(AppliedResult {
            document_id: self.id.clone(),
            version: committed.version,
            operation: committed.operation,
            duplicate: false,
        })
    }

    fn find_duplicate(&self, operation: &Operation) -> Option<AppliedResult> {
        let (last_seq, last_version) = *self.last_seq.get(&operation.author_id)?;
        if operation.client_seq > last_seq {
            return None;
        }

        let original = self.log.iter().find(|c| {
            c.operation.author_id == operation.author_id
                && c.operation.client_seq == operation.client_seq
        });

        Some(match original {
            Some(committed) => AppliedResult {
                document_id: self.id.clone(),
                version: committed.version,
                operation: committed.operation.clone(),
                duplicate: true,
            },
            // Already folded into the snapshot; the payload is no longer meaningful.
            None => AppliedResult {
                document_id: self.id.clone(),
                version: if operation.client_seq == last_seq {
                    last_version
                } else {
                    self.base.version
                },
                operation: Operation {
                    payload: TextOperation::new(),
                    ..operation.clone()
                },
                duplicate: true,
            },
        })
    }

    /// All committed operations with a version greater than `version`
    pub fn operations_since(&self, version: u64) -> SyncResult<Vec<CommittedOperation>> {
        if version > self.version {
            return Err(SyncError::InvalidOperation(format!(
                "version {} is ahead of document version {}",
                version, self.version
            )));
        }
        if version < self.base.version {
            return Err(SyncError::StaleSnapshot {
                requested: version,
                oldest: self.base.version,
            });
        }

        let start = (version - self.base.version) as usize;
        Ok(self.log.iter().skip(start).cloned().collect())
    }

    /// Record the version a client is known to hold. Never moves backwards.
    pub fn acknowledge(&mut self, participant_id: &str, version: u64) {
        let version = version.clamp(self.base.version, self.version);
        let known = self
            .acknowledged
            .entry(participant_id.to_string())
            .or_insert(version);
        *known = (*known).max(version);
    }

    /// Start tracking a client at the current version; no-op if already tracked.
    pub fn track(&mut self, participant_id: &str) -> bool {
        if self.is_tracked(participant_id) {
            return false;
        }
        self.acknowledged.insert(participant_id.to_string(), self.version);
        true
    }

    /// Stop tracking a client for the low-water mark.
    pub fn forget(&mut self, participant_id: &str) -> bool {
        self.acknowledged.remove(participant_id).is_some()
    }

    pub fn is_tracked(&self, participant_id: &str) -> bool {
        self.acknowledged.contains_key(participant_id)
    }

    /// Minimum version acknowledged by any tracked client
    pub fn low_water_mark(&self) -> u64 {
        self.acknowledged
            .values()
            .copied()
            .min()
            .unwrap_or(self.version)
    }

    /// The base snapshot plus every logged operation that is safe to fold.
    pub fn compaction_input(&self) -> Option<(Snapshot, Vec<CommittedOperation>)> {
        let upto = self.low_water_mark().min(self.version);
        if upto <= self.base.version {
            return None;
        }
        let operations: Vec<_> = self
            .log
            .iter()
            .take_while(|c| c.version <= upto)
            .cloned()
            .collect();
        Some((self.base.clone(), operations))
    }

    /// Replace the base snapshot and drop log entries covered by it.
    ///
    /// Returns false when the snapshot is not newer than the current base or
    /// claims a version this document never reached.
    pub fn install_snapshot(&mut self, snapshot: Snapshot) -> bool {
        if snapshot.document_id != self.id
            || snapshot.version <= self.base.version
            || snapshot.version > self.version
        {
            return false;
        }
        while self
            .log
            .front()
            .map_or(false, |c| c.version <= snapshot.version)
        {
            self.log.pop_front();
        }
        self.base = snapshot;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(author: &str, seq: u64, base: u64, doc_len: usize, offset: usize, text: &str) -> Operation {
        Operation::new(
            author,
            seq,
            base,
            TextOperation::insert_at(doc_len, offset, text).unwrap(),
        )
    }

    fn replay(doc: &Document) -> String {
        let mut content = doc.base.content.clone();
        for committed in &doc.log {
            content = committed.operation.payload.apply(&content).unwrap();
        }
        content
    }

    #[test]
    fn test_apply_increments_version() {
        let mut doc = Document::new("s/alice", "s", "alice");
        let result = doc.apply(insert("alice", 1, 0, 0, 0, "hello")).unwrap();
        assert_eq!(result.version, 1);
        assert!(!result.duplicate);

        let result = doc.apply(insert("alice", 2, 1, 5, 5, " world")).unwrap();
        assert_eq!(result.version, 2);
        assert_eq!(doc.content(), "hello world");
        assert_eq!(replay(&doc), doc.content());
    }

    #[test]
    fn test_concurrent_inserts_are_rebased() {
        let mut doc = Document::with_content("s/t", "s", "t", "");
        let x = doc.apply(insert("x", 1, 0, 0, 0, "foo")).unwrap();
        let y = doc.apply(insert("y", 1, 0, 0, 0, "bar")).unwrap();

        assert_eq!(x.version, 1);
        assert_eq!(y.version, 2);
        assert_eq!(y.operation.base_version, 1);
        assert_eq!(doc.content(), "foobar");
    }

    #[test]
    fn test_duplicate_is_applied_once() {
        let mut doc = Document::with_content("s/a", "s", "a", "abcdef");
        let delete = Operation::new("a", 7, 0, TextOperation::delete_at(6, 1, 3).unwrap());

        let first = doc.apply(delete.clone()).unwrap();
        let second = doc.apply(delete).unwrap();

        assert!(second.duplicate);
        assert_eq!(second.version, first.version);
        assert_eq!(doc.version(), 1);
        assert_eq!(doc.content(), "aef");
    }

    #[test]
    fn test_rejects_future_and_malformed_operations() {
        let mut doc = Document::with_content("s/a", "s", "a", "abc");
        let err = doc.apply(insert("a", 1, 4, 3, 0, "x")).unwrap_err();
        assert!(matches!(err, SyncError::InvalidOperation(_)));

        let err = doc.apply(insert("a", 1, 0, 10, 0, "x")).unwrap_err();
        assert!(matches!(err, SyncError::InvalidOperation(_)));
        assert_eq!(doc.version(), 0);
        assert_eq!(doc.content(), "abc");
    }

    #[test]
    fn test_operations_since() {
        let mut doc = Document::new("s/a", "s", "a");
        for seq in 1..=4 {
            let len = doc.content().chars().count();
            doc.apply(insert("a", seq, doc.version(), len, len, "x")).unwrap();
        }

        let ops = doc.operations_since(2).unwrap();
        assert_eq!(ops.iter().map(|c| c.version).collect::<Vec<_>>(), vec![3, 4]);
        assert!(doc.operations_since(4).unwrap().is_empty());
        assert!(matches!(
            doc.operations_since(5),
            Err(SyncError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_recovery_reproduces_content() {
        let mut doc = Document::with_content("s/a", "s", "a", "let x = 1;");
        let snapshot = doc.snapshot();
        doc.apply(insert("a", 1, 0, 10, 10, "\nlet y = 2;")).unwrap();
        doc.apply(Operation::new("a", 2, 1, TextOperation::delete_at(21, 0, 4).unwrap()))
            .unwrap();

        let mut content = snapshot.content;
        for committed in doc.operations_since(snapshot.version).unwrap() {
            content = committed.operation.payload.apply(&content).unwrap();
        }
        assert_eq!(content, doc.content());
    }

    #[test]
    fn test_low_water_mark() {
        let mut doc = Document::new("s/a", "s", "a");
        assert_eq!(doc.low_water_mark(), 0);

        doc.apply(insert("a", 1, 0, 0, 0, "a")).unwrap();
        doc.apply(insert("a", 2, 1, 1, 1, "b")).unwrap();
        doc.acknowledge("teacher", 1);
        assert_eq!(doc.low_water_mark(), 1);

        doc.acknowledge("teacher", 99);
        assert_eq!(doc.low_water_mark(), 2);

        // A late, smaller ack does not pull the mark back
        doc.acknowledge("teacher", 1);
        assert_eq!(doc.low_water_mark(), 2);

        assert!(doc.forget("teacher"));
        doc.forget("a");
        assert_eq!(doc.low_water_mark(), doc.version());
    }

    #[test]
    fn test_track_starts_at_current_version() {
        let mut doc = Document::new("s/a", "s", "a");
        doc.apply(insert("a", 1, 0, 0, 0, "a")).unwrap();
        doc.forget("a");

        assert!(doc.track("teacher"));
        assert!(doc.is_tracked("teacher"));
        assert_eq!(doc.low_water_mark(), 1);

        doc.apply(insert("a", 2, 1, 1, 1, "b")).unwrap();
        assert!(!doc.track("teacher"));
        assert_eq!(doc.low_water_mark(), 1);
    }

    #[test]
    fn test_compaction_respects_low_water_mark() {
        let mut doc = Document::new("s/a", "s", "a");
        for seq in 1..=5 {
            let len = doc.content().chars().count();
            doc.apply(insert("a", seq, doc.version(), len, len, "x")).unwrap();
        }
        doc.acknowledge("teacher", 3);

        let (base, ops) = doc.compaction_input().unwrap();
        assert_eq!(base.version, 0);
        assert_eq!(ops.iter().map(|c| c.version).collect::<Vec<_>>(), vec![1, 2, 3]);

        let installed = doc.install_snapshot(Snapshot {
            document_id: "s/a".to_string(),
            content: "xxx".to_string(),
            version: 3,
        });
        assert!(installed);
        assert_eq!(doc.base_version(), 3);
        assert_eq!(doc.log_len(), 2);
        assert_eq!(replay(&doc), doc.content());

        // Teacher still needs versions 4 and 5
        assert_eq!(doc.operations_since(3).unwrap().len(), 2);
        assert!(matches!(
            doc.operations_since(2),
            Err(SyncError::StaleSnapshot { requested: 2, oldest: 3 })
        ));
        assert!(matches!(
            doc.apply(insert("b", 1, 1, 1, 0, "y")),
            Err(SyncError::StaleSnapshot { .. })
        ));
    }

    #[test]
    fn test_install_snapshot_ignores_older() {
        let mut doc = Document::new("s/a", "s", "a");
        doc.apply(insert("a", 1, 0, 0, 0, "a")).unwrap();
        doc.apply(insert("a", 2, 1, 1, 1, "b")).unwrap();

        assert!(doc.install_snapshot(Snapshot {
            document_id: "s/a".into(),
            content: "ab".into(),
            version: 2,
        }));
        assert!(!doc.install_snapshot(Snapshot {
            document_id: "s/a".into(),
            content: "a".into(),
            version: 1,
        }));
        assert!(!doc.install_snapshot(Snapshot {
            document_id: "s/a".into(),
            content: "abc".into(),
            version: 3,
        }));
        assert_eq!(doc.base_version(), 2);
        assert!(doc.compaction_input().is_none());
    }

    #[test]
    fn test_duplicate_after_compaction() {
        let mut doc = Document::new("s/a", "s", "a");
        let op = insert("a", 1, 0, 0, 0, "a");
        doc.apply(op.clone()).unwrap();
        doc.install_snapshot(doc.snapshot());

        let again = doc.apply(op).unwrap();
        assert!(again.duplicate);
        assert_eq!(again.version, 1);
        assert_eq!(doc.content(), "a");
    }
}
