//! Sled-based storage for document snapshots and session archives.
//!
//! This module persists what the sync core needs to survive restarts:
//! - Compacted document snapshots (bincode)
//! - Document metadata, updated on every snapshot write
//! - Session archives (JSON, served as-is by the HTTP API)

use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::{DocumentMetadata, SessionArchive, SnapshotRecord, StorageConfig};

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corruption detected in record: {0}")]
    Corruption(String),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Tree names for different data types
const TREE_SNAPSHOTS: &str = "snapshots";
const TREE_METADATA: &str = "metadata";
const TREE_ARCHIVES: &str = "archives";

/// Sled-backed store for compacted snapshots and ended sessions
#[derive(Clone)]
pub struct SnapshotStore {
    db: Arc<Db>,
    snapshots: Tree,
    metadata: Tree,
    archives: Tree,
}

impl SnapshotStore {
    /// Open or create a snapshot store at the configured path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        if !config.temporary {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::InitFailed(format!("Failed to create directory: {}", e))
                })?;
            }
        }

        let db = sled::Config::new()
            .path(&config.path)
            .temporary(config.temporary)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let snapshots = db.open_tree(TREE_SNAPSHOTS)?;
        let metadata = db.open_tree(TREE_METADATA)?;
        let archives = db.open_tree(TREE_ARCHIVES)?;

        Ok(Self {
            db: Arc::new(db),
            snapshots,
            metadata,
            archives,
        })
    }

    /// Open with default configuration
    pub fn open_default() -> StorageResult<Self> {
        Self::open(StorageConfig::default())
    }

    /// Persist a snapshot, keeping the newer one if a later version is already stored
    pub fn save_snapshot(&self, record: &SnapshotRecord) -> StorageResult<()> {
        if let Some(existing) = self.load_snapshot(&record.document_id)? {
            if existing.version > record.version {
                return Ok(());
            }
        }

        let bytes = bincode::serialize(record)?;
        self.snapshots.insert(record.document_id.as_bytes(), bytes)?;

        if let Some(mut meta) = self.get_metadata(&record.document_id)? {
            meta.updated_at = chrono::Utc::now().timestamp();
            meta.version = record.version;
            meta.size_bytes = record.content.len() as u64;
            self.save_metadata(&meta)?;
        }

        Ok(())
    }

    /// Load the latest persisted snapshot for a document
    pub fn load_snapshot(&self, document_id: &str) -> StorageResult<Option<SnapshotRecord>> {
        match self.snapshots.get(document_id.as_bytes())? {
            Some(bytes) => {
                let record: SnapshotRecord = bincode::deserialize(&bytes)?;
                if record.document_id != document_id {
                    return Err(StorageError::Corruption(document_id.to_string()));
                }
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Delete a document's snapshot and metadata
    pub fn delete_snapshot(&self, document_id: &str) -> StorageResult<()> {
        let key = document_id.as_bytes();
        self.snapshots.remove(key)?;
        self.metadata.remove(key)?;
        Ok(())
    }

    /// Save document metadata
    pub fn save_metadata(&self, meta: &DocumentMetadata) -> StorageResult<()> {
        let bytes = bincode::serialize(meta)?;
        self.metadata.insert(meta.document_id.as_bytes(), bytes)?;
        Ok(())
    }

    /// Load document metadata
    pub fn get_metadata(&self, document_id: &str) -> StorageResult<Option<DocumentMetadata>> {
        match self.metadata.get(document_id.as_bytes())? {
            Some(bytes) => {
                let meta: DocumentMetadata = bincode::deserialize(&bytes)?;
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    /// List metadata of every document in a session
    pub fn list_session_documents(&self, session_id: &str) -> StorageResult<Vec<DocumentMetadata>> {
        let prefix = format!("{}/", session_id);
        let mut docs = Vec::new();
        for item in self.metadata.scan_prefix(prefix.as_bytes()) {
            let (_, value) = item?;
            let meta: DocumentMetadata = bincode::deserialize(&value)?;
            docs.push(meta);
        }
        Ok(docs)
    }

    /// Store the archive of an ended session and drop its live snapshots
    pub fn archive_session(&self, archive: &SessionArchive) -> StorageResult<()> {
        let bytes = serde_json::to_vec(archive)?;
        self.archives.insert(archive.session_id.as_bytes(), bytes)?;

        for meta in self.list_session_documents(&archive.session_id)? {
            self.delete_snapshot(&meta.document_id)?;
        }
        Ok(())
    }

    /// Load the archive of an ended session
    pub fn load_archive(&self, session_id: &str) -> StorageResult<Option<SessionArchive>> {
        match self.archives.get(session_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// List every archived session, most recently ended first
    pub fn list_archives(&self) -> StorageResult<Vec<SessionArchive>> {
        let mut archives = Vec::new();
        for item in self.archives.iter() {
            let (_, value) = item?;
            archives.push(serde_json::from_slice::<SessionArchive>(&value)?);
        }
        archives.sort_by(|a, b| b.ended_at.cmp(&a.ended_at));
        Ok(archives)
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Get storage statistics
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            snapshot_count: self.snapshots.len(),
            metadata_count: self.metadata.len(),
            archive_count: self.archives.len(),
            total_size_bytes: self.db.size_on_disk().unwrap_or(0),
        }
    }
}

/// Statistics about the storage
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub snapshot_count: usize,
    pub metadata_count: usize,
    pub archive_count: usize,
    pub total_size_bytes: u64,
}

impl Drop for SnapshotStore {
    fn drop(&mut self) {
        // Only the last handle flushes
        if Arc::strong_count(&self.db) == 1 {
            let _ = self.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ArchivedDocument;
    use crate::sync::session::SummaryReport;
    use tempfile::{tempdir, TempDir};

    fn test_store() -> (TempDir, SnapshotStore) {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new(dir.path().join("test.sled").to_string_lossy().to_string())
            .with_flush_interval(0);
        let store = SnapshotStore::open(config).unwrap();
        (dir, store)
    }

    fn record(document_id: &str, content: &str, version: u64) -> SnapshotRecord {
        SnapshotRecord {
            document_id: document_id.to_string(),
            content: content.to_string(),
            version,
            taken_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    #[test]
    fn test_snapshot_save_load() {
        let (_dir, store) = test_store();
        store
            .save_metadata(&DocumentMetadata::new("class-1/alice", "class-1", "alice"))
            .unwrap();
        store.save_snapshot(&record("class-1/alice", "fn main() {}", 12)).unwrap();

        let loaded = store.load_snapshot("class-1/alice").unwrap().unwrap();
        assert_eq!(loaded.content, "fn main() {}");
        assert_eq!(loaded.version, 12);

        let meta = store.get_metadata("class-1/alice").unwrap().unwrap();
        assert_eq!(meta.version, 12);
        assert_eq!(meta.size_bytes, 12);
    }

    #[test]
    fn test_snapshot_not_found() {
        let (_dir, store) = test_store();
        assert!(store.load_snapshot("nonexistent").unwrap().is_none());
    }

    #[test]
    fn test_older_snapshot_is_ignored() {
        let (_dir, store) = test_store();
        store.save_snapshot(&record("class-1/bob", "newer", 20)).unwrap();
        store.save_snapshot(&record("class-1/bob", "older", 10)).unwrap();

        let loaded = store.load_snapshot("class-1/bob").unwrap().unwrap();
        assert_eq!(loaded.version, 20);
        assert_eq!(loaded.content, "newer");
    }

    #[test]
    fn test_list_session_documents() {
        let (_dir, store) = test_store();
        for owner in ["alice", "bob"] {
            let id = format!("class-1/{}", owner);
            store
                .save_metadata(&DocumentMetadata::new(id, "class-1", owner))
                .unwrap();
        }
        store
            .save_metadata(&DocumentMetadata::new("class-10/carol", "class-10", "carol"))
            .unwrap();

        let docs = store.list_session_documents("class-1").unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[test]
    fn test_archive_session() {
        let (_dir, store) = test_store();
        store
            .save_metadata(&DocumentMetadata::new("class-1/alice", "class-1", "alice"))
            .unwrap();
        store.save_snapshot(&record("class-1/alice", "done", 3)).unwrap();

        let archive = SessionArchive {
            session_id: "class-1".to_string(),
            teacher_id: "teacher".to_string(),
            problem_id: Some("remove-duplicates".to_string()),
            started_at: 1,
            ended_at: 2,
            documents: vec![ArchivedDocument {
                document_id: "class-1/alice".to_string(),
                owner_id: "alice".to_string(),
                content: "done".to_string(),
                version: 3,
                created_at: 1_000,
                updated_at: 2_000,
            }],
            report: SummaryReport::empty("class-1"),
        };
        store.archive_session(&archive).unwrap();

        let loaded = store.load_archive("class-1").unwrap().unwrap();
        assert_eq!(loaded.documents, archive.documents);
        assert_eq!(store.list_archives().unwrap().len(), 1);
        assert!(store.load_snapshot("class-1/alice").unwrap().is_none());
        assert_eq!(store.stats().archive_count, 1);
    }
}
