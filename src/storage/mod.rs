//! Storage module for persistent document snapshots and session archives using Sled.
//!
//! This module provides the embedded database layer behind the sync core:
//! - Compacted document snapshots, written by the snapshot service
//! - Per-document metadata (owner, version, sizes)
//! - Session archives holding final document contents and the summary report

mod sled_store;

pub use sled_store::{SnapshotStore, StorageError, StorageResult, StorageStats};

use serde::{Deserialize, Serialize};

use crate::sync::session::SummaryReport;

/// Metadata stored alongside document snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Document identifier (`session/participant`)
    pub document_id: String,
    /// Session the document belongs to
    pub session_id: String,
    /// Participant with write authority
    pub owner_id: String,
    /// Unix timestamp of creation
    pub created_at: i64,
    /// Unix timestamp of the last persisted snapshot
    pub updated_at: i64,
    /// Version of the last persisted snapshot
    pub version: u64,
    /// Size of the snapshot content in bytes
    pub size_bytes: u64,
}

impl DocumentMetadata {
    pub fn new(
        document_id: impl Into<String>,
        session_id: impl Into<String>,
        owner_id: impl Into<String>,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            document_id: document_id.into(),
            session_id: session_id.into(),
            owner_id: owner_id.into(),
            created_at: now,
            updated_at: now,
            version: 0,
            size_bytes: 0,
        }
    }
}

/// A compacted document snapshot as persisted by the snapshot service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub document_id: String,
    pub content: String,
    pub version: u64,
    /// Unix timestamp (millis) when the snapshot was taken
    pub taken_at: i64,
}

/// Final state of one document when its session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedDocument {
    pub document_id: String,
    pub owner_id: String,
    pub content: String,
    pub version: u64,
    /// Unix millis
    #[serde(default)]
    pub created_at: i64,
    /// Unix millis of the last committed edit
    #[serde(default)]
    pub updated_at: i64,
}

/// Everything kept about a session after it ends
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionArchive {
    pub session_id: String,
    pub teacher_id: String,
    pub problem_id: Option<String>,
    pub started_at: i64,
    pub ended_at: i64,
    pub documents: Vec<ArchivedDocument>,
    pub report: SummaryReport,
}

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes (default: 256MB)
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = only explicit flushes)
    pub flush_interval_ms: u64,
    /// Use a throwaway database that is removed on drop
    pub temporary: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/classroom.sled".to_string(),
            cache_size: 256 * 1024 * 1024, // 256MB
            flush_interval_ms: 500,
            temporary: false,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }

    pub fn with_flush_interval(mut self, ms: u64) -> Self {
        self.flush_interval_ms = ms;
        self
    }

    pub fn temporary(mut self, temporary: bool) -> Self {
        self.temporary = temporary;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_creation() {
        let meta = DocumentMetadata::new("class-1/alice", "class-1", "alice");

        assert_eq!(meta.document_id, "class-1/alice");
        assert_eq!(meta.session_id, "class-1");
        assert_eq!(meta.owner_id, "alice");
        assert_eq!(meta.version, 0);
        assert!(meta.created_at > 0);
    }

    #[test]
    fn test_storage_config_default() {
        let config = StorageConfig::default();
        assert_eq!(config.path, "./data/classroom.sled");
        assert_eq!(config.cache_size, 256 * 1024 * 1024);
        assert!(!config.temporary);

        let config = StorageConfig::new("/tmp/x.sled").with_flush_interval(0);
        assert_eq!(config.flush_interval_ms, 0);
    }
}
