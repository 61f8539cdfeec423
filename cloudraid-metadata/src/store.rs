//! Metadata store contract

use crate::models::{FileId, FileRecord, FileStatus};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type for metadata operations
pub type Result<T> = std::result::Result<T, MetadataError>;

/// Metadata store errors
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("File not found: {0}")]
    NotFound(FileId),

    #[error("File already exists: user {user_id} path {path}")]
    Duplicate { user_id: u64, path: String },

    #[error("Illegal transition for file {id}: {from} -> {to}")]
    IllegalTransition {
        id: FileId,
        from: FileStatus,
        to: FileStatus,
    },

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// CRUD and lifecycle operations on file records.
///
/// Every status change goes through [`MetadataStore::file_update_state`], which
/// enforces [`FileStatus::can_transition_to`] atomically per record.
pub trait MetadataStore: Send + Sync {
    /// Look up a record by id
    fn file_by_id(&self, id: FileId) -> Result<Option<FileRecord>>;

    /// Create a record in `UPLOADING`. Fails with `Duplicate` if `(user_id, path)` exists.
    fn file_new(
        &self,
        path: &str,
        hash: &str,
        last_modified: DateTime<Utc>,
        user_id: u64,
    ) -> Result<FileId>;

    /// Replace the descriptive fields of a record; the status is untouched
    fn file_update(
        &self,
        id: FileId,
        path: &str,
        hash: &str,
        last_modified: DateTime<Utc>,
        user_id: u64,
    ) -> Result<()>;

    /// Move a record to `status`
    fn file_update_state(&self, id: FileId, status: FileStatus) -> Result<()>;

    /// Remove a record, returning how many were removed (0 or 1)
    fn file_delete(&self, id: FileId) -> Result<usize>;

    /// Look up a record by its user-relative path
    fn file_get(&self, path: &str, user_id: u64) -> Result<Option<FileRecord>>;

    /// All records of one user, ordered by path
    fn file_list(&self, user_id: u64) -> Result<Vec<FileRecord>>;

    /// All records currently in `status`, ordered by id
    fn files_in_state(&self, status: FileStatus) -> Result<Vec<FileRecord>>;

    /// Fetch a record that must exist
    fn require(&self, id: FileId) -> Result<FileRecord> {
        self.file_by_id(id)?.ok_or(MetadataError::NotFound(id))
    }
}

/// Check a transition, producing the store error on rejection
pub(crate) fn check_transition(id: FileId, from: FileStatus, to: FileStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(MetadataError::IllegalTransition { id, from, to })
    }
}
