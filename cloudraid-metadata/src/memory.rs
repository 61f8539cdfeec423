//! In-memory metadata store
//!
//! Used for testing and for deployments that rebuild state from the watched
//! directory on every start. Not persistent.

use crate::models::{FileId, FileRecord, FileStatus};
use crate::store::{check_transition, MetadataError, MetadataStore, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
struct Inner {
    next_id: FileId,
    files: BTreeMap<FileId, FileRecord>,
    by_path: HashMap<(u64, String), FileId>,
}

/// In-memory metadata store
#[derive(Default)]
pub struct MemoryMetadataStore {
    inner: RwLock<Inner>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.inner.read().files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn file_by_id(&self, id: FileId) -> Result<Option<FileRecord>> {
        Ok(self.inner.read().files.get(&id).cloned())
    }

    fn file_new(
        &self,
        path: &str,
        hash: &str,
        last_modified: DateTime<Utc>,
        user_id: u64,
    ) -> Result<FileId> {
        let mut inner = self.inner.write();
        let key = (user_id, path.to_string());
        if inner.by_path.contains_key(&key) {
            return Err(MetadataError::Duplicate {
                user_id,
                path: path.to_string(),
            });
        }

        inner.next_id += 1;
        let id = inner.next_id;
        inner.by_path.insert(key, id);
        inner.files.insert(
            id,
            FileRecord {
                id,
                user_id,
                path: path.to_string(),
                content_hash: hash.to_string(),
                last_modified,
                status: FileStatus::Uploading,
            },
        );
        Ok(id)
    }

    fn file_update(
        &self,
        id: FileId,
        path: &str,
        hash: &str,
        last_modified: DateTime<Utc>,
        user_id: u64,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let (old_key, new_key) = {
            let record = inner.files.get(&id).ok_or(MetadataError::NotFound(id))?;
            (
                (record.user_id, record.path.clone()),
                (user_id, path.to_string()),
            )
        };

        if old_key != new_key {
            if inner.by_path.contains_key(&new_key) {
                return Err(MetadataError::Duplicate {
                    user_id,
                    path: path.to_string(),
                });
            }
            inner.by_path.remove(&old_key);
            inner.by_path.insert(new_key, id);
        }

        if let Some(record) = inner.files.get_mut(&id) {
            record.user_id = user_id;
            record.path = path.to_string();
            record.content_hash = hash.to_string();
            record.last_modified = last_modified;
        }
        Ok(())
    }

    fn file_update_state(&self, id: FileId, status: FileStatus) -> Result<()> {
        let mut inner = self.inner.write();
        let record = inner.files.get_mut(&id).ok_or(MetadataError::NotFound(id))?;
        check_transition(id, record.status, status)?;
        record.status = status;
        Ok(())
    }

    fn file_delete(&self, id: FileId) -> Result<usize> {
        let mut inner = self.inner.write();
        match inner.files.remove(&id) {
            Some(record) => {
                inner.by_path.remove(&(record.user_id, record.path));
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn file_get(&self, path: &str, user_id: u64) -> Result<Option<FileRecord>> {
        let inner = self.inner.read();
        Ok(inner
            .by_path
            .get(&(user_id, path.to_string()))
            .and_then(|id| inner.files.get(id))
            .cloned())
    }

    fn file_list(&self, user_id: u64) -> Result<Vec<FileRecord>> {
        let mut records: Vec<FileRecord> = self
            .inner
            .read()
            .files
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(records)
    }

    fn files_in_state(&self, status: FileStatus) -> Result<Vec<FileRecord>> {
        Ok(self
            .inner
            .read()
            .files
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect())
    }
}
