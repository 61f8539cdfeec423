//! Sled-based metadata store
//!
//! Records live in the `files` tree keyed by big-endian id; the
//! `files_by_path` tree maps `"{user_id}/{path}"` to the id. Status changes
//! are compare-and-swap loops so concurrent transitions never interleave.

use crate::models::{FileId, FileRecord, FileStatus};
use crate::store::{check_transition, MetadataError, MetadataStore, Result};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use tracing::{debug, info};

const FILES_TREE: &str = "files";
const PATH_INDEX_TREE: &str = "files_by_path";

fn path_key(user_id: u64, path: &str) -> String {
    format!("{}/{}", user_id, path)
}

fn encode<V: Serialize>(value: &V) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn decode<V: DeserializeOwned>(bytes: &[u8]) -> Result<V> {
    Ok(bincode::deserialize(bytes)?)
}

fn decode_id(bytes: &[u8]) -> Result<FileId> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| MetadataError::Corrupt(format!("bad id of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

/// Sled-based metadata store
pub struct SledMetadataStore {
    db: sled::Db,
    files: sled::Tree,
    by_path: sled::Tree,
}

impl SledMetadataStore {
    /// Open or create a metadata store
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!(path = ?path.as_ref(), "Opening Sled metadata store");
        Self::from_db(sled::open(path.as_ref())?)
    }

    /// Open an in-memory store (for testing)
    pub fn open_temporary() -> Result<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let files = db.open_tree(FILES_TREE)?;
        let by_path = db.open_tree(PATH_INDEX_TREE)?;
        Ok(Self { db, files, by_path })
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn load(&self, id: FileId) -> Result<Option<(sled::IVec, FileRecord)>> {
        match self.files.get(id.to_be_bytes())? {
            Some(bytes) => {
                let record = decode(&bytes)?;
                Ok(Some((bytes, record)))
            }
            None => Ok(None),
        }
    }

    /// Apply `change` to a record with compare-and-swap, retrying on races
    fn modify<F>(&self, id: FileId, mut change: F) -> Result<FileRecord>
    where
        F: FnMut(&mut FileRecord) -> Result<()>,
    {
        loop {
            let (old_bytes, mut record) = self.load(id)?.ok_or(MetadataError::NotFound(id))?;
            change(&mut record)?;
            let new_bytes = encode(&record)?;
            match self
                .files
                .compare_and_swap(id.to_be_bytes(), Some(old_bytes), Some(new_bytes))?
            {
                Ok(()) => return Ok(record),
                Err(_) => continue,
            }
        }
    }

    fn scan<P: Fn(&FileRecord) -> bool>(&self, predicate: P) -> Result<Vec<FileRecord>> {
        let mut records = Vec::new();
        for item in self.files.iter() {
            let (_, value) = item?;
            let record: FileRecord = decode(&value)?;
            if predicate(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn claim_path(&self, user_id: u64, path: &str, id: FileId) -> Result<()> {
        let claimed = self.by_path.compare_and_swap(
            path_key(user_id, path),
            None as Option<&[u8]>,
            Some(&id.to_be_bytes()[..]),
        )?;
        claimed.map_err(|_| MetadataError::Duplicate {
            user_id,
            path: path.to_string(),
        })
    }
}

impl MetadataStore for SledMetadataStore {
    fn file_by_id(&self, id: FileId) -> Result<Option<FileRecord>> {
        Ok(self.load(id)?.map(|(_, record)| record))
    }

    fn file_new(
        &self,
        path: &str,
        hash: &str,
        last_modified: DateTime<Utc>,
        user_id: u64,
    ) -> Result<FileId> {
        // sled ids start at 0; 0 is never handed out
        let id = self.db.generate_id()? + 1;
        self.claim_path(user_id, path, id)?;

        let record = FileRecord {
            id,
            user_id,
            path: path.to_string(),
            content_hash: hash.to_string(),
            last_modified,
            status: FileStatus::Uploading,
        };
        self.files.insert(id.to_be_bytes(), encode(&record)?)?;
        debug!(file_id = id, user_id, path, "Stored file record");
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
        let current = self.file_by_id(id)?.ok_or(MetadataError::NotFound(id))?;
        let moved = current.user_id != user_id || current.path != path;
        if moved {
            self.claim_path(user_id, path, id)?;
        }

        let result = self.modify(id, |record| {
            record.user_id = user_id;
            record.path = path.to_string();
            record.content_hash = hash.to_string();
            record.last_modified = last_modified;
            Ok(())
        });

        match result {
            Ok(_) => {
                if moved {
                    self.by_path
                        .remove(path_key(current.user_id, &current.path))?;
                }
                Ok(())
            }
            Err(e) => {
                if moved {
                    self.by_path.remove(path_key(user_id, path))?;
                }
                Err(e)
            }
        }
    }

    fn file_update_state(&self, id: FileId, status: FileStatus) -> Result<()> {
        self.modify(id, |record| {
            check_transition(id, record.status, status)?;
            record.status = status;
            Ok(())
        })?;
        debug!(file_id = id, %status, "Updated file status");
        Ok(())
    }

    fn file_delete(&self, id: FileId) -> Result<usize> {
        match self.files.remove(id.to_be_bytes())? {
            Some(bytes) => {
                let record: FileRecord = decode(&bytes)?;
                self.by_path.remove(path_key(record.user_id, &record.path))?;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn file_get(&self, path: &str, user_id: u64) -> Result<Option<FileRecord>> {
        match self.by_path.get(path_key(user_id, path))? {
            Some(id_bytes) => self.file_by_id(decode_id(&id_bytes)?),
            None => Ok(None),
        }
    }

    fn file_list(&self, user_id: u64) -> Result<Vec<FileRecord>> {
        let mut records = self.scan(|r| r.user_id == user_id)?;
        records.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(records)
    }

    fn files_in_state(&self, status: FileStatus) -> Result<Vec<FileRecord>> {
        self.scan(|r| r.status == status)
    }
}
