//! Per-file lock table
//!
//! Advisory, in-process mutual exclusion keyed by the staging path of a file.
//! Workers and ingestion share one table; whoever holds a path is the only
//! one driving that file through the pipeline.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Registry of held locks: path -> holder
#[derive(Debug, Default)]
pub struct LockTable {
    locks: Mutex<HashMap<PathBuf, String>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `path` if nobody holds it
    pub fn lock(&self, path: &Path, holder: &str) -> bool {
        let mut locks = self.locks.lock();
        if locks.contains_key(path) {
            return false;
        }
        locks.insert(path.to_path_buf(), holder.to_string());
        true
    }

    /// Release the lock for `path`; only its holder may do so
    pub fn unlock(&self, path: &Path, holder: &str) -> bool {
        let mut locks = self.locks.lock();
        match locks.get(path) {
            Some(current) if current == holder => {
                locks.remove(path);
                true
            }
            _ => false,
        }
    }

    pub fn is_locked(&self, path: &Path) -> bool {
        self.locks.lock().contains_key(path)
    }

    /// Current holder of `path`
    pub fn holder(&self, path: &Path) -> Option<String> {
        self.locks.lock().get(path).cloned()
    }

    /// Number of held locks
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the lock and return a guard that releases it on drop
    pub fn try_acquire(self: &Arc<Self>, path: &Path, holder: &str) -> Option<LockGuard> {
        if self.lock(path, holder) {
            Some(LockGuard {
                table: Arc::clone(self),
                path: path.to_path_buf(),
                holder: holder.to_string(),
            })
        } else {
            None
        }
    }
}

/// Held lock, released when dropped
#[derive(Debug)]
pub struct LockGuard {
    table: Arc<LockTable>,
    path: PathBuf,
    holder: String,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.table.unlock(&self.path, &self.holder);
    }
}
