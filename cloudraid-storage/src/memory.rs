//! In-memory storage connector
//!
//! Used for testing and development. Not persistent. Supports injecting
//! failures so retry paths can be exercised.

use crate::connector::{validate_resource, ConnectorStats, Result, StorageConnector, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// In-memory storage connector
pub struct MemoryConnector {
    name: String,

    /// Resource storage
    resources: RwLock<HashMap<String, Bytes>>,

    connected: AtomicBool,

    /// Simulated outage: every call fails while set
    offline: AtomicBool,

    /// Number of upcoming writes (put/update) that fail
    failing_writes: AtomicU32,

    /// Operation counters
    puts: AtomicU64,
    updates: AtomicU64,
    gets: AtomicU64,
    deletes: AtomicU64,
}

impl MemoryConnector {
    /// Create a new in-memory connector
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resources: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(false),
            offline: AtomicBool::new(false),
            failing_writes: AtomicU32::new(0),
            puts: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            gets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    /// Make the next `count` put/update calls fail with `Unavailable`
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Simulate the backend going away (or coming back)
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Check whether a resource is stored
    pub fn contains(&self, resource: &str) -> bool {
        self.resources.read().contains_key(resource)
    }

    /// Names of all stored resources, sorted
    pub fn resource_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.resources.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Overwrite a resource without touching counters (test helper for corruption)
    pub fn insert_raw(&self, resource: &str, data: Bytes) {
        self.resources.write().insert(resource.to_string(), data);
    }

    fn check_available(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable {
                connector: self.name.clone(),
                reason: "offline".to_string(),
            });
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(StorageError::NotConnected {
                connector: self.name.clone(),
            });
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        self.check_available()?;
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::Unavailable {
                connector: self.name.clone(),
                reason: "injected write failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StorageConnector for MemoryConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable {
                connector: self.name.clone(),
                reason: "offline".to_string(),
            });
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn put(&self, resource: &str, data: Bytes) -> Result<()> {
        validate_resource(resource)?;
        self.check_write()?;
        self.resources.write().insert(resource.to_string(), data);
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn get(&self, resource: &str) -> Result<Option<Bytes>> {
        validate_resource(resource)?;
        self.check_available()?;
        self.gets.fetch_add(1, Ordering::Relaxed);
        Ok(self.resources.read().get(resource).cloned())
    }

    async fn delete(&self, resource: &str) -> Result<()> {
        validate_resource(resource)?;
        self.check_available()?;
        if self.resources.write().remove(resource).is_some() {
            self.deletes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn update(&self, resource: &str, data: Bytes) -> Result<()> {
        validate_resource(resource)?;
        self.check_write()?;
        self.resources.write().insert(resource.to_string(), data);
        self.updates.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> ConnectorStats {
        let resources = self.resources.read();
        ConnectorStats {
            resources: resources.len() as u64,
            bytes_stored: resources.values().map(|b| b.len() as u64).sum(),
            puts: self.puts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}
