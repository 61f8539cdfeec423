//! CloudRAID Storage Connectors
//!
//! Provides the storage side of shard distribution:
//! - `StorageConnector` trait for pluggable backends
//! - `DirectoryConnector` storing shards as files under a directory
//! - `MemoryConnector` for testing
//! - `ConnectorRegistry` resolving configured connector kinds

pub mod connector;
pub mod directory;
pub mod memory;
pub mod registry;

pub use connector::{ConnectorStats, Result, StorageConnector, StorageError};
pub use directory::DirectoryConnector;
pub use memory::MemoryConnector;
pub use registry::{ConnectorFactory, ConnectorRegistry, ConnectorSpec};
