//! Storage connector trait
//!
//! Defines the interface every shard destination must follow. Resources are
//! flat names such as `<hash>.0` or `<hash>.m`.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Result type for connector operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage connector errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Connector {connector} is not connected")]
    NotConnected { connector: String },

    #[error("Connector {connector} is unavailable: {reason}")]
    Unavailable { connector: String, reason: String },

    #[error("Invalid resource name: {0}")]
    InvalidResource(String),

    #[error("Unknown connector kind: {0}")]
    UnknownKind(String),

    #[error("Invalid connector configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Whether the operation may succeed on retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Unavailable { .. } | StorageError::NotConnected { .. } | StorageError::Io(_)
        )
    }
}

/// Connector operation counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectorStats {
    /// Number of resources currently held
    pub resources: u64,
    /// Bytes held
    pub bytes_stored: u64,
    pub puts: u64,
    pub updates: u64,
    pub gets: u64,
    pub deletes: u64,
}

/// Async storage connector
///
/// Implementations must be Send + Sync; the distributor shares them across
/// worker tasks behind `Arc<dyn StorageConnector>`.
#[async_trait]
pub trait StorageConnector: Send + Sync {
    /// Configured connector name, used in logs and metrics
    fn name(&self) -> &str;

    /// Prepare the backend (authenticate, create directories, ...)
    async fn connect(&self) -> Result<()>;

    /// Upload a new resource
    async fn put(&self, resource: &str, data: Bytes) -> Result<()>;

    /// Download a resource, `None` when absent
    async fn get(&self, resource: &str) -> Result<Option<Bytes>>;

    /// Delete a resource. Deleting an absent resource succeeds.
    async fn delete(&self, resource: &str) -> Result<()>;

    /// Replace the contents of an existing resource. Creates it when absent.
    async fn update(&self, resource: &str, data: Bytes) -> Result<()>;

    /// Operation counters
    fn stats(&self) -> ConnectorStats {
        ConnectorStats::default()
    }
}

/// Reject names that could escape a flat namespace
pub fn validate_resource(resource: &str) -> Result<()> {
    if resource.is_empty()
        || resource.contains('/')
        || resource.contains('\\')
        || resource == "."
        || resource == ".."
    {
        return Err(StorageError::InvalidResource(resource.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_resource() {
        assert!(validate_resource("abc.0").is_ok());
        assert!(validate_resource("abc.m").is_ok());
        assert!(validate_resource("").is_err());
        assert!(validate_resource("..").is_err());
        assert!(validate_resource("a/b").is_err());
        assert!(validate_resource("a\\b").is_err());
    }

    #[test]
    fn test_transient_errors() {
        let err = StorageError::Unavailable {
            connector: "c0".into(),
            reason: "timeout".into(),
        };
        assert!(err.is_transient());
        assert!(!StorageError::InvalidResource("x".into()).is_transient());
        assert_eq!(err.to_string(), "Connector c0 is unavailable: timeout");
    }
}
