//! Error types for the ingestion pipeline and service

use crate::config::ConfigError;
use cloudraid_core::CloudRaidError;
use cloudraid_metadata::{FileId, FileStatus, MetadataError};
use cloudraid_storage::StorageError;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline operation errors
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("File {id} is {actual}, expected {expected}")]
    IllegalState {
        id: FileId,
        expected: FileStatus,
        actual: FileStatus,
    },

    #[error("File not found: {0}")]
    NotFound(FileId),

    #[error("File too large: {size} bytes exceeds limit of {max}")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Distribution incomplete for {base}: failed {failed:?}")]
    DistributionIncomplete { base: String, failed: Vec<String> },

    #[error("No metadata shard available for {0}")]
    ShardMetadataUnavailable(String),

    #[error("Metadata shard copies disagree for {0}")]
    ShardMetadataConflict(String),

    #[error("No storage connectors configured")]
    NoConnectors,

    #[error("File is locked by another operation: {0}")]
    Busy(PathBuf),

    #[error("Codec error: {0}")]
    Codec(#[from] CloudRaidError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl PipelineError {
    /// Whether re-queueing the work item may succeed later
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Io(_) | PipelineError::DistributionIncomplete { .. } => true,
            PipelineError::Busy(_) => true,
            PipelineError::Codec(e) => e.is_transient(),
            PipelineError::Storage(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<MetadataError> for ServiceError {
    fn from(e: MetadataError) -> Self {
        ServiceError::Pipeline(PipelineError::Metadata(e))
    }
}

impl From<StorageError> for ServiceError {
    fn from(e: StorageError) -> Self {
        ServiceError::Pipeline(PipelineError::Storage(e))
    }
}

/// Service startup errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Metrics exporter error: {0}")]
    Metrics(String),
}
