//! CloudRAID Node Library
//!
//! Provides the ingestion pipeline around the RAID5 codec:
//! - Configuration management
//! - Polling directory watcher feeding a shared work queue
//! - Worker pool with per-file locking
//! - Split, distribute and clean up through the file lifecycle
//! - Programmatic put/get/delete API
//! - Prometheus metrics

pub mod config;
pub mod core_access;
pub mod distributor;
pub mod error;
pub mod file_manager;
pub mod lock;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod service;
pub mod watcher;

pub use config::{ConfigError, MetadataBackend, NodeConfig};
pub use core_access::{CoreAccess, PutOutcome};
pub use distributor::{DistributionPolicy, DistributionReport, Distributor, RetryPolicy, UploadMode};
pub use error::{PipelineError, ServiceError};
pub use file_manager::{FileManager, WorkerStep};
pub use lock::{LockGuard, LockTable};
pub use metrics::init_metrics;
pub use pipeline::{EventOutcome, Pipeline, PipelinePaths, WatchedFile};
pub use queue::{FileAction, QueueEntry, QueueError, WorkQueue};
pub use service::CloudRaidService;
pub use watcher::{run_watcher, DirectoryWatcher, WatcherError, WatcherHealth};
