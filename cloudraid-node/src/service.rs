//! Service wiring
//!
//! Builds the metadata store, connectors, distributor and pipeline from a
//! [`NodeConfig`], resumes interrupted work, then starts the watcher and the
//! worker pool.

use crate::config::{MetadataBackend, NodeConfig};
use crate::core_access::CoreAccess;
use crate::distributor::{Distributor, RetryPolicy};
use crate::error::ServiceError;
use crate::file_manager::FileManager;
use crate::lock::LockTable;
use crate::metrics;
use crate::pipeline::{Pipeline, PipelinePaths};
use crate::queue::WorkQueue;
use crate::watcher::{run_watcher, DirectoryWatcher, WatcherHealth};
use cloudraid_metadata::{MemoryMetadataStore, MetadataStore, SledMetadataStore};
use cloudraid_storage::ConnectorRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A running CloudRAID node
pub struct CloudRaidService {
    pipeline: Arc<Pipeline>,
    core_access: CoreAccess,
    health: watch::Receiver<WatcherHealth>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl CloudRaidService {
    /// Start with the built-in connector kinds and the configured metadata store
    pub async fn start(config: NodeConfig) -> Result<Self, ServiceError> {
        Self::start_with(config, &ConnectorRegistry::new(), None).await
    }

    /// Start with a custom connector registry and optionally an existing store
    pub async fn start_with(
        config: NodeConfig,
        registry: &ConnectorRegistry,
        store: Option<Arc<dyn MetadataStore>>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;

        if config.metrics.enabled {
            metrics::init_metrics(config.metrics.port)?;
        }

        let store = match store {
            Some(store) => store,
            None => open_store(&config)?,
        };

        let connectors = registry.build_all(&config.connectors)?;
        let distributor = Distributor::new(
            connectors,
            config.distribution.policy,
            RetryPolicy::new(
                config.distribution.max_retries,
                Duration::from_millis(config.distribution.retry_delay_ms),
            ),
        )?;
        distributor.connect_all().await?;

        let queue = Arc::new(WorkQueue::new());
        let pipeline = Arc::new(Pipeline::new(
            store,
            distributor,
            PipelinePaths::from_config(&config),
            Arc::clone(&queue),
            Arc::new(LockTable::new()),
            config.filesize.max,
        ));

        let resumed = pipeline.recover()?;
        if resumed > 0 {
            info!(files = resumed, "Queued interrupted work");
        }

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let (health_tx, health) = watch::channel(WatcherHealth::Starting);
        if config.watcher.enabled {
            let watcher = DirectoryWatcher::new(config.watch_root());
            tasks.push(tokio::spawn(run_watcher(
                watcher,
                Arc::clone(&queue),
                config.watcher.interval(),
                cancel.clone(),
                health_tx,
            )));
        } else {
            info!("Directory watcher disabled");
            let _ = health_tx.send(WatcherHealth::Disabled);
        }

        let manager = Arc::new(FileManager::new(Arc::clone(&pipeline), &config.filemanagement));
        tasks.extend(manager.spawn(cancel.clone()));

        let core_access = CoreAccess::new(
            Arc::clone(&pipeline),
            config.upload.asynchronous,
            config.filemanagement.base_interval(),
        );
        info!(
            connectors = pipeline.distributor().connectors().len(),
            workers = config.filemanagement.count,
            watch_root = %config.watch_root().display(),
            "CloudRAID service started"
        );

        Ok(Self {
            pipeline,
            core_access,
            health,
            cancel,
            tasks,
        })
    }

    pub fn core_access(&self) -> &CoreAccess {
        &self.core_access
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        self.pipeline.store()
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        self.pipeline.queue()
    }

    /// Watcher liveness
    pub fn health(&self) -> watch::Receiver<WatcherHealth> {
        self.health.clone()
    }

    /// Stop the watcher and workers and wait for them to finish
    pub async fn shutdown(self) {
        info!("Shutting down CloudRAID service");
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Task ended abnormally");
            }
        }
        info!("CloudRAID service stopped");
    }
}

fn open_store(config: &NodeConfig) -> Result<Arc<dyn MetadataStore>, ServiceError> {
    match (config.metadata.backend, &config.metadata.path) {
        (MetadataBackend::Sled, Some(path)) => {
            info!(path = %path.display(), "Opening sled metadata store");
            Ok(Arc::new(SledMetadataStore::open(path)?))
        }
        (MetadataBackend::Sled, None) => Err(crate::config::ConfigError::ValidationError(
            "metadata.path is required for the sled backend".to_string(),
        )
        .into()),
        (MetadataBackend::Memory, _) => {
            warn!("Using in-memory metadata store; file records are lost on restart");
            Ok(Arc::new(MemoryMetadataStore::new()))
        }
    }
}
