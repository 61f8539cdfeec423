//! Shard distribution across storage connectors
//!
//! Maps each member of a shard set to one or more connectors, uploads with
//! per-shard retries, fetches shard sets back for retrieval and removes them
//! on deletion.

use crate::error::PipelineError;
use crate::metrics;
use crate::pipeline::remove_if_exists;
use bytes::Bytes;
use cloudraid_core::{ShardKind, ShardSet, DEVICE_COUNT};
use cloudraid_storage::{StorageConnector, StorageError};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// How shards are spread over connectors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DistributionPolicy {
    /// Device shard `.i` on connector `i mod n`, metadata shard on every connector
    #[default]
    OnePerBackend,
    /// Every shard on every connector
    Mirror,
}

/// Whether connectors receive new resources or replacements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    Put,
    Update,
}

/// Retry schedule for a single shard operation
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubles afterwards
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << retry.min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

/// Outcome of a successful distribution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistributionReport {
    /// Confirmed uploads
    pub uploads: usize,
    /// Attempts that failed and were retried
    pub retries: usize,
    pub bytes: u64,
}

/// Distributes shard sets to the configured connectors
pub struct Distributor {
    connectors: Vec<Arc<dyn StorageConnector>>,
    policy: DistributionPolicy,
    retry: RetryPolicy,
}

impl Distributor {
    pub fn new(
        connectors: Vec<Arc<dyn StorageConnector>>,
        policy: DistributionPolicy,
        retry: RetryPolicy,
    ) -> Result<Self, PipelineError> {
        if connectors.is_empty() {
            return Err(PipelineError::NoConnectors);
        }
        Ok(Self {
            connectors,
            policy,
            retry,
        })
    }

    pub fn connectors(&self) -> &[Arc<dyn StorageConnector>] {
        &self.connectors
    }

    pub fn policy(&self) -> DistributionPolicy {
        self.policy
    }

    /// Connect every connector
    pub async fn connect_all(&self) -> Result<(), StorageError> {
        for connector in &self.connectors {
            connector.connect().await?;
            info!(connector = connector.name(), "Storage connector connected");
        }
        Ok(())
    }

    /// Indices of the connectors that hold `kind`
    pub fn targets(&self, kind: ShardKind) -> Vec<usize> {
        let all = || (0..self.connectors.len()).collect();
        match (self.policy, kind) {
            (DistributionPolicy::Mirror, _) | (_, ShardKind::Metadata) => all(),
            (DistributionPolicy::OnePerBackend, ShardKind::Device(i)) => {
                vec![i % self.connectors.len()]
            }
        }
    }

    /// Run `op` with retries, returning the number of failed attempts on success
    async fn with_retries<F, Fut>(
        &self,
        what: &str,
        connector: &str,
        mut op: F,
    ) -> Result<usize, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), StorageError>>,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Ok(()) => return Ok(retry as usize),
                Err(e)
                    if retry < self.retry.max_retries
                        && !matches!(e, StorageError::InvalidResource(_)) =>
                {
                    let delay = self.retry.delay(retry);
                    warn!(
                        resource = what,
                        connector,
                        retry = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Shard operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Upload every shard of `set` to its target connectors.
    ///
    /// Shards are retried independently. If any upload still fails the call
    /// returns `DistributionIncomplete` naming each failed `resource@connector`.
    #[instrument(skip(self, set), fields(base = %set.base))]
    pub async fn distribute(
        &self,
        set: &ShardSet,
        mode: UploadMode,
    ) -> Result<DistributionReport, PipelineError> {
        let mut jobs = Vec::new();
        for kind in ShardKind::ALL {
            let data = Bytes::from(tokio::fs::read(set.path(kind)).await?);
            let resource = kind.resource_name(&set.base);
            for target in self.targets(kind) {
                jobs.push((resource.clone(), target, data.clone()));
            }
        }

        let results = join_all(jobs.iter().map(|(resource, target, data)| {
            let connector = &self.connectors[*target];
            async move {
                let outcome = self
                    .with_retries(resource, connector.name(), || {
                        let data = data.clone();
                        async move {
                            match mode {
                                UploadMode::Put => connector.put(resource, data).await,
                                UploadMode::Update => connector.update(resource, data).await,
                            }
                        }
                    })
                    .await;
                metrics::record_shard_upload(connector.name(), outcome.is_ok());
                outcome
            }
        }))
        .await;

        let mut report = DistributionReport::default();
        let mut failed = Vec::new();
        for ((resource, target, data), result) in jobs.iter().zip(results) {
            match result {
                Ok(retries) => {
                    report.uploads += 1;
                    report.retries += retries;
                    report.bytes += data.len() as u64;
                }
                Err(e) => {
                    let connector = self.connectors[*target].name();
                    warn!(resource = %resource, connector, error = %e, "Shard upload failed");
                    failed.push(format!("{}@{}", resource, connector));
                }
            }
        }

        if !failed.is_empty() {
            return Err(PipelineError::DistributionIncomplete {
                base: set.base.clone(),
                failed,
            });
        }

        debug!(uploads = report.uploads, retries = report.retries, "Shard set distributed");
        Ok(report)
    }

    /// Download the shard set `base` into `dest_dir`.
    ///
    /// Device shards are taken from the first target connector that has them;
    /// missing ones are left out for a degraded merge. The metadata shard
    /// needs two matching copies when more than one connector returns one.
    #[instrument(skip(self, dest_dir))]
    pub async fn fetch(&self, base: &str, dest_dir: &Path) -> Result<ShardSet, PipelineError> {
        tokio::fs::create_dir_all(dest_dir).await?;
        let set = ShardSet::new(dest_dir, base);

        for i in 0..DEVICE_COUNT {
            let kind = ShardKind::Device(i);
            let resource = kind.resource_name(base);
            let mut found = false;
            for target in self.targets(kind) {
                let connector = &self.connectors[target];
                match connector.get(&resource).await {
                    Ok(Some(data)) => {
                        tokio::fs::write(set.path(kind), &data).await?;
                        found = true;
                        break;
                    }
                    Ok(None) => {
                        debug!(
                            resource = %resource,
                            connector = connector.name(),
                            "Shard not on connector"
                        );
                    }
                    Err(e) => {
                        warn!(
                            resource = %resource,
                            connector = connector.name(),
                            error = %e,
                            "Shard download failed"
                        );
                    }
                }
            }
            if !found {
                warn!(resource = %resource, "Device shard unavailable");
                remove_if_exists(&set.path(kind)).await?;
            }
        }

        let metadata = self.fetch_metadata(base).await?;
        tokio::fs::write(set.metadata_path(), &metadata).await?;
        Ok(set)
    }

    async fn fetch_metadata(&self, base: &str) -> Result<Bytes, PipelineError> {
        let resource = ShardKind::Metadata.resource_name(base);
        let mut copies: Vec<Bytes> = Vec::new();
        for target in self.targets(ShardKind::Metadata) {
            let connector = &self.connectors[target];
            match connector.get(&resource).await {
                Ok(Some(data)) => copies.push(data),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        resource = %resource,
                        connector = connector.name(),
                        error = %e,
                        "Metadata download failed"
                    );
                }
            }
        }

        if copies.len() <= 1 {
            return copies
                .pop()
                .ok_or_else(|| PipelineError::ShardMetadataUnavailable(base.to_string()));
        }

        let mut votes: HashMap<&Bytes, usize> = HashMap::new();
        for copy in &copies {
            *votes.entry(copy).or_default() += 1;
        }
        votes
            .into_iter()
            .filter(|(_, count)| *count >= 2)
            .max_by_key(|(_, count)| *count)
            .map(|(copy, _)| copy.clone())
            .ok_or_else(|| PipelineError::ShardMetadataConflict(base.to_string()))
    }

    /// Delete every shard of `base` from the connectors it was mapped to.
    /// Resources that are already gone count as deleted.
    #[instrument(skip(self))]
    pub async fn remove(&self, base: &str) -> Result<(), PipelineError> {
        let mut failed = Vec::new();
        for kind in ShardKind::ALL {
            let resource = kind.resource_name(base);
            for target in self.targets(kind) {
                let connector = &self.connectors[target];
                let result = self
                    .with_retries(&resource, connector.name(), || connector.delete(&resource))
                    .await;
                if let Err(e) = result {
                    warn!(
                        resource = %resource,
                        connector = connector.name(),
                        error = %e,
                        "Shard delete failed"
                    );
                    failed.push(format!("{}@{}", resource, connector.name()));
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::DistributionIncomplete {
                base: base.to_string(),
                failed,
            })
        }
    }
}
