//! File lifecycle pipeline
//!
//! Drives a file record from `UPLOADED` to `READY`:
//!
//! ```text
//! UPLOADED -> SPLITTING -> SPLITTED -> DISTRIBUTING -> DISTRIBUTED -> READY
//! ```
//!
//! Processing resumes from whatever status the record is in, so a file left
//! mid-pipeline by a crash or a failed distribution is picked up again by the
//! next event for its path. Watcher events, recovery and the ingestion API
//! all funnel into [`Pipeline::process`] while holding the file's lock.

use crate::config::NodeConfig;
use crate::distributor::{Distributor, UploadMode};
use crate::error::PipelineError;
use crate::lock::LockTable;
use crate::metrics;
use crate::queue::{FileAction, QueueEntry, WorkQueue};
use chrono::{DateTime, Utc};
use cloudraid_core::{base_name_for, merge_file, split_file, ParityPolicy, ShardKind, ShardSet};
use cloudraid_metadata::{FileId, FileRecord, FileStatus, MetadataError, MetadataStore};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Directories the pipeline works in
#[derive(Debug, Clone)]
pub struct PipelinePaths {
    /// Staging area, `{split_input}/{user_id}/{path}`
    pub split_input: PathBuf,
    /// Shard files awaiting distribution
    pub split_output: PathBuf,
    /// Shards fetched back for retrieval
    pub merge_input: PathBuf,
    /// Reconstructed files, `{merge_output}/{user_id}/{path}`
    pub merge_output: PathBuf,
    /// Directory the watcher polls
    pub watch_root: PathBuf,
}

impl PipelinePaths {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            split_input: config.split.input_dir.clone(),
            split_output: config.split.output_dir.clone(),
            merge_input: config.merge.input_dir.clone(),
            merge_output: config.merge.output_dir.clone(),
            watch_root: config.watch_root(),
        }
    }

    /// Whether the watcher polls the staging area itself
    pub fn watches_staging(&self) -> bool {
        self.watch_root == self.split_input
    }
}

/// A path from a queue entry mapped onto a user and a staging location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedFile {
    pub user_id: u64,
    /// User-relative path, `/`-separated
    pub rel: String,
    /// Where the event was observed
    pub source: PathBuf,
    /// `{split_input}/{user_id}/{rel}`; also the lock key
    pub staging: PathBuf,
}

/// What handling one event amounted to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// The file was driven through the pipeline
    Processed,
    /// Nothing to do for this event
    Skipped,
    /// Another holder has the file's lock
    Contended,
}

pub struct Pipeline {
    store: Arc<dyn MetadataStore>,
    distributor: Distributor,
    paths: PipelinePaths,
    queue: Arc<WorkQueue>,
    locks: Arc<LockTable>,
    max_file_size: u64,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        distributor: Distributor,
        paths: PipelinePaths,
        queue: Arc<WorkQueue>,
        locks: Arc<LockTable>,
        max_file_size: u64,
    ) -> Self {
        Self {
            store,
            distributor,
            paths,
            queue,
            locks,
            max_file_size,
        }
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn distributor(&self) -> &Distributor {
        &self.distributor
    }

    pub fn paths(&self) -> &PipelinePaths {
        &self.paths
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn locks(&self) -> &Arc<LockTable> {
        &self.locks
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Staging location of a record
    pub fn staging_path(&self, record: &FileRecord) -> PathBuf {
        self.paths.split_input.join(record.staging_relative())
    }

    /// Map an event path under the watch root or the staging area to its
    /// user and staging location. The first component must be a numeric
    /// user id followed by at least one more component.
    pub fn resolve(&self, path: &Path) -> Option<WatchedFile> {
        let rel = [&self.paths.watch_root, &self.paths.split_input]
            .into_iter()
            .find_map(|root| path.strip_prefix(root).ok())?;

        let mut parts = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str()?),
                _ => return None,
            }
        }
        if parts.len() < 2 {
            return None;
        }
        let user_id: u64 = parts[0].parse().ok()?;
        let rel = parts[1..].join("/");
        let staging = self.paths.split_input.join(user_id.to_string()).join(&rel);

        Some(WatchedFile {
            user_id,
            rel,
            source: path.to_path_buf(),
            staging,
        })
    }

    /// Handle one queue entry while holding the file's lock
    #[instrument(skip(self, entry), fields(path = %entry.path.display(), action = %entry.action))]
    pub async fn handle_event(
        &self,
        entry: &QueueEntry,
        holder: &str,
    ) -> Result<EventOutcome, PipelineError> {
        let Some(file) = self.resolve(&entry.path) else {
            warn!("Path is not under a user directory, ignoring");
            return Ok(EventOutcome::Skipped);
        };
        let Some(_guard) = self.locks.try_acquire(&file.staging, holder) else {
            debug!("File is locked");
            return Ok(EventOutcome::Contended);
        };

        match entry.action {
            FileAction::Create | FileAction::Modify => self.ingest(&file).await,
            FileAction::Delete => self.delete_event(&file).await,
        }
    }

    /// Process a record under its lock. When the lock is taken the work is
    /// handed to the queue as a `Modify` of the staging path instead.
    pub async fn run_locked(
        &self,
        id: FileId,
        holder: &str,
    ) -> Result<EventOutcome, PipelineError> {
        let record = self.store.require(id)?;
        let staging = self.staging_path(&record);
        let Some(_guard) = self.locks.try_acquire(&staging, holder) else {
            info!(id, path = %staging.display(), "File locked, deferring to the work queue");
            metrics::record_lock_contention();
            self.queue.push(QueueEntry::new(staging, FileAction::Modify));
            return Ok(EventOutcome::Contended);
        };
        self.process(id).await?;
        Ok(EventOutcome::Processed)
    }

    async fn ingest(&self, file: &WatchedFile) -> Result<EventOutcome, PipelineError> {
        let existing = self.store.file_get(&file.rel, file.user_id)?;

        if let Some(record) = &existing {
            match record.status {
                FileStatus::Uploading => {
                    debug!(id = record.id, "Upload still in progress");
                    return Ok(EventOutcome::Skipped);
                }
                FileStatus::Deleting | FileStatus::Deleted => {
                    debug!(id = record.id, status = %record.status, "File is being deleted");
                    return Ok(EventOutcome::Skipped);
                }
                status if status.is_in_progress() => {
                    info!(id = record.id, %status, "Resuming file");
                    self.process(record.id).await?;
                    return Ok(EventOutcome::Processed);
                }
                _ => {}
            }
        }

        let meta = match tokio::fs::metadata(&file.source).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("File vanished before it was handled");
                return Ok(EventOutcome::Skipped);
            }
            Err(e) => return Err(e.into()),
        };
        if meta.len() > self.max_file_size {
            warn!(size = meta.len(), max = self.max_file_size, "File exceeds size limit, skipping");
            return Ok(EventOutcome::Skipped);
        }
        let modified: DateTime<Utc> = meta.modified()?.into();

        let revision = match existing {
            None => None,
            Some(record) if record.status == FileStatus::Ready => {
                if modified <= record.last_modified {
                    debug!(id = record.id, "File unchanged");
                    return Ok(EventOutcome::Skipped);
                }
                Some(record.id)
            }
            Some(record) => {
                return Err(PipelineError::IllegalState {
                    id: record.id,
                    expected: FileStatus::Ready,
                    actual: record.status,
                })
            }
        };

        // Stage before touching the record: a failed copy must leave it
        // absent or READY so the retried event starts over.
        self.stage(file).await?;

        let id = match revision {
            Some(id) => {
                info!(id, "New revision");
                self.transition(id, FileStatus::Uploading)?;
                id
            }
            None => match self.store.file_new(&file.rel, "", modified, file.user_id) {
                Ok(id) => {
                    info!(id, user_id = file.user_id, path = %file.rel, "New file");
                    id
                }
                Err(MetadataError::Duplicate { .. }) => {
                    debug!("File was registered concurrently");
                    return Ok(EventOutcome::Skipped);
                }
                Err(e) => return Err(e.into()),
            },
        };

        let record = self.store.require(id)?;
        self.store
            .file_update(id, &record.path, &record.content_hash, modified, record.user_id)?;
        self.transition(id, FileStatus::Uploaded)?;
        self.process(id).await?;
        Ok(EventOutcome::Processed)
    }

    /// Copy a file observed outside the staging area into it
    async fn stage(&self, file: &WatchedFile) -> Result<(), PipelineError> {
        if file.source == file.staging {
            return Ok(());
        }
        if let Some(parent) = file.staging.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&file.source, &file.staging).await?;
        Ok(())
    }

    async fn delete_event(&self, file: &WatchedFile) -> Result<EventOutcome, PipelineError> {
        match self.store.file_get(&file.rel, file.user_id)? {
            None => {
                debug!("No record for deleted file");
                Ok(EventOutcome::Skipped)
            }
            Some(record) if record.status == FileStatus::Deleted => Ok(EventOutcome::Skipped),
            Some(record) => {
                self.remove_record(&record).await?;
                Ok(EventOutcome::Processed)
            }
        }
    }

    /// Drive a record from its current status to `READY`.
    ///
    /// Splitting may only start from `UPLOADED`; records in `UPLOADING`,
    /// `DELETING` or `DELETED` are rejected with `IllegalState`. A failed
    /// distribution leaves the record in `DISTRIBUTING`.
    #[instrument(skip(self))]
    pub async fn process(&self, id: FileId) -> Result<(), PipelineError> {
        let initial = self.store.require(id)?;
        let mode = if initial.has_content() {
            UploadMode::Update
        } else {
            UploadMode::Put
        };

        loop {
            let record = self.store.require(id)?;
            match record.status {
                FileStatus::Uploaded => {
                    self.transition(id, FileStatus::Splitting)?;
                    self.split(&record).await?;
                    self.transition(id, FileStatus::Splitted)?;
                }
                FileStatus::Splitting => {
                    self.split(&record).await?;
                    self.transition(id, FileStatus::Splitted)?;
                }
                FileStatus::Splitted => {
                    self.transition(id, FileStatus::Distributing)?;
                }
                FileStatus::Distributing => {
                    let set = self.local_shards(&record).await?;
                    let report = self.distributor.distribute(&set, mode).await?;
                    info!(id, base = %set.base, uploads = report.uploads, "Shards distributed");
                    self.transition(id, FileStatus::Distributed)?;
                }
                FileStatus::Distributed => {
                    self.local_shard_set(&record).remove_files()?;
                    if !self.paths.watches_staging() {
                        remove_if_exists(&self.staging_path(&record)).await?;
                    }
                    self.transition(id, FileStatus::Ready)?;
                    info!(id, path = %record.path, "File ready");
                    return Ok(());
                }
                FileStatus::Ready => return Ok(()),
                actual => {
                    return Err(PipelineError::IllegalState {
                        id,
                        expected: FileStatus::Uploaded,
                        actual,
                    })
                }
            }
        }
    }

    fn local_shard_set(&self, record: &FileRecord) -> ShardSet {
        ShardSet::new(
            &self.paths.split_output,
            base_name_for(&record.staging_relative()),
        )
    }

    /// Split the staged file and record the shard base name
    async fn split(&self, record: &FileRecord) -> Result<ShardSet, PipelineError> {
        let input = self.staging_path(record);
        let relative = record.staging_relative();
        let output = self.paths.split_output.clone();

        let (set, summary) =
            tokio::task::spawn_blocking(move || split_file(&input, &relative, &output)).await??;
        metrics::record_file_split(summary.input_len);

        self.store.file_update(
            record.id,
            &record.path,
            &set.base,
            record.last_modified,
            record.user_id,
        )?;
        debug!(id = record.id, base = %set.base, bytes = summary.input_len, "File split");
        Ok(set)
    }

    /// Shard files for a record in `DISTRIBUTING`, re-split when any is missing
    async fn local_shards(&self, record: &FileRecord) -> Result<ShardSet, PipelineError> {
        let set = self.local_shard_set(record);
        if ShardKind::ALL.iter().all(|kind| set.path(*kind).exists()) {
            return Ok(set);
        }
        info!(id = record.id, "Local shards missing, splitting again");
        self.split(record).await
    }

    /// Remove a file everywhere: shards on every connector, local shard files,
    /// the staging copy, then the record itself.
    #[instrument(skip(self, record), fields(id = record.id))]
    pub async fn remove_record(&self, record: &FileRecord) -> Result<(), PipelineError> {
        if record.status != FileStatus::Deleting {
            self.transition(record.id, FileStatus::Deleting)?;
        }
        if record.has_content() {
            self.distributor.remove(&record.content_hash).await?;
        }
        self.local_shard_set(record).remove_files()?;
        remove_if_exists(&self.staging_path(record)).await?;

        self.transition(record.id, FileStatus::Deleted)?;
        self.store.file_delete(record.id)?;
        info!(path = %record.path, user_id = record.user_id, "File deleted");
        Ok(())
    }

    /// Fetch the shards of a `READY` record and reconstruct it under the merge
    /// output directory. Returns the path of the reconstructed file.
    #[instrument(skip(self, record), fields(id = record.id))]
    pub async fn retrieve(&self, record: &FileRecord) -> Result<PathBuf, PipelineError> {
        let fetched = self
            .distributor
            .fetch(&record.content_hash, &self.paths.merge_input)
            .await?;
        let output = self.merge_output_path(record);

        let dir = fetched.dir.clone();
        let base = fetched.base.clone();
        let target = output.clone();
        let summary = tokio::task::spawn_blocking(move || {
            merge_file(&dir, &base, &target, ParityPolicy::Reject)
        })
        .await??;

        if summary.parity_mismatches > 0 {
            metrics::record_parity_mismatches(summary.parity_mismatches);
        }
        if let Some(device) = summary.dead_device {
            warn!(device, "Reconstructed file from a degraded shard set");
        }
        info!(output = %output.display(), bytes = summary.bytes_written, "File retrieved");
        Ok(output)
    }

    /// Remove the fetched shards and the reconstructed file of a retrieval
    pub async fn finish_retrieval(&self, record: &FileRecord) -> Result<(), PipelineError> {
        ShardSet::new(&self.paths.merge_input, record.content_hash.clone()).remove_files()?;
        remove_if_exists(&self.merge_output_path(record)).await?;
        Ok(())
    }

    pub fn merge_output_path(&self, record: &FileRecord) -> PathBuf {
        self.paths.merge_output.join(record.staging_relative())
    }

    /// Queue work for records left mid-pipeline by a previous run.
    /// Returns the number of queued entries.
    pub fn recover(&self) -> Result<usize, PipelineError> {
        let mut entries = Vec::new();
        for status in FileStatus::ALL.into_iter().filter(|s| s.is_in_progress()) {
            for record in self.store.files_in_state(status)? {
                info!(id = record.id, %status, "Resuming interrupted file");
                entries.push(QueueEntry::new(self.staging_path(&record), FileAction::Modify));
            }
        }
        for record in self.store.files_in_state(FileStatus::Deleting)? {
            info!(id = record.id, "Resuming interrupted delete");
            entries.push(QueueEntry::new(self.staging_path(&record), FileAction::Delete));
        }

        let count = entries.len();
        self.queue.extend(entries);
        metrics::set_queue_depth(self.queue.len());
        Ok(count)
    }

    fn transition(&self, id: FileId, to: FileStatus) -> Result<(), PipelineError> {
        self.store.file_update_state(id, to)?;
        debug!(id, status = %to, "Status changed");
        Ok(())
    }
}

pub(crate) async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
