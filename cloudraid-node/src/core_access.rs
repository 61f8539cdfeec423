//! Programmatic ingestion and retrieval API
//!
//! The caller registers a record (status `UPLOADING`) in the metadata store,
//! then streams the content through [`CoreAccess::put_data`]. Once the data
//! is persisted the record moves to `UPLOADED` and the pipeline takes over,
//! either inline or on a spawned task. A transient pipeline failure hands
//! the file to the work queue so a worker finishes it later.

use crate::error::PipelineError;
use crate::lock::LockGuard;
use crate::pipeline::{remove_if_exists, EventOutcome, Pipeline};
use crate::queue::{FileAction, QueueEntry};
use chrono::{DateTime, Utc};
use cloudraid_metadata::{FileId, FileRecord, FileStatus};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

/// Lock holder name used for API-initiated work
const HOLDER: &str = "core-access";

/// What happened after an ingestion was persisted
#[derive(Debug)]
pub enum PutOutcome {
    /// The file was processed to `READY` before returning
    Completed,
    /// Processing continues on this task
    Spawned(JoinHandle<Result<(), PipelineError>>),
    /// The file was locked; a work queue entry will finish it
    Deferred,
}

#[derive(Clone)]
pub struct CoreAccess {
    pipeline: Arc<Pipeline>,
    asynchronous: bool,
    /// Delay before a worker retries a failed ingestion
    retry_delay: Duration,
}

impl CoreAccess {
    pub fn new(pipeline: Arc<Pipeline>, asynchronous: bool, retry_delay: Duration) -> Self {
        Self {
            pipeline,
            asynchronous,
            retry_delay,
        }
    }

    /// Ingest with the configured `upload.asynchronous` mode
    pub async fn put<R>(&self, reader: R, id: FileId) -> Result<PutOutcome, PipelineError>
    where
        R: AsyncRead + Unpin,
    {
        self.put_data(reader, id, self.asynchronous).await
    }

    /// Stream `reader` into the staging location of record `id`.
    ///
    /// The record must be `UPLOADING`; anything else is rejected with
    /// `IllegalState` and left untouched. Content above the size limit is
    /// discarded with `FileTooLarge` and the record stays `UPLOADING`.
    #[instrument(skip(self, reader))]
    pub async fn put_data<R>(
        &self,
        reader: R,
        id: FileId,
        asynchronous: bool,
    ) -> Result<PutOutcome, PipelineError>
    where
        R: AsyncRead + Unpin,
    {
        let record = self.require_status(id, FileStatus::Uploading)?;
        let staging = self.pipeline.staging_path(&record);
        if let Some(parent) = staging.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let max = self.pipeline.max_file_size();
        let mut limited = reader.take(max.saturating_add(1));
        let mut file = tokio::fs::File::create(&staging).await?;
        let written = tokio::io::copy(&mut limited, &mut file).await?;
        file.flush().await?;
        drop(file);

        if written > max {
            warn!(id, max, "Upload exceeds size limit, discarding");
            remove_if_exists(&staging).await?;
            return Err(PipelineError::FileTooLarge { size: written, max });
        }

        let modified: DateTime<Utc> = tokio::fs::metadata(&staging).await?.modified()?.into();
        let store = self.pipeline.store();
        store.file_update(id, &record.path, &record.content_hash, modified, record.user_id)?;
        store.file_update_state(id, FileStatus::Uploaded)?;
        info!(id, bytes = written, "Upload persisted");

        if asynchronous {
            let pipeline = Arc::clone(&self.pipeline);
            let retry_delay = self.retry_delay;
            let handle = tokio::spawn(async move {
                run_ingestion(&pipeline, id, staging, retry_delay)
                    .await
                    .map(|_| ())
            });
            return Ok(PutOutcome::Spawned(handle));
        }

        match run_ingestion(&self.pipeline, id, staging, self.retry_delay).await? {
            EventOutcome::Contended => Ok(PutOutcome::Deferred),
            EventOutcome::Processed | EventOutcome::Skipped => Ok(PutOutcome::Completed),
        }
    }

    /// Reconstruct a `READY` file and return where it was written
    pub async fn get_data(&self, id: FileId) -> Result<PathBuf, PipelineError> {
        let record = self.require_status(id, FileStatus::Ready)?;
        let _guard = self.lock(&record)?;
        self.pipeline.retrieve(&record).await
    }

    /// Clean up after [`CoreAccess::get_data`]
    pub async fn finish_get_data(&self, id: FileId) -> Result<(), PipelineError> {
        let record = self.require_status(id, FileStatus::Ready)?;
        let _guard = self.lock(&record)?;
        self.pipeline.finish_retrieval(&record).await
    }

    /// Delete a `READY` file everywhere, including its staging copy
    #[instrument(skip(self))]
    pub async fn delete_data(&self, id: FileId) -> Result<(), PipelineError> {
        let record = self.require_status(id, FileStatus::Ready)?;
        let _guard = self.lock(&record)?;
        self.pipeline.remove_record(&record).await
    }

    /// Take the record's lock or fail with `Busy`
    fn lock(&self, record: &FileRecord) -> Result<LockGuard, PipelineError> {
        let staging = self.pipeline.staging_path(record);
        match self.pipeline.locks().try_acquire(&staging, HOLDER) {
            Some(guard) => Ok(guard),
            None => Err(PipelineError::Busy(staging)),
        }
    }

    fn require_status(
        &self,
        id: FileId,
        expected: FileStatus,
    ) -> Result<FileRecord, PipelineError> {
        let record = self
            .pipeline
            .store()
            .file_by_id(id)?
            .ok_or(PipelineError::NotFound(id))?;
        if record.status != expected {
            return Err(PipelineError::IllegalState {
                id,
                expected,
                actual: record.status,
            });
        }
        Ok(record)
    }
}

/// Run the pipeline for a freshly persisted upload. A transient failure
/// queues a delayed `Modify` of the staging path before the error is returned.
async fn run_ingestion(
    pipeline: &Pipeline,
    id: FileId,
    staging: PathBuf,
    retry_delay: Duration,
) -> Result<EventOutcome, PipelineError> {
    let result = pipeline.run_locked(id, HOLDER).await;
    match &result {
        Err(e) if e.is_transient() => {
            warn!(
                id,
                error = %e,
                delay_ms = retry_delay.as_millis() as u64,
                "Ingestion failed, handing over to the work queue"
            );
            pipeline
                .queue()
                .push(QueueEntry::new(staging, FileAction::Modify).retry_after(retry_delay));
        }
        Err(e) => error!(id, error = %e, "Ingestion failed"),
        Ok(_) => {}
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::Fixture;

    async fn fixture(max: u64) -> (Fixture, CoreAccess) {
        let fx = Fixture::build(false, max).await;
        let access = CoreAccess::new(Arc::clone(&fx.pipeline), false, Duration::from_millis(1));
        (fx, access)
    }

    fn register(fx: &Fixture, user: u64, path: &str) -> FileId {
        fx.pipeline.store().file_new(path, "", Utc::now(), user).unwrap()
    }

    #[tokio::test]
    async fn test_put_get_delete_roundtrip() {
        let (fx, access) = fixture(u64::MAX).await;
        let id = register(&fx, 11, "photos/cat.jpg");
        let content = b"not really a jpeg".to_vec();

        let outcome = access.put_data(&content[..], id, false).await.unwrap();
        assert!(matches!(outcome, PutOutcome::Completed));
        assert_eq!(fx.record(11, "photos/cat.jpg").unwrap().status, FileStatus::Ready);

        let output = access.get_data(id).await.unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), content);
        access.finish_get_data(id).await.unwrap();
        assert!(!output.exists());

        access.delete_data(id).await.unwrap();
        assert!(fx.record(11, "photos/cat.jpg").is_none());
        assert!(fx.connectors.iter().all(|c| c.resource_names().is_empty()));
        assert!(matches!(
            access.get_data(id).await,
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_put_on_ready_file_is_rejected() {
        let (fx, access) = fixture(u64::MAX).await;
        let id = register(&fx, 1, "f");
        access.put_data(&b"v1"[..], id, false).await.unwrap();

        let err = access.put_data(&b"v2"[..], id, false).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::IllegalState {
                expected: FileStatus::Uploading,
                actual: FileStatus::Ready,
                ..
            }
        ));
        let record = fx.record(1, "f").unwrap();
        assert_eq!(record.status, FileStatus::Ready);
        assert_eq!(std::fs::read(fx.pipeline.staging_path(&record)).unwrap(), b"v1");
    }

    #[tokio::test]
    async fn test_put_rejects_oversized_content() {
        let (fx, access) = fixture(16).await;
        let id = register(&fx, 1, "big");

        let err = access.put_data(&[0u8; 17][..], id, false).await.unwrap_err();
        assert!(matches!(err, PipelineError::FileTooLarge { max: 16, .. }));
        let record = fx.record(1, "big").unwrap();
        assert_eq!(record.status, FileStatus::Uploading);
        assert!(!fx.pipeline.staging_path(&record).exists());

        // exactly at the limit is fine
        access.put_data(&[0u8; 16][..], id, false).await.unwrap();
        assert_eq!(fx.record(1, "big").unwrap().status, FileStatus::Ready);
    }

    #[tokio::test]
    async fn test_asynchronous_put() {
        let (fx, _) = fixture(u64::MAX).await;
        let access = CoreAccess::new(Arc::clone(&fx.pipeline), true, Duration::from_millis(1));
        let id = register(&fx, 2, "async.txt");

        match access.put(&b"processed in the background"[..], id).await.unwrap() {
            PutOutcome::Spawned(handle) => handle.await.unwrap().unwrap(),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(fx.record(2, "async.txt").unwrap().status, FileStatus::Ready);
    }

    #[tokio::test]
    async fn test_put_defers_when_locked() {
        let (fx, access) = fixture(u64::MAX).await;
        let id = register(&fx, 3, "busy");
        let staging = fx.pipeline.staging_path(&fx.record(3, "busy").unwrap());

        let guard = fx.pipeline.locks().try_acquire(&staging, "worker-0").unwrap();
        let outcome = access.put_data(&b"later"[..], id, false).await.unwrap();
        assert!(matches!(outcome, PutOutcome::Deferred));
        assert_eq!(fx.record(3, "busy").unwrap().status, FileStatus::Uploaded);
        drop(guard);

        let entry = fx.pipeline.queue().pop().unwrap();
        fx.pipeline.handle_event(&entry, "worker-0").await.unwrap();
        assert_eq!(fx.record(3, "busy").unwrap().status, FileStatus::Ready);
    }

    #[tokio::test]
    async fn test_failed_ingestion_is_queued_for_retry() {
        let (fx, access) = fixture(u64::MAX).await;
        let id = register(&fx, 5, "flaky.bin");
        fx.connectors[1].set_offline(true);

        let err = access.put_data(&b"half distributed"[..], id, false).await.unwrap_err();
        assert!(matches!(err, PipelineError::DistributionIncomplete { .. }));
        assert_eq!(fx.record(5, "flaky.bin").unwrap().status, FileStatus::Distributing);

        let entry = fx.pipeline.queue().try_pop().unwrap();
        assert_eq!(entry.action, FileAction::Modify);
        assert_eq!(entry.attempt, 1);
        assert!(entry.not_before.is_some());

        fx.connectors[1].set_offline(false);
        let outcome = fx.pipeline.handle_event(&entry, "worker-0").await.unwrap();
        assert_eq!(outcome, EventOutcome::Processed);
        assert_eq!(fx.record(5, "flaky.bin").unwrap().status, FileStatus::Ready);
        let output = access.get_data(id).await.unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"half distributed");
    }

    #[tokio::test]
    async fn test_failed_asynchronous_ingestion_is_queued() {
        let (fx, _) = fixture(u64::MAX).await;
        let access = CoreAccess::new(Arc::clone(&fx.pipeline), true, Duration::from_millis(1));
        let id = register(&fx, 5, "bg.bin");
        fx.connectors[2].set_offline(true);

        match access.put(&b"background"[..], id).await.unwrap() {
            PutOutcome::Spawned(handle) => assert!(handle.await.unwrap().is_err()),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(fx.pipeline.queue().len(), 1);
    }

    #[tokio::test]
    async fn test_retrieval_is_serialized_per_file() {
        let (fx, access) = fixture(u64::MAX).await;
        let id = register(&fx, 8, "shared.txt");
        access.put_data(&b"read by many"[..], id, false).await.unwrap();

        let staging = fx.pipeline.staging_path(&fx.record(8, "shared.txt").unwrap());
        let guard = fx.pipeline.locks().try_acquire(&staging, "worker-0").unwrap();
        assert!(matches!(access.get_data(id).await, Err(PipelineError::Busy(_))));
        assert!(matches!(access.finish_get_data(id).await, Err(PipelineError::Busy(_))));
        assert!(!fx.pipeline.merge_output_path(&fx.record(8, "shared.txt").unwrap()).exists());
        drop(guard);

        let output = access.get_data(id).await.unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"read by many");
        access.finish_get_data(id).await.unwrap();
        assert!(fx.pipeline.locks().is_empty());
    }

    #[tokio::test]
    async fn test_state_guards() {
        let (fx, access) = fixture(u64::MAX).await;
        let id = register(&fx, 4, "pending");

        assert!(matches!(
            access.get_data(id).await,
            Err(PipelineError::IllegalState { expected: FileStatus::Ready, .. })
        ));
        assert!(matches!(
            access.delete_data(id).await,
            Err(PipelineError::IllegalState { .. })
        ));
        assert!(matches!(
            access.put_data(&b""[..], 999, false).await,
            Err(PipelineError::NotFound(999))
        ));

        access.put_data(&b"x"[..], id, false).await.unwrap();
        let staging = fx.pipeline.staging_path(&fx.record(4, "pending").unwrap());
        let _guard = fx.pipeline.locks().try_acquire(&staging, "worker-1").unwrap();
        assert!(matches!(access.delete_data(id).await, Err(PipelineError::Busy(_))));
    }
}
