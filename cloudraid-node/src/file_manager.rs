//! Worker pool draining the work queue
//!
//! Worker `i` sleeps `(i + 1) * intervall` when the queue has nothing for it,
//! so low-numbered workers poll most eagerly and the pool thins out when idle.

use crate::config::FileManagementSettings;
use crate::metrics;
use crate::pipeline::{EventOutcome, Pipeline};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Longest back-off applied to a failing queue entry
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Pause after putting back a locked entry, so a lone contended entry does
/// not spin the worker
const CONTENDED_PAUSE: Duration = Duration::from_millis(50);

/// Result of one worker iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStep {
    /// Queue had nothing due
    Idle,
    /// Entry needed no work
    Skipped,
    /// Entry's file was locked; put back on the queue
    Contended,
    Processed,
    /// Transient failure; put back with a delay
    Requeued,
    /// Failed permanently or too often
    Dropped,
}

pub struct FileManager {
    pipeline: Arc<Pipeline>,
    worker_count: usize,
    base_interval: Duration,
    max_attempts: u32,
}

impl FileManager {
    pub fn new(pipeline: Arc<Pipeline>, settings: &FileManagementSettings) -> Self {
        Self {
            pipeline,
            worker_count: settings.count,
            base_interval: settings.base_interval(),
            max_attempts: settings.max_attempts,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Idle sleep of each worker
    pub fn worker_intervals(&self) -> Vec<Duration> {
        (0..self.worker_count)
            .map(|i| self.interval_for(i))
            .collect()
    }

    fn interval_for(&self, worker: usize) -> Duration {
        self.base_interval.saturating_mul(worker as u32 + 1)
    }

    /// Back-off before attempt `attempt + 1` of an entry
    fn retry_delay(&self, attempt: u32) -> Duration {
        self.base_interval
            .saturating_mul(1u32 << attempt.min(16))
            .min(MAX_RETRY_DELAY)
    }

    /// Spawn all workers; they run until `cancel` fires
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        info!(
            workers = self.worker_count,
            interval_ms = self.base_interval.as_millis() as u64,
            "Starting file manager"
        );
        (0..self.worker_count)
            .map(|worker| {
                let manager = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(async move { manager.run_worker(worker, cancel).await })
            })
            .collect()
    }

    async fn run_worker(&self, worker: usize, cancel: CancellationToken) {
        let interval = self.interval_for(worker);
        debug!(worker, interval_ms = interval.as_millis() as u64, "Worker started");

        while !cancel.is_cancelled() {
            let pause = match self.process_next(worker).await {
                WorkerStep::Idle => interval,
                WorkerStep::Contended => CONTENDED_PAUSE.min(interval),
                _ => continue,
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = cancel.cancelled() => break,
            }
        }

        debug!(worker, "Worker stopped");
    }

    /// Take one due entry off the queue and handle it
    pub async fn process_next(&self, worker: usize) -> WorkerStep {
        let queue = self.pipeline.queue();
        let Some(entry) = queue.try_pop_ready(Instant::now()) else {
            return WorkerStep::Idle;
        };
        metrics::set_queue_depth(queue.len());

        let holder = format!("worker-{}", worker);
        match self.pipeline.handle_event(&entry, &holder).await {
            Ok(EventOutcome::Processed) => WorkerStep::Processed,
            Ok(EventOutcome::Skipped) => WorkerStep::Skipped,
            Ok(EventOutcome::Contended) => {
                metrics::record_lock_contention();
                queue.push(entry);
                WorkerStep::Contended
            }
            Err(e) if e.is_transient() && entry.attempt + 1 < self.max_attempts => {
                let delay = self.retry_delay(entry.attempt);
                warn!(
                    worker,
                    path = %entry.path.display(),
                    attempt = entry.attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Processing failed, will retry"
                );
                queue.push(entry.retry_after(delay));
                WorkerStep::Requeued
            }
            Err(e) => {
                error!(
                    worker,
                    path = %entry.path.display(),
                    action = %entry.action,
                    attempts = entry.attempt + 1,
                    error = %e,
                    "Dropping queue entry"
                );
                WorkerStep::Dropped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::Fixture;
    use crate::queue::{FileAction, QueueEntry};
    use cloudraid_metadata::FileStatus;

    fn settings(count: usize, intervall: u64, max_attempts: u32) -> FileManagementSettings {
        FileManagementSettings {
            count,
            intervall,
            max_attempts,
        }
    }

    #[tokio::test]
    async fn test_worker_intervals() {
        let fx = Fixture::new().await;
        let manager = FileManager::new(Arc::clone(&fx.pipeline), &settings(4, 2000, 5));
        assert_eq!(
            manager.worker_intervals(),
            vec![
                Duration::from_millis(2000),
                Duration::from_millis(4000),
                Duration::from_millis(6000),
                Duration::from_millis(8000),
            ]
        );
    }

    #[tokio::test]
    async fn test_retry_delay_is_capped() {
        let fx = Fixture::new().await;
        let manager = FileManager::new(Arc::clone(&fx.pipeline), &settings(1, 1000, 5));
        assert_eq!(manager.retry_delay(0), Duration::from_secs(1));
        assert_eq!(manager.retry_delay(2), Duration::from_secs(4));
        assert_eq!(manager.retry_delay(30), MAX_RETRY_DELAY);
    }

    #[tokio::test]
    async fn test_process_next() {
        let fx = Fixture::new().await;
        let manager = FileManager::new(Arc::clone(&fx.pipeline), &settings(1, 10, 5));
        assert_eq!(manager.process_next(0).await, WorkerStep::Idle);

        let path = fx.write_watched(1, "w.txt", b"worker food");
        fx.pipeline.queue().push(QueueEntry::new(&path, FileAction::Create));
        assert_eq!(manager.process_next(0).await, WorkerStep::Processed);
        assert_eq!(fx.record(1, "w.txt").unwrap().status, FileStatus::Ready);

        fx.pipeline.queue().push(QueueEntry::new("/not/watched/1/x", FileAction::Create));
        assert_eq!(manager.process_next(0).await, WorkerStep::Skipped);
        assert!(fx.pipeline.queue().is_empty());
    }

    #[tokio::test]
    async fn test_contended_entry_goes_back() {
        let fx = Fixture::new().await;
        let manager = FileManager::new(Arc::clone(&fx.pipeline), &settings(2, 10, 5));
        let path = fx.write_watched(1, "c.txt", b"contended");
        let staging = fx.pipeline.resolve(&path).unwrap().staging;

        let guard = fx.pipeline.locks().try_acquire(&staging, "core-access").unwrap();
        fx.pipeline.queue().push(QueueEntry::new(&path, FileAction::Create));
        assert_eq!(manager.process_next(1).await, WorkerStep::Contended);
        assert_eq!(fx.pipeline.queue().len(), 1);

        drop(guard);
        assert_eq!(manager.process_next(0).await, WorkerStep::Processed);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_drop() {
        let fx = Fixture::new().await;
        let manager = FileManager::new(Arc::clone(&fx.pipeline), &settings(1, 1, 2));
        fx.connectors[0].set_offline(true);
        let path = fx.write_watched(1, "r.txt", b"retry me");
        fx.pipeline.queue().push(QueueEntry::new(&path, FileAction::Create));

        assert_eq!(manager.process_next(0).await, WorkerStep::Requeued);
        let retried = fx.pipeline.queue().try_pop().unwrap();
        assert_eq!(retried.attempt, 1);
        assert!(retried.not_before.is_some());

        // second failure reaches max_attempts
        fx.pipeline.queue().push(QueueEntry {
            not_before: None,
            ..retried
        });
        assert_eq!(manager.process_next(0).await, WorkerStep::Dropped);
        assert!(fx.pipeline.queue().is_empty());
        assert_eq!(fx.record(1, "r.txt").unwrap().status, FileStatus::Distributing);
    }

    #[tokio::test]
    async fn test_skipped_entries_do_not_wait_for_interval() {
        let fx = Fixture::new().await;
        let manager = Arc::new(FileManager::new(Arc::clone(&fx.pipeline), &settings(1, 1000, 5)));
        for i in 0..5 {
            let path = format!("/not/watched/1/skip-{}", i);
            fx.pipeline.queue().push(QueueEntry::new(path, FileAction::Create));
        }

        let cancel = CancellationToken::new();
        let handles = manager.spawn(cancel.clone());
        tokio::time::timeout(Duration::from_millis(500), async {
            while !fx.pipeline.queue().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queue not drained within half an interval");

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_spawned_workers_drain_queue_and_stop() {
        let fx = Fixture::new().await;
        let manager = Arc::new(FileManager::new(Arc::clone(&fx.pipeline), &settings(3, 5, 5)));
        for i in 0..6 {
            let path = fx.write_watched(1, &format!("f{}", i), format!("content {}", i).as_bytes());
            fx.pipeline.queue().push(QueueEntry::new(&path, FileAction::Create));
        }

        let cancel = CancellationToken::new();
        let handles = manager.spawn(cancel.clone());
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let ready = fx
                    .pipeline
                    .store()
                    .files_in_state(FileStatus::Ready)
                    .unwrap()
                    .len();
                if ready == 6 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
        assert!(fx.pipeline.locks().is_empty());
    }
}
