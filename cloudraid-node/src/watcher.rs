//! Polling directory watcher
//!
//! Each cycle walks the watched tree, compares modification times with the
//! previous cycle and turns the differences into queue entries:
//! unseen file -> `Create`, changed mtime -> `Modify`, vanished -> `Delete`.
//! Symbolic links are reported and skipped, never followed.

use crate::metrics;
use crate::queue::{FileAction, QueueEntry, WorkQueue};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Watch root {0:?} no longer exists")]
    RootMissing(PathBuf),

    #[error("Failed to walk {path:?}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

/// Liveness of the watcher loop, published on a watch channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherHealth {
    Starting,
    Running,
    /// Stopped on request
    Stopped,
    /// Terminated by an unrecoverable error
    Failed(String),
    /// Watching is switched off in configuration
    Disabled,
}

/// Polling watcher; owns the remembered path -> mtime state
#[derive(Debug)]
pub struct DirectoryWatcher {
    root: PathBuf,
    state: HashMap<PathBuf, SystemTime>,
}

impl DirectoryWatcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of remembered files
    pub fn tracked(&self) -> usize {
        self.state.len()
    }

    pub fn is_tracked(&self, path: &Path) -> bool {
        self.state.contains_key(path)
    }

    /// Run one poll cycle and return the events it produced
    pub fn poll_cycle(&mut self) -> Result<Vec<QueueEntry>, WatcherError> {
        if !self.root.is_dir() {
            return Err(WatcherError::RootMissing(self.root.clone()));
        }

        let mut pending: HashSet<PathBuf> = self.state.keys().cloned().collect();
        let mut events = Vec::new();

        for item in WalkDir::new(&self.root).follow_links(false).sort_by_file_name() {
            let entry = match item {
                Ok(entry) => entry,
                Err(e) => {
                    if e.path() == Some(self.root.as_path()) {
                        return Err(WatcherError::Walk {
                            path: self.root.clone(),
                            source: e,
                        });
                    }
                    warn!(error = %e, "Skipping unreadable entry");
                    continue;
                }
            };

            if entry.path_is_symlink() {
                info!(path = %entry.path().display(), "Skipping symbolic link");
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }

            let modified = match entry.metadata().map(|m| m.modified()) {
                Ok(Ok(modified)) => modified,
                Ok(Err(e)) => {
                    warn!(path = %entry.path().display(), error = %e, "No modification time");
                    continue;
                }
                Err(e) => {
                    // vanished between listing and stat
                    debug!(path = %entry.path().display(), error = %e, "Cannot stat entry");
                    continue;
                }
            };

            let path = entry.into_path();
            pending.remove(&path);
            match self.state.insert(path.clone(), modified) {
                None => events.push(QueueEntry::new(path, FileAction::Create)),
                Some(previous) if previous != modified => {
                    events.push(QueueEntry::new(path, FileAction::Modify))
                }
                Some(_) => {}
            }
        }

        let mut deleted: Vec<PathBuf> = pending.into_iter().collect();
        deleted.sort();
        for path in deleted {
            self.state.remove(&path);
            events.push(QueueEntry::new(path, FileAction::Delete));
        }

        Ok(events)
    }
}

/// Watcher loop: poll, enqueue, sleep until cancelled.
///
/// The walk runs on the blocking pool so it never competes with the async
/// worker threads. If the root disappears the loop stops and reports
/// [`WatcherHealth::Failed`].
pub async fn run_watcher(
    mut watcher: DirectoryWatcher,
    queue: Arc<WorkQueue>,
    interval: Duration,
    cancel: CancellationToken,
    health: watch::Sender<WatcherHealth>,
) {
    info!(root = %watcher.root().display(), interval_secs = interval.as_secs(), "Watcher started");
    let _ = health.send(WatcherHealth::Running);

    loop {
        let cycle = tokio::task::spawn_blocking(move || {
            let result = watcher.poll_cycle();
            (watcher, result)
        })
        .await;

        let (returned, result) = match cycle {
            Ok(cycle) => cycle,
            Err(e) => {
                error!(error = %e, "Watcher cycle panicked");
                let _ = health.send(WatcherHealth::Failed(e.to_string()));
                return;
            }
        };
        watcher = returned;

        match result {
            Ok(events) => {
                if !events.is_empty() {
                    debug!(events = events.len(), tracked = watcher.tracked(), "Watcher cycle");
                    queue.extend(events);
                    metrics::set_queue_depth(queue.len());
                }
            }
            Err(e) => {
                error!(error = %e, "Watcher stopped");
                let _ = health.send(WatcherHealth::Failed(e.to_string()));
                return;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => break,
        }
    }

    info!("Watcher stopped");
    let _ = health.send(WatcherHealth::Stopped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn actions(events: &[QueueEntry]) -> Vec<(FileAction, PathBuf)> {
        events.iter().map(|e| (e.action, e.path.clone())).collect()
    }

    fn bump_mtime(path: &Path) {
        let later = SystemTime::now() + Duration::from_secs(5);
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(later)
            .unwrap();
    }

    #[test]
    fn test_classification_across_cycles() {
        let dir = TempDir::new().unwrap();
        let mut watcher = DirectoryWatcher::new(dir.path());

        // cycle 1: empty
        assert!(watcher.poll_cycle().unwrap().is_empty());

        // cycle 2: a.txt appears
        let a = dir.path().join("a.txt");
        std::fs::write(&a, b"hello").unwrap();
        let events = watcher.poll_cycle().unwrap();
        assert_eq!(actions(&events), vec![(FileAction::Create, a.clone())]);

        // cycle 3: nothing changed
        assert!(watcher.poll_cycle().unwrap().is_empty());

        // touched
        bump_mtime(&a);
        let events = watcher.poll_cycle().unwrap();
        assert_eq!(actions(&events), vec![(FileAction::Modify, a.clone())]);
        assert!(watcher.poll_cycle().unwrap().is_empty());

        // deleted
        std::fs::remove_file(&a).unwrap();
        let events = watcher.poll_cycle().unwrap();
        assert_eq!(actions(&events), vec![(FileAction::Delete, a.clone())]);
        assert!(!watcher.is_tracked(&a));
        assert!(watcher.poll_cycle().unwrap().is_empty());
    }

    #[test]
    fn test_nested_directories() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("42/docs")).unwrap();
        std::fs::write(dir.path().join("42/docs/report.pdf"), b"pdf").unwrap();
        std::fs::write(dir.path().join("42/notes.txt"), b"txt").unwrap();

        let mut watcher = DirectoryWatcher::new(dir.path());
        let events = watcher.poll_cycle().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.action == FileAction::Create));
        assert_eq!(watcher.tracked(), 2);

        std::fs::remove_dir_all(dir.path().join("42/docs")).unwrap();
        let events = watcher.poll_cycle().unwrap();
        assert_eq!(
            actions(&events),
            vec![(FileAction::Delete, dir.path().join("42/docs/report.pdf"))]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_skipped() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), b"x").unwrap();
        std::fs::write(dir.path().join("real.txt"), b"x").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("linked-dir")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("linked-file")).unwrap();

        let mut watcher = DirectoryWatcher::new(dir.path());
        let events = watcher.poll_cycle().unwrap();
        assert_eq!(
            actions(&events),
            vec![(FileAction::Create, dir.path().join("real.txt"))]
        );
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("gone");
        let mut watcher = DirectoryWatcher::new(&root);
        assert!(matches!(
            watcher.poll_cycle(),
            Err(WatcherError::RootMissing(path)) if path == root
        ));
    }

    #[tokio::test]
    async fn test_loop_reports_failure_when_root_vanishes() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("watched");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("a"), b"a").unwrap();

        let queue = Arc::new(WorkQueue::new());
        let (tx, mut rx) = watch::channel(WatcherHealth::Starting);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_watcher(
            DirectoryWatcher::new(&root),
            Arc::clone(&queue),
            Duration::from_millis(20),
            cancel.clone(),
            tx,
        ));

        // first cycle picks up the file
        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        std::fs::remove_dir_all(&root).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(&*rx.borrow_and_update(), WatcherHealth::Failed(_)));
    }

    #[tokio::test]
    async fn test_loop_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(WorkQueue::new());
        let (tx, rx) = watch::channel(WatcherHealth::Starting);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_watcher(
            DirectoryWatcher::new(dir.path()),
            queue,
            Duration::from_secs(3600),
            cancel.clone(),
            tx,
        ));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*rx.borrow(), WatcherHealth::Stopped);
    }
}
