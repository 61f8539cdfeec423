//! Work queue of filesystem change events
//!
//! Multi-producer, multi-consumer FIFO. Every pop is a single locked
//! operation, so each entry reaches exactly one consumer.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Kind of change observed for a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileAction {
    Create,
    Modify,
    Delete,
}

impl fmt::Display for FileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Modify => write!(f, "modify"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// One unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    /// Absolute path the event refers to
    pub path: PathBuf,
    pub action: FileAction,
    /// Failed processing attempts so far
    pub attempt: u32,
    /// Earliest instant the entry may be processed again
    pub not_before: Option<Instant>,
}

impl QueueEntry {
    pub fn new(path: impl Into<PathBuf>, action: FileAction) -> Self {
        Self {
            path: path.into(),
            action,
            attempt: 0,
            not_before: None,
        }
    }

    /// Same event, one attempt later, not processed before `delay` has passed
    pub fn retry_after(mut self, delay: Duration) -> Self {
        self.attempt += 1;
        self.not_before = Some(Instant::now() + delay);
        self
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |t| t <= now)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("Work queue is empty")]
    EmptyQueue,
}

/// FIFO work queue
#[derive(Debug, Default)]
pub struct WorkQueue {
    entries: Mutex<VecDeque<QueueEntry>>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: QueueEntry) {
        self.entries.lock().push_back(entry);
    }

    /// Append several entries keeping their order
    pub fn extend(&self, entries: impl IntoIterator<Item = QueueEntry>) {
        self.entries.lock().extend(entries);
    }

    /// Remove the head entry
    pub fn pop(&self) -> Result<QueueEntry, QueueError> {
        self.try_pop().ok_or(QueueError::EmptyQueue)
    }

    pub fn try_pop(&self) -> Option<QueueEntry> {
        self.entries.lock().pop_front()
    }

    /// Remove the first entry that is due at `now`.
    ///
    /// Entries still backing off are rotated to the tail, keeping their
    /// relative order. Returns `None` when nothing is due.
    pub fn try_pop_ready(&self, now: Instant) -> Option<QueueEntry> {
        let mut entries = self.entries.lock();
        for _ in 0..entries.len() {
            let entry = entries.pop_front()?;
            if entry.is_ready(now) {
                return Some(entry);
            }
            entries.push_back(entry);
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let queue = WorkQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), Err(QueueError::EmptyQueue));

        queue.push(QueueEntry::new("/w/1/a", FileAction::Create));
        queue.push(QueueEntry::new("/w/1/b", FileAction::Modify));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop().unwrap().path, PathBuf::from("/w/1/a"));
        let next = queue.pop().unwrap();
        assert_eq!(next.action, FileAction::Modify);
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_try_pop_ready_rotates_backoff_entries() {
        let queue = WorkQueue::new();
        let now = Instant::now();

        let waiting = QueueEntry::new("/w/1/slow", FileAction::Create).retry_after(Duration::from_secs(60));
        assert_eq!(waiting.attempt, 1);
        queue.push(waiting);
        queue.push(QueueEntry::new("/w/1/fast", FileAction::Create));

        let popped = queue.try_pop_ready(now).unwrap();
        assert_eq!(popped.path, PathBuf::from("/w/1/fast"));
        assert!(queue.try_pop_ready(now).is_none());
        assert_eq!(queue.len(), 1);

        let later = now + Duration::from_secs(120);
        assert_eq!(queue.try_pop_ready(later).unwrap().path, PathBuf::from("/w/1/slow"));
    }

    #[test]
    fn test_concurrent_consumers_exactly_once() {
        let queue = Arc::new(WorkQueue::new());
        let total = 2000;
        for i in 0..total {
            queue.push(QueueEntry::new(format!("/w/1/file{}", i), FileAction::Create));
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Some(entry) = queue.try_pop() {
                        seen.push(entry.path);
                    }
                    seen
                })
            })
            .collect();

        let mut all = HashSet::new();
        let mut count = 0;
        for handle in handles {
            for path in handle.join().unwrap() {
                count += 1;
                all.insert(path);
            }
        }
        assert_eq!(count, total);
        assert_eq!(all.len(), total);
        assert!(queue.is_empty());
    }
}
