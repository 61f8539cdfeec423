//! CloudRAID Core Library
//!
//! Core abstractions for the CloudRAID storage pipeline.
//! This crate provides:
//! - The RAID5-style split/merge codec (2 data-derived devices + 1 rotating parity device)
//! - The `.m` metadata shard written alongside every shard set
//! - Shard naming (content-addressed base names) and content hashing
//! - Common error handling

pub mod error;
pub mod metadata;
pub mod raid5;
pub mod shard;

pub use error::{CloudRaidError, Result};
pub use metadata::ShardMetadata;
pub use raid5::{merge, merge_file, split, split_file, MergeSummary, ParityPolicy, SplitSummary};
pub use shard::{base_name_for, ContentHash, ShardKind, ShardSet};

/// Number of device shards produced by a split (two data-derived + one parity)
pub const DEVICE_COUNT: usize = 3;

/// Device that carries the parity byte of the first chunk
pub const INITIAL_PARITY_POS: usize = 2;

/// Buffer size used for streaming split/merge I/O
pub const IO_BUFFER_SIZE: usize = 64 * 1024;
