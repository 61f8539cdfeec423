//! CloudRAID Metadata
//!
//! File records and their lifecycle:
//! - `FileRecord` / `FileStatus` with the allowed status transitions
//! - `MetadataStore` trait consumed by the pipeline
//! - `MemoryMetadataStore` for tests and ephemeral deployments
//! - `SledMetadataStore` for persistent local metadata

pub mod memory;
pub mod models;
pub mod sled_store;
pub mod store;

pub use memory::MemoryMetadataStore;
pub use models::{FileId, FileRecord, FileStatus};
pub use sled_store::SledMetadataStore;
pub use store::{MetadataError, MetadataStore, Result};
