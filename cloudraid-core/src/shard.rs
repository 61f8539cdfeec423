//! Shard naming and content hashing
//!
//! A split produces one shard set per file: three device shards
//! (`<hash>.0`, `<hash>.1`, `<hash>.2`) and one metadata shard (`<hash>.m`).
//! The base name is the Blake3 hash of the file's staging-relative path.

use crate::error::{CloudRaidError, Result};
use crate::DEVICE_COUNT;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;

/// Blake3 content hash
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(blake3::Hash);

impl ContentHash {
    /// Compute Blake3 hash of data
    pub fn compute(data: &[u8]) -> Self {
        Self(blake3::hash(data))
    }

    /// Wrap a finished hasher
    pub fn from_hasher(hasher: &blake3::Hasher) -> Self {
        Self(hasher.finalize())
    }

    /// Get the raw hash bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Convert to lowercase hex string (64 chars)
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    /// Parse from hex string
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hash = blake3::Hash::from_hex(hex)
            .map_err(|e| CloudRaidError::InvalidMetadata(format!("bad hash {hex:?}: {e}")))?;
        Ok(Self(hash))
    }

    /// Verify that data matches this hash
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::compute(data) == *self
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Compute the shard base name for a staging-relative path such as `"42/docs/a.txt"`.
///
/// Platform separators are normalized to `/` so the same logical file always
/// maps to the same base name.
pub fn base_name_for(relative_path: &str) -> String {
    let normalized = relative_path.replace('\\', "/");
    let trimmed = normalized.trim_start_matches('/');
    ContentHash::compute(trimmed.as_bytes()).to_hex()
}

/// One member of a shard set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardKind {
    /// Data/parity device shard `0..3`
    Device(usize),
    /// The `.m` metadata shard
    Metadata,
}

impl ShardKind {
    /// All four shards in upload order
    pub const ALL: [ShardKind; 4] = [
        ShardKind::Device(0),
        ShardKind::Device(1),
        ShardKind::Device(2),
        ShardKind::Metadata,
    ];

    /// File extension without the dot
    pub fn extension(&self) -> String {
        match self {
            ShardKind::Device(i) => i.to_string(),
            ShardKind::Metadata => "m".to_string(),
        }
    }

    /// Resource name used on storage connectors, e.g. `<hash>.1`
    pub fn resource_name(&self, base: &str) -> String {
        format!("{}.{}", base, self.extension())
    }
}

impl fmt::Display for ShardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ".{}", self.extension())
    }
}

/// Location of a shard set on the local filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSet {
    /// Base name (64 hex chars)
    pub base: String,
    /// Directory holding the shard files
    pub dir: PathBuf,
}

impl ShardSet {
    /// Create a shard set handle
    pub fn new(dir: impl Into<PathBuf>, base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            dir: dir.into(),
        }
    }

    /// Path of one shard file
    pub fn path(&self, kind: ShardKind) -> PathBuf {
        self.dir.join(kind.resource_name(&self.base))
    }

    /// Paths of the three device shards
    pub fn device_paths(&self) -> [PathBuf; DEVICE_COUNT] {
        [
            self.path(ShardKind::Device(0)),
            self.path(ShardKind::Device(1)),
            self.path(ShardKind::Device(2)),
        ]
    }

    /// Path of the metadata shard
    pub fn metadata_path(&self) -> PathBuf {
        self.path(ShardKind::Metadata)
    }

    /// Remove every shard file, ignoring files that are already gone
    pub fn remove_files(&self) -> std::io::Result<()> {
        for kind in ShardKind::ALL {
            match std::fs::remove_file(self.path(kind)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_name_is_stable_hex() {
        let a = base_name_for("42/docs/report.pdf");
        let b = base_name_for("42/docs/report.pdf");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, base_name_for("43/docs/report.pdf"));
    }

    #[test]
    fn test_base_name_normalizes_separators() {
        assert_eq!(
            base_name_for("42\\docs\\report.pdf"),
            base_name_for("/42/docs/report.pdf")
        );
    }

    #[test]
    fn test_shard_paths() {
        let set = ShardSet::new("/tmp/out", "abc");
        assert_eq!(set.path(ShardKind::Device(1)), PathBuf::from("/tmp/out/abc.1"));
        assert_eq!(set.metadata_path(), PathBuf::from("/tmp/out/abc.m"));
        assert_eq!(ShardKind::Metadata.resource_name("abc"), "abc.m");
    }

    #[test]
    fn test_content_hash_hex_roundtrip() {
        let hash = ContentHash::compute(b"cloudraid");
        let parsed = ContentHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);
        assert!(parsed.verify(b"cloudraid"));
        assert!(!parsed.verify(b"CloudRAID"));
    }

    #[test]
    fn test_remove_files_ignores_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let set = ShardSet::new(dir.path(), "base");
        std::fs::write(set.path(ShardKind::Device(0)), b"x").unwrap();
        set.remove_files().unwrap();
        assert!(!set.path(ShardKind::Device(0)).exists());
    }
}
