//! The `.m` metadata shard
//!
//! Fixed-width ASCII record written next to every shard set:
//!
//! ```text
//! VV | h0 (64) | h1 (64) | h2 (64) | hin (64) | NNNNNNNNNNNNNNNN
//! ```
//!
//! `VV` is the format version in hex, `h0..h2` are the Blake3 hashes of the three
//! device shards, `hin` is the hash of the original input and the trailer is the
//! input length in bytes (16 hex digits).

use crate::error::{CloudRaidError, Result};
use crate::shard::ContentHash;
use crate::DEVICE_COUNT;
use std::fmt;
use std::path::Path;

/// Current metadata format version
pub const METADATA_VERSION: u8 = 1;

const HASH_HEX_LEN: usize = 64;
const VERSION_HEX_LEN: usize = 2;
const LENGTH_HEX_LEN: usize = 16;

/// Encoded size of a metadata shard
pub const METADATA_LEN: usize =
    VERSION_HEX_LEN + (DEVICE_COUNT + 1) * HASH_HEX_LEN + LENGTH_HEX_LEN;

/// Parsed contents of a `.m` shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardMetadata {
    pub version: u8,
    /// Hashes of device shards 0, 1 and 2
    pub device_hashes: [ContentHash; DEVICE_COUNT],
    /// Hash of the unsplit input
    pub input_hash: ContentHash,
    /// Length of the unsplit input in bytes
    pub input_len: u64,
}

impl ShardMetadata {
    pub fn new(
        device_hashes: [ContentHash; DEVICE_COUNT],
        input_hash: ContentHash,
        input_len: u64,
    ) -> Self {
        Self {
            version: METADATA_VERSION,
            device_hashes,
            input_hash,
            input_len,
        }
    }

    /// Encode to the fixed-width ASCII representation
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(METADATA_LEN);
        out.push_str(&format!("{:02x}", self.version));
        for hash in &self.device_hashes {
            out.push_str(&hash.to_hex());
        }
        out.push_str(&self.input_hash.to_hex());
        out.push_str(&format!("{:016x}", self.input_len));
        out
    }

    /// Parse a metadata record. Trailing whitespace (a final newline) is tolerated.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim_end();
        if raw.len() != METADATA_LEN {
            return Err(CloudRaidError::InvalidMetadata(format!(
                "expected {} chars, got {}",
                METADATA_LEN,
                raw.len()
            )));
        }
        if !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CloudRaidError::InvalidMetadata(
                "non-hex content".to_string(),
            ));
        }

        let version = u8::from_str_radix(&raw[..VERSION_HEX_LEN], 16)
            .map_err(|e| CloudRaidError::InvalidMetadata(e.to_string()))?;
        if version != METADATA_VERSION {
            return Err(CloudRaidError::UnsupportedMetadataVersion {
                found: version,
                expected: METADATA_VERSION,
            });
        }

        let hash_at = |slot: usize| {
            let start = VERSION_HEX_LEN + slot * HASH_HEX_LEN;
            ContentHash::from_hex(&raw[start..start + HASH_HEX_LEN])
        };
        let device_hashes = [hash_at(0)?, hash_at(1)?, hash_at(2)?];
        let input_hash = hash_at(DEVICE_COUNT)?;

        let len_start = METADATA_LEN - LENGTH_HEX_LEN;
        let input_len = u64::from_str_radix(&raw[len_start..], 16)
            .map_err(|e| CloudRaidError::InvalidMetadata(e.to_string()))?;

        Ok(Self {
            version,
            device_hashes,
            input_hash,
            input_len,
        })
    }

    /// Read and parse a metadata shard from disk
    pub fn read_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Write the encoded record to disk
    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.encode())?;
        Ok(())
    }
}

impl fmt::Display for ShardMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "v{} len={} in={:?}",
            self.version, self.input_len, self.input_hash
        )
    }
}
