//! RAID5-style split/merge codec
//!
//! The input is consumed two bytes at a time. The 16 bits of each pair are
//! de-interleaved into two bytes `A` (the high bit of every adjacent bit pair)
//! and `B` (the low bit), and a parity byte `P = A ^ B` is computed. The three
//! bytes land on three devices, with the parity device rotating by one after
//! every chunk, starting at device 2:
//!
//! ```text
//! chunk k:  parity on (2 + k) % 3, A on (p + 1) % 3, B on (p + 2) % 3
//! ```
//!
//! An odd trailing byte `L` is written unchanged to the `A` device and its
//! one's complement to the parity device.
//!
//! Any single device can be lost: `A = B ^ P`, `B = A ^ P` and the odd tail is
//! `!P`. Reconstructing without a device needs the input length, which the
//! `.m` metadata shard records.

use crate::error::{CloudRaidError, Result};
use crate::metadata::ShardMetadata;
use crate::shard::{base_name_for, ContentHash, ShardSet};
use crate::{DEVICE_COUNT, INITIAL_PARITY_POS, IO_BUFFER_SIZE};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use tracing::{debug, warn};

/// What merge does when `A ^ B != P`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParityPolicy {
    /// Log the mismatch and keep going
    #[default]
    Warn,
    /// Abort with [`CloudRaidError::ParityMismatch`]
    Reject,
}

/// Result of a split
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitSummary {
    /// Bytes consumed from the input
    pub input_len: u64,
    /// Number of two-byte chunks
    pub chunks: u64,
    /// Bytes written to each device
    pub device_lens: [u64; DEVICE_COUNT],
}

/// Result of a merge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Bytes written to the output
    pub bytes_written: u64,
    /// Number of two-byte chunks reconstructed
    pub chunks: u64,
    /// Parity mismatches seen (always 0 under [`ParityPolicy::Reject`])
    pub parity_mismatches: u64,
    /// Device that was reconstructed from the other two, if any
    pub dead_device: Option<usize>,
}

/// Device indices `(a, b, parity)` for the given parity position
#[inline]
fn roles(parity_pos: usize) -> (usize, usize, usize) {
    (
        (parity_pos + 1) % DEVICE_COUNT,
        (parity_pos + 2) % DEVICE_COUNT,
        parity_pos,
    )
}

/// Split a byte pair into its high-bit and low-bit bytes
#[inline]
pub fn deinterleave(b0: u8, b1: u8) -> (u8, u8) {
    let v = (u16::from(b0) << 8) | u16::from(b1);
    let mut a = 0u8;
    let mut b = 0u8;
    for k in 0..8 {
        a |= (((v >> (15 - 2 * k)) & 1) as u8) << (7 - k);
        b |= (((v >> (14 - 2 * k)) & 1) as u8) << (7 - k);
    }
    (a, b)
}

/// Inverse of [`deinterleave`]
#[inline]
pub fn interleave(a: u8, b: u8) -> (u8, u8) {
    let mut v = 0u16;
    for k in 0..8 {
        v |= u16::from((a >> (7 - k)) & 1) << (15 - 2 * k);
        v |= u16::from((b >> (7 - k)) & 1) << (14 - 2 * k);
    }
    ((v >> 8) as u8, v as u8)
}

/// Fill `buf` as far as the reader allows, returning the number of bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn next_byte<R: BufRead>(reader: &mut R) -> io::Result<Option<u8>> {
    loop {
        match reader.fill_buf() {
            Ok([]) => return Ok(None),
            Ok(buf) => {
                let byte = buf[0];
                reader.consume(1);
                return Ok(Some(byte));
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn emit_chunk(out: &mut [Vec<u8>; DEVICE_COUNT], parity_pos: &mut usize, b0: u8, b1: u8) {
    let (ia, ib, ip) = roles(*parity_pos);
    let (a, b) = deinterleave(b0, b1);
    out[ia].push(a);
    out[ib].push(b);
    out[ip].push(a ^ b);
    *parity_pos = (*parity_pos + 1) % DEVICE_COUNT;
}

/// Split `input` across three device writers.
///
/// Devices are flushed before returning.
pub fn split<R: Read, W: Write>(
    mut input: R,
    mut devices: [W; DEVICE_COUNT],
) -> Result<SplitSummary> {
    let mut buf = vec![0u8; IO_BUFFER_SIZE];
    let mut out: [Vec<u8>; DEVICE_COUNT] = Default::default();
    let mut parity_pos = INITIAL_PARITY_POS;
    let mut carry: Option<u8> = None;
    let mut summary = SplitSummary::default();

    loop {
        let n = read_full(&mut input, &mut buf)?;
        if n == 0 {
            break;
        }
        summary.input_len += n as u64;

        let mut data = &buf[..n];
        if let Some(b0) = carry.take() {
            if let Some((&b1, rest)) = data.split_first() {
                emit_chunk(&mut out, &mut parity_pos, b0, b1);
                summary.chunks += 1;
                data = rest;
            }
        }

        let mut pairs = data.chunks_exact(2);
        for pair in &mut pairs {
            emit_chunk(&mut out, &mut parity_pos, pair[0], pair[1]);
            summary.chunks += 1;
        }
        carry = pairs.remainder().first().copied();

        for (i, device) in devices.iter_mut().enumerate() {
            device.write_all(&out[i])?;
            summary.device_lens[i] += out[i].len() as u64;
            out[i].clear();
        }
    }

    if let Some(last) = carry {
        let (ia, _, ip) = roles(parity_pos);
        devices[ia].write_all(&[last])?;
        devices[ip].write_all(&[0xFF - last])?;
        summary.device_lens[ia] += 1;
        summary.device_lens[ip] += 1;
    }

    for device in devices.iter_mut() {
        device.flush()?;
    }

    Ok(summary)
}

struct Merger<R, W> {
    readers: [Option<BufReader<R>>; DEVICE_COUNT],
    output: W,
    buf: Vec<u8>,
    policy: ParityPolicy,
    expected_len: Option<u64>,
    summary: MergeSummary,
}

impl<R: Read, W: Write> Merger<R, W> {
    fn next(&mut self, device: usize) -> Result<Option<u8>> {
        match &mut self.readers[device] {
            Some(reader) => Ok(next_byte(reader)?),
            None => Ok(None),
        }
    }

    /// Read a byte that must be present
    fn need(&mut self, device: usize) -> Result<u8> {
        match self.next(device)? {
            Some(byte) => Ok(byte),
            None => {
                let actual = self.summary.bytes_written + self.buf.len() as u64;
                Err(CloudRaidError::Truncated {
                    expected: self.expected_len.unwrap_or(actual + 1),
                    actual,
                })
            }
        }
    }

    fn check_parity(&mut self, computed: u8, stored: u8) -> Result<()> {
        if computed == stored {
            return Ok(());
        }
        let offset = self.summary.chunks;
        match self.policy {
            ParityPolicy::Warn => {
                self.summary.parity_mismatches += 1;
                warn!(offset, computed, stored, "Parity mismatch, continuing");
                Ok(())
            }
            ParityPolicy::Reject => Err(CloudRaidError::ParityMismatch { offset }),
        }
    }

    fn push(&mut self, byte: u8) -> Result<()> {
        self.buf.push(byte);
        if self.buf.len() >= IO_BUFFER_SIZE {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.output.write_all(&self.buf)?;
        self.summary.bytes_written += self.buf.len() as u64;
        self.buf.clear();
        Ok(())
    }
}

/// Merge three device readers back into the original byte stream.
///
/// A `None` device is reconstructed from the other two; this requires
/// `expected_len`. With all three devices present the length is implied by the
/// device contents, and `expected_len`, when given, only bounds the output.
pub fn merge<R: Read, W: Write>(
    devices: [Option<R>; DEVICE_COUNT],
    output: W,
    policy: ParityPolicy,
    expected_len: Option<u64>,
) -> Result<MergeSummary> {
    let missing: Vec<usize> = (0..DEVICE_COUNT).filter(|&i| devices[i].is_none()).collect();
    if missing.len() > 1 {
        return Err(CloudRaidError::InsufficientShards {
            available: DEVICE_COUNT - missing.len(),
            required: DEVICE_COUNT - 1,
        });
    }
    let dead = missing.first().copied();
    if dead.is_some() && expected_len.is_none() {
        return Err(CloudRaidError::InvalidMetadata(
            "degraded merge requires the recorded input length".to_string(),
        ));
    }

    let mut m = Merger {
        readers: devices.map(|d| d.map(|r| BufReader::with_capacity(IO_BUFFER_SIZE, r))),
        output,
        buf: Vec::with_capacity(IO_BUFFER_SIZE),
        policy,
        expected_len,
        summary: MergeSummary {
            dead_device: dead,
            ..Default::default()
        },
    };

    let total_chunks = expected_len.map(|len| len / 2);
    let mut parity_pos = INITIAL_PARITY_POS;
    let mut pending_tail: Option<u8> = None;

    loop {
        if total_chunks == Some(m.summary.chunks) {
            break;
        }
        let (ia, ib, ip) = roles(parity_pos);
        let (a, b) = match dead {
            None => {
                let Some(a) = m.next(ia)? else { break };
                let Some(b) = m.next(ib)? else {
                    pending_tail = Some(a);
                    break;
                };
                let p = m.need(ip)?;
                m.check_parity(a ^ b, p)?;
                (a, b)
            }
            Some(d) if d == ia => {
                let b = m.need(ib)?;
                let p = m.need(ip)?;
                (b ^ p, b)
            }
            Some(d) if d == ib => {
                let a = m.need(ia)?;
                let p = m.need(ip)?;
                (a, a ^ p)
            }
            Some(_) => (m.need(ia)?, m.need(ib)?),
        };

        let (b0, b1) = interleave(a, b);
        m.push(b0)?;
        m.push(b1)?;
        m.summary.chunks += 1;
        parity_pos = (parity_pos + 1) % DEVICE_COUNT;
    }

    let has_tail = match expected_len {
        Some(len) => len % 2 == 1,
        None => pending_tail.is_some(),
    };
    if has_tail {
        let (ia, _, ip) = roles(parity_pos);
        let last = match dead {
            Some(d) if d == ia => !m.need(ip)?,
            Some(d) if d == ip => m.need(ia)?,
            _ => {
                let a = match pending_tail {
                    Some(a) => a,
                    None => m.need(ia)?,
                };
                let p = m.need(ip)?;
                m.check_parity(a ^ 0xFF, p)?;
                a
            }
        };
        m.push(last)?;
    }

    m.flush()?;
    m.output.flush()?;

    if let Some(expected) = expected_len {
        if m.summary.bytes_written != expected {
            return Err(CloudRaidError::Truncated {
                expected,
                actual: m.summary.bytes_written,
            });
        }
    }

    Ok(m.summary)
}

/// Reader or writer that hashes every byte passing through it
struct Hashing<T> {
    inner: T,
    hasher: blake3::Hasher,
}

impl<T> Hashing<T> {
    fn new(inner: T) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
        }
    }

    fn hash(&self) -> ContentHash {
        ContentHash::from_hasher(&self.hasher)
    }
}

impl<T: Read> Read for Hashing<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

impl<T: Write> Write for Hashing<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn hash_file(path: &Path) -> Result<ContentHash> {
    let mut hasher = blake3::Hasher::new();
    let mut file = File::open(path)?;
    io::copy(&mut file, &mut hasher)?;
    Ok(ContentHash::from_hasher(&hasher))
}

/// Split a file into `<hash>.0/.1/.2` plus `<hash>.m` in `output_dir`.
///
/// `relative_name` is the staging-relative path (`"{user_id}/{path}"`) the
/// shard base name is derived from.
pub fn split_file(
    input_path: &Path,
    relative_name: &str,
    output_dir: &Path,
) -> Result<(ShardSet, SplitSummary)> {
    std::fs::create_dir_all(output_dir)?;
    let set = ShardSet::new(output_dir, base_name_for(relative_name));

    let create = |path: &Path| -> Result<Hashing<BufWriter<File>>> {
        Ok(Hashing::new(BufWriter::new(File::create(path)?)))
    };
    let [p0, p1, p2] = set.device_paths();
    let mut input = Hashing::new(File::open(input_path)?);
    let mut writers = [create(&p0)?, create(&p1)?, create(&p2)?];

    let summary = split(&mut input, writers.each_mut())?;

    let metadata = ShardMetadata::new(
        [writers[0].hash(), writers[1].hash(), writers[2].hash()],
        input.hash(),
        summary.input_len,
    );
    metadata.write_to(&set.metadata_path())?;

    debug!(
        input = %input_path.display(),
        base = %set.base,
        bytes = summary.input_len,
        "Split file into shards"
    );
    Ok((set, summary))
}

/// Merge the shard set `<hash>.*` found in `input_dir` into `output_path`.
///
/// Every device is checked against the hash recorded in `<hash>.m`. A device
/// that is missing or corrupt is rebuilt from the other two; with two or more
/// unusable devices the merge fails with
/// [`CloudRaidError::InsufficientShards`]. The output is removed again on
/// failure.
pub fn merge_file(
    input_dir: &Path,
    hash: &str,
    output_path: &Path,
    policy: ParityPolicy,
) -> Result<MergeSummary> {
    let set = ShardSet::new(input_dir, hash);
    let metadata = ShardMetadata::read_from(&set.metadata_path())?;

    let mut readers: [Option<File>; DEVICE_COUNT] = [None, None, None];
    for (i, path) in set.device_paths().iter().enumerate() {
        if !path.exists() {
            warn!(device = i, base = hash, "Device shard missing");
            continue;
        }
        if hash_file(path)? != metadata.device_hashes[i] {
            warn!(device = i, base = hash, "Device shard hash mismatch, treating as lost");
            continue;
        }
        readers[i] = Some(File::open(path)?);
    }

    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let result = (|| {
        let mut output = Hashing::new(BufWriter::new(File::create(output_path)?));
        let summary = merge(readers, &mut output, policy, Some(metadata.input_len))?;
        if output.hash() != metadata.input_hash {
            return Err(CloudRaidError::HashVerificationFailed(
                output_path.display().to_string(),
            ));
        }
        Ok(summary)
    })();

    match result {
        Ok(summary) => {
            debug!(
                base = hash,
                output = %output_path.display(),
                bytes = summary.bytes_written,
                dead_device = ?summary.dead_device,
                "Merged shards"
            );
            Ok(summary)
        }
        Err(e) => {
            let _ = std::fs::remove_file(output_path);
            Err(e)
        }
    }
}
