//! Immutable access to a single generation file.
//!
//! A reader never mutates the file. It serves random reads for locations
//! handed out by the writer of the same generation, and sequential channel
//! snapshots for replay. Readers share their channel by refcount; cloning a
//! reader is cheap.

use std::os::unix::fs::FileExt;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::channel::ChannelRef;
use crate::errors::{TranslogError, TranslogResult};
use crate::location::Location;
use crate::op::{decode_operation, Operation};

/// Generation file header: `magic: u32 | version: u8 | generation: i64 |
/// op_count: i32`, all big-endian. The op-count slot holds -1 until the
/// writer is sealed on roll.
pub(crate) const HEADER_SIZE: u64 = 4 + 1 + 8 + 4;
pub(crate) const HEADER_OP_COUNT_OFFSET: u64 = 4 + 1 + 8;

const HEADER_MAGIC: u32 = 0x544C_4F47; // "TLOG"
const HEADER_VERSION: u8 = 1;

pub(crate) const TRANSLOG_FILE_PREFIX: &str = "translog-";
pub(crate) const TRANSLOG_FILE_SUFFIX: &str = ".tlog";

/// File name of a generation, e.g. `translog-3.tlog`.
pub(crate) fn file_name(generation: u64) -> String {
    format!("{TRANSLOG_FILE_PREFIX}{generation}{TRANSLOG_FILE_SUFFIX}")
}

/// Extracts the generation id from a translog file name. Accepts both the
/// live `.tlog` suffix and the `.recovering` suffix left behind by older
/// recovery code, as well as bare `translog-<n>` names.
pub(crate) fn parse_generation(name: &str) -> Option<u64> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"^translog-(\d+)(\.recovering|\.tlog)?$").unwrap());
    pattern
        .captures(name)
        .and_then(|captures| captures.get(1))
        .and_then(|digits| digits.as_str().parse().ok())
}

pub(crate) fn encode_header(generation: u64) -> [u8; HEADER_SIZE as usize] {
    let mut buf = [0u8; HEADER_SIZE as usize];
    buf[0..4].copy_from_slice(&HEADER_MAGIC.to_be_bytes());
    buf[4] = HEADER_VERSION;
    buf[5..13].copy_from_slice(&(generation as i64).to_be_bytes());
    buf[13..17].copy_from_slice(&(-1i32).to_be_bytes());
    buf
}

/// Immutable reader over one generation file.
pub struct TranslogReader {
    channel: Arc<ChannelRef>,
    generation: u64,
    /// Byte bound of the record stream; a reader produced from a live writer
    /// is pinned to the writer's length at creation time.
    length: u64,
    total_ops: Option<usize>,
}

impl Clone for TranslogReader {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
            generation: self.generation,
            length: self.length,
            total_ops: self.total_ops,
        }
    }
}

impl TranslogReader {
    /// Opens a generation file that already exists on disk, validating its
    /// header. `checkpoint_ops` supplies the operation count when the header
    /// slot was never sealed (e.g. the process died with the file active).
    pub(crate) fn open(
        channel: Arc<ChannelRef>,
        checkpoint_ops: Option<usize>,
    ) -> TranslogResult<Self> {
        let path = channel.path();
        let length = channel
            .file()
            .metadata()
            .map_err(|e| TranslogError::io(path, e))?
            .len();
        if length < HEADER_SIZE {
            return Err(TranslogError::Corrupted(format!(
                "translog file {} is shorter than its header",
                path.display()
            )));
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        channel
            .file()
            .read_exact_at(&mut header, 0)
            .map_err(|e| TranslogError::io(path, e))?;

        let magic = u32::from_be_bytes(header[0..4].try_into().unwrap());
        if magic != HEADER_MAGIC {
            return Err(TranslogError::Corrupted(format!(
                "translog file {} has bad magic 0x{magic:x}",
                path.display()
            )));
        }
        let version = header[4];
        if version != HEADER_VERSION {
            return Err(TranslogError::Corrupted(format!(
                "unsupported translog file version [{version}] in {}",
                path.display()
            )));
        }
        let header_gen = i64::from_be_bytes(header[5..13].try_into().unwrap());
        if header_gen < 0 || header_gen as u64 != channel.generation() {
            return Err(TranslogError::Corrupted(format!(
                "translog file {} names generation {header_gen} but its file name says {}",
                path.display(),
                channel.generation()
            )));
        }
        let sealed_ops = i32::from_be_bytes(header[13..17].try_into().unwrap());
        let total_ops = usize::try_from(sealed_ops).ok().or(checkpoint_ops);

        Ok(Self {
            generation: channel.generation(),
            channel,
            length,
            total_ops,
        })
    }

    /// Builds a reader over the flushed prefix of a live writer's channel.
    pub(crate) fn from_writer(
        channel: Arc<ChannelRef>,
        generation: u64,
        length: u64,
        total_ops: usize,
    ) -> Self {
        Self {
            channel,
            generation,
            length,
            total_ops: Some(total_ops),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.length
    }

    /// Number of operations in this generation, when known.
    pub fn total_operations(&self) -> Option<usize> {
        self.total_ops
    }

    /// Random read of the record at `location`. Bit-exact for any location
    /// the writer of this generation returned.
    pub fn read(&self, location: &Location) -> TranslogResult<Operation> {
        if location.generation != self.generation {
            return Err(TranslogError::InvalidLocation(*location));
        }
        if location.offset < HEADER_SIZE || location.end_offset() > self.length {
            return Err(TranslogError::IllegalState(format!(
                "read requested at {location} but generation {} spans [{}, {})",
                self.generation, HEADER_SIZE, self.length
            )));
        }
        let mut frame = vec![0u8; location.size as usize];
        self.channel
            .file()
            .read_exact_at(&mut frame, location.offset)
            .map_err(|e| TranslogError::io(self.channel.path(), e))?;
        decode_operation(&frame)
    }

    /// Sequential cursor over every record in this generation, in append
    /// order. The cursor keeps the channel alive independently of the
    /// reader.
    pub fn channel_snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            channel: Arc::clone(&self.channel),
            position: HEADER_SIZE,
            length: self.length,
            total_ops: self.total_ops,
        }
    }
}

impl std::fmt::Debug for TranslogReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslogReader")
            .field("generation", &self.generation)
            .field("length", &self.length)
            .field("total_ops", &self.total_ops)
            .finish()
    }
}

/// Forward-only cursor over one generation's record stream.
pub struct ChannelSnapshot {
    channel: Arc<ChannelRef>,
    position: u64,
    length: u64,
    total_ops: Option<usize>,
}

impl ChannelSnapshot {
    /// Operation count estimate for this generation, when known.
    pub fn estimated_total_operations(&self) -> Option<usize> {
        self.total_ops
    }

    /// Decodes the next record, or `None` at the end of the stream. A record
    /// that ends past the stream bound is a torn tail and surfaces as
    /// [`TranslogError::Truncated`].
    pub fn next(&mut self) -> TranslogResult<Option<Operation>> {
        if self.position >= self.length {
            return Ok(None);
        }
        let remaining = self.length - self.position;
        if remaining < 4 {
            return Err(TranslogError::Truncated(format!(
                "{} trailing bytes at offset {} in {}",
                remaining,
                self.position,
                self.channel.path().display()
            )));
        }

        let mut size_buf = [0u8; 4];
        self.channel
            .file()
            .read_exact_at(&mut size_buf, self.position)
            .map_err(|e| TranslogError::io(self.channel.path(), e))?;
        let size = i32::from_be_bytes(size_buf);
        if size < 5 {
            return Err(TranslogError::Corrupted(format!(
                "invalid record size [{size}] at offset {} in {}",
                self.position,
                self.channel.path().display()
            )));
        }
        let frame_len = 4 + size as u64;
        if frame_len > remaining {
            return Err(TranslogError::Truncated(format!(
                "record at offset {} wants {} bytes but only {} remain in {}",
                self.position,
                frame_len,
                remaining,
                self.channel.path().display()
            )));
        }

        let mut frame = vec![0u8; frame_len as usize];
        self.channel
            .file()
            .read_exact_at(&mut frame, self.position)
            .map_err(|e| TranslogError::io(self.channel.path(), e))?;
        let op = decode_operation(&frame)?;
        self.position += frame_len;
        Ok(Some(op))
    }
}
