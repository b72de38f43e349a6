//! The checkpoint file: a small pointer naming the generation to open on a
//! clean restart.
//!
//! Layout (all big-endian): `magic: u32 | version: u8 | generation: i64 |
//! num_ops: i32` with `-1` meaning the operation count is unknown. The file
//! is rewritten through a temp file + rename so a crash mid-write leaves the
//! previous checkpoint intact.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use crate::errors::{TranslogError, TranslogResult};

/// Fixed checkpoint file name inside the translog directory.
pub const CHECKPOINT_FILE_NAME: &str = "translog.ckp";

const CHECKPOINT_MAGIC: u32 = 0x434B_5054; // "CKPT"
const CHECKPOINT_VERSION: u8 = 1;
const CHECKPOINT_SIZE: usize = 4 + 1 + 8 + 4;

/// Contents of `translog.ckp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    /// Generation to open on restart.
    pub generation: u64,
    /// Operation count of that generation when the checkpoint was written,
    /// if known.
    pub num_ops: Option<usize>,
}

impl Checkpoint {
    pub fn new(generation: u64, num_ops: Option<usize>) -> Self {
        Self {
            generation,
            num_ops,
        }
    }

    /// Reads the checkpoint from `dir`, returning `None` when no checkpoint
    /// file exists.
    pub fn read(dir: &Path) -> TranslogResult<Option<Checkpoint>> {
        let path = dir.join(CHECKPOINT_FILE_NAME);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TranslogError::io(&path, e)),
        };

        let mut buf = [0u8; CHECKPOINT_SIZE];
        file.read_exact(&mut buf).map_err(|_| {
            TranslogError::Corrupted(format!("checkpoint file {} is too short", path.display()))
        })?;

        let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if magic != CHECKPOINT_MAGIC {
            return Err(TranslogError::Corrupted(format!(
                "checkpoint file {} has bad magic 0x{magic:x}",
                path.display()
            )));
        }
        let version = buf[4];
        if version != CHECKPOINT_VERSION {
            return Err(TranslogError::Corrupted(format!(
                "unsupported checkpoint version [{version}]"
            )));
        }
        let generation = i64::from_be_bytes(buf[5..13].try_into().unwrap());
        if generation < 1 {
            return Err(TranslogError::Corrupted(format!(
                "checkpoint names invalid generation [{generation}]"
            )));
        }
        let num_ops = i32::from_be_bytes(buf[13..17].try_into().unwrap());
        Ok(Some(Checkpoint {
            generation: generation as u64,
            num_ops: usize::try_from(num_ops).ok(),
        }))
    }

    /// Atomically replaces the checkpoint in `dir` with this one.
    pub fn write(&self, dir: &Path) -> TranslogResult<()> {
        let mut buf = Vec::with_capacity(CHECKPOINT_SIZE);
        buf.extend_from_slice(&CHECKPOINT_MAGIC.to_be_bytes());
        buf.push(CHECKPOINT_VERSION);
        buf.extend_from_slice(&(self.generation as i64).to_be_bytes());
        let num_ops = match self.num_ops {
            Some(ops) => i32::try_from(ops).unwrap_or(i32::MAX),
            None => -1,
        };
        buf.extend_from_slice(&num_ops.to_be_bytes());

        let tmp_path = dir.join(format!("{CHECKPOINT_FILE_NAME}.tmp"));
        let path = dir.join(CHECKPOINT_FILE_NAME);
        {
            let mut tmp = File::create(&tmp_path).map_err(|e| TranslogError::io(&tmp_path, e))?;
            tmp.write_all(&buf)
                .map_err(|e| TranslogError::io(&tmp_path, e))?;
            tmp.sync_all().map_err(|e| TranslogError::io(&tmp_path, e))?;
        }
        fs::rename(&tmp_path, &path).map_err(|e| TranslogError::io(&path, e))?;

        // The rename itself must survive a crash.
        let dir_handle = OpenOptions::new()
            .read(true)
            .open(dir)
            .map_err(|e| TranslogError::io(dir, e))?;
        dir_handle
            .sync_all()
            .map_err(|e| TranslogError::io(dir, e))?;
        Ok(())
    }
}
