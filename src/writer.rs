//! The active generation writer.
//!
//! One writer exists per translog at a time. Appends land in an in-memory
//! buffer (or go straight through for the simple type) and are fsynced
//! according to the durability policy. The writer's channel is shared with
//! any readers produced from it, so the file outlives the writer after a
//! roll.
//!
//! Buffering never splits a record: a frame is either entirely in the buffer
//! or entirely in the file, which lets `read` serve any returned location
//! without flushing.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::channel::{ChannelRef, OnRelease};
use crate::errors::{TranslogError, TranslogResult};
use crate::location::Location;
use crate::op::{decode_operation, Operation};
use crate::reader::{encode_header, TranslogReader, HEADER_OP_COUNT_OFFSET, HEADER_SIZE};

/// How appended bytes reach the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriterType {
    /// Every append is written through to the file immediately.
    Simple,
    /// Appends accumulate in a byte buffer that is flushed when full.
    #[default]
    Buffered,
}

impl WriterType {
    /// Case-insensitive parse; `None` for unrecognized values.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "simple" => Some(WriterType::Simple),
            "buffered" => Some(WriterType::Buffered),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            WriterType::Simple => "simple",
            WriterType::Buffered => "buffered",
        }
    }
}

struct WriterInner {
    /// Pending bytes not yet written to the file.
    buffer: Vec<u8>,
    /// Flush threshold; zero means write-through.
    buffer_limit: usize,
    /// Next append offset, counting buffered bytes.
    written: u64,
    /// Bytes actually handed to the file.
    flushed: u64,
    /// Highest offset known to be fsynced.
    synced: u64,
    ops: usize,
    /// Set when a file write may have landed partially; the writer refuses
    /// all further work.
    tragic: bool,
}

/// Append handle for the current generation.
pub struct TranslogWriter {
    channel: Arc<ChannelRef>,
    generation: u64,
    inner: Mutex<WriterInner>,
}

impl TranslogWriter {
    /// Creates the generation file, writes its header, and fsyncs both the
    /// file and the containing directory.
    pub(crate) fn create(
        writer_type: WriterType,
        generation: u64,
        path: &Path,
        buffer_size: usize,
        on_release: Option<OnRelease>,
    ) -> TranslogResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| TranslogError::io(path, e))?;

        let header = encode_header(generation);
        file.write_all_at(&header, 0)
            .map_err(|e| TranslogError::io(path, e))?;
        file.sync_all().map_err(|e| TranslogError::io(path, e))?;
        if let Some(dir) = path.parent() {
            fsync_dir(dir)?;
        }

        let buffer_limit = match writer_type {
            WriterType::Simple => 0,
            WriterType::Buffered => buffer_size,
        };
        Ok(Self {
            channel: Arc::new(ChannelRef::new(path.to_path_buf(), generation, file, on_release)),
            generation,
            inner: Mutex::new(WriterInner {
                buffer: Vec::with_capacity(buffer_limit),
                buffer_limit,
                written: HEADER_SIZE,
                flushed: HEADER_SIZE,
                synced: HEADER_SIZE,
                ops: 0,
                tragic: false,
            }),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Appends one encoded record frame and returns its location. The
    /// location is valid before any fsync; durability is the caller's
    /// policy. Thread-safe; concurrent appends serialize on the writer's
    /// buffer and never interleave bytes.
    pub fn append(&self, data: &[u8]) -> TranslogResult<Location> {
        let mut inner = self.inner.lock().unwrap();
        self.ensure_intact(&inner)?;

        let offset = inner.written;
        if inner.buffer.len() + data.len() > inner.buffer_limit {
            self.flush_locked(&mut inner)?;
        }
        if data.len() >= inner.buffer_limit {
            // Too large to buffer (or write-through): straight to the file.
            self.write_file(&mut inner, data)?;
        } else {
            inner.buffer.extend_from_slice(data);
        }
        inner.written += data.len() as u64;
        inner.ops += 1;

        let location = Location::new(self.generation, offset, data.len() as u32);
        debug_assert_eq!(
            self.frame_at(&inner, &location).ok().as_deref(),
            Some(data),
            "appended bytes must be readable at their location"
        );
        Ok(location)
    }

    /// Flushes and fsyncs everything appended so far. Idempotent.
    pub fn sync(&self) -> TranslogResult<()> {
        let mut inner = self.inner.lock().unwrap();
        self.sync_locked(&mut inner)
    }

    /// Syncs iff `offset` is not yet durable; returns whether a sync ran.
    pub fn sync_up_to(&self, offset: u64) -> TranslogResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.synced < offset {
            self.sync_locked(&mut inner)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// True iff bytes have been appended that are not yet fsynced.
    pub fn sync_needed(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.written > inner.synced
    }

    /// Reads back the record at a location previously returned by this
    /// writer, whether it is still buffered or already in the file.
    pub fn read(&self, location: &Location) -> TranslogResult<Operation> {
        let inner = self.inner.lock().unwrap();
        let frame = self.frame_at(&inner, location)?;
        decode_operation(&frame)
    }

    /// Produces an immutable reader over everything appended so far. The
    /// buffer is flushed first so the reader can serve file reads; the
    /// reader shares (and keeps alive) this writer's channel.
    pub fn immutable_reader(&self) -> TranslogResult<TranslogReader> {
        let mut inner = self.inner.lock().unwrap();
        self.flush_locked(&mut inner)?;
        Ok(TranslogReader::from_writer(
            Arc::clone(&self.channel),
            self.generation,
            inner.written,
            inner.ops,
        ))
    }

    /// Seals the file when this generation is rolled: flushes, patches the
    /// final operation count into the header slot, and fsyncs. A file that
    /// was never sealed reports an unknown count after a cold open.
    pub(crate) fn seal(&self) -> TranslogResult<()> {
        let mut inner = self.inner.lock().unwrap();
        self.flush_locked(&mut inner)?;
        let count = i32::try_from(inner.ops).unwrap_or(i32::MAX);
        self.channel
            .file()
            .write_all_at(&count.to_be_bytes(), HEADER_OP_COUNT_OFFSET)
            .map_err(|e| TranslogError::io(self.channel.path(), e))?;
        self.channel
            .file()
            .sync_all()
            .map_err(|e| TranslogError::io(self.channel.path(), e))?;
        inner.synced = inner.written;
        Ok(())
    }

    /// Flushes the buffer and applies a new flush threshold.
    pub fn update_buffer_size(&self, buffer_size: usize) -> TranslogResult<()> {
        let mut inner = self.inner.lock().unwrap();
        self.flush_locked(&mut inner)?;
        if inner.buffer_limit > 0 {
            inner.buffer_limit = buffer_size;
        }
        Ok(())
    }

    /// True once a file write may have landed partially; the owning
    /// translog closes itself when it observes this.
    pub(crate) fn is_failed(&self) -> bool {
        self.inner.lock().unwrap().tragic
    }

    pub fn total_operations(&self) -> usize {
        self.inner.lock().unwrap().ops
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.inner.lock().unwrap().written
    }

    fn ensure_intact(&self, inner: &WriterInner) -> TranslogResult<()> {
        if inner.tragic {
            return Err(TranslogError::IllegalState(format!(
                "translog writer for generation {} has failed and was closed",
                self.generation
            )));
        }
        Ok(())
    }

    fn write_file(&self, inner: &mut WriterInner, data: &[u8]) -> TranslogResult<()> {
        if let Err(e) = self.channel.file().write_all_at(data, inner.flushed) {
            // The write may have landed partially; nothing appended after
            // this point can be trusted.
            inner.tragic = true;
            return Err(TranslogError::io(self.channel.path(), e));
        }
        inner.flushed += data.len() as u64;
        Ok(())
    }

    fn flush_locked(&self, inner: &mut WriterInner) -> TranslogResult<()> {
        self.ensure_intact(inner)?;
        if inner.buffer.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut inner.buffer);
        self.write_file(inner, &pending)?;
        inner.buffer = pending;
        inner.buffer.clear();
        Ok(())
    }

    fn sync_locked(&self, inner: &mut WriterInner) -> TranslogResult<()> {
        if inner.synced >= inner.written {
            return Ok(());
        }
        self.flush_locked(inner)?;
        self.channel
            .file()
            .sync_all()
            .map_err(|e| TranslogError::io(self.channel.path(), e))?;
        inner.synced = inner.written;
        Ok(())
    }

    /// Raw frame bytes at a location, from the buffer or the file.
    fn frame_at(&self, inner: &WriterInner, location: &Location) -> TranslogResult<Vec<u8>> {
        if location.generation != self.generation {
            return Err(TranslogError::InvalidLocation(*location));
        }
        if location.offset < HEADER_SIZE || location.end_offset() > inner.written {
            return Err(TranslogError::IllegalState(format!(
                "read requested at {location} but generation {} spans [{}, {})",
                self.generation, HEADER_SIZE, inner.written
            )));
        }
        if location.offset >= inner.flushed {
            let start = (location.offset - inner.flushed) as usize;
            let end = start + location.size as usize;
            return Ok(inner.buffer[start..end].to_vec());
        }
        let mut frame = vec![0u8; location.size as usize];
        self.channel
            .file()
            .read_exact_at(&mut frame, location.offset)
            .map_err(|e| TranslogError::io(self.channel.path(), e))?;
        Ok(frame)
    }
}

impl std::fmt::Debug for TranslogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslogWriter")
            .field("generation", &self.generation)
            .finish()
    }
}

fn fsync_dir(dir: &Path) -> TranslogResult<()> {
    let handle = OpenOptions::new()
        .read(true)
        .open(dir)
        .map_err(|e| TranslogError::io(dir, e))?;
    handle.sync_all().map_err(|e| TranslogError::io(dir, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{encode_operation, Delete, Index, Operation};
    use crate::reader::file_name;
    use std::fs::File;
    use tempfile::TempDir;

    fn new_writer(dir: &Path, writer_type: WriterType, buffer_size: usize) -> TranslogWriter {
        TranslogWriter::create(
            writer_type,
            1,
            &dir.join(file_name(1)),
            buffer_size,
            None,
        )
        .unwrap()
    }

    fn index_frame(id: &str) -> (Operation, Vec<u8>) {
        let op = Operation::Index(Index::new("doc", id, format!("src-{id}").into_bytes()));
        let frame = encode_operation(&op);
        (op, frame)
    }

    #[test]
    fn test_create_writes_header() {
        let dir = TempDir::new().unwrap();
        let writer = new_writer(dir.path(), WriterType::Buffered, 4096);

        assert_eq!(writer.size_in_bytes(), HEADER_SIZE);
        assert_eq!(writer.total_operations(), 0);
        let on_disk = std::fs::metadata(dir.path().join(file_name(1))).unwrap().len();
        assert_eq!(on_disk, HEADER_SIZE);
    }

    #[test]
    fn test_append_returns_contiguous_locations() {
        let dir = TempDir::new().unwrap();
        let writer = new_writer(dir.path(), WriterType::Buffered, 4096);

        let (_, frame_a) = index_frame("a");
        let (_, frame_b) = index_frame("b");
        let loc_a = writer.append(&frame_a).unwrap();
        let loc_b = writer.append(&frame_b).unwrap();

        assert_eq!(loc_a.offset, HEADER_SIZE);
        assert_eq!(loc_b.offset, loc_a.end_offset());
        assert_eq!(writer.total_operations(), 2);
    }

    #[test]
    fn test_read_from_buffer_and_file() {
        let dir = TempDir::new().unwrap();
        let writer = new_writer(dir.path(), WriterType::Buffered, 64 * 1024);

        let (op_a, frame_a) = index_frame("a");
        let loc_a = writer.append(&frame_a).unwrap();

        // Still buffered.
        assert_eq!(writer.read(&loc_a).unwrap(), op_a);

        // After a sync it comes from the file.
        writer.sync().unwrap();
        assert_eq!(writer.read(&loc_a).unwrap(), op_a);
    }

    #[test]
    fn test_simple_type_writes_through() {
        let dir = TempDir::new().unwrap();
        let writer = new_writer(dir.path(), WriterType::Simple, 4096);

        let (op, frame) = index_frame("a");
        let loc = writer.append(&frame).unwrap();

        // Bytes reach the file without a sync.
        let on_disk = std::fs::metadata(dir.path().join(file_name(1))).unwrap().len();
        assert_eq!(on_disk, HEADER_SIZE + frame.len() as u64);
        assert_eq!(writer.read(&loc).unwrap(), op);
    }

    #[test]
    fn test_buffer_flushes_when_full() {
        let dir = TempDir::new().unwrap();
        let (_, probe) = index_frame("a");
        // Room for roughly two frames before the flush threshold.
        let writer = new_writer(dir.path(), WriterType::Buffered, probe.len() * 2 + 1);

        for id in ["a", "b", "c"] {
            let (_, frame) = index_frame(id);
            writer.append(&frame).unwrap();
        }
        let on_disk = std::fs::metadata(dir.path().join(file_name(1))).unwrap().len();
        assert!(on_disk > HEADER_SIZE, "an overflowing buffer must flush");
        assert!(writer.sync_needed());
    }

    #[test]
    fn test_record_larger_than_buffer_goes_direct() {
        let dir = TempDir::new().unwrap();
        let writer = new_writer(dir.path(), WriterType::Buffered, 16);

        let op = Operation::Index(Index::new("doc", "big", vec![0xab; 512]));
        let frame = encode_operation(&op);
        let loc = writer.append(&frame).unwrap();
        assert_eq!(writer.read(&loc).unwrap(), op);
    }

    #[test]
    fn test_sync_tracking() {
        let dir = TempDir::new().unwrap();
        let writer = new_writer(dir.path(), WriterType::Buffered, 4096);
        assert!(!writer.sync_needed());

        let (_, frame) = index_frame("a");
        let loc = writer.append(&frame).unwrap();
        assert!(writer.sync_needed());

        assert!(writer.sync_up_to(loc.end_offset()).unwrap());
        assert!(!writer.sync_needed());
        // Already durable: no second sync.
        assert!(!writer.sync_up_to(loc.end_offset()).unwrap());
    }

    #[test]
    fn test_immutable_reader_pins_length() {
        let dir = TempDir::new().unwrap();
        let writer = new_writer(dir.path(), WriterType::Buffered, 4096);

        let (op_a, frame_a) = index_frame("a");
        let loc_a = writer.append(&frame_a).unwrap();
        let reader = writer.immutable_reader().unwrap();

        // Later appends are invisible to the pinned reader.
        let (_, frame_b) = index_frame("b");
        writer.append(&frame_b).unwrap();

        assert_eq!(reader.total_operations(), Some(1));
        assert_eq!(reader.size_in_bytes(), loc_a.end_offset());
        assert_eq!(reader.read(&loc_a).unwrap(), op_a);

        let mut cursor = reader.channel_snapshot();
        assert_eq!(cursor.next().unwrap(), Some(op_a));
        assert_eq!(cursor.next().unwrap(), None);
    }

    #[test]
    fn test_seal_patches_header_op_count() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(file_name(1));
        let writer = new_writer(dir.path(), WriterType::Buffered, 4096);

        for id in ["a", "b"] {
            let (_, frame) = index_frame(id);
            writer.append(&frame).unwrap();
        }
        writer.seal().unwrap();
        drop(writer);

        let channel = Arc::new(ChannelRef::new(
            path.clone(),
            1,
            File::open(&path).unwrap(),
            None,
        ));
        let reader = TranslogReader::open(channel, None).unwrap();
        assert_eq!(reader.total_operations(), Some(2));
    }

    #[test]
    fn test_unsealed_file_has_unknown_op_count() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(file_name(1));
        let writer = new_writer(dir.path(), WriterType::Buffered, 4096);

        let (_, frame) = index_frame("a");
        writer.append(&frame).unwrap();
        writer.sync().unwrap();
        drop(writer);

        let channel = Arc::new(ChannelRef::new(
            path.clone(),
            1,
            File::open(&path).unwrap(),
            None,
        ));
        let reader = TranslogReader::open(channel, None).unwrap();
        assert_eq!(reader.total_operations(), None);

        // The checkpoint count stands in when the header slot is unsealed.
        let channel = Arc::new(ChannelRef::new(
            path.clone(),
            1,
            File::open(&path).unwrap(),
            None,
        ));
        let reader = TranslogReader::open(channel, Some(1)).unwrap();
        assert_eq!(reader.total_operations(), Some(1));
    }

    #[test]
    fn test_torn_tail_surfaces_as_truncation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(file_name(1));
        let writer = new_writer(dir.path(), WriterType::Buffered, 4096);

        let (op_a, frame_a) = index_frame("a");
        let (_, frame_b) = index_frame("b");
        writer.append(&frame_a).unwrap();
        writer.append(&frame_b).unwrap();
        writer.sync().unwrap();
        drop(writer);

        // Tear the last two bytes off the tail record.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 2).unwrap();
        drop(file);

        let channel = Arc::new(ChannelRef::new(
            path.clone(),
            1,
            File::open(&path).unwrap(),
            None,
        ));
        let reader = TranslogReader::open(channel, None).unwrap();
        let mut cursor = reader.channel_snapshot();
        assert_eq!(cursor.next().unwrap(), Some(op_a));
        assert!(matches!(
            cursor.next(),
            Err(TranslogError::Truncated(_))
        ));
    }

    #[test]
    fn test_flipped_payload_bit_surfaces_as_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(file_name(1));
        let writer = new_writer(dir.path(), WriterType::Buffered, 4096);

        let (_, frame) = index_frame("a");
        let loc = writer.append(&frame).unwrap();
        writer.sync().unwrap();
        drop(writer);

        // Flip one payload bit past the size prefix.
        let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let mut byte = [0u8; 1];
        file.read_exact_at(&mut byte, loc.offset + 6).unwrap();
        byte[0] ^= 0x01;
        file.write_all_at(&byte, loc.offset + 6).unwrap();
        drop(file);

        let channel = Arc::new(ChannelRef::new(
            path.clone(),
            1,
            File::open(&path).unwrap(),
            None,
        ));
        let reader = TranslogReader::open(channel, None).unwrap();
        let mut cursor = reader.channel_snapshot();
        assert!(matches!(
            cursor.next(),
            Err(TranslogError::Corrupted(_))
        ));
    }

    #[test]
    fn test_mixed_operations_iterate_in_order() {
        let dir = TempDir::new().unwrap();
        let writer = new_writer(dir.path(), WriterType::Buffered, 4096);

        let ops = vec![
            Operation::Index(Index::new("doc", "a", vec![1])),
            Operation::Delete(Delete::new("_uid", "doc#a")),
            Operation::Index(Index::new("doc", "b", vec![2])),
        ];
        for op in &ops {
            writer.append(&encode_operation(op)).unwrap();
        }

        let reader = writer.immutable_reader().unwrap();
        let mut cursor = reader.channel_snapshot();
        for op in &ops {
            assert_eq!(cursor.next().unwrap().as_ref(), Some(op));
        }
        assert_eq!(cursor.next().unwrap(), None);
    }

    #[test]
    fn test_update_buffer_size_flushes() {
        let dir = TempDir::new().unwrap();
        let writer = new_writer(dir.path(), WriterType::Buffered, 64 * 1024);

        let (_, frame) = index_frame("a");
        writer.append(&frame).unwrap();
        writer.update_buffer_size(1024).unwrap();

        let on_disk = std::fs::metadata(dir.path().join(file_name(1))).unwrap().len();
        assert_eq!(on_disk, HEADER_SIZE + frame.len() as u64);
    }

    #[test]
    fn test_concurrent_appends_do_not_overlap() {
        use std::thread;

        let dir = TempDir::new().unwrap();
        let writer = Arc::new(new_writer(dir.path(), WriterType::Buffered, 512));

        let mut handles = Vec::new();
        for t in 0..4 {
            let writer = Arc::clone(&writer);
            handles.push(thread::spawn(move || {
                let mut locations = Vec::new();
                for i in 0..50 {
                    let (_, frame) = index_frame(&format!("t{t}-{i}"));
                    locations.push((writer.append(&frame).unwrap(), frame.len()));
                }
                locations
            }));
        }

        let mut all: Vec<(Location, usize)> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        all.sort_by_key(|(loc, _)| loc.offset);

        let mut expected = HEADER_SIZE;
        for (loc, len) in all {
            assert_eq!(loc.offset, expected, "locations must not alias or gap");
            assert_eq!(loc.size as usize, len);
            expected = loc.end_offset();
        }
        assert_eq!(writer.total_operations(), 200);
    }
}
