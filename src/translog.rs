//! The translog manager: generation lifecycle, recovery, the commit
//! protocol, and durability scheduling.
//!
//! Structure changes (rolls, commits, close, file deletion) take the write
//! half of the reader/writer lock; appends, reads, syncs, snapshots and
//! views share the read half. The writer serializes its own buffer, so many
//! appenders proceed concurrently under the shared lock.
//!
//! Lock discipline: channel release hooks acquire the write lock to delete
//! files, so no channel reference may be dropped while the lock is held.
//! Code paths that retire writers or readers move them out of the state
//! under the lock and drop them after releasing it.

use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::channel::{ChannelRef, OnRelease};
use crate::checkpoint::Checkpoint;
use crate::config::{
    Settings, TranslogConfig, INDEX_TRANSLOG_DURABILITY, INDEX_TRANSLOG_FS_TYPE,
};
use crate::errors::{TranslogError, TranslogResult};
use crate::location::Location;
use crate::op::{encode_operation, Operation};
use crate::reader::{file_name, parse_generation, TranslogReader};
use crate::scheduler::{ScheduledHandle, TaskScheduler};
use crate::snapshot::TranslogSnapshot;
use crate::view::{View, ViewRegistry};
use crate::writer::{TranslogWriter, WriterType};

/// Commit user-data key under which engines stamp the committed generation
/// id, so an `Open` start can pick the right file.
pub const TRANSLOG_ID_KEY: &str = "translog_id";

/// How an existing (or fresh) translog directory is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Wipe the directory and start at generation 1.
    Create,
    /// Scan the directory; every found generation is replayable.
    Recover,
    /// Strict: open exactly the generation the checkpoint names.
    Open,
}

/// When appended operations become durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// Fsync before every `add` returns.
    #[default]
    Request,
    /// Fsync on a timer; a crash may lose the tail.
    Async,
}

impl Durability {
    /// Case-insensitive parse; `None` for unrecognized values.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "request" => Some(Durability::Request),
            "async" => Some(Durability::Async),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Durability::Request => "request",
            Durability::Async => "async",
        }
    }
}

/// Operation count and byte size of the uncommitted tail of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslogStats {
    pub operations: usize,
    pub size_in_bytes: u64,
}

struct TranslogState {
    current: Option<TranslogWriter>,
    /// The previous current generation, between prepare and commit.
    committing: Option<TranslogReader>,
    /// Generations found on disk at open, ordered by generation. Replayed
    /// via snapshots only; dropped wholesale by the first commit.
    recovered: Vec<TranslogReader>,
    /// Retention watermark: generations below this are deletable once
    /// unreferenced. `None` retains everything.
    last_committed: Option<u64>,
    durability: Durability,
    writer_type: WriterType,
    buffer_size: usize,
}

pub(crate) struct TranslogCore {
    path: PathBuf,
    state: RwLock<TranslogState>,
    views: Arc<ViewRegistry>,
    closed: AtomicBool,
    scheduler: Option<Arc<dyn TaskScheduler>>,
    sync_interval: Duration,
    sync_task: Mutex<Option<ScheduledHandle>>,
}

impl TranslogCore {
    fn sync_needed(&self) -> bool {
        let state = self.state.read().unwrap();
        state
            .current
            .as_ref()
            .map(TranslogWriter::sync_needed)
            .unwrap_or(false)
    }

    fn sync(&self) -> TranslogResult<()> {
        let state = self.state.read().unwrap();
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        match &state.current {
            Some(current) => current.sync(),
            None => Ok(()),
        }
    }
}

/// The per-shard write-ahead transaction log.
pub struct Translog {
    core: Arc<TranslogCore>,
}

impl Translog {
    /// Opens a translog at `dir`. With a scheduler and a non-zero sync
    /// interval, a periodic background sync is armed; a zero interval
    /// forces a sync on every operation regardless of durability mode.
    pub fn open(
        mode: OpenMode,
        dir: impl AsRef<Path>,
        config: TranslogConfig,
        scheduler: Option<Arc<dyn TaskScheduler>>,
    ) -> TranslogResult<Translog> {
        let path = dir.as_ref().to_path_buf();
        fs::create_dir_all(&path).map_err(|e| TranslogError::io(&path, e))?;

        let core = Arc::new(TranslogCore {
            path,
            state: RwLock::new(TranslogState {
                current: None,
                committing: None,
                recovered: Vec::new(),
                last_committed: None,
                durability: config.durability,
                writer_type: config.writer_type,
                buffer_size: config.buffer_size,
            }),
            views: ViewRegistry::new(),
            closed: AtomicBool::new(false),
            scheduler,
            sync_interval: config.sync_interval,
            sync_task: Mutex::new(None),
        });

        // Nothing is installed into the shared state until it is fully
        // built, so a failure here drops every opened file without holding
        // the lock.
        let (recovered, current) = match mode {
            OpenMode::Create => {
                fs::remove_dir_all(&core.path).map_err(|e| TranslogError::io(&core.path, e))?;
                fs::create_dir_all(&core.path).map_err(|e| TranslogError::io(&core.path, e))?;
                let current = Self::new_generation(&core, 1, true, &config)?;
                (Vec::new(), current)
            }
            OpenMode::Recover => {
                let (recovered, had_checkpoint) = Self::recover_from_files(&core)?;
                let next_generation = recovered
                    .last()
                    .map(|reader| reader.generation() + 1)
                    .unwrap_or(1)
                    .max(1);
                let current =
                    Self::new_generation(&core, next_generation, !had_checkpoint, &config)?;
                (recovered, current)
            }
            OpenMode::Open => {
                let checkpoint = Checkpoint::read(&core.path)?.ok_or_else(|| {
                    TranslogError::IllegalState(format!(
                        "no checkpoint found in {}",
                        core.path.display()
                    ))
                })?;
                let reader = Self::open_reader(
                    &core,
                    core.path.join(file_name(checkpoint.generation)),
                    checkpoint.num_ops,
                )?;
                let current =
                    Self::new_generation(&core, checkpoint.generation + 1, false, &config)?;
                // Nothing is deletable until the first commit after an
                // `Open` start.
                (vec![reader], current)
            }
        };

        {
            let mut state = core.state.write().unwrap();
            debug!(
                generation = current.generation(),
                recovered = recovered.len(),
                "opened translog at {}",
                core.path.display()
            );
            state.recovered = recovered;
            state.current = Some(current);
        }

        if core.scheduler.is_some() && !core.sync_interval.is_zero() {
            schedule_sync(&core);
        }
        Ok(Translog { core })
    }

    /// Directory holding this shard's translog files.
    pub fn location(&self) -> &Path {
        &self.core.path
    }

    pub fn is_open(&self) -> bool {
        !self.core.closed.load(Ordering::SeqCst)
    }

    /// Generation id of the current writable file.
    pub fn current_generation(&self) -> TranslogResult<u64> {
        let state = self.core.state.read().unwrap();
        Ok(self.current(&state)?.generation())
    }

    pub fn get_durability(&self) -> Durability {
        self.core.state.read().unwrap().durability
    }

    /// Appends an operation and returns its location. Under `Request`
    /// durability the record is fsynced before this returns.
    pub fn add(&self, op: &Operation) -> TranslogResult<Location> {
        let data = encode_operation(op);
        let result = {
            let state = self.core.state.read().unwrap();
            self.current(&state).and_then(|current| {
                let location = current.append(&data)?;
                if state.durability == Durability::Request || self.core.sync_interval.is_zero() {
                    current.sync()?;
                }
                Ok(location)
            })
        };
        result.map_err(|source| {
            // A write that may have landed partially poisons the writer;
            // the whole translog goes down with it.
            let failed = {
                let state = self.core.state.read().unwrap();
                state
                    .current
                    .as_ref()
                    .map(TranslogWriter::is_failed)
                    .unwrap_or(false)
            };
            if failed {
                let _ = self.close();
            }
            TranslogError::OperationRejected {
                op: op.to_string(),
                source: Box::new(source),
            }
        })
    }

    /// Reads the operation at `location`. Only the current and committing
    /// generations are addressable; recovered generations are replayed via
    /// snapshots instead.
    pub fn read(&self, location: &Location) -> TranslogResult<Operation> {
        let state = self.core.state.read().unwrap();
        let current = self.current(&state)?;
        if location.generation == current.generation() {
            return current.read(location);
        }
        if let Some(committing) = &state.committing {
            if location.generation == committing.generation() {
                return committing.read(location);
            }
        }
        Err(TranslogError::InvalidLocation(*location))
    }

    /// Fsyncs everything appended so far. A no-op after close.
    pub fn sync(&self) -> TranslogResult<()> {
        self.core.sync()
    }

    /// True iff appended bytes are not yet fsynced.
    pub fn sync_needed(&self) -> bool {
        self.core.sync_needed()
    }

    /// Syncs iff `location` is not yet durable; returns whether a sync ran.
    /// Locations in rolled generations were synced by the roll.
    pub fn ensure_synced(&self, location: &Location) -> TranslogResult<bool> {
        let state = self.core.state.read().unwrap();
        if let Some(current) = &state.current {
            if location.generation == current.generation() {
                return current.sync_up_to(location.end_offset());
            }
        }
        Ok(false)
    }

    /// Point-in-time iterator over every uncommitted operation: recovered
    /// generations, then the committing one, then the current one.
    pub fn new_snapshot(&self) -> TranslogResult<TranslogSnapshot> {
        let state = self.core.state.read().unwrap();
        let current_reader = self.current(&state)?.immutable_reader()?;
        let readers = state
            .recovered
            .iter()
            .chain(state.committing.iter())
            .chain(std::iter::once(&current_reader));
        Ok(TranslogSnapshot::new(readers))
    }

    /// A retention handle over the committing (if any) and current
    /// generations, updated with every future roll until closed.
    pub fn new_view(&self) -> TranslogResult<View> {
        let state = self.core.state.read().unwrap();
        let mut readers = Vec::new();
        if let Some(committing) = &state.committing {
            readers.push(committing.clone());
        }
        readers.push(self.current(&state)?.immutable_reader()?);
        // Holding the read lock here means no roll can race the
        // registration, so the view cannot miss a generation.
        Ok(self.core.views.register(readers))
    }

    /// Operations not yet committed to the engine (current + committing).
    pub fn total_operations(&self) -> TranslogResult<usize> {
        let state = self.core.state.read().unwrap();
        let mut ops = self.current(&state)?.total_operations();
        if let Some(committing) = &state.committing {
            // Readers rolled from a live writer always know their count.
            ops += committing.total_operations().unwrap_or(0);
        }
        Ok(ops)
    }

    /// Bytes not yet committed to the engine (current + committing).
    pub fn size_in_bytes(&self) -> TranslogResult<u64> {
        let state = self.core.state.read().unwrap();
        let mut size = self.current(&state)?.size_in_bytes();
        if let Some(committing) = &state.committing {
            size += committing.size_in_bytes();
        }
        Ok(size)
    }

    pub fn stats(&self) -> TranslogResult<TranslogStats> {
        // One lock hold so the two numbers describe the same instant.
        let state = self.core.state.read().unwrap();
        let current = self.current(&state)?;
        let mut operations = current.total_operations();
        let mut size_in_bytes = current.size_in_bytes();
        if let Some(committing) = &state.committing {
            operations += committing.total_operations().unwrap_or(0);
            size_in_bytes += committing.size_in_bytes();
        }
        Ok(TranslogStats {
            operations,
            size_in_bytes,
        })
    }

    /// First phase of the commit handshake: rolls the current generation
    /// into the committing slot and starts a fresh one. Fails if a commit
    /// is already in flight.
    pub fn prepare_commit(&self) -> TranslogResult<()> {
        let mut retired: Vec<TranslogWriter> = Vec::new();
        let result = {
            let mut state = self.core.state.write().unwrap();
            self.roll_generation_locked(&mut state, &mut retired)
        };
        drop(retired);
        if result.is_err() {
            // A failed roll leaves the generation chain in doubt.
            let _ = self.close();
        }
        result
    }

    /// Second phase: the engine has durably absorbed everything up to the
    /// prepare point. Recovered generations are dropped and the committing
    /// generation becomes deletable once its last reference goes away.
    pub fn commit(&self) -> TranslogResult<()> {
        let mut retired_writers: Vec<TranslogWriter> = Vec::new();
        let mut retired_readers: Vec<TranslogReader> = Vec::new();
        let result = {
            let mut state = self.core.state.write().unwrap();
            let outcome = (|| {
                if state.committing.is_none() {
                    self.roll_generation_locked(&mut state, &mut retired_writers)?;
                }
                let generation = {
                    let current = self.current(&state)?;
                    current.sync()?;
                    current.generation()
                };
                // The watermark moves to the fresh current generation;
                // everything below it is fair game for deletion.
                state.last_committed = Some(generation);
                Ok(())
            })();
            if outcome.is_ok() {
                retired_readers.extend(state.recovered.drain(..));
                if let Some(committing) = state.committing.take() {
                    retired_readers.push(committing);
                }
            }
            outcome
        };
        // Dropping outside the lock lets release hooks delete files.
        drop(retired_writers);
        drop(retired_readers);
        result
    }

    /// Abandons the uncommitted tail by closing the translog. A caller that
    /// wants to restart afterwards opens a new translog in `Recover` mode.
    pub fn rollback(&self) -> TranslogResult<()> {
        self.close()
    }

    /// Closes the translog: cancels background sync, fsyncs the current
    /// generation, and releases every file. Idempotent.
    pub fn close(&self) -> TranslogResult<()> {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.core.sync_task.lock().unwrap().take() {
            handle.cancel();
        }

        let retired_writer;
        let retired_committing;
        let retired_recovered;
        {
            let mut state = self.core.state.write().unwrap();
            if let Some(current) = &state.current {
                // Flush acknowledged operations so a later `Recover` open
                // replays all of them.
                if let Err(e) = current.sync() {
                    warn!("failed to sync translog on close: {e}");
                }
            }
            retired_writer = state.current.take();
            retired_committing = state.committing.take();
            retired_recovered = std::mem::take(&mut state.recovered);
        }
        drop(retired_writer);
        drop(retired_committing);
        drop(retired_recovered);
        debug!("translog closed at {}", self.core.path.display());
        Ok(())
    }

    /// Flushes and resizes the current writer's buffer.
    pub fn update_buffer(&self, buffer_size: usize) -> TranslogResult<()> {
        let mut state = self.core.state.write().unwrap();
        state.buffer_size = buffer_size;
        match &state.current {
            Some(current) => current.update_buffer_size(buffer_size),
            None => Ok(()),
        }
    }

    /// Applies runtime-updatable settings. Durability changes take effect
    /// on the next `add`; writer-type changes take effect at the next roll.
    pub fn apply_settings(&self, settings: &Settings) {
        let mut state = self.core.state.write().unwrap();
        if let Some(value) = settings.get(INDEX_TRANSLOG_FS_TYPE) {
            match WriterType::parse(value) {
                Some(writer_type) if writer_type != state.writer_type => {
                    info!(
                        "updating translog type from [{}] to [{}]",
                        state.writer_type.name(),
                        writer_type.name()
                    );
                    state.writer_type = writer_type;
                }
                Some(_) => {}
                None => warn!("can't parse [{INDEX_TRANSLOG_FS_TYPE}] value [{value}], keeping [{}]", state.writer_type.name()),
            }
        }
        if let Some(value) = settings.get(INDEX_TRANSLOG_DURABILITY) {
            match Durability::parse(value) {
                Some(durability) if durability != state.durability => {
                    info!(
                        "updating translog durability from [{}] to [{}]",
                        state.durability.name(),
                        durability.name()
                    );
                    state.durability = durability;
                }
                Some(_) => {}
                None => warn!("can't parse [{INDEX_TRANSLOG_DURABILITY}] value [{value}], keeping [{}]", state.durability.name()),
            }
        }
    }

    fn current<'a>(&self, state: &'a TranslogState) -> TranslogResult<&'a TranslogWriter> {
        state.current.as_ref().ok_or(TranslogError::Closed)
    }

    /// Rolls the current generation under the write lock. The retired
    /// writer is pushed onto `retired` so the caller can drop it after the
    /// lock is released; its channel stays alive through the committing
    /// reader either way.
    fn roll_generation_locked(
        &self,
        state: &mut TranslogState,
        retired: &mut Vec<TranslogWriter>,
    ) -> TranslogResult<()> {
        if self.core.closed.load(Ordering::SeqCst) {
            return Err(TranslogError::Closed);
        }
        if let Some(committing) = &state.committing {
            return Err(TranslogError::IllegalState(format!(
                "already committing a translog with generation {}",
                committing.generation()
            )));
        }
        let current = self.current(state)?;

        let committing = current.immutable_reader()?;
        current.seal()?;
        let next_generation = current.generation() + 1;
        let config = TranslogConfig {
            durability: state.durability,
            writer_type: state.writer_type,
            buffer_size: state.buffer_size,
            sync_interval: self.core.sync_interval,
        };
        let new_writer = Self::new_generation_held_lock(
            &self.core,
            next_generation,
            true,
            &config,
            retired,
        )?;
        let view_reader = new_writer.immutable_reader()?;

        // Point of no return: swap the state, then tell the views. The
        // readers handed to each view share channels with the committing
        // slot and the new writer, so their disposal never re-enters the
        // write lock.
        let old_writer = state.current.replace(new_writer);
        state.committing = Some(committing.clone());
        if let Some(old_writer) = old_writer {
            retired.push(old_writer);
        }
        for view in self.core.views.outstanding() {
            view.on_generation_roll(committing.clone(), view_reader.clone());
        }
        trace!(generation = next_generation, "current translog rolled");
        Ok(())
    }

    /// Creates the writer for a new generation and, when asked, points the
    /// checkpoint at it.
    fn new_generation(
        core: &Arc<TranslogCore>,
        generation: u64,
        write_checkpoint: bool,
        config: &TranslogConfig,
    ) -> TranslogResult<TranslogWriter> {
        let mut orphans = Vec::new();
        let result = Self::new_generation_held_lock(
            core,
            generation,
            write_checkpoint,
            config,
            &mut orphans,
        );
        drop(orphans);
        result
    }

    /// Like [`Self::new_generation`], but safe to call under the write
    /// lock: a writer orphaned by a checkpoint failure goes onto `orphans`
    /// instead of being dropped here.
    fn new_generation_held_lock(
        core: &Arc<TranslogCore>,
        generation: u64,
        write_checkpoint: bool,
        config: &TranslogConfig,
        orphans: &mut Vec<TranslogWriter>,
    ) -> TranslogResult<TranslogWriter> {
        let path = core.path.join(file_name(generation));
        let writer = TranslogWriter::create(
            config.writer_type,
            generation,
            &path,
            config.buffer_size,
            Some(release_hook(Arc::downgrade(core))),
        )?;
        if write_checkpoint {
            // The named generation is empty now but grows afterwards, so
            // its operation count is recorded as unknown.
            if let Err(e) = Checkpoint::new(generation, None).write(&core.path) {
                orphans.push(writer);
                return Err(e);
            }
        }
        Ok(writer)
    }

    fn open_reader(
        core: &Arc<TranslogCore>,
        path: PathBuf,
        checkpoint_ops: Option<usize>,
    ) -> TranslogResult<TranslogReader> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        let generation = parse_generation(name).ok_or_else(|| {
            TranslogError::IllegalState(format!(
                "failed to parse generation from file name {}",
                path.display()
            ))
        })?;
        let file = File::open(&path).map_err(|e| TranslogError::io(&path, e))?;
        let channel = Arc::new(ChannelRef::new(
            path,
            generation,
            file,
            Some(release_hook(Arc::downgrade(core))),
        ));
        TranslogReader::open(channel, checkpoint_ops)
    }

    /// Scans the directory for generation files. The checkpoint-named file
    /// is opened first (with its known op count); every other matching file
    /// is opened blind. Returns the readers sorted by generation, plus
    /// whether a usable checkpoint existed.
    fn recover_from_files(
        core: &Arc<TranslogCore>,
    ) -> TranslogResult<(Vec<TranslogReader>, bool)> {
        let mut found: Vec<TranslogReader> = Vec::new();
        let mut checkpoint_file: Option<String> = None;
        let mut had_checkpoint = false;

        match Checkpoint::read(&core.path)? {
            Some(checkpoint) => {
                let name = file_name(checkpoint.generation);
                match Self::open_reader(core, core.path.join(&name), checkpoint.num_ops) {
                    Ok(reader) => {
                        had_checkpoint = true;
                        checkpoint_file = Some(name);
                        found.push(reader);
                    }
                    Err(e) if e.is_not_found() => {
                        warn!(
                            "checkpoint names translog generation {} but {} is missing",
                            checkpoint.generation, name
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
            None => warn!("recovering translog but no checkpoint found"),
        }

        let entries =
            fs::read_dir(&core.path).map_err(|e| TranslogError::io(&core.path, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| TranslogError::io(&core.path, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if checkpoint_file.as_deref() == Some(name) {
                continue;
            }
            if let Some(generation) = parse_generation(name) {
                let reader = Self::open_reader(core, entry.path(), None)?;
                debug!(generation, "found local translog file {name}");
                found.push(reader);
            }
        }
        found.sort_by_key(TranslogReader::generation);
        Ok((found, had_checkpoint))
    }
}

impl Drop for Translog {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Builds the channel release hook: once the last reference to a
/// generation's channel is gone, delete its file if the generation is below
/// the retention watermark. Holds only a weak handle to the manager, so a
/// translog that is already gone leaves files in place for recovery.
fn release_hook(core: Weak<TranslogCore>) -> OnRelease {
    Box::new(move |channel: &ChannelRef| {
        let Some(core) = core.upgrade() else { return };
        let state = core.state.write().unwrap();
        let deletable = state
            .last_committed
            .map_or(false, |watermark| channel.generation() < watermark);
        if deletable {
            trace!(
                generation = channel.generation(),
                "deleting unreferenced translog file {}",
                channel.path().display()
            );
            if let Err(e) = fs::remove_file(channel.path()) {
                if e.kind() != ErrorKind::NotFound {
                    warn!(
                        "failed to delete translog file {}: {e}",
                        channel.path().display()
                    );
                }
            }
        }
    })
}

fn schedule_sync(core: &Arc<TranslogCore>) {
    let Some(scheduler) = core.scheduler.clone() else {
        return;
    };
    let weak = Arc::downgrade(core);
    let handle = scheduler.schedule(core.sync_interval, Box::new(move || sync_tick(weak)));
    *core.sync_task.lock().unwrap() = Some(handle);
}

/// One firing of the periodic sync chain. When a flush is due, the actual
/// fsync hops onto the scheduler's flush executor so the timer path never
/// blocks on I/O; either way the chain re-arms itself until close.
fn sync_tick(weak: Weak<TranslogCore>) {
    let Some(core) = weak.upgrade() else { return };
    if core.closed.load(Ordering::SeqCst) {
        return;
    }
    if core.sync_needed() {
        let Some(scheduler) = core.scheduler.clone() else {
            return;
        };
        drop(core);
        let flush_weak = weak.clone();
        scheduler.execute(Box::new(move || {
            let Some(core) = flush_weak.upgrade() else { return };
            if let Err(e) = core.sync() {
                warn!("failed to sync translog: {e}");
            }
            if !core.closed.load(Ordering::SeqCst) {
                schedule_sync(&core);
            }
        }));
    } else {
        schedule_sync(&core);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{Delete, Index};
    use tempfile::TempDir;

    fn open_default(dir: &Path, mode: OpenMode) -> Translog {
        Translog::open(mode, dir, TranslogConfig::default(), None).unwrap()
    }

    fn index_op(id: &str) -> Operation {
        Operation::Index(Index::new("doc", id, format!("src-{id}").into_bytes()))
    }

    fn snapshot_ids(translog: &Translog) -> Vec<String> {
        let mut snapshot = translog.new_snapshot().unwrap();
        let mut ids = Vec::new();
        while let Some(op) = snapshot.next().unwrap() {
            match op {
                Operation::Index(op) => ids.push(op.id),
                Operation::Create(op) => ids.push(op.id),
                Operation::Delete(op) => ids.push(op.uid_text),
                other => panic!("unexpected operation {other}"),
            }
        }
        ids
    }

    #[test]
    fn test_create_append_read() {
        let dir = TempDir::new().unwrap();
        let translog = open_default(dir.path(), OpenMode::Create);
        assert_eq!(translog.current_generation().unwrap(), 1);

        let op = Operation::Index(Index::new("doc", "a", vec![0x01, 0x02]));
        let location = translog.add(&op).unwrap();
        let read_back = translog.read(&location).unwrap();
        assert_eq!(read_back.source().unwrap().source, &[0x01, 0x02]);
        assert_eq!(translog.total_operations().unwrap(), 1);
    }

    #[test]
    fn test_commit_cycle_deletes_old_generation() {
        let dir = TempDir::new().unwrap();
        let translog = open_default(dir.path(), OpenMode::Create);
        translog.add(&index_op("a")).unwrap();

        translog.prepare_commit().unwrap();
        assert_eq!(translog.current_generation().unwrap(), 2);

        translog
            .add(&Operation::Delete(Delete::new("_uid", "a")))
            .unwrap();
        translog.commit().unwrap();

        assert!(!dir.path().join(file_name(1)).exists());
        assert_eq!(translog.total_operations().unwrap(), 1);
    }

    #[test]
    fn test_recover_replays_operations() {
        let dir = TempDir::new().unwrap();
        {
            let translog = open_default(dir.path(), OpenMode::Create);
            translog.add(&index_op("a")).unwrap();
            translog.close().unwrap();
        }

        let translog = open_default(dir.path(), OpenMode::Recover);
        assert_eq!(translog.current_generation().unwrap(), 2);
        assert_eq!(snapshot_ids(&translog), vec!["a"]);
    }

    #[test]
    fn test_view_survives_prepare() {
        let dir = TempDir::new().unwrap();
        let translog = open_default(dir.path(), OpenMode::Create);

        translog.add(&index_op("op1")).unwrap();
        let view = translog.new_view().unwrap();
        translog.prepare_commit().unwrap();
        translog.add(&index_op("op2")).unwrap();

        let mut ids = Vec::new();
        let mut snapshot = view.snapshot().unwrap();
        while let Some(op) = snapshot.next().unwrap() {
            match op {
                Operation::Index(op) => ids.push(op.id),
                other => panic!("unexpected operation {other}"),
            }
        }
        assert_eq!(ids, vec!["op1", "op2"]);
        assert_eq!(view.min_generation().unwrap(), 1);
    }

    #[test]
    fn test_view_retains_generations_across_commit() {
        let dir = TempDir::new().unwrap();
        let translog = open_default(dir.path(), OpenMode::Create);
        translog.add(&index_op("a")).unwrap();

        let view = translog.new_view().unwrap();
        translog.prepare_commit().unwrap();
        translog.commit().unwrap();

        // The view still pins generation 1 on disk.
        assert!(dir.path().join(file_name(1)).exists());
        view.close();
        assert!(!dir.path().join(file_name(1)).exists());
    }

    #[test]
    fn test_commit_drops_recovered_generations() {
        let dir = TempDir::new().unwrap();
        {
            let translog = open_default(dir.path(), OpenMode::Create);
            translog.add(&index_op("a")).unwrap();
            translog.close().unwrap();
        }

        let translog = open_default(dir.path(), OpenMode::Recover);
        assert!(dir.path().join(file_name(1)).exists());
        translog.add(&index_op("b")).unwrap();
        translog.commit().unwrap();

        assert!(!dir.path().join(file_name(1)).exists());
        assert_eq!(snapshot_ids(&translog), Vec::<String>::new());
    }

    #[test]
    fn test_prepare_twice_is_illegal() {
        let dir = TempDir::new().unwrap();
        let translog = open_default(dir.path(), OpenMode::Create);
        translog.add(&index_op("a")).unwrap();
        translog.prepare_commit().unwrap();

        assert!(matches!(
            translog.prepare_commit(),
            Err(TranslogError::IllegalState(_))
        ));
    }

    #[test]
    fn test_read_from_committing_generation() {
        let dir = TempDir::new().unwrap();
        let translog = open_default(dir.path(), OpenMode::Create);
        let op = index_op("a");
        let location = translog.add(&op).unwrap();

        translog.prepare_commit().unwrap();
        assert_eq!(translog.read(&location).unwrap(), op);

        translog.commit().unwrap();
        assert!(matches!(
            translog.read(&location),
            Err(TranslogError::InvalidLocation(_))
        ));
    }

    #[test]
    fn test_snapshot_spans_committing_and_current() {
        let dir = TempDir::new().unwrap();
        let translog = open_default(dir.path(), OpenMode::Create);
        translog.add(&index_op("a")).unwrap();
        translog.prepare_commit().unwrap();
        translog.add(&index_op("b")).unwrap();

        assert_eq!(snapshot_ids(&translog), vec!["a", "b"]);
    }

    #[test]
    fn test_ensure_synced() {
        let dir = TempDir::new().unwrap();
        let mut config = TranslogConfig::default();
        config.durability = Durability::Async;
        let translog = Translog::open(OpenMode::Create, dir.path(), config, None).unwrap();

        let location = translog.add(&index_op("a")).unwrap();
        assert!(translog.sync_needed());
        assert!(translog.ensure_synced(&location).unwrap());
        assert!(!translog.ensure_synced(&location).unwrap());
        assert!(!translog.sync_needed());
    }

    #[test]
    fn test_request_durability_needs_no_extra_sync() {
        let dir = TempDir::new().unwrap();
        let translog = open_default(dir.path(), OpenMode::Create);
        translog.add(&index_op("a")).unwrap();
        assert!(!translog.sync_needed());
    }

    #[test]
    fn test_stats_track_committing_generation() {
        let dir = TempDir::new().unwrap();
        let translog = open_default(dir.path(), OpenMode::Create);
        translog.add(&index_op("a")).unwrap();
        translog.prepare_commit().unwrap();
        translog.add(&index_op("b")).unwrap();

        let stats = translog.stats().unwrap();
        assert_eq!(stats.operations, 2);
        assert_eq!(stats.size_in_bytes, translog.size_in_bytes().unwrap());

        translog.commit().unwrap();
        assert_eq!(translog.stats().unwrap().operations, 1);
    }

    #[test]
    fn test_stats_serialize_to_json() {
        let stats = TranslogStats {
            operations: 3,
            size_in_bytes: 120,
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["operations"], 3);
        assert_eq!(json["size_in_bytes"], 120);
    }

    #[test]
    fn test_operations_after_close_rejected() {
        let dir = TempDir::new().unwrap();
        let translog = open_default(dir.path(), OpenMode::Create);
        translog.close().unwrap();
        translog.close().unwrap();

        assert!(matches!(
            translog.add(&index_op("a")),
            Err(TranslogError::OperationRejected { .. })
        ));
        assert!(matches!(
            translog.current_generation(),
            Err(TranslogError::Closed)
        ));
        assert!(translog.sync().is_ok());
    }

    #[test]
    fn test_open_mode_requires_checkpoint() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Translog::open(OpenMode::Open, dir.path(), TranslogConfig::default(), None),
            Err(TranslogError::IllegalState(_))
        ));
    }

    #[test]
    fn test_open_mode_opens_checkpoint_generation() {
        let dir = TempDir::new().unwrap();
        {
            let translog = open_default(dir.path(), OpenMode::Create);
            translog.add(&index_op("a")).unwrap();
            // The roll writes a checkpoint naming generation 2.
            translog.prepare_commit().unwrap();
            translog.add(&index_op("b")).unwrap();
            translog.close().unwrap();
        }

        let translog = open_default(dir.path(), OpenMode::Open);
        assert_eq!(translog.current_generation().unwrap(), 3);
        // Only the checkpoint-named generation is replayed, plus the fresh
        // current one.
        assert_eq!(snapshot_ids(&translog), vec!["b"]);
    }

    #[test]
    fn test_open_mode_retains_everything_until_commit() {
        let dir = TempDir::new().unwrap();
        {
            let translog = open_default(dir.path(), OpenMode::Create);
            translog.add(&index_op("a")).unwrap();
            translog.prepare_commit().unwrap();
            translog.close().unwrap();
        }

        let translog = open_default(dir.path(), OpenMode::Open);
        drop(translog);
        // Nothing was committed after the open, so nothing was deleted.
        assert!(dir.path().join(file_name(2)).exists());
    }

    #[test]
    fn test_recover_without_checkpoint_warns_and_scans() {
        let dir = TempDir::new().unwrap();
        {
            let translog = open_default(dir.path(), OpenMode::Create);
            translog.add(&index_op("a")).unwrap();
            translog.close().unwrap();
        }
        fs::remove_file(dir.path().join(crate::checkpoint::CHECKPOINT_FILE_NAME)).unwrap();

        let translog = open_default(dir.path(), OpenMode::Recover);
        assert_eq!(snapshot_ids(&translog), vec!["a"]);
    }

    #[test]
    fn test_recover_tolerates_recovering_suffix() {
        let dir = TempDir::new().unwrap();
        {
            let translog = open_default(dir.path(), OpenMode::Create);
            translog.add(&index_op("a")).unwrap();
            translog.close().unwrap();
        }
        fs::remove_file(dir.path().join(crate::checkpoint::CHECKPOINT_FILE_NAME)).unwrap();
        fs::rename(
            dir.path().join(file_name(1)),
            dir.path().join("translog-1.recovering"),
        )
        .unwrap();

        let translog = open_default(dir.path(), OpenMode::Recover);
        assert_eq!(snapshot_ids(&translog), vec!["a"]);
    }

    #[test]
    fn test_update_buffer_and_settings() {
        let dir = TempDir::new().unwrap();
        let translog = open_default(dir.path(), OpenMode::Create);
        translog.add(&index_op("a")).unwrap();
        translog.update_buffer(1024).unwrap();

        let mut settings = Settings::new();
        settings.insert(INDEX_TRANSLOG_DURABILITY.to_string(), "async".to_string());
        settings.insert(INDEX_TRANSLOG_FS_TYPE.to_string(), "simple".to_string());
        translog.apply_settings(&settings);
        assert_eq!(translog.get_durability(), Durability::Async);

        // Bogus values keep the previous settings.
        let mut bogus = Settings::new();
        bogus.insert(INDEX_TRANSLOG_DURABILITY.to_string(), "maybe".to_string());
        translog.apply_settings(&bogus);
        assert_eq!(translog.get_durability(), Durability::Async);
    }

    #[test]
    fn test_concurrent_adds_produce_ordered_locations() {
        use std::thread;

        let dir = TempDir::new().unwrap();
        let translog = Arc::new(open_default(dir.path(), OpenMode::Create));

        let mut handles = Vec::new();
        for t in 0..4 {
            let translog = Arc::clone(&translog);
            handles.push(thread::spawn(move || {
                let mut locations = Vec::new();
                for i in 0..25 {
                    locations.push(translog.add(&index_op(&format!("t{t}-{i}"))).unwrap());
                }
                locations
            }));
        }

        let mut all: Vec<Location> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        all.sort();
        for pair in all.windows(2) {
            assert!(pair[0].end_offset() <= pair[1].offset);
            assert_eq!(pair[0].generation, pair[1].generation);
        }
        assert_eq!(translog.total_operations().unwrap(), 100);
    }
}
