//! Long-lived retention handles over the translog.
//!
//! A view pins every generation present at its creation and is handed each
//! later generation as the translog rolls, until closed. Its reader list is
//! always contiguous oldest-to-newest with the current generation last.

use std::sync::{Arc, Mutex, Weak};

use tracing::trace;

use crate::errors::{TranslogError, TranslogResult};
use crate::reader::TranslogReader;
use crate::snapshot::TranslogSnapshot;

/// The set of outstanding views. Kept outside the translog's reader/writer
/// lock: views are registered under the read lock, notified of rolls under
/// the write lock, and remove themselves on close from arbitrary threads.
pub(crate) struct ViewRegistry {
    views: Mutex<Vec<Arc<ViewInner>>>,
}

impl ViewRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            views: Mutex::new(Vec::new()),
        })
    }

    /// Wraps `readers` (oldest to newest, current generation last) into a
    /// registered view.
    pub fn register(self: &Arc<Self>, readers: Vec<TranslogReader>) -> View {
        debug_assert!(!readers.is_empty());
        let inner = Arc::new(ViewInner {
            registry: Arc::downgrade(self),
            state: Mutex::new(ViewState {
                closed: false,
                readers,
            }),
        });
        self.views.lock().unwrap().push(Arc::clone(&inner));
        View { inner }
    }

    /// Snapshot of the currently outstanding views. Callers iterate the
    /// returned list without holding the registry lock, so a concurrent
    /// close never deadlocks against a roll notification.
    pub fn outstanding(&self) -> Vec<Arc<ViewInner>> {
        self.views.lock().unwrap().clone()
    }

    fn remove(&self, target: &Arc<ViewInner>) {
        self.views
            .lock()
            .unwrap()
            .retain(|view| !Arc::ptr_eq(view, target));
    }
}

struct ViewState {
    closed: bool,
    /// Oldest to newest; the last element always reads the current
    /// generation.
    readers: Vec<TranslogReader>,
}

pub(crate) struct ViewInner {
    registry: Weak<ViewRegistry>,
    state: Mutex<ViewState>,
}

impl ViewInner {
    /// Delivered by the translog when the current generation rolls: the
    /// view's stale handle to the old current is replaced by `old_current`
    /// (now immutable) and `new_current` is appended.
    ///
    /// May race with `close`; a closed view discards both readers. Their
    /// channels are still referenced by the committing slot and the new
    /// writer, so dropping them here never re-enters the caller's locks.
    pub fn on_generation_roll(&self, old_current: TranslogReader, new_current: TranslogReader) {
        let replaced;
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            replaced = state.readers.pop();
            state.readers.push(old_current);
            state.readers.push(new_current);
        }
        drop(replaced);
    }
}

/// Retention handle returned by `Translog::new_view`. Closing (or dropping)
/// the view releases every generation it pinned.
pub struct View {
    inner: Arc<ViewInner>,
}

impl View {
    /// Oldest generation retained by this view.
    pub fn min_generation(&self) -> TranslogResult<u64> {
        let state = self.inner.state.lock().unwrap();
        ensure_open(&state)?;
        Ok(state.readers[0].generation())
    }

    /// Operation count across all retained generations, `None` when any
    /// generation's count is unknown.
    pub fn total_operations(&self) -> TranslogResult<Option<usize>> {
        let state = self.inner.state.lock().unwrap();
        ensure_open(&state)?;
        Ok(state
            .readers
            .iter()
            .map(TranslogReader::total_operations)
            .try_fold(0usize, |total, ops| Some(total + ops?)))
    }

    /// Byte size of the files behind this view.
    pub fn size_in_bytes(&self) -> TranslogResult<u64> {
        let state = self.inner.state.lock().unwrap();
        ensure_open(&state)?;
        Ok(state.readers.iter().map(TranslogReader::size_in_bytes).sum())
    }

    /// Point-in-time snapshot over the view's current reader list.
    pub fn snapshot(&self) -> TranslogResult<TranslogSnapshot> {
        let state = self.inner.state.lock().unwrap();
        ensure_open(&state)?;
        Ok(TranslogSnapshot::new(state.readers.iter()))
    }

    /// Unregisters the view and releases its readers. Idempotent.
    pub fn close(&self) {
        let dropped;
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return;
            }
            trace!(
                min_generation = state.readers[0].generation(),
                "closing translog view"
            );
            state.closed = true;
            dropped = std::mem::take(&mut state.readers);
        }
        if let Some(registry) = self.inner.registry.upgrade() {
            registry.remove(&self.inner);
        }
        // Channel releases can take the translog write lock (file deletion),
        // so they must happen outside the view's own mutex.
        drop(dropped);
    }
}

impl Drop for View {
    fn drop(&mut self) {
        self.close();
    }
}

fn ensure_open(state: &ViewState) -> TranslogResult<()> {
    if state.closed {
        return Err(TranslogError::IllegalState(
            "view is already closed".to_string(),
        ));
    }
    Ok(())
}
