//! Reference-counted file channels.
//!
//! Readers, snapshots, views, and the committing slot each hold an
//! `Arc<ChannelRef>` to the generation file they read from. When the last
//! holder drops, the release hook runs; the manager installs a hook that
//! deletes the file if its generation is no longer retained. This is the
//! only path by which old generation files leave the disk.

use std::fs::File;
use std::path::{Path, PathBuf};

/// Callback invoked when the last reference to a channel is released.
pub(crate) type OnRelease = Box<dyn Fn(&ChannelRef) + Send + Sync>;

/// A generation file handle shared between the writer, readers, snapshots
/// and views. Cloning the surrounding `Arc` is the refcount bump; the hook
/// fires exactly once, from the dropping holder's thread.
pub(crate) struct ChannelRef {
    path: PathBuf,
    generation: u64,
    file: File,
    on_release: Option<OnRelease>,
}

impl ChannelRef {
    pub fn new(path: PathBuf, generation: u64, file: File, on_release: Option<OnRelease>) -> Self {
        Self {
            path,
            generation,
            file,
            on_release,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

impl Drop for ChannelRef {
    fn drop(&mut self) {
        if let Some(hook) = self.on_release.take() {
            hook(self);
        }
    }
}

impl std::fmt::Debug for ChannelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRef")
            .field("path", &self.path)
            .field("generation", &self.generation)
            .finish()
    }
}
