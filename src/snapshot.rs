//! Point-in-time, forward-only iteration over a fixed set of generations.

use crate::errors::TranslogResult;
use crate::op::Operation;
use crate::reader::{ChannelSnapshot, TranslogReader};

/// Iterates the records of one or more generations, oldest generation
/// first, in append order within each. The snapshot holds its own channel
/// references, so the underlying files stay alive (and readable) until it
/// is closed, regardless of what the translog does in the meantime.
///
/// Operations appended to the current generation after the snapshot was
/// taken are not observed.
pub struct TranslogSnapshot {
    cursors: Vec<ChannelSnapshot>,
    index: usize,
}

impl TranslogSnapshot {
    pub(crate) fn new<'a>(readers: impl IntoIterator<Item = &'a TranslogReader>) -> Self {
        Self {
            cursors: readers
                .into_iter()
                .map(TranslogReader::channel_snapshot)
                .collect(),
            index: 0,
        }
    }

    /// The next operation, or `None` once every generation is exhausted.
    /// Corruption and torn tails surface here, positioned at the record
    /// that failed to decode.
    pub fn next(&mut self) -> TranslogResult<Option<Operation>> {
        while let Some(cursor) = self.cursors.get_mut(self.index) {
            if let Some(op) = cursor.next()? {
                return Ok(Some(op));
            }
            self.index += 1;
        }
        Ok(None)
    }

    /// Sum of the per-generation operation counts; `None` when any
    /// generation's count is unknown.
    pub fn estimated_total_operations(&self) -> Option<usize> {
        self.cursors
            .iter()
            .map(ChannelSnapshot::estimated_total_operations)
            .try_fold(0usize, |total, ops| Some(total + ops?))
    }

    /// Releases every underlying channel reference. Idempotent; dropping
    /// the snapshot does the same.
    pub fn close(&mut self) {
        self.cursors.clear();
    }
}
