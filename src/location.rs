//! Pointer to a single record inside one log generation.

use std::cmp::Ordering;
use std::fmt;

/// Identifies one appended record: the generation file it lives in, the byte
/// offset of its frame, and the frame size in bytes (size prefix included).
///
/// Locations are handed out by `add` and consumed by `read`. They are totally
/// ordered by `(generation, offset)`, which matches append order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    pub generation: u64,
    pub offset: u64,
    pub size: u32,
}

impl Location {
    pub fn new(generation: u64, offset: u64, size: u32) -> Self {
        Self {
            generation,
            offset,
            size,
        }
    }

    /// First byte past this record's frame.
    pub fn end_offset(&self) -> u64 {
        self.offset + u64::from(self.size)
    }
}

impl Ord for Location {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then(self.offset.cmp(&other.offset))
    }
}

impl PartialOrd for Location {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[generation: {}, offset: {}, size: {}]",
            self.generation, self.offset, self.size
        )
    }
}
