//! Translog error types.
//!
//! The error kinds mirror the failure classes a caller has to tell apart:
//! a corrupted record is fatal for the affected generation, a truncated tail
//! is recoverable policy-side, and I/O failures carry the offending path.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::location::Location;

/// Result type for translog operations.
pub type TranslogResult<T> = Result<T, TranslogError>;

/// Errors surfaced by the translog.
#[derive(Debug, Error)]
pub enum TranslogError {
    /// Checksum mismatch, unknown operation tag, or malformed record body.
    /// Not recoverable: the affected generation cannot be trusted.
    #[error("translog stream is corrupted: {0}")]
    Corrupted(String),

    /// The file ended before the trailing checksum of a record. All records
    /// before the torn tail remain readable.
    #[error("reached premature end of file, translog is truncated: {0}")]
    Truncated(String),

    /// `read` was asked for a location whose generation is neither the
    /// current writer nor the committing reader.
    #[error("cannot read from translog location {0}")]
    InvalidLocation(Location),

    /// An operation was attempted in a state that does not allow it, e.g.
    /// `prepare_commit` while a commit is already in flight.
    #[error("{0}")]
    IllegalState(String),

    /// The translog has been closed; no further operations are accepted.
    #[error("translog is already closed")]
    Closed,

    /// A filesystem operation failed.
    #[error("translog i/o failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// An `add` failed; carries a description of the rejected operation.
    #[error("failed to write operation [{op}]")]
    OperationRejected {
        op: String,
        #[source]
        source: Box<TranslogError>,
    },
}

impl TranslogError {
    pub(crate) fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// True if the underlying cause is a file-not-found I/O error.
    pub(crate) fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_location() {
        let err = TranslogError::InvalidLocation(Location::new(7, 17, 9));
        assert!(err.to_string().contains("generation: 7"));
    }

    #[test]
    fn test_rejected_operation_chains_source() {
        let err = TranslogError::OperationRejected {
            op: "Index{id='a', type='doc'}".to_string(),
            source: Box::new(TranslogError::Closed),
        };
        let source = std::error::Error::source(&err).expect("source");
        assert!(source.to_string().contains("closed"));
    }

    #[test]
    fn test_is_not_found() {
        let missing = TranslogError::io(
            "/t/translog-1.tlog",
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert!(missing.is_not_found());
        assert!(!TranslogError::Closed.is_not_found());
    }
}
