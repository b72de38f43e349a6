//! translog - a per-shard write-ahead transaction log
//!
//! Every accepted mutation is appended (and, per policy, fsynced) before it
//! is acknowledged; on restart the log is replayed to bring the engine's
//! segment store back to the last acknowledged state. Records live in
//! generation files that are rolled by a prepare/commit handshake with the
//! engine and deleted whole once nothing references them.

mod channel;
pub mod checkpoint;
pub mod config;
pub mod errors;
mod location;
pub mod op;
pub mod reader;
pub mod scheduler;
pub mod snapshot;
mod stream;
pub mod translog;
pub mod view;
pub mod writer;

pub use checkpoint::{Checkpoint, CHECKPOINT_FILE_NAME};
pub use config::{
    Settings, TranslogConfig, INDEX_TRANSLOG_BUFFER_SIZE, INDEX_TRANSLOG_DURABILITY,
    INDEX_TRANSLOG_FS_TYPE, INDEX_TRANSLOG_SYNC_INTERVAL,
};
pub use errors::{TranslogError, TranslogResult};
pub use location::Location;
pub use op::{decode_operation, encode_operation};
pub use op::{Create, Delete, DeleteByQuery, Index, Operation, Source, VersionType};
pub use reader::TranslogReader;
pub use scheduler::{ScheduledHandle, TaskScheduler, ThreadScheduler};
pub use snapshot::TranslogSnapshot;
pub use translog::{Durability, OpenMode, Translog, TranslogStats, TRANSLOG_ID_KEY};
pub use view::View;
pub use writer::{TranslogWriter, WriterType};
