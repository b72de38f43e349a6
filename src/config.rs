//! Settings consumed by the translog.
//!
//! Settings arrive as a flat string-keyed map. Every key has a default and
//! parsing is lenient: an unrecognized value is logged and the default (or
//! previous value) is kept, never an error.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::warn;

use crate::translog::Durability;
use crate::writer::WriterType;

/// Flat settings source, e.g. the per-index settings of the owning shard.
pub type Settings = BTreeMap<String, String>;

/// Sync-per-request vs periodic sync.
pub const INDEX_TRANSLOG_DURABILITY: &str = "index.translog.durability";
/// Writer type: `simple` or `buffered`.
pub const INDEX_TRANSLOG_FS_TYPE: &str = "index.translog.fs.type";
/// Byte size of the writer's append buffer.
pub const INDEX_TRANSLOG_BUFFER_SIZE: &str = "index.translog.fs.buffer_size";
/// Background sync period; `0` forces a sync on every operation.
pub const INDEX_TRANSLOG_SYNC_INTERVAL: &str = "index.translog.sync_interval";

pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Resolved translog configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslogConfig {
    pub durability: Durability,
    pub writer_type: WriterType,
    pub buffer_size: usize,
    pub sync_interval: Duration,
}

impl Default for TranslogConfig {
    fn default() -> Self {
        Self {
            durability: Durability::Request,
            writer_type: WriterType::Buffered,
            buffer_size: DEFAULT_BUFFER_SIZE,
            sync_interval: DEFAULT_SYNC_INTERVAL,
        }
    }
}

impl TranslogConfig {
    /// Resolves a configuration from a settings map, falling back to the
    /// defaults for missing or unparsable values.
    pub fn from_settings(settings: &Settings) -> Self {
        let defaults = Self::default();
        Self {
            durability: settings
                .get(INDEX_TRANSLOG_DURABILITY)
                .and_then(|value| parse_or_warn(INDEX_TRANSLOG_DURABILITY, value, Durability::parse))
                .unwrap_or(defaults.durability),
            writer_type: settings
                .get(INDEX_TRANSLOG_FS_TYPE)
                .and_then(|value| parse_or_warn(INDEX_TRANSLOG_FS_TYPE, value, WriterType::parse))
                .unwrap_or(defaults.writer_type),
            buffer_size: settings
                .get(INDEX_TRANSLOG_BUFFER_SIZE)
                .and_then(|value| parse_or_warn(INDEX_TRANSLOG_BUFFER_SIZE, value, parse_byte_size))
                .unwrap_or(defaults.buffer_size),
            sync_interval: settings
                .get(INDEX_TRANSLOG_SYNC_INTERVAL)
                .and_then(|value| {
                    parse_or_warn(INDEX_TRANSLOG_SYNC_INTERVAL, value, parse_time_value)
                })
                .unwrap_or(defaults.sync_interval),
        }
    }
}

fn parse_or_warn<T>(key: &str, value: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let parsed = parse(value);
    if parsed.is_none() {
        warn!("can't parse [{key}] value [{value}], falling back to the default");
    }
    parsed
}

/// Parses a byte size such as `64k`, `1mb`, or a bare byte count.
pub(crate) fn parse_byte_size(value: &str) -> Option<usize> {
    let value = value.trim().to_ascii_lowercase();
    let (digits, multiplier) = if let Some(rest) = value
        .strip_suffix("kb")
        .or_else(|| value.strip_suffix('k'))
    {
        (rest, 1024)
    } else if let Some(rest) = value
        .strip_suffix("mb")
        .or_else(|| value.strip_suffix('m'))
    {
        (rest, 1024 * 1024)
    } else if let Some(rest) = value
        .strip_suffix("gb")
        .or_else(|| value.strip_suffix('g'))
    {
        (rest, 1024 * 1024 * 1024)
    } else if let Some(rest) = value.strip_suffix('b') {
        (rest, 1)
    } else {
        (value.as_str(), 1)
    };
    let count: usize = digits.trim().parse().ok()?;
    count.checked_mul(multiplier)
}

/// Parses a duration such as `5s`, `200ms`, `1m`; a bare number counts
/// milliseconds.
pub(crate) fn parse_time_value(value: &str) -> Option<Duration> {
    let value = value.trim().to_ascii_lowercase();
    if let Some(rest) = value.strip_suffix("ms") {
        return Some(Duration::from_millis(rest.trim().parse().ok()?));
    }
    if let Some(rest) = value.strip_suffix('s') {
        return Some(Duration::from_secs(rest.trim().parse().ok()?));
    }
    if let Some(rest) = value.strip_suffix('m') {
        let minutes: u64 = rest.trim().parse().ok()?;
        return Some(Duration::from_secs(minutes * 60));
    }
    if let Some(rest) = value.strip_suffix('h') {
        let hours: u64 = rest.trim().parse().ok()?;
        return Some(Duration::from_secs(hours * 3600));
    }
    Some(Duration::from_millis(value.parse().ok()?))
}
