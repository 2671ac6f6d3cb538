//! Bus configuration.
//!
//! [`BusConfig`] carries every tunable the engine exposes; construct one
//! with [`BusConfig::new`] and override fields directly. Validation happens
//! once, in [`Bus::open`](crate::Bus::open).

use std::path::PathBuf;

use crate::error::Error;

/// Default segment rotation threshold: 256 MiB.
pub const DEFAULT_MAX_SEGMENT_BYTES: u64 = 256 * 1024 * 1024;

/// Smallest permitted rotation threshold: 1 MiB.
pub const MIN_SEGMENT_BYTES: u64 = 1024 * 1024;

/// Default timestamp sampling stride: one sample every 10 000 records.
pub const DEFAULT_TIMESTAMP_INDEX_STRIDE: u64 = 10_000;

/// Default producer -> writer queue depth.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default per-subscription live buffer.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 1024;

/// Default hard cap on payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Default cap on topic name length.
pub const DEFAULT_MAX_TOPIC_NAME_BYTES: usize = 128;

/// Hard upper bound on `max_topic_name_bytes`; topic names never exceed
/// 255 bytes regardless of configuration.
pub const TOPIC_NAME_LIMIT: usize = 255;

/// When appended bytes are forced to stable storage.
///
/// A closed set switched inside the topic writer; there is no open-ended
/// policy trait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// fsync after every record, before the publish is acknowledged.
    FsyncAlways,
    /// Accumulate unacknowledged publishes; fsync and acknowledge them all
    /// when either bound is reached. A crash may lose unacknowledged
    /// publishes but never leaves a partial record after recovery.
    FsyncBatch {
        /// Flush after this many unacknowledged records.
        max_events: usize,
        /// Flush when the oldest unacknowledged record is this old.
        max_millis: u64,
    },
    /// Never fsync on the hot path; rely on the OS page cache, with one
    /// best-effort flush at shutdown.
    OsBuffered,
}

/// Everything tunable about a bus instance.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Root directory for `bus.meta.json` and `topics/`.
    pub data_dir: PathBuf,
    /// Durability policy applied by every topic writer.
    pub durability: Durability,
    /// Rotate the active segment when the next append would push it past
    /// this size. Must be >= [`MIN_SEGMENT_BYTES`].
    pub max_segment_bytes: u64,
    /// Record a timestamp index sample every this many records. Must be >= 1.
    pub timestamp_index_stride: u64,
    /// Bound on the producer -> writer queue. Must be >= 1.
    pub channel_capacity: usize,
    /// Per-subscription live broadcast buffer. Must be >= 1.
    pub subscriber_buffer: usize,
    /// Hard limit on payload size, enforced on encode and decode.
    pub max_payload_bytes: usize,
    /// Limit on topic name length. Must be <= [`TOPIC_NAME_LIMIT`].
    pub max_topic_name_bytes: usize,
}

impl BusConfig {
    /// A configuration with all defaults, rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> BusConfig {
        BusConfig {
            data_dir: data_dir.into(),
            durability: Durability::FsyncAlways,
            max_segment_bytes: DEFAULT_MAX_SEGMENT_BYTES,
            timestamp_index_stride: DEFAULT_TIMESTAMP_INDEX_STRIDE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            max_topic_name_bytes: DEFAULT_MAX_TOPIC_NAME_BYTES,
        }
    }

    /// Check every bound; called by [`Bus::open`](crate::Bus::open).
    ///
    /// # Errors
    ///
    /// Returns [`Error::LimitExceeded`] naming the offending field.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_segment_bytes < MIN_SEGMENT_BYTES {
            return Err(Error::LimitExceeded {
                field: "max_segment_bytes",
                len: self.max_segment_bytes as usize,
                max: MIN_SEGMENT_BYTES as usize,
            });
        }
        if self.timestamp_index_stride == 0 {
            return Err(Error::LimitExceeded {
                field: "timestamp_index_stride",
                len: 0,
                max: 1,
            });
        }
        if self.channel_capacity == 0 {
            return Err(Error::LimitExceeded {
                field: "channel_capacity",
                len: 0,
                max: 1,
            });
        }
        if self.subscriber_buffer == 0 {
            return Err(Error::LimitExceeded {
                field: "subscriber_buffer",
                len: 0,
                max: 1,
            });
        }
        if self.max_topic_name_bytes > TOPIC_NAME_LIMIT {
            return Err(Error::LimitExceeded {
                field: "max_topic_name_bytes",
                len: self.max_topic_name_bytes,
                max: TOPIC_NAME_LIMIT,
            });
        }
        Ok(())
    }
}
