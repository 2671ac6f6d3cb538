//! Error types for SimpleBus.
//!
//! This module defines the unified error enum used throughout the crate. All
//! fallible operations return `Result<T, Error>`. Recovery distinguishes
//! recoverable tail damage (`TruncatedTail`, trailing `CorruptRecord` in the
//! active segment) from fatal mid-log damage (`UnrecoverableSegment`).

/// Unified error type for all SimpleBus operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A record on disk failed CRC or framing validation.
    #[error("corrupt record in segment {segment} at offset {offset}: {detail}")]
    CorruptRecord {
        /// Segment number containing the corrupt record.
        segment: u32,
        /// Byte offset of the record start within the segment.
        offset: u64,
        /// Human-readable description of the corruption.
        detail: String,
    },

    /// The final record of a segment is incomplete (torn write).
    ///
    /// Recoverable by truncation when it occurs in the active segment.
    #[error("truncated record tail in segment {segment} at offset {offset}")]
    TruncatedTail {
        /// Segment number containing the partial record.
        segment: u32,
        /// Byte offset where the partial record begins.
        offset: u64,
    },

    /// Corruption in a sealed (non-final) segment. Fatal: startup aborts.
    #[error("unrecoverable corruption in sealed segment {segment} at offset {offset}")]
    UnrecoverableSegment {
        /// Segment number containing the corruption.
        segment: u32,
        /// Byte offset where valid data ends.
        offset: u64,
    },

    /// A field exceeds its configured or wire-format limit.
    #[error("{field} length {len} exceeds {max} byte limit")]
    LimitExceeded {
        /// Which field breached the limit (e.g. `"payload"`, `"topic"`).
        field: &'static str,
        /// Actual length in bytes.
        len: usize,
        /// Maximum permitted length in bytes.
        max: usize,
    },

    /// A subscription cursor referenced an event id with no committed record.
    #[error("no committed record for the requested event id")]
    CursorNotFound,

    /// The topic's publish queue is full (back-pressure).
    #[error("publish queue is full")]
    QueueFull,

    /// The bus is shutting down or already closed.
    #[error("bus is shut down")]
    Shutdown,

    /// A topic name is empty or contains path separators.
    #[error("invalid topic name: {0}")]
    InvalidTopic(String),

    /// A textual event id is not the canonical 32-character hex form.
    #[error("invalid event id: {0}")]
    InvalidEventId(String),

    /// The bus metadata file is unreadable or has an unknown format version.
    #[error("invalid bus metadata: {0}")]
    InvalidMeta(String),

    /// An I/O error occurred during a file operation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
