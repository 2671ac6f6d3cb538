//! In-memory lookup indices for one topic.
//!
//! [`TopicIndex`] holds the id -> position map, the sampled timestamp
//! sequence, and the committed end-of-log position. The topic's writer task
//! is the only mutator; subscriptions resolve cursors through the cloneable
//! [`IndexHandle`], which takes a read lock for the duration of a lookup.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::id::EventId;

/// A position in a topic's log: `(segment number, byte offset)`.
///
/// Tuple ordering (segment first, then offset) matches log order, which is
/// what lets subscriptions compare replayed and live positions directly.
pub(crate) type LogPosition = (u32, u64);

/// Lookup structures the writer maintains alongside the log.
#[derive(Debug)]
pub(crate) struct TopicIndex {
    /// One entry per committed record: event id -> record start position.
    ids: HashMap<EventId, LogPosition>,
    /// Sampled `(ts_unix_nanos, position)` pairs, non-decreasing in ts;
    /// one sample every `stride` records, starting with the first.
    ts_samples: Vec<(i64, LogPosition)>,
    /// Position of the first record (`StartFrom::Beginning`).
    first: LogPosition,
    /// Position one past the last committed record -- the end-of-log
    /// snapshot subscriptions cut over on.
    head: LogPosition,
    /// Committed record count, drives the sampling cadence.
    seen: u64,
}

impl TopicIndex {
    /// An empty index for a topic whose log begins in `first_segment`.
    pub fn new(first_segment: u32) -> TopicIndex {
        TopicIndex {
            ids: HashMap::new(),
            ts_samples: Vec::new(),
            first: (first_segment, 0),
            head: (first_segment, 0),
            seen: 0,
        }
    }

    /// Record one committed append. Called by the writer (and recovery)
    /// only after the bytes are safely in the segment.
    pub fn record_appended(
        &mut self,
        event_id: EventId,
        ts_unix_nanos: i64,
        position: LogPosition,
        stride: u64,
    ) {
        if self.seen % stride == 0 {
            self.ts_samples.push((ts_unix_nanos, position));
        }
        self.ids.insert(event_id, position);
        self.seen += 1;
    }

    /// Advance the committed end of the log.
    pub fn set_head(&mut self, head: LogPosition) {
        self.head = head;
    }

    /// Position one past the last committed record.
    pub fn head(&self) -> LogPosition {
        self.head
    }

    /// Position of the first record.
    pub fn first(&self) -> LogPosition {
        self.first
    }

    /// Number of committed records.
    pub fn len(&self) -> u64 {
        self.seen
    }

    /// Direct id lookup.
    pub fn lookup_id(&self, event_id: &EventId) -> Option<LogPosition> {
        self.ids.get(event_id).copied()
    }

    /// Where a timestamp scan should begin: the greatest sample with
    /// `ts <= target`, or the start of the log when the target precedes
    /// every sample. The caller scans forward from here, filtering records
    /// older than the target.
    pub fn resolve_timestamp(&self, target: i64) -> LogPosition {
        let idx = self.ts_samples.partition_point(|(ts, _)| *ts <= target);
        if idx == 0 {
            self.first
        } else {
            self.ts_samples[idx - 1].1
        }
    }
}

/// Cloneable, read-only view of a topic's [`TopicIndex`].
///
/// Wraps the same `Arc<RwLock<_>>` the writer mutates; every method takes
/// the read lock for just the duration of the call.
#[derive(Clone, Debug)]
pub(crate) struct IndexHandle {
    index: Arc<RwLock<TopicIndex>>,
}

impl IndexHandle {
    pub fn new(index: Arc<RwLock<TopicIndex>>) -> IndexHandle {
        IndexHandle { index }
    }

    /// Run `f` under the read lock.
    pub fn with<R>(&self, f: impl FnOnce(&TopicIndex) -> R) -> R {
        let index = self.index.read().expect("TopicIndex RwLock poisoned");
        f(&index)
    }
}
