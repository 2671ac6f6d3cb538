//! Core domain types for SimpleBus.
//!
//! This module defines the data types every other module depends on: the
//! committed [`Event`], the subscription cursor ([`StartFrom`] plus
//! [`CursorBound`]), and the items a [`Subscription`](crate::Subscription)
//! yields.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::id::EventId;

/// A committed event as stored in a topic's log.
///
/// Payload and header contents are opaque to the bus; only lengths are
/// validated. `event_id` and `ts_unix_nanos` are assigned by the topic
/// writer at append time and are immutable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Bus-assigned, time-sortable unique id.
    pub event_id: EventId,
    /// Wall-clock append time in unix nanoseconds, clamped non-decreasing
    /// per topic.
    pub ts_unix_nanos: i64,
    /// Name of the topic this event was published to.
    pub topic: String,
    /// Opaque event body.
    pub payload: Bytes,
    /// Opaque string headers; the empty map encodes as `HEADERS_LEN = 0`.
    pub headers: HashMap<String, String>,
}

/// Where a subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    /// The oldest committed event of the topic.
    Beginning,
    /// The current end of the log; no backlog, live events only.
    Now,
    /// The first committed event whose timestamp is >= the given unix-nanos
    /// value.
    Timestamp(i64),
    /// The committed event with this id. Fails with
    /// [`CursorNotFound`](crate::Error::CursorNotFound) if unknown.
    EventId(EventId),
}

/// Whether an [`StartFrom::EventId`] cursor delivers the matched event
/// itself or starts just after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorBound {
    /// Deliver the matched event first.
    Inclusive,
    /// Skip the matched event; deliver its successor first.
    Exclusive,
}

/// One item yielded by [`Subscription::next`](crate::Subscription::next).
///
/// The end of the subscription (consumer drop or bus shutdown) is signaled
/// by `next()` returning `None`, not by a variant here.
#[derive(Debug, Clone)]
pub enum SubscriptionItem {
    /// The next event, shared across subscribers without deep-cloning.
    Event(Arc<Event>),
    /// The subscriber's live buffer overflowed and `skipped` events were
    /// dropped; delivery resumes with the next live event. Reopen from the
    /// last seen event id to recover completely.
    Lagged {
        /// Number of live events this subscriber missed.
        skipped: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::IdGenerator;

    fn sample_event() -> Event {
        Event {
            event_id: IdGenerator::new().next(),
            ts_unix_nanos: 1_700_000_000_000_000_000,
            topic: "orders".to_string(),
            payload: Bytes::from_static(b"{\"qty\":1}"),
            headers: HashMap::new(),
        }
    }

    #[test]
    fn event_clone_is_equal() {
        let event = sample_event();
        let cloned = event.clone();
        assert_eq!(event, cloned);
    }

    #[test]
    fn events_with_different_payload_are_not_equal() {
        let event_a = sample_event();
        let event_b = Event {
            payload: Bytes::from_static(b"other"),
            ..event_a.clone()
        };
        assert_ne!(event_a, event_b);
    }

    #[test]
    fn start_from_is_copy() {
        let cursor = StartFrom::Timestamp(42);
        let a = cursor;
        let b = cursor;
        assert_eq!(a, b);
    }

    #[test]
    fn cursor_bound_variants_compare() {
        assert_eq!(CursorBound::Inclusive, CursorBound::Inclusive);
        assert_ne!(CursorBound::Inclusive, CursorBound::Exclusive);
    }

    #[test]
    fn lagged_item_carries_skip_count() {
        let item = SubscriptionItem::Lagged { skipped: 7 };
        match item {
            SubscriptionItem::Lagged { skipped } => assert_eq!(skipped, 7),
            SubscriptionItem::Event(_) => panic!("expected Lagged"),
        }
    }
}
