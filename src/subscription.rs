//! Consumer subscriptions: backlog replay followed by the live tail.
//!
//! A subscription is created against a cursor ([`StartFrom`] +
//! [`CursorBound`]), replays committed records straight from the segment
//! files, then attaches to the topic's broadcast channel. The broadcast
//! receiver is registered **before** the end-of-log snapshot is taken, and
//! every broadcast event carries its log position, so the seam between
//! backlog and live is closed in both directions: nothing is missed, and
//! live copies of already-replayed records are discarded by position.
//!
//! Replay reads only committed bytes (capped at the snapshot), so it never
//! observes a half-written record even while the writer keeps appending.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use futures_core::Stream;
use tokio::sync::{broadcast, watch};

use crate::codec::{self, DecodeOutcome};
use crate::error::Error;
use crate::index::{IndexHandle, LogPosition};
use crate::segment::segment_file_name;
use crate::types::{CursorBound, StartFrom, SubscriptionItem};
use crate::writer::LiveEvent;

/// A consumer's view of one topic: a lazy sequence of
/// [`SubscriptionItem`]s.
///
/// `next()` returning `None` is the terminal signal (bus shutdown, or the
/// topic's writer is gone). Dropping the subscription is non-blocking; the
/// writer notices on its next broadcast.
pub struct Subscription {
    inner: Pin<Box<dyn Stream<Item = Result<SubscriptionItem, Error>> + Send>>,
}

impl Subscription {
    /// The next item: an event, a lag signal, a replay error, or `None`
    /// once the subscription has ended.
    pub async fn next(&mut self) -> Option<Result<SubscriptionItem, Error>> {
        std::future::poll_fn(|cx| self.inner.as_mut().poll_next(cx)).await
    }
}

/// Resolve a cursor and build the replay-then-live stream.
///
/// Called by [`TopicHandle::subscribe`](crate::TopicHandle::subscribe).
///
/// # Errors
///
/// [`Error::CursorNotFound`] when `start` names an id with no committed
/// record.
pub(crate) fn subscribe(
    live: &broadcast::Sender<LiveEvent>,
    index: &IndexHandle,
    dir: Arc<PathBuf>,
    shutdown: watch::Receiver<bool>,
    max_payload_bytes: usize,
    start: StartFrom,
    bound: CursorBound,
) -> Result<Subscription, Error> {
    // Register on the broadcast channel BEFORE snapshotting the head.
    // Events appended in between are then both in the backlog (covered by
    // the snapshot) and buffered live (discarded by position) -- never lost.
    let rx = live.subscribe();

    let (head, start_pos, min_ts, skip_first) = index.with(|index| -> Result<_, Error> {
        let head = index.head();
        match start {
            StartFrom::Beginning => Ok((head, index.first(), None, false)),
            StartFrom::Now => Ok((head, head, None, false)),
            StartFrom::Timestamp(target) => {
                Ok((head, index.resolve_timestamp(target), Some(target), false))
            }
            StartFrom::EventId(event_id) => {
                let position = index.lookup_id(&event_id).ok_or(Error::CursorNotFound)?;
                Ok((
                    head,
                    position,
                    None,
                    matches!(bound, CursorBound::Exclusive),
                ))
            }
        }
    })?;

    Ok(Subscription {
        inner: Box::pin(run(
            rx,
            shutdown,
            dir,
            max_payload_bytes,
            head,
            start_pos,
            min_ts,
            skip_first,
        )),
    })
}

/// What one `select!` round of the live phase produced; lets the `yield`s
/// live outside the macro.
enum LiveStep {
    Received(Result<LiveEvent, broadcast::error::RecvError>),
    Shutdown,
}

#[allow(clippy::too_many_arguments)]
fn run(
    mut rx: broadcast::Receiver<LiveEvent>,
    mut shutdown: watch::Receiver<bool>,
    dir: Arc<PathBuf>,
    max_payload_bytes: usize,
    head: LogPosition,
    start_pos: LogPosition,
    mut min_ts: Option<i64>,
    mut skip_first: bool,
) -> impl Stream<Item = Result<SubscriptionItem, Error>> {
    stream! {
        // -- Replay phase: scan segments from the cursor to the snapshot. --
        let (mut segment, mut pos) = start_pos;
        while (segment, pos) < head {
            let path = dir.join(segment_file_name(segment));
            let data = match std::fs::read(&path) {
                Ok(data) => data,
                Err(e) => {
                    yield Err(e.into());
                    return;
                }
            };
            // Sealed segments replay whole; the active one only up to the
            // snapshot, so a concurrent append is never half-read.
            let limit = if segment == head.0 { head.1 } else { data.len() as u64 };
            if (data.len() as u64) < limit {
                yield Err(Error::TruncatedTail { segment, offset: data.len() as u64 });
                return;
            }

            while pos < limit {
                match codec::decode_record(
                    &data[pos as usize..limit as usize],
                    segment,
                    pos,
                    max_payload_bytes,
                ) {
                    Ok(DecodeOutcome::Complete { value, consumed }) => {
                        pos += consumed as u64;
                        if skip_first {
                            // Exclusive id cursor: drop the matched record.
                            skip_first = false;
                            continue;
                        }
                        if let Some(target) = min_ts {
                            if value.ts_unix_nanos < target {
                                continue;
                            }
                            // First qualifying event seen; accept the rest.
                            min_ts = None;
                        }
                        yield Ok(SubscriptionItem::Event(Arc::new(value)));
                    }
                    Ok(DecodeOutcome::Incomplete) => {
                        yield Err(Error::TruncatedTail { segment, offset: pos });
                        return;
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }

            if segment >= head.0 {
                break;
            }
            segment += 1;
            pos = 0;
        }

        // -- Live phase: follow the broadcast, discarding anything the
        // replay already delivered. --
        loop {
            let step = tokio::select! {
                biased;
                _ = shutdown.wait_for(|latched| *latched) => LiveStep::Shutdown,
                received = rx.recv() => LiveStep::Received(received),
            };

            match step {
                LiveStep::Received(Ok(live)) => {
                    if live.position < head {
                        continue;
                    }
                    // A timestamp cursor stays in force until the first
                    // qualifying event, wherever that event arrives from.
                    if let Some(target) = min_ts {
                        if live.event.ts_unix_nanos < target {
                            continue;
                        }
                        min_ts = None;
                    }
                    yield Ok(SubscriptionItem::Event(live.event));
                }
                LiveStep::Received(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    yield Ok(SubscriptionItem::Lagged { skipped });
                }
                LiveStep::Received(Err(broadcast::error::RecvError::Closed)) => {
                    return;
                }
                LiveStep::Shutdown => {
                    // Hand over what was already buffered, then end.
                    loop {
                        match rx.try_recv() {
                            Ok(live) => {
                                if live.position < head {
                                    continue;
                                }
                                if let Some(target) = min_ts {
                                    if live.event.ts_unix_nanos < target {
                                        continue;
                                    }
                                    min_ts = None;
                                }
                                yield Ok(SubscriptionItem::Event(live.event));
                            }
                            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                                yield Ok(SubscriptionItem::Lagged { skipped });
                            }
                            Err(
                                broadcast::error::TryRecvError::Empty
                                | broadcast::error::TryRecvError::Closed,
                            ) => {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}
