//! SimpleBus: a single-node, embedded message bus with durable, ordered,
//! replayable topic streams.
//!
//! Producers publish opaque payloads to named topics; consumers subscribe
//! with a cursor and receive the replayed backlog followed by live events,
//! with no gap and no duplicate at the seam. Each topic is an append-only
//! log of CRC-framed records, owned by a single writer task that mints
//! time-sortable ids, enforces the durability policy and fans committed
//! events out to subscribers.
//!
//! ```no_run
//! use simplebus::{Bus, BusConfig, CursorBound, StartFrom, SubscriptionItem};
//!
//! # async fn demo() -> Result<(), simplebus::Error> {
//! let bus = Bus::open(BusConfig::new("./data"))?;
//! let orders = bus.topic("orders")?;
//!
//! let event_id = orders.publish(bytes::Bytes::from_static(b"{\"qty\":1}")).await?;
//!
//! let mut subscription = orders.subscribe(StartFrom::Beginning, CursorBound::Inclusive)?;
//! while let Some(item) = subscription.next().await {
//!     match item? {
//!         SubscriptionItem::Event(event) => println!("{} {:?}", event.event_id, event.payload),
//!         SubscriptionItem::Lagged { skipped } => eprintln!("missed {skipped} events"),
//!     }
//! }
//!
//! bus.shutdown().await;
//! # let _ = event_id;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod codec;
pub mod config;
pub mod error;
pub mod id;
pub(crate) mod index;
pub(crate) mod segment;
pub mod subscription;
pub mod types;
pub mod writer;

pub use bus::Bus;
pub use codec::DecodeOutcome;
pub use config::{BusConfig, Durability};
pub use error::Error;
pub use id::{EventId, IdGenerator};
pub use subscription::Subscription;
pub use types::{CursorBound, Event, StartFrom, SubscriptionItem};
pub use writer::TopicHandle;

#[cfg(test)]
mod tests {
    // Verify that the public surface is reachable at the crate root; tests
    // use fully-qualified `crate::` paths so the re-exports must resolve.

    #[test]
    fn reexport_event() {
        let event = crate::Event {
            event_id: crate::IdGenerator::new().next(),
            ts_unix_nanos: 0,
            topic: "t".to_string(),
            payload: bytes::Bytes::from_static(b"{}"),
            headers: std::collections::HashMap::new(),
        };
        assert_eq!(event.topic, "t");
    }

    #[test]
    fn reexport_start_from_and_bound() {
        let cursor = crate::StartFrom::Beginning;
        assert_eq!(cursor, crate::StartFrom::Beginning);
        assert_ne!(crate::CursorBound::Inclusive, crate::CursorBound::Exclusive);
    }

    #[test]
    fn reexport_durability() {
        let durability = crate::Durability::FsyncBatch {
            max_events: 32,
            max_millis: 10,
        };
        assert!(matches!(durability, crate::Durability::FsyncBatch { .. }));
    }

    #[test]
    fn reexport_error() {
        let err = crate::Error::QueueFull;
        assert!(err.to_string().contains("full"));
    }

    #[test]
    fn reexport_config_defaults() {
        let config = crate::BusConfig::new("/tmp/x");
        assert_eq!(config.max_segment_bytes, 256 * 1024 * 1024);
    }

    #[test]
    fn reexport_event_id_parses_canonical_form() {
        let id = crate::IdGenerator::new().next();
        let parsed: crate::EventId = id.to_string().parse().expect("canonical form parses");
        assert_eq!(parsed, id);
    }
}
