//! Time-sortable 128-bit event identifiers.
//!
//! An [`EventId`] packs a 48-bit big-endian unix-millisecond prefix and an
//! 80-bit randomness suffix, so byte-lexicographic order matches creation
//! order. The [`IdGenerator`] guarantees strict monotonicity even within a
//! single millisecond and across wall-clock retreats; one generator lives
//! inside each topic writer, so `&mut self` is enough for a total order.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Error;

/// Number of bytes in an encoded event id.
pub const EVENT_ID_LEN: usize = 16;

/// Length of the canonical textual form (lowercase hex).
const TEXT_LEN: usize = 32;

/// Mask selecting the 80-bit randomness suffix of the id's `u128` form.
const SUFFIX_MASK: u128 = (1u128 << 80) - 1;

/// A 128-bit, time-sortable event identifier.
///
/// Ordering is byte-lexicographic over the raw 16 bytes, which (by
/// construction in [`IdGenerator::next`]) equals creation order within a
/// topic. The canonical textual form is 32 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId([u8; EVENT_ID_LEN]);

impl EventId {
    /// Build an id from its raw 16-byte representation.
    pub fn from_bytes(bytes: [u8; EVENT_ID_LEN]) -> EventId {
        EventId(bytes)
    }

    /// Raw 16-byte representation, as written into record frames.
    pub fn as_bytes(&self) -> &[u8; EVENT_ID_LEN] {
        &self.0
    }

    /// The unix-millisecond timestamp prefix (high 48 bits).
    pub fn timestamp_millis(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf[2..8].copy_from_slice(&self.0[0..6]);
        u64::from_be_bytes(buf)
    }

    fn from_u128(value: u128) -> EventId {
        EventId(value.to_be_bytes())
    }

    fn to_u128(self) -> u128 {
        u128::from_be_bytes(self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.to_u128())
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({self})")
    }
}

impl FromStr for EventId {
    type Err = Error;

    /// Parse the canonical 32-character hex form (case-insensitive).
    fn from_str(s: &str) -> Result<EventId, Error> {
        if s.len() != TEXT_LEN {
            return Err(Error::InvalidEventId(format!(
                "expected {TEXT_LEN} hex characters, got {}",
                s.len()
            )));
        }
        let mut bytes = [0u8; EVENT_ID_LEN];
        for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
            let pair = std::str::from_utf8(chunk)
                .map_err(|_| Error::InvalidEventId(format!("non-ASCII character in: {s}")))?;
            bytes[i] = u8::from_str_radix(pair, 16)
                .map_err(|_| Error::InvalidEventId(format!("non-hex character in: {s}")))?;
        }
        Ok(EventId(bytes))
    }
}

/// Mints strictly increasing [`EventId`]s for a single topic writer.
///
/// Tracks `(last_ms, last id)` so that:
///
/// - a fresh millisecond gets a fresh random 80-bit suffix;
/// - a repeated millisecond (or a wall clock that moved backwards)
///   increments the previous id's low 80 bits by one;
/// - an 80-bit suffix overflow advances `last_ms` by one, borrowing from
///   the future rather than ever repeating or regressing.
#[derive(Debug)]
pub struct IdGenerator {
    /// Millisecond prefix of the last minted id.
    last_ms: u64,
    /// Full 128-bit value of the last minted id.
    last: u128,
}

impl IdGenerator {
    /// Create a generator that has minted nothing yet.
    pub fn new() -> IdGenerator {
        IdGenerator { last_ms: 0, last: 0 }
    }

    /// Raise the generator floor during recovery.
    ///
    /// Called with the maximum observed id prefix + 1 so that ids minted
    /// after a restart sort strictly after every recovered id, even when
    /// the wall clock is behind the previous run.
    pub fn seed(&mut self, floor_ms: u64) {
        if floor_ms > self.last_ms {
            self.last_ms = floor_ms;
            self.last = compose(floor_ms, random_suffix());
        }
    }

    /// Mint the next id.
    pub fn next(&mut self) -> EventId {
        let now_ms = unix_millis();
        if now_ms > self.last_ms {
            self.last_ms = now_ms;
            self.last = compose(now_ms, random_suffix());
        } else {
            // Same tick, or the clock retreated: bump the previous suffix.
            let suffix = (self.last & SUFFIX_MASK) + 1;
            if suffix > SUFFIX_MASK {
                // Suffix exhausted within this millisecond. Borrow the next
                // millisecond and start a fresh random suffix there.
                self.last_ms += 1;
                self.last = compose(self.last_ms, random_suffix());
            } else {
                self.last = (self.last & !SUFFIX_MASK) | suffix;
            }
        }
        EventId::from_u128(self.last)
    }
}

impl Default for IdGenerator {
    fn default() -> IdGenerator {
        IdGenerator::new()
    }
}

/// Pack a millisecond prefix (low 48 bits used) and an 80-bit suffix.
fn compose(ms: u64, suffix: u128) -> u128 {
    ((ms as u128 & 0xFFFF_FFFF_FFFF) << 80) | (suffix & SUFFIX_MASK)
}

/// 80 random bits for a fresh-millisecond suffix.
fn random_suffix() -> u128 {
    rand::random::<u128>() & SUFFIX_MASK
}

/// Current wall-clock time in unix milliseconds.
fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
