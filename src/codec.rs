//! Binary codec for SimpleBus log records.
//!
//! This module handles serialization and deserialization of the framed
//! on-disk record. It is pure data transformation -- no file I/O, no async,
//! no index management.
//!
//! Each record is a self-describing frame (little-endian integers):
//!
//! ```text
//! MAGIC       u32   constant, identifies a record start ("SBUS")
//! VERSION     u16   format version (currently 1)
//! FLAGS       u16   reserved, 0
//! RECORD_LEN  u32   bytes that follow, up to and including CRC32
//! EVENT_ID    [16]
//! TS_NANOS    i64
//! TOPIC_LEN   u16   TOPIC   [TOPIC_LEN]
//! PAYLOAD_LEN u32   PAYLOAD [PAYLOAD_LEN]
//! HEADERS_LEN u32   HEADERS [HEADERS_LEN]   (zero-length permitted)
//! CRC32       u32   IEEE, over EVENT_ID through end of HEADERS
//! ```
//!
//! Headers encode as repeated `(u16 key_len, key, u16 val_len, val)` pairs
//! in ascending key order, so encoding the same event twice yields
//! identical bytes.

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::Error;
use crate::id::{EVENT_ID_LEN, EventId};
use crate::types::Event;

/// Magic bytes opening every record frame (ASCII "SBUS").
const MAGIC: [u8; 4] = [0x53, 0x42, 0x55, 0x53];

/// Current record format version.
const FORMAT_VERSION: u16 = 1;

/// Bytes before `RECORD_LEN`'s coverage begins: magic + version + flags +
/// the length field itself.
pub(crate) const PRELUDE_SIZE: usize = 4 + 2 + 2 + 4;

/// Fixed portion counted inside `RECORD_LEN`: event_id(16) + ts(8) +
/// topic_len(2) + payload_len(4) + headers_len(4) + crc(4).
const FIXED_BODY_SIZE: usize = EVENT_ID_LEN + 8 + 2 + 4 + 4 + 4;

/// Result of attempting to decode a record from a byte buffer.
///
/// Distinguishes a successfully decoded record from a buffer that simply
/// ends too early. The distinction is what makes crash recovery possible: a
/// short trailing frame is an expected torn write, whereas a checksum or
/// framing mismatch is corruption.
#[derive(Debug)]
pub enum DecodeOutcome<T> {
    /// A full record was decoded.
    Complete {
        /// The decoded value.
        value: T,
        /// Total bytes consumed from the buffer, prelude included.
        consumed: usize,
    },
    /// The buffer ends before a complete frame.
    Incomplete,
}

/// Encode an [`Event`] into its on-disk frame.
///
/// The returned buffer contains the full frame including prelude and
/// trailing CRC32; the caller can append it to a segment directly.
///
/// # Errors
///
/// Returns [`Error::LimitExceeded`] when the payload exceeds
/// `max_payload_bytes`, or any length field would overflow its wire type.
pub fn encode_record(event: &Event, max_payload_bytes: usize) -> Result<Vec<u8>, Error> {
    if event.payload.len() > max_payload_bytes {
        return Err(Error::LimitExceeded {
            field: "payload",
            len: event.payload.len(),
            max: max_payload_bytes,
        });
    }
    let topic_bytes = event.topic.as_bytes();
    if topic_bytes.len() > u16::MAX as usize {
        return Err(Error::LimitExceeded {
            field: "topic",
            len: topic_bytes.len(),
            max: u16::MAX as usize,
        });
    }

    let headers = encode_headers(&event.headers)?;
    let body_len = FIXED_BODY_SIZE + topic_bytes.len() + event.payload.len() + headers.len();
    if body_len > u32::MAX as usize {
        return Err(Error::LimitExceeded {
            field: "record",
            len: body_len,
            max: u32::MAX as usize,
        });
    }

    let mut buf = Vec::with_capacity(PRELUDE_SIZE + body_len);
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes()); // flags, reserved
    buf.extend_from_slice(&(body_len as u32).to_le_bytes());

    // -- Begin CRC-protected region --
    buf.extend_from_slice(event.event_id.as_bytes());
    buf.extend_from_slice(&event.ts_unix_nanos.to_le_bytes());
    buf.extend_from_slice(&(topic_bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(topic_bytes);
    buf.extend_from_slice(&(event.payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&event.payload);
    buf.extend_from_slice(&(headers.len() as u32).to_le_bytes());
    buf.extend_from_slice(&headers);
    // -- End CRC-protected region --

    let crc = crc32fast::hash(&buf[PRELUDE_SIZE..]);
    buf.extend_from_slice(&crc.to_le_bytes());

    Ok(buf)
}

/// Serialize a header map as sorted `(u16 len, key, u16 len, val)` pairs.
fn encode_headers(headers: &HashMap<String, String>) -> Result<Vec<u8>, Error> {
    let mut keys: Vec<&String> = headers.keys().collect();
    keys.sort();

    let mut buf = Vec::new();
    for key in keys {
        let value = &headers[key];
        for (field, text) in [("header key", key), ("header value", value)] {
            if text.len() > u16::MAX as usize {
                return Err(Error::LimitExceeded {
                    field,
                    len: text.len(),
                    max: u16::MAX as usize,
                });
            }
        }
        buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
        buf.extend_from_slice(key.as_bytes());
        buf.extend_from_slice(&(value.len() as u16).to_le_bytes());
        buf.extend_from_slice(value.as_bytes());
    }
    Ok(buf)
}

/// Decode a single record from the start of a byte buffer.
///
/// `segment` and `offset` locate the buffer within the log; they only feed
/// error context, never the decode itself.
///
/// Handles three cases:
///
/// 1. **Complete record** -- returns [`DecodeOutcome::Complete`] with the
///    event and the total number of bytes consumed.
/// 2. **Incomplete data** -- the buffer ends before the frame does (short
///    prelude, or fewer bytes than `RECORD_LEN` promises). Returns
///    [`DecodeOutcome::Incomplete`]; the caller decides whether that is a
///    recoverable torn tail.
/// 3. **Corrupt data** -- bad magic, unknown version, inconsistent length
///    fields, an implausible payload length, invalid UTF-8, or a CRC
///    mismatch. Returns [`Error::CorruptRecord`].
///
/// # Errors
///
/// Returns [`Error::CorruptRecord`] carrying `segment`/`offset` and a
/// description of the mismatch.
pub fn decode_record(
    buf: &[u8],
    segment: u32,
    offset: u64,
    max_payload_bytes: usize,
) -> Result<DecodeOutcome<Event>, Error> {
    let corrupt = |detail: String| Error::CorruptRecord {
        segment,
        offset,
        detail,
    };

    if buf.len() < PRELUDE_SIZE {
        return Ok(DecodeOutcome::Incomplete);
    }

    if buf[0..4] != MAGIC {
        return Err(corrupt("bad record magic".to_string()));
    }
    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version != FORMAT_VERSION {
        return Err(corrupt(format!("unsupported record version: {version}")));
    }
    // buf[6..8] are the reserved flags; ignored on decode.

    let record_len = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
    if record_len < FIXED_BODY_SIZE {
        return Err(corrupt(format!(
            "record length {record_len} below fixed minimum {FIXED_BODY_SIZE}"
        )));
    }
    let total = PRELUDE_SIZE + record_len;
    if buf.len() < total {
        // Could equally be a torn write or corrupted length bytes; treat as
        // truncation so the active-segment tail stays recoverable.
        return Ok(DecodeOutcome::Incomplete);
    }

    let body = &buf[PRELUDE_SIZE..total];
    let crc_offset = body.len() - 4;
    let stored_crc = u32::from_le_bytes([
        body[crc_offset],
        body[crc_offset + 1],
        body[crc_offset + 2],
        body[crc_offset + 3],
    ]);
    let computed_crc = crc32fast::hash(&body[..crc_offset]);
    if stored_crc != computed_crc {
        return Err(corrupt(format!(
            "CRC32 mismatch: stored {stored_crc:#010X}, computed {computed_crc:#010X}"
        )));
    }

    let protected = &body[..crc_offset];
    let mut cursor = 0;

    // Read N bytes from `protected` at `cursor` and advance, or fail with
    // CorruptRecord if the remaining data is too short.
    macro_rules! read_bytes {
        ($n:expr) => {{
            if cursor + $n > protected.len() {
                return Err(corrupt("unexpected end of record body".to_string()));
            }
            let start = cursor;
            cursor += $n;
            &protected[start..cursor]
        }};
    }

    let id_bytes = read_bytes!(EVENT_ID_LEN);
    let event_id = EventId::from_bytes(id_bytes.try_into().expect("16 bytes for event id"));

    let ts_bytes = read_bytes!(8);
    let ts_unix_nanos = i64::from_le_bytes(ts_bytes.try_into().expect("8 bytes for i64"));

    let topic_len = u16::from_le_bytes(read_bytes!(2).try_into().expect("2 bytes for u16")) as usize;
    let topic_bytes = read_bytes!(topic_len);
    let topic = std::str::from_utf8(topic_bytes)
        .map_err(|e| corrupt(format!("invalid UTF-8 in topic: {e}")))?
        .to_string();

    let payload_len =
        u32::from_le_bytes(read_bytes!(4).try_into().expect("4 bytes for u32")) as usize;
    if payload_len > max_payload_bytes {
        return Err(corrupt(format!(
            "payload length {payload_len} exceeds {max_payload_bytes} byte limit"
        )));
    }
    let payload = Bytes::copy_from_slice(read_bytes!(payload_len));

    let headers_len =
        u32::from_le_bytes(read_bytes!(4).try_into().expect("4 bytes for u32")) as usize;
    let header_bytes = read_bytes!(headers_len);
    let headers = decode_headers(header_bytes).map_err(corrupt)?;

    // Every sub-length plus the fixed overhead must account for RECORD_LEN
    // exactly; trailing slack means the length fields disagree.
    if cursor != protected.len() {
        return Err(corrupt(format!(
            "length fields inconsistent: {} of {} body bytes consumed",
            cursor,
            protected.len()
        )));
    }

    Ok(DecodeOutcome::Complete {
        value: Event {
            event_id,
            ts_unix_nanos,
            topic,
            payload,
            headers,
        },
        consumed: total,
    })
}

/// Parse sorted `(u16 len, key, u16 len, val)` pairs.
fn decode_headers(mut buf: &[u8]) -> Result<HashMap<String, String>, String> {
    let mut headers = HashMap::new();
    while !buf.is_empty() {
        let mut next_str = |what: &str| -> Result<String, String> {
            if buf.len() < 2 {
                return Err(format!("headers truncated before {what} length"));
            }
            let len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
            buf = &buf[2..];
            if buf.len() < len {
                return Err(format!("headers truncated inside {what}"));
            }
            let text = std::str::from_utf8(&buf[..len])
                .map_err(|e| format!("invalid UTF-8 in {what}: {e}"))?
                .to_string();
            buf = &buf[len..];
            Ok(text)
        };
        let key = next_str("header key")?;
        let value = next_str("header value")?;
        headers.insert(key, value);
    }
    Ok(headers)
}
