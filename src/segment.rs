//! Append-only segment files for a single topic.
//!
//! A topic's log is a directory of numbered segment files
//! (`log-00000001.seg`, `log-00000002.seg`, ...). Only the highest-numbered
//! segment is ever written; rotation fsyncs and seals it, then opens the
//! next number. The [`SegmentStore`] is owned exclusively by the topic's
//! writer task, which makes [`SegmentStore::append`] the sole mutation
//! point for the files.
//!
//! Reads do not go through the store: recovery and subscription replay scan
//! segment files directly via [`scan_segment`], which is safe because
//! sealed segments are immutable and readers cap themselves at a committed
//! end-of-log snapshot.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::codec::{self, DecodeOutcome, PRELUDE_SIZE};
use crate::error::Error;
use crate::types::Event;

/// The number of the first segment ever created for a topic.
const FIRST_SEGMENT: u32 = 1;

/// File name for a segment number, e.g. `log-00000007.seg`.
pub(crate) fn segment_file_name(number: u32) -> String {
    format!("log-{number:08}.seg")
}

/// Inverse of [`segment_file_name`]; `None` for foreign files (snapshots,
/// editor droppings) so enumeration skips them.
fn parse_segment_file_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("log-")?.strip_suffix(".seg")?;
    if digits.len() != 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Owns the segment files of one topic directory.
pub(crate) struct SegmentStore {
    /// Topic directory, e.g. `<data_dir>/topics/orders/`.
    dir: PathBuf,
    /// All segment numbers, ascending; the last entry is the active one.
    numbers: Vec<u32>,
    /// Write handle for the active segment.
    active: File,
    /// Logical length of the active segment. Appends seek here rather than
    /// to the physical end, so a failed partial write gets overwritten by
    /// the next append instead of poisoning the log.
    active_len: u64,
}

impl SegmentStore {
    /// Open (or create) the segment directory and its active segment.
    ///
    /// Creates the directory and `log-00000001.seg` on first use, fsyncing
    /// the parent directory so the new entries survive a crash.
    pub fn open(dir: &Path) -> Result<SegmentStore, Error> {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
            if let Some(parent) = dir.parent() {
                File::open(parent)?.sync_all()?;
            }
        }

        let mut numbers: Vec<u32> = fs::read_dir(dir)?
            .filter_map(|entry| {
                let entry = entry.ok()?;
                parse_segment_file_name(entry.file_name().to_str()?)
            })
            .collect();
        numbers.sort_unstable();

        if numbers.is_empty() {
            let first = dir.join(segment_file_name(FIRST_SEGMENT));
            OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&first)?;
            File::open(dir)?.sync_all()?;
            numbers.push(FIRST_SEGMENT);
        }

        let active_number = *numbers.last().expect("at least one segment exists");
        let active = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.join(segment_file_name(active_number)))?;
        let active_len = active.metadata()?.len();

        Ok(SegmentStore {
            dir: dir.to_path_buf(),
            numbers,
            active,
            active_len,
        })
    }

    /// The topic directory this store owns.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Lowest segment number (where `StartFrom::Beginning` resolves).
    pub fn first_segment(&self) -> u32 {
        self.numbers[0]
    }

    /// All segment numbers in ascending order.
    pub fn segment_numbers(&self) -> &[u32] {
        &self.numbers
    }

    /// `(active segment, logical end offset)` -- the current end of the log.
    pub fn end(&self) -> (u32, u64) {
        (
            *self.numbers.last().expect("at least one segment exists"),
            self.active_len,
        )
    }

    /// Absolute path of a segment file.
    pub fn path_for(&self, number: u32) -> PathBuf {
        self.dir.join(segment_file_name(number))
    }

    /// Append one encoded record to the active segment.
    ///
    /// Returns the start offset of the record. Does not fsync; durability
    /// is the writer's policy decision.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64, Error> {
        let offset = self.active_len;
        self.active.seek(SeekFrom::Start(offset))?;
        self.active.write_all(bytes)?;
        self.active_len += bytes.len() as u64;
        Ok(offset)
    }

    /// Force the active segment's bytes to stable storage.
    pub fn sync(&self) -> Result<(), Error> {
        self.active.sync_all()?;
        Ok(())
    }

    /// Whether appending `incoming` more bytes should trigger rotation.
    ///
    /// An empty active segment never rotates -- a record larger than the
    /// threshold still has to live somewhere.
    pub fn would_overflow(&self, incoming: u64, max_segment_bytes: u64) -> bool {
        self.active_len > 0 && self.active_len + incoming > max_segment_bytes
    }

    /// Seal the active segment and open the next one.
    ///
    /// The sealed segment is fsynced first so rotation never races ahead of
    /// its data, and the directory is fsynced so the new file's entry is
    /// durable.
    pub fn rotate(&mut self) -> Result<u32, Error> {
        self.active.sync_all()?;

        let next = self.numbers.last().expect("at least one segment") + 1;
        let path = self.dir.join(segment_file_name(next));
        let file = OpenOptions::new().create_new(true).write(true).read(true).open(&path)?;
        File::open(&self.dir)?.sync_all()?;

        tracing::debug!(segment = next, dir = %self.dir.display(), "rotated segment");
        self.numbers.push(next);
        self.active = file;
        self.active_len = 0;
        Ok(next)
    }

    /// Truncate the active segment to `offset`. Recovery-only: discards a
    /// torn tail so the segment ends exactly at the last valid record.
    pub fn truncate_active(&mut self, offset: u64) -> Result<(), Error> {
        self.active.set_len(offset)?;
        self.active.sync_all()?;
        self.active_len = offset;
        Ok(())
    }

    /// Read and decode exactly one record.
    ///
    /// # Errors
    ///
    /// [`Error::TruncatedTail`] when the file ends before the frame does,
    /// [`Error::CorruptRecord`] on framing/CRC mismatch.
    pub fn read_record(
        &self,
        number: u32,
        offset: u64,
        max_payload_bytes: usize,
    ) -> Result<Event, Error> {
        let mut file = File::open(self.path_for(number))?;
        let file_len = file.metadata()?.len();
        file.seek(SeekFrom::Start(offset))?;

        let truncated = || Error::TruncatedTail {
            segment: number,
            offset,
        };

        let mut frame = vec![0u8; PRELUDE_SIZE];
        file.read_exact(&mut frame).map_err(|_| truncated())?;
        let record_len =
            u32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]]) as u64;
        let remaining = file_len.saturating_sub(offset + PRELUDE_SIZE as u64);
        if record_len > remaining {
            return Err(truncated());
        }

        frame.resize(PRELUDE_SIZE + record_len as usize, 0);
        file.read_exact(&mut frame[PRELUDE_SIZE..])
            .map_err(|_| truncated())?;

        match codec::decode_record(&frame, number, offset, max_payload_bytes)? {
            DecodeOutcome::Complete { value, .. } => Ok(value),
            DecodeOutcome::Incomplete => Err(truncated()),
        }
    }
}

/// A defect found at the tail of a segment scan.
#[derive(Debug)]
pub(crate) struct SegmentDefect {
    /// Offset where valid data ends (start of the defective record).
    pub offset: u64,
    /// What stopped the scan.
    pub detail: String,
}

/// Result of sequentially decoding one whole segment file.
#[derive(Debug)]
pub(crate) struct SegmentScan {
    /// Every valid record with its start offset, in file order.
    pub records: Vec<(u64, Event)>,
    /// Offset one past the last valid record.
    pub end: u64,
    /// `Some` when the scan stopped before end-of-file (torn write or
    /// corruption); `None` for a clean segment.
    pub defect: Option<SegmentDefect>,
}

/// Decode every record of a segment file, stopping at the first defect.
///
/// Used by recovery (index rebuild + tail repair decision) and shared with
/// tests. The whole file is read into memory, mirroring the recovery scan
/// being a startup-only path.
///
/// # Errors
///
/// Only I/O failures reading the file; decode problems are reported in
/// [`SegmentScan::defect`], because whether they are fatal depends on the
/// segment's position in the log.
pub(crate) fn scan_segment(
    path: &Path,
    number: u32,
    max_payload_bytes: usize,
) -> Result<SegmentScan, Error> {
    let data = fs::read(path)?;
    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset < data.len() {
        match codec::decode_record(&data[offset..], number, offset as u64, max_payload_bytes) {
            Ok(DecodeOutcome::Complete { value, consumed }) => {
                records.push((offset as u64, value));
                offset += consumed;
            }
            Ok(DecodeOutcome::Incomplete) => {
                return Ok(SegmentScan {
                    records,
                    end: offset as u64,
                    defect: Some(SegmentDefect {
                        offset: offset as u64,
                        detail: "incomplete record frame".to_string(),
                    }),
                });
            }
            Err(Error::CorruptRecord { detail, .. }) => {
                return Ok(SegmentScan {
                    records,
                    end: offset as u64,
                    defect: Some(SegmentDefect {
                        offset: offset as u64,
                        detail,
                    }),
                });
            }
            Err(e) => return Err(e),
        }
    }

    Ok(SegmentScan {
        records,
        end: offset as u64,
        defect: None,
    })
}
