//! Segment images and the in-memory tail buffer.
//!
//! # Segment format
//!
//! ```text
//! +----------------+---------------------------+--------------------+-----------+
//! | version (i32)  | start monotonic ms (i64)  | payload len (i32)  | payload   |
//! +----------------+---------------------------+--------------------+-----------+
//! ```
//!
//! The payload is a run of encoded records; its length is always a multiple
//! of four.

use crate::codec::parcel::{ParcelReader, ParcelWriter};
use crate::error::{HistoryError, Result};

/// Format version written into every segment header.
pub const HISTORY_VERSION: i32 = 211;

/// Size of the segment header in bytes.
pub const SEGMENT_HEADER_SIZE: usize = 16;

/// A payload may not exceed this many times the configured segment size.
const MAX_PAYLOAD_FACTOR: usize = 100;

/// Parsed segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Format version.
    pub version: i32,
    /// Monotonic time at which the segment was created.
    pub start_time_ms: i64,
    /// Length of the record payload in bytes.
    pub payload_len: usize,
}

impl SegmentHeader {
    /// Header for a payload of `payload_len` bytes written by this build.
    pub fn new(start_time_ms: i64, payload_len: usize) -> Self {
        Self {
            version: HISTORY_VERSION,
            start_time_ms,
            payload_len,
        }
    }

    fn write_to(&self, writer: &mut ParcelWriter<'_>) {
        writer.write_i32(self.version);
        writer.write_i64(self.start_time_ms);
        writer.write_i32(self.payload_len as i32);
    }
}

/// Serializes a complete segment image.
pub fn encode_segment(start_time_ms: i64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SEGMENT_HEADER_SIZE + payload.len());
    SegmentHeader::new(start_time_ms, payload.len()).write_to(&mut ParcelWriter::new(&mut out));
    out.extend_from_slice(payload);
    out
}

/// Validates a segment image and returns its header and payload.
///
/// # Errors
///
/// Returns [`HistoryError::UnsupportedVersion`] if the version differs from
/// [`HISTORY_VERSION`], and [`HistoryError::CorruptSegment`] if the payload
/// length is negative, misaligned, larger than `100 * max_segment_bytes`, or
/// longer than the bytes actually present.
pub fn parse_segment(bytes: &[u8], max_segment_bytes: usize) -> Result<(SegmentHeader, &[u8])> {
    let mut reader = ParcelReader::new(bytes);
    let version = reader.read_i32()?;
    if version != HISTORY_VERSION {
        return Err(HistoryError::UnsupportedVersion {
            found: version,
            expected: HISTORY_VERSION,
        });
    }
    let start_time_ms = reader.read_i64()?;
    let len = reader.read_i32()?;
    if len < 0 {
        return Err(HistoryError::CorruptSegment(format!(
            "negative payload length {}",
            len
        )));
    }
    let len = len as usize;
    if len % 4 != 0 {
        return Err(HistoryError::CorruptSegment(format!(
            "payload length {} is not a multiple of 4",
            len
        )));
    }
    if len >= max_segment_bytes.saturating_mul(MAX_PAYLOAD_FACTOR) {
        return Err(HistoryError::CorruptSegment(format!(
            "payload length {} exceeds limit for {}-byte segments",
            len, max_segment_bytes
        )));
    }
    if len > reader.remaining() {
        return Err(HistoryError::CorruptSegment(format!(
            "payload length {} but only {} bytes present",
            len,
            reader.remaining()
        )));
    }
    let start = reader.position();
    Ok((
        SegmentHeader {
            version,
            start_time_ms,
            payload_len: len,
        },
        &bytes[start..start + len],
    ))
}

/// Append-only record buffer of the active segment.
///
/// Remembers where the most recent record starts so merge-on-write can
/// truncate back to it.
#[derive(Debug, Clone, Default)]
pub struct HistoryBuffer {
    data: Vec<u8>,
    last_pos: Option<usize>,
}

impl HistoryBuffer {
    /// Creates an empty buffer pre-sized to half of `max_segment_bytes`.
    pub fn new(max_segment_bytes: usize) -> Self {
        Self {
            data: Vec::with_capacity(max_segment_bytes / 2),
            last_pos: None,
        }
    }

    /// Wraps payload bytes loaded from disk.
    pub fn from_payload(payload: Vec<u8>) -> Self {
        Self {
            data: payload,
            last_pos: None,
        }
    }

    /// Payload bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if no record has been appended.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Start offset of the most recently appended record.
    pub fn last_pos(&self) -> Option<usize> {
        self.last_pos
    }

    /// True if appending `record_len` bytes to a non-empty buffer would exceed `max`.
    pub fn would_overflow(&self, record_len: usize, max: usize) -> bool {
        !self.data.is_empty() && self.data.len() + record_len > max
    }

    /// Appends an encoded record and returns its start offset.
    pub fn append(&mut self, record: &[u8]) -> usize {
        let pos = self.data.len();
        self.data.extend_from_slice(record);
        self.last_pos = Some(pos);
        pos
    }

    /// Drops the most recently appended record.
    ///
    /// Returns false, leaving the buffer untouched, if there is no record to drop.
    pub fn truncate_last(&mut self) -> bool {
        match self.last_pos.take() {
            Some(pos) => {
                self.data.truncate(pos);
                true
            }
            None => false,
        }
    }

    /// Empties the buffer.
    pub fn clear(&mut self) {
        self.data.clear();
        self.last_pos = None;
    }
}
