//! Read paths over a battery history: forward iterators and snapshots.
//!
//! An iterator walks its sources in order (sealed segment files, then
//! standalone in-memory segments, then the tail) and decodes each one
//! against its own running baseline. A source that cannot be read or fails
//! validation is logged and skipped; iteration never fails as a whole.

use crate::codec::parcel::ParcelReader;
use crate::codec::{decode_delta, DecoderState};
use crate::error::Result;
use crate::item::HistoryItem;
use crate::lifecycle::directory::{SegmentDirectory, SegmentFile};
use crate::lifecycle::retention::RetentionHold;
use crate::segment::{encode_segment, parse_segment};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Keeps a log read-only while alive.
#[derive(Debug)]
pub struct ReadOnlyGuard {
    iterators: Arc<AtomicUsize>,
}

impl ReadOnlyGuard {
    pub(crate) fn new(iterators: Arc<AtomicUsize>) -> Self {
        iterators.fetch_add(1, Ordering::AcqRel);
        Self { iterators }
    }
}

impl Drop for ReadOnlyGuard {
    fn drop(&mut self) {
        self.iterators.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Everything an iterator needs, assembled by the log or a snapshot.
pub(crate) struct IteratorSources {
    pub directory: Option<Arc<SegmentDirectory>>,
    pub files: Vec<SegmentFile>,
    pub images: Vec<Vec<u8>>,
    pub start_ms: i64,
    pub end_ms: i64,
    pub max_segment_bytes: usize,
    pub read_only: Option<ReadOnlyGuard>,
    pub hold: Option<RetentionHold>,
}

enum Source {
    File(SegmentFile),
    Memory(Vec<u8>),
}

struct Cursor {
    payload: Vec<u8>,
    pos: usize,
    prev: Option<HistoryItem>,
}

/// Forward-only cursor over decoded history records.
///
/// Records are yielded in non-decreasing time order, limited to
/// `start_ms <= time < end_ms` (`end_ms == 0` means unbounded). The guards
/// taken at creation are released when the iterator is exhausted,
/// [`finish`](Self::finish)ed or dropped.
pub struct HistoryIterator {
    directory: Option<Arc<SegmentDirectory>>,
    sources: VecDeque<Source>,
    cursor: Option<Cursor>,
    decoder: DecoderState,
    start_ms: i64,
    end_ms: i64,
    max_segment_bytes: usize,
    read_only: Option<ReadOnlyGuard>,
    hold: Option<RetentionHold>,
}

impl HistoryIterator {
    pub(crate) fn new(sources: IteratorSources) -> Self {
        let mut queue: VecDeque<Source> = sources.files.into_iter().map(Source::File).collect();
        queue.extend(sources.images.into_iter().map(Source::Memory));
        Self {
            directory: sources.directory,
            sources: queue,
            cursor: None,
            decoder: DecoderState::new(),
            start_ms: sources.start_ms,
            end_ms: sources.end_ms,
            max_segment_bytes: sources.max_segment_bytes,
            read_only: sources.read_only,
            hold: sources.hold,
        }
    }

    /// Stops iterating and releases the read-only and retention guards.
    pub fn finish(&mut self) {
        self.sources.clear();
        self.cursor = None;
        self.read_only = None;
        self.hold = None;
    }

    /// Tags and descriptors decoded so far from the current segment.
    pub fn decoder_state(&self) -> &DecoderState {
        &self.decoder
    }

    fn open_next(&mut self) -> Option<Cursor> {
        while let Some(source) = self.sources.pop_front() {
            match self.load(&source) {
                Ok(payload) => {
                    // segments are self-contained; tags never carry over
                    self.decoder = DecoderState::new();
                    return Some(Cursor {
                        payload,
                        pos: 0,
                        prev: None,
                    })
                }
                Err(err) => match &source {
                    Source::File(segment) => warn!(
                        "Skipping battery history segment {}: {}",
                        segment.path.display(),
                        err
                    ),
                    Source::Memory(_) => {
                        warn!("Skipping in-memory battery history segment: {}", err)
                    }
                },
            }
        }
        None
    }

    fn load(&self, source: &Source) -> Result<Vec<u8>> {
        let image = match source {
            Source::File(segment) => match &self.directory {
                Some(directory) => directory.read_segment(segment)?,
                None => std::fs::read(&segment.path)?,
            },
            Source::Memory(image) => image.clone(),
        };
        let (_, payload) = parse_segment(&image, self.max_segment_bytes)?;
        Ok(payload.to_vec())
    }

    fn decode_next(&mut self) -> Option<HistoryItem> {
        loop {
            if self.cursor.is_none() {
                self.cursor = self.open_next();
            }
            let cursor = self.cursor.as_mut()?;
            if cursor.pos >= cursor.payload.len() {
                self.cursor = None;
                continue;
            }

            let mut reader = ParcelReader::new(&cursor.payload[cursor.pos..]);
            match decode_delta(&mut reader, cursor.prev.as_ref(), &mut self.decoder) {
                Ok(item) => {
                    cursor.pos += reader.position();
                    cursor.prev = Some(item.clone());
                    return Some(item);
                }
                Err(err) => {
                    warn!(
                        "Dropping rest of battery history segment at offset {}: {}",
                        cursor.pos, err
                    );
                    self.cursor = None;
                }
            }
        }
    }
}

impl Iterator for HistoryIterator {
    type Item = HistoryItem;

    fn next(&mut self) -> Option<HistoryItem> {
        while let Some(item) = self.decode_next() {
            if item.time < self.start_ms {
                continue;
            }
            if self.end_ms != 0 && item.time >= self.end_ms {
                break;
            }
            return Some(item);
        }
        debug!("Battery history iteration finished");
        self.finish();
        None
    }
}

/// Read-only view of a log at a point in time.
///
/// Holds a private copy of the tail and references to sealed files, which
/// stay on disk for the snapshot's lifetime. Writes to the live log after the
/// snapshot was taken are not visible through it.
pub struct HistorySnapshot {
    directory: Option<Arc<SegmentDirectory>>,
    sealed: Vec<SegmentFile>,
    legacy: Vec<Vec<u8>>,
    tail: Option<(i64, Vec<u8>)>,
    max_segment_bytes: usize,
    hold: Option<RetentionHold>,
}

impl HistorySnapshot {
    pub(crate) fn new(
        directory: Arc<SegmentDirectory>,
        sealed: Vec<SegmentFile>,
        tail_start_ms: i64,
        tail: Vec<u8>,
        max_segment_bytes: usize,
    ) -> Self {
        let hold = RetentionHold::new(Arc::clone(&directory));
        Self {
            directory: Some(directory),
            sealed,
            legacy: Vec::new(),
            tail: Some((tail_start_ms, tail)),
            max_segment_bytes,
            hold: Some(hold),
        }
    }

    /// Builds a view over standalone segment images (header included), read
    /// in the given order.
    pub fn from_legacy_segments(images: Vec<Vec<u8>>, max_segment_bytes: usize) -> Self {
        Self {
            directory: None,
            sealed: Vec::new(),
            legacy: images,
            tail: None,
            max_segment_bytes,
            hold: None,
        }
    }

    /// Sealed segment files referenced by the snapshot.
    pub fn sealed_segments(&self) -> &[SegmentFile] {
        &self.sealed
    }

    /// Length of the copied tail payload.
    pub fn tail_len(&self) -> usize {
        self.tail.as_ref().map(|(_, tail)| tail.len()).unwrap_or(0)
    }

    /// Opens an iterator over records with `start_ms <= time < end_ms`.
    ///
    /// The live log stays writable; only its retention is held.
    pub fn iterate(&self, start_ms: i64, end_ms: i64) -> HistoryIterator {
        let tail_start = self.tail.as_ref().map(|(start, _)| *start);
        let files = select_sealed(&self.sealed, tail_start, start_ms, end_ms);
        let mut images = self.legacy.clone();
        if let Some((tail_start, tail)) = &self.tail {
            if end_ms == 0 || *tail_start < end_ms {
                images.push(encode_segment(*tail_start, tail));
            }
        }
        HistoryIterator::new(IteratorSources {
            directory: self.directory.clone(),
            files,
            images,
            start_ms,
            end_ms,
            max_segment_bytes: self.max_segment_bytes,
            read_only: None,
            hold: self.hold.clone(),
        })
    }
}

/// Chooses the sealed segments an iteration over `[start_ms, end_ms)` reads.
///
/// Starts at the segment covering `start_ms` (the newest one created at or
/// before it, counting the tail) and stops before the first segment created
/// at or after `end_ms`; `end_ms == 0` means unbounded.
pub(crate) fn select_sealed(
    sealed: &[SegmentFile],
    tail_start_ms: Option<i64>,
    start_ms: i64,
    end_ms: i64,
) -> Vec<SegmentFile> {
    if matches!(tail_start_ms, Some(tail) if tail <= start_ms) {
        return Vec::new();
    }
    let begin = sealed
        .iter()
        .rposition(|segment| segment.start_time_ms <= start_ms)
        .unwrap_or(0);
    sealed[begin..]
        .iter()
        .take_while(|segment| end_ms == 0 || segment.start_time_ms < end_ms)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_delta, EncoderState};
    use crate::item::{HistoryCmd, HistoryTag, STATE_SCREEN_ON_FLAG};
    use std::path::PathBuf;

    fn file(start: i64) -> SegmentFile {
        SegmentFile {
            start_time_ms: start,
            path: PathBuf::from(format!("{}.bh", start)),
        }
    }

    fn segment_image(start: i64, times: &[i64]) -> Vec<u8> {
        let mut payload = Vec::new();
        let mut encoder = EncoderState::new();
        let mut prev: Option<HistoryItem> = None;
        for (i, time) in times.iter().enumerate() {
            let mut item = HistoryItem::new();
            item.cmd = HistoryCmd::Update;
            item.time = *time;
            item.battery_level = 90;
            item.states = if i % 2 == 0 { STATE_SCREEN_ON_FLAG } else { 0 };
            encode_delta(&mut payload, &item, prev.as_ref(), &mut encoder);
            prev = Some(item);
        }
        encode_segment(start, &payload)
    }

    fn times(iter: HistoryIterator) -> Vec<i64> {
        iter.map(|item| item.time).collect()
    }

    #[test]
    fn test_select_sealed_ranges() {
        let sealed = vec![file(100), file(200), file(300)];
        let starts = |v: Vec<SegmentFile>| v.iter().map(|s| s.start_time_ms).collect::<Vec<_>>();

        assert_eq!(starts(select_sealed(&sealed, Some(400), 0, 0)), vec![100, 200, 300]);
        assert_eq!(starts(select_sealed(&sealed, Some(400), 250, 0)), vec![200, 300]);
        assert_eq!(starts(select_sealed(&sealed, Some(400), 0, 300)), vec![100, 200]);
        assert!(select_sealed(&sealed, Some(400), 450, 0).is_empty());
        assert_eq!(starts(select_sealed(&sealed, None, 450, 0)), vec![300]);
    }

    #[test]
    fn test_legacy_segments_in_order() {
        let snapshot = HistorySnapshot::from_legacy_segments(
            vec![segment_image(0, &[10, 20, 30]), segment_image(100, &[110, 120])],
            4096,
        );
        assert_eq!(times(snapshot.iterate(0, 0)), vec![10, 20, 30, 110, 120]);
        assert_eq!(times(snapshot.iterate(20, 115)), vec![20, 30, 110]);
    }

    #[test]
    fn test_bad_source_is_skipped() {
        let mut bad_version = segment_image(50, &[60, 70]);
        bad_version[0] ^= 0x01;
        let mut truncated = segment_image(80, &[85, 90, 95]);
        truncated.truncate(truncated.len() - 8);
        // fix up the length so only record decoding fails
        let len = (truncated.len() - 16) as i32;
        truncated[12..16].copy_from_slice(&len.to_le_bytes());

        let snapshot = HistorySnapshot::from_legacy_segments(
            vec![
                segment_image(0, &[10]),
                bad_version,
                truncated,
                segment_image(100, &[110]),
            ],
            4096,
        );
        assert_eq!(times(snapshot.iterate(0, 0)), vec![10, 85, 90, 110]);
    }

    #[test]
    fn test_tags_do_not_leak_across_segments() {
        let tag = HistoryTag::new("*alarm*", 1000);
        let mut encoder = EncoderState::new();

        let mut tagged = HistoryItem::new();
        tagged.cmd = HistoryCmd::Update;
        tagged.time = 10;
        tagged.battery_level = 90;
        tagged.wakelock_tag = Some(tag.clone());
        let mut first = Vec::new();
        encode_delta(&mut first, &tagged, None, &mut encoder);

        // second segment reuses the encoder without starting a new segment,
        // so its delta refers to the tag by index only
        let mut plain = tagged.clone();
        plain.time = 110;
        plain.wakelock_tag = None;
        let mut again = plain.clone();
        again.time = 120;
        again.wakelock_tag = Some(tag);
        let mut second = Vec::new();
        encode_delta(&mut second, &plain, None, &mut encoder);
        encode_delta(&mut second, &again, Some(&plain), &mut encoder);

        let snapshot = HistorySnapshot::from_legacy_segments(
            vec![encode_segment(0, &first), encode_segment(100, &second)],
            4096,
        );
        assert_eq!(times(snapshot.iterate(0, 0)), vec![10, 110]);
    }

    #[test]
    fn test_read_only_guard_counts() {
        let counter = Arc::new(AtomicUsize::new(0));
        let a = ReadOnlyGuard::new(Arc::clone(&counter));
        let b = ReadOnlyGuard::new(Arc::clone(&counter));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        drop(a);
        drop(b);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
