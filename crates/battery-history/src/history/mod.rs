//! The battery history log: write path, persistence and read views.
//!
//! # Architecture
//!
//! ```text
//! record_*() → scratch item → flush → merge-on-write? → encode_delta
//!            → HistoryBuffer (active segment) → roll → SegmentDirectory
//! ```
//!
//! The log owns one mutable item that the `record_*` / `set_*` calls in
//! [`recorder`] mutate. Each flush encodes it against the last written record
//! and appends the bytes to the active segment's buffer. When the buffer
//! would exceed `max_segment_bytes` the segment is sealed to disk and a new
//! one started; the pending record becomes the new segment's absolute first
//! record.
//!
//! The log is single-writer: callers serialize every mutating call, usually
//! behind a mutex. Iterators may be opened from the same owner; while any is
//! alive the log refuses writes with [`HistoryError::ReadOnly`].

pub mod recorder;

use crate::clock::{Clock, SystemClock};
use crate::codec::{decode_delta, encode_delta, DecoderState, EncoderState};
use crate::codec::parcel::ParcelReader;
use crate::error::{HistoryError, Result};
use crate::item::{HistoryCmd, HistoryItem, HistoryTag, EVENT_NONE, STATE_CPU_RUNNING_FLAG};
use crate::iter::{select_sealed, HistoryIterator, HistorySnapshot, IteratorSources, ReadOnlyGuard};
use crate::lifecycle::directory::{SegmentDirectory, SegmentFile, SyncMode};
use crate::lifecycle::retention::{
    Fs2SpaceProbe, RetentionHold, RetentionPolicy, SpaceProbe, DEFAULT_MAX_SEGMENT_FILES,
    DEFAULT_MIN_FREE_SPACE_BYTES,
};
use crate::segment::{encode_segment, parse_segment, HistoryBuffer};
use crate::trace::{trace_changes, HistoryTracer};
use recorder::StepDetailsProvider;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Default maximum size of a segment payload (128 KiB).
pub const DEFAULT_MAX_SEGMENT_BYTES: usize = 128 * 1024;

/// Records closer together than this may be merged.
pub const MERGE_WINDOW_MS: i64 = 1000;

/// Uptime lagging elapsed time by more than this means the CPU slept.
pub const CPU_SLEEP_THRESHOLD_MS: i64 = 20;

/// Configuration for a battery history log.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Maximum number of segment files kept, including the active one.
    pub max_segment_files: usize,
    /// Maximum payload size of one segment.
    pub max_segment_bytes: usize,
    /// Free-space floor below which the oldest segment is deleted.
    pub min_free_space_bytes: u64,
    /// Durability of segment writes.
    pub sync_mode: SyncMode,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_segment_files: DEFAULT_MAX_SEGMENT_FILES,
            max_segment_bytes: DEFAULT_MAX_SEGMENT_BYTES,
            min_free_space_bytes: DEFAULT_MIN_FREE_SPACE_BYTES,
            sync_mode: SyncMode::default(),
        }
    }
}

impl HistoryConfig {
    /// Sets the segment file limit.
    pub fn with_max_segment_files(mut self, max_segment_files: usize) -> Self {
        self.max_segment_files = max_segment_files;
        self
    }

    /// Sets the segment size limit.
    pub fn with_max_segment_bytes(mut self, max_segment_bytes: usize) -> Self {
        self.max_segment_bytes = max_segment_bytes;
        self
    }

    /// Sets the free-space floor.
    pub fn with_min_free_space_bytes(mut self, min_free_space_bytes: u64) -> Self {
        self.min_free_space_bytes = min_free_space_bytes;
        self
    }

    /// Sets the sync mode.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }
}

/// A record as it was last encoded, with what the encoder learned about it.
#[derive(Debug, Clone)]
struct WrittenRecord {
    item: HistoryItem,
    tags_first_occurrence: bool,
}

/// Append-only, delta-encoded battery history log.
pub struct BatteryHistory {
    directory: Arc<SegmentDirectory>,
    clock: Arc<dyn Clock>,
    tracer: Option<Arc<dyn HistoryTracer>>,
    step_details: Option<Box<dyn StepDetailsProvider>>,
    max_segment_bytes: usize,

    active: SegmentFile,
    buffer: HistoryBuffer,
    encoder: EncoderState,
    dirty: bool,

    cur: HistoryItem,
    last_written: Option<WrittenRecord>,
    last_last_written: Option<WrittenRecord>,
    last_traced: HistoryItem,
    last_record_time: Option<i64>,
    /// Offset from caller elapsed time to history time; fixed by the first write.
    time_base_ms: Option<i64>,
    /// Lowest history time the next record may carry (set by rehydrate).
    min_next_time: i64,
    track_running: Option<(i64, i64)>,
    last_step_level: Option<u8>,

    recording_enabled: bool,
    have_battery_level: bool,
    needs_start_record: bool,
    iterators: Arc<AtomicUsize>,
}

impl BatteryHistory {
    /// Opens (or creates) a log in `dir` with the system clock and fs2 free-space probe.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or listed, or if
    /// no active segment can be created.
    pub fn open(dir: impl AsRef<Path>, config: HistoryConfig) -> Result<Self> {
        Self::open_with(
            dir,
            config,
            Arc::new(SystemClock::new()),
            Box::new(Fs2SpaceProbe),
        )
    }

    /// Opens a log with an explicit clock and free-space probe.
    ///
    /// The newest segment in the directory becomes the active tail and its
    /// records are decoded to restore the tag pool and the time base. A tail
    /// that fails validation discards all history.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or listed, or if
    /// no active segment can be created.
    pub fn open_with(
        dir: impl AsRef<Path>,
        config: HistoryConfig,
        clock: Arc<dyn Clock>,
        probe: Box<dyn SpaceProbe>,
    ) -> Result<Self> {
        let policy = RetentionPolicy::new(config.max_segment_files, config.min_free_space_bytes);
        let directory = Arc::new(SegmentDirectory::open(
            dir,
            policy,
            probe,
            config.sync_mode,
        )?);

        let (active, fresh) = match directory.active_segment() {
            Some(active) => (active, false),
            None => (directory.create_segment(clock.monotonic_time_ms())?, true),
        };

        let mut history = Self {
            directory,
            clock,
            tracer: None,
            step_details: None,
            max_segment_bytes: config.max_segment_bytes,
            active,
            buffer: HistoryBuffer::new(config.max_segment_bytes),
            encoder: EncoderState::new(),
            dirty: false,
            cur: HistoryItem::new(),
            last_written: None,
            last_last_written: None,
            last_traced: HistoryItem::new(),
            last_record_time: None,
            time_base_ms: None,
            min_next_time: i64::MIN,
            track_running: None,
            last_step_level: None,
            recording_enabled: true,
            have_battery_level: false,
            needs_start_record: true,
            iterators: Arc::new(AtomicUsize::new(0)),
        };
        history.cur.cmd = HistoryCmd::Update;

        if !fresh {
            if let Err(err) = history.rehydrate() {
                warn!(
                    "Discarding battery history in {}: {}",
                    history.directory.path().display(),
                    err
                );
                history.discard_all()?;
            }
        }
        Ok(history)
    }

    fn rehydrate(&mut self) -> Result<()> {
        let image = self.directory.read_segment(&self.active)?;
        if image.is_empty() {
            debug!(
                "Active battery history segment {} is empty",
                self.active.path.display()
            );
            return Ok(());
        }
        let (_, payload) = parse_segment(&image, self.max_segment_bytes)?;

        let mut reader = ParcelReader::new(payload);
        let mut decoder = DecoderState::new();
        let mut last: Option<HistoryItem> = None;
        let mut count = 0usize;
        while !reader.is_empty() {
            let item = decode_delta(&mut reader, last.as_ref(), &mut decoder)?;
            last = Some(item);
            count += 1;
        }

        for (index, tag) in decoder.tags() {
            self.encoder.pool.restore(*index, tag.clone());
        }
        for id in decoder.descriptors().keys() {
            self.encoder.mark_descriptor_written(*id);
        }
        if let Some(last) = last {
            self.min_next_time = last.time + 1;
            self.last_record_time = Some(last.time);
            self.cur = last.without_transient();
            self.cur.cmd = HistoryCmd::Update;
            self.cur.current_time = None;
            self.last_traced = self.cur.clone();
        }
        self.buffer = HistoryBuffer::from_payload(payload.to_vec());
        self.needs_start_record = self.buffer.is_empty();
        debug!(
            "Rehydrated {} battery history record(s) from {}",
            count,
            self.active.path.display()
        );
        Ok(())
    }

    fn discard_all(&mut self) -> Result<()> {
        self.active = self.directory.reset(self.clock.monotonic_time_ms())?;
        self.clear_write_state();
        self.encoder.clear();
        Ok(())
    }

    fn clear_write_state(&mut self) {
        self.buffer.clear();
        self.last_written = None;
        self.last_last_written = None;
        self.last_record_time = None;
        self.track_running = None;
        self.last_step_level = None;
        self.needs_start_record = true;
        self.dirty = false;
    }

    /// Deletes all persisted history and starts a fresh segment.
    ///
    /// Tag indices, merge state and the wall-clock anchor are cleared; the
    /// next record is preceded by a `Reset` marker.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::ReadOnly`] while iterators are open, or an I/O
    /// error if the fresh segment cannot be created.
    pub fn reset(&mut self) -> Result<()> {
        self.check_writable()?;
        self.discard_all()?;
        self.cur.clear_transient();
        self.cur.sync_extensions_flag();
        debug!("Battery history reset");
        Ok(())
    }

    /// Atomically writes the active segment to disk.
    ///
    /// # Errors
    ///
    /// Returns the I/O error; the in-memory state is unchanged and the next
    /// save or roll retries.
    pub fn write_history(&mut self) -> Result<()> {
        let image = encode_segment(self.active.start_time_ms, self.buffer.as_bytes());
        self.directory.write_segment(&self.active, &image)?;
        self.dirty = false;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // write path
    // -----------------------------------------------------------------------

    fn check_writable(&self) -> Result<()> {
        let iterators = self.iterators.load(Ordering::Acquire);
        if iterators > 0 {
            error!(
                "Battery history written while {} iterator(s) hold it read-only",
                iterators
            );
            return Err(HistoryError::ReadOnly { iterators });
        }
        Ok(())
    }

    fn history_time(&mut self, elapsed_ms: i64) -> i64 {
        let base = match self.time_base_ms {
            Some(base) => base,
            None => {
                let base = (self.clock.monotonic_time_ms() - elapsed_ms)
                    .max(self.min_next_time.saturating_sub(elapsed_ms));
                self.time_base_ms = Some(base);
                base
            }
        };
        elapsed_ms + base
    }

    /// Writes the scratch item as an `Update` record, subject to gating.
    pub(crate) fn flush(&mut self, elapsed_ms: i64, uptime_ms: i64) -> Result<()> {
        self.check_writable()?;

        self.cur.sync_extensions_flag();
        if !self.cur.has_extensions() && (!self.recording_enabled || !self.have_battery_level) {
            self.cur.clear_transient();
            return Ok(());
        }

        self.trace_current();

        if let Some(wake) = self.sleep_bridge(elapsed_ms, uptime_ms) {
            self.write_record(wake, false)?;
        }

        self.cur.states |= STATE_CPU_RUNNING_FLAG;
        self.track_running = Some((elapsed_ms, uptime_ms));
        self.attach_step_details();

        let mut item = self.cur.clone();
        item.cmd = HistoryCmd::Update;
        item.current_time = None;
        item.time = self.history_time(elapsed_ms);
        let result = self.write_record(item, true);
        self.cur.clear_transient();
        self.cur.sync_extensions_flag();
        result
    }

    /// Builds the record marking when the CPU went to sleep, if uptime lagged
    /// elapsed time since the last flush.
    fn sleep_bridge(&mut self, elapsed_ms: i64, uptime_ms: i64) -> Option<HistoryItem> {
        let (track_elapsed, track_uptime) = self.track_running?;
        let diff_elapsed = elapsed_ms - track_elapsed;
        let diff_uptime = uptime_ms - track_uptime;
        if diff_uptime >= diff_elapsed - CPU_SLEEP_THRESHOLD_MS {
            return None;
        }
        let last = self.last_written.as_ref()?;
        let last_time = last.item.time;
        let mut sleep = last.item.without_transient();
        sleep.cmd = HistoryCmd::Update;
        sleep.current_time = None;
        sleep.states &= !STATE_CPU_RUNNING_FLAG;
        let sleep_elapsed = elapsed_ms - (diff_elapsed - diff_uptime);
        sleep.time = self.history_time(sleep_elapsed).max(last_time);
        Some(sleep)
    }

    /// Writes a record of a command that bypasses recording gates.
    pub(crate) fn write_command(
        &mut self,
        cmd: HistoryCmd,
        elapsed_ms: i64,
        uptime_ms: i64,
        current_time_ms: i64,
    ) -> Result<()> {
        self.check_writable()?;
        self.cur.sync_extensions_flag();
        self.trace_current();
        if cmd == HistoryCmd::Reset {
            self.needs_start_record = false;
        }
        self.track_running = Some((elapsed_ms, uptime_ms));

        let mut item = self.cur.clone();
        item.cmd = cmd;
        item.current_time = Some(current_time_ms);
        item.time = self.history_time(elapsed_ms);
        let result = self.write_record(item, false);
        self.cur.clear_transient();
        self.cur.sync_extensions_flag();
        result
    }

    fn trace_current(&mut self) {
        if let Some(tracer) = &self.tracer {
            trace_changes(tracer.as_ref(), &self.last_traced, &self.cur);
            self.last_traced.states = self.cur.states;
            self.last_traced.states2 = self.cur.states2;
        }
    }

    fn attach_step_details(&mut self) {
        let Some(provider) = self.step_details.as_mut() else {
            return;
        };
        let level = self.cur.battery_level;
        let due = match self.last_step_level {
            None => true,
            Some(last) => level < last,
        };
        if due {
            self.cur.step_details = provider.step_details();
            self.last_step_level = Some(level);
        }
    }

    fn write_record(&mut self, mut item: HistoryItem, allow_merge: bool) -> Result<()> {
        if self.needs_start_record {
            self.needs_start_record = false;
            let mut marker = item.without_transient();
            marker.cmd = HistoryCmd::Reset;
            marker.current_time = Some(self.clock.current_time_ms());
            self.append_record(marker);
        }

        if allow_merge && self.can_merge(&item) {
            if let Some(last) = self.last_written.take() {
                self.buffer.truncate_last();
                if item.wakelock_tag.is_none() {
                    item.wakelock_tag = last.item.wakelock_tag;
                }
                if item.wake_reason_tag.is_none() {
                    item.wake_reason_tag = last.item.wake_reason_tag;
                }
                if !item.has_event() && last.item.event_code != EVENT_NONE {
                    item.event_code = last.item.event_code;
                    item.event_tag = last.item.event_tag;
                }
                item.time = last.item.time;
                self.last_written = self.last_last_written.take();
            }
        }

        self.append_record(item);
        Ok(())
    }

    fn can_merge(&self, cur: &HistoryItem) -> bool {
        let Some(last) = self.last_written.as_ref() else {
            return false;
        };
        let last_item = &last.item;
        if self.buffer.last_pos().is_none() || last_item.cmd != HistoryCmd::Update {
            return false;
        }
        if cur.time - last_item.time >= MERGE_WINDOW_MS {
            return false;
        }

        let (last_last_states, last_last_states2) = self
            .last_last_written
            .as_ref()
            .map(|w| (w.item.states, w.item.states2))
            .unwrap_or((0, 0));
        let diff_states = last_item.states ^ cur.states;
        let diff_states2 = last_item.states2 ^ cur.states2;
        let last_diff_states = last_item.states ^ last_last_states;
        let last_diff_states2 = last_item.states2 ^ last_last_states2;
        if diff_states & last_diff_states != 0 || diff_states2 & last_diff_states2 != 0 {
            return false;
        }

        let cur_first_occurrence = [
            cur.wakelock_tag.as_ref(),
            cur.wake_reason_tag.as_ref(),
            cur.event_tag.as_ref().filter(|_| cur.has_event()),
        ]
        .into_iter()
        .flatten()
        .any(|tag| self.encoder.pool.peek_is_first_occurrence(tag));
        if last.tags_first_occurrence || cur_first_occurrence {
            return false;
        }

        if (last_item.wakelock_tag.is_some() && cur.wakelock_tag.is_some())
            || (last_item.wake_reason_tag.is_some() && cur.wake_reason_tag.is_some())
            || (last_item.has_event() && cur.has_event())
            || last_item.step_details.is_some()
        {
            return false;
        }

        last_item.battery_level == cur.battery_level
            && last_item.battery_status == cur.battery_status
            && last_item.battery_health == cur.battery_health
            && last_item.battery_plug_type == cur.battery_plug_type
            && last_item.battery_temperature == cur.battery_temperature
            && last_item.battery_voltage == cur.battery_voltage
            && !last_item.has_extensions()
            && !cur.has_extensions()
    }

    fn append_record(&mut self, item: HistoryItem) {
        let mut record = Vec::new();
        let prev = self.last_written.as_ref().map(|w| &w.item);
        let mut meta = encode_delta(&mut record, &item, prev, &mut self.encoder);

        if self.buffer.would_overflow(record.len(), self.max_segment_bytes) {
            match self.roll() {
                Ok(()) => {
                    record.clear();
                    meta = encode_delta(&mut record, &item, None, &mut self.encoder);
                }
                Err(err) => warn!(
                    "Battery history segment roll failed, keeping record in {}: {}",
                    self.active.path.display(),
                    err
                ),
            }
        }

        self.buffer.append(&record);
        self.dirty = true;
        self.last_record_time = Some(item.time);
        self.last_last_written = self.last_written.take();
        self.last_written = Some(WrittenRecord {
            item,
            tags_first_occurrence: meta.tags_first_occurrence,
        });
    }

    fn roll(&mut self) -> Result<()> {
        self.write_history()?;
        let next = self
            .directory
            .create_segment(self.clock.monotonic_time_ms())?;
        debug!(
            "Sealed battery history segment {} ({} bytes), next {}",
            self.active.path.display(),
            self.buffer.len(),
            next.path.display()
        );
        self.active = next;
        self.buffer.clear();
        self.last_written = None;
        self.last_last_written = None;
        self.encoder.start_segment();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // read views
    // -----------------------------------------------------------------------

    /// Opens an iterator over records with `start_ms <= time < end_ms`.
    ///
    /// `end_ms == 0` means "up to now" and includes the active segment. The
    /// log refuses writes and retention is suspended until the iterator is
    /// exhausted or dropped.
    pub fn iterate(&self, start_ms: i64, end_ms: i64) -> HistoryIterator {
        let files = select_sealed(
            &self.directory.sealed_segments(),
            Some(self.active.start_time_ms),
            start_ms,
            end_ms,
        );
        let mut images = Vec::new();
        if end_ms == 0 || self.active.start_time_ms < end_ms {
            images.push(encode_segment(
                self.active.start_time_ms,
                self.buffer.as_bytes(),
            ));
        }
        HistoryIterator::new(IteratorSources {
            directory: Some(Arc::clone(&self.directory)),
            files,
            images,
            start_ms,
            end_ms,
            max_segment_bytes: self.max_segment_bytes,
            read_only: Some(ReadOnlyGuard::new(Arc::clone(&self.iterators))),
            hold: Some(RetentionHold::new(Arc::clone(&self.directory))),
        })
    }

    /// Returns a read-only snapshot that stays valid while the log keeps writing.
    ///
    /// The snapshot copies the active buffer and pins the sealed files by
    /// suspending retention for its lifetime.
    pub fn copy(&self) -> HistorySnapshot {
        HistorySnapshot::new(
            Arc::clone(&self.directory),
            self.directory.sealed_segments(),
            self.active.start_time_ms,
            self.buffer.as_bytes().to_vec(),
            self.max_segment_bytes,
        )
    }

    // -----------------------------------------------------------------------
    // configuration and queries
    // -----------------------------------------------------------------------

    /// Changes the segment file limit and applies it immediately.
    pub fn set_max_segment_files(&mut self, max_segment_files: usize) {
        self.directory.set_max_segment_files(max_segment_files);
    }

    /// Changes the segment size limit; takes effect on the next write.
    pub fn set_max_segment_bytes(&mut self, max_segment_bytes: usize) {
        self.max_segment_bytes = max_segment_bytes;
    }

    /// Current segment file limit.
    pub fn max_segment_files(&self) -> usize {
        self.directory.policy().max_segment_files()
    }

    /// Current segment size limit.
    pub fn max_segment_bytes(&self) -> usize {
        self.max_segment_bytes
    }

    /// Installs a tracer that receives state changes as they are written.
    pub fn set_tracer(&mut self, tracer: Arc<dyn HistoryTracer>) {
        self.tracer = Some(tracer);
    }

    /// Installs the collaborator that supplies step details on level drops.
    pub fn set_step_details_provider(&mut self, provider: Box<dyn StepDetailsProvider>) {
        self.step_details = Some(provider);
    }

    /// The segment directory.
    pub fn directory(&self) -> &Arc<SegmentDirectory> {
        &self.directory
    }

    /// Bytes used by sealed segment files plus the active buffer.
    pub fn history_used_size(&self) -> u64 {
        let sealed: u64 = self
            .directory
            .sealed_segments()
            .iter()
            .filter_map(|segment| fs::metadata(&segment.path).ok())
            .map(|meta| meta.len())
            .sum();
        sealed + self.buffer.len() as u64
    }

    /// Size of the active segment buffer in bytes.
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Monotonic creation time of the oldest segment.
    pub fn start_time_ms(&self) -> i64 {
        self.directory
            .segments()
            .first()
            .map(|segment| segment.start_time_ms)
            .unwrap_or(self.active.start_time_ms)
    }

    /// History time of the most recent record, if any has been written or loaded.
    pub fn end_time_ms(&self) -> Option<i64> {
        self.last_record_time
    }

    /// Number of segments, including the active one.
    pub fn segment_count(&self) -> usize {
        self.directory.segment_count()
    }

    /// Creation times of every segment, oldest first.
    pub fn segment_start_times(&self) -> Vec<i64> {
        self.directory
            .segments()
            .iter()
            .map(|segment| segment.start_time_ms)
            .collect()
    }

    /// Number of interned tags.
    pub fn tag_pool_size(&self) -> usize {
        self.encoder.pool.len()
    }

    /// Total characters across interned tags.
    pub fn tag_pool_chars(&self) -> usize {
        self.encoder.pool.chars()
    }

    /// Resolves a tag pool index.
    pub fn lookup_tag(&self, index: u16) -> Option<HistoryTag> {
        self.encoder.pool.lookup(index)
    }

    /// True while an iterator holds the log read-only.
    pub fn is_read_only(&self) -> bool {
        self.iterators.load(Ordering::Acquire) > 0
    }

    /// The scratch item the next flush will write.
    pub fn current(&self) -> &HistoryItem {
        &self.cur
    }
}

impl Drop for BatteryHistory {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(err) = self.write_history() {
                warn!("Failed to save battery history on drop: {:?}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::item::{
        HistoryTag, EVENT_FLAG_START, EVENT_JOB, STATE_GPS_ON_FLAG, STATE_SCREEN_ON_FLAG,
    };
    use std::io;
    use tempfile::TempDir;

    struct Plenty;

    impl SpaceProbe for Plenty {
        fn available_space(&self, _path: &Path) -> io::Result<u64> {
            Ok(u64::MAX)
        }
    }

    fn open_history(dir: &Path, config: HistoryConfig) -> (BatteryHistory, ManualClock) {
        let clock = ManualClock::new(0, 1_700_000_000_000);
        let history = BatteryHistory::open_with(
            dir,
            config.with_sync_mode(SyncMode::None),
            Arc::new(clock.clone()),
            Box::new(Plenty),
        )
        .unwrap();
        (history, clock)
    }

    fn collect(history: &BatteryHistory) -> Vec<HistoryItem> {
        history.iterate(0, 0).collect()
    }

    #[test]
    fn test_updates_dropped_until_battery_level_known() {
        let temp_dir = TempDir::new().unwrap();
        let (mut history, _clock) = open_history(temp_dir.path(), HistoryConfig::default());

        history.record_state_start_event(10, 10, STATE_SCREEN_ON_FLAG).unwrap();
        assert_eq!(history.buffer_len(), 0);

        history.set_battery_state(false, 3, 80, 3_000_000);
        history.record_state_start_event(20, 20, STATE_GPS_ON_FLAG).unwrap();
        let items = collect(&history);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].cmd, HistoryCmd::Reset);
        assert_eq!(items[0].current_time, Some(1_700_000_000_000));
        assert_eq!(items[1].cmd, HistoryCmd::Update);
        assert_ne!(items[1].states & STATE_SCREEN_ON_FLAG, 0);
        assert_ne!(items[1].states & STATE_GPS_ON_FLAG, 0);
        assert_ne!(items[1].states & STATE_CPU_RUNNING_FLAG, 0);
    }

    #[test]
    fn test_write_refused_while_iterating() {
        let temp_dir = TempDir::new().unwrap();
        let (mut history, _clock) = open_history(temp_dir.path(), HistoryConfig::default());
        history.set_battery_state(false, 3, 80, 3_000_000);
        history.record_state_start_event(10, 10, STATE_SCREEN_ON_FLAG).unwrap();

        let iter = history.iterate(0, 0);
        assert!(history.is_read_only());
        let before = history.buffer_len();
        match history.record_state_stop_event(20, 20, STATE_SCREEN_ON_FLAG) {
            Err(HistoryError::ReadOnly { iterators }) => assert_eq!(iterators, 1),
            other => panic!("expected read-only error, got {:?}", other),
        }
        assert_eq!(history.buffer_len(), before);

        drop(iter);
        assert!(!history.is_read_only());
        history
            .record_state_stop_event(20, 20, STATE_SCREEN_ON_FLAG)
            .unwrap();
    }

    #[test]
    fn test_exhausted_iterator_releases_read_only() {
        let temp_dir = TempDir::new().unwrap();
        let (mut history, _clock) = open_history(temp_dir.path(), HistoryConfig::default());
        history.set_battery_state(false, 3, 80, 3_000_000);
        history.record_state_start_event(10, 10, STATE_SCREEN_ON_FLAG).unwrap();

        let mut iter = history.iterate(0, 0);
        while iter.next().is_some() {}
        assert!(!history.is_read_only());
    }

    #[test]
    fn test_merge_transplants_tags_and_keeps_earlier_time() {
        let temp_dir = TempDir::new().unwrap();
        let (mut history, clock) = open_history(temp_dir.path(), HistoryConfig::default());
        clock.set_monotonic_time_ms(1_000);
        history.set_battery_state(false, 3, 80, 3_000_000);
        history.record_state_start_event(1_000, 1_000, STATE_GPS_ON_FLAG).unwrap();

        // introduce the tag so later references are not first occurrences
        history
            .record_wakelock_start_event(5_000, 5_000, Some(HistoryTag::new("sync", 1000)))
            .unwrap();
        history
            .record_wakelock_stop_event(10_000, 10_000, None)
            .unwrap();

        history.record_state_start_event(20_000, 20_000, STATE_SCREEN_ON_FLAG).unwrap();
        history
            .record_wakelock_start_event(20_200, 20_200, Some(HistoryTag::new("sync", 1000)))
            .unwrap();
        let before = history.buffer_len();
        history
            .record_state_stop_event(20_400, 20_400, STATE_GPS_ON_FLAG)
            .unwrap();
        assert!(history.buffer_len() <= before);

        let items = collect(&history);
        let last = items.last().unwrap();
        assert_eq!(last.time, 20_000);
        assert_eq!(last.states & STATE_GPS_ON_FLAG, 0);
        assert_eq!(last.wakelock_tag.as_ref().unwrap().string(), "sync");
    }

    #[test]
    fn test_merge_keeps_event_of_replaced_record() {
        let temp_dir = TempDir::new().unwrap();
        let (mut history, clock) = open_history(temp_dir.path(), HistoryConfig::default());
        clock.set_monotonic_time_ms(1_000);
        history.set_battery_state(false, 3, 80, 3_000_000);
        history.record_state_start_event(1_000, 1_000, STATE_GPS_ON_FLAG).unwrap();

        let code = EVENT_JOB | EVENT_FLAG_START;
        history.record_event(5_000, 5_000, code, "job", 10_001).unwrap();
        history.record_event(20_000, 20_000, code, "job", 10_001).unwrap();
        let before = history.buffer_len();

        // lands inside the merge window and replaces the 20_000 record
        history
            .record_state_start_event(20_300, 20_300, STATE_SCREEN_ON_FLAG)
            .unwrap();
        assert!(history.buffer_len() <= before);

        let items = collect(&history);
        let updates: Vec<i64> = items
            .iter()
            .filter(|item| item.cmd == HistoryCmd::Update)
            .map(|item| item.time)
            .collect();
        assert_eq!(updates, vec![1_000, 5_000, 20_000]);

        let last = items.last().unwrap();
        assert_eq!(last.time, 20_000);
        assert_eq!(last.event_code, code);
        assert_eq!(last.event_tag, Some(HistoryTag::new("job", 10_001)));
        assert_ne!(last.states & STATE_SCREEN_ON_FLAG, 0);
    }

    #[test]
    fn test_merge_keeps_wake_reason_of_replaced_record() {
        let temp_dir = TempDir::new().unwrap();
        let (mut history, clock) = open_history(temp_dir.path(), HistoryConfig::default());
        clock.set_monotonic_time_ms(1_000);
        history.set_battery_state(false, 3, 80, 3_000_000);
        history.record_state_start_event(1_000, 1_000, STATE_GPS_ON_FLAG).unwrap();

        history.record_wakeup_event(5_000, 5_000, "irq:timer").unwrap();
        history.record_wakeup_event(20_000, 20_000, "irq:timer").unwrap();
        let before = history.buffer_len();

        history
            .record_state_start_event(20_300, 20_300, STATE_SCREEN_ON_FLAG)
            .unwrap();
        assert!(history.buffer_len() <= before);

        let items = collect(&history);
        let updates: Vec<i64> = items
            .iter()
            .filter(|item| item.cmd == HistoryCmd::Update)
            .map(|item| item.time)
            .collect();
        assert_eq!(updates, vec![1_000, 5_000, 20_000]);

        let last = items.last().unwrap();
        assert_eq!(last.time, 20_000);
        assert_eq!(last.wake_reason_tag, Some(HistoryTag::new("irq:timer", 0)));
        assert_eq!(last.event_code, EVENT_NONE);
        assert_ne!(last.states & STATE_SCREEN_ON_FLAG, 0);
    }

    #[test]
    fn test_cpu_sleep_inserts_bridging_record() {
        let temp_dir = TempDir::new().unwrap();
        let (mut history, clock) = open_history(temp_dir.path(), HistoryConfig::default());
        clock.set_monotonic_time_ms(1_000);
        history.set_battery_state(false, 3, 80, 3_000_000);
        history.record_state_start_event(1_000, 1_000, STATE_GPS_ON_FLAG).unwrap();
        // 60 s elapsed, only 1 s of uptime: the CPU slept for 59 s.
        history
            .record_state_start_event(61_000, 2_000, STATE_SCREEN_ON_FLAG)
            .unwrap();

        let items = collect(&history);
        let n = items.len();
        let bridge = &items[n - 2];
        // the CPU stopped running once uptime stopped advancing
        assert_eq!(bridge.time, 2_000);
        assert_eq!(bridge.states & STATE_CPU_RUNNING_FLAG, 0);
        assert_eq!(bridge.states & STATE_SCREEN_ON_FLAG, 0);
        assert_ne!(items[n - 1].states & STATE_CPU_RUNNING_FLAG, 0);
        assert_eq!(items[n - 1].time, 61_000);
    }

    #[test]
    fn test_rehydrate_continues_time_and_tags() {
        let temp_dir = TempDir::new().unwrap();
        {
            let (mut history, clock) = open_history(temp_dir.path(), HistoryConfig::default());
            clock.set_monotonic_time_ms(5_000);
            history.set_battery_state(false, 3, 80, 3_000_000);
            history
                .record_wakelock_start_event(5_000, 5_000, Some(HistoryTag::new("gms", 10_001)))
                .unwrap();
            history.write_history().unwrap();
        }

        let (mut history, _clock) = open_history(temp_dir.path(), HistoryConfig::default());
        assert_eq!(history.tag_pool_size(), 1);
        assert_eq!(history.end_time_ms(), Some(5_000));
        assert_eq!(history.current().battery_level, 80);

        history.set_battery_state(false, 3, 79, 2_900_000);
        history
            .record_wakelock_start_event(100, 100, Some(HistoryTag::new("gms", 10_001)))
            .unwrap();
        let items = collect(&history);
        assert!(items.windows(2).all(|w| w[0].time <= w[1].time));
        assert!(items.last().unwrap().time > 5_000);
        assert_eq!(
            items.last().unwrap().wakelock_tag.as_ref().unwrap().string(),
            "gms"
        );
        assert_eq!(history.tag_pool_size(), 1);
    }

    #[test]
    fn test_corrupt_tail_discards_history() {
        let temp_dir = TempDir::new().unwrap();
        let active = {
            let (mut history, _clock) = open_history(temp_dir.path(), HistoryConfig::default());
            history.set_battery_state(false, 3, 80, 3_000_000);
            history.record_state_start_event(10, 10, STATE_GPS_ON_FLAG).unwrap();
            history.write_history().unwrap();
            history.directory().active_segment().unwrap()
        };
        let mut image = fs::read(&active.path).unwrap();
        image[0] ^= 0xff;
        fs::write(&active.path, &image).unwrap();

        let (history, _clock) = open_history(temp_dir.path(), HistoryConfig::default());
        assert_eq!(history.buffer_len(), 0);
        assert_eq!(history.segment_count(), 1);
        assert!(collect(&history).is_empty());
        assert_eq!(history.end_time_ms(), None);
    }

    #[test]
    fn test_reset_clears_everything() {
        let temp_dir = TempDir::new().unwrap();
        let (mut history, clock) = open_history(
            temp_dir.path(),
            HistoryConfig::default().with_max_segment_bytes(256),
        );
        history.set_battery_state(false, 3, 80, 3_000_000);
        for i in 0..40 {
            clock.advance(2_000);
            history
                .record_wakeup_event(i * 2_000, i * 2_000, &format!("reason{}", i))
                .unwrap();
        }
        assert!(history.segment_count() > 1);
        assert!(history.tag_pool_size() > 0);

        history.reset().unwrap();
        assert_eq!(history.segment_count(), 1);
        assert_eq!(history.tag_pool_size(), 0);
        assert_eq!(history.buffer_len(), 0);
        assert!(collect(&history).is_empty());
    }

    #[test]
    fn test_recording_disabled_keeps_extensions_and_commands() {
        let temp_dir = TempDir::new().unwrap();
        let (mut history, _clock) = open_history(temp_dir.path(), HistoryConfig::default());
        history.set_battery_state(false, 3, 80, 3_000_000);
        history.set_recording_enabled(false);

        history.record_state_start_event(10, 10, STATE_GPS_ON_FLAG).unwrap();
        assert_eq!(history.buffer_len(), 0);

        history.record_process_state_change(20, 20, 10_001, 2).unwrap();
        history
            .record_current_time_change(30, 30, 1_700_000_000_500)
            .unwrap();
        let items = collect(&history);
        let kinds: Vec<HistoryCmd> = items.iter().map(|item| item.cmd).collect();
        assert_eq!(
            kinds,
            vec![HistoryCmd::Reset, HistoryCmd::Update, HistoryCmd::CurrentTime]
        );
        assert!(items[1].process_state_change.is_some());
        assert_eq!(items[2].current_time, Some(1_700_000_000_500));
    }
}
