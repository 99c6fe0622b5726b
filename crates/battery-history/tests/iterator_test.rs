//! Integration tests for iteration, snapshots and reopening.

use alopex_battery_history::item::{STATE_AUDIO_ON_FLAG, STATE_GPS_ON_FLAG, STATE_SCREEN_ON_FLAG};
use alopex_battery_history::lifecycle::{SpaceProbe, SyncMode};
use alopex_battery_history::{
    BatteryHistory, HistoryCmd, HistoryConfig, HistoryError, HistoryItem, HistorySnapshot,
    ManualClock,
};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const SEGMENT_BYTES: usize = 512;
const SAMPLE_INTERVAL_MS: i64 = 2_000;

struct Plenty;

impl SpaceProbe for Plenty {
    fn available_space(&self, _path: &Path) -> io::Result<u64> {
        Ok(u64::MAX)
    }
}

fn open_history(dir: &Path, clock: &ManualClock) -> BatteryHistory {
    let config = HistoryConfig::default()
        .with_max_segment_bytes(SEGMENT_BYTES)
        .with_sync_mode(SyncMode::None);
    let mut history =
        BatteryHistory::open_with(dir, config, Arc::new(clock.clone()), Box::new(Plenty)).unwrap();
    history.set_battery_state(false, 3, 90, 3_000_000);
    history
}

/// Writes `count` samples toggling the screen, starting at `from`.
fn write_samples(history: &mut BatteryHistory, clock: &ManualClock, from: i64, count: usize) {
    for i in 0..count {
        let t = from + i as i64 * SAMPLE_INTERVAL_MS;
        clock.set_monotonic_time_ms(t);
        if i % 2 == 0 {
            history
                .record_state_start_event(t, t, STATE_SCREEN_ON_FLAG)
                .unwrap();
        } else {
            history
                .record_state_stop_event(t, t, STATE_SCREEN_ON_FLAG)
                .unwrap();
        }
    }
}

fn collect(history: &BatteryHistory, start_ms: i64, end_ms: i64) -> Vec<HistoryItem> {
    history.iterate(start_ms, end_ms).collect()
}

fn update_times(items: &[HistoryItem]) -> Vec<i64> {
    items
        .iter()
        .filter(|item| item.cmd == HistoryCmd::Update)
        .map(|item| item.time)
        .collect()
}

fn expected_times(from: i64, count: usize) -> Vec<i64> {
    (0..count)
        .map(|i| from + i as i64 * SAMPLE_INTERVAL_MS)
        .collect()
}

#[test]
fn test_iterates_all_segments_in_order() {
    let temp_dir = TempDir::new().unwrap();
    let clock = ManualClock::new(1_000, 1_700_000_000_000);
    let mut history = open_history(temp_dir.path(), &clock);
    write_samples(&mut history, &clock, 1_000, 60);
    assert!(history.segment_count() > 2);

    let items = collect(&history, 0, 0);
    assert_eq!(items[0].cmd, HistoryCmd::Reset);
    assert_eq!(update_times(&items), expected_times(1_000, 60));
    assert!(items.windows(2).all(|pair| pair[0].time <= pair[1].time));

    let updates: Vec<&HistoryItem> = items
        .iter()
        .filter(|item| item.cmd == HistoryCmd::Update)
        .collect();
    for (i, item) in updates.iter().enumerate() {
        let screen_on = item.states & STATE_SCREEN_ON_FLAG != 0;
        assert_eq!(screen_on, i % 2 == 0, "sample {}", i);
    }
}

#[test]
fn test_range_filter_matches_full_scan() {
    let temp_dir = TempDir::new().unwrap();
    let clock = ManualClock::new(1_000, 1_700_000_000_000);
    let mut history = open_history(temp_dir.path(), &clock);
    write_samples(&mut history, &clock, 1_000, 60);

    let all = collect(&history, 0, 0);
    let starts = history.segment_start_times();
    assert!(starts.len() >= 4);

    let ranges = [
        (starts[1], starts[2]),
        (starts[1] + 1, starts[3] - 1),
        (15_000, 41_000),
        (starts[starts.len() - 1], 0),
        (0, 1_000),
        (200_000, 0),
    ];
    for (start, end) in ranges {
        let expected: Vec<i64> = all
            .iter()
            .map(|item| item.time)
            .filter(|t| *t >= start && (end == 0 || *t < end))
            .collect();
        let actual: Vec<i64> = collect(&history, start, end)
            .iter()
            .map(|item| item.time)
            .collect();
        assert_eq!(actual, expected, "range [{}, {})", start, end);
    }
}

#[test]
fn test_snapshot_ignores_later_writes() {
    let temp_dir = TempDir::new().unwrap();
    let clock = ManualClock::new(1_000, 1_700_000_000_000);
    let mut history = open_history(temp_dir.path(), &clock);
    write_samples(&mut history, &clock, 1_000, 30);

    let snapshot = history.copy();
    assert!(!history.is_read_only());
    let before: Vec<HistoryItem> = snapshot.iterate(0, 0).collect();

    write_samples(&mut history, &clock, 61_000, 40);

    let after: Vec<HistoryItem> = snapshot.iterate(0, 0).collect();
    assert_eq!(before, after);
    assert_eq!(update_times(&after), expected_times(1_000, 30));

    let live = collect(&history, 0, 0);
    assert_eq!(update_times(&live).len(), 70);
}

#[test]
fn test_skips_unreadable_sealed_segment() {
    let temp_dir = TempDir::new().unwrap();
    let clock = ManualClock::new(1_000, 1_700_000_000_000);
    let mut history = open_history(temp_dir.path(), &clock);
    write_samples(&mut history, &clock, 1_000, 60);

    let all = collect(&history, 0, 0);
    let segments = history.directory().segments();
    let broken = &segments[1];
    let next_start = segments[2].start_time_ms;

    let mut image = fs::read(&broken.path).unwrap();
    image[..4].copy_from_slice(&7i32.to_le_bytes());
    fs::write(&broken.path, &image).unwrap();

    let expected: Vec<i64> = all
        .iter()
        .map(|item| item.time)
        .filter(|t| *t < broken.start_time_ms || *t >= next_start)
        .collect();
    let actual: Vec<i64> = collect(&history, 0, 0)
        .iter()
        .map(|item| item.time)
        .collect();
    assert_eq!(actual, expected);
    assert!(actual.len() < all.len());
}

#[test]
fn test_read_only_until_iterator_finishes() {
    let temp_dir = TempDir::new().unwrap();
    let clock = ManualClock::new(1_000, 1_700_000_000_000);
    let mut history = open_history(temp_dir.path(), &clock);
    write_samples(&mut history, &clock, 1_000, 10);

    let mut iter = history.iterate(0, 0);
    assert!(iter.next().is_some());
    assert!(history.is_read_only());

    clock.set_monotonic_time_ms(50_000);
    let err = history
        .record_state_start_event(50_000, 50_000, STATE_GPS_ON_FLAG)
        .unwrap_err();
    assert!(matches!(err, HistoryError::ReadOnly { iterators: 1 }));

    iter.finish();
    assert!(!history.is_read_only());
    history
        .record_state_start_event(50_000, 50_000, STATE_GPS_ON_FLAG)
        .unwrap();

    let items = collect(&history, 0, 0);
    assert_eq!(items.last().unwrap().time, 50_000);
    assert_ne!(items.last().unwrap().states & STATE_GPS_ON_FLAG, 0);
}

#[test]
fn test_reopen_restores_history() {
    let temp_dir = TempDir::new().unwrap();
    let clock = ManualClock::new(1_000, 1_700_000_000_000);
    let before = {
        let mut history = open_history(temp_dir.path(), &clock);
        write_samples(&mut history, &clock, 1_000, 30);
        collect(&history, 0, 0)
    };

    let mut history = open_history(temp_dir.path(), &clock);
    assert_eq!(collect(&history, 0, 0), before);
    assert_eq!(history.end_time_ms(), Some(59_000));

    write_samples(&mut history, &clock, 61_000, 10);
    let after = collect(&history, 0, 0);
    let mut expected = expected_times(1_000, 30);
    expected.extend(expected_times(61_000, 10));
    assert_eq!(update_times(&after), expected);
    assert_eq!(
        after
            .iter()
            .filter(|item| item.cmd == HistoryCmd::Reset)
            .count(),
        1
    );
}

#[test]
fn test_legacy_segment_images() {
    let temp_dir = TempDir::new().unwrap();
    let clock = ManualClock::new(1_000, 1_700_000_000_000);
    let mut history = open_history(temp_dir.path(), &clock);
    write_samples(&mut history, &clock, 1_000, 40);
    history.write_history().unwrap();

    let images: Vec<Vec<u8>> = history
        .directory()
        .segments()
        .iter()
        .map(|segment| fs::read(&segment.path).unwrap())
        .collect();
    let legacy = HistorySnapshot::from_legacy_segments(images, SEGMENT_BYTES);
    let from_legacy: Vec<HistoryItem> = legacy.iterate(0, 0).collect();
    assert_eq!(from_legacy, collect(&history, 0, 0));
    assert!(legacy.sealed_segments().is_empty());
    assert_eq!(legacy.tail_len(), 0);
}

#[test]
fn test_close_updates_merge_into_one_record() {
    let temp_dir = TempDir::new().unwrap();
    let clock = ManualClock::new(5_000, 1_700_000_000_000);
    let mut history = open_history(temp_dir.path(), &clock);

    history
        .record_state_start_event(5_000, 5_000, STATE_AUDIO_ON_FLAG)
        .unwrap();
    history
        .record_state_start_event(10_000, 10_000, STATE_SCREEN_ON_FLAG)
        .unwrap();
    let len_before_merge = history.buffer_len();
    history
        .record_state_start_event(10_400, 10_400, STATE_GPS_ON_FLAG)
        .unwrap();
    assert_eq!(history.buffer_len(), len_before_merge);

    let items = collect(&history, 0, 0);
    let updates: Vec<&HistoryItem> = items
        .iter()
        .filter(|item| item.cmd == HistoryCmd::Update)
        .collect();
    assert_eq!(updates.len(), 2);
    let merged = updates[1];
    assert_eq!(merged.time, 10_000);
    let expected = STATE_AUDIO_ON_FLAG | STATE_SCREEN_ON_FLAG | STATE_GPS_ON_FLAG;
    assert_eq!(merged.states & expected, expected);
}

#[test]
fn test_overlapping_changes_do_not_merge() {
    let temp_dir = TempDir::new().unwrap();
    let clock = ManualClock::new(5_000, 1_700_000_000_000);
    let mut history = open_history(temp_dir.path(), &clock);

    history
        .record_state_start_event(5_000, 5_000, STATE_AUDIO_ON_FLAG)
        .unwrap();
    history
        .record_state_start_event(10_000, 10_000, STATE_SCREEN_ON_FLAG)
        .unwrap();
    history
        .record_state_stop_event(10_400, 10_400, STATE_SCREEN_ON_FLAG)
        .unwrap();

    let items = collect(&history, 0, 0);
    assert_eq!(update_times(&items), vec![5_000, 10_000, 10_400]);
    let last = items.last().unwrap();
    assert_eq!(last.states & STATE_SCREEN_ON_FLAG, 0);
}
