//! On-disk segment directory: naming, rotation, atomic writes and retention.
//!
//! # Layout
//!
//! ```text
//! history/
//! ├── 1700000000000.bh   (sealed)
//! ├── 1700000360000.bh   (sealed)
//! └── 1700000720000.bh   (active, rewritten on save)
//! ```
//!
//! Files are named by the monotonic time at which they were created, so
//! lexical order of the numeric stem is creation order. Anything else found
//! in the directory is deleted on a background thread.

use crate::error::Result;
use crate::lifecycle::retention::{RetentionPolicy, SpaceProbe};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use tracing::{debug, warn};

/// Extension of segment files.
pub const SEGMENT_FILE_EXTENSION: &str = "bh";

/// Extension of in-flight atomic writes.
const TEMP_FILE_EXTENSION: &str = "bh.tmp";

/// Durability of segment writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Fsync the temp file before the rename (default).
    #[default]
    Fsync,
    /// Use fdatasync (skip metadata update, faster).
    Fdatasync,
    /// No sync (fastest, lowest durability - for testing only).
    None,
}

/// A segment file known to the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    /// Monotonic creation time; also the file name stem.
    pub start_time_ms: i64,
    /// Full path of the file.
    pub path: PathBuf,
}

#[derive(Debug, Default)]
struct DirectoryState {
    segments: Vec<SegmentFile>,
    /// Files dropped by a reset while retention was held.
    orphans: Vec<PathBuf>,
}

/// Ordered set of segment files with retention.
///
/// Shared between the log and its iterators and snapshots; all methods take
/// `&self`.
pub struct SegmentDirectory {
    dir: PathBuf,
    state: Mutex<DirectoryState>,
    io_lock: Mutex<()>,
    policy: RetentionPolicy,
    probe: Box<dyn SpaceProbe>,
    sync_mode: SyncMode,
    holds: AtomicUsize,
}

impl fmt::Debug for SegmentDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentDirectory")
            .field("dir", &self.dir)
            .field("policy", &self.policy)
            .field("sync_mode", &self.sync_mode)
            .field("holds", &self.holds.load(Ordering::Acquire))
            .finish()
    }
}

impl SegmentDirectory {
    /// Opens `dir`, creating it if needed, and indexes the segments in it.
    ///
    /// Files that do not parse as `<monotonic>.bh` are scheduled for
    /// background deletion.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or listed.
    pub fn open(
        dir: impl AsRef<Path>,
        policy: RetentionPolicy,
        probe: Box<dyn SpaceProbe>,
        sync_mode: SyncMode,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let (segments, garbage) = scan_directory(&dir)?;
        debug!(
            "Opened battery history directory {} with {} segment(s)",
            dir.display(),
            segments.len()
        );
        if !garbage.is_empty() {
            schedule_cleanup(garbage);
        }

        Ok(Self {
            dir,
            state: Mutex::new(DirectoryState {
                segments,
                orphans: Vec::new(),
            }),
            io_lock: Mutex::new(()),
            policy,
            probe,
            sync_mode,
            holds: AtomicUsize::new(0),
        })
    }

    /// The directory path.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// The retention policy.
    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// All segments, oldest first; the last one is active.
    pub fn segments(&self) -> Vec<SegmentFile> {
        self.lock_state().segments.clone()
    }

    /// Segments other than the active one, oldest first.
    pub fn sealed_segments(&self) -> Vec<SegmentFile> {
        let state = self.lock_state();
        let sealed = state.segments.len().saturating_sub(1);
        state.segments[..sealed].to_vec()
    }

    /// Number of segments, including the active one.
    pub fn segment_count(&self) -> usize {
        self.lock_state().segments.len()
    }

    /// The segment currently being appended to.
    pub fn active_segment(&self) -> Option<SegmentFile> {
        self.lock_state().segments.last().cloned()
    }

    /// Creates a new empty segment, makes it active and applies retention.
    ///
    /// The name is `monotonic_ms`, bumped past the newest existing segment so
    /// names stay strictly increasing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created; the segment list is
    /// left unchanged in that case.
    pub fn create_segment(&self, monotonic_ms: i64) -> Result<SegmentFile> {
        let segment = {
            let mut state = self.lock_state();
            let start_time_ms = match state.segments.last() {
                Some(last) => monotonic_ms.max(last.start_time_ms + 1),
                None => monotonic_ms,
            };
            let segment = SegmentFile {
                start_time_ms,
                path: self.segment_path(start_time_ms),
            };
            {
                let _io = self.lock_io();
                File::create(&segment.path)?;
            }
            state.segments.push(segment.clone());
            segment
        };
        debug!("Created battery history segment {}", segment.path.display());
        self.enforce_retention();
        Ok(segment)
    }

    /// Atomically replaces the contents of `segment` with `image`.
    ///
    /// The image is written to a temp file, synced per [`SyncMode`], then
    /// renamed over the segment, so a crash leaves either the old or the new
    /// contents.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails; the temp file is removed on a
    /// best-effort basis.
    pub fn write_segment(&self, segment: &SegmentFile, image: &[u8]) -> Result<()> {
        let _io = self.lock_io();
        let tmp_path = segment.path.with_extension(TEMP_FILE_EXTENSION);
        let result = self.write_atomic(&tmp_path, &segment.path, image);
        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result?;
        debug!(
            "Wrote {} bytes to battery history segment {}",
            image.len(),
            segment.path.display()
        );
        Ok(())
    }

    fn write_atomic(&self, tmp_path: &Path, path: &Path, image: &[u8]) -> io::Result<()> {
        let mut file = File::create(tmp_path)?;
        file.write_all(image)?;
        match self.sync_mode {
            SyncMode::Fsync => file.sync_all()?,
            SyncMode::Fdatasync => file.sync_data()?,
            SyncMode::None => {}
        }
        drop(file);
        fs::rename(tmp_path, path)
    }

    /// Reads the full image of `segment`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or unreadable.
    pub fn read_segment(&self, segment: &SegmentFile) -> Result<Vec<u8>> {
        let _io = self.lock_io();
        Ok(fs::read(&segment.path)?)
    }

    /// Deletes the oldest segments the policy no longer allows.
    ///
    /// Does nothing while a [`RetentionHold`](super::RetentionHold) is alive.
    /// Failures to delete are logged and the file is dropped from the index
    /// regardless.
    pub fn enforce_retention(&self) {
        if self.is_retention_suspended() {
            debug!("Battery history retention suspended");
            return;
        }

        let available = match self.probe.available_space(&self.dir) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!(
                    "Failed to query free space for {}: {:?}",
                    self.dir.display(),
                    err
                );
                None
            }
        };

        let removed: Vec<SegmentFile> = {
            let mut state = self.lock_state();
            let count = self
                .policy
                .segments_to_delete(state.segments.len(), available);
            state.segments.drain(..count).collect()
        };

        for segment in removed {
            self.delete_file(&segment.path);
        }
    }

    /// Changes the segment limit and applies it immediately.
    pub fn set_max_segment_files(&self, max_segment_files: usize) {
        self.policy.set_max_segment_files(max_segment_files);
        self.enforce_retention();
    }

    /// Deletes every segment and starts a fresh active one.
    ///
    /// Files pinned by a retention hold are deleted once the last hold is
    /// released.
    ///
    /// # Errors
    ///
    /// Returns an error if the fresh segment cannot be created.
    pub fn reset(&self, monotonic_ms: i64) -> Result<SegmentFile> {
        let held = self.is_retention_suspended();
        let removed: Vec<SegmentFile> = {
            let mut state = self.lock_state();
            let removed: Vec<SegmentFile> = state.segments.drain(..).collect();
            if held {
                state
                    .orphans
                    .extend(removed.iter().map(|segment| segment.path.clone()));
            }
            removed
        };
        if !held {
            for segment in &removed {
                self.delete_file(&segment.path);
            }
        }
        debug!(
            "Reset battery history directory {} ({} segment(s) dropped)",
            self.dir.display(),
            removed.len()
        );
        let next = removed
            .last()
            .map(|last| monotonic_ms.max(last.start_time_ms + 1))
            .unwrap_or(monotonic_ms);
        self.create_segment(next)
    }

    /// Returns true while at least one retention hold is alive.
    pub fn is_retention_suspended(&self) -> bool {
        self.holds.load(Ordering::Acquire) > 0
    }

    pub(crate) fn suspend_retention(&self) {
        self.holds.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn resume_retention(&self) {
        let previous = self
            .holds
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |holds| {
                Some(holds.saturating_sub(1))
            })
            .unwrap_or(0);
        if previous == 1 {
            let orphans = std::mem::take(&mut self.lock_state().orphans);
            for path in orphans {
                self.delete_file(&path);
            }
            self.enforce_retention();
        }
    }

    fn delete_file(&self, path: &Path) {
        let _io = self.lock_io();
        match fs::remove_file(path) {
            Ok(()) => debug!("Deleted battery history segment {}", path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                "Failed to delete battery history segment {}: {:?}",
                path.display(),
                err
            ),
        }
    }

    fn segment_path(&self, start_time_ms: i64) -> PathBuf {
        self.dir
            .join(format!("{}.{}", start_time_ms, SEGMENT_FILE_EXTENSION))
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, DirectoryState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn lock_io(&self) -> std::sync::MutexGuard<'_, ()> {
        self.io_lock.lock().unwrap_or_else(|err| err.into_inner())
    }
}

/// Parses the creation time from a segment file name.
pub fn parse_segment_name(path: &Path) -> Option<i64> {
    if path.extension()? != SEGMENT_FILE_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse::<i64>().ok()
}

fn scan_directory(dir: &Path) -> Result<(Vec<SegmentFile>, Vec<PathBuf>)> {
    let mut segments = Vec::new();
    let mut garbage = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            continue;
        }
        match parse_segment_name(&path) {
            Some(start_time_ms) => segments.push(SegmentFile {
                start_time_ms,
                path,
            }),
            None => garbage.push(path),
        }
    }

    segments.sort_by_key(|segment| segment.start_time_ms);
    Ok((segments, garbage))
}

fn schedule_cleanup(paths: Vec<PathBuf>) {
    let spawned = thread::Builder::new()
        .name("battery-history-cleanup".to_string())
        .spawn(move || {
            for path in paths {
                match fs::remove_file(&path) {
                    Ok(()) => debug!("Removed legacy history file {}", path.display()),
                    Err(err) => debug!(
                        "Could not remove legacy history file {}: {:?}",
                        path.display(),
                        err
                    ),
                }
            }
        });
    if let Err(err) = spawned {
        warn!("Failed to start legacy history cleanup: {:?}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::retention::RetentionHold;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    struct FixedSpace(Arc<AtomicU64>);

    impl SpaceProbe for FixedSpace {
        fn available_space(&self, _path: &Path) -> io::Result<u64> {
            Ok(self.0.load(Ordering::SeqCst))
        }
    }

    fn open_dir(path: &Path, max_files: usize, space: Arc<AtomicU64>) -> SegmentDirectory {
        SegmentDirectory::open(
            path,
            RetentionPolicy::new(max_files, 1_000),
            Box::new(FixedSpace(space)),
            SyncMode::None,
        )
        .unwrap()
    }

    #[test]
    fn test_names_strictly_increasing() {
        let temp_dir = TempDir::new().unwrap();
        let dir = open_dir(temp_dir.path(), 10, Arc::new(AtomicU64::new(u64::MAX)));

        let a = dir.create_segment(100).unwrap();
        let b = dir.create_segment(100).unwrap();
        let c = dir.create_segment(50).unwrap();
        assert_eq!(
            [a.start_time_ms, b.start_time_ms, c.start_time_ms],
            [100, 101, 102]
        );
        assert!(c.path.ends_with("102.bh"));
        assert_eq!(dir.active_segment(), Some(c));
        assert_eq!(dir.sealed_segments().len(), 2);
    }

    #[test]
    fn test_count_retention_deletes_oldest() {
        let temp_dir = TempDir::new().unwrap();
        let dir = open_dir(temp_dir.path(), 2, Arc::new(AtomicU64::new(u64::MAX)));
        let first = dir.create_segment(1).unwrap();
        dir.create_segment(2).unwrap();
        dir.create_segment(3).unwrap();

        let remaining: Vec<i64> = dir.segments().iter().map(|s| s.start_time_ms).collect();
        assert_eq!(remaining, vec![2, 3]);
        assert!(!first.path.exists());
    }

    #[test]
    fn test_low_space_deletes_one_segment() {
        let temp_dir = TempDir::new().unwrap();
        let space = Arc::new(AtomicU64::new(u64::MAX));
        let dir = open_dir(temp_dir.path(), 10, space.clone());
        for t in 1..=4 {
            dir.create_segment(t).unwrap();
        }
        space.store(10, Ordering::SeqCst);
        dir.enforce_retention();
        assert_eq!(dir.segment_count(), 3);
        dir.enforce_retention();
        assert_eq!(dir.segment_count(), 2);
    }

    #[test]
    fn test_hold_defers_retention() {
        let temp_dir = TempDir::new().unwrap();
        let dir = Arc::new(open_dir(
            temp_dir.path(),
            1,
            Arc::new(AtomicU64::new(u64::MAX)),
        ));
        dir.create_segment(1).unwrap();
        let hold = RetentionHold::new(Arc::clone(&dir));
        dir.create_segment(2).unwrap();
        dir.create_segment(3).unwrap();
        assert_eq!(dir.segment_count(), 3);

        drop(hold);
        assert_eq!(dir.segment_count(), 1);
        assert_eq!(dir.active_segment().unwrap().start_time_ms, 3);
    }

    #[test]
    fn test_atomic_write_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let dir = open_dir(temp_dir.path(), 10, Arc::new(AtomicU64::new(u64::MAX)));
        let segment = dir.create_segment(7).unwrap();
        dir.write_segment(&segment, b"first").unwrap();
        dir.write_segment(&segment, b"second").unwrap();
        assert_eq!(dir.read_segment(&segment).unwrap(), b"second");
        assert!(!segment.path.with_extension(TEMP_FILE_EXTENSION).exists());
    }

    #[test]
    fn test_reset_under_hold_defers_deletion() {
        let temp_dir = TempDir::new().unwrap();
        let dir = Arc::new(open_dir(
            temp_dir.path(),
            10,
            Arc::new(AtomicU64::new(u64::MAX)),
        ));
        let old = dir.create_segment(1).unwrap();
        let hold = RetentionHold::new(Arc::clone(&dir));
        let fresh = dir.reset(1).unwrap();
        assert_eq!(fresh.start_time_ms, 2);
        assert_eq!(dir.segment_count(), 1);
        assert!(old.path.exists());

        drop(hold);
        assert!(!old.path.exists());
    }

    #[test]
    fn test_scan_orders_and_cleans_garbage() {
        let temp_dir = TempDir::new().unwrap();
        for name in ["30.bh", "4.bh", "100.bh"] {
            fs::write(temp_dir.path().join(name), b"").unwrap();
        }
        let garbage = temp_dir.path().join("battery-history.bin");
        fs::write(&garbage, b"legacy").unwrap();
        fs::write(temp_dir.path().join("5.bh.tmp"), b"partial").unwrap();

        let dir = open_dir(temp_dir.path(), 10, Arc::new(AtomicU64::new(u64::MAX)));
        let starts: Vec<i64> = dir.segments().iter().map(|s| s.start_time_ms).collect();
        assert_eq!(starts, vec![4, 30, 100]);

        let deadline = Instant::now() + Duration::from_secs(5);
        while garbage.exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!garbage.exists());
    }

    #[test]
    fn test_parse_segment_name() {
        assert_eq!(parse_segment_name(Path::new("/x/123.bh")), Some(123));
        assert_eq!(parse_segment_name(Path::new("/x/-1.bh")), None);
        assert_eq!(parse_segment_name(Path::new("/x/123.bin")), None);
        assert_eq!(parse_segment_name(Path::new("/x/123.bh.tmp")), None);
        assert_eq!(parse_segment_name(Path::new("/x/abc.bh")), None);
    }
}
