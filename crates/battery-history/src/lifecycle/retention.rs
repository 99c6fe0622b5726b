//! Retention policy for bounding the number and disk footprint of segments.

use crate::lifecycle::directory::SegmentDirectory;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Default number of segment files kept on disk.
pub const DEFAULT_MAX_SEGMENT_FILES: usize = 32;

/// Free space below which the oldest segment is deleted (100 MiB).
pub const DEFAULT_MIN_FREE_SPACE_BYTES: u64 = 100 * 1024 * 1024;

/// Retention limits for a segment directory.
///
/// The file limit is live-mutable; the free-space floor is fixed at
/// construction.
#[derive(Debug)]
pub struct RetentionPolicy {
    max_segment_files: AtomicUsize,
    min_free_space_bytes: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SEGMENT_FILES, DEFAULT_MIN_FREE_SPACE_BYTES)
    }
}

impl RetentionPolicy {
    /// Creates a policy with custom limits.
    pub fn new(max_segment_files: usize, min_free_space_bytes: u64) -> Self {
        Self {
            max_segment_files: AtomicUsize::new(max_segment_files),
            min_free_space_bytes,
        }
    }

    /// Maximum number of segments kept, including the active one.
    pub fn max_segment_files(&self) -> usize {
        self.max_segment_files.load(Ordering::Acquire)
    }

    /// Changes the segment limit.
    pub fn set_max_segment_files(&self, max_segment_files: usize) {
        self.max_segment_files
            .store(max_segment_files, Ordering::Release);
    }

    /// Free-space floor in bytes.
    pub fn min_free_space_bytes(&self) -> u64 {
        self.min_free_space_bytes
    }

    /// Returns how many of the oldest segments to delete.
    ///
    /// Low free space costs exactly one segment per pass; the count limit is
    /// then applied to what remains. The newest segment is never counted.
    ///
    /// # Arguments
    ///
    /// * `segment_count` - Segments currently on disk, including the active one
    /// * `available_space` - Free bytes on the volume, if known
    pub fn segments_to_delete(&self, segment_count: usize, available_space: Option<u64>) -> usize {
        if segment_count <= 1 {
            return 0;
        }
        let mut to_delete = 0;
        if matches!(available_space, Some(available) if available < self.min_free_space_bytes) {
            to_delete += 1;
        }
        let remaining = segment_count - to_delete;
        let limit = self.max_segment_files().max(1);
        if remaining > limit {
            to_delete += remaining - limit;
        }
        to_delete
    }
}

/// Reports free space on the volume holding the segment directory.
pub trait SpaceProbe: Send + Sync {
    /// Returns the number of bytes available to the process under `path`.
    fn available_space(&self, path: &Path) -> io::Result<u64>;
}

/// [`SpaceProbe`] backed by `fs2::available_space`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fs2SpaceProbe;

impl SpaceProbe for Fs2SpaceProbe {
    fn available_space(&self, path: &Path) -> io::Result<u64> {
        fs2::available_space(path)
    }
}

/// Suspends retention on a directory for as long as it is alive.
///
/// Dropping the last hold re-runs retention, so limits lowered while files
/// were pinned take effect as soon as they are released.
#[derive(Debug)]
pub struct RetentionHold {
    directory: Arc<SegmentDirectory>,
}

impl RetentionHold {
    /// Takes a hold on `directory`.
    pub fn new(directory: Arc<SegmentDirectory>) -> Self {
        directory.suspend_retention();
        Self { directory }
    }

    /// The held directory.
    pub fn directory(&self) -> &Arc<SegmentDirectory> {
        &self.directory
    }
}

impl Clone for RetentionHold {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.directory))
    }
}

impl Drop for RetentionHold {
    fn drop(&mut self) {
        self.directory.resume_retention();
    }
}
