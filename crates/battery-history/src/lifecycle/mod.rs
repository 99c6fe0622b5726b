//! Lifecycle of segment files: directory layout, rotation and retention.

pub mod directory;
pub mod retention;

pub use directory::{SegmentDirectory, SegmentFile, SyncMode};
pub use retention::{Fs2SpaceProbe, RetentionHold, RetentionPolicy, SpaceProbe};
