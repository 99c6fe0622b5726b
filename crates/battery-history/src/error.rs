//! Error and Result types for battery history operations.

use std::io;
use thiserror::Error;

/// A convenience `Result` type for battery history operations.
pub type Result<T> = std::result::Result<T, HistoryError>;

/// The error type for battery history operations.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// Segment header carries a format version this build cannot read.
    #[error("Unsupported history version: expected {expected}, got {found}")]
    UnsupportedVersion {
        /// Version found in the segment header.
        found: i32,
        /// Version this build writes.
        expected: i32,
    },

    /// Segment is structurally invalid (bad length, misaligned payload, ...).
    #[error("Corrupt history segment: {0}")]
    CorruptSegment(String),

    /// A record ended before all of its fields could be read.
    #[error("Truncated history record: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes the reader tried to consume.
        needed: usize,
        /// Bytes left in the source.
        remaining: usize,
    },

    /// Absolute record carried a command byte that is not a known command.
    #[error("Unknown history command: {0}")]
    UnknownCommand(u8),

    /// Power stats payload referenced a descriptor never written in the segment.
    #[error("Unknown power stats descriptor: {0}")]
    UnknownDescriptor(i32),

    /// A write was attempted while iterators hold the log read-only.
    #[error("History is read-only while {iterators} iterator(s) are open")]
    ReadOnly {
        /// Number of iterators currently open on the log.
        iterators: usize,
    },

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl HistoryError {
    /// Returns true if the error means the bytes themselves are unusable,
    /// as opposed to a transient I/O or usage failure.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedVersion { .. }
                | Self::CorruptSegment(_)
                | Self::Truncated { .. }
                | Self::UnknownCommand(_)
                | Self::UnknownDescriptor(_)
        )
    }
}
