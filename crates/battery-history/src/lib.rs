//! Alopex Battery History - append-only, delta-encoded power event log
//!
//! This crate records a device's power-relevant state (battery level and
//! health, radio and screen state, wakelocks, wakeups, power-stats snapshots)
//! as a sequence of compact records spread over rotating segment files.
//!
//! # Components
//!
//! - [`BatteryHistory`]: the log; owns the recorder surface and the active segment
//! - [`codec`]: delta encoding of [`HistoryItem`]s against the previous record
//! - [`TagPool`]: per-log interning of wakelock and wakeup tags
//! - [`SegmentDirectory`]: segment files, atomic seals and retention
//! - [`HistoryIterator`] / [`HistorySnapshot`]: read paths
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_battery_history::{BatteryHistory, HistoryConfig, HistoryTag};
//!
//! let config = HistoryConfig::default();
//! let mut history = BatteryHistory::open("/data/system/battery-history", config)?;
//! history.set_battery_state(false, 3, 87, 3_400_000);
//! history.record_wakelock_start_event(elapsed, uptime, Some(HistoryTag::new("*alarm*", 1000)))?;
//! history.write_history()?;
//!
//! for item in history.iterate(0, 0) {
//!     println!("{} {:?} level={}", item.time, item.cmd, item.battery_level);
//! }
//! ```

#![deny(missing_docs)]

pub mod clock;
pub mod codec;
pub mod error;
pub mod history;
pub mod item;
pub mod iter;
pub mod lifecycle;
pub mod pool;
pub mod segment;
pub mod trace;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{HistoryError, Result};
pub use history::recorder::StepDetailsProvider;
pub use history::{BatteryHistory, HistoryConfig};
pub use item::{
    HistoryCmd, HistoryItem, HistoryTag, PowerStats, PowerStatsDescriptor, ProcessStateChange,
    StepDetails,
};
pub use iter::{HistoryIterator, HistorySnapshot};
pub use lifecycle::{SegmentDirectory, SegmentFile, SyncMode};
pub use pool::TagPool;
pub use trace::{HistoryTracer, LogTracer};
