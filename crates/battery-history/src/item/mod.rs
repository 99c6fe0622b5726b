//! The history item: one point-in-time snapshot of device power state.
//!
//! A [`HistoryItem`] is both the unit the recorder mutates between flushes
//! and the unit the iterator yields after decoding. Optional payloads (tags,
//! events, step details, extensions) are transient: they describe what
//! happened at this instant and never carry over to the next record.

pub mod states;

use crate::codec::parcel::{ParcelReader, ParcelWriter};
use crate::error::{HistoryError, Result};
use std::hash::{Hash, Hasher};
use tracing::warn;

pub use states::*;

/// Maximum length, in characters, of a tag string.
pub const MAX_TAG_STRING_LENGTH: usize = 1024;

/// Maximum number of per-app CPU entries carried by step details.
pub const MAX_STEP_APP_CPU_ENTRIES: usize = 3;

/// Classifies how a record is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum HistoryCmd {
    /// Ordinary state change; eligible for delta encoding.
    Update = 0,
    /// History recording started.
    Start = 4,
    /// Wall-clock time anchor.
    CurrentTime = 5,
    /// History reset; carries a full snapshot and a wall-clock anchor.
    Reset = 7,
    /// Device shutting down.
    Shutdown = 8,
    /// Empty record.
    #[default]
    Null = 0xff,
}

impl HistoryCmd {
    /// Creates a command from its wire value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Update),
            4 => Some(Self::Start),
            5 => Some(Self::CurrentTime),
            7 => Some(Self::Reset),
            8 => Some(Self::Shutdown),
            0xff => Some(Self::Null),
            _ => None,
        }
    }

    /// Returns the wire value.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// True for commands that carry a wall-clock `current_time`.
    pub fn carries_current_time(self) -> bool {
        matches!(self, Self::CurrentTime | Self::Reset | Self::Shutdown)
    }
}

/// A named, uid-attributed tag such as a wakelock name or wakeup reason.
///
/// Equality and hashing consider only the string and uid; the pool index is
/// bookkeeping assigned by whichever pool interned the tag.
#[derive(Debug, Clone, Default)]
pub struct HistoryTag {
    string: String,
    uid: i32,
    pool_index: Option<u16>,
}

impl HistoryTag {
    /// Creates a tag, truncating strings longer than [`MAX_TAG_STRING_LENGTH`].
    pub fn new(string: impl Into<String>, uid: i32) -> Self {
        let mut string = string.into();
        if let Some((cut, _)) = string.char_indices().nth(MAX_TAG_STRING_LENGTH) {
            string.truncate(cut);
            let prefix: String = string.chars().take(64).collect();
            warn!("Long battery history tag truncated: {}...", prefix);
        }
        Self {
            string,
            uid,
            pool_index: None,
        }
    }

    /// The tag text.
    pub fn string(&self) -> &str {
        &self.string
    }

    /// The uid the tag is attributed to.
    pub fn uid(&self) -> i32 {
        self.uid
    }

    /// Index assigned by a tag pool, if the tag was seen through one.
    pub fn pool_index(&self) -> Option<u16> {
        self.pool_index
    }

    pub(crate) fn with_pool_index(mut self, index: Option<u16>) -> Self {
        self.pool_index = index;
        self
    }

    pub(crate) fn write_to(&self, writer: &mut ParcelWriter<'_>) {
        writer.write_string(&self.string);
        writer.write_i32(self.uid);
    }

    pub(crate) fn read_from(reader: &mut ParcelReader<'_>) -> Result<Self> {
        let string = reader.read_string()?;
        let uid = reader.read_i32()?;
        Ok(Self {
            string,
            uid,
            pool_index: None,
        })
    }
}

impl PartialEq for HistoryTag {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid && self.string == other.string
    }
}

impl Eq for HistoryTag {}

impl Hash for HistoryTag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.string.hash(state);
        self.uid.hash(state);
    }
}

/// CPU time consumed by one app over a battery step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppCpuUsage {
    /// App uid.
    pub uid: i32,
    /// User-mode CPU time in milliseconds.
    pub user_time_ms: i32,
    /// Kernel-mode CPU time in milliseconds.
    pub system_time_ms: i32,
}

/// CPU accounting captured when the battery level steps down.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StepDetails {
    /// Total user-mode CPU time since the previous step.
    pub user_time_ms: i32,
    /// Total kernel-mode CPU time since the previous step.
    pub system_time_ms: i32,
    /// Top CPU consumers, at most [`MAX_STEP_APP_CPU_ENTRIES`].
    pub app_cpu: Vec<AppCpuUsage>,
    /// `/proc/stat` user time.
    pub stat_user_time: i32,
    /// `/proc/stat` system time.
    pub stat_system_time: i32,
    /// `/proc/stat` iowait time.
    pub stat_iowait_time: i32,
    /// `/proc/stat` irq time.
    pub stat_irq_time: i32,
    /// `/proc/stat` softirq time.
    pub stat_soft_irq_time: i32,
    /// `/proc/stat` idle time.
    pub stat_idle_time: i32,
}

impl StepDetails {
    pub(crate) fn write_to(&self, writer: &mut ParcelWriter<'_>) {
        writer.write_i32(self.user_time_ms);
        writer.write_i32(self.system_time_ms);
        let app_cpu = if self.app_cpu.len() > MAX_STEP_APP_CPU_ENTRIES {
            warn!(
                "Step details carry {} app entries; keeping the first {}",
                self.app_cpu.len(),
                MAX_STEP_APP_CPU_ENTRIES
            );
            &self.app_cpu[..MAX_STEP_APP_CPU_ENTRIES]
        } else {
            &self.app_cpu[..]
        };
        writer.write_i32(app_cpu.len() as i32);
        for app in app_cpu {
            writer.write_i32(app.uid);
            writer.write_i32(app.user_time_ms);
            writer.write_i32(app.system_time_ms);
        }
        writer.write_i32(self.stat_user_time);
        writer.write_i32(self.stat_system_time);
        writer.write_i32(self.stat_iowait_time);
        writer.write_i32(self.stat_irq_time);
        writer.write_i32(self.stat_soft_irq_time);
        writer.write_i32(self.stat_idle_time);
    }

    pub(crate) fn read_from(reader: &mut ParcelReader<'_>) -> Result<Self> {
        let user_time_ms = reader.read_i32()?;
        let system_time_ms = reader.read_i32()?;
        let count = reader.read_i32()?;
        if !(0..=MAX_STEP_APP_CPU_ENTRIES as i32).contains(&count) {
            return Err(HistoryError::CorruptSegment(format!(
                "step details app count {} out of range",
                count
            )));
        }
        let mut app_cpu = Vec::with_capacity(count as usize);
        for _ in 0..count {
            app_cpu.push(AppCpuUsage {
                uid: reader.read_i32()?,
                user_time_ms: reader.read_i32()?,
                system_time_ms: reader.read_i32()?,
            });
        }
        Ok(Self {
            user_time_ms,
            system_time_ms,
            app_cpu,
            stat_user_time: reader.read_i32()?,
            stat_system_time: reader.read_i32()?,
            stat_iowait_time: reader.read_i32()?,
            stat_irq_time: reader.read_i32()?,
            stat_soft_irq_time: reader.read_i32()?,
            stat_idle_time: reader.read_i32()?,
        })
    }
}

/// Describes the layout of a family of power stats snapshots.
///
/// Written once per segment, the first time a snapshot using it appears.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PowerStatsDescriptor {
    /// Identifier referenced by every snapshot.
    pub id: i32,
    /// Human-readable name of the power component.
    pub name: String,
    /// Expected number of values per snapshot.
    pub stats_array_length: i32,
}

impl PowerStatsDescriptor {
    /// Creates a descriptor.
    pub fn new(id: i32, name: impl Into<String>, stats_array_length: i32) -> Self {
        Self {
            id,
            name: name.into(),
            stats_array_length,
        }
    }

    pub(crate) fn write_to(&self, writer: &mut ParcelWriter<'_>) {
        writer.write_i32(self.id);
        writer.write_string(&self.name);
        writer.write_i32(self.stats_array_length);
    }

    pub(crate) fn read_from(reader: &mut ParcelReader<'_>) -> Result<Self> {
        Ok(Self {
            id: reader.read_i32()?,
            name: reader.read_string()?,
            stats_array_length: reader.read_i32()?,
        })
    }
}

/// A power-draw snapshot for one component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerStats {
    /// Layout of `stats`.
    pub descriptor: PowerStatsDescriptor,
    /// Span covered by the snapshot.
    pub duration_ms: i64,
    /// Accumulated values, laid out per the descriptor.
    pub stats: Vec<i64>,
}

impl PowerStats {
    /// Creates a snapshot.
    pub fn new(descriptor: PowerStatsDescriptor, duration_ms: i64, stats: Vec<i64>) -> Self {
        Self {
            descriptor,
            duration_ms,
            stats,
        }
    }

    pub(crate) fn write_to(&self, writer: &mut ParcelWriter<'_>) {
        writer.write_i32(self.descriptor.id);
        writer.write_i64(self.duration_ms);
        writer.write_i32(self.stats.len() as i32);
        for value in &self.stats {
            writer.write_i64(*value);
        }
    }

    /// Reads a snapshot, resolving its descriptor through `lookup`.
    pub(crate) fn read_from<F>(reader: &mut ParcelReader<'_>, lookup: F) -> Result<Self>
    where
        F: FnOnce(i32) -> Option<PowerStatsDescriptor>,
    {
        let id = reader.read_i32()?;
        let descriptor = lookup(id).ok_or(HistoryError::UnknownDescriptor(id))?;
        let duration_ms = reader.read_i64()?;
        let count = reader.read_i32()?;
        if count < 0 || count as usize > reader.remaining() / 8 {
            return Err(HistoryError::CorruptSegment(format!(
                "power stats value count {} out of range",
                count
            )));
        }
        let mut stats = Vec::with_capacity(count as usize);
        for _ in 0..count {
            stats.push(reader.read_i64()?);
        }
        Ok(Self {
            descriptor,
            duration_ms,
            stats,
        })
    }
}

/// A per-uid process state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStateChange {
    /// App uid.
    pub uid: i32,
    /// New process state.
    pub process_state: i32,
}

impl ProcessStateChange {
    pub(crate) fn write_to(&self, writer: &mut ParcelWriter<'_>) {
        writer.write_i32(self.uid);
        writer.write_i32(self.process_state);
    }

    pub(crate) fn read_from(reader: &mut ParcelReader<'_>) -> Result<Self> {
        Ok(Self {
            uid: reader.read_i32()?,
            process_state: reader.read_i32()?,
        })
    }
}

/// One point-in-time snapshot of device power state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HistoryItem {
    /// History time in milliseconds.
    pub time: i64,
    /// How this record is interpreted.
    pub cmd: HistoryCmd,
    /// Primary state flags and fields, see [`states`].
    pub states: u32,
    /// Secondary state flags and fields, see [`states`].
    pub states2: u32,
    /// Battery level, 0..=100.
    pub battery_level: u8,
    /// Battery status as reported by the battery service.
    pub battery_status: u8,
    /// Battery health as reported by the battery service.
    pub battery_health: u8,
    /// Raw plug bitmask (`BATTERY_PLUGGED_*`).
    pub battery_plug_type: u8,
    /// Temperature in tenths of a degree Celsius.
    pub battery_temperature: i16,
    /// Voltage in millivolts.
    pub battery_voltage: u16,
    /// Remaining charge in microampere-hours.
    pub battery_charge_uah: i32,
    /// Accumulated modem rail charge.
    pub modem_rail_charge_mah: f64,
    /// Accumulated wifi rail charge.
    pub wifi_rail_charge_mah: f64,
    /// Wakelock acquired or released at this instant.
    pub wakelock_tag: Option<HistoryTag>,
    /// Reason the application processor woke up.
    pub wake_reason_tag: Option<HistoryTag>,
    /// Event code, `EVENT_NONE` when no event is attached.
    pub event_code: u16,
    /// Tag of the attached event.
    pub event_tag: Option<HistoryTag>,
    /// Wall-clock anchor on `CurrentTime`, `Reset` and `Shutdown` records.
    pub current_time: Option<i64>,
    /// CPU accounting attached when the battery level stepped down.
    pub step_details: Option<StepDetails>,
    /// Power-draw snapshot extension.
    pub power_stats: Option<PowerStats>,
    /// Process state change extension.
    pub process_state_change: Option<ProcessStateChange>,
}

impl HistoryItem {
    /// Creates an empty item.
    pub fn new() -> Self {
        Self::default()
    }

    /// True if an event is attached.
    pub fn has_event(&self) -> bool {
        self.event_code != EVENT_NONE
    }

    /// True if any extension payload is attached.
    pub fn has_extensions(&self) -> bool {
        self.power_stats.is_some() || self.process_state_change.is_some()
    }

    /// Sets or clears `STATE2_EXTENSIONS_FLAG` to match the attached payloads.
    pub fn sync_extensions_flag(&mut self) {
        if self.has_extensions() {
            self.states2 |= STATE2_EXTENSIONS_FLAG;
        } else {
            self.states2 &= !STATE2_EXTENSIONS_FLAG;
        }
    }

    /// Drops every transient payload so the item can describe the next instant.
    pub fn clear_transient(&mut self) {
        self.wakelock_tag = None;
        self.wake_reason_tag = None;
        self.event_code = EVENT_NONE;
        self.event_tag = None;
        self.current_time = None;
        self.step_details = None;
        self.power_stats = None;
        self.process_state_change = None;
    }

    /// Returns a copy with every transient payload removed.
    pub fn without_transient(&self) -> Self {
        let mut copy = self.clone();
        copy.clear_transient();
        copy.sync_extensions_flag();
        copy
    }

    /// Attaches an event with its tag.
    pub fn set_event(&mut self, code: u16, tag: HistoryTag) {
        self.event_code = code;
        self.event_tag = Some(tag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd_roundtrip_values() {
        for cmd in [
            HistoryCmd::Update,
            HistoryCmd::Start,
            HistoryCmd::CurrentTime,
            HistoryCmd::Reset,
            HistoryCmd::Shutdown,
            HistoryCmd::Null,
        ] {
            assert_eq!(HistoryCmd::from_u8(cmd.as_u8()), Some(cmd));
        }
        assert_eq!(HistoryCmd::from_u8(3), None);
        assert!(HistoryCmd::Shutdown.carries_current_time());
        assert!(!HistoryCmd::Update.carries_current_time());
    }

    #[test]
    fn test_tag_truncation() {
        let long = "w".repeat(MAX_TAG_STRING_LENGTH + 10);
        let tag = HistoryTag::new(long, 1000);
        assert_eq!(tag.string().chars().count(), MAX_TAG_STRING_LENGTH);

        let exact = "x".repeat(MAX_TAG_STRING_LENGTH);
        assert_eq!(HistoryTag::new(exact.clone(), 0).string(), exact);
    }

    #[test]
    fn test_tag_equality_ignores_pool_index() {
        let a = HistoryTag::new("alarm", 1000).with_pool_index(Some(3));
        let b = HistoryTag::new("alarm", 1000);
        let c = HistoryTag::new("alarm", 1001);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_clear_transient() {
        let mut item = HistoryItem::new();
        item.states = STATE_SCREEN_ON_FLAG;
        item.wakelock_tag = Some(HistoryTag::new("wl", 1));
        item.set_event(EVENT_JOB | EVENT_FLAG_START, HistoryTag::new("job", 2));
        item.process_state_change = Some(ProcessStateChange {
            uid: 10,
            process_state: 2,
        });
        item.sync_extensions_flag();
        assert_ne!(item.states2 & STATE2_EXTENSIONS_FLAG, 0);

        let cleared = item.without_transient();
        assert_eq!(cleared.states, STATE_SCREEN_ON_FLAG);
        assert!(cleared.wakelock_tag.is_none());
        assert!(!cleared.has_event());
        assert!(!cleared.has_extensions());
        assert_eq!(cleared.states2 & STATE2_EXTENSIONS_FLAG, 0);
    }

    #[test]
    fn test_step_details_rejects_bad_count() {
        let mut buf = Vec::new();
        let mut writer = ParcelWriter::new(&mut buf);
        writer.write_i32(1);
        writer.write_i32(2);
        writer.write_i32(9);
        let err = StepDetails::read_from(&mut ParcelReader::new(&buf)).unwrap_err();
        assert!(err.is_corruption());
    }
}
