//! Typed views over the packed 32-bit words of the record format.
//!
//! Each word keeps its raw `u32` and exposes its fields through accessors
//! backed by `bitvec` ranges, so every offset in the format lives here and
//! nowhere else.
//!
//! ```text
//! DeltaToken         31..25 high states | 24 charge | 23 event | 22 wakelock
//!                    | 21 states2 | 20 states | 19 level | 18..0 time token
//! BatteryLevelWord   31..25 level | 24..15 temperature (signed) | 14..1 voltage
//!                    | 0 step details
//! StateWord          31..29 status | 28..26 health | 25..24 plug class
//!                    | 23..0 low states
//! TagRefWord         31..16 wake reason index | 15..0 wakelock index
//! EventWord          31..16 tag index | 15..0 event code
//! ```

use crate::item::{
    HistoryCmd, HistoryItem, BATTERY_PLUGGED_AC, BATTERY_PLUGGED_USB, BATTERY_PLUGGED_WIRELESS,
    STATE_BATTERY_MASK, STATE_HIGH_MASK,
};
use bitvec::prelude::*;
use std::ops::Range;
use tracing::warn;

/// Largest delta time that fits inline in the token.
pub const DELTA_TIME_MASK: u32 = 0x7ffff;
/// Token sentinel: an `i64` delta time follows.
pub const DELTA_TIME_LONG: u32 = 0x7ffff;
/// Token sentinel: an `i32` delta time follows.
pub const DELTA_TIME_INT: u32 = 0x7fffe;
/// Token sentinel: an absolute record follows.
pub const DELTA_TIME_ABS: u32 = 0x7fffd;

/// Marks an absent slot in a tag reference word.
pub const TAG_INDEX_NONE: u16 = 0xffff;

fn get(raw: u32, range: Range<usize>) -> u32 {
    raw.view_bits::<Lsb0>()[range].load_le::<u32>()
}

fn put(raw: &mut u32, range: Range<usize>, value: u32, field: &str) {
    let width = range.len();
    let limit = if width >= 32 { u32::MAX } else { (1u32 << width) - 1 };
    if value > limit {
        warn!(
            "Value {} does not fit in the {}-bit {} field; masking",
            value, width, field
        );
    }
    raw.view_bits_mut::<Lsb0>()[range].store_le::<u32>(value & limit);
}

fn get_bit(raw: u32, bit: usize) -> bool {
    raw.view_bits::<Lsb0>()[bit]
}

fn put_bit(raw: &mut u32, bit: usize, value: bool) {
    raw.view_bits_mut::<Lsb0>().set(bit, value);
}

fn sign_extend(value: u32, width: u32) -> i32 {
    let shift = 32 - width;
    ((value << shift) as i32) >> shift
}

/// Presence flags carried by a [`DeltaToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum DeltaFlag {
    /// A [`BatteryLevelWord`] follows.
    BatteryLevel = 19,
    /// A [`StateWord`] follows.
    State = 20,
    /// A raw `states2` word follows.
    State2 = 21,
    /// A [`TagRefWord`] follows.
    Wakelock = 22,
    /// An [`EventWord`] follows.
    Event = 23,
    /// A battery charge `i32` follows.
    BatteryCharge = 24,
}

/// The leading word of every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaToken(u32);

impl DeltaToken {
    const TIME: Range<usize> = 0..19;
    const HIGH_STATES: Range<usize> = 25..32;

    /// Token for an absolute record.
    pub fn absolute() -> Self {
        Self(DELTA_TIME_ABS)
    }

    /// Builds a token from a time token and the item's high state bits.
    pub fn new(time_token: u32, states: u32) -> Self {
        let mut raw = 0;
        put(&mut raw, Self::TIME, time_token, "time token");
        put(&mut raw, Self::HIGH_STATES, states >> 25, "high states");
        Self(raw)
    }

    /// Wraps a raw token.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw word.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Inline delta time or one of the `DELTA_TIME_*` sentinels.
    pub fn time_token(self) -> u32 {
        get(self.0, Self::TIME)
    }

    /// High state bits, in their `states` positions.
    pub fn high_states(self) -> u32 {
        get(self.0, Self::HIGH_STATES) << 25 & STATE_HIGH_MASK
    }

    /// True if `flag` is set.
    pub fn has(self, flag: DeltaFlag) -> bool {
        get_bit(self.0, flag as usize)
    }

    /// Sets `flag`.
    pub fn set(&mut self, flag: DeltaFlag) {
        put_bit(&mut self.0, flag as usize, true);
    }
}

/// Battery level, temperature and voltage packed into one word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryLevelWord(u32);

impl BatteryLevelWord {
    const STEP_DETAILS: usize = 0;
    const VOLTAGE: Range<usize> = 1..15;
    const TEMPERATURE: Range<usize> = 15..25;
    const LEVEL: Range<usize> = 25..32;

    /// True if level, temperature and voltage fit their packed fields
    /// unchanged. Items that don't must be written as absolute records.
    pub fn fits(item: &HistoryItem) -> bool {
        item.battery_level < 1 << Self::LEVEL.len()
            && (-512..=511).contains(&item.battery_temperature)
            && u32::from(item.battery_voltage) < 1 << Self::VOLTAGE.len()
    }

    /// Packs the item's battery fields.
    pub fn from_item(item: &HistoryItem, has_step_details: bool) -> Self {
        let mut raw = 0;
        put(&mut raw, Self::LEVEL, u32::from(item.battery_level), "battery level");
        let temperature = i32::from(item.battery_temperature);
        if !(-512..=511).contains(&temperature) {
            warn!(
                "Battery temperature {} outside the 10-bit signed range; masking",
                temperature
            );
        }
        put(&mut raw, Self::TEMPERATURE, temperature as u32 & 0x3ff, "temperature");
        put(&mut raw, Self::VOLTAGE, u32::from(item.battery_voltage), "voltage");
        put_bit(&mut raw, Self::STEP_DETAILS, has_step_details);
        Self(raw)
    }

    /// Wraps a raw word.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw word.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Battery level.
    pub fn level(self) -> u8 {
        get(self.0, Self::LEVEL) as u8
    }

    /// Temperature in tenths of a degree, sign-extended.
    pub fn temperature(self) -> i16 {
        sign_extend(get(self.0, Self::TEMPERATURE), 10) as i16
    }

    /// Voltage in millivolts.
    pub fn voltage(self) -> u16 {
        get(self.0, Self::VOLTAGE) as u16
    }

    /// True if a step details payload follows the record's fixed words.
    pub fn has_step_details(self) -> bool {
        get_bit(self.0, Self::STEP_DETAILS)
    }

    /// Copies the packed fields into `item`.
    pub fn apply_to(self, item: &mut HistoryItem) {
        item.battery_level = self.level();
        item.battery_temperature = self.temperature();
        item.battery_voltage = self.voltage();
    }
}

/// Battery status, health, plug class and the low 24 state bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateWord(u32);

impl StateWord {
    const LOW_STATES: Range<usize> = 0..24;
    const PLUG: Range<usize> = 24..26;
    const HEALTH: Range<usize> = 26..29;
    const STATUS: Range<usize> = 29..32;

    /// Packs the item's status, health, plug class and low states.
    pub fn from_item(item: &HistoryItem) -> Self {
        let mut raw = item.states & !STATE_BATTERY_MASK;
        put(&mut raw, Self::STATUS, u32::from(item.battery_status), "battery status");
        put(&mut raw, Self::HEALTH, u32::from(item.battery_health), "battery health");
        put(&mut raw, Self::PLUG, plug_class(item.battery_plug_type), "plug type");
        Self(raw)
    }

    /// Wraps a raw word.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw word.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Battery status.
    pub fn status(self) -> u8 {
        get(self.0, Self::STATUS) as u8
    }

    /// Battery health.
    pub fn health(self) -> u8 {
        get(self.0, Self::HEALTH) as u8
    }

    /// Plug class: 0 none, 1 AC, 2 USB, 3 wireless.
    pub fn plug_class(self) -> u8 {
        get(self.0, Self::PLUG) as u8
    }

    /// The low 24 state bits.
    pub fn low_states(self) -> u32 {
        get(self.0, Self::LOW_STATES)
    }

    /// Copies the packed fields into `item`, combining with the token's high bits.
    pub fn apply_to(self, item: &mut HistoryItem, high_states: u32) {
        item.battery_status = self.status();
        item.battery_health = self.health();
        item.battery_plug_type = plug_type_from_class(self.plug_class());
        item.states = high_states | (self.low_states() & !STATE_BATTERY_MASK);
    }
}

/// Reduces a raw plug bitmask to its two-bit class.
pub fn plug_class(plug_type: u8) -> u32 {
    if plug_type & BATTERY_PLUGGED_AC != 0 {
        1
    } else if plug_type & BATTERY_PLUGGED_USB != 0 {
        2
    } else if plug_type & BATTERY_PLUGGED_WIRELESS != 0 {
        3
    } else {
        0
    }
}

fn plug_type_from_class(class: u8) -> u8 {
    match class {
        1 => BATTERY_PLUGGED_AC,
        2 => BATTERY_PLUGGED_USB,
        3 => BATTERY_PLUGGED_WIRELESS,
        _ => 0,
    }
}

/// Pool indices of the wakelock and wake reason tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagRefWord(u32);

impl TagRefWord {
    const WAKELOCK: Range<usize> = 0..16;
    const WAKE_REASON: Range<usize> = 16..32;

    /// Packs two pool indices; use [`TAG_INDEX_NONE`] for an absent slot.
    pub fn new(wakelock: u16, wake_reason: u16) -> Self {
        let mut raw = 0;
        put(&mut raw, Self::WAKELOCK, u32::from(wakelock), "wakelock index");
        put(&mut raw, Self::WAKE_REASON, u32::from(wake_reason), "wake reason index");
        Self(raw)
    }

    /// Wraps a raw word.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw word.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Wakelock pool index, or [`TAG_INDEX_NONE`].
    pub fn wakelock(self) -> u16 {
        get(self.0, Self::WAKELOCK) as u16
    }

    /// Wake reason pool index, or [`TAG_INDEX_NONE`].
    pub fn wake_reason(self) -> u16 {
        get(self.0, Self::WAKE_REASON) as u16
    }
}

/// Event code and the pool index of its tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventWord(u32);

impl EventWord {
    const CODE: Range<usize> = 0..16;
    const TAG: Range<usize> = 16..32;

    /// Packs an event code with its tag index.
    pub fn new(code: u16, tag_index: u16) -> Self {
        let mut raw = 0;
        put(&mut raw, Self::CODE, u32::from(code), "event code");
        put(&mut raw, Self::TAG, u32::from(tag_index), "event tag index");
        Self(raw)
    }

    /// Wraps a raw word.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw word.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Event code.
    pub fn code(self) -> u16 {
        get(self.0, Self::CODE) as u16
    }

    /// Pool index of the event tag.
    pub fn tag_index(self) -> u16 {
        get(self.0, Self::TAG) as u16
    }
}

/// First field word of an absolute record.
///
/// ```text
/// 31 step details | 30 event | 29 wake reason | 28 wakelock | 27..24 plug
/// | 23..20 health | 19..16 status | 15..8 level | 7..0 cmd
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbsoluteHeaderWord(u32);

impl AbsoluteHeaderWord {
    const CMD: Range<usize> = 0..8;
    const LEVEL: Range<usize> = 8..16;
    const STATUS: Range<usize> = 16..20;
    const HEALTH: Range<usize> = 20..24;
    const PLUG: Range<usize> = 24..28;
    const WAKELOCK: usize = 28;
    const WAKE_REASON: usize = 29;
    const EVENT: usize = 30;
    const STEP_DETAILS: usize = 31;

    /// Packs the item's command, battery fields and presence bits.
    pub fn from_item(item: &HistoryItem) -> Self {
        let mut raw = 0;
        put(&mut raw, Self::CMD, u32::from(item.cmd.as_u8()), "cmd");
        put(&mut raw, Self::LEVEL, u32::from(item.battery_level), "battery level");
        put(&mut raw, Self::STATUS, u32::from(item.battery_status), "battery status");
        put(&mut raw, Self::HEALTH, u32::from(item.battery_health), "battery health");
        put(&mut raw, Self::PLUG, u32::from(item.battery_plug_type), "plug type");
        put_bit(&mut raw, Self::WAKELOCK, item.wakelock_tag.is_some());
        put_bit(&mut raw, Self::WAKE_REASON, item.wake_reason_tag.is_some());
        put_bit(&mut raw, Self::EVENT, item.has_event());
        put_bit(&mut raw, Self::STEP_DETAILS, item.step_details.is_some());
        Self(raw)
    }

    /// Wraps a raw word.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw word.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Raw command byte.
    pub fn cmd_byte(self) -> u8 {
        get(self.0, Self::CMD) as u8
    }

    /// Decoded command, if known.
    pub fn cmd(self) -> Option<HistoryCmd> {
        HistoryCmd::from_u8(self.cmd_byte())
    }

    /// Battery level.
    pub fn level(self) -> u8 {
        get(self.0, Self::LEVEL) as u8
    }

    /// Battery status.
    pub fn status(self) -> u8 {
        get(self.0, Self::STATUS) as u8
    }

    /// Battery health.
    pub fn health(self) -> u8 {
        get(self.0, Self::HEALTH) as u8
    }

    /// Raw plug bitmask.
    pub fn plug_type(self) -> u8 {
        get(self.0, Self::PLUG) as u8
    }

    /// A wakelock tag follows.
    pub fn has_wakelock(self) -> bool {
        get_bit(self.0, Self::WAKELOCK)
    }

    /// A wake reason tag follows.
    pub fn has_wake_reason(self) -> bool {
        get_bit(self.0, Self::WAKE_REASON)
    }

    /// An event follows.
    pub fn has_event(self) -> bool {
        get_bit(self.0, Self::EVENT)
    }

    /// Step details follow.
    pub fn has_step_details(self) -> bool {
        get_bit(self.0, Self::STEP_DETAILS)
    }
}

/// Temperature and voltage of an absolute record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbsoluteBatteryWord(u32);

impl AbsoluteBatteryWord {
    const TEMPERATURE: Range<usize> = 0..16;
    const VOLTAGE: Range<usize> = 16..32;

    /// Packs temperature and voltage at full width.
    pub fn new(temperature: i16, voltage: u16) -> Self {
        let mut raw = 0;
        put(&mut raw, Self::TEMPERATURE, u32::from(temperature as u16), "temperature");
        put(&mut raw, Self::VOLTAGE, u32::from(voltage), "voltage");
        Self(raw)
    }

    /// Wraps a raw word.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw word.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Temperature in tenths of a degree.
    pub fn temperature(self) -> i16 {
        get(self.0, Self::TEMPERATURE) as u16 as i16
    }

    /// Voltage in millivolts.
    pub fn voltage(self) -> u16 {
        get(self.0, Self::VOLTAGE) as u16
    }
}
