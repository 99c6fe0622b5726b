//! Delta codec for history records.
//!
//! A record is either absolute (a full snapshot, used for the first record
//! of a segment and for every non-`Update` command) or a delta against the
//! previous record, where a leading [`DeltaToken`] flags which packed words
//! follow. All values are written through [`parcel`] so records stay
//! four-byte aligned.
//!
//! # Delta record
//!
//! ```text
//! +-------------+-------------------+-------------+------------+-------------+
//! | DeltaToken  | time (i32 / i64)? | level word? | state word?| states2?    |
//! +-------------+-------------------+-------------+------------+-------------+
//! | TagRefWord? + literal tags      | EventWord? + literal tag                |
//! +---------------------------------+------------------------------------------+
//! | step details? | charge (i32)? | modem rail (f64) | wifi rail (f64) | ext? |
//! +---------------+---------------+------------------+-----------------+------+
//! ```
//!
//! # Absolute record
//!
//! ```text
//! ABS token | time (i64) | AbsoluteHeaderWord | AbsoluteBatteryWord | charge
//! | modem rail | wifi rail | states | states2 | tags (index + literal)*
//! | event code + tag? | current time (i64)? | step details? | ext?
//! ```

pub mod parcel;
pub mod words;

use crate::error::{HistoryError, Result};
use crate::item::{
    HistoryCmd, HistoryItem, HistoryTag, PowerStats, PowerStatsDescriptor, ProcessStateChange,
    StepDetails, STATE2_EXTENSIONS_FLAG, STATE_BATTERY_MASK,
};
use crate::pool::{TagPool, TAG_FIRST_OCCURRENCE_FLAG, TAG_OVERFLOW_INDEX};
use parcel::{ParcelReader, ParcelWriter};
use std::collections::{HashMap, HashSet};
use words::{
    AbsoluteBatteryWord, AbsoluteHeaderWord, BatteryLevelWord, DeltaFlag, DeltaToken, EventWord,
    StateWord, TagRefWord, DELTA_TIME_ABS, DELTA_TIME_INT, DELTA_TIME_LONG, TAG_INDEX_NONE,
};

/// Extension flag: a power stats descriptor precedes the snapshot.
pub const EXTENSION_POWER_STATS_DESCRIPTOR_FLAG: i32 = 0x1;
/// Extension flag: a power stats snapshot follows.
pub const EXTENSION_POWER_STATS_FLAG: i32 = 0x2;
/// Extension flag: a process state change follows.
pub const EXTENSION_PROCESS_STATE_CHANGE_FLAG: i32 = 0x4;

/// Writer-side state that spans records within a segment.
#[derive(Debug, Default)]
pub struct EncoderState {
    /// Tag interning table.
    pub pool: TagPool,
    written_descriptors: HashSet<i32>,
}

impl EncoderState {
    /// Creates an empty encoder state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepares for a new segment: every tag and descriptor must be
    /// re-established literally.
    pub fn start_segment(&mut self) {
        self.pool.mark_all_unseen();
        self.written_descriptors.clear();
    }

    /// Records a descriptor as already present in the current segment.
    pub fn mark_descriptor_written(&mut self, id: i32) {
        self.written_descriptors.insert(id);
    }

    /// Returns true if the descriptor has been written to the current segment.
    pub fn is_descriptor_written(&self, id: i32) -> bool {
        self.written_descriptors.contains(&id)
    }

    /// Forgets everything, including tag indices.
    pub fn clear(&mut self) {
        self.pool.clear();
        self.written_descriptors.clear();
    }
}

/// Reader-side state: tags and descriptors established by earlier records.
#[derive(Debug, Default, Clone)]
pub struct DecoderState {
    tags: HashMap<u16, HistoryTag>,
    descriptors: HashMap<i32, PowerStatsDescriptor>,
}

impl DecoderState {
    /// Creates an empty decoder state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tags registered so far, keyed by pool index.
    pub fn tags(&self) -> &HashMap<u16, HistoryTag> {
        &self.tags
    }

    /// Descriptors registered so far, keyed by id.
    pub fn descriptors(&self) -> &HashMap<i32, PowerStatsDescriptor> {
        &self.descriptors
    }
}

/// What the encoder learned while writing a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeMeta {
    /// At least one tag was written literally because it was new to the segment.
    pub tags_first_occurrence: bool,
    /// The record was written in absolute form.
    pub absolute: bool,
}

/// Appends `cur` to `out`, as a delta against `prev` when possible.
///
/// `STATE2_EXTENSIONS_FLAG` is written to match the attached extension
/// payloads regardless of its value in `cur.states2`.
pub fn encode_delta(
    out: &mut Vec<u8>,
    cur: &HistoryItem,
    prev: Option<&HistoryItem>,
    state: &mut EncoderState,
) -> EncodeMeta {
    let mut writer = ParcelWriter::new(out);
    match prev {
        Some(prev) if cur.cmd == HistoryCmd::Update && BatteryLevelWord::fits(cur) => {
            write_delta(&mut writer, cur, prev, state)
        }
        _ => write_absolute(&mut writer, cur, state),
    }
}

fn normalized_states2(item: &HistoryItem) -> u32 {
    if item.has_extensions() {
        item.states2 | STATE2_EXTENSIONS_FLAG
    } else {
        item.states2 & !STATE2_EXTENSIONS_FLAG
    }
}

fn write_delta(
    writer: &mut ParcelWriter<'_>,
    cur: &HistoryItem,
    prev: &HistoryItem,
    state: &mut EncoderState,
) -> EncodeMeta {
    let mut meta = EncodeMeta::default();
    let delta_time = cur.time.wrapping_sub(prev.time);
    let time_token = if (0..i64::from(DELTA_TIME_ABS)).contains(&delta_time) {
        delta_time as u32
    } else if i32::try_from(delta_time).is_ok() {
        DELTA_TIME_INT
    } else {
        DELTA_TIME_LONG
    };

    let mut token = DeltaToken::new(time_token, cur.states);

    let level_word = BatteryLevelWord::from_item(cur, cur.step_details.is_some());
    let level_changed = cur.battery_level != prev.battery_level
        || cur.battery_temperature != prev.battery_temperature
        || cur.battery_voltage != prev.battery_voltage
        || cur.step_details.is_some();
    if level_changed {
        token.set(DeltaFlag::BatteryLevel);
    }

    let state_word = StateWord::from_item(cur);
    let state_changed = state_word.raw() != StateWord::from_item(prev).raw();
    if state_changed {
        token.set(DeltaFlag::State);
    }

    let states2 = normalized_states2(cur);
    let state2_changed =
        states2 != prev.states2 & !STATE2_EXTENSIONS_FLAG || cur.has_extensions();
    if state2_changed {
        token.set(DeltaFlag::State2);
    }

    let has_tags = cur.wakelock_tag.is_some() || cur.wake_reason_tag.is_some();
    if has_tags {
        token.set(DeltaFlag::Wakelock);
    }
    if cur.has_event() {
        token.set(DeltaFlag::Event);
    }
    let charge_changed = cur.battery_charge_uah != prev.battery_charge_uah;
    if charge_changed {
        token.set(DeltaFlag::BatteryCharge);
    }

    writer.write_u32(token.raw());
    match time_token {
        DELTA_TIME_INT => writer.write_i32(delta_time as i32),
        DELTA_TIME_LONG => writer.write_i64(delta_time),
        _ => {}
    }

    if level_changed {
        writer.write_u32(level_word.raw());
    }
    if state_changed {
        writer.write_u32(state_word.raw());
    }
    if state2_changed {
        writer.write_u32(states2);
    }

    if has_tags {
        let wakelock = cur.wakelock_tag.as_ref().map(|tag| state.pool.intern(tag));
        let wake_reason = cur.wake_reason_tag.as_ref().map(|tag| state.pool.intern(tag));
        let word = TagRefWord::new(
            wakelock.unwrap_or(TAG_INDEX_NONE),
            wake_reason.unwrap_or(TAG_INDEX_NONE),
        );
        writer.write_u32(word.raw());
        for (index, tag) in [
            (wakelock, cur.wakelock_tag.as_ref()),
            (wake_reason, cur.wake_reason_tag.as_ref()),
        ] {
            if let (Some(index), Some(tag)) = (index, tag) {
                if index & TAG_FIRST_OCCURRENCE_FLAG != 0 {
                    tag.write_to(writer);
                    meta.tags_first_occurrence = true;
                }
            }
        }
    }

    if cur.has_event() {
        let index = cur.event_tag.as_ref().map(|tag| state.pool.intern(tag));
        let word = EventWord::new(cur.event_code, index.unwrap_or(TAG_INDEX_NONE));
        writer.write_u32(word.raw());
        if let (Some(index), Some(tag)) = (index, cur.event_tag.as_ref()) {
            if index & TAG_FIRST_OCCURRENCE_FLAG != 0 {
                tag.write_to(writer);
                meta.tags_first_occurrence = true;
            }
        }
    }

    if let Some(details) = &cur.step_details {
        details.write_to(writer);
    }
    if charge_changed {
        writer.write_i32(cur.battery_charge_uah);
    }
    writer.write_f64(cur.modem_rail_charge_mah);
    writer.write_f64(cur.wifi_rail_charge_mah);
    if cur.has_extensions() {
        write_extensions(writer, cur, state);
    }
    meta
}

fn write_absolute(
    writer: &mut ParcelWriter<'_>,
    cur: &HistoryItem,
    state: &mut EncoderState,
) -> EncodeMeta {
    let mut meta = EncodeMeta {
        absolute: true,
        ..EncodeMeta::default()
    };
    writer.write_u32(DeltaToken::absolute().raw());
    writer.write_i64(cur.time);
    writer.write_u32(AbsoluteHeaderWord::from_item(cur).raw());
    writer.write_u32(AbsoluteBatteryWord::new(cur.battery_temperature, cur.battery_voltage).raw());
    writer.write_i32(cur.battery_charge_uah);
    writer.write_f64(cur.modem_rail_charge_mah);
    writer.write_f64(cur.wifi_rail_charge_mah);
    writer.write_u32(cur.states);
    writer.write_u32(normalized_states2(cur));

    // Absolute records always embed literals but still intern, so that later
    // deltas in the segment can refer to these tags by index.
    for tag in [cur.wakelock_tag.as_ref(), cur.wake_reason_tag.as_ref()]
        .into_iter()
        .flatten()
    {
        let index = state.pool.intern(tag);
        meta.tags_first_occurrence |= index & TAG_FIRST_OCCURRENCE_FLAG != 0;
        writer.write_i32(i32::from(index));
        tag.write_to(writer);
    }
    if cur.has_event() {
        writer.write_i32(i32::from(cur.event_code));
        match &cur.event_tag {
            Some(tag) => {
                let index = state.pool.intern(tag);
                meta.tags_first_occurrence |= index & TAG_FIRST_OCCURRENCE_FLAG != 0;
                writer.write_i32(i32::from(index));
                tag.write_to(writer);
            }
            None => writer.write_i32(i32::from(TAG_INDEX_NONE)),
        }
    }
    if cur.cmd.carries_current_time() {
        writer.write_i64(cur.current_time.unwrap_or(0));
    }
    if let Some(details) = &cur.step_details {
        details.write_to(writer);
    }
    if cur.has_extensions() {
        write_extensions(writer, cur, state);
    }
    meta
}

fn write_extensions(writer: &mut ParcelWriter<'_>, cur: &HistoryItem, state: &mut EncoderState) {
    let mut flags = 0;
    let mut new_descriptor = None;
    if let Some(stats) = &cur.power_stats {
        if state.written_descriptors.insert(stats.descriptor.id) {
            flags |= EXTENSION_POWER_STATS_DESCRIPTOR_FLAG;
            new_descriptor = Some(&stats.descriptor);
        }
        flags |= EXTENSION_POWER_STATS_FLAG;
    }
    if cur.process_state_change.is_some() {
        flags |= EXTENSION_PROCESS_STATE_CHANGE_FLAG;
    }
    writer.write_i32(flags);
    if let Some(descriptor) = new_descriptor {
        descriptor.write_to(writer);
    }
    if let Some(stats) = &cur.power_stats {
        stats.write_to(writer);
    }
    if let Some(change) = &cur.process_state_change {
        change.write_to(writer);
    }
}

/// Decodes the next record from `reader`.
///
/// `prev` is the previously decoded record of the same segment, `None` at
/// the start of a segment. The number of bytes consumed is the change in
/// `reader.position()`.
pub fn decode_delta(
    reader: &mut ParcelReader<'_>,
    prev: Option<&HistoryItem>,
    state: &mut DecoderState,
) -> Result<HistoryItem> {
    let token = DeltaToken::from_raw(reader.read_u32()?);
    if token.time_token() == DELTA_TIME_ABS {
        return read_absolute(reader, state);
    }
    let prev = prev.ok_or_else(|| {
        HistoryError::CorruptSegment("delta record without a preceding record".to_string())
    })?;
    read_delta(reader, token, prev, state)
}

fn read_delta(
    reader: &mut ParcelReader<'_>,
    token: DeltaToken,
    prev: &HistoryItem,
    state: &mut DecoderState,
) -> Result<HistoryItem> {
    let mut item = prev.without_transient();
    item.cmd = HistoryCmd::Update;

    let delta_time = match token.time_token() {
        DELTA_TIME_INT => i64::from(reader.read_i32()?),
        DELTA_TIME_LONG => reader.read_i64()?,
        inline => i64::from(inline),
    };
    item.time = prev.time.wrapping_add(delta_time);

    let mut has_step_details = false;
    if token.has(DeltaFlag::BatteryLevel) {
        let word = BatteryLevelWord::from_raw(reader.read_u32()?);
        word.apply_to(&mut item);
        has_step_details = word.has_step_details();
    }

    if token.has(DeltaFlag::State) {
        StateWord::from_raw(reader.read_u32()?).apply_to(&mut item, token.high_states());
    } else {
        item.states = token.high_states() | (prev.states & !STATE_BATTERY_MASK);
    }

    if token.has(DeltaFlag::State2) {
        item.states2 = reader.read_u32()?;
    }

    if token.has(DeltaFlag::Wakelock) {
        let word = TagRefWord::from_raw(reader.read_u32()?);
        item.wakelock_tag = read_tag_ref(reader, word.wakelock(), state)?;
        item.wake_reason_tag = read_tag_ref(reader, word.wake_reason(), state)?;
    }

    if token.has(DeltaFlag::Event) {
        let word = EventWord::from_raw(reader.read_u32()?);
        item.event_code = word.code();
        item.event_tag = read_tag_ref(reader, word.tag_index(), state)?;
    }

    if has_step_details {
        item.step_details = Some(StepDetails::read_from(reader)?);
    }
    if token.has(DeltaFlag::BatteryCharge) {
        item.battery_charge_uah = reader.read_i32()?;
    }
    item.modem_rail_charge_mah = reader.read_f64()?;
    item.wifi_rail_charge_mah = reader.read_f64()?;
    if item.states2 & STATE2_EXTENSIONS_FLAG != 0 {
        read_extensions(reader, &mut item, state)?;
    }
    Ok(item)
}

fn read_absolute(reader: &mut ParcelReader<'_>, state: &mut DecoderState) -> Result<HistoryItem> {
    let mut item = HistoryItem::new();
    item.time = reader.read_i64()?;
    let header = AbsoluteHeaderWord::from_raw(reader.read_u32()?);
    item.cmd = header
        .cmd()
        .ok_or_else(|| HistoryError::UnknownCommand(header.cmd_byte()))?;
    item.battery_level = header.level();
    item.battery_status = header.status();
    item.battery_health = header.health();
    item.battery_plug_type = header.plug_type();
    let battery = AbsoluteBatteryWord::from_raw(reader.read_u32()?);
    item.battery_temperature = battery.temperature();
    item.battery_voltage = battery.voltage();
    item.battery_charge_uah = reader.read_i32()?;
    item.modem_rail_charge_mah = reader.read_f64()?;
    item.wifi_rail_charge_mah = reader.read_f64()?;
    item.states = reader.read_u32()?;
    item.states2 = reader.read_u32()?;

    if header.has_wakelock() {
        item.wakelock_tag = Some(read_literal_tag(reader, state)?);
    }
    if header.has_wake_reason() {
        item.wake_reason_tag = Some(read_literal_tag(reader, state)?);
    }
    if header.has_event() {
        let code = reader.read_i32()?;
        item.event_code = u16::try_from(code).map_err(|_| {
            HistoryError::CorruptSegment(format!("event code {} out of range", code))
        })?;
        let index = reader.read_i32()? as u16;
        item.event_tag = if index == TAG_INDEX_NONE {
            None
        } else {
            let tag = HistoryTag::read_from(reader)?;
            Some(register_tag(index, tag, state))
        };
    }
    if item.cmd.carries_current_time() {
        item.current_time = Some(reader.read_i64()?);
    }
    if header.has_step_details() {
        item.step_details = Some(StepDetails::read_from(reader)?);
    }
    if item.states2 & STATE2_EXTENSIONS_FLAG != 0 {
        read_extensions(reader, &mut item, state)?;
    }
    Ok(item)
}

fn read_literal_tag(reader: &mut ParcelReader<'_>, state: &mut DecoderState) -> Result<HistoryTag> {
    let index = reader.read_i32()? as u16;
    let tag = HistoryTag::read_from(reader)?;
    Ok(register_tag(index, tag, state))
}

fn register_tag(index: u16, tag: HistoryTag, state: &mut DecoderState) -> HistoryTag {
    if index == TAG_OVERFLOW_INDEX {
        return tag;
    }
    let index = index & !TAG_FIRST_OCCURRENCE_FLAG;
    let tag = tag.with_pool_index(Some(index));
    state.tags.insert(index, tag.clone());
    tag
}

fn read_tag_ref(
    reader: &mut ParcelReader<'_>,
    index: u16,
    state: &mut DecoderState,
) -> Result<Option<HistoryTag>> {
    if index == TAG_INDEX_NONE {
        return Ok(None);
    }
    if index & TAG_FIRST_OCCURRENCE_FLAG != 0 {
        let tag = HistoryTag::read_from(reader)?;
        return Ok(Some(register_tag(index, tag, state)));
    }
    state
        .tags
        .get(&index)
        .cloned()
        .map(Some)
        .ok_or_else(|| HistoryError::CorruptSegment(format!("unknown tag index {}", index)))
}

fn read_extensions(
    reader: &mut ParcelReader<'_>,
    item: &mut HistoryItem,
    state: &mut DecoderState,
) -> Result<()> {
    let flags = reader.read_i32()?;
    if flags & EXTENSION_POWER_STATS_DESCRIPTOR_FLAG != 0 {
        let descriptor = PowerStatsDescriptor::read_from(reader)?;
        state.descriptors.insert(descriptor.id, descriptor);
    }
    if flags & EXTENSION_POWER_STATS_FLAG != 0 {
        let descriptors = &state.descriptors;
        item.power_stats = Some(PowerStats::read_from(reader, |id| {
            descriptors.get(&id).cloned()
        })?);
    }
    if flags & EXTENSION_PROCESS_STATE_CHANGE_FLAG != 0 {
        item.process_state_change = Some(ProcessStateChange::read_from(reader)?);
    }
    Ok(())
}
