//! The event surface of [`BatteryHistory`]: one call per kind of change.
//!
//! Pure setters (`set_*`) only update the scratch item; the next recorded
//! event carries the new values. Every `record_*` call updates the scratch
//! item and flushes it, so each returns the flush result.

use super::BatteryHistory;
use crate::error::Result;
use crate::item::{
    set_bit_field, HistoryCmd, HistoryTag, PowerStats, ProcessStateChange, StepDetails,
    STATE2_CHARGING_FLAG, STATE2_DEVICE_IDLE_MASK, STATE2_DEVICE_IDLE_SHIFT,
    STATE2_GPS_SIGNAL_QUALITY_MASK, STATE2_GPS_SIGNAL_QUALITY_SHIFT, STATE2_NR_STATE_MASK,
    STATE2_NR_STATE_SHIFT, STATE2_WIFI_SIGNAL_STRENGTH_MASK, STATE2_WIFI_SIGNAL_STRENGTH_SHIFT,
    STATE2_WIFI_SUPPL_STATE_MASK, STATE2_WIFI_SUPPL_STATE_SHIFT, STATE_BATTERY_PLUGGED_FLAG,
    STATE_BRIGHTNESS_MASK, STATE_BRIGHTNESS_SHIFT, STATE_DATA_CONNECTION_MASK,
    STATE_DATA_CONNECTION_SHIFT, STATE_PHONE_SIGNAL_STRENGTH_MASK,
    STATE_PHONE_SIGNAL_STRENGTH_SHIFT, STATE_PHONE_STATE_MASK, STATE_PHONE_STATE_SHIFT,
    STATE_WAKE_LOCK_FLAG,
};
use tracing::debug;

/// Supplies CPU accounting when the battery level steps down.
///
/// Consulted on the first recorded sample and whenever the battery level
/// drops below the level of the previous capture.
pub trait StepDetailsProvider: Send {
    /// Returns the details to attach, or `None` to attach nothing.
    fn step_details(&mut self) -> Option<StepDetails>;
}

impl<F> StepDetailsProvider for F
where
    F: FnMut() -> Option<StepDetails> + Send,
{
    fn step_details(&mut self) -> Option<StepDetails> {
        self()
    }
}

impl BatteryHistory {
    // -----------------------------------------------------------------------
    // pure setters
    // -----------------------------------------------------------------------

    /// Enables or disables recording of ordinary updates.
    ///
    /// Extension payloads and marker commands are written regardless.
    pub fn set_recording_enabled(&mut self, enabled: bool) {
        self.recording_enabled = enabled;
    }

    /// True while ordinary updates are recorded.
    pub fn is_recording_enabled(&self) -> bool {
        self.recording_enabled
    }

    /// Sets the battery snapshot carried by the next record.
    ///
    /// Until this (or [`record_battery_state`](Self::record_battery_state))
    /// has been called, ordinary updates are dropped.
    pub fn set_battery_state(&mut self, charging: bool, status: u8, level: u8, charge_uah: i32) {
        self.have_battery_level = true;
        self.set_charging_state(charging);
        self.cur.battery_status = status;
        self.cur.battery_level = level;
        self.cur.battery_charge_uah = charge_uah;
    }

    /// Sets or clears the plugged-in state bit.
    pub fn set_plugged_in_state(&mut self, plugged_in: bool) {
        if plugged_in {
            self.cur.states |= STATE_BATTERY_PLUGGED_FLAG;
        } else {
            self.cur.states &= !STATE_BATTERY_PLUGGED_FLAG;
        }
    }

    /// Sets or clears the charging state bit.
    pub fn set_charging_state(&mut self, charging: bool) {
        if charging {
            self.cur.states2 |= STATE2_CHARGING_FLAG;
        } else {
            self.cur.states2 &= !STATE2_CHARGING_FLAG;
        }
    }

    /// Sets the battery status.
    pub fn set_battery_status(&mut self, status: u8) {
        self.cur.battery_status = status;
    }

    /// Sets the battery health.
    pub fn set_battery_health(&mut self, health: u8) {
        self.cur.battery_health = health;
    }

    /// Sets the raw plug bitmask (`BATTERY_PLUGGED_*`).
    pub fn set_battery_plug_type(&mut self, plug_type: u8) {
        self.cur.battery_plug_type = plug_type;
    }

    // -----------------------------------------------------------------------
    // battery
    // -----------------------------------------------------------------------

    /// Records a battery reading.
    pub fn record_battery_state(
        &mut self,
        elapsed_ms: i64,
        uptime_ms: i64,
        level: u8,
        temperature: i16,
        voltage: u16,
        charge_uah: i32,
    ) -> Result<()> {
        self.have_battery_level = true;
        self.cur.battery_level = level;
        self.cur.battery_temperature = temperature;
        self.cur.battery_voltage = voltage;
        self.cur.battery_charge_uah = charge_uah;
        self.flush(elapsed_ms, uptime_ms)
    }

    /// Adds wifi rail charge to the running total and records it.
    pub fn record_wifi_consumed_charge(
        &mut self,
        elapsed_ms: i64,
        uptime_ms: i64,
        charge_mah: f64,
    ) -> Result<()> {
        self.cur.wifi_rail_charge_mah += charge_mah;
        self.flush(elapsed_ms, uptime_ms)
    }

    /// Adds modem rail charge to the running total and records it.
    pub fn record_modem_consumed_charge(
        &mut self,
        elapsed_ms: i64,
        uptime_ms: i64,
        charge_mah: f64,
    ) -> Result<()> {
        self.cur.modem_rail_charge_mah += charge_mah;
        self.flush(elapsed_ms, uptime_ms)
    }

    // -----------------------------------------------------------------------
    // events and wakelocks
    // -----------------------------------------------------------------------

    /// Records a named event (`EVENT_*` code with start/finish flags).
    pub fn record_event(
        &mut self,
        elapsed_ms: i64,
        uptime_ms: i64,
        code: u16,
        name: &str,
        uid: i32,
    ) -> Result<()> {
        self.cur.set_event(code, HistoryTag::new(name, uid));
        self.flush(elapsed_ms, uptime_ms)
    }

    /// Records a wakelock acquisition and sets the wakelock state bit.
    pub fn record_wakelock_start_event(
        &mut self,
        elapsed_ms: i64,
        uptime_ms: i64,
        tag: Option<HistoryTag>,
    ) -> Result<()> {
        self.cur.wakelock_tag = tag;
        self.record_state_start_event(elapsed_ms, uptime_ms, STATE_WAKE_LOCK_FLAG)
    }

    /// Records the release of the last wakelock and clears the wakelock state bit.
    pub fn record_wakelock_stop_event(
        &mut self,
        elapsed_ms: i64,
        uptime_ms: i64,
        tag: Option<HistoryTag>,
    ) -> Result<()> {
        self.cur.wakelock_tag = tag;
        self.record_state_stop_event(elapsed_ms, uptime_ms, STATE_WAKE_LOCK_FLAG)
    }

    /// Replaces the wakelock tag of the last written record.
    ///
    /// Returns `Ok(false)` without writing if the last record is not an
    /// `Update`. If it carries a wakelock tag, that tag is dropped from the
    /// merge bookkeeping and a record with the new tag is written, which
    /// merges into the last one when the usual merge rules allow.
    pub fn maybe_update_wakelock_tag(
        &mut self,
        elapsed_ms: i64,
        uptime_ms: i64,
        tag: HistoryTag,
    ) -> Result<bool> {
        let Some(last) = self.last_written.as_mut() else {
            return Ok(false);
        };
        if last.item.cmd != HistoryCmd::Update {
            return Ok(false);
        }
        if last.item.wakelock_tag.take().is_some() {
            debug!("Retagging last battery history wakelock as {:?}", tag.string());
            self.cur.wakelock_tag = Some(tag);
            self.flush(elapsed_ms, uptime_ms)?;
        }
        Ok(true)
    }

    /// Records why the application processor woke up.
    pub fn record_wakeup_event(
        &mut self,
        elapsed_ms: i64,
        uptime_ms: i64,
        reason: &str,
    ) -> Result<()> {
        self.cur.wake_reason_tag = Some(HistoryTag::new(reason, 0));
        self.flush(elapsed_ms, uptime_ms)
    }

    // -----------------------------------------------------------------------
    // state bits
    // -----------------------------------------------------------------------

    /// Sets `flags` in the primary state word and records the change.
    pub fn record_state_start_event(
        &mut self,
        elapsed_ms: i64,
        uptime_ms: i64,
        flags: u32,
    ) -> Result<()> {
        self.cur.states |= flags;
        self.flush(elapsed_ms, uptime_ms)
    }

    /// Clears `flags` in the primary state word and records the change.
    pub fn record_state_stop_event(
        &mut self,
        elapsed_ms: i64,
        uptime_ms: i64,
        flags: u32,
    ) -> Result<()> {
        self.cur.states &= !flags;
        self.flush(elapsed_ms, uptime_ms)
    }

    /// Sets `add` and clears `remove` in the primary state word in one record.
    pub fn record_state_change_event(
        &mut self,
        elapsed_ms: i64,
        uptime_ms: i64,
        add: u32,
        remove: u32,
    ) -> Result<()> {
        self.cur.states = (self.cur.states | add) & !remove;
        self.flush(elapsed_ms, uptime_ms)
    }

    /// Sets `flags` in the secondary state word and records the change.
    pub fn record_state2_start_event(
        &mut self,
        elapsed_ms: i64,
        uptime_ms: i64,
        flags: u32,
    ) -> Result<()> {
        self.cur.states2 |= flags;
        self.flush(elapsed_ms, uptime_ms)
    }

    /// Clears `flags` in the secondary state word and records the change.
    pub fn record_state2_stop_event(
        &mut self,
        elapsed_ms: i64,
        uptime_ms: i64,
        flags: u32,
    ) -> Result<()> {
        self.cur.states2 &= !flags;
        self.flush(elapsed_ms, uptime_ms)
    }

    // -----------------------------------------------------------------------
    // packed fields
    // -----------------------------------------------------------------------

    /// Records a screen brightness bin (0..=4).
    pub fn record_screen_brightness_event(
        &mut self,
        elapsed_ms: i64,
        uptime_ms: i64,
        bin: u32,
    ) -> Result<()> {
        self.cur.states = set_bit_field(
            self.cur.states,
            bin,
            STATE_BRIGHTNESS_SHIFT,
            STATE_BRIGHTNESS_MASK,
        );
        self.flush(elapsed_ms, uptime_ms)
    }

    /// Records a GPS signal quality level.
    pub fn record_gps_signal_quality_event(
        &mut self,
        elapsed_ms: i64,
        uptime_ms: i64,
        quality: u32,
    ) -> Result<()> {
        self.cur.states2 = set_bit_field(
            self.cur.states2,
            quality,
            STATE2_GPS_SIGNAL_QUALITY_SHIFT,
            STATE2_GPS_SIGNAL_QUALITY_MASK,
        );
        self.flush(elapsed_ms, uptime_ms)
    }

    /// Records a device idle (doze) mode.
    pub fn record_device_idle_event(
        &mut self,
        elapsed_ms: i64,
        uptime_ms: i64,
        mode: u32,
    ) -> Result<()> {
        self.cur.states2 = set_bit_field(
            self.cur.states2,
            mode,
            STATE2_DEVICE_IDLE_SHIFT,
            STATE2_DEVICE_IDLE_MASK,
        );
        self.flush(elapsed_ms, uptime_ms)
    }

    /// Records a phone radio change.
    ///
    /// `state` and `signal_strength` are left unchanged when `None`.
    pub fn record_phone_state_change_event(
        &mut self,
        elapsed_ms: i64,
        uptime_ms: i64,
        add: u32,
        remove: u32,
        state: Option<u32>,
        signal_strength: Option<u32>,
    ) -> Result<()> {
        let mut states = (self.cur.states | add) & !remove;
        if let Some(state) = state {
            states = set_bit_field(states, state, STATE_PHONE_STATE_SHIFT, STATE_PHONE_STATE_MASK);
        }
        if let Some(strength) = signal_strength {
            states = set_bit_field(
                states,
                strength,
                STATE_PHONE_SIGNAL_STRENGTH_SHIFT,
                STATE_PHONE_SIGNAL_STRENGTH_MASK,
            );
        }
        self.cur.states = states;
        self.flush(elapsed_ms, uptime_ms)
    }

    /// Records the mobile data connection type.
    pub fn record_data_connection_type_change_event(
        &mut self,
        elapsed_ms: i64,
        uptime_ms: i64,
        connection_type: u32,
    ) -> Result<()> {
        self.cur.states = set_bit_field(
            self.cur.states,
            connection_type,
            STATE_DATA_CONNECTION_SHIFT,
            STATE_DATA_CONNECTION_MASK,
        );
        self.flush(elapsed_ms, uptime_ms)
    }

    /// Records the 5G NR state.
    pub fn record_nr_state_change_event(
        &mut self,
        elapsed_ms: i64,
        uptime_ms: i64,
        nr_state: u32,
    ) -> Result<()> {
        self.cur.states2 = set_bit_field(
            self.cur.states2,
            nr_state,
            STATE2_NR_STATE_SHIFT,
            STATE2_NR_STATE_MASK,
        );
        self.flush(elapsed_ms, uptime_ms)
    }

    /// Records the wifi supplicant state.
    pub fn record_wifi_supplicant_state_change_event(
        &mut self,
        elapsed_ms: i64,
        uptime_ms: i64,
        supplicant_state: u32,
    ) -> Result<()> {
        self.cur.states2 = set_bit_field(
            self.cur.states2,
            supplicant_state,
            STATE2_WIFI_SUPPL_STATE_SHIFT,
            STATE2_WIFI_SUPPL_STATE_MASK,
        );
        self.flush(elapsed_ms, uptime_ms)
    }

    /// Records the wifi signal strength bin.
    pub fn record_wifi_signal_strength_change_event(
        &mut self,
        elapsed_ms: i64,
        uptime_ms: i64,
        strength_bin: u32,
    ) -> Result<()> {
        self.cur.states2 = set_bit_field(
            self.cur.states2,
            strength_bin,
            STATE2_WIFI_SIGNAL_STRENGTH_SHIFT,
            STATE2_WIFI_SIGNAL_STRENGTH_MASK,
        );
        self.flush(elapsed_ms, uptime_ms)
    }

    // -----------------------------------------------------------------------
    // extension payloads
    // -----------------------------------------------------------------------

    /// Records a power stats snapshot. Written even while recording is disabled.
    pub fn record_power_stats(
        &mut self,
        elapsed_ms: i64,
        uptime_ms: i64,
        stats: PowerStats,
    ) -> Result<()> {
        self.cur.power_stats = Some(stats);
        self.flush(elapsed_ms, uptime_ms)
    }

    /// Records a process state change. Written even while recording is disabled.
    pub fn record_process_state_change(
        &mut self,
        elapsed_ms: i64,
        uptime_ms: i64,
        uid: i32,
        process_state: i32,
    ) -> Result<()> {
        self.cur.process_state_change = Some(ProcessStateChange { uid, process_state });
        self.flush(elapsed_ms, uptime_ms)
    }

    // -----------------------------------------------------------------------
    // markers
    // -----------------------------------------------------------------------

    /// Records a wall-clock change.
    pub fn record_current_time_change(
        &mut self,
        elapsed_ms: i64,
        uptime_ms: i64,
        current_time_ms: i64,
    ) -> Result<()> {
        self.write_command(HistoryCmd::CurrentTime, elapsed_ms, uptime_ms, current_time_ms)
    }

    /// Records that the device is shutting down.
    pub fn record_shutdown_event(
        &mut self,
        elapsed_ms: i64,
        uptime_ms: i64,
        current_time_ms: i64,
    ) -> Result<()> {
        self.write_command(HistoryCmd::Shutdown, elapsed_ms, uptime_ms, current_time_ms)
    }

    /// Enables recording and writes a wall-clock anchor.
    ///
    /// With `reset` the anchor is a `Reset` record, otherwise `CurrentTime`.
    pub fn start_recording_history(
        &mut self,
        elapsed_ms: i64,
        uptime_ms: i64,
        reset: bool,
    ) -> Result<()> {
        self.recording_enabled = true;
        let cmd = if reset {
            HistoryCmd::Reset
        } else {
            HistoryCmd::CurrentTime
        };
        let now = self.clock.current_time_ms();
        self.write_command(cmd, elapsed_ms, uptime_ms, now)
    }
}
