//! Bit layout of the `states` and `states2` words and the event code space.

use tracing::warn;

// ---------------------------------------------------------------------------
// states
// ---------------------------------------------------------------------------

/// Screen brightness bin (0..=4).
pub const STATE_BRIGHTNESS_SHIFT: u32 = 0;
/// Mask of the brightness bin.
pub const STATE_BRIGHTNESS_MASK: u32 = 0x7;
/// Phone signal strength bin.
pub const STATE_PHONE_SIGNAL_STRENGTH_SHIFT: u32 = 3;
/// Mask of the phone signal strength bin.
pub const STATE_PHONE_SIGNAL_STRENGTH_MASK: u32 = 0x7 << STATE_PHONE_SIGNAL_STRENGTH_SHIFT;
/// Phone service state (in service, out of service, emergency only, off).
pub const STATE_PHONE_STATE_SHIFT: u32 = 6;
/// Mask of the phone service state.
pub const STATE_PHONE_STATE_MASK: u32 = 0x7 << STATE_PHONE_STATE_SHIFT;
/// Mobile data connection type.
pub const STATE_DATA_CONNECTION_SHIFT: u32 = 9;
/// Mask of the data connection type.
pub const STATE_DATA_CONNECTION_MASK: u32 = 0x1f << STATE_DATA_CONNECTION_SHIFT;

/// Wifi multicast lock held.
pub const STATE_WIFI_MULTICAST_ON_FLAG: u32 = 1 << 16;
/// Screen in doze mode.
pub const STATE_SCREEN_DOZE_FLAG: u32 = 1 << 18;
/// Device plugged into a power source.
pub const STATE_BATTERY_PLUGGED_FLAG: u32 = 1 << 19;
/// Screen on.
pub const STATE_SCREEN_ON_FLAG: u32 = 1 << 20;
/// Phone scanning for a network.
pub const STATE_PHONE_SCANNING_FLAG: u32 = 1 << 21;
/// Audio playing.
pub const STATE_AUDIO_ON_FLAG: u32 = 1 << 22;
/// Some sensor active.
pub const STATE_SENSOR_ON_FLAG: u32 = 1 << 23;
/// Reserved; never persisted by delta records.
pub const STATE_RESERVED_FLAG: u32 = 1 << 24;
/// Mobile radio active.
pub const STATE_MOBILE_RADIO_ACTIVE_FLAG: u32 = 1 << 25;
/// Wifi radio active.
pub const STATE_WIFI_RADIO_ACTIVE_FLAG: u32 = 1 << 26;
/// Wifi scan running.
pub const STATE_WIFI_SCAN_FLAG: u32 = 1 << 27;
/// Wifi full lock held.
pub const STATE_WIFI_FULL_LOCK_FLAG: u32 = 1 << 28;
/// GPS on.
pub const STATE_GPS_ON_FLAG: u32 = 1 << 29;
/// At least one wakelock held.
pub const STATE_WAKE_LOCK_FLAG: u32 = 1 << 30;
/// CPU running.
pub const STATE_CPU_RUNNING_FLAG: u32 = 1 << 31;

/// The frequently changing high bits copied verbatim into every delta token.
pub const STATE_HIGH_MASK: u32 = 0xfe00_0000;

/// The top byte of `states`; shared between the high bits and the reserved bit.
pub const STATE_BATTERY_MASK: u32 = 0xff00_0000;

// ---------------------------------------------------------------------------
// states2
// ---------------------------------------------------------------------------

/// Wifi supplicant state.
pub const STATE2_WIFI_SUPPL_STATE_SHIFT: u32 = 0;
/// Mask of the wifi supplicant state.
pub const STATE2_WIFI_SUPPL_STATE_MASK: u32 = 0xf;
/// Wifi signal strength bin.
pub const STATE2_WIFI_SIGNAL_STRENGTH_SHIFT: u32 = 4;
/// Mask of the wifi signal strength bin.
pub const STATE2_WIFI_SIGNAL_STRENGTH_MASK: u32 = 0x7 << STATE2_WIFI_SIGNAL_STRENGTH_SHIFT;
/// GPS signal quality level.
pub const STATE2_GPS_SIGNAL_QUALITY_SHIFT: u32 = 7;
/// Mask of the GPS signal quality level.
pub const STATE2_GPS_SIGNAL_QUALITY_MASK: u32 = 0x3 << STATE2_GPS_SIGNAL_QUALITY_SHIFT;
/// 5G NR state.
pub const STATE2_NR_STATE_SHIFT: u32 = 9;
/// Mask of the NR state.
pub const STATE2_NR_STATE_MASK: u32 = 0x3 << STATE2_NR_STATE_SHIFT;

/// Record carries an extension payload (power stats and/or process state change).
pub const STATE2_EXTENSIONS_FLAG: u32 = 1 << 17;
/// USB data link active.
pub const STATE2_USB_DATA_LINK_FLAG: u32 = 1 << 18;
/// Cellular transmitting at high power.
pub const STATE2_CELLULAR_HIGH_TX_POWER_FLAG: u32 = 1 << 19;
/// Bluetooth scan running.
pub const STATE2_BLUETOOTH_SCAN_FLAG: u32 = 1 << 20;
/// Camera on.
pub const STATE2_CAMERA_FLAG: u32 = 1 << 21;
/// Bluetooth on.
pub const STATE2_BLUETOOTH_ON_FLAG: u32 = 1 << 22;
/// Phone call in progress.
pub const STATE2_PHONE_IN_CALL_FLAG: u32 = 1 << 23;
/// Battery charging.
pub const STATE2_CHARGING_FLAG: u32 = 1 << 24;
/// Device idle level (off, light, deep).
pub const STATE2_DEVICE_IDLE_SHIFT: u32 = 25;
/// Mask of the device idle level.
pub const STATE2_DEVICE_IDLE_MASK: u32 = 0x3 << STATE2_DEVICE_IDLE_SHIFT;
/// Flashlight on.
pub const STATE2_FLASHLIGHT_FLAG: u32 = 1 << 27;
/// Wifi on.
pub const STATE2_WIFI_ON_FLAG: u32 = 1 << 28;
/// Wifi running.
pub const STATE2_WIFI_RUNNING_FLAG: u32 = 1 << 29;
/// Video playing.
pub const STATE2_VIDEO_ON_FLAG: u32 = 1 << 30;
/// Battery saver on.
pub const STATE2_POWER_SAVE_FLAG: u32 = 1 << 31;

// ---------------------------------------------------------------------------
// events
// ---------------------------------------------------------------------------

/// No event in this record.
pub const EVENT_NONE: u16 = 0x0000;
/// Process running.
pub const EVENT_PROC: u16 = 0x0001;
/// Process in foreground.
pub const EVENT_FOREGROUND: u16 = 0x0002;
/// Process is the top app.
pub const EVENT_TOP: u16 = 0x0003;
/// Sync running.
pub const EVENT_SYNC: u16 = 0x0004;
/// Wakelock held, tagged with the first acquirer.
pub const EVENT_WAKE_LOCK: u16 = 0x0005;
/// Job running.
pub const EVENT_JOB: u16 = 0x0006;
/// User running.
pub const EVENT_USER_RUNNING: u16 = 0x0007;
/// User in foreground.
pub const EVENT_USER_FOREGROUND: u16 = 0x0008;
/// Connectivity changed.
pub const EVENT_CONNECTIVITY_CHANGED: u16 = 0x0009;
/// App became active.
pub const EVENT_ACTIVE: u16 = 0x000a;
/// Package installed.
pub const EVENT_PACKAGE_INSTALLED: u16 = 0x000b;
/// Package uninstalled.
pub const EVENT_PACKAGE_UNINSTALLED: u16 = 0x000c;
/// Alarm fired.
pub const EVENT_ALARM: u16 = 0x000d;
/// Stats collection.
pub const EVENT_COLLECT_EXTERNAL_STATS: u16 = 0x000e;
/// Package became inactive.
pub const EVENT_PACKAGE_INACTIVE: u16 = 0x000f;
/// Package became active.
pub const EVENT_PACKAGE_ACTIVE: u16 = 0x0010;
/// Temporary allowlist entry.
pub const EVENT_TEMP_WHITELIST: u16 = 0x0011;
/// Screen woken by an app.
pub const EVENT_SCREEN_WAKE_UP: u16 = 0x0012;
/// Application processor woken.
pub const EVENT_WAKEUP_AP: u16 = 0x0013;
/// Long-held wakelock.
pub const EVENT_LONG_WAKE_LOCK: u16 = 0x0014;
/// Number of known event types.
pub const EVENT_COUNT: u16 = 0x0015;

/// Event start marker bit.
pub const EVENT_FLAG_START: u16 = 0x8000;
/// Event finish marker bit.
pub const EVENT_FLAG_FINISH: u16 = 0x4000;
/// Mask extracting the event type from an event code.
pub const EVENT_TYPE_MASK: u16 = !(EVENT_FLAG_START | EVENT_FLAG_FINISH);

/// Short names of the event types, indexed by event type.
pub const EVENT_NAMES: [&str; EVENT_COUNT as usize] = [
    "null",
    "proc",
    "fg",
    "top",
    "sync",
    "wake_lock_in",
    "job",
    "user",
    "userfg",
    "conn",
    "active",
    "pkginst",
    "pkgunin",
    "alarm",
    "stats",
    "pkginactive",
    "pkgactive",
    "tmpwhitelist",
    "screenwake",
    "wakeupap",
    "longwake",
];

// ---------------------------------------------------------------------------
// battery plug types (raw bitmask as reported by the battery service)
// ---------------------------------------------------------------------------

/// Plugged into an AC charger.
pub const BATTERY_PLUGGED_AC: u8 = 1;
/// Plugged into USB.
pub const BATTERY_PLUGGED_USB: u8 = 2;
/// On a wireless charger.
pub const BATTERY_PLUGGED_WIRELESS: u8 = 4;
/// Docked.
pub const BATTERY_PLUGGED_DOCK: u8 = 8;

/// Names one flag or multi-bit field of a state word for trace output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitDescription {
    /// Bits covered by this entry.
    pub mask: u32,
    /// Shift of a multi-bit field, `None` for a single flag.
    pub shift: Option<u32>,
    /// Counter name.
    pub name: &'static str,
}

impl BitDescription {
    const fn flag(mask: u32, name: &'static str) -> Self {
        Self {
            mask,
            shift: None,
            name,
        }
    }

    const fn field(mask: u32, shift: u32, name: &'static str) -> Self {
        Self {
            mask,
            shift: Some(shift),
            name,
        }
    }

    /// Value of this entry within `word`: 0/1 for flags, the field value otherwise.
    pub fn value_of(&self, word: u32) -> u32 {
        match self.shift {
            None => u32::from(word & self.mask != 0),
            Some(shift) => (word & self.mask) >> shift,
        }
    }
}

/// Descriptions of every named part of `states`.
pub const STATE_DESCRIPTIONS: &[BitDescription] = &[
    BitDescription::flag(STATE_CPU_RUNNING_FLAG, "running"),
    BitDescription::flag(STATE_WAKE_LOCK_FLAG, "wake_lock"),
    BitDescription::flag(STATE_GPS_ON_FLAG, "gps"),
    BitDescription::flag(STATE_WIFI_FULL_LOCK_FLAG, "wifi_full_lock"),
    BitDescription::flag(STATE_WIFI_SCAN_FLAG, "wifi_scan"),
    BitDescription::flag(STATE_WIFI_RADIO_ACTIVE_FLAG, "wifi_radio"),
    BitDescription::flag(STATE_MOBILE_RADIO_ACTIVE_FLAG, "mobile_radio"),
    BitDescription::flag(STATE_SENSOR_ON_FLAG, "sensor"),
    BitDescription::flag(STATE_AUDIO_ON_FLAG, "audio"),
    BitDescription::flag(STATE_PHONE_SCANNING_FLAG, "phone_scanning"),
    BitDescription::flag(STATE_SCREEN_ON_FLAG, "screen"),
    BitDescription::flag(STATE_BATTERY_PLUGGED_FLAG, "plugged"),
    BitDescription::flag(STATE_SCREEN_DOZE_FLAG, "screen_doze"),
    BitDescription::flag(STATE_WIFI_MULTICAST_ON_FLAG, "wifi_multicast"),
    BitDescription::field(
        STATE_DATA_CONNECTION_MASK,
        STATE_DATA_CONNECTION_SHIFT,
        "data_conn",
    ),
    BitDescription::field(STATE_PHONE_STATE_MASK, STATE_PHONE_STATE_SHIFT, "phone_state"),
    BitDescription::field(
        STATE_PHONE_SIGNAL_STRENGTH_MASK,
        STATE_PHONE_SIGNAL_STRENGTH_SHIFT,
        "phone_signal_strength",
    ),
    BitDescription::field(STATE_BRIGHTNESS_MASK, STATE_BRIGHTNESS_SHIFT, "brightness"),
];

/// Descriptions of every named part of `states2`.
pub const STATE2_DESCRIPTIONS: &[BitDescription] = &[
    BitDescription::flag(STATE2_POWER_SAVE_FLAG, "power_save"),
    BitDescription::flag(STATE2_VIDEO_ON_FLAG, "video"),
    BitDescription::flag(STATE2_WIFI_RUNNING_FLAG, "wifi_running"),
    BitDescription::flag(STATE2_WIFI_ON_FLAG, "wifi"),
    BitDescription::flag(STATE2_FLASHLIGHT_FLAG, "flashlight"),
    BitDescription::field(STATE2_DEVICE_IDLE_MASK, STATE2_DEVICE_IDLE_SHIFT, "device_idle"),
    BitDescription::flag(STATE2_CHARGING_FLAG, "charging"),
    BitDescription::flag(STATE2_PHONE_IN_CALL_FLAG, "phone_in_call"),
    BitDescription::flag(STATE2_BLUETOOTH_ON_FLAG, "bluetooth"),
    BitDescription::flag(STATE2_CAMERA_FLAG, "camera"),
    BitDescription::flag(STATE2_BLUETOOTH_SCAN_FLAG, "bluetooth_scan"),
    BitDescription::flag(STATE2_CELLULAR_HIGH_TX_POWER_FLAG, "cellular_high_tx_power"),
    BitDescription::flag(STATE2_USB_DATA_LINK_FLAG, "usb_data"),
    BitDescription::field(STATE2_NR_STATE_MASK, STATE2_NR_STATE_SHIFT, "nr_state"),
    BitDescription::field(
        STATE2_GPS_SIGNAL_QUALITY_MASK,
        STATE2_GPS_SIGNAL_QUALITY_SHIFT,
        "gps_signal_quality",
    ),
    BitDescription::field(
        STATE2_WIFI_SIGNAL_STRENGTH_MASK,
        STATE2_WIFI_SIGNAL_STRENGTH_SHIFT,
        "wifi_signal_strength",
    ),
    BitDescription::field(
        STATE2_WIFI_SUPPL_STATE_MASK,
        STATE2_WIFI_SUPPL_STATE_SHIFT,
        "wifi_suppl",
    ),
];

/// Stores `value` into the field `mask` of `bits`.
///
/// A value wider than the field is masked to fit and reported; the write
/// still happens.
pub fn set_bit_field(bits: u32, value: u32, shift: u32, mask: u32) -> u32 {
    let mut shifted = value.checked_shl(shift).unwrap_or(0);
    if shifted & !mask != 0 || (shift > 0 && value >> (32 - shift) != 0) {
        warn!(
            "Value {:#x} does not fit in the bit field {:#x}; masking",
            value, mask
        );
        shifted &= mask;
    }
    (bits & !mask) | shifted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_bit_field_in_range() {
        let bits = set_bit_field(0xffff_0000, 3, STATE_BRIGHTNESS_SHIFT, STATE_BRIGHTNESS_MASK);
        assert_eq!(bits, 0xffff_0003);
        let bits = set_bit_field(bits, 2, STATE_PHONE_STATE_SHIFT, STATE_PHONE_STATE_MASK);
        assert_eq!((bits & STATE_PHONE_STATE_MASK) >> STATE_PHONE_STATE_SHIFT, 2);
        assert_eq!(bits & STATE_BRIGHTNESS_MASK, 3);
    }

    #[test]
    fn test_set_bit_field_masks_overflow() {
        let bits = set_bit_field(0, 0xff, STATE2_DEVICE_IDLE_SHIFT, STATE2_DEVICE_IDLE_MASK);
        assert_eq!(bits, STATE2_DEVICE_IDLE_MASK);
    }

    #[test]
    fn test_high_mask_covers_frequent_flags() {
        for flag in [
            STATE_CPU_RUNNING_FLAG,
            STATE_WAKE_LOCK_FLAG,
            STATE_GPS_ON_FLAG,
            STATE_WIFI_FULL_LOCK_FLAG,
            STATE_WIFI_SCAN_FLAG,
            STATE_WIFI_RADIO_ACTIVE_FLAG,
            STATE_MOBILE_RADIO_ACTIVE_FLAG,
        ] {
            assert_eq!(flag & STATE_HIGH_MASK, flag);
        }
        assert_eq!(STATE_RESERVED_FLAG & STATE_HIGH_MASK, 0);
    }

    #[test]
    fn test_bit_description_values() {
        let desc = BitDescription::field(STATE2_NR_STATE_MASK, STATE2_NR_STATE_SHIFT, "nr");
        assert_eq!(desc.value_of(2 << STATE2_NR_STATE_SHIFT), 2);
        let flag = BitDescription::flag(STATE2_CAMERA_FLAG, "camera");
        assert_eq!(flag.value_of(STATE2_CAMERA_FLAG | 1), 1);
        assert_eq!(flag.value_of(0), 0);
    }

    #[test]
    fn test_event_type_mask() {
        let code = EVENT_JOB | EVENT_FLAG_START;
        assert_eq!(code & EVENT_TYPE_MASK, EVENT_JOB);
        assert_eq!(EVENT_NAMES[(code & EVENT_TYPE_MASK) as usize], "job");
    }
}
