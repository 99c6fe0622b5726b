//! Optional forwarding of state changes to an external tracer.

use crate::item::{
    BitDescription, HistoryItem, EVENT_FLAG_FINISH, EVENT_FLAG_START, EVENT_NAMES,
    EVENT_TYPE_MASK, STATE2_DESCRIPTIONS, STATE_DESCRIPTIONS,
};
use tracing::trace;

/// Prefix of every counter and track name.
pub const TRACE_PREFIX: &str = "battery_stats.";

/// Receives state-bit counters and named events as records are written.
///
/// Calls are best-effort and must not block; a tracer that is not enabled
/// is skipped entirely.
pub trait HistoryTracer: Send + Sync {
    /// Returns true if the tracer wants data.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Reports the new value of a named counter.
    fn trace_counter(&self, name: &str, value: i64);

    /// Reports an instant event on a named track.
    fn trace_instant_event(&self, track: &str, name: &str);
}

/// Tracer that emits `tracing` events under the `battery_stats` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTracer;

impl HistoryTracer for LogTracer {
    fn trace_counter(&self, name: &str, value: i64) {
        trace!(target: "battery_stats", counter = name, value, "counter");
    }

    fn trace_instant_event(&self, track: &str, name: &str) {
        trace!(target: "battery_stats", track, event = name, "instant");
    }
}

/// Forwards every named state bit that differs between `prev` and `cur`,
/// and `cur`'s event if it has one.
pub fn trace_changes(tracer: &dyn HistoryTracer, prev: &HistoryItem, cur: &HistoryItem) {
    if !tracer.is_enabled() {
        return;
    }
    trace_words(tracer, STATE_DESCRIPTIONS, prev.states, cur.states);
    trace_words(tracer, STATE2_DESCRIPTIONS, prev.states2, cur.states2);

    if cur.has_event() {
        let kind = usize::from(cur.event_code & EVENT_TYPE_MASK);
        let Some(name) = EVENT_NAMES.get(kind) else {
            return;
        };
        let prefix = if cur.event_code & EVENT_FLAG_START != 0 {
            "+"
        } else if cur.event_code & EVENT_FLAG_FINISH != 0 {
            "-"
        } else {
            ""
        };
        let (uid, tag) = cur
            .event_tag
            .as_ref()
            .map(|tag| (tag.uid(), tag.string()))
            .unwrap_or((0, ""));
        let track = format!("{}{}", TRACE_PREFIX, name);
        tracer.trace_instant_event(&track, &format!("{}{}={}:\"{}\"", prefix, name, uid, tag));
    }
}

fn trace_words(tracer: &dyn HistoryTracer, descriptions: &[BitDescription], prev: u32, cur: u32) {
    let changed = prev ^ cur;
    if changed == 0 {
        return;
    }
    for description in descriptions {
        if changed & description.mask != 0 {
            let name = format!("{}{}", TRACE_PREFIX, description.name);
            tracer.trace_counter(&name, i64::from(description.value_of(cur)));
        }
    }
}
