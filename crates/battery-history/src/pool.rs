//! Tag interning shared by every segment of a log.
//!
//! Indices are stable for the life of the log (until `reset`), but each
//! segment must be readable on its own, so the first reference to a tag in a
//! segment carries the literal string. That "not yet seen in this segment"
//! state is kept as [`TAG_FIRST_OCCURRENCE_FLAG`] on the stored index.

use crate::item::HistoryTag;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::warn;

/// Set on an index whose literal tag follows in the record.
pub const TAG_FIRST_OCCURRENCE_FLAG: u16 = 0x8000;

/// Number of indices the pool hands out before it overflows.
pub const HISTORY_TAG_INDEX_LIMIT: u16 = 0x7ffe;

/// Index returned once the pool is full; the literal is always embedded.
pub const TAG_OVERFLOW_INDEX: u16 = HISTORY_TAG_INDEX_LIMIT | TAG_FIRST_OCCURRENCE_FLAG;

/// Interning table mapping `(string, uid)` to a 15-bit index.
#[derive(Debug, Default)]
pub struct TagPool {
    entries: HashMap<HistoryTag, u16>,
    next_index: u16,
    chars: usize,
    reverse: OnceLock<HashMap<u16, HistoryTag>>,
}

impl TagPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the index to write for `tag`.
    ///
    /// The returned value carries [`TAG_FIRST_OCCURRENCE_FLAG`] when the
    /// caller must embed the literal tag; the flag is then cleared so later
    /// references in the same segment use the bare index.
    pub fn intern(&mut self, tag: &HistoryTag) -> u16 {
        if let Some(index) = self.entries.get_mut(tag) {
            let out = *index;
            *index &= !TAG_FIRST_OCCURRENCE_FLAG;
            return out;
        }

        if self.next_index >= HISTORY_TAG_INDEX_LIMIT {
            warn!(
                "Battery history tag pool overflow ({} entries); embedding {:?} literally",
                self.entries.len(),
                tag.string()
            );
            return TAG_OVERFLOW_INDEX;
        }

        let index = self.next_index;
        self.next_index += 1;
        self.chars += tag.string().chars().count();
        self.entries.insert(tag.clone(), index);
        self.reverse = OnceLock::new();
        index | TAG_FIRST_OCCURRENCE_FLAG
    }

    /// True if interning `tag` now would produce a first-occurrence index.
    pub fn peek_is_first_occurrence(&self, tag: &HistoryTag) -> bool {
        match self.entries.get(tag) {
            Some(index) => index & TAG_FIRST_OCCURRENCE_FLAG != 0,
            None => true,
        }
    }

    /// Flags every entry as unseen; called when a new segment starts.
    pub fn mark_all_unseen(&mut self) {
        for index in self.entries.values_mut() {
            *index |= TAG_FIRST_OCCURRENCE_FLAG;
        }
    }

    /// Re-registers a tag decoded from an existing segment at its index.
    ///
    /// The entry is stored as already seen: its literal is in the segment.
    pub fn restore(&mut self, index: u16, tag: HistoryTag) {
        let index = index & !TAG_FIRST_OCCURRENCE_FLAG;
        if index >= HISTORY_TAG_INDEX_LIMIT {
            return;
        }
        let tag = tag.with_pool_index(None);
        if self.entries.insert(tag.clone(), index).is_none() {
            self.chars += tag.string().chars().count();
        }
        self.next_index = self.next_index.max(index + 1);
        self.reverse = OnceLock::new();
    }

    /// Resolves an index back to its tag.
    ///
    /// The reverse map is built on first use and rebuilt after the pool changes.
    pub fn lookup(&self, index: u16) -> Option<HistoryTag> {
        let index = index & !TAG_FIRST_OCCURRENCE_FLAG;
        self.reverse
            .get_or_init(|| {
                self.entries
                    .iter()
                    .map(|(tag, idx)| {
                        let idx = idx & !TAG_FIRST_OCCURRENCE_FLAG;
                        (idx, tag.clone().with_pool_index(Some(idx)))
                    })
                    .collect()
            })
            .get(&index)
            .cloned()
    }

    /// Number of interned tags.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing has been interned.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total characters across interned tag strings.
    pub fn chars(&self) -> usize {
        self.chars
    }

    /// Drops every entry and restarts index allocation at zero.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.next_index = 0;
        self.chars = 0;
        self.reverse = OnceLock::new();
    }
}
