use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One replicated log slot. `command` is opaque to the engine; the state
/// machine above decides what it means.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub term: u64,
    pub index: u64,
    pub command: Bytes,
}

/// The log vector. Slot 0 is a virtual sentinel carrying the term and index
/// of the last snapshotted entry (`(0, 0)` before any snapshot); real entries
/// follow at consecutive absolute indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    entries: Vec<Entry>,
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

impl Log {
    pub fn new() -> Self {
        Self {
            entries: vec![Entry {
                term: 0,
                index: 0,
                command: Bytes::new(),
            }],
        }
    }

    /// Restores a log from persisted entries; an empty vector yields a fresh
    /// log.
    pub fn from_entries(entries: Vec<Entry>) -> Self {
        if entries.is_empty() {
            Self::new()
        } else {
            Self { entries }
        }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Index of the sentinel: everything at or below it lives in the
    /// snapshot. Never decreases.
    pub fn first_index(&self) -> u64 {
        self.entries[0].index
    }

    pub fn first_term(&self) -> u64 {
        self.entries[0].term
    }

    pub fn last(&self) -> &Entry {
        self.entries.last().expect("log always holds its sentinel")
    }

    fn pos(&self, index: u64) -> usize {
        (index - self.first_index()) as usize
    }

    /// Term of the entry at an absolute index. The caller must keep `index`
    /// within `[first_index, last().index]`; anything else is an invariant
    /// violation and fatal to this peer.
    pub fn term_at(&self, index: u64) -> u64 {
        self.entries[self.pos(index)].term
    }

    pub fn get(&self, index: u64) -> Option<&Entry> {
        if index < self.first_index() || index > self.last().index {
            return None;
        }
        Some(&self.entries[self.pos(index)])
    }

    pub fn append(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    /// Drops every entry with absolute index `>= index`. Used when a
    /// follower discovers a term conflict.
    pub fn truncate_from(&mut self, index: u64) {
        let pos = self.pos(index);
        self.entries.truncate(pos);
    }

    /// Clones the suffix starting at absolute index `from`.
    pub fn suffix(&self, from: u64) -> Vec<Entry> {
        self.entries[self.pos(from)..].to_vec()
    }

    /// Clones the inclusive range `[lo, hi]`.
    pub fn range(&self, lo: u64, hi: u64) -> Vec<Entry> {
        self.entries[self.pos(lo)..=self.pos(hi)].to_vec()
    }

    /// Truncates the prefix through `index`: the entry there becomes the new
    /// sentinel with its command cleared. The caller guarantees
    /// `first_index < index <= last().index`.
    pub fn compact_prefix(&mut self, index: u64) {
        let pos = self.pos(index);
        self.entries.drain(..pos);
        self.entries[0].command = Bytes::new();
    }

    /// Rebuilds the log around an installed snapshot boundary, keeping any
    /// entries strictly after it.
    pub fn reset_to_snapshot(&mut self, index: u64, term: u64) {
        if self.last().index <= index {
            self.entries.clear();
        } else {
            let pos = self.pos(index);
            self.entries.drain(..pos);
        }
        let sentinel = Entry {
            term,
            index,
            command: Bytes::new(),
        };
        if self.entries.is_empty() {
            self.entries.push(sentinel);
        } else {
            self.entries[0] = sentinel;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: u64, index: u64) -> Entry {
        Entry {
            term,
            index,
            command: Bytes::from(format!("cmd-{index}")),
        }
    }

    fn sample() -> Log {
        let mut log = Log::new();
        for i in 1..=6 {
            let term = if i <= 3 { 1 } else { 2 };
            log.append(entry(term, i));
        }
        log
    }

    #[test]
    fn fresh_log_has_zero_sentinel() {
        let log = Log::new();
        assert_eq!(log.first_index(), 0);
        assert_eq!(log.first_term(), 0);
        assert_eq!(log.last().index, 0);
    }

    #[test]
    fn absolute_indexing_survives_compaction() {
        let mut log = sample();
        assert_eq!(log.term_at(4), 2);

        log.compact_prefix(3);
        assert_eq!(log.first_index(), 3);
        assert_eq!(log.first_term(), 1);
        assert!(log.entries[0].command.is_empty());
        assert_eq!(log.term_at(4), 2);
        assert_eq!(log.last().index, 6);
        assert!(log.get(2).is_none());
        assert!(log.get(7).is_none());
    }

    #[test]
    fn truncate_from_drops_the_conflicting_suffix() {
        let mut log = sample();
        log.truncate_from(4);
        assert_eq!(log.last().index, 3);
        log.append(entry(3, 4));
        assert_eq!(log.term_at(4), 3);
    }

    #[test]
    fn suffix_and_range_use_absolute_indices() {
        let mut log = sample();
        log.compact_prefix(2);
        let tail = log.suffix(5);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].index, 5);

        let mid = log.range(3, 4);
        assert_eq!(mid.first().map(|e| e.index), Some(3));
        assert_eq!(mid.last().map(|e| e.index), Some(4));
    }

    #[test]
    fn reset_keeps_entries_after_the_boundary() {
        let mut log = sample();
        log.reset_to_snapshot(4, 2);
        assert_eq!(log.first_index(), 4);
        assert_eq!(log.last().index, 6);
        assert_eq!(log.term_at(5), 2);

        let mut log = sample();
        log.reset_to_snapshot(9, 3);
        assert_eq!(log.first_index(), 9);
        assert_eq!(log.last().index, 9);
    }
}
