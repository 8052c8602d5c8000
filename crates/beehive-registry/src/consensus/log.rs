//! In-memory Raft log with a compacted prefix
//!
//! TigerStyle: `entries[i].index == snapshot_index + 1 + i` at all times.

use super::message::Entry;

/// Raft log suffix after the last snapshot
#[derive(Debug, Clone, Default)]
pub struct RaftLog {
    snapshot_index: u64,
    snapshot_term: u64,
    entries: Vec<Entry>,
}

impl RaftLog {
    /// An empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from persisted parts
    pub fn from_parts(snapshot_index: u64, snapshot_term: u64, entries: Vec<Entry>) -> Self {
        let mut log = Self {
            snapshot_index,
            snapshot_term,
            entries: Vec::with_capacity(entries.len()),
        };
        for entry in entries {
            if entry.index == log.last_index() + 1 {
                log.entries.push(entry);
            }
        }
        log
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> u64 {
        self.snapshot_term
    }

    /// Whether the log has ever held an entry
    pub fn is_empty(&self) -> bool {
        self.snapshot_index == 0 && self.entries.is_empty()
    }

    pub fn last_index(&self) -> u64 {
        self.snapshot_index + self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    /// Term of the entry at `index`; `None` if compacted away or not present
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.entry(index).map(|e| e.term)
    }

    pub fn entry(&self, index: u64) -> Option<&Entry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.entries.get((index - self.snapshot_index - 1) as usize)
    }

    /// Up to `count_max` entries starting at `from`
    pub fn entries_from(&self, from: u64, count_max: usize) -> Vec<Entry> {
        debug_assert!(from > self.snapshot_index);
        let start = (from.saturating_sub(self.snapshot_index + 1)) as usize;
        self.entries
            .iter()
            .skip(start)
            .take(count_max)
            .cloned()
            .collect()
    }

    /// All entries in the log suffix
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Append a leader-created entry
    pub fn append(&mut self, entry: Entry) {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        self.entries.push(entry);
    }

    /// Follower-side append after a consistency check
    ///
    /// Returns the index of the last entry known to match the leader, or
    /// `None` when the log has no entry matching `(prev_index, prev_term)`.
    /// Conflicting suffixes are truncated.
    pub fn try_append(&mut self, prev_index: u64, prev_term: u64, entries: Vec<Entry>) -> Option<u64> {
        let (prev_index, entries) = if prev_index < self.snapshot_index {
            let skip: Vec<Entry> = entries
                .into_iter()
                .filter(|e| e.index > self.snapshot_index)
                .collect();
            (self.snapshot_index, skip)
        } else {
            if self.term_at(prev_index) != Some(prev_term) {
                return None;
            }
            (prev_index, entries)
        };

        let mut last = prev_index;
        for entry in entries {
            let index = entry.index;
            if index != last + 1 {
                break;
            }
            match self.term_at(index) {
                Some(term) if term == entry.term => {}
                Some(_) => {
                    self.truncate_from(index);
                    self.entries.push(entry);
                }
                None => self.entries.push(entry),
            }
            last = index;
        }
        Some(last)
    }

    fn truncate_from(&mut self, index: u64) {
        debug_assert!(index > self.snapshot_index);
        let keep = (index - self.snapshot_index - 1) as usize;
        self.entries.truncate(keep);
    }

    /// Drop entries up to and including `index`
    pub fn compact(&mut self, index: u64) {
        if index <= self.snapshot_index {
            return;
        }
        let term = self.term_at(index).unwrap_or(self.snapshot_term);
        let drop = ((index - self.snapshot_index) as usize).min(self.entries.len());
        self.entries.drain(..drop);
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// Reset the log to start after an installed snapshot
    ///
    /// Entries past the snapshot are kept when the log agrees with it.
    pub fn restore(&mut self, index: u64, term: u64) {
        if self.term_at(index) == Some(term) {
            self.compact(index);
            return;
        }
        self.entries.clear();
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// Whether a candidate's log is at least as up to date as ours
    pub fn is_up_to_date(&self, last_index: u64, last_term: u64) -> bool {
        last_term > self.last_term() || (last_term == self.last_term() && last_index >= self.last_index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::message::EntryPayload;

    fn entry(index: u64, term: u64) -> Entry {
        Entry {
            index,
            term,
            payload: EntryPayload::Empty,
            tag: None,
        }
    }

    fn log_with(terms: &[u64]) -> RaftLog {
        let mut log = RaftLog::new();
        for (i, term) in terms.iter().enumerate() {
            log.append(entry(i as u64 + 1, *term));
        }
        log
    }

    #[test]
    fn test_indices() {
        let log = log_with(&[1, 1, 2]);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.term_at(0), Some(0));
        assert_eq!(log.term_at(2), Some(1));
        assert_eq!(log.term_at(4), None);
        assert!(RaftLog::new().is_empty());
    }

    #[test]
    fn test_try_append_rejects_gap() {
        let mut log = log_with(&[1]);
        assert_eq!(log.try_append(3, 1, vec![entry(4, 1)]), None);
        assert_eq!(log.try_append(1, 2, vec![entry(2, 2)]), None);
    }

    #[test]
    fn test_try_append_truncates_conflict() {
        let mut log = log_with(&[1, 1, 1]);
        let last = log.try_append(1, 1, vec![entry(2, 2)]).unwrap();
        assert_eq!(last, 2);
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.term_at(2), Some(2));
    }

    #[test]
    fn test_try_append_is_idempotent() {
        let mut log = log_with(&[1, 1, 1]);
        let last = log.try_append(0, 0, vec![entry(1, 1), entry(2, 1)]).unwrap();
        assert_eq!(last, 2);
        assert_eq!(log.last_index(), 3);
    }

    #[test]
    fn test_compact_and_read() {
        let mut log = log_with(&[1, 1, 2, 2]);
        log.compact(2);
        assert_eq!(log.snapshot_index(), 2);
        assert_eq!(log.snapshot_term(), 1);
        assert_eq!(log.term_at(2), Some(1));
        assert!(log.entry(2).is_none());
        assert_eq!(log.entries_from(3, 10).len(), 2);
        assert_eq!(log.last_index(), 4);
    }

    #[test]
    fn test_append_below_snapshot() {
        let mut log = log_with(&[1, 1, 1]);
        log.compact(2);
        let last = log.try_append(1, 1, vec![entry(2, 1), entry(3, 1), entry(4, 1)]);
        assert_eq!(last, Some(4));
        assert_eq!(log.last_index(), 4);
    }

    #[test]
    fn test_restore_discards_divergent_log() {
        let mut log = log_with(&[1, 1]);
        log.restore(5, 3);
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.last_term(), 3);
        assert!(log.entries().is_empty());
    }

    #[test]
    fn test_up_to_date() {
        let log = log_with(&[1, 2]);
        assert!(log.is_up_to_date(2, 2));
        assert!(log.is_up_to_date(1, 3));
        assert!(!log.is_up_to_date(5, 1));
        assert!(!log.is_up_to_date(1, 2));
    }
}
