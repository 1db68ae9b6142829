//! The in-memory log.
//!
//! A contiguous run of entries `[first_index ..= last_index]` plus the
//! `(index, term)` of the snapshot pinning the prefix. After a local
//! compaction a trailing tail of already-snapshotted entries is retained so
//! slightly lagging followers can still be served from the log.

use std::collections::VecDeque;

use crate::raft::Entry;
use crate::AppData;
use crate::LogId;

/// Outcome of checking an AppendEntries `(prev_log_index, prev_log_term)`
/// pair against the local log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrevCheck {
    /// The local log contains a matching entry (or the pair is covered by the
    /// committed snapshot prefix).
    Match,
    /// The local log contains an entry at that index with a different term.
    Conflict,
    /// The local log has no entry at that index yet.
    Missing,
}

/// The replica's in-memory copy of the log.
pub struct RaftLog<D: AppData> {
    entries: VecDeque<Entry<D>>,
    /// Index of `entries[0]`; when the container is empty this is the index
    /// the next appended entry will take.
    first: u64,
    /// Last log id covered by the snapshot, `(0, 0)` if none.
    snapshot_last: LogId,
}

impl<D: AppData> RaftLog<D> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            first: 1,
            snapshot_last: LogId::default(),
        }
    }

    pub fn first_index(&self) -> u64 {
        self.first
    }

    pub fn last_index(&self) -> u64 {
        self.first + self.entries.len() as u64 - 1
    }

    pub fn last_term(&self) -> u64 {
        self.entries.back().map(|e| e.term).unwrap_or(self.snapshot_last.term)
    }

    pub fn last_log_id(&self) -> LogId {
        LogId::new(self.last_term(), self.last_index())
    }

    pub fn snapshot_last(&self) -> LogId {
        self.snapshot_last
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry; its index must be exactly `last_index() + 1`.
    pub fn append(&mut self, entry: Entry<D>) {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        self.entries.push_back(entry);
    }

    pub fn get(&self, index: u64) -> Option<&Entry<D>> {
        if index < self.first {
            return None;
        }
        self.entries.get((index - self.first) as usize)
    }

    /// The term of the entry at `index`, if known.
    ///
    /// The snapshot boundary answers with the snapshot's term. Indices below
    /// the boundary are compacted and unknown.
    pub fn term_of(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_last.index {
            return Some(self.snapshot_last.term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Check an AppendEntries consistency pair against the local log.
    pub fn check_prev(&self, prev_index: u64, prev_term: u64) -> PrevCheck {
        if prev_index == 0 {
            return PrevCheck::Match;
        }
        if prev_index > self.last_index() {
            return PrevCheck::Missing;
        }
        match self.term_of(prev_index) {
            Some(t) if t == prev_term => PrevCheck::Match,
            // Entries at or below the snapshot boundary are committed; by the
            // Log Matching property the leader's entry there is identical.
            None if prev_index <= self.snapshot_last.index => PrevCheck::Match,
            Some(_) => PrevCheck::Conflict,
            None => PrevCheck::Missing,
        }
    }

    /// Drop `from` and every entry above it.
    pub fn truncate(&mut self, from: u64) {
        debug_assert!(from >= self.first);
        if from > self.last_index() {
            return;
        }
        let keep = (from - self.first) as usize;
        self.entries.truncate(keep);
    }

    /// Drop `from` and above without reclaiming payload memory eagerly.
    ///
    /// Used on the append-error rollback path; semantically identical to
    /// [`RaftLog::truncate`].
    pub fn discard(&mut self, from: u64) {
        self.truncate(from);
    }

    /// A snapshot has been installed: drop everything and repin the prefix.
    pub fn snapshot_restored(&mut self, last_index: u64, last_term: u64) {
        self.entries.clear();
        self.first = last_index + 1;
        self.snapshot_last = LogId::new(last_term, last_index);
    }

    /// A local snapshot has been taken: repin the prefix and drop entries
    /// older than the trailing window.
    pub fn compacted(&mut self, snapshot_index: u64, snapshot_term: u64, trailing: u64) {
        self.snapshot_last = LogId::new(snapshot_term, snapshot_index);
        let retain_first = snapshot_index.saturating_sub(trailing) + 1;
        while let Some(front) = self.entries.front() {
            if front.index >= retain_first {
                break;
            }
            self.entries.pop_front();
        }
        if self.first < retain_first {
            self.first = retain_first;
        }
    }

    /// Iterate entries in `[start, stop)`, clamped to what is present.
    pub fn range(&self, start: u64, stop: u64) -> impl Iterator<Item = &Entry<D>> {
        let lo = start.max(self.first);
        self.entries
            .iter()
            .skip(lo.saturating_sub(self.first) as usize)
            .take_while(move |e| e.index < stop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use crate::raft::EntryPayload;
    use serde::Deserialize;
    use serde::Serialize;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Noop;
    impl AppData for Noop {}

    fn entry(term: u64, index: u64) -> Entry<Noop> {
        Entry {
            term,
            index,
            payload: EntryPayload::Command(Noop),
        }
    }

    fn log_with(terms: &[u64]) -> RaftLog<Noop> {
        let mut log = RaftLog::new();
        for (i, t) in terms.iter().enumerate() {
            log.append(entry(*t, i as u64 + 1));
        }
        log
    }

    #[test]
    fn test_empty_log() {
        let log: RaftLog<Noop> = RaftLog::new();
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_of(1), None);
        assert_eq!(log.check_prev(0, 0), PrevCheck::Match);
        assert_eq!(log.check_prev(1, 1), PrevCheck::Missing);
    }

    #[test]
    fn test_append_and_lookup() {
        let log = log_with(&[1, 1, 2]);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.term_of(2), Some(1));
        assert_eq!(log.check_prev(2, 1), PrevCheck::Match);
        assert_eq!(log.check_prev(2, 2), PrevCheck::Conflict);
        assert_eq!(log.check_prev(4, 2), PrevCheck::Missing);
    }

    #[test]
    fn test_truncate_drops_suffix() {
        let mut log = log_with(&[1, 1, 2, 2]);
        log.truncate(3);
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.last_term(), 1);
        assert!(log.get(3).is_none());

        // Truncating at the first index empties the log entirely.
        log.truncate(1);
        assert_eq!(log.last_index(), 0);
        assert!(log.is_empty());
    }

    #[test]
    fn test_snapshot_restored_repins_prefix() {
        let mut log = log_with(&[1, 1, 2]);
        log.snapshot_restored(10, 3);
        assert_eq!(log.first_index(), 11);
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.last_term(), 3);
        assert_eq!(log.term_of(10), Some(3));
        // Below the boundary everything is committed, hence a match.
        assert_eq!(log.check_prev(5, 1), PrevCheck::Match);

        log.append(entry(3, 11));
        assert_eq!(log.last_index(), 11);
    }

    #[test]
    fn test_compacted_keeps_trailing_tail() {
        let mut log = log_with(&[1; 10]);
        log.compacted(8, 1, 3);
        // Entries 6..=10 remain: the trailing window [6, 8] plus the live tail.
        assert_eq!(log.first_index(), 6);
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.snapshot_last(), LogId::new(1, 8));
        assert_eq!(log.term_of(6), Some(1));
        assert_eq!(log.term_of(5), None);
    }

    #[test]
    fn test_range_clamps() {
        let log = log_with(&[1, 1, 1, 1, 1]);
        let idx: Vec<u64> = log.range(2, 4).map(|e| e.index).collect();
        assert_eq!(idx, vec![2, 3]);
        let idx: Vec<u64> = log.range(0, 100).map(|e| e.index).collect();
        assert_eq!(idx, vec![1, 2, 3, 4, 5]);
    }
}
