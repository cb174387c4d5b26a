//! The replicated log.
//!
//! An ordered sequence of term-tagged entries, contiguous above the
//! compacted snapshot prefix. The log enforces the structural invariants
//! the protocol depends on:
//!
//! - indices are contiguous and one-based
//! - terms are non-decreasing with index
//! - suffix truncation never reaches below the compaction boundary
//!
//! Reads below the boundary return [`RaftError::Compacted`]; callers fall
//! back to snapshot transfer.

use palaver_kernel::{ChatState, Command};
use palaver_types::{ClientId, LogIndex, RequestSeq, Term, Timestamp};
use serde::{Deserialize, Serialize};

use crate::config::Member;
use crate::error::RaftError;

// ============================================================================
// Log Entry
// ============================================================================

/// A single log record.
///
/// Once written at a `(term, index)` slot, an entry is immutable; conflicting
/// entries may be truncated only from indices that are not yet committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    /// Leader wall time at append; applied deterministically on all replicas.
    pub timestamp: Timestamp,
    pub command: Command,
    /// Client identity for write deduplication, if the command carried one.
    pub client: Option<(ClientId, RequestSeq)>,
}

// ============================================================================
// Snapshot
// ============================================================================

/// A compact representation of the state machine at a committed index.
///
/// `state` is the LZ4-compressed postcard serialization of [`ChatState`].
/// The member list rides alongside so a freshly installed replica knows the
/// cluster without replaying membership entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub members: Vec<Member>,
    pub state: Vec<u8>,
}

impl Snapshot {
    /// Captures the applied state into a snapshot.
    pub fn capture(
        last_included_index: LogIndex,
        last_included_term: Term,
        members: Vec<Member>,
        chat: &ChatState,
    ) -> Self {
        let raw = chat.to_snapshot_bytes();
        let state = lz4_flex::compress_prepend_size(&raw);
        Self {
            last_included_index,
            last_included_term,
            members,
            state,
        }
    }

    /// Decompresses and decodes the chat state.
    pub fn restore_state(&self) -> Result<ChatState, RaftError> {
        let raw = lz4_flex::decompress_size_prepended(&self.state)
            .map_err(|e| RaftError::SnapshotCorrupt(e.to_string()))?;
        ChatState::from_snapshot_bytes(&raw).map_err(|e| RaftError::SnapshotCorrupt(e.to_string()))
    }
}

// ============================================================================
// Log
// ============================================================================

/// The in-memory log with a compacted prefix.
///
/// `entries[i]` holds index `snapshot_last_index + i + 1`. The prefix at or
/// below `snapshot_last_index` lives only in the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Log {
    snapshot_last_index: LogIndex,
    snapshot_last_term: Term,
    entries: Vec<LogEntry>,
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a log from persisted parts.
    pub fn from_parts(
        snapshot_last_index: LogIndex,
        snapshot_last_term: Term,
        entries: Vec<LogEntry>,
    ) -> Self {
        if let Some(first) = entries.first() {
            assert_eq!(
                first.index,
                snapshot_last_index.next(),
                "log must be contiguous with the snapshot boundary"
            );
        }
        Self {
            snapshot_last_index,
            snapshot_last_term,
            entries,
        }
    }

    pub fn snapshot_last_index(&self) -> LogIndex {
        self.snapshot_last_index
    }

    pub fn snapshot_last_term(&self) -> Term {
        self.snapshot_last_term
    }

    /// Number of entries currently held (excludes the compacted prefix).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest index in the log, or the snapshot boundary if empty.
    pub fn last_index(&self) -> LogIndex {
        self.entries
            .last()
            .map_or(self.snapshot_last_index, |e| e.index)
    }

    /// Term of the highest entry, or the snapshot's term if empty.
    pub fn last_term(&self) -> Term {
        self.entries
            .last()
            .map_or(self.snapshot_last_term, |e| e.term)
    }

    /// Appends one entry. The index must be exactly `last_index + 1` and the
    /// term must not regress.
    pub fn append(&mut self, entry: LogEntry) {
        assert_eq!(
            entry.index,
            self.last_index().next(),
            "append must be contiguous: expected {}, got {}",
            self.last_index().next(),
            entry.index
        );
        debug_assert!(
            entry.term >= self.last_term(),
            "terms must be non-decreasing: {} after {}",
            entry.term,
            self.last_term()
        );
        self.entries.push(entry);
    }

    fn offset_of(&self, index: LogIndex) -> Result<usize, RaftError> {
        if index <= self.snapshot_last_index {
            return Err(RaftError::Compacted {
                index,
                snapshot_last_index: self.snapshot_last_index,
            });
        }
        if index > self.last_index() {
            return Err(RaftError::OutOfRange {
                index,
                last_index: self.last_index(),
            });
        }
        Ok((index.as_u64() - self.snapshot_last_index.as_u64() - 1) as usize)
    }

    /// The entry at `index`.
    pub fn entry_at(&self, index: LogIndex) -> Result<&LogEntry, RaftError> {
        Ok(&self.entries[self.offset_of(index)?])
    }

    /// The term of the entry at `index`.
    ///
    /// Index 0 (before the log) is term 0; the snapshot boundary answers
    /// with the snapshot's term.
    pub fn term_at(&self, index: LogIndex) -> Result<Term, RaftError> {
        if index.is_zero() {
            return Ok(Term::ZERO);
        }
        if index == self.snapshot_last_index {
            return Ok(self.snapshot_last_term);
        }
        Ok(self.entries[self.offset_of(index)?].term)
    }

    /// Entries from `from` (inclusive), capped at `max`.
    pub fn slice_from(&self, from: LogIndex, max: usize) -> Result<Vec<LogEntry>, RaftError> {
        if from > self.last_index() {
            return Ok(Vec::new());
        }
        let start = self.offset_of(from)?;
        let end = (start + max).min(self.entries.len());
        Ok(self.entries[start..end].to_vec())
    }

    /// First index of the term that `index` belongs to, scanning backward.
    ///
    /// Used to build the rejection backfill hint: the leader can skip an
    /// entire conflicting term in one round trip.
    pub fn first_index_of_term_at(&self, index: LogIndex) -> Result<LogIndex, RaftError> {
        let term = self.term_at(index)?;
        let mut first = index;
        while first.prev() > self.snapshot_last_index {
            match self.term_at(first.prev()) {
                Ok(t) if t == term => first = first.prev(),
                _ => break,
            }
        }
        Ok(first)
    }

    /// Removes entries with `index >= from`.
    ///
    /// The caller guarantees `from` is above the commit index; committed
    /// entries are never truncated.
    pub fn truncate_suffix_from(&mut self, from: LogIndex) -> Result<(), RaftError> {
        if from > self.last_index() {
            return Ok(());
        }
        let start = self.offset_of(from)?;
        self.entries.truncate(start);
        Ok(())
    }

    /// Discards the prefix through `through`, recording the new boundary.
    ///
    /// Called after a snapshot capture or installation. `through` beyond the
    /// last entry empties the log entirely (the snapshot supersedes it).
    pub fn compact_through(&mut self, through: LogIndex, through_term: Term) {
        assert!(
            through >= self.snapshot_last_index,
            "compaction boundary cannot move backward: {} < {}",
            through,
            self.snapshot_last_index
        );
        if through >= self.last_index() {
            self.entries.clear();
        } else {
            let keep_from = (through.as_u64() - self.snapshot_last_index.as_u64()) as usize;
            self.entries.drain(..keep_from);
        }
        self.snapshot_last_index = through;
        self.snapshot_last_term = through_term;

        debug_assert!(
            self.entries
                .first()
                .is_none_or(|e| e.index == through.next()),
            "log must stay contiguous after compaction"
        );
    }

    /// All held entries, for persistence on shutdown-free paths and tests.
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_kernel::Command;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry {
            term: Term::new(term),
            index: LogIndex::new(index),
            timestamp: Timestamp::new(0),
            command: Command::DeleteAccount {
                username: "x".into(),
            },
            client: None,
        }
    }

    fn log_with(terms: &[u64]) -> Log {
        let mut log = Log::new();
        for (i, &t) in terms.iter().enumerate() {
            log.append(entry(t, i as u64 + 1));
        }
        log
    }

    #[test]
    fn empty_log_boundaries() {
        let log = Log::new();
        assert_eq!(log.last_index(), LogIndex::ZERO);
        assert_eq!(log.last_term(), Term::ZERO);
        assert_eq!(log.term_at(LogIndex::ZERO).unwrap(), Term::ZERO);
    }

    #[test]
    fn append_and_lookup() {
        let log = log_with(&[1, 1, 2]);
        assert_eq!(log.last_index(), LogIndex::new(3));
        assert_eq!(log.last_term(), Term::new(2));
        assert_eq!(log.term_at(LogIndex::new(2)).unwrap(), Term::new(1));
        assert_eq!(log.entry_at(LogIndex::new(3)).unwrap().term, Term::new(2));
    }

    #[test]
    fn slice_respects_cap_and_end() {
        let log = log_with(&[1, 1, 1, 1]);
        let slice = log.slice_from(LogIndex::new(2), 2).unwrap();
        assert_eq!(slice.len(), 2);
        assert_eq!(slice[0].index, LogIndex::new(2));

        assert!(log.slice_from(LogIndex::new(5), 10).unwrap().is_empty());
    }

    #[test]
    fn first_index_of_term_scans_back() {
        let log = log_with(&[1, 2, 2, 2, 3]);
        assert_eq!(
            log.first_index_of_term_at(LogIndex::new(4)).unwrap(),
            LogIndex::new(2)
        );
        assert_eq!(
            log.first_index_of_term_at(LogIndex::new(1)).unwrap(),
            LogIndex::new(1)
        );
    }

    #[test]
    fn truncate_suffix() {
        let mut log = log_with(&[1, 1, 2, 2]);
        log.truncate_suffix_from(LogIndex::new(3)).unwrap();
        assert_eq!(log.last_index(), LogIndex::new(2));
        assert_eq!(log.last_term(), Term::new(1));
    }

    #[test]
    fn compaction_moves_boundary_and_rejects_reads_below() {
        let mut log = log_with(&[1, 1, 2, 2]);
        log.compact_through(LogIndex::new(2), Term::new(1));

        assert_eq!(log.snapshot_last_index(), LogIndex::new(2));
        assert_eq!(log.len(), 2);
        assert_eq!(log.last_index(), LogIndex::new(4));
        assert!(matches!(
            log.entry_at(LogIndex::new(1)),
            Err(RaftError::Compacted { .. })
        ));
        // Boundary term still answerable.
        assert_eq!(log.term_at(LogIndex::new(2)).unwrap(), Term::new(1));
    }

    #[test]
    fn compaction_past_end_empties_log() {
        let mut log = log_with(&[1, 1]);
        log.compact_through(LogIndex::new(2), Term::new(1));
        assert!(log.is_empty());
        assert_eq!(log.last_index(), LogIndex::new(2));
        assert_eq!(log.last_term(), Term::new(1));
    }

    #[test]
    fn snapshot_round_trip() {
        let chat = ChatState::new();
        let snap = Snapshot::capture(LogIndex::new(10), Term::new(2), Vec::new(), &chat);
        let restored = snap.restore_state().unwrap();
        assert_eq!(chat, restored);
    }
}
