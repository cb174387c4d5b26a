//! Consensus error types.

use palaver_types::LogIndex;
use thiserror::Error;

/// Errors surfaced by the consensus core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RaftError {
    /// The requested index lies inside the compacted log prefix.
    ///
    /// Callers fall back to snapshot transfer: the entries no longer exist,
    /// but the snapshot covering them does.
    #[error("index {index} is compacted (snapshot covers through {snapshot_last_index})")]
    Compacted {
        index: LogIndex,
        snapshot_last_index: LogIndex,
    },

    /// The requested index is beyond the end of the log.
    #[error("index {index} is past the last entry {last_index}")]
    OutOfRange {
        index: LogIndex,
        last_index: LogIndex,
    },

    /// Snapshot payload failed to decompress or decode.
    #[error("snapshot payload corrupt: {0}")]
    SnapshotCorrupt(String),
}
