//! The durable store abstraction.

use palaver_raft::{LogEntry, Member, PersistAction, PersistedState, Snapshot};
use palaver_types::{LogIndex, NodeId, Term};

use crate::StorageError;

/// Atomic persistence operations for one replica.
///
/// Implementations must make each call durable before returning. Calls may
/// batch internally, but the effects of one call are never reordered after
/// those of a later call.
pub trait DurableStore: Send {
    /// Persists term, vote, and membership together.
    fn save_metadata(
        &mut self,
        term: Term,
        voted_for: Option<NodeId>,
        members: &[Member],
    ) -> Result<(), StorageError>;

    /// Appends contiguous entries to the durable log.
    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError>;

    /// Removes durable entries with `index >= from`.
    fn truncate_suffix(&mut self, from: LogIndex) -> Result<(), StorageError>;

    /// Atomically swaps in a snapshot and discards durable entries with
    /// `index <= discard_through`.
    fn install_snapshot(
        &mut self,
        snapshot: &Snapshot,
        discard_through: LogIndex,
    ) -> Result<(), StorageError>;

    /// Loads everything persisted, for node startup.
    fn load(&mut self) -> Result<PersistedState, StorageError>;
}

/// Executes a batch of persistence actions from the consensus core, in order.
///
/// This is the single place where [`PersistAction`]s meet the store, shared
/// by the server runtime and the simulator so both enforce identical
/// durability ordering.
pub fn apply_actions(
    store: &mut dyn DurableStore,
    actions: &[PersistAction],
) -> Result<(), StorageError> {
    for action in actions {
        match action {
            PersistAction::SaveMetadata {
                term,
                voted_for,
                members,
            } => store.save_metadata(*term, *voted_for, members)?,
            PersistAction::AppendEntries { entries } => store.append_entries(entries)?,
            PersistAction::TruncateSuffix { from } => store.truncate_suffix(*from)?,
            PersistAction::InstallSnapshot {
                snapshot,
                discard_through,
            } => store.install_snapshot(snapshot, *discard_through)?,
        }
    }
    Ok(())
}
