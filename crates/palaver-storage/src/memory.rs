//! In-memory store for tests and the simulator.

use palaver_raft::{LogEntry, Member, PersistedState, Snapshot};
use palaver_types::{LogIndex, NodeId, Term};

use crate::store::DurableStore;
use crate::StorageError;

/// A [`DurableStore`] backed by plain memory.
///
/// "Durable" here means: survives a simulated crash, i.e. dropping the
/// node while keeping the store. The simulator restarts nodes from exactly
/// what was written here, which is how crash-recovery scenarios exercise
/// the production persistence discipline.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: PersistedState,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct view of the persisted state, for test assertions.
    pub fn persisted(&self) -> &PersistedState {
        &self.state
    }
}

impl DurableStore for MemoryStore {
    fn save_metadata(
        &mut self,
        term: Term,
        voted_for: Option<NodeId>,
        members: &[Member],
    ) -> Result<(), StorageError> {
        self.state.current_term = term;
        self.state.voted_for = voted_for;
        self.state.members = members.to_vec();
        Ok(())
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        self.state.entries.extend_from_slice(entries);
        Ok(())
    }

    fn truncate_suffix(&mut self, from: LogIndex) -> Result<(), StorageError> {
        self.state.entries.retain(|e| e.index < from);
        Ok(())
    }

    fn install_snapshot(
        &mut self,
        snapshot: &Snapshot,
        discard_through: LogIndex,
    ) -> Result<(), StorageError> {
        self.state.snapshot = Some(snapshot.clone());
        self.state.entries.retain(|e| e.index > discard_through);
        Ok(())
    }

    fn load(&mut self) -> Result<PersistedState, StorageError> {
        Ok(self.state.clone())
    }
}
