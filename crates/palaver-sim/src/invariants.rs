//! Cluster-wide safety invariants, checked after every simulator step.
//!
//! A violation panics with the virtual time and the offending nodes;
//! in a deterministic simulation the failing seed reproduces it exactly.

use std::collections::BTreeMap;

use palaver_kernel::ApplyOutcome;
use palaver_raft::{AppliedEntry, NodeState, Role};
use palaver_types::NodeId;

/// Accumulated knowledge about the run, fed by the cluster as it steps.
#[derive(Debug, Default)]
pub struct InvariantTracker {
    /// Leader observed per term (P2: at most one).
    leaders_by_term: BTreeMap<u64, NodeId>,
    /// Term of each committed index ever observed (P4: never changes).
    committed_terms: BTreeMap<u64, u64>,
    /// Highest commit index seen per node while continuously alive
    /// (commit is monotonic on a running node; restarts reset it).
    commit_seen: BTreeMap<NodeId, u64>,
    /// Index through which each node's committed terms were verified.
    verified_through: BTreeMap<NodeId, u64>,
    /// Outcome applied at each index (P5: replicas agree).
    outcomes: BTreeMap<u64, (u64, ApplyOutcome)>,
    /// Outcome per dedup identity (P6: one observable effect).
    dedup: BTreeMap<(u64, u64), ApplyOutcome>,
    /// Serialized chat state per applied index (P1: replicas identical).
    state_bytes: BTreeMap<u64, Vec<u8>>,
    /// Last applied index for which each node's state was compared.
    state_checked: BTreeMap<NodeId, u64>,
}

impl InvariantTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Terms in which a leader was observed.
    pub fn leader_terms(&self) -> impl Iterator<Item = (&u64, &NodeId)> {
        self.leaders_by_term.iter()
    }

    /// Records one applied entry (P5, P6).
    pub fn record_applied(&mut self, entry: &AppliedEntry) {
        let index = entry.index.as_u64();
        let term = entry.term.as_u64();

        match self.outcomes.get(&index) {
            Some((seen_term, seen_outcome)) => {
                assert_eq!(
                    (*seen_term, seen_outcome),
                    (term, &entry.outcome),
                    "P5 violated: index {index} applied with diverging term/outcome"
                );
            }
            None => {
                self.outcomes.insert(index, (term, entry.outcome.clone()));
            }
        }

        if let Some((client, seq)) = entry.client {
            let key = (client.as_u64(), seq.as_u64());
            match self.dedup.get(&key) {
                Some(cached) => {
                    // A replayed identity must observe the cached reply,
                    // never a second effect.
                    assert_eq!(
                        cached, &entry.outcome,
                        "P6 violated: client {key:?} observed two different outcomes"
                    );
                }
                None => {
                    self.dedup.insert(key, entry.outcome.clone());
                }
            }
        }
    }

    /// Drops per-node continuity tracking on crash.
    pub fn forget_node(&mut self, id: NodeId) {
        self.commit_seen.remove(&id);
        self.verified_through.remove(&id);
        self.state_checked.remove(&id);
    }

    /// Checks every structural invariant over the live nodes.
    pub fn check(&mut self, now_ms: u64, live: &[(NodeId, &NodeState)]) {
        for (id, state) in live {
            // P2: at most one leader per term.
            if state.role() == Role::Leader {
                let term = state.current_term().as_u64();
                match self.leaders_by_term.get(&term) {
                    Some(seen) if seen != id => panic!(
                        "P2 violated at t={now_ms}: term {term} has leaders {seen} and {id}"
                    ),
                    _ => {
                        self.leaders_by_term.insert(term, *id);
                    }
                }
            }

            // P3: last_applied never passes commit_index.
            assert!(
                state.last_applied() <= state.commit_index(),
                "P3 violated at t={now_ms} on {id}: applied {} > commit {}",
                state.last_applied(),
                state.commit_index()
            );

            // Commit index is monotonic on a continuously running node.
            let commit = state.commit_index().as_u64();
            if let Some(prev) = self.commit_seen.get(id) {
                assert!(
                    commit >= *prev,
                    "commit regressed at t={now_ms} on {id}: {prev} -> {commit}"
                );
            }
            self.commit_seen.insert(*id, commit);

            // P4: a committed (index, term) pair never changes.
            let boundary = state.log().snapshot_last_index().as_u64();
            let from = self
                .verified_through
                .get(id)
                .copied()
                .unwrap_or(0)
                .max(boundary)
                + 1;
            for index in from..=commit {
                let Ok(term) = state.log().term_at(index.into()) else {
                    continue; // compacted mid-scan
                };
                let term = term.as_u64();
                match self.committed_terms.get(&index) {
                    Some(seen) => assert_eq!(
                        *seen, term,
                        "P4 violated at t={now_ms} on {id}: committed index {index} changed term {seen} -> {term}"
                    ),
                    None => {
                        self.committed_terms.insert(index, term);
                    }
                }
            }
            self.verified_through.insert(*id, commit);

            // P1: identical applied state at identical applied index.
            let applied = state.last_applied().as_u64();
            if self.state_checked.get(id) != Some(&applied) {
                let bytes = state.chat().to_snapshot_bytes();
                match self.state_bytes.get(&applied) {
                    Some(seen) => assert_eq!(
                        seen, &bytes,
                        "P1 violated at t={now_ms} on {id}: applied state diverges at index {applied}"
                    ),
                    None => {
                        self.state_bytes.insert(applied, bytes);
                        // Bound the cache; old indexes are settled.
                        while self.state_bytes.len() > 64 {
                            let oldest = *self.state_bytes.keys().next().expect("nonempty");
                            self.state_bytes.remove(&oldest);
                        }
                    }
                }
                self.state_checked.insert(*id, applied);
            }
        }
    }
}
