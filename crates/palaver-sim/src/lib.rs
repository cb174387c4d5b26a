//! # palaver-sim: Deterministic cluster simulator
//!
//! Instantiates whole Palaver clusters in one process and drives them
//! with a simulated clock and an in-memory transport. Every run is a pure
//! function of its seed: timer jitter comes from a seeded RNG, messages
//! are delivered in deterministic order, and the nodes themselves are the
//! pure state machines from `palaver-raft` persisting into `MemoryStore`s.
//!
//! Crashes drop a node's state but keep its store; restarts rebuild the
//! node from exactly what it persisted - so every simulated crash
//! exercises the production recovery path.
//!
//! The [`invariants`] checker runs after every step and asserts the
//! cluster-wide safety properties: committed prefixes agree across
//! replicas, at most one leader per term, `last_applied <= commit_index`,
//! committed entries are never lost, applied outcomes agree, and each
//! `(client_id, seq)` has at most one observable effect.

mod cluster;
pub mod invariants;

pub use cluster::{SimCluster, SimOptions};
