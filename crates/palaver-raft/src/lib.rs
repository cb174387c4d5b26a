//! # palaver-raft: Consensus core of Palaver
//!
//! This crate implements the replicated-log protocol as a pure,
//! deterministic state machine:
//! - takes RPCs, timer firings, and client commands as events
//! - produces new state, outgoing messages, persistence actions, and
//!   applied results as output
//! - no I/O, no clocks, no randomness
//!
//! This enables comprehensive simulation testing under `palaver-sim`: the
//! simulator drives whole clusters with a simulated clock and in-memory
//! transport, crash-restarting nodes from exactly what they persisted.
//!
//! # Protocol Overview
//!
//! ## Normal Operation
//!
//! ```text
//! Client ──Command──► Leader
//!                       │ append + fsync
//!                       ├──Append──► Follower₁
//!                       ├──Append──► Follower₂
//!                       │               │ fsync
//!                       │◄──AppendOk────┤
//!                       │◄──AppendOk────┘
//!                       │ majority → commit → apply
//! Client ◄──Result────┘
//! ```
//!
//! ## Elections
//!
//! ```text
//! Follower ──(timeout)──► Candidate: term++, vote self
//!            ──VoteRequest──► All voters
//!            ◄──VoteResponse── (granted if log up-to-date, one vote/term)
//!            ──(majority)──► Leader: empty Append announces
//! ```
//!
//! ## Catch-up
//!
//! Lagging followers are walked backward via conflict hints; followers
//! below the compacted prefix receive the snapshot in ordered chunks, then
//! resume normal appends.
//!
//! # Key Types
//!
//! - [`NodeState`]: the per-node protocol state machine
//! - [`NodeEvent`] / [`NodeOutput`]: its input and output
//! - [`Log`], [`LogEntry`], [`Snapshot`]: the replicated log
//! - [`ClusterConfig`], [`Member`]: voting/non-voting membership

pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod node;

#[cfg(test)]
mod tests;

pub use config::{ClusterConfig, Member};
pub use error::RaftError;
pub use log::{Log, LogEntry, Snapshot};
pub use message::{
    AppendRequest, AppendResponse, ConflictHint, Envelope, Payload, SnapshotAck, SnapshotChunk,
    VoteRequest, VoteResponse, msg,
};
pub use node::{
    AppliedEntry, NodeEvent, NodeOutput, NodeState, PersistAction, PersistedState, RaftOptions,
    Role, SubmitResult,
};
