//! The consensus node state machine.
//!
//! This module implements the Raft protocol as a pure, deterministic state
//! machine. The node takes events as input and produces new state plus an
//! output describing what the runtime must do:
//!
//! ```text
//! Client ──Command──► Leader
//!                       │ append + persist
//!                       ├──Append──► Follower₁
//!                       ├──Append──► Follower₂
//!                       │               │ persist
//!                       │◄──AppendOk────┤
//!                       │◄──AppendOk────┘
//!                       │ majority match → commit → apply
//! Client ◄──Result────┘
//! ```
//!
//! The node itself performs no I/O, reads no clocks, and draws no
//! randomness: timers fire as [`NodeEvent`]s, wall time for entry
//! timestamps rides on the events that need it, and election jitter is the
//! runtime's business. This is what makes the whole protocol runnable -
//! and crash-testable - inside the deterministic simulator.
//!
//! # Runtime ordering contract
//!
//! [`NodeOutput::persist`] must be applied to the durable store *before*
//! any message in [`NodeOutput::messages`] is handed to the transport.
//! Votes and append acknowledgements promise durability; sending them
//! first would break that promise on crash.

mod election;
mod replication;
mod snapshot;
mod state;

pub use state::NodeState;

use palaver_kernel::{ApplyOutcome, Command, Effect};
use palaver_types::{ClientId, LogIndex, NodeId, RequestSeq, Term, Timestamp};
use serde::{Deserialize, Serialize};

use crate::config::Member;
use crate::log::{LogEntry, Snapshot};
use crate::message::Envelope;

// ============================================================================
// Role
// ============================================================================

/// The node's current role. Transient; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        };
        write!(f, "{name}")
    }
}

// ============================================================================
// Events
// ============================================================================

/// An input to the node state machine.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A protocol message arrived from a peer.
    Rpc(Envelope),

    /// The randomized election timer fired without a heartbeat.
    ElectionTimeout,

    /// The leader's heartbeat interval elapsed.
    ///
    /// Carries wall time because housekeeping on this tick (promotion
    /// entries) may append to the log, and entry timestamps come from the
    /// event, never from a clock read inside the core.
    HeartbeatTimeout { now: Timestamp },

    /// A client write routed here by the gateway.
    ClientCommand {
        command: Command,
        client: Option<(ClientId, RequestSeq)>,
        now: Timestamp,
    },
}

// ============================================================================
// Output
// ============================================================================

/// A durable-store operation the runtime must perform.
///
/// These map one-to-one onto the store's atomic operations; the node emits
/// them in the order they must hit disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistAction {
    /// Persist term, vote, and the current membership together.
    SaveMetadata {
        term: Term,
        voted_for: Option<NodeId>,
        members: Vec<Member>,
    },
    /// Append contiguous entries to the durable log.
    AppendEntries { entries: Vec<LogEntry> },
    /// Remove durable entries with `index >= from`.
    TruncateSuffix { from: LogIndex },
    /// Swap in a snapshot and discard durable entries with
    /// `index <= discard_through`.
    ///
    /// `discard_through` is normally the snapshot boundary; a follower
    /// whose retained suffix conflicted with the snapshot discards its
    /// whole log by passing its old last index.
    InstallSnapshot {
        snapshot: Snapshot,
        discard_through: LogIndex,
    },
}

/// A committed entry that has been applied to the chat state.
///
/// The gateway on the leader matches `(term, index)` against its pending
/// write table to answer the waiting client; followers produce these too
/// but have no pending writes to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedEntry {
    pub index: LogIndex,
    pub term: Term,
    pub outcome: ApplyOutcome,
    /// Dedup identity the entry carried, if any.
    pub client: Option<(ClientId, RequestSeq)>,
}

/// Answer to a [`NodeEvent::ClientCommand`] submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResult {
    /// Appended; the result arrives later as an [`AppliedEntry`].
    Accepted { term: Term, index: LogIndex },
    /// This node is not the leader. `hint` is the last known leader, if any.
    NotLeader { hint: Option<NodeId> },
    /// A membership change is already in flight; only one may be
    /// uncommitted at a time.
    MembershipChangeInFlight,
}

/// Everything the runtime must do after processing one event.
#[derive(Debug, Default)]
pub struct NodeOutput {
    /// Durable-store operations, in order, executed **before** messages.
    pub persist: Vec<PersistAction>,
    /// Protocol messages to send.
    pub messages: Vec<Envelope>,
    /// Entries applied by this event, in index order.
    pub applied: Vec<AppliedEntry>,
    /// Kernel effects (stream deliveries) from the applied entries.
    pub effects: Vec<Effect>,
    /// Present iff the event was a `ClientCommand`.
    pub submit: Option<SubmitResult>,
    /// The runtime should re-arm the randomized election timer.
    pub reset_election_timer: bool,
}

impl NodeOutput {
    pub fn empty() -> Self {
        Self::default()
    }
}

// ============================================================================
// Options
// ============================================================================

/// Tuning knobs for the consensus core.
///
/// Timer durations are absent by design: the core never measures time.
#[derive(Debug, Clone)]
pub struct RaftOptions {
    /// Log entry count that triggers a snapshot capture.
    pub snapshot_log_threshold: usize,
    /// Flow-control cap on entries per append.
    pub max_entries_per_append: usize,
    /// How close (in entries) a learner must trail the log before
    /// promotion, checked over consecutive heartbeat rounds.
    pub promotion_lag: u64,
    /// Snapshot stream chunk size in bytes.
    pub snapshot_chunk_size: usize,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            snapshot_log_threshold: 4096,
            max_entries_per_append: 128,
            promotion_lag: 0,
            snapshot_chunk_size: 64 * 1024,
        }
    }
}

// ============================================================================
// Persisted State
// ============================================================================

/// Everything a node loads from its durable store at startup.
#[derive(Debug, Clone, Default)]
pub struct PersistedState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub members: Vec<Member>,
    pub snapshot: Option<Snapshot>,
    /// Entries above the snapshot boundary, in index order.
    pub entries: Vec<LogEntry>,
}
