//! Raft protocol messages.
//!
//! This module defines all replica-to-replica messages:
//!
//! ## Elections
//! - [`VoteRequest`] - Candidate → All: vote for me in this term
//! - [`VoteResponse`] - Voter → Candidate: granted or not
//!
//! ## Replication
//! - [`AppendRequest`] - Leader → Follower: heartbeat carrying new entries
//! - [`AppendResponse`] - Follower → Leader: consistency check result,
//!   with a backfill hint on rejection
//!
//! ## Snapshot Transfer
//! - [`SnapshotChunk`] - Leader → Follower: one ordered piece of a snapshot
//! - [`SnapshotAck`] - Follower → Leader: progress / completion
//!
//! All replica traffic is targeted; there are no broadcast envelopes on the
//! wire. Per-peer TCP ordering gives the in-issue-order processing the
//! commit rules rely on.

use palaver_types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

use crate::config::Member;
use crate::log::LogEntry;

// ============================================================================
// Message Envelope
// ============================================================================

/// A protocol message with routing information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub payload: Payload,
}

/// The message payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    Append(AppendRequest),
    AppendResponse(AppendResponse),
    SnapshotChunk(SnapshotChunk),
    SnapshotAck(SnapshotAck),
}

impl Payload {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Payload::VoteRequest(_) => "VoteRequest",
            Payload::VoteResponse(_) => "VoteResponse",
            Payload::Append(_) => "Append",
            Payload::AppendResponse(_) => "AppendResponse",
            Payload::SnapshotChunk(_) => "SnapshotChunk",
            Payload::SnapshotAck(_) => "SnapshotAck",
        }
    }

    /// The term the sender was in, used for the adopt-higher-term rule.
    pub fn term(&self) -> Term {
        match self {
            Payload::VoteRequest(m) => m.term,
            Payload::VoteResponse(m) => m.term,
            Payload::Append(m) => m.term,
            Payload::AppendResponse(m) => m.term,
            Payload::SnapshotChunk(m) => m.term,
            Payload::SnapshotAck(m) => m.term,
        }
    }
}

/// Builds a targeted envelope.
pub fn msg(from: NodeId, to: NodeId, payload: Payload) -> Envelope {
    Envelope { from, to, payload }
}

// ============================================================================
// Elections
// ============================================================================

/// A candidate's request for a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate: NodeId,
    /// Position of the candidate's last entry, for the up-to-date check.
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

impl VoteRequest {
    /// True if the candidate's log is at least as up-to-date as `(term, index)`.
    ///
    /// Lexicographic on `(last_log_term, last_log_index)`.
    pub fn log_up_to_date(&self, local_last_term: Term, local_last_index: LogIndex) -> bool {
        (self.last_log_term, self.last_log_index) >= (local_last_term, local_last_index)
    }
}

/// The voter's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub granted: bool,
}

// ============================================================================
// Replication
// ============================================================================

/// Heartbeat / replication request.
///
/// An empty `entries` vector is a pure heartbeat; it still performs the
/// consistency check and may advance the follower's commit index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: Term,
    pub leader: NodeId,
    /// Index of the entry immediately preceding `entries`.
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    /// The leader's commit index.
    pub leader_commit: LogIndex,
}

/// Backfill hint returned on a rejected append.
///
/// `term` is the term of the follower's conflicting entry (zero when the
/// follower's log is simply too short) and `first_index` the first index of
/// that term. The leader uses it to skip a whole conflicting term per round
/// trip instead of walking back one index at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictHint {
    pub term: Term,
    pub first_index: LogIndex,
}

/// Result of an append consistency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResponse {
    pub term: Term,
    pub success: bool,
    /// On success: highest index known to match the leader's log.
    pub match_index: LogIndex,
    /// On rejection: where the logs diverge.
    pub conflict: Option<ConflictHint>,
}

// ============================================================================
// Snapshot Transfer
// ============================================================================

/// One ordered piece of a streamed snapshot.
///
/// A stream is identified by `(term, last_included_index)`; a partial
/// accumulation is discarded when either changes. Metadata rides on every
/// chunk so a follower can join the stream without extra round trips.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotChunk {
    pub term: Term,
    pub leader: NodeId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub members: Vec<Member>,
    /// Byte offset of `data` within the snapshot payload.
    pub offset: u64,
    pub data: Vec<u8>,
    /// Set on the final chunk.
    pub done: bool,
}

/// Follower progress acknowledgement for a snapshot stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotAck {
    pub term: Term,
    /// The stream being acknowledged.
    pub last_included_index: LogIndex,
    /// Next byte offset the follower expects.
    pub next_offset: u64,
    /// Set once the snapshot is fully installed.
    pub installed: bool,
}
