//! Commands that enter the replicated log.
//!
//! A [`Command`] is the payload of a log entry. Commands are serialized
//! compactly (postcard) and matched exhaustively at apply time.

use palaver_types::{ClientId, LogIndex, MessageId, NodeId, PasswordHash, RequestSeq, Timestamp};
use serde::{Deserialize, Serialize};

/// A state machine command.
///
/// The first five variants are client-originated chat operations; the last
/// two are membership changes driven by the cluster itself. Once a command
/// is committed at a log position, it is immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Create an account. Fails with `AlreadyExists` if the name is taken.
    Register {
        username: String,
        password_hash: PasswordHash,
    },

    /// Remove an account, its inbox, and the messages in it. Idempotent.
    DeleteAccount { username: String },

    /// Deliver a message. The id is assigned at apply time.
    SendMessage {
        sender: String,
        recipient: String,
        content: String,
    },

    /// Remove messages from `username`'s inbox. Ids not owned by the user
    /// are silently skipped.
    DeleteMessages {
        username: String,
        ids: Vec<MessageId>,
    },

    /// Mark owned messages as read. Read flags only go false -> true.
    MarkRead {
        username: String,
        ids: Vec<MessageId>,
    },

    /// Add a server to the cluster as a non-voting learner.
    AddServerNonVoting { id: NodeId, addr: String },

    /// Promote a caught-up non-voting server to a voter.
    PromoteServer { id: NodeId },

    /// No-op appended by a newly elected leader.
    ///
    /// Commitment only counts replicas for current-term entries; the no-op
    /// anchors any uncommitted earlier-term suffix so it commits (and
    /// re-applies after a full-cluster restart) without waiting for the
    /// next client write.
    Noop,
}

impl Command {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Register { .. } => "Register",
            Command::DeleteAccount { .. } => "DeleteAccount",
            Command::SendMessage { .. } => "SendMessage",
            Command::DeleteMessages { .. } => "DeleteMessages",
            Command::MarkRead { .. } => "MarkRead",
            Command::AddServerNonVoting { .. } => "AddServerNonVoting",
            Command::PromoteServer { .. } => "PromoteServer",
            Command::Noop => "Noop",
        }
    }

    /// Returns true for the membership-change variants.
    pub fn is_membership_change(&self) -> bool {
        matches!(
            self,
            Command::AddServerNonVoting { .. } | Command::PromoteServer { .. }
        )
    }
}

/// A committed command as handed to the state machine.
///
/// The timestamp was assigned by the leader when the command was appended,
/// so it is identical on every replica. The optional `(client_id, seq)`
/// pair drives write deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committed {
    /// Log position of the entry being applied.
    pub index: LogIndex,
    /// Leader-assigned wall time at append.
    pub timestamp: Timestamp,
    /// The command itself.
    pub command: Command,
    /// Client identity for deduplication, if the write carried one.
    pub client: Option<(ClientId, RequestSeq)>,
}
