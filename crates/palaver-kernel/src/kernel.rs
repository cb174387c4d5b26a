//! The kernel - pure functional core of Palaver.
//!
//! The kernel applies committed commands to produce new state, an outcome
//! for the originating client, and effects. It is completely pure: no IO,
//! no clocks, no randomness. This makes it deterministic and easy to test.
//!
//! # Example
//!
//! ```ignore
//! let state = ChatState::new();
//! let committed = Committed { index, timestamp, command, client };
//!
//! let (new_state, outcome, effects) = apply_committed(state, &committed);
//! // Runtime delivers the outcome to the waiting request and executes effects...
//! ```

use palaver_types::MessageId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::{Command, Committed};
use crate::effects::Effect;
use crate::state::{ChatState, MessageRecord, Session, UserRecord};

/// A domain-level rejection.
///
/// These are ordinary results of applying a command against the current
/// state, not failures of the machinery. They are carried as values so the
/// leader can hand them back to the caller verbatim; followers discard them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum ChatError {
    #[error("account already exists")]
    AlreadyExists,
    #[error("unknown user")]
    UnknownUser,
    #[error("unknown recipient")]
    UnknownRecipient,
}

/// The result of applying one committed command.
///
/// Serializable because it is cached in the session table for duplicate
/// suppression and therefore travels inside snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    /// The command succeeded with nothing extra to report.
    Ok,
    /// A message was delivered and assigned this id.
    MessageSent { id: MessageId },
    /// The command was rejected by domain rules.
    Rejected(ChatError),
}

/// Applies a committed command to the state.
///
/// Must be called exactly once per committed index, in index order. Takes
/// ownership of state, returns new state; no cloning of the maps on the
/// happy path.
///
/// Duplicate suppression: if the entry carries `(client_id, seq)` and `seq`
/// is not newer than the client's last applied sequence, the cached outcome
/// is returned and the state is untouched - a retried write has exactly one
/// observable effect.
pub fn apply_committed(
    state: ChatState,
    committed: &Committed,
) -> (ChatState, ApplyOutcome, Vec<Effect>) {
    // Replay check before anything else.
    if let Some((client_id, seq)) = committed.client {
        if let Some(session) = state.session(client_id) {
            if seq <= session.last_seq {
                tracing::debug!(
                    client = %client_id,
                    seq = %seq,
                    last_seq = %session.last_seq,
                    command = committed.command.name(),
                    "duplicate request, returning cached reply"
                );
                let cached = session.cached_reply.clone();
                return (state, cached, Vec::new());
            }
        }
    }

    let (state, outcome, effects) = apply_inner(state, committed);

    // Record the session after a fresh apply so the next replay hits the cache.
    let state = match committed.client {
        Some((client_id, seq)) => state.with_session(
            client_id,
            Session {
                last_seq: seq,
                cached_reply: outcome.clone(),
            },
        ),
        None => state,
    };

    (state, outcome, effects)
}

fn apply_inner(state: ChatState, committed: &Committed) -> (ChatState, ApplyOutcome, Vec<Effect>) {
    match &committed.command {
        // ====================================================================
        // Account Lifecycle
        // ====================================================================
        Command::Register {
            username,
            password_hash,
        } => {
            if state.user_exists(username) {
                return (state, ApplyOutcome::Rejected(ChatError::AlreadyExists), Vec::new());
            }

            let record = UserRecord {
                password_hash: *password_hash,
                created_at: committed.timestamp,
            };
            let new_state = state.with_user(username.clone(), record);

            debug_assert!(new_state.user_exists(username));
            (new_state, ApplyOutcome::Ok, Vec::new())
        }

        Command::DeleteAccount { username } => {
            // Idempotent: deleting an absent account is a success.
            if !state.user_exists(username) {
                return (state, ApplyOutcome::Ok, Vec::new());
            }

            let new_state = state.without_user(username);
            let effects = vec![Effect::AccountDeleted {
                username: username.clone(),
            }];

            debug_assert!(!new_state.user_exists(username));
            (new_state, ApplyOutcome::Ok, effects)
        }

        // ====================================================================
        // Messaging
        // ====================================================================
        Command::SendMessage {
            sender,
            recipient,
            content,
        } => {
            if !state.user_exists(recipient) {
                return (
                    state,
                    ApplyOutcome::Rejected(ChatError::UnknownRecipient),
                    Vec::new(),
                );
            }

            // Id assignment happens here, never at request receipt, so all
            // replicas compute the same id for this log position.
            let id = state.next_message_id();
            let record = MessageRecord {
                id,
                sender: sender.clone(),
                recipient: recipient.clone(),
                content: content.clone(),
                timestamp: committed.timestamp,
                read: false,
            };

            let effects = vec![Effect::MessageDelivered {
                message: record.clone(),
            }];
            let new_state = state.with_message(record);

            (new_state, ApplyOutcome::MessageSent { id }, effects)
        }

        Command::DeleteMessages { username, ids } => {
            let new_state = state.without_messages(username, ids);
            (new_state, ApplyOutcome::Ok, Vec::new())
        }

        Command::MarkRead { username, ids } => {
            let new_state = state.with_read_flags(username, ids);
            (new_state, ApplyOutcome::Ok, Vec::new())
        }

        // ====================================================================
        // Membership (interpreted by the consensus layer)
        // ====================================================================
        // The chat state is untouched; the consensus node watches applied
        // entries for these variants and updates its cluster configuration.
        Command::AddServerNonVoting { .. } | Command::PromoteServer { .. } | Command::Noop => {
            (state, ApplyOutcome::Ok, Vec::new())
        }
    }
}

/// A fatal kernel failure.
///
/// Only snapshot decode raises this; apply itself is total. A corrupt
/// snapshot means the durable store handed us garbage, which is operator
/// territory.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("snapshot decode failed: {0}")]
    SnapshotDecode(postcard::Error),
}

impl ChatState {
    /// Serializes the state for a snapshot.
    ///
    /// Canonical: equal states produce identical bytes (all maps are
    /// ordered), which the simulator relies on to compare replicas.
    pub fn to_snapshot_bytes(&self) -> Vec<u8> {
        postcard::to_allocvec(self).expect("chat state serialization cannot fail")
    }

    /// Atomically replaces state from snapshot bytes.
    pub fn from_snapshot_bytes(bytes: &[u8]) -> Result<Self, KernelError> {
        postcard::from_bytes(bytes).map_err(KernelError::SnapshotDecode)
    }
}
