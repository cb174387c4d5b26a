//! Chat state management.
//!
//! The kernel maintains the in-memory chat state: accounts, messages,
//! per-user inboxes, and the client session table used for write
//! deduplication. State transitions are done by taking ownership and
//! returning a new state (builder pattern).
//!
//! All collections are `BTreeMap`s so that serialization is canonical:
//! two replicas with equal state produce byte-identical snapshots.

use std::collections::BTreeMap;

use palaver_types::{ClientId, MessageId, PasswordHash, RequestSeq, Timestamp, Username};
use serde::{Deserialize, Serialize};

use crate::kernel::ApplyOutcome;

// ============================================================================
// Records
// ============================================================================

/// A chat account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub password_hash: PasswordHash,
    /// Leader-assigned time of the committed `Register`.
    pub created_at: Timestamp,
}

/// A delivered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    /// Kept verbatim even after the sender account is deleted.
    pub sender: Username,
    pub recipient: Username,
    pub content: String,
    pub timestamp: Timestamp,
    pub read: bool,
}

/// Per-client dedup record: the last applied sequence and its cached reply.
///
/// When a client retries a write (leader handoff, network hiccup), the
/// command reaches apply a second time with the same `(client_id, seq)`.
/// The state machine returns the cached outcome instead of re-executing,
/// so retried sends never create a second message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub last_seq: RequestSeq,
    pub cached_reply: ApplyOutcome,
}

// ============================================================================
// Chat State
// ============================================================================

/// The chat state machine's in-memory state.
///
/// State uses a builder pattern - methods take ownership of `self`, mutate,
/// and return `self`. External code mutates state only through
/// [`crate::kernel::apply_committed`].
///
/// The session table lives here (not in the consensus layer) so that
/// snapshot transfer carries it: a replica restored from a snapshot
/// deduplicates retries exactly like one that applied the whole log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ChatState {
    users: BTreeMap<Username, UserRecord>,
    messages: BTreeMap<MessageId, MessageRecord>,
    /// Per-user delivery order. Insertion order equals apply order.
    inboxes: BTreeMap<Username, Vec<MessageId>>,
    next_message_id: MessageId,
    sessions: BTreeMap<ClientId, Session>,
}

impl ChatState {
    /// Creates a new empty state.
    pub fn new() -> Self {
        Self {
            next_message_id: MessageId::new(1),
            ..Self::default()
        }
    }

    // ========================================================================
    // Read Accessors (gateway read path)
    // ========================================================================

    pub fn user(&self, username: &str) -> Option<&UserRecord> {
        self.users.get(username)
    }

    pub fn user_exists(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn message(&self, id: MessageId) -> Option<&MessageRecord> {
        self.messages.get(&id)
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Usernames whose name contains `pattern`, in lexicographic order.
    ///
    /// An empty pattern matches every account. Pagination is zero-based.
    pub fn list_accounts(&self, pattern: &str, page: usize, per_page: usize) -> Vec<Username> {
        self.users
            .keys()
            .filter(|name| pattern.is_empty() || name.contains(pattern))
            .skip(page.saturating_mul(per_page))
            .take(per_page)
            .cloned()
            .collect()
    }

    /// Up to `count` messages from the user's inbox, oldest first.
    pub fn inbox_messages(&self, username: &str, count: usize) -> Vec<&MessageRecord> {
        self.inboxes
            .get(username)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.messages.get(id))
                    .take(count)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of unread messages in the user's inbox.
    pub fn unread_count(&self, username: &str) -> usize {
        self.inboxes
            .get(username)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.messages.get(id))
                    .filter(|m| !m.read)
                    .count()
            })
            .unwrap_or(0)
    }

    /// The dedup record for a client, if any.
    pub fn session(&self, client: ClientId) -> Option<&Session> {
        self.sessions.get(&client)
    }

    pub(crate) fn next_message_id(&self) -> MessageId {
        self.next_message_id
    }

    // ========================================================================
    // State Transitions (kernel-internal)
    // ========================================================================

    pub(crate) fn with_user(mut self, username: Username, record: UserRecord) -> Self {
        self.users.insert(username, record);
        self
    }

    /// Removes a user, their inbox, and every message in it.
    ///
    /// Messages the user *sent* to other accounts are retained; the sender
    /// field already holds the plain name, which serves as the tombstone.
    pub(crate) fn without_user(mut self, username: &str) -> Self {
        self.users.remove(username);
        if let Some(ids) = self.inboxes.remove(username) {
            for id in ids {
                self.messages.remove(&id);
            }
        }
        self
    }

    /// Delivers a message to the recipient's inbox and bumps the id counter.
    pub(crate) fn with_message(mut self, record: MessageRecord) -> Self {
        debug_assert_eq!(record.id, self.next_message_id, "ids must be sequential");
        self.next_message_id = self.next_message_id.next();
        self.inboxes
            .entry(record.recipient.clone())
            .or_default()
            .push(record.id);
        self.messages.insert(record.id, record);
        self
    }

    /// Removes `ids` from the user's inbox; ids not owned are skipped.
    pub(crate) fn without_messages(mut self, username: &str, ids: &[MessageId]) -> Self {
        let Some(inbox) = self.inboxes.get_mut(username) else {
            return self;
        };
        for id in ids {
            let owned = self
                .messages
                .get(id)
                .is_some_and(|m| m.recipient == username);
            if owned {
                self.messages.remove(id);
                inbox.retain(|held| held != id);
            }
        }
        self
    }

    /// Sets the read flag on owned messages. False -> true only.
    pub(crate) fn with_read_flags(mut self, username: &str, ids: &[MessageId]) -> Self {
        for id in ids {
            if let Some(m) = self.messages.get_mut(id) {
                if m.recipient == username {
                    m.read = true;
                }
            }
        }
        self
    }

    pub(crate) fn with_session(mut self, client: ClientId, session: Session) -> Self {
        self.sessions.insert(client, session);
        self
    }
}
