//! Integration tests for palaver-kernel.
//!
//! These exercise apply semantics end to end: account lifecycle, message
//! delivery, dedup, and the determinism laws the replication layer relies on.

use palaver_types::{ClientId, LogIndex, MessageId, RequestSeq, Timestamp, hash_password};
use proptest::prelude::*;

use crate::command::{Command, Committed};
use crate::effects::Effect;
use crate::kernel::{ApplyOutcome, ChatError, apply_committed};
use crate::state::ChatState;

// ============================================================================
// Helper Functions
// ============================================================================

fn committed(index: u64, command: Command) -> Committed {
    Committed {
        index: LogIndex::new(index),
        timestamp: Timestamp::new(1_700_000_000_000 + index),
        command,
        client: None,
    }
}

fn committed_from(
    index: u64,
    command: Command,
    client: u64,
    seq: u64,
) -> Committed {
    Committed {
        client: Some((ClientId::new(client), RequestSeq::new(seq))),
        ..committed(index, command)
    }
}

fn register(username: &str) -> Command {
    Command::Register {
        username: username.into(),
        password_hash: hash_password("pw"),
    }
}

fn send(sender: &str, recipient: &str, content: &str) -> Command {
    Command::SendMessage {
        sender: sender.into(),
        recipient: recipient.into(),
        content: content.into(),
    }
}

/// Applies a sequence of commands starting from an empty state.
fn apply_all(commands: Vec<Command>) -> ChatState {
    let mut state = ChatState::new();
    for (i, cmd) in commands.into_iter().enumerate() {
        let (next, _, _) = apply_committed(state, &committed(i as u64 + 1, cmd));
        state = next;
    }
    state
}

// ============================================================================
// Account Lifecycle
// ============================================================================

#[test]
fn register_then_duplicate_register() {
    let state = ChatState::new();
    let (state, outcome, _) = apply_committed(state, &committed(1, register("alice")));
    assert_eq!(outcome, ApplyOutcome::Ok);
    assert!(state.user_exists("alice"));

    let (state, outcome, _) = apply_committed(state, &committed(2, register("alice")));
    assert_eq!(outcome, ApplyOutcome::Rejected(ChatError::AlreadyExists));
    assert_eq!(state.user_count(), 1);
}

#[test]
fn delete_account_is_idempotent() {
    let state = apply_all(vec![register("alice")]);

    let (state, outcome, effects) =
        apply_committed(state, &committed(2, Command::DeleteAccount { username: "alice".into() }));
    assert_eq!(outcome, ApplyOutcome::Ok);
    assert_eq!(effects.len(), 1);
    assert!(!state.user_exists("alice"));

    // Second delete: still ok, no effects.
    let (state, outcome, effects) =
        apply_committed(state, &committed(3, Command::DeleteAccount { username: "alice".into() }));
    assert_eq!(outcome, ApplyOutcome::Ok);
    assert!(effects.is_empty());
    assert_eq!(state.user_count(), 0);
}

#[test]
fn reregister_after_delete_yields_fresh_account() {
    let state = apply_all(vec![
        register("alice"),
        register("bob"),
        send("alice", "bob", "hi"),
        Command::DeleteAccount { username: "bob".into() },
        register("bob"),
    ]);

    assert!(state.user_exists("bob"));
    // Fresh account: the old inbox did not survive the deletion.
    assert_eq!(state.unread_count("bob"), 0);
    assert!(state.inbox_messages("bob", 10).is_empty());
}

#[test]
fn recipient_deletion_cascades_inbox_but_sender_deletion_retains() {
    let state = apply_all(vec![
        register("alice"),
        register("bob"),
        send("alice", "bob", "hi"),
        Command::DeleteAccount { username: "alice".into() },
    ]);

    // Sender gone, message retained with the sender name as tombstone.
    let inbox = state.inbox_messages("bob", 10);
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].sender, "alice");
    assert!(!state.user_exists("alice"));

    // Recipient deletion removes the message itself.
    let (state, _, _) =
        apply_committed(state, &committed(5, Command::DeleteAccount { username: "bob".into() }));
    assert_eq!(state.message_count(), 0);
}

// ============================================================================
// Messaging
// ============================================================================

#[test]
fn send_assigns_sequential_ids_and_sets_unread() {
    let state = apply_all(vec![register("alice"), register("bob")]);

    let (state, outcome, effects) =
        apply_committed(state, &committed(3, send("alice", "bob", "hi")));
    assert_eq!(outcome, ApplyOutcome::MessageSent { id: MessageId::new(1) });
    assert!(matches!(effects[0], Effect::MessageDelivered { .. }));

    let (state, outcome, _) = apply_committed(state, &committed(4, send("alice", "bob", "hi2")));
    assert_eq!(outcome, ApplyOutcome::MessageSent { id: MessageId::new(2) });

    assert_eq!(state.unread_count("bob"), 2);
    let inbox = state.inbox_messages("bob", 10);
    assert_eq!(inbox[0].content, "hi");
    assert_eq!(inbox[1].content, "hi2");
}

#[test]
fn send_to_unknown_recipient_is_rejected() {
    let state = apply_all(vec![register("alice")]);
    let (state, outcome, effects) =
        apply_committed(state, &committed(2, send("alice", "ghost", "hello?")));
    assert_eq!(outcome, ApplyOutcome::Rejected(ChatError::UnknownRecipient));
    assert!(effects.is_empty());
    assert_eq!(state.message_count(), 0);
}

#[test]
fn delete_messages_skips_unowned_ids() {
    let state = apply_all(vec![
        register("alice"),
        register("bob"),
        register("carol"),
        send("alice", "bob", "for bob"),
        send("alice", "carol", "for carol"),
    ]);

    // Bob tries to delete his own message and carol's.
    let (state, outcome, _) = apply_committed(
        state,
        &committed(
            6,
            Command::DeleteMessages {
                username: "bob".into(),
                ids: vec![MessageId::new(1), MessageId::new(2)],
            },
        ),
    );
    assert_eq!(outcome, ApplyOutcome::Ok);
    assert!(state.inbox_messages("bob", 10).is_empty());
    // Carol's message survived.
    assert_eq!(state.inbox_messages("carol", 10).len(), 1);
}

#[test]
fn mark_read_only_flips_owned_messages() {
    let state = apply_all(vec![
        register("alice"),
        register("bob"),
        send("alice", "bob", "hi"),
    ]);

    let (state, _, _) = apply_committed(
        state,
        &committed(
            4,
            Command::MarkRead {
                username: "alice".into(), // not the recipient
                ids: vec![MessageId::new(1)],
            },
        ),
    );
    assert_eq!(state.unread_count("bob"), 1);

    let (state, _, _) = apply_committed(
        state,
        &committed(
            5,
            Command::MarkRead {
                username: "bob".into(),
                ids: vec![MessageId::new(1)],
            },
        ),
    );
    assert_eq!(state.unread_count("bob"), 0);
}

// ============================================================================
// Account Listing
// ============================================================================

#[test]
fn list_accounts_pattern_and_pagination() {
    let state = apply_all(vec![
        register("alice"),
        register("alina"),
        register("bob"),
    ]);

    assert_eq!(state.list_accounts("", 0, 10), vec!["alice", "alina", "bob"]);
    assert_eq!(state.list_accounts("ali", 0, 10), vec!["alice", "alina"]);
    assert_eq!(state.list_accounts("", 1, 2), vec!["bob"]);
    assert!(state.list_accounts("zzz", 0, 10).is_empty());
}

// ============================================================================
// Duplicate Suppression
// ============================================================================

#[test]
fn duplicate_send_returns_cached_reply_without_second_message() {
    let state = apply_all(vec![register("alice"), register("bob")]);

    let cmd = committed_from(3, send("alice", "bob", "hi"), 1, 7);
    let (state, outcome, effects) = apply_committed(state, &cmd);
    assert_eq!(outcome, ApplyOutcome::MessageSent { id: MessageId::new(1) });
    assert_eq!(effects.len(), 1);

    // Identical retry: cached outcome, no new message, no effects.
    let retry = committed_from(4, send("alice", "bob", "hi"), 1, 7);
    let (state, outcome, effects) = apply_committed(state, &retry);
    assert_eq!(outcome, ApplyOutcome::MessageSent { id: MessageId::new(1) });
    assert!(effects.is_empty());
    assert_eq!(state.message_count(), 1);
}

#[test]
fn stale_sequence_is_suppressed_even_after_newer_writes() {
    let state = apply_all(vec![register("alice"), register("bob")]);

    let (state, _, _) =
        apply_committed(state, &committed_from(3, send("alice", "bob", "one"), 1, 1));
    let (state, _, _) =
        apply_committed(state, &committed_from(4, send("alice", "bob", "two"), 1, 2));

    // seq=1 replay arrives late; the cache now holds seq=2's reply, which is
    // what the dedup contract returns for any stale sequence.
    let (state, outcome, effects) =
        apply_committed(state, &committed_from(5, send("alice", "bob", "one"), 1, 1));
    assert_eq!(outcome, ApplyOutcome::MessageSent { id: MessageId::new(2) });
    assert!(effects.is_empty());
    assert_eq!(state.message_count(), 2);
}

// ============================================================================
// Determinism & Idempotence Laws
// ============================================================================

#[test]
fn identical_command_sequences_serialize_identically() {
    let commands = vec![
        register("alice"),
        register("bob"),
        send("alice", "bob", "hi"),
        Command::MarkRead {
            username: "bob".into(),
            ids: vec![MessageId::new(1)],
        },
    ];
    let a = apply_all(commands.clone());
    let b = apply_all(commands);
    assert_eq!(a.to_snapshot_bytes(), b.to_snapshot_bytes());
}

#[test]
fn snapshot_round_trip_preserves_state() {
    let state = apply_all(vec![
        register("alice"),
        register("bob"),
        send("alice", "bob", "hi"),
    ]);
    let bytes = state.to_snapshot_bytes();
    let restored = ChatState::from_snapshot_bytes(&bytes).unwrap();
    assert_eq!(state, restored);
    assert_eq!(bytes, restored.to_snapshot_bytes());
}

proptest! {
    /// MarkRead twice leaves state identical to one application.
    #[test]
    fn mark_read_is_idempotent(ids in proptest::collection::vec(1u64..6, 0..6)) {
        let base = apply_all(vec![
            register("alice"),
            register("bob"),
            send("alice", "bob", "a"),
            send("alice", "bob", "b"),
            send("alice", "bob", "c"),
        ]);
        let ids: Vec<MessageId> = ids.into_iter().map(MessageId::new).collect();
        let cmd = Command::MarkRead { username: "bob".into(), ids };

        let (once, _, _) = apply_committed(base.clone(), &committed(6, cmd.clone()));
        let (twice, _, _) = apply_committed(once.clone(), &committed(7, cmd));
        prop_assert_eq!(once.to_snapshot_bytes(), twice.to_snapshot_bytes());
    }

    /// DeleteMessages twice leaves state identical to one application.
    #[test]
    fn delete_messages_is_idempotent(ids in proptest::collection::vec(1u64..6, 0..6)) {
        let base = apply_all(vec![
            register("alice"),
            register("bob"),
            send("alice", "bob", "a"),
            send("alice", "bob", "b"),
            send("alice", "bob", "c"),
        ]);
        let ids: Vec<MessageId> = ids.into_iter().map(MessageId::new).collect();
        let cmd = Command::DeleteMessages { username: "bob".into(), ids };

        let (once, _, _) = apply_committed(base.clone(), &committed(6, cmd.clone()));
        let (twice, _, _) = apply_committed(once.clone(), &committed(7, cmd));
        prop_assert_eq!(once.to_snapshot_bytes(), twice.to_snapshot_bytes());
    }
}
