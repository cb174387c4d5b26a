//! Integration tests for palaver-raft.
//!
//! These drive a single [`NodeState`] (and occasionally a hand-wired pair)
//! through protocol events. Whole-cluster behavior - partitions, crashes,
//! catch-up races - lives in palaver-sim.

use palaver_kernel::{ApplyOutcome, Command};
use palaver_types::{LogIndex, NodeId, Term, Timestamp, hash_password};

use crate::config::ClusterConfig;
use crate::message::{
    AppendRequest, AppendResponse, ConflictHint, Payload, SnapshotAck, VoteRequest, VoteResponse,
    msg,
};
use crate::node::{NodeEvent, NodeOutput, NodeState, PersistAction, RaftOptions, Role, SubmitResult};

// ============================================================================
// Helper Functions
// ============================================================================

fn id(n: u64) -> NodeId {
    NodeId::new(n)
}

fn config3() -> ClusterConfig {
    ClusterConfig::bootstrap((0..3).map(|i| (id(i), format!("127.0.0.1:{}", 7000 + i))))
}

fn config1() -> ClusterConfig {
    ClusterConfig::bootstrap([(id(0), "127.0.0.1:7000".to_string())])
}

fn register_cmd(name: &str) -> Command {
    Command::Register {
        username: name.into(),
        password_hash: hash_password("pw"),
    }
}

fn client_event(cmd: Command) -> NodeEvent {
    NodeEvent::ClientCommand {
        command: cmd,
        client: None,
        now: Timestamp::new(1000),
    }
}

fn rpc(from: u64, payload: Payload) -> NodeEvent {
    // Target is implicit: the node under test.
    NodeEvent::Rpc(msg(id(from), id(0), payload))
}

/// Elects node 0 leader of a three-node cluster with one granted ballot.
fn leader_of_three() -> NodeState {
    let node = NodeState::new(id(0), config3(), RaftOptions::default());
    let (node, out) = node.process(NodeEvent::ElectionTimeout);
    assert_eq!(node.role(), Role::Candidate);
    assert_eq!(out.messages.len(), 2, "vote requests to both peers");

    let (node, out) = node.process(rpc(
        1,
        Payload::VoteResponse(VoteResponse {
            term: Term::new(1),
            granted: true,
        }),
    ));
    assert_eq!(node.role(), Role::Leader);
    assert_eq!(out.messages.len(), 2, "leader announces with empty appends");
    node
}

fn success_response(term: u64, match_index: u64) -> Payload {
    Payload::AppendResponse(AppendResponse {
        term: Term::new(term),
        success: true,
        match_index: LogIndex::new(match_index),
        conflict: None,
    })
}

// ============================================================================
// Elections
// ============================================================================

#[test]
fn empty_log_election() {
    // All logs empty: any voter can win.
    let node = leader_of_three();
    assert_eq!(node.current_term(), Term::new(1));
    assert_eq!(node.log().last_index(), LogIndex::ZERO);
}

#[test]
fn election_persists_vote_before_ballots() {
    let node = NodeState::new(id(0), config3(), RaftOptions::default());
    let (_, out) = node.process(NodeEvent::ElectionTimeout);
    assert!(matches!(
        out.persist.first(),
        Some(PersistAction::SaveMetadata {
            term,
            voted_for: Some(v),
            ..
        }) if *term == Term::new(1) && *v == id(0)
    ));
    assert!(out.reset_election_timer);
}

#[test]
fn vote_granted_once_per_term_and_idempotently() {
    let node = NodeState::new(id(0), config3(), RaftOptions::default());
    let request = VoteRequest {
        term: Term::new(1),
        candidate: id(1),
        last_log_index: LogIndex::ZERO,
        last_log_term: Term::ZERO,
    };

    let (node, out) = node.process(rpc(1, Payload::VoteRequest(request)));
    let granted = |out: &NodeOutput| {
        matches!(
            out.messages[0].payload,
            Payload::VoteResponse(VoteResponse { granted: true, .. })
        )
    };
    assert!(granted(&out));

    // Same (term, candidate) again: must also be granted.
    let (node, out) = node.process(rpc(1, Payload::VoteRequest(request)));
    assert!(granted(&out));

    // Different candidate, same term: rejected.
    let other = VoteRequest {
        candidate: id(2),
        ..request
    };
    let (_, out) = node.process(rpc(2, Payload::VoteRequest(other)));
    assert!(matches!(
        out.messages[0].payload,
        Payload::VoteResponse(VoteResponse { granted: false, .. })
    ));
}

#[test]
fn vote_rejected_when_candidate_log_behind() {
    // Give node 0 one entry by making it leader of a single-node cluster.
    let node = NodeState::new(id(0), config1(), RaftOptions::default());
    let (node, _) = node.process(NodeEvent::ElectionTimeout);
    let (node, _) = node.process(client_event(register_cmd("alice")));
    assert_eq!(node.log().last_index(), LogIndex::new(1));

    // A candidate with an empty log but a higher term is behind.
    let request = VoteRequest {
        term: Term::new(5),
        candidate: id(1),
        last_log_index: LogIndex::ZERO,
        last_log_term: Term::ZERO,
    };
    let (node, out) = node.process(rpc(1, Payload::VoteRequest(request)));

    // Higher term adopted (and leadership dropped), but no vote granted.
    assert_eq!(node.current_term(), Term::new(5));
    assert_eq!(node.role(), Role::Follower);
    assert!(matches!(
        out.messages[0].payload,
        Payload::VoteResponse(VoteResponse { granted: false, .. })
    ));
}

#[test]
fn learner_never_campaigns() {
    let node = NodeState::new(id(0), config1(), RaftOptions::default());
    let (node, _) = node.process(NodeEvent::ElectionTimeout);
    let (node, _) = node.process(client_event(Command::AddServerNonVoting {
        id: id(9),
        addr: "127.0.0.1:7009".into(),
    }));
    assert!(node.config().contains(id(9)));

    // Build the learner node and fire its election timer: nothing happens.
    let learner = NodeState::restore(
        id(9),
        crate::node::PersistedState {
            members: node.config().to_members(),
            ..Default::default()
        },
        config1(),
        RaftOptions::default(),
    );
    let (learner, out) = learner.process(NodeEvent::ElectionTimeout);
    assert_eq!(learner.role(), Role::Follower);
    assert!(out.messages.is_empty());
    assert_eq!(learner.current_term(), Term::ZERO);
}

// ============================================================================
// Single-Node Cluster
// ============================================================================

#[test]
fn single_node_auto_commits_every_append() {
    let node = NodeState::new(id(0), config1(), RaftOptions::default());
    let (node, _) = node.process(NodeEvent::ElectionTimeout);
    assert_eq!(node.role(), Role::Leader, "self-majority elects instantly");

    let (node, out) = node.process(client_event(register_cmd("alice")));
    assert!(matches!(
        out.submit,
        Some(SubmitResult::Accepted { index, .. }) if index == LogIndex::new(1)
    ));
    assert_eq!(node.commit_index(), LogIndex::new(1));
    assert_eq!(node.last_applied(), LogIndex::new(1));
    assert_eq!(out.applied.len(), 1);
    assert_eq!(out.applied[0].outcome, ApplyOutcome::Ok);
    assert!(node.chat().user_exists("alice"));
}

// ============================================================================
// Replication
// ============================================================================

#[test]
fn write_replicates_and_commits_on_majority() {
    let node = leader_of_three();
    let (node, out) = node.process(client_event(register_cmd("alice")));

    assert!(matches!(out.submit, Some(SubmitResult::Accepted { .. })));
    // Entry persisted locally before the appends go out.
    assert!(out
        .persist
        .iter()
        .any(|p| matches!(p, PersistAction::AppendEntries { .. })));
    // Not committed yet: only the leader holds it.
    assert_eq!(node.commit_index(), LogIndex::ZERO);

    // One follower acks: majority of three.
    let (node, out) = node.process(rpc(1, success_response(1, 1)));
    assert_eq!(node.commit_index(), LogIndex::new(1));
    assert_eq!(out.applied.len(), 1);
    assert!(node.chat().user_exists("alice"));
}

#[test]
fn follower_accepts_appends_and_advances_commit_on_empty_heartbeat() {
    let node = NodeState::new(id(1), config3(), RaftOptions::default());

    let entry = {
        // Borrow a real entry from a single-node leader's log.
        let leader = NodeState::new(id(0), config1(), RaftOptions::default());
        let (leader, _) = leader.process(NodeEvent::ElectionTimeout);
        let (leader, _) = leader.process(client_event(register_cmd("alice")));
        leader.log().entry_at(LogIndex::new(1)).unwrap().clone()
    };

    let append = AppendRequest {
        term: Term::new(1),
        leader: id(0),
        prev_log_index: LogIndex::ZERO,
        prev_log_term: Term::ZERO,
        entries: vec![entry],
        leader_commit: LogIndex::ZERO,
    };
    let (node, out) = node
        .process(NodeEvent::Rpc(msg(id(0), id(1), Payload::Append(append))));

    assert!(out.reset_election_timer);
    assert!(matches!(
        out.messages[0].payload,
        Payload::AppendResponse(AppendResponse { success: true, match_index, .. })
            if match_index == LogIndex::new(1)
    ));
    // Leader has not announced the commit yet.
    assert_eq!(node.commit_index(), LogIndex::ZERO);
    assert!(!node.chat().user_exists("alice"));

    // Empty heartbeat with a higher leader_commit commits and applies.
    let heartbeat = AppendRequest {
        term: Term::new(1),
        leader: id(0),
        prev_log_index: LogIndex::new(1),
        prev_log_term: Term::new(1),
        entries: Vec::new(),
        leader_commit: LogIndex::new(1),
    };
    let (node, out) = node
        .process(NodeEvent::Rpc(msg(id(0), id(1), Payload::Append(heartbeat))));
    assert_eq!(node.commit_index(), LogIndex::new(1));
    assert_eq!(node.last_applied(), LogIndex::new(1));
    assert_eq!(out.applied.len(), 1);
    assert!(node.chat().user_exists("alice"));
}

#[test]
fn short_log_rejection_carries_zero_term_hint() {
    let node = NodeState::new(id(1), config3(), RaftOptions::default());
    let append = AppendRequest {
        term: Term::new(1),
        leader: id(0),
        prev_log_index: LogIndex::new(5),
        prev_log_term: Term::new(1),
        entries: Vec::new(),
        leader_commit: LogIndex::ZERO,
    };
    let (_, out) = node.process(NodeEvent::Rpc(msg(id(0), id(1), Payload::Append(append))));
    match out.messages[0].payload {
        Payload::AppendResponse(AppendResponse {
            success: false,
            conflict: Some(ConflictHint { term, first_index }),
            ..
        }) => {
            assert_eq!(term, Term::ZERO);
            assert_eq!(first_index, LogIndex::new(1));
        }
        ref other => panic!("expected rejection with hint, got {other:?}"),
    }
}

#[test]
fn stale_term_append_is_rejected() {
    let node = leader_of_three();
    assert_eq!(node.current_term(), Term::new(1));

    // Push the node into term 3 via a vote request.
    let (node, _) = node.process(rpc(
        2,
        Payload::VoteRequest(VoteRequest {
            term: Term::new(3),
            candidate: id(2),
            last_log_index: LogIndex::ZERO,
            last_log_term: Term::ZERO,
        }),
    ));
    assert_eq!(node.current_term(), Term::new(3));

    // An append from the term-1 leader is now stale.
    let append = AppendRequest {
        term: Term::new(1),
        leader: id(0),
        prev_log_index: LogIndex::ZERO,
        prev_log_term: Term::ZERO,
        entries: Vec::new(),
        leader_commit: LogIndex::ZERO,
    };
    let (_, out) = node.process(NodeEvent::Rpc(msg(id(1), id(0), Payload::Append(append))));
    assert!(matches!(
        out.messages[0].payload,
        Payload::AppendResponse(AppendResponse { success: false, term, .. })
            if term == Term::new(3)
    ));
}

#[test]
fn old_term_entries_commit_only_under_a_current_term_entry() {
    // Leader in term 1 appends an entry that never reaches a majority.
    let node = leader_of_three();
    let (node, _) = node.process(client_event(register_cmd("alice")));
    assert_eq!(node.commit_index(), LogIndex::ZERO);

    // Deposed and re-elected in term 3.
    let (node, _) = node.process(rpc(
        1,
        Payload::VoteResponse(VoteResponse {
            term: Term::new(2),
            granted: false,
        }),
    ));
    assert_eq!(node.role(), Role::Follower);
    let (node, _) = node.process(NodeEvent::ElectionTimeout);
    let (node, _) = node.process(rpc(
        1,
        Payload::VoteResponse(VoteResponse {
            term: Term::new(3),
            granted: true,
        }),
    ));
    assert_eq!(node.role(), Role::Leader);
    assert_eq!(node.current_term(), Term::new(3));

    // A follower now acknowledges the term-1 entry. Majority holds it, but
    // the leader must not count replicas for an old-term entry.
    let (node, _) = node.process(rpc(1, success_response(3, 1)));
    assert_eq!(node.commit_index(), LogIndex::ZERO, "old-term entry not committed");

    // The new leader's term-3 no-op (appended at election to anchor the
    // old suffix) plus a fresh write commit everything below them.
    assert_eq!(node.log().last_index(), LogIndex::new(2), "alice + noop");
    let (node, _) = node.process(client_event(register_cmd("bob")));
    let (node, out) = node.process(rpc(1, success_response(3, 3)));
    assert_eq!(node.commit_index(), LogIndex::new(3));
    assert_eq!(out.applied.len(), 3, "alice, noop, bob apply in order");
    assert!(node.chat().user_exists("alice"));
    assert!(node.chat().user_exists("bob"));
}

#[test]
fn conflict_hint_skips_a_whole_term() {
    let node = leader_of_three();
    let (node, _) = node.process(client_event(register_cmd("a")));
    let (node, _) = node.process(client_event(register_cmd("b")));

    // Follower reports a conflicting term the leader never had.
    let reject = Payload::AppendResponse(AppendResponse {
        term: Term::new(1),
        success: false,
        match_index: LogIndex::ZERO,
        conflict: Some(ConflictHint {
            term: Term::new(7),
            first_index: LogIndex::new(1),
        }),
    });
    let (node, out) = node.process(rpc(1, reject));

    // next_index jumped to the hint and a new append went out from there.
    match &out.messages[0].payload {
        Payload::Append(request) => {
            assert_eq!(request.prev_log_index, LogIndex::ZERO);
            assert_eq!(request.entries.len(), 2);
        }
        other => panic!("expected immediate re-append, got {other:?}"),
    }
    drop(node);
}

// ============================================================================
// Membership
// ============================================================================

#[test]
fn learner_is_promoted_after_a_full_caught_up_round() {
    let node = NodeState::new(id(0), config1(), RaftOptions::default());
    let (node, _) = node.process(NodeEvent::ElectionTimeout);
    let (node, out) = node.process(client_event(Command::AddServerNonVoting {
        id: id(9),
        addr: "127.0.0.1:7009".into(),
    }));
    assert!(matches!(out.submit, Some(SubmitResult::Accepted { .. })));
    assert!(node.config().contains(id(9)));
    assert!(!node.config().is_voter(id(9)));
    // Quorum still the single original voter.
    assert_eq!(node.config().quorum_size(), 1);

    // The learner replicates everything.
    let last = node.log().last_index();
    let (node, _) = node.process(rpc(9, success_response(1, last.as_u64())));

    // Two consecutive caught-up heartbeat rounds trigger the promotion.
    let hb = NodeEvent::HeartbeatTimeout {
        now: Timestamp::new(2000),
    };
    let (node, _) = node.process(hb.clone());
    assert!(!node.config().is_voter(id(9)), "one round is not enough");
    let (node, _) = node.process(hb);

    // Promotion entry appended and (single-voter quorum) committed.
    assert!(node.config().is_voter(id(9)));
    assert_eq!(node.config().quorum_size(), 2);
}

#[test]
fn only_one_membership_change_in_flight() {
    let node = leader_of_three();
    let (node, out) = node.process(client_event(Command::AddServerNonVoting {
        id: id(9),
        addr: "127.0.0.1:7009".into(),
    }));
    assert!(matches!(out.submit, Some(SubmitResult::Accepted { .. })));

    // Uncommitted: a second change is refused.
    let (node, out) = node.process(client_event(Command::AddServerNonVoting {
        id: id(10),
        addr: "127.0.0.1:7010".into(),
    }));
    assert!(matches!(
        out.submit,
        Some(SubmitResult::MembershipChangeInFlight)
    ));

    // Once committed, changes are accepted again.
    let (node, _) = node.process(rpc(1, success_response(1, 1)));
    assert!(node.config().contains(id(9)));
    let (_, out) = node.process(client_event(Command::AddServerNonVoting {
        id: id(10),
        addr: "127.0.0.1:7010".into(),
    }));
    assert!(matches!(out.submit, Some(SubmitResult::Accepted { .. })));
}

#[test]
fn writes_on_follower_return_leader_hint() {
    let node = NodeState::new(id(1), config3(), RaftOptions::default());

    // No leader known yet.
    let (node, out) = node.process(client_event(register_cmd("alice")));
    assert!(matches!(
        out.submit,
        Some(SubmitResult::NotLeader { hint: None })
    ));

    // Learn the leader from a heartbeat.
    let heartbeat = AppendRequest {
        term: Term::new(1),
        leader: id(0),
        prev_log_index: LogIndex::ZERO,
        prev_log_term: Term::ZERO,
        entries: Vec::new(),
        leader_commit: LogIndex::ZERO,
    };
    let (node, _) = node.process(NodeEvent::Rpc(msg(id(0), id(1), Payload::Append(heartbeat))));
    let (_, out) = node.process(client_event(register_cmd("alice")));
    assert!(matches!(
        out.submit,
        Some(SubmitResult::NotLeader { hint: Some(h) }) if h == id(0)
    ));
}

// ============================================================================
// Snapshots
// ============================================================================

fn small_snapshot_options() -> RaftOptions {
    RaftOptions {
        snapshot_log_threshold: 4,
        snapshot_chunk_size: 64, // force multi-chunk streams
        ..RaftOptions::default()
    }
}

#[test]
fn log_compacts_at_threshold() {
    let node = NodeState::new(id(0), config1(), small_snapshot_options());
    let (mut node, _) = node.process(NodeEvent::ElectionTimeout);

    for i in 0..5 {
        let boundary_before = node.log().snapshot_last_index();
        let (next, out) = node.process(client_event(register_cmd(&format!("user{i}"))));
        node = next;
        if node.log().snapshot_last_index() > boundary_before {
            assert!(out
                .persist
                .iter()
                .any(|p| matches!(p, PersistAction::InstallSnapshot { .. })));
        }
    }

    assert!(node.log().snapshot_last_index() >= LogIndex::new(4));
    assert_eq!(node.last_applied(), LogIndex::new(5));
    assert_eq!(node.chat().user_count(), 5);
    // Compacted prefix is unreadable.
    assert!(node.log().entry_at(LogIndex::new(1)).is_err());
}

#[test]
fn lagging_peer_catches_up_via_snapshot_stream() {
    // Leader: single voter, compacted log, then a learner joins.
    let node = NodeState::new(id(0), config1(), small_snapshot_options());
    let (mut node, _) = node.process(NodeEvent::ElectionTimeout);
    for i in 0..5 {
        let (next, _) = node.process(client_event(register_cmd(&format!("user{i}"))));
        node = next;
    }
    assert!(node.log().snapshot_last_index() > LogIndex::ZERO);

    let (node, _) = node.process(client_event(Command::AddServerNonVoting {
        id: id(9),
        addr: "127.0.0.1:7009".into(),
    }));

    // The learner's log is empty; its rejection pushes next_index below the
    // compacted prefix, which switches the leader to snapshot transfer.
    let reject = Payload::AppendResponse(AppendResponse {
        term: Term::new(1),
        success: false,
        match_index: LogIndex::ZERO,
        conflict: Some(ConflictHint {
            term: Term::ZERO,
            first_index: LogIndex::new(1),
        }),
    });
    let (mut leader, out) = node.process(rpc(9, reject));
    assert!(leader.streaming_to(id(9)));
    let mut chunk_msg = out
        .messages
        .into_iter()
        .find(|m| matches!(m.payload, Payload::SnapshotChunk(_)))
        .expect("first snapshot chunk");

    // Learner node, shuttling chunks and acks by hand.
    let mut learner = NodeState::restore(
        id(9),
        crate::node::PersistedState::default(),
        ClusterConfig::bootstrap([(id(9), "127.0.0.1:7009".to_string())]),
        small_snapshot_options(),
    );

    for _ in 0..256 {
        let (next_learner, out) = learner.process(NodeEvent::Rpc(chunk_msg));
        learner = next_learner;
        let ack = out
            .messages
            .into_iter()
            .find_map(|m| match m.payload {
                Payload::SnapshotAck(ack) => Some(ack),
                _ => None,
            })
            .expect("learner acks every chunk");
        if ack.installed {
            break;
        }
        let (next_leader, out) = leader.process(rpc(9, Payload::SnapshotAck(ack)));
        leader = next_leader;
        chunk_msg = out
            .messages
            .into_iter()
            .find(|m| matches!(m.payload, Payload::SnapshotChunk(_)))
            .expect("next snapshot chunk");
    }

    // Learner state now mirrors the leader's applied state: the stream was
    // captured fresh at the leader's last_applied, not the old boundary.
    assert_eq!(learner.last_applied(), leader.last_applied());
    assert_eq!(learner.chat().user_count(), 5);
    assert_eq!(
        learner.chat().to_snapshot_bytes(),
        leader.chat().to_snapshot_bytes(),
    );
    assert!(learner.config().contains(id(9)));
}

// ============================================================================
// Restart
// ============================================================================

#[test]
fn restore_comes_back_as_follower_in_persisted_term() {
    let node = NodeState::new(id(0), config1(), RaftOptions::default());
    let (node, _) = node.process(NodeEvent::ElectionTimeout);
    let (node, _) = node.process(client_event(register_cmd("alice")));

    let persisted = crate::node::PersistedState {
        current_term: node.current_term(),
        voted_for: Some(id(0)),
        members: node.config().to_members(),
        snapshot: None,
        entries: node.log().entries().to_vec(),
    };
    let restored = NodeState::restore(id(0), persisted, config1(), RaftOptions::default());

    assert_eq!(restored.role(), Role::Follower);
    assert_eq!(restored.current_term(), node.current_term());
    assert_eq!(restored.log().last_index(), node.log().last_index());
    // Commit knowledge is not persisted; it is re-learned on re-election.
    assert_eq!(restored.commit_index(), LogIndex::ZERO);
    assert!(!restored.chat().user_exists("alice"));

    // Re-elect and the entry re-commits and re-applies.
    let (restored, _) = restored.process(NodeEvent::ElectionTimeout);
    assert_eq!(restored.role(), Role::Leader);
    assert!(restored.chat().user_exists("alice"));
}
