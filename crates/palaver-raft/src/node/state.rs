//! Node state structure and the event-processing entry point.
//!
//! [`NodeState`] is the core state of a consensus node. It is pure (no
//! I/O), cloneable for simulation testing, and all transitions go through
//! [`NodeState::process`].

use std::collections::{BTreeMap, BTreeSet};

use palaver_kernel::{ChatState, Command, Committed, apply_committed};
use palaver_types::{LogIndex, NodeId, Term, Timestamp};

use crate::config::{ClusterConfig, Member};
use crate::log::{Log, LogEntry, Snapshot};
use crate::message::Envelope;

use super::{
    AppliedEntry, NodeEvent, NodeOutput, PersistAction, PersistedState, RaftOptions, Role,
    SubmitResult,
};

// ============================================================================
// Leader-side Peer Progress
// ============================================================================

/// Per-peer replication bookkeeping, maintained only while leader.
#[derive(Debug, Clone)]
pub(crate) struct PeerProgress {
    /// Next log index to send to this peer.
    pub next_index: LogIndex,
    /// Highest index known replicated on this peer. Monotonic per term.
    pub match_index: LogIndex,
    /// In-flight snapshot stream, if the peer fell below the compacted prefix.
    pub snapshot: Option<OutgoingSnapshot>,
    /// Consecutive heartbeat rounds a learner has been caught up.
    pub caught_up_rounds: u32,
}

impl PeerProgress {
    pub(crate) fn new(next_index: LogIndex) -> Self {
        Self {
            next_index,
            match_index: LogIndex::ZERO,
            snapshot: None,
            caught_up_rounds: 0,
        }
    }
}

/// Leader-side state of one snapshot stream.
#[derive(Debug, Clone)]
pub(crate) struct OutgoingSnapshot {
    pub snapshot: Snapshot,
    /// Next byte offset to send.
    pub offset: usize,
}

/// Follower-side accumulation of one snapshot stream.
///
/// Identified by `(term, last_included_index)`; discarded when either
/// changes mid-stream.
#[derive(Debug, Clone)]
pub(crate) struct IncomingSnapshot {
    pub term: Term,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub members: Vec<Member>,
    pub buf: Vec<u8>,
}

// ============================================================================
// Node State
// ============================================================================

/// The state of a consensus node.
///
/// # State Categories
///
/// 1. **Identity**: `id`, `config`, `options`
/// 2. **Persistent**: `current_term`, `voted_for` (durable via
///    [`PersistAction`]s mirrored by the runtime), the log
/// 3. **Volatile**: `commit_index`, `last_applied`, `role`, vote tally,
///    peer progress
/// 4. **Application**: the chat state machine
#[derive(Debug, Clone)]
pub struct NodeState {
    // Identity
    id: NodeId,
    options: RaftOptions,
    pub(crate) config: ClusterConfig,

    // Persistent state (mirrored to the durable store by the runtime)
    pub(crate) current_term: Term,
    pub(crate) voted_for: Option<NodeId>,
    pub(crate) log: Log,

    // Volatile state
    pub(crate) commit_index: LogIndex,
    pub(crate) last_applied: LogIndex,
    pub(crate) role: Role,
    /// Last node observed acting as leader, for client redirects.
    pub(crate) known_leader: Option<NodeId>,
    /// Votes received in the current candidacy.
    pub(crate) votes_received: BTreeSet<NodeId>,
    /// Replication progress per peer (leader only).
    pub(crate) peers: BTreeMap<NodeId, PeerProgress>,
    /// Log index of the uncommitted membership entry, if one exists.
    pub(crate) membership_in_flight: Option<LogIndex>,
    /// Snapshot stream being received (follower only).
    pub(crate) incoming_snapshot: Option<IncomingSnapshot>,

    // Application state
    pub(crate) chat: ChatState,
}

impl NodeState {
    /// Creates a fresh node with an empty log.
    pub fn new(id: NodeId, config: ClusterConfig, options: RaftOptions) -> Self {
        assert!(config.contains(id), "node must be in the cluster config");
        Self {
            id,
            options,
            config,
            current_term: Term::ZERO,
            voted_for: None,
            log: Log::new(),
            commit_index: LogIndex::ZERO,
            last_applied: LogIndex::ZERO,
            role: Role::Follower,
            known_leader: None,
            votes_received: BTreeSet::new(),
            peers: BTreeMap::new(),
            membership_in_flight: None,
            incoming_snapshot: None,
            chat: ChatState::new(),
        }
    }

    /// Rebuilds a node from its durable store after a restart.
    ///
    /// The node comes back as a follower in its last persisted term, with
    /// the chat state restored from the snapshot (if any) and `commit_index`
    /// at the snapshot boundary; everything above re-commits through the
    /// normal protocol.
    pub fn restore(
        id: NodeId,
        persisted: PersistedState,
        fallback_config: ClusterConfig,
        options: RaftOptions,
    ) -> Self {
        let config = if persisted.members.is_empty() {
            fallback_config
        } else {
            ClusterConfig::from_members(persisted.members)
        };

        let (log, chat, boundary) = match persisted.snapshot {
            Some(snapshot) => {
                let chat = snapshot
                    .restore_state()
                    .expect("durable snapshot must decode; corruption is fatal at startup");
                let boundary = snapshot.last_included_index;
                let log = Log::from_parts(
                    boundary,
                    snapshot.last_included_term,
                    persisted.entries,
                );
                (log, chat, boundary)
            }
            None => (
                Log::from_parts(LogIndex::ZERO, Term::ZERO, persisted.entries),
                ChatState::new(),
                LogIndex::ZERO,
            ),
        };

        tracing::info!(
            node = %id,
            term = %persisted.current_term,
            last_index = %log.last_index(),
            snapshot_boundary = %boundary,
            "restored node state from durable store"
        );

        Self {
            id,
            options,
            config,
            current_term: persisted.current_term,
            voted_for: persisted.voted_for,
            log,
            commit_index: boundary,
            last_applied: boundary,
            role: Role::Follower,
            known_leader: None,
            votes_received: BTreeSet::new(),
            peers: BTreeMap::new(),
            membership_in_flight: None,
            incoming_snapshot: None,
            chat,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// The staleness marker attached to read responses.
    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Read-only view of the applied chat state (gateway read path).
    pub fn chat(&self) -> &ChatState {
        &self.chat
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    /// The leader this node would redirect clients to, if known.
    pub fn current_leader(&self) -> Option<NodeId> {
        if self.role == Role::Leader {
            Some(self.id)
        } else {
            self.known_leader
        }
    }

    pub(crate) fn options(&self) -> &RaftOptions {
        &self.options
    }

    // ========================================================================
    // Event Processing (Main Entry Point)
    // ========================================================================

    /// Processes one event and returns the new state and output.
    ///
    /// This is the only entry point; the caller (runtime or simulator) is
    /// responsible for executing the output - persistence first, then
    /// messages.
    pub fn process(self, event: NodeEvent) -> (Self, NodeOutput) {
        let mut out = NodeOutput::empty();
        let state = match event {
            NodeEvent::Rpc(envelope) => self.on_rpc(envelope, &mut out),
            NodeEvent::ElectionTimeout => self.on_election_timeout(&mut out),
            NodeEvent::HeartbeatTimeout { now } => self.on_heartbeat_timeout(now, &mut out),
            NodeEvent::ClientCommand {
                command,
                client,
                now,
            } => self.on_client_command(command, client, now, &mut out),
        };
        state.check_invariants();
        (state, out)
    }

    fn on_rpc(self, envelope: Envelope, out: &mut NodeOutput) -> Self {
        use crate::message::Payload;

        // Unknown senders are tolerated for VoteRequest/Append: a server
        // added by a membership entry we have not applied yet must still be
        // able to reach us. Responses from unknown peers are dropped.
        let from = envelope.from;
        match envelope.payload {
            Payload::VoteRequest(req) => self.on_vote_request(from, req, out),
            Payload::VoteResponse(resp) => self.on_vote_response(from, resp, out),
            Payload::Append(req) => self.on_append_request(from, req, out),
            Payload::AppendResponse(resp) => self.on_append_response(from, resp, out),
            Payload::SnapshotChunk(chunk) => self.on_snapshot_chunk(from, chunk, out),
            Payload::SnapshotAck(ack) => self.on_snapshot_ack(from, ack, out),
        }
    }

    // ========================================================================
    // Term Discipline
    // ========================================================================

    /// Adopts a higher observed term: step down, clear the vote, persist.
    ///
    /// Every RPC handler calls this before processing, which realizes the
    /// "any role, term > current → follower" row of the role table.
    pub(crate) fn observe_term(mut self, term: Term, out: &mut NodeOutput) -> Self {
        if term <= self.current_term {
            return self;
        }
        tracing::info!(
            node = %self.id,
            old_term = %self.current_term,
            new_term = %term,
            role = %self.role,
            "observed higher term, stepping down"
        );
        self.current_term = term;
        self.voted_for = None;
        self.step_down();
        out.persist.push(self.save_metadata_action());
        self
    }

    /// Reverts to follower, dropping leader/candidate bookkeeping.
    pub(crate) fn step_down(&mut self) {
        self.role = Role::Follower;
        self.votes_received.clear();
        self.peers.clear();
        self.known_leader = None;
    }

    /// The metadata record as it must appear on disk right now.
    pub(crate) fn save_metadata_action(&self) -> PersistAction {
        PersistAction::SaveMetadata {
            term: self.current_term,
            voted_for: self.voted_for,
            members: self.config.to_members(),
        }
    }

    // ========================================================================
    // Client Commands
    // ========================================================================

    fn on_client_command(
        mut self,
        command: Command,
        client: Option<(palaver_types::ClientId, palaver_types::RequestSeq)>,
        now: Timestamp,
        out: &mut NodeOutput,
    ) -> Self {
        if self.role != Role::Leader {
            out.submit = Some(SubmitResult::NotLeader {
                hint: self.current_leader(),
            });
            return self;
        }

        if command.is_membership_change() && self.membership_in_flight.is_some() {
            tracing::warn!(
                node = %self.id,
                in_flight = ?self.membership_in_flight,
                "rejecting membership change, one already uncommitted"
            );
            out.submit = Some(SubmitResult::MembershipChangeInFlight);
            return self;
        }

        let index = self.append_local(command, client, now, out);
        out.submit = Some(SubmitResult::Accepted {
            term: self.current_term,
            index,
        });

        // Replicate immediately rather than waiting for the next heartbeat.
        let append_msgs = self.append_messages_for_all();
        out.messages.extend(append_msgs);

        // Single-voter clusters commit on their own majority.
        self = self.advance_commit(out);
        self
    }

    /// Appends a leader-originated entry to the local log.
    pub(crate) fn append_local(
        &mut self,
        command: Command,
        client: Option<(palaver_types::ClientId, palaver_types::RequestSeq)>,
        now: Timestamp,
        out: &mut NodeOutput,
    ) -> LogIndex {
        assert!(self.role == Role::Leader, "only the leader appends");

        let index = self.log.last_index().next();
        let entry = LogEntry {
            term: self.current_term,
            index,
            timestamp: now,
            command,
            client,
        };

        if entry.command.is_membership_change() {
            self.membership_in_flight = Some(index);
        }

        self.log.append(entry.clone());
        out.persist.push(PersistAction::AppendEntries {
            entries: vec![entry],
        });
        index
    }

    // ========================================================================
    // Commit & Apply
    // ========================================================================

    /// Leader commit rule: advance to the highest `N > commit_index` with
    /// majority `match_index >= N` **and** `log[N].term == current_term`.
    ///
    /// The term restriction is the safety clause: entries from older terms
    /// are never committed by counting replicas, only indirectly by a
    /// current-term entry committing above them.
    pub(crate) fn advance_commit(mut self, out: &mut NodeOutput) -> Self {
        if self.role != Role::Leader {
            return self;
        }

        let quorum = self.config.quorum_size();
        let mut candidate = self.log.last_index();
        while candidate > self.commit_index {
            // The leader's own log always holds `candidate`; peers count
            // through their acknowledged match index. Only voters count.
            let replicas = self
                .config
                .voters()
                .filter(|m| {
                    m.id == self.id
                        || self
                            .peers
                            .get(&m.id)
                            .is_some_and(|p| p.match_index >= candidate)
                })
                .count();

            if replicas >= quorum {
                match self.log.term_at(candidate) {
                    Ok(t) if t == self.current_term => {
                        self.commit_index = candidate;
                        tracing::debug!(
                            node = %self.id,
                            commit = %candidate,
                            "advanced commit index"
                        );
                        break;
                    }
                    // Old-term entry: cannot commit by counting. Keep
                    // scanning lower indices? No - anything below is older
                    // still. Stop.
                    _ => break,
                }
            }
            candidate = candidate.prev();
        }

        self.apply_ready(out)
    }

    /// Applies everything between `last_applied` and `commit_index`,
    /// strictly in index order, exactly once.
    pub(crate) fn apply_ready(mut self, out: &mut NodeOutput) -> Self {
        while self.last_applied < self.commit_index {
            let index = self.last_applied.next();
            let entry = self
                .log
                .entry_at(index)
                .expect("committed entries below the boundary are impossible: \
                         compaction never passes last_applied")
                .clone();

            let committed = Committed {
                index,
                timestamp: entry.timestamp,
                command: entry.command.clone(),
                client: entry.client,
            };
            let (chat, outcome, effects) = apply_committed(std::mem::take(&mut self.chat), &committed);
            self.chat = chat;
            self.last_applied = index;

            self.apply_membership(&entry, out);

            out.applied.push(AppliedEntry {
                index,
                term: entry.term,
                outcome,
                client: entry.client,
            });
            out.effects.extend(effects);
        }

        self.maybe_capture_snapshot(out);
        self
    }

    /// Interprets membership commands at apply time.
    ///
    /// The promoting entry was committed under the pre-promotion quorum;
    /// from here on the new member participates.
    fn apply_membership(&mut self, entry: &LogEntry, out: &mut NodeOutput) {
        match &entry.command {
            Command::AddServerNonVoting { id, addr } => {
                tracing::info!(node = %self.id, new_server = %id, addr = %addr, "adding non-voting server");
                self.config.add_learner(*id, addr.clone());
                if self.role == Role::Leader && *id != self.id {
                    self.peers
                        .entry(*id)
                        .or_insert_with(|| PeerProgress::new(self.log.last_index().next()));
                }
                out.persist.push(self.save_metadata_action());
            }
            Command::PromoteServer { id } => {
                tracing::info!(node = %self.id, server = %id, "promoting server to voter");
                self.config.promote(*id);
                out.persist.push(self.save_metadata_action());
            }
            _ => return,
        }
        if self.membership_in_flight == Some(entry.index) {
            self.membership_in_flight = None;
        }
    }

    /// Captures a snapshot once the log outgrows the configured threshold.
    ///
    /// Capture happens at `last_applied` - the highest point the chat state
    /// reflects - and compacts the log through it. Entries above stay.
    fn maybe_capture_snapshot(&mut self, out: &mut NodeOutput) {
        if self.log.len() < self.options.snapshot_log_threshold {
            return;
        }
        if self.last_applied <= self.log.snapshot_last_index() {
            return;
        }

        let boundary = self.last_applied;
        let boundary_term = self
            .log
            .term_at(boundary)
            .expect("last_applied is always within the log");

        let snapshot = Snapshot::capture(
            boundary,
            boundary_term,
            self.config.to_members(),
            &self.chat,
        );

        tracing::info!(
            node = %self.id,
            boundary = %boundary,
            entries_before = self.log.len(),
            "capturing snapshot and compacting log"
        );

        self.log.compact_through(boundary, boundary_term);
        out.persist.push(PersistAction::InstallSnapshot {
            snapshot,
            discard_through: boundary,
        });
    }

    // ========================================================================
    // Invariants
    // ========================================================================

    fn check_invariants(&self) {
        debug_assert!(
            self.last_applied <= self.commit_index,
            "last_applied {} > commit_index {}",
            self.last_applied,
            self.commit_index
        );
        debug_assert!(
            self.commit_index <= self.log.last_index(),
            "commit_index {} > last_index {}",
            self.commit_index,
            self.log.last_index()
        );
        debug_assert!(
            self.log.snapshot_last_index() <= self.last_applied,
            "compaction passed last_applied"
        );
    }
}
