//! The simulated cluster: nodes, clock, transport, and fault injection.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_chacha::rand_core::SeedableRng;

use palaver_kernel::{ApplyOutcome, Command};
use palaver_raft::{
    ClusterConfig, Envelope, NodeEvent, NodeState, RaftOptions, Role, SubmitResult,
};
use palaver_storage::{DurableStore, MemoryStore, apply_actions};
use palaver_types::{ClientId, LogIndex, NodeId, RequestSeq, Timestamp};

use crate::invariants::InvariantTracker;

/// Simulator timing and consensus tuning.
#[derive(Debug, Clone)]
pub struct SimOptions {
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub raft: RaftOptions,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 100,
            election_timeout_max_ms: 200,
            heartbeat_interval_ms: 30,
            raft: RaftOptions::default(),
        }
    }
}

/// One simulated replica.
struct SimNode {
    /// `None` while crashed; the store survives.
    state: Option<NodeState>,
    store: MemoryStore,
    inbox: VecDeque<Envelope>,
    election_deadline: u64,
    heartbeat_deadline: u64,
    /// Outcomes of applied entries, by index.
    applied: BTreeMap<u64, ApplyOutcome>,
}

impl SimNode {
    fn alive(&self) -> bool {
        self.state.is_some()
    }
}

/// A whole simulated cluster.
///
/// Time is milliseconds on a virtual clock; [`SimCluster::step`] advances
/// it by one. Message sends land in the destination inbox and are
/// processed on the destination's next turn.
pub struct SimCluster {
    clock_ms: u64,
    rng: ChaCha8Rng,
    options: SimOptions,
    bootstrap: ClusterConfig,
    nodes: BTreeMap<NodeId, SimNode>,
    /// Undirected blocked pairs (partitions).
    blocked: BTreeSet<(NodeId, NodeId)>,
    tracker: InvariantTracker,
}

impl SimCluster {
    /// Builds an `n`-node cluster of voters with the given seed.
    pub fn new(n: u64, options: SimOptions, seed: u64) -> Self {
        let bootstrap = ClusterConfig::bootstrap(
            (0..n).map(|i| (NodeId::new(i), format!("sim://node-{i}"))),
        );
        let mut cluster = Self {
            clock_ms: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
            options,
            bootstrap: bootstrap.clone(),
            nodes: BTreeMap::new(),
            blocked: BTreeSet::new(),
            tracker: InvariantTracker::new(),
        };
        for i in 0..n {
            let id = NodeId::new(i);
            let state = NodeState::new(id, bootstrap.clone(), cluster.options.raft.clone());
            let election_deadline = cluster.draw_election_deadline();
            cluster.nodes.insert(
                id,
                SimNode {
                    state: Some(state),
                    store: MemoryStore::new(),
                    inbox: VecDeque::new(),
                    election_deadline,
                    heartbeat_deadline: u64::MAX,
                    applied: BTreeMap::new(),
                },
            );
        }
        cluster
    }

    pub fn clock_ms(&self) -> u64 {
        self.clock_ms
    }

    fn draw_election_deadline(&mut self) -> u64 {
        let window =
            self.options.election_timeout_min_ms..=self.options.election_timeout_max_ms;
        self.clock_ms + self.rng.gen_range(window)
    }

    // ========================================================================
    // Stepping
    // ========================================================================

    /// Advances the virtual clock by one millisecond: delivers queued
    /// messages, fires due timers, checks every invariant.
    pub fn step(&mut self) {
        self.clock_ms += 1;

        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in ids {
            self.turn(id);
        }

        self.check_invariants();
    }

    /// Runs the cluster for `ms` virtual milliseconds.
    pub fn run_ms(&mut self, ms: u64) {
        for _ in 0..ms {
            self.step();
        }
    }

    /// One node's turn: drain inbox, then timers.
    fn turn(&mut self, id: NodeId) {
        if !self.nodes[&id].alive() {
            return;
        }

        // Drain the messages that were queued before this turn.
        let pending = self.nodes.get_mut(&id).map_or(0, |n| n.inbox.len());
        for _ in 0..pending {
            let Some(envelope) = self.nodes.get_mut(&id).and_then(|n| n.inbox.pop_front())
            else {
                break;
            };
            self.process(id, NodeEvent::Rpc(envelope));
            if !self.nodes[&id].alive() {
                return;
            }
        }

        let node = &self.nodes[&id];
        if self.clock_ms >= node.election_deadline {
            let deadline = self.draw_election_deadline();
            if let Some(n) = self.nodes.get_mut(&id) {
                n.election_deadline = deadline;
            }
            self.process(id, NodeEvent::ElectionTimeout);
        }

        let node = &self.nodes[&id];
        let is_leader = node
            .state
            .as_ref()
            .is_some_and(|s| s.role() == Role::Leader);
        if is_leader && self.clock_ms >= node.heartbeat_deadline {
            if let Some(n) = self.nodes.get_mut(&id) {
                n.heartbeat_deadline = self.clock_ms + self.options.heartbeat_interval_ms;
            }
            self.process(
                id,
                NodeEvent::HeartbeatTimeout {
                    now: Timestamp::new(self.clock_ms),
                },
            );
        }
    }

    /// Feeds one event through a node, honoring the persistence-first
    /// contract, then routes its messages.
    fn process(&mut self, id: NodeId, event: NodeEvent) -> Option<SubmitResult> {
        let sim_node = self.nodes.get_mut(&id)?;
        let state = sim_node.state.take()?;
        let was_leader = state.is_leader();

        let (state, output) = state.process(event);

        // Same ordering as the production runtime: durable first.
        apply_actions(&mut sim_node.store, &output.persist)
            .expect("memory store cannot fail");

        for applied in &output.applied {
            sim_node
                .applied
                .insert(applied.index.as_u64(), applied.outcome.clone());
        }

        // Re-arm timers the way the production runtime does.
        let is_leader = state.is_leader();
        let current_election = self.nodes[&id].election_deadline;
        let current_heartbeat = self.nodes[&id].heartbeat_deadline;
        let new_election = if is_leader {
            u64::MAX // leaders do not campaign against themselves
        } else if output.reset_election_timer || current_election == u64::MAX {
            self.draw_election_deadline()
        } else {
            current_election
        };
        let new_heartbeat = if is_leader {
            if was_leader {
                current_heartbeat
            } else {
                self.clock_ms // first beat right away
            }
        } else {
            u64::MAX
        };

        let sim_node = self.nodes.get_mut(&id).expect("node exists");
        sim_node.election_deadline = new_election;
        sim_node.heartbeat_deadline = new_heartbeat;
        sim_node.state = Some(state);

        // Record applied-entry dedup identities for the P6 check.
        for applied in &output.applied {
            self.tracker.record_applied(applied);
        }

        self.route(id, output.messages);
        output.submit
    }

    /// Queues messages into destination inboxes, dropping across
    /// partitions and to crashed nodes.
    fn route(&mut self, from: NodeId, messages: Vec<Envelope>) {
        for envelope in messages {
            let to = envelope.to;
            if self.is_blocked(from, to) {
                continue;
            }
            if let Some(dest) = self.nodes.get_mut(&to) {
                if dest.alive() {
                    dest.inbox.push_back(envelope);
                }
            }
        }
    }

    fn is_blocked(&self, a: NodeId, b: NodeId) -> bool {
        let key = if a <= b { (a, b) } else { (b, a) };
        self.blocked.contains(&key)
    }

    // ========================================================================
    // Client Interface
    // ========================================================================

    /// Submits a command to a specific node, as its gateway would.
    pub fn submit(
        &mut self,
        id: NodeId,
        command: Command,
        client: Option<(ClientId, RequestSeq)>,
    ) -> Option<SubmitResult> {
        let now = Timestamp::new(self.clock_ms);
        self.process(
            id,
            NodeEvent::ClientCommand {
                command,
                client,
                now,
            },
        )
    }

    /// Submits to the current leader and runs until the entry applies.
    ///
    /// Panics if no leader emerges or the entry fails to commit within a
    /// generous window; scenario tests treat that as failure.
    pub fn write_ok(
        &mut self,
        command: Command,
        client: Option<(ClientId, RequestSeq)>,
    ) -> ApplyOutcome {
        let leader = self.run_until_leader();
        match self.submit(leader, command, client) {
            Some(SubmitResult::Accepted { index, .. }) => {
                let deadline = self.clock_ms + 10_000;
                while self.clock_ms < deadline {
                    self.step();
                    if let Some(outcome) = self
                        .nodes
                        .get(&leader)
                        .and_then(|n| n.applied.get(&index.as_u64()))
                    {
                        return outcome.clone();
                    }
                }
                panic!("write at index {index} did not apply within 10s of sim time");
            }
            other => panic!("submit to leader {leader} not accepted: {other:?}"),
        }
    }

    /// The current unique leader among live nodes, if any.
    ///
    /// "Unique" by highest term: a deposed leader that has not yet heard
    /// of its successor does not count.
    pub fn leader(&self) -> Option<NodeId> {
        self.nodes
            .iter()
            .filter_map(|(id, n)| n.state.as_ref().map(|s| (id, s)))
            .filter(|(_, s)| s.role() == Role::Leader)
            .max_by_key(|(_, s)| s.current_term())
            .map(|(id, _)| *id)
    }

    /// Runs until a leader exists and returns it.
    pub fn run_until_leader(&mut self) -> NodeId {
        let deadline = self.clock_ms + 60_000;
        while self.clock_ms < deadline {
            if let Some(leader) = self.leader() {
                return leader;
            }
            self.step();
        }
        panic!("no leader elected within 60s of sim time");
    }

    /// Runs until the predicate holds, up to `max_ms`.
    pub fn run_until(&mut self, max_ms: u64, mut pred: impl FnMut(&SimCluster) -> bool) -> bool {
        let deadline = self.clock_ms + max_ms;
        while self.clock_ms < deadline {
            if pred(self) {
                return true;
            }
            self.step();
        }
        pred(self)
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// The live node's state. Panics if crashed.
    pub fn node(&self, id: NodeId) -> &NodeState {
        self.nodes[&id]
            .state
            .as_ref()
            .unwrap_or_else(|| panic!("{id} is crashed"))
    }

    pub fn is_alive(&self, id: NodeId) -> bool {
        self.nodes[&id].alive()
    }

    /// Live nodes, in id order.
    pub fn live_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.alive())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Outcome of the applied entry at `index` on `id`, if applied.
    pub fn applied_outcome(&self, id: NodeId, index: LogIndex) -> Option<&ApplyOutcome> {
        self.nodes[&id].applied.get(&index.as_u64())
    }

    // ========================================================================
    // Fault Injection
    // ========================================================================

    /// Adds a fresh, empty node to the simulation as a pure learner.
    ///
    /// The node knows the existing members (its operator configured them)
    /// but is not among them, so it never campaigns; it waits to be added
    /// via an `AddServerNonVoting` entry and replicated to.
    pub fn add_node(&mut self, id: NodeId) -> NodeId {
        let deadline = self.draw_election_deadline();
        let state = NodeState::restore(
            id,
            palaver_raft::PersistedState::default(),
            self.bootstrap.clone(),
            self.options.raft.clone(),
        );
        self.nodes.insert(
            id,
            SimNode {
                state: Some(state),
                store: MemoryStore::new(),
                inbox: VecDeque::new(),
                election_deadline: deadline,
                heartbeat_deadline: u64::MAX,
                applied: BTreeMap::new(),
            },
        );
        id
    }

    /// Crashes a node: state and in-flight messages are lost, the durable
    /// store survives.
    pub fn crash(&mut self, id: NodeId) {
        let node = self.nodes.get_mut(&id).expect("node exists");
        node.state = None;
        node.inbox.clear();
        tracing::info!(node = %id, t = self.clock_ms, "sim: crash");
        self.tracker.forget_node(id);
    }

    /// Restarts a crashed node from its durable store.
    pub fn restart(&mut self, id: NodeId) {
        let deadline = self.draw_election_deadline();
        let node = self.nodes.get_mut(&id).expect("node exists");
        assert!(node.state.is_none(), "{id} is not crashed");

        let persisted = node.store.load().expect("memory store cannot fail");
        let state = NodeState::restore(
            id,
            persisted,
            self.bootstrap.clone(),
            self.options.raft.clone(),
        );
        node.state = Some(state);
        node.election_deadline = deadline;
        node.heartbeat_deadline = u64::MAX;
        node.applied.clear();
        tracing::info!(node = %id, t = self.clock_ms, "sim: restart");
    }

    /// Blocks traffic between two nodes (both directions).
    pub fn block(&mut self, a: NodeId, b: NodeId) {
        let key = if a <= b { (a, b) } else { (b, a) };
        self.blocked.insert(key);
    }

    /// Cuts a node off from every other node.
    pub fn isolate(&mut self, id: NodeId) {
        let others: Vec<NodeId> = self.nodes.keys().copied().filter(|n| *n != id).collect();
        for other in others {
            self.block(id, other);
        }
    }

    /// Removes every partition.
    pub fn heal_all(&mut self) {
        self.blocked.clear();
    }

    // ========================================================================
    // Invariants
    // ========================================================================

    fn check_invariants(&mut self) {
        let live: Vec<(NodeId, &NodeState)> = self
            .nodes
            .iter()
            .filter_map(|(id, n)| n.state.as_ref().map(|s| (*id, s)))
            .collect();
        self.tracker.check(self.clock_ms, &live);
    }

    /// Terms ever observed with a leader, for assertions on P2.
    pub fn tracker(&self) -> &InvariantTracker {
        &self.tracker
    }
}

/// Convergence helper used by scenario tests.
impl SimCluster {
    /// Runs until every live node has applied through the leader's commit
    /// index.
    pub fn run_until_converged(&mut self, max_ms: u64) -> bool {
        self.run_until(max_ms, |c| {
            let Some(leader) = c.leader() else {
                return false;
            };
            let target = c.node(leader).commit_index();
            c.live_nodes()
                .iter()
                .all(|id| c.node(*id).last_applied() >= target)
        })
    }
}
