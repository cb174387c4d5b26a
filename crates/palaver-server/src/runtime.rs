//! The consensus runtime: timers, persistence ordering, and the seam
//! between the pure node core and the impure world.

use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use palaver_config::PalaverConfig;
use palaver_kernel::Effect;
use palaver_raft::{
    AppliedEntry, ClusterConfig, Envelope, NodeEvent, NodeState, RaftOptions, Role, SubmitResult,
};
use palaver_storage::{DurableStore, FileStore, apply_actions};
use palaver_types::{NodeId, Timestamp};

use crate::error::ServerResult;

/// A deadline far enough away to mean "timer disarmed".
const FOREVER: Duration = Duration::from_secs(60 * 60 * 24);

/// Everything the gateway needs to react to one processed event.
pub struct ProcessedEvent {
    pub messages: Vec<Envelope>,
    pub applied: Vec<AppliedEntry>,
    pub effects: Vec<Effect>,
    pub submit: Option<SubmitResult>,
    /// Leadership view before and after, for pending-write invalidation
    /// and subscription `LeaderChanged` events.
    pub was_leader: bool,
    pub is_leader: bool,
    pub leader_before: Option<NodeId>,
    pub leader_after: Option<NodeId>,
}

/// Owns the node state machine, its durable store, and its timers.
///
/// The ordering contract lives here: persistence actions run against the
/// store before the produced messages are released to the transport. A
/// store failure is fatal and propagates out of [`NodeRuntime::process`].
pub struct NodeRuntime {
    node: Option<NodeState>,
    store: Box<dyn DurableStore>,
    rng: SmallRng,
    election_min: Duration,
    election_max: Duration,
    heartbeat_interval: Duration,
    election_deadline: Instant,
    heartbeat_deadline: Instant,
}

impl NodeRuntime {
    /// Opens the durable store and restores (or bootstraps) the node.
    pub fn open(config: &PalaverConfig) -> ServerResult<Self> {
        let node_id = NodeId::new(config.node.id);
        let mut store = FileStore::open(&config.node.data_directory, node_id)?;
        let persisted = store.load()?;

        let bootstrap = ClusterConfig::bootstrap(
            config
                .cluster
                .members
                .iter()
                .map(|m| (NodeId::new(m.id), m.addr.clone())),
        );
        let options = RaftOptions {
            snapshot_log_threshold: config.snapshot.log_threshold,
            max_entries_per_append: config.raft.max_entries_per_append,
            promotion_lag: config.snapshot.promotion_lag,
            snapshot_chunk_size: config.snapshot.chunk_size,
        };
        let node = NodeState::restore(node_id, persisted, bootstrap, options);

        Ok(Self::new(
            node,
            Box::new(store),
            Duration::from_millis(config.raft.election_timeout_min_ms),
            Duration::from_millis(config.raft.election_timeout_max_ms),
            Duration::from_millis(config.raft.heartbeat_interval_ms),
        ))
    }

    /// Builds a runtime around an existing node and store (tests use a
    /// memory store here).
    pub fn new(
        node: NodeState,
        store: Box<dyn DurableStore>,
        election_min: Duration,
        election_max: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        let now = Instant::now();
        let mut runtime = Self {
            node: Some(node),
            store,
            rng: SmallRng::from_entropy(),
            election_min,
            election_max,
            heartbeat_interval,
            election_deadline: now,
            heartbeat_deadline: now + FOREVER,
        };
        runtime.arm_election_timer();
        runtime
    }

    /// Read-only view of the node (gateway read path).
    pub fn node(&self) -> &NodeState {
        self.node.as_ref().expect("node present outside process()")
    }

    /// Feeds one event through the core and executes its output.
    pub fn process(&mut self, event: NodeEvent) -> ServerResult<ProcessedEvent> {
        let node = self.node.take().expect("node present outside process()");
        let was_leader = node.is_leader();
        let leader_before = node.current_leader();

        let (node, output) = node.process(event);

        // Durability before visibility: a vote or acknowledgement must
        // never leave this process before it is on disk.
        apply_actions(self.store.as_mut(), &output.persist)?;

        let is_leader = node.is_leader();
        let leader_after = node.current_leader();
        self.node = Some(node);

        if output.reset_election_timer {
            self.arm_election_timer();
        }
        if is_leader {
            self.election_deadline = Instant::now() + FOREVER;
            if !was_leader {
                // First heartbeat right away.
                self.heartbeat_deadline = Instant::now();
            }
        } else {
            self.heartbeat_deadline = Instant::now() + FOREVER;
            if was_leader {
                self.arm_election_timer();
            }
        }

        Ok(ProcessedEvent {
            messages: output.messages,
            applied: output.applied,
            effects: output.effects,
            submit: output.submit,
            was_leader,
            is_leader,
            leader_before,
            leader_after,
        })
    }

    /// Fires any timers that are due, returning their processed outputs.
    pub fn fire_due_timers(&mut self, now: Instant) -> ServerResult<Vec<ProcessedEvent>> {
        let mut outputs = Vec::new();

        if now >= self.election_deadline {
            self.arm_election_timer();
            outputs.push(self.process(NodeEvent::ElectionTimeout)?);
        }

        if now >= self.heartbeat_deadline && self.node().is_leader() {
            self.heartbeat_deadline = now + self.heartbeat_interval;
            outputs.push(self.process(NodeEvent::HeartbeatTimeout {
                now: Timestamp::now(),
            })?);
        }

        Ok(outputs)
    }

    /// The next instant the poll loop must wake for.
    pub fn next_deadline(&self) -> Instant {
        self.election_deadline.min(self.heartbeat_deadline)
    }

    /// Re-arms the election timer with fresh jitter from `[min, max]`.
    ///
    /// Randomization lives here, outside the pure core, so the simulator
    /// can substitute its own seeded scheduling.
    fn arm_election_timer(&mut self) {
        if self.node.as_ref().is_some_and(NodeState::is_leader) {
            return;
        }
        let window = self.election_max.saturating_sub(self.election_min);
        let jitter = if window.is_zero() {
            Duration::ZERO
        } else {
            Duration::from_millis(self.rng.gen_range(0..=window.as_millis() as u64))
        };
        self.election_deadline = Instant::now() + self.election_min + jitter;
    }

    /// Role right now, for logging.
    pub fn role(&self) -> Role {
        self.node().role()
    }
}
