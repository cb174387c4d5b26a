//! # palaver-server: Palaver server daemon
//!
//! One process per replica, hosting two roles behind a single listener:
//!
//! - the **consensus runtime**: drives the pure [`palaver_raft::NodeState`]
//!   with timers and peer traffic, executing its persistence actions
//!   against the durable store *before* sending the messages that promise
//!   them
//! - the **client gateway**: dispatches client requests (redirecting
//!   writes to the leader), resolves pending writes as entries commit and
//!   apply, and fans applied messages out to subscription streams
//!
//! ## Architecture
//!
//! The server uses `mio` for non-blocking I/O with a poll-based event
//! loop - explicit control flow, no async runtime. Sockets feed a bounded
//! work queue; draining it is the node's single-threaded serializer
//! region, so role transitions, log mutations, and commit advancement
//! never race.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        palaver-server                         │
//! │  ┌──────────┐   ┌─────────────┐   ┌─────────┐   ┌─────────┐  │
//! │  │ Listener │ → │ Connections │ → │ Bounded │ → │ Runtime │  │
//! │  │  (TCP)   │   │ (mio poll)  │   │  queue  │   │ Gateway │  │
//! │  └──────────┘   └─────────────┘   └─────────┘   └─────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```

pub mod bounded_queue;
mod connection;
mod error;
mod gateway;
mod runtime;
mod server;
mod subscriptions;


pub use bounded_queue::{BoundedQueue, PushResult};
pub use error::{ServerError, ServerResult};
pub use runtime::{NodeRuntime, ProcessedEvent};
pub use server::Server;
pub use subscriptions::SubscriptionTable;
