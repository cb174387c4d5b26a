//! # palaver-kernel: Functional core of Palaver
//!
//! The kernel is the pure, deterministic chat state machine. It receives
//! committed commands and produces state changes plus effects to execute.
//!
//! ## Key Principles
//!
//! - **No IO**: the kernel never touches disk, network, or any external resource
//! - **No clocks**: timestamps travel inside committed entries
//! - **No randomness**: same input always produces same output
//! - **Pure functions**: `apply_committed(state, committed) -> (state, outcome, effects)`
//!
//! These properties are what make replication sound: every replica applies
//! the same committed entries in the same order and arrives at the same
//! state, byte for byte.
//!
//! ## Architecture
//!
//! - [`command`]: Commands that enter the replicated log
//! - [`state`]: In-memory chat state (users, messages, inboxes, sessions)
//! - [`kernel`]: The `apply_committed` function that ties it all together
//! - [`effects`]: Effects for the runtime to execute (stream deliveries, membership)

pub mod command;
pub mod effects;
pub mod kernel;
pub mod state;

#[cfg(test)]
mod tests;

// Re-export commonly used items
pub use command::{Command, Committed};
pub use effects::Effect;
pub use kernel::{ApplyOutcome, ChatError, KernelError, apply_committed};
pub use state::{ChatState, MessageRecord, Session, UserRecord};
