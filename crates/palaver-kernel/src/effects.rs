//! Effects produced by the kernel.
//!
//! Effects represent side effects that the runtime must execute after a
//! command is applied. The kernel is pure - it produces effects but never
//! executes them directly.

use palaver_types::Username;
use serde::{Deserialize, Serialize};

use crate::state::MessageRecord;

/// An effect to be executed by the runtime.
///
/// Effects are produced by [`crate::kernel::apply_committed`] and describe
/// actions that must be performed outside the pure kernel. Every replica
/// produces the same effects; each replica's gateway decides what to do
/// with them (typically: feed its local subscription streams).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    /// A message was delivered to a recipient's inbox.
    ///
    /// The gateway enqueues this on every active subscription for the
    /// recipient. Delivery is at-least-once; clients deduplicate by id.
    MessageDelivered { message: MessageRecord },

    /// An account was removed.
    ///
    /// The gateway tears down any subscription streams for the user.
    AccountDeleted { username: Username },
}
