//! # palaver-types: Core types for Palaver
//!
//! This crate contains shared types used across the Palaver system:
//! - Consensus positions ([`Term`], [`LogIndex`])
//! - Node identity ([`NodeId`])
//! - Chat entities ([`MessageId`], [`Username`])
//! - Client request identity ([`ClientId`], [`RequestSeq`])
//! - Temporal types ([`Timestamp`])
//! - Credential hashing ([`PasswordHash`], [`hash_password`])

use std::fmt::{self, Display};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ============================================================================
// Consensus Positions - All Copy (cheap 8-byte values)
// ============================================================================

/// A logical election epoch.
///
/// Terms increase monotonically per node: a node bumps its term when it
/// starts an election and adopts any higher term it observes. The current
/// term is persisted before any vote is granted in it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Term(u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn new(term: u64) -> Self {
        Self(term)
    }

    /// Returns the next term (for starting an election).
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Term {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Term> for u64 {
    fn from(term: Term) -> Self {
        term.0
    }
}

/// Position of an entry within the replicated log.
///
/// Indices are one-based and contiguous: the first entry has index 1.
/// Index 0 is the sentinel position "before the log" used by empty logs
/// and by `prev_log_index` checks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct LogIndex(u64);

impl LogIndex {
    /// The sentinel position before the first entry.
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn new(index: u64) -> Self {
        Self(index)
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the previous index, saturating at the sentinel.
    pub fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for LogIndex {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<LogIndex> for u64 {
    fn from(index: LogIndex) -> Self {
        index.0
    }
}

// ============================================================================
// Node Identity
// ============================================================================

/// Unique identifier for a server replica in the cluster.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeId(u64);

impl NodeId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<NodeId> for u64 {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

// ============================================================================
// Chat Entities
// ============================================================================

/// Unique identifier for a chat message.
///
/// Message ids are assigned deterministically by the state machine at apply
/// time, so every replica computes the same id for the same committed entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct MessageId(u64);

impl MessageId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg#{}", self.0)
    }
}

impl From<u64> for MessageId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A chat account name.
///
/// Usernames are plain strings; uniqueness is enforced by the state machine
/// at apply time, not by this type.
pub type Username = String;

// ============================================================================
// Client Request Identity
// ============================================================================

/// Unique identifier for a client session, used for write deduplication.
///
/// A client picks an id once (per process lifetime) and tags every write
/// with `(client_id, seq)`. The state machine records the last applied
/// sequence per client and suppresses replays.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ClientId(u64);

impl ClientId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Monotone per-client request sequence number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RequestSeq(u64);

impl RequestSeq {
    pub const ZERO: RequestSeq = RequestSeq(0);

    pub fn new(seq: u64) -> Self {
        Self(seq)
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for RequestSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Temporal Types
// ============================================================================

/// Milliseconds since the Unix epoch.
///
/// Timestamps on chat records are assigned by the leader when it appends the
/// command to the log, and travel inside the entry. Replicas never consult
/// their own clocks while applying, which keeps apply deterministic.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Reads the current wall clock.
    ///
    /// Only the leader calls this, at append time. Apply code must use the
    /// timestamp carried in the log entry.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self(millis)
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

// ============================================================================
// Credential Hashing
// ============================================================================

/// An opaque password digest.
///
/// Clients send plaintext over the wire (transport security is out of scope
/// here); the gateway hashes before the credential ever reaches the log, so
/// neither the replicated log nor snapshots contain plaintext passwords.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordHash([u8; 32]);

impl PasswordHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Display for PasswordHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First 4 bytes only; full digests don't belong in logs.
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}…",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// Hashes a plaintext password into its opaque digest.
pub fn hash_password(password: &str) -> PasswordHash {
    PasswordHash(*blake3::hash(password.as_bytes()).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_ordering_and_next() {
        let t1 = Term::new(1);
        let t2 = t1.next();
        assert!(t2 > t1);
        assert_eq!(t2.as_u64(), 2);
        assert_eq!(Term::ZERO.next(), Term::new(1));
    }

    #[test]
    fn log_index_sentinel() {
        assert!(LogIndex::ZERO.is_zero());
        assert_eq!(LogIndex::ZERO.next(), LogIndex::new(1));
        assert_eq!(LogIndex::ZERO.prev(), LogIndex::ZERO);
        assert_eq!(LogIndex::new(5).prev(), LogIndex::new(4));
    }

    #[test]
    fn password_hash_is_deterministic() {
        assert_eq!(hash_password("secret"), hash_password("secret"));
        assert_ne!(hash_password("secret"), hash_password("Secret"));
    }

    #[test]
    fn display_formats() {
        assert_eq!(NodeId::new(2).to_string(), "node#2");
        assert_eq!(MessageId::new(7).to_string(), "msg#7");
        assert_eq!(ClientId::new(9).to_string(), "client#9");
    }
}
