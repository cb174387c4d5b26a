//! Client-facing request/response schema.

use palaver_kernel::MessageRecord;
use palaver_types::{ClientId, MessageId, NodeId, RequestSeq};
use serde::{Deserialize, Serialize};

/// Wire protocol version, checked on nothing yet but carried for future
/// compatibility negotiation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Reserved request id for server-push stream events.
///
/// Ordinary requests use ids starting at 1; a response tagged with this id
/// is an unsolicited [`StreamEvent`].
pub const STREAM_EVENT_ID: u64 = 0;

// ============================================================================
// Connection Hello
// ============================================================================

/// First frame on any inbound connection, declaring what it carries.
///
/// Client connections follow with [`Request`] frames; peer connections
/// follow with consensus envelopes (framed with the generic helpers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Hello {
    Client { protocol_version: u16 },
    Peer {
        node_id: NodeId,
        protocol_version: u16,
    },
}

// ============================================================================
// Requests
// ============================================================================

/// A client request envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Caller-chosen correlation id (non-zero).
    pub id: u64,
    /// Write deduplication identity; required for effective retries of
    /// non-idempotent writes (`Register`, `SendMessage`).
    pub client: Option<(ClientId, RequestSeq)>,
    pub payload: RequestPayload,
}

/// The operations a client can invoke on any replica.
///
/// Writes are redirected to the leader via [`ErrorCode::NotLeader`]; reads
/// are served locally and labeled with the replica's applied index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestPayload {
    // Writes (replicated through the log)
    Register { username: String, password: String },
    DeleteAccount { username: String },
    SendMessage {
        sender: String,
        recipient: String,
        content: String,
    },
    DeleteMessages { username: String, ids: Vec<MessageId> },
    MarkAsRead { username: String, ids: Vec<MessageId> },

    // Reads (served from local applied state)
    Login { username: String, password: String },
    Logout { username: String },
    ListAccounts {
        pattern: String,
        page: u64,
        per_page: u64,
    },
    GetMessages { username: String, count: u64 },

    // Streaming
    StreamMessages { username: String },

    // Cluster administration
    JoinCluster {
        server_id: NodeId,
        server_address: String,
    },
    GetClusterStatus,
}

impl RequestPayload {
    /// True for operations that must go through the replicated log.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            RequestPayload::Register { .. }
                | RequestPayload::DeleteAccount { .. }
                | RequestPayload::SendMessage { .. }
                | RequestPayload::DeleteMessages { .. }
                | RequestPayload::MarkAsRead { .. }
                | RequestPayload::JoinCluster { .. }
        )
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            RequestPayload::Register { .. } => "Register",
            RequestPayload::DeleteAccount { .. } => "DeleteAccount",
            RequestPayload::SendMessage { .. } => "SendMessage",
            RequestPayload::DeleteMessages { .. } => "DeleteMessages",
            RequestPayload::MarkAsRead { .. } => "MarkAsRead",
            RequestPayload::Login { .. } => "Login",
            RequestPayload::Logout { .. } => "Logout",
            RequestPayload::ListAccounts { .. } => "ListAccounts",
            RequestPayload::GetMessages { .. } => "GetMessages",
            RequestPayload::StreamMessages { .. } => "StreamMessages",
            RequestPayload::JoinCluster { .. } => "JoinCluster",
            RequestPayload::GetClusterStatus => "GetClusterStatus",
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

/// A server response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Correlation id of the request, or [`STREAM_EVENT_ID`] for pushes.
    pub id: u64,
    pub payload: ResponsePayload,
}

/// One cluster member as reported by `GetClusterStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub id: NodeId,
    pub addr: String,
    pub voting: bool,
}

/// Response payloads.
///
/// Read responses carry `last_applied`: the replica's applied log index,
/// a staleness marker for follower reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponsePayload {
    /// Generic success.
    Ok,

    /// Typed failure, with a redirect hint where applicable.
    Error {
        code: ErrorCode,
        /// Address of the current leader, if this replica knows one.
        leader_hint: Option<String>,
    },

    /// Successful `SendMessage` with the assigned id.
    MessageSent { id: MessageId },

    /// Successful `Login`.
    LoggedIn { unread: u64, last_applied: u64 },

    /// `ListAccounts` page.
    Accounts {
        accounts: Vec<String>,
        page: u64,
        per_page: u64,
        last_applied: u64,
    },

    /// `GetMessages` result, oldest first.
    Messages {
        messages: Vec<MessageRecord>,
        last_applied: u64,
    },

    /// `GetClusterStatus` result.
    ClusterStatus {
        leader: Option<NodeId>,
        term: u64,
        members: Vec<ClusterMember>,
    },

    /// Subscription confirmed; events follow with [`STREAM_EVENT_ID`].
    Subscribed,

    /// A server-push stream event.
    Event(StreamEvent),
}

/// Events pushed on a `StreamMessages` subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEvent {
    /// A message addressed to the subscribed user was applied.
    ///
    /// Delivery is at-least-once; clients deduplicate by message id.
    NewMessage(MessageRecord),

    /// Leadership moved; the subscription is closed and the client should
    /// reconnect (to the hinted address, if present).
    LeaderChanged { leader_hint: Option<String> },
}

// ============================================================================
// Error Codes
// ============================================================================

/// Typed error kinds surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Application-level: returned verbatim to the caller.
    AlreadyExists,
    UnknownUser,
    UnknownRecipient,
    BadCredentials,

    // Transient/retryable: the client retries, possibly elsewhere.
    NotLeader,
    NoLeader,
    LeadershipLost,
    Timeout,
    Busy,

    // Safety/diagnostic.
    Compacted,
    TermStale,
    LogInconsistent,

    // Protocol.
    Malformed,
    Internal,
}

impl ErrorCode {
    /// True if the client should retry the request (possibly on another
    /// replica) rather than surface the error.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::NotLeader
                | ErrorCode::NoLeader
                | ErrorCode::LeadershipLost
                | ErrorCode::Timeout
                | ErrorCode::Busy
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use proptest::prelude::*;

    use crate::{decode_frame, encode_frame};

    #[test]
    fn request_round_trip() {
        let request = Request {
            id: 3,
            client: Some((ClientId::new(1), RequestSeq::new(9))),
            payload: RequestPayload::SendMessage {
                sender: "alice".into(),
                recipient: "bob".into(),
                content: "hi".into(),
            },
        };
        let mut buf = BytesMut::new();
        encode_frame(&request, &mut buf).unwrap();
        let decoded: Request = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, request);
    }

    proptest! {
        #[test]
        fn list_accounts_round_trips(
            pattern in ".{0,16}",
            page in 0u64..100,
            per_page in 1u64..100,
        ) {
            let request = Request {
                id: 1,
                client: None,
                payload: RequestPayload::ListAccounts { pattern, page, per_page },
            };
            let mut buf = BytesMut::new();
            encode_frame(&request, &mut buf).unwrap();
            let decoded: Request = decode_frame(&mut buf).unwrap().unwrap();
            prop_assert_eq!(decoded, request);
        }
    }
}
