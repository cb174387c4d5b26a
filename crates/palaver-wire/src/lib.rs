//! # palaver-wire: Binary wire protocol for Palaver
//!
//! Length-prefixed postcard frames over a plain byte stream. The same
//! framing carries three kinds of traffic:
//!
//! - client requests and responses ([`Request`] / [`Response`])
//! - server-push stream events ([`StreamEvent`], delivered as responses
//!   with the reserved id [`STREAM_EVENT_ID`])
//! - replica-to-replica consensus envelopes (any `Serialize` type via the
//!   generic [`frame`] helpers)
//!
//! A frame is a 4-byte big-endian length followed by the postcard body,
//! bounded by [`MAX_FRAME_SIZE`].

mod frame;
mod protocol;

pub use frame::{FRAME_HEADER_SIZE, MAX_FRAME_SIZE, decode_frame, encode_frame};
pub use protocol::{
    ClusterMember, ErrorCode, Hello, PROTOCOL_VERSION, Request, RequestPayload, Response,
    ResponsePayload, STREAM_EVENT_ID, StreamEvent,
};

use thiserror::Error;

/// Wire protocol errors.
#[derive(Debug, Error)]
pub enum WireError {
    /// Frame length field exceeds [`MAX_FRAME_SIZE`].
    #[error("frame of {0} bytes exceeds maximum")]
    FrameTooLarge(usize),

    /// Frame body failed to decode.
    #[error("malformed frame: {0}")]
    Malformed(postcard::Error),

    /// Serialization failure on the send path (a bug, not bad input).
    #[error("encode failed: {0}")]
    Encode(postcard::Error),
}
