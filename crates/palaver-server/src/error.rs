//! Server error types.

use palaver_storage::StorageError;
use palaver_wire::WireError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur during server operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Wire protocol error.
    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    /// Durable-store error. Fatal for the node: the durability promises
    /// the protocol makes cannot be kept on a failing store.
    #[error("durable store error: {0}")]
    Storage(#[from] StorageError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Bind failed.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: String,
        source: std::io::Error,
    },

    /// Connection closed by the remote end.
    #[error("connection closed")]
    ConnectionClosed,

    /// Configuration problem discovered at startup.
    #[error("configuration error: {0}")]
    Config(String),
}
