//! # palaver-storage: Durable store for Palaver
//!
//! Atomic persistence of the three things a replica must never lose:
//! the metadata record (term, vote, membership), the log, and the
//! snapshot.
//!
//! ## Durability contract
//!
//! Every trait method is durable before it returns: once a call comes
//! back `Ok`, the data survives a process crash. The consensus runtime
//! relies on this ordering - persistence actions are executed before the
//! protocol messages that promise them are sent.
//!
//! ## File layout
//!
//! ```text
//! {data_dir}/node-{id}/
//! ├── metadata.pal      <- postcard metadata record (temp+rename+fsync)
//! ├── snapshot.pal      <- postcard snapshot (temp+rename+fsync)
//! └── log.pal           <- appended length-prefixed, checksummed entries
//! ```
//!
//! A torn record at the log tail (crash mid-append) is detected by its
//! checksum and discarded with a warning; corruption anywhere else is
//! fatal for the node.

mod file;
mod memory;
mod store;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use store::{DurableStore, apply_actions};

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the durable store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O failure. Fatal for the node: the durability contract cannot be
    /// upheld on a store that fails writes.
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Record or file contents failed to decode.
    #[error("corrupt store: {0}")]
    Corrupt(String),

    /// Serialization failure (a bug, not an environmental condition).
    #[error("encode failed: {0}")]
    Encode(#[from] postcard::Error),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
