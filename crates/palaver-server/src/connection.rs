//! Connection state management.

use std::io::{self, Read, Write};
use std::time::Instant;

use bytes::BytesMut;
use mio::Token;
use mio::net::TcpStream;
use serde::Serialize;
use serde::de::DeserializeOwned;

use palaver_types::{NodeId, Username};
use palaver_wire::{WireError, decode_frame, encode_frame};

use crate::error::{ServerError, ServerResult};

const READ_CHUNK: usize = 16 * 1024;

/// What an accepted connection turned out to carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Hello frame not seen yet.
    Pending,
    /// A chat client.
    Client,
    /// Another replica's consensus traffic.
    Peer(NodeId),
}

/// State of one TCP connection (client or inbound peer).
pub struct Connection {
    /// Unique token for this connection.
    pub token: Token,
    /// TCP stream.
    pub stream: TcpStream,
    /// Read buffer; frames are decoded incrementally from the front.
    pub read_buf: BytesMut,
    /// Write buffer; flushed whenever the socket is writable.
    pub write_buf: BytesMut,
    /// Whether the connection should be torn down after flushing.
    pub closing: bool,
    /// Last activity, for idle diagnostics.
    pub last_activity: Instant,
    /// What this connection carries (resolved by the hello frame).
    pub kind: ConnectionKind,
    /// Username authenticated on this connection via `Login`.
    ///
    /// `StreamMessages` is only honored for the authenticated user.
    pub authenticated: Option<Username>,
}

impl Connection {
    pub fn new(token: Token, stream: TcpStream) -> Self {
        Self {
            token,
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            closing: false,
            last_activity: Instant::now(),
            kind: ConnectionKind::Pending,
            authenticated: None,
        }
    }

    /// Reads all available bytes into the buffer.
    ///
    /// Returns `Ok(true)` if the peer closed the connection cleanly.
    pub fn fill_read_buf(&mut self) -> ServerResult<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    self.last_activity = Instant::now();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(ServerError::Io(e)),
            }
        }
    }

    /// Decodes the next complete frame, if any.
    pub fn next_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>, WireError> {
        decode_frame(&mut self.read_buf)
    }

    /// Queues a framed message for sending.
    pub fn send<T: Serialize>(&mut self, message: &T) -> Result<(), WireError> {
        encode_frame(message, &mut self.write_buf)
    }

    /// Flushes as much of the write buffer as the socket accepts.
    ///
    /// Returns `Ok(true)` when the buffer is fully drained.
    pub fn flush(&mut self) -> ServerResult<bool> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => return Err(ServerError::ConnectionClosed),
                Ok(n) => {
                    let _ = self.write_buf.split_to(n);
                    self.last_activity = Instant::now();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(ServerError::Io(e)),
            }
        }
        Ok(true)
    }

    /// True if there is buffered output waiting on socket writability.
    pub fn wants_write(&self) -> bool {
        !self.write_buf.is_empty()
    }
}
