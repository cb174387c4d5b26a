//! # palaver-client: Blocking client for Palaver
//!
//! A thin synchronous client used by tests and tools. It implements the
//! redirect contract - writes answered with `NotLeader` are retried
//! against the hinted leader - and tags every write with a stable
//! `(client_id, seq)` pair so server-side deduplication makes retries
//! safe.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use thiserror::Error;

use palaver_kernel::MessageRecord;
use palaver_types::{ClientId, MessageId, RequestSeq};
use palaver_wire::{
    ErrorCode, Hello, PROTOCOL_VERSION, Request, RequestPayload, Response, ResponsePayload,
    STREAM_EVENT_ID, StreamEvent, WireError, decode_frame, encode_frame,
};

/// How many leader redirects to chase before giving up.
const REDIRECT_LIMIT: usize = 8;

/// Pause before retrying when no replica knows a leader.
const NO_LEADER_BACKOFF: Duration = Duration::from_millis(200);

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("server error: {code}")]
    Server {
        code: ErrorCode,
        leader_hint: Option<String>,
    },

    #[error("unexpected response variant")]
    UnexpectedResponse,

    #[error("gave up after {0} leader redirects")]
    RedirectLoop(usize),

    #[error("connection closed by server")]
    Closed,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// A blocking connection to one Palaver replica.
pub struct Client {
    stream: TcpStream,
    read_buf: BytesMut,
    next_id: u64,
    client_id: ClientId,
    next_seq: RequestSeq,
    /// Stream events that arrived while waiting for a reply.
    events: VecDeque<StreamEvent>,
}

impl Client {
    /// Connects and sends the client hello.
    pub fn connect(addr: &str) -> ClientResult<Self> {
        // Derived from wall time: good enough for a process-lifetime id;
        // callers needing stability across restarts use `with_client_id`.
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        Self::connect_with_id(addr, ClientId::new(nanos))
    }

    /// Connects with an explicit dedup identity.
    pub fn connect_with_id(addr: &str, client_id: ClientId) -> ClientResult<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let mut client = Self {
            stream,
            read_buf: BytesMut::new(),
            next_id: 1,
            client_id,
            next_seq: RequestSeq::new(1),
            events: VecDeque::new(),
        };
        client.send_frame(&Hello::Client {
            protocol_version: PROTOCOL_VERSION,
        })?;
        Ok(client)
    }

    fn send_frame<T: serde::Serialize>(&mut self, message: &T) -> ClientResult<()> {
        let mut buf = BytesMut::new();
        encode_frame(message, &mut buf)?;
        self.stream.write_all(&buf)?;
        Ok(())
    }

    /// Reads until one complete `Response` frame arrives.
    fn read_response(&mut self) -> ClientResult<Response> {
        loop {
            if let Some(response) = decode_frame::<Response>(&mut self.read_buf)? {
                if response.id == STREAM_EVENT_ID {
                    if let ResponsePayload::Event(event) = response.payload {
                        self.events.push_back(event);
                    }
                    continue;
                }
                return Ok(response);
            }
            let mut chunk = [0u8; 16 * 1024];
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(ClientError::Closed);
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Sends one request and waits for its reply. No retries.
    pub fn call(&mut self, payload: RequestPayload) -> ClientResult<ResponsePayload> {
        let client = payload.is_write().then(|| {
            let seq = self.next_seq;
            self.next_seq = self.next_seq.next();
            (self.client_id, seq)
        });
        self.call_tagged(payload, client)
    }

    fn call_tagged(
        &mut self,
        payload: RequestPayload,
        client: Option<(ClientId, RequestSeq)>,
    ) -> ClientResult<ResponsePayload> {
        let id = self.next_id;
        self.next_id += 1;
        self.send_frame(&Request {
            id,
            client,
            payload,
        })?;
        let response = self.read_response()?;
        Ok(response.payload)
    }

    /// Sends a write, following leader redirects and retrying with the
    /// same sequence number so dedup suppresses double execution.
    pub fn write(&mut self, payload: RequestPayload) -> ClientResult<ResponsePayload> {
        let tag = Some({
            let seq = self.next_seq;
            self.next_seq = self.next_seq.next();
            (self.client_id, seq)
        });

        let mut hops = 0;
        loop {
            match self.call_tagged(payload.clone(), tag)? {
                ResponsePayload::Error {
                    code,
                    leader_hint,
                } if code.is_retryable() => {
                    hops += 1;
                    if hops > REDIRECT_LIMIT {
                        return Err(ClientError::RedirectLoop(hops));
                    }
                    match leader_hint {
                        Some(addr) => {
                            tracing::debug!(%addr, %code, "following leader redirect");
                            self.reconnect(&addr)?;
                        }
                        None => std::thread::sleep(NO_LEADER_BACKOFF),
                    }
                }
                other => return Ok(other),
            }
        }
    }

    /// Reconnects to a different replica, keeping the dedup identity.
    pub fn reconnect(&mut self, addr: &str) -> ClientResult<()> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        self.stream = stream;
        self.read_buf.clear();
        self.events.clear();
        self.send_frame(&Hello::Client {
            protocol_version: PROTOCOL_VERSION,
        })
    }

    // ========================================================================
    // Convenience Methods
    // ========================================================================

    pub fn register(&mut self, username: &str, password: &str) -> ClientResult<()> {
        match self.write(RequestPayload::Register {
            username: username.into(),
            password: password.into(),
        })? {
            ResponsePayload::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Logs in, returning the unread message count.
    pub fn login(&mut self, username: &str, password: &str) -> ClientResult<u64> {
        match self.call(RequestPayload::Login {
            username: username.into(),
            password: password.into(),
        })? {
            ResponsePayload::LoggedIn { unread, .. } => Ok(unread),
            other => Err(unexpected(other)),
        }
    }

    pub fn send_message(
        &mut self,
        sender: &str,
        recipient: &str,
        content: &str,
    ) -> ClientResult<MessageId> {
        match self.write(RequestPayload::SendMessage {
            sender: sender.into(),
            recipient: recipient.into(),
            content: content.into(),
        })? {
            ResponsePayload::MessageSent { id } => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    pub fn get_messages(&mut self, username: &str, count: u64) -> ClientResult<Vec<MessageRecord>> {
        match self.call(RequestPayload::GetMessages {
            username: username.into(),
            count,
        })? {
            ResponsePayload::Messages { messages, .. } => Ok(messages),
            other => Err(unexpected(other)),
        }
    }

    pub fn delete_messages(&mut self, username: &str, ids: Vec<MessageId>) -> ClientResult<()> {
        match self.write(RequestPayload::DeleteMessages {
            username: username.into(),
            ids,
        })? {
            ResponsePayload::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub fn mark_as_read(&mut self, username: &str, ids: Vec<MessageId>) -> ClientResult<()> {
        match self.write(RequestPayload::MarkAsRead {
            username: username.into(),
            ids,
        })? {
            ResponsePayload::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub fn list_accounts(
        &mut self,
        pattern: &str,
        page: u64,
        per_page: u64,
    ) -> ClientResult<Vec<String>> {
        match self.call(RequestPayload::ListAccounts {
            pattern: pattern.into(),
            page,
            per_page,
        })? {
            ResponsePayload::Accounts { accounts, .. } => Ok(accounts),
            other => Err(unexpected(other)),
        }
    }

    /// Subscribes this connection to the user's message stream.
    ///
    /// Requires a prior successful [`Client::login`] for the same user.
    pub fn stream_messages(&mut self, username: &str) -> ClientResult<()> {
        match self.call(RequestPayload::StreamMessages {
            username: username.into(),
        })? {
            ResponsePayload::Subscribed => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Blocks until the next stream event arrives.
    pub fn next_event(&mut self) -> ClientResult<StreamEvent> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(event);
            }
            if let Some(response) = decode_frame::<Response>(&mut self.read_buf)? {
                if let ResponsePayload::Event(event) = response.payload {
                    return Ok(event);
                }
                continue; // stray reply; ignore on a streaming connection
            }
            let mut chunk = [0u8; 16 * 1024];
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(ClientError::Closed);
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }
}

fn unexpected(payload: ResponsePayload) -> ClientError {
    match payload {
        ResponsePayload::Error { code, leader_hint } => ClientError::Server { code, leader_hint },
        other => {
            tracing::debug!(?other, "unexpected response variant");
            ClientError::UnexpectedResponse
        }
    }
}
