//! The poll-based server loop.
//!
//! One thread, one `mio::Poll`, all sockets: the listener, accepted
//! connections (clients and inbound peer traffic), and outbound peer
//! links. Decoded frames are pushed through a bounded work queue whose
//! drain is the node's serializer region; a full queue answers clients
//! with `Busy` instead of growing without bound.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use palaver_config::PalaverConfig;
use palaver_raft::Envelope;
use palaver_types::NodeId;
use palaver_wire::{
    ErrorCode, Hello, PROTOCOL_VERSION, Request, Response, ResponsePayload,
};

use crate::bounded_queue::{BoundedQueue, PushResult};
use crate::connection::{Connection, ConnectionKind};
use crate::error::{ServerError, ServerResult};
use crate::gateway::Gateway;
use crate::runtime::NodeRuntime;

const LISTENER: Token = Token(0);
#[cfg(unix)]
const SIGNALS: Token = Token(1);
/// First token handed to sockets.
const TOKEN_BASE: usize = 16;

/// Capacity of the serializer work queue.
const WORK_QUEUE_CAPACITY: usize = 1024;

/// Ceiling on the poll timeout so housekeeping always runs.
const MAX_POLL_WAIT: Duration = Duration::from_millis(100);

/// Minimum delay between reconnect attempts to a dead peer.
const PEER_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Work items drained inside the serializer region.
enum Work {
    Request { token: Token, request: Request },
    Consensus(Envelope),
}

/// An outbound link to one peer (write side of the full duplex pair).
struct PeerLink {
    addr: String,
    conn: Option<Connection>,
    last_attempt: Instant,
}

/// The Palaver server: consensus runtime plus client gateway.
pub struct Server {
    config: PalaverConfig,
    poll: Poll,
    listener: TcpListener,
    runtime: NodeRuntime,
    gateway: Gateway,
    queue: BoundedQueue<Work>,
    /// Accepted connections: clients and inbound peer streams.
    conns: HashMap<Token, Connection>,
    /// Outbound peer links, keyed by peer id.
    peers: HashMap<NodeId, PeerLink>,
    /// Token routing for outbound peer sockets.
    peer_tokens: HashMap<Token, NodeId>,
    next_token: usize,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Binds the listener and restores the node from its durable store.
    pub fn new(config: PalaverConfig) -> ServerResult<Self> {
        config
            .validate()
            .map_err(|e| ServerError::Config(e.to_string()))?;

        let addr = config
            .node
            .listen_addr
            .parse()
            .map_err(|e| ServerError::Config(format!("bad listen_addr: {e}")))?;
        let mut listener = TcpListener::bind(addr).map_err(|source| ServerError::BindFailed {
            addr: config.node.listen_addr.clone(),
            source,
        })?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        let runtime = NodeRuntime::open(&config)?;
        let gateway = Gateway::new(Duration::from_millis(config.raft.request_timeout_ms));

        tracing::info!(
            node = config.node.id,
            addr = %config.node.listen_addr,
            members = config.cluster.members.len(),
            "palaver node listening"
        );

        Ok(Self {
            config,
            poll,
            listener,
            runtime,
            gateway,
            queue: BoundedQueue::new(WORK_QUEUE_CAPACITY),
            conns: HashMap::new(),
            peers: HashMap::new(),
            peer_tokens: HashMap::new(),
            next_token: TOKEN_BASE,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A handle that stops the server from another thread.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// The address actually bound (useful with port 0 in tests).
    pub fn local_addr(&self) -> ServerResult<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the event loop until shutdown. Durable-store failures abort.
    pub fn run(&mut self) -> ServerResult<()> {
        #[cfg(unix)]
        let mut signals = {
            use signal_hook::consts::{SIGINT, SIGTERM};
            let mut signals = signal_hook_mio::v1_0::Signals::new([SIGINT, SIGTERM])?;
            self.poll
                .registry()
                .register(&mut signals, SIGNALS, Interest::READABLE)?;
            signals
        };

        let mut events = Events::with_capacity(256);

        while !self.shutdown.load(Ordering::Relaxed) {
            let timeout = self
                .runtime
                .next_deadline()
                .saturating_duration_since(Instant::now())
                .min(MAX_POLL_WAIT);
            self.poll.poll(&mut events, Some(timeout))?;

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_pending()?,
                    #[cfg(unix)]
                    SIGNALS => {
                        if signals.pending().next().is_some() {
                            tracing::info!("signal received, shutting down");
                            self.shutdown.store(true, Ordering::Relaxed);
                        }
                    }
                    token => self.handle_socket_event(token, event.is_readable(), event.is_writable()),
                }
            }

            // Serializer region: all node and gateway state changes happen
            // in this drain, in arrival order.
            self.drain_work_queue()?;

            // Timers and deadline sweeps.
            let now = Instant::now();
            let (responses, envelopes) = self.gateway.on_tick(now, &mut self.runtime)?;
            self.dispatch(responses, envelopes);

            self.reap_closed();
        }

        tracing::info!("server loop exited");
        Ok(())
    }

    // ========================================================================
    // Socket Plumbing
    // ========================================================================

    fn accept_pending(&mut self) -> ServerResult<()> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, remote)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        tracing::warn!(error = %e, "failed to register accepted socket");
                        continue;
                    }
                    tracing::debug!(token = token.0, %remote, "accepted connection");
                    self.conns.insert(token, Connection::new(token, stream));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(ServerError::Io(e)),
            }
        }
    }

    fn handle_socket_event(&mut self, token: Token, readable: bool, writable: bool) {
        // Outbound peer sockets: flush on writable, drain/EOF on readable.
        if let Some(peer_id) = self.peer_tokens.get(&token).copied() {
            let broken = {
                let Some(link) = self.peers.get_mut(&peer_id) else {
                    return;
                };
                let Some(conn) = link.conn.as_mut() else {
                    return;
                };
                let mut broken = false;
                if writable && conn.flush().is_err() {
                    broken = true;
                }
                if readable {
                    match conn.fill_read_buf() {
                        Ok(closed) => {
                            conn.read_buf.clear(); // nothing flows this way
                            broken |= closed;
                        }
                        Err(_) => broken = true,
                    }
                }
                broken
            };
            if broken {
                tracing::debug!(peer = %peer_id, "outbound peer link dropped");
                self.drop_peer_link(peer_id);
            }
            return;
        }

        // Accepted connections.
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };

        if writable && conn.flush().is_err() {
            conn.closing = true;
            return;
        }

        if readable {
            match conn.fill_read_buf() {
                Ok(closed) => {
                    if closed {
                        conn.closing = true;
                    }
                }
                Err(_) => {
                    conn.closing = true;
                    return;
                }
            }
            self.decode_frames(token);
        }
    }

    /// Decodes every complete frame buffered on a connection into work.
    fn decode_frames(&mut self, token: Token) {
        loop {
            let Some(conn) = self.conns.get_mut(&token) else {
                return;
            };

            // Resolve the hello first.
            if conn.kind == ConnectionKind::Pending {
                match conn.next_frame::<Hello>() {
                    Ok(Some(Hello::Client { protocol_version })) => {
                        if protocol_version != PROTOCOL_VERSION {
                            tracing::warn!(
                                got = protocol_version,
                                want = PROTOCOL_VERSION,
                                "client protocol mismatch"
                            );
                            conn.closing = true;
                            return;
                        }
                        conn.kind = ConnectionKind::Client;
                    }
                    Ok(Some(Hello::Peer { node_id, .. })) => {
                        conn.kind = ConnectionKind::Peer(node_id);
                    }
                    Ok(None) => return,
                    Err(e) => {
                        tracing::warn!(error = %e, "bad hello frame");
                        conn.closing = true;
                        return;
                    }
                }
            }

            let kind = conn.kind.clone();
            match kind {
                ConnectionKind::Client => match conn.next_frame::<Request>() {
                    Ok(Some(request)) => {
                        let request_id = request.id;
                        match self.queue.try_push(Work::Request { token, request }) {
                            PushResult::Ok => {}
                            PushResult::Backpressure(_) => {
                                // Shed load; the client retries later.
                                let _ = conn.send(&Response {
                                    id: request_id,
                                    payload: ResponsePayload::Error {
                                        code: ErrorCode::Busy,
                                        leader_hint: None,
                                    },
                                });
                            }
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed client frame");
                        conn.closing = true;
                        return;
                    }
                },
                ConnectionKind::Peer(_) => match conn.next_frame::<Envelope>() {
                    Ok(Some(envelope)) => {
                        if matches!(self.queue.try_push(Work::Consensus(envelope)), PushResult::Backpressure(_)) {
                            // Consensus traffic is retried by timers; drop.
                            tracing::warn!("work queue full, dropping peer frame");
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed peer frame");
                        conn.closing = true;
                        return;
                    }
                },
                ConnectionKind::Pending => return,
            }
        }
    }

    // ========================================================================
    // Serializer Region
    // ========================================================================

    fn drain_work_queue(&mut self) -> ServerResult<()> {
        while let Some(work) = self.queue.try_pop() {
            let (responses, envelopes) = match work {
                Work::Request { token, request } => {
                    let mut authenticated = self
                        .conns
                        .get(&token)
                        .and_then(|c| c.authenticated.clone());
                    let output = self.gateway.handle_request(
                        token,
                        &mut authenticated,
                        request,
                        &mut self.runtime,
                    )?;
                    if let Some(conn) = self.conns.get_mut(&token) {
                        conn.authenticated = authenticated;
                    }
                    output
                }
                Work::Consensus(envelope) => {
                    self.gateway.on_consensus(envelope, &mut self.runtime)?
                }
            };
            self.dispatch(responses, envelopes);
        }
        Ok(())
    }

    /// Sends gateway responses to connections and envelopes to peers.
    fn dispatch(&mut self, responses: Vec<(Token, Response)>, envelopes: Vec<Envelope>) {
        for (token, response) in responses {
            if let Some(conn) = self.conns.get_mut(&token) {
                if conn.send(&response).is_err() || conn.flush().is_err() {
                    conn.closing = true;
                }
            }
        }
        for envelope in envelopes {
            self.send_to_peer(envelope);
        }
    }

    // ========================================================================
    // Peer Links
    // ========================================================================

    fn send_to_peer(&mut self, envelope: Envelope) {
        let peer_id = envelope.to;
        let Some(addr) = self.peer_addr(peer_id) else {
            tracing::warn!(peer = %peer_id, "no address for peer, dropping message");
            return;
        };

        if !self
            .peers
            .get(&peer_id)
            .is_some_and(|link| link.conn.is_some())
        {
            self.connect_peer(peer_id, addr);
        }

        let Some(link) = self.peers.get_mut(&peer_id) else {
            return;
        };
        let Some(conn) = link.conn.as_mut() else {
            return; // backoff window, message lost; timers resend
        };
        if conn.send(&envelope).is_err() || conn.flush().is_err() {
            self.drop_peer_link(peer_id);
        }
    }

    /// The peer's address: replicated membership first, static table second.
    fn peer_addr(&self, peer_id: NodeId) -> Option<String> {
        if let Some(member) = self.runtime.node().config().member(peer_id) {
            return Some(member.addr.clone());
        }
        self.config
            .cluster
            .members
            .iter()
            .find(|m| m.id == peer_id.as_u64())
            .map(|m| m.addr.clone())
    }

    fn connect_peer(&mut self, peer_id: NodeId, addr: String) {
        let link = self.peers.entry(peer_id).or_insert_with(|| PeerLink {
            addr: addr.clone(),
            conn: None,
            last_attempt: Instant::now() - PEER_RECONNECT_BACKOFF,
        });
        link.addr = addr;

        if link.conn.is_some() || link.last_attempt.elapsed() < PEER_RECONNECT_BACKOFF {
            return;
        }
        link.last_attempt = Instant::now();

        let Ok(remote) = link.addr.parse() else {
            tracing::warn!(peer = %peer_id, addr = %link.addr, "unparseable peer address");
            return;
        };
        let mut stream = match TcpStream::connect(remote) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!(peer = %peer_id, error = %e, "peer connect failed");
                return;
            }
        };

        let token = Token(self.next_token);
        self.next_token += 1;
        if self
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
            .is_err()
        {
            return;
        }

        let mut conn = Connection::new(token, stream);
        let hello = Hello::Peer {
            node_id: NodeId::new(self.config.node.id),
            protocol_version: PROTOCOL_VERSION,
        };
        if conn.send(&hello).is_err() {
            return;
        }
        let _ = conn.flush();

        tracing::debug!(peer = %peer_id, token = token.0, "peer link established");
        self.peer_tokens.insert(token, peer_id);
        link.conn = Some(conn);
    }

    fn drop_peer_link(&mut self, peer_id: NodeId) {
        if let Some(link) = self.peers.get_mut(&peer_id) {
            if let Some(conn) = link.conn.take() {
                self.peer_tokens.remove(&conn.token);
            }
        }
    }

    /// Tears down connections marked closing.
    fn reap_closed(&mut self) {
        let closed: Vec<Token> = self
            .conns
            .iter()
            .filter(|(_, c)| c.closing && !c.wants_write())
            .map(|(t, _)| *t)
            .collect();
        for token in closed {
            if let Some(mut conn) = self.conns.remove(&token) {
                let _ = self.poll.registry().deregister(&mut conn.stream);
            }
            self.gateway.drop_connection(token);
            tracing::debug!(token = token.0, "connection closed");
        }
    }
}
