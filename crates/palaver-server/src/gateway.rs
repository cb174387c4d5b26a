//! The client gateway.
//!
//! Dispatches client requests against the local replica: reads are served
//! from applied state and labeled with `last_applied`; writes go through
//! the consensus runtime and block (as pending table entries, not
//! threads) until their entry commits and applies. Followers answer
//! writes with a leader redirect.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use mio::Token;

use palaver_kernel::{ApplyOutcome, ChatError, Command, Effect};
use palaver_raft::{Envelope, NodeEvent, NodeState, SubmitResult};
use palaver_types::{LogIndex, NodeId, Term, Timestamp, Username, hash_password};
use palaver_wire::{
    ClusterMember, ErrorCode, Request, RequestPayload, Response, ResponsePayload,
    STREAM_EVENT_ID, StreamEvent,
};

use crate::error::ServerResult;
use crate::runtime::{NodeRuntime, ProcessedEvent};
use crate::subscriptions::SubscriptionTable;

/// A write waiting for its log entry to commit and apply.
struct PendingWrite {
    token: Token,
    request_id: u64,
    deadline: Instant,
}

/// Responses to hand to connections, plus consensus traffic for peers.
pub type GatewayOutput = (Vec<(Token, Response)>, Vec<Envelope>);

/// The gateway: pending writes, subscriptions, and request dispatch.
pub struct Gateway {
    /// Writes keyed by the `(term, index)` their command landed at.
    ///
    /// A leader change invalidates all of them at once: entries from a
    /// lost term may be truncated, so `LeadershipLost` and client retry
    /// is the only honest answer.
    pending: HashMap<(Term, LogIndex), PendingWrite>,
    pub subscriptions: SubscriptionTable,
    request_timeout: Duration,
}

impl Gateway {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            subscriptions: SubscriptionTable::new(),
            request_timeout,
        }
    }

    // ========================================================================
    // Request Dispatch
    // ========================================================================

    /// Handles one client request.
    pub fn handle_request(
        &mut self,
        token: Token,
        authenticated: &mut Option<Username>,
        request: Request,
        runtime: &mut NodeRuntime,
    ) -> ServerResult<GatewayOutput> {
        let id = request.id;

        if request.payload.is_write() {
            return self.handle_write(token, request, runtime);
        }

        let response = self.handle_read(token, authenticated, id, request.payload, runtime.node());
        Ok((vec![(token, response)], Vec::new()))
    }

    /// Serves a read from local applied state.
    ///
    /// Any replica answers; the response carries `last_applied` so callers
    /// can judge staleness of follower reads.
    fn handle_read(
        &mut self,
        token: Token,
        authenticated: &mut Option<Username>,
        id: u64,
        payload: RequestPayload,
        node: &NodeState,
    ) -> Response {
        let chat = node.chat();
        let last_applied = node.last_applied().as_u64();

        let payload = match payload {
            RequestPayload::Login { username, password } => match chat.user(&username) {
                None => error_payload(ErrorCode::UnknownUser),
                Some(user) => {
                    if user.password_hash == hash_password(&password) {
                        *authenticated = Some(username.clone());
                        ResponsePayload::LoggedIn {
                            unread: chat.unread_count(&username) as u64,
                            last_applied,
                        }
                    } else {
                        error_payload(ErrorCode::BadCredentials)
                    }
                }
            },

            RequestPayload::Logout { username } => {
                if authenticated.as_deref() == Some(username.as_str()) {
                    *authenticated = None;
                }
                self.subscriptions.drop_connection(token);
                ResponsePayload::Ok
            }

            RequestPayload::ListAccounts {
                pattern,
                page,
                per_page,
            } => ResponsePayload::Accounts {
                accounts: chat.list_accounts(&pattern, page as usize, per_page as usize),
                page,
                per_page,
                last_applied,
            },

            RequestPayload::GetMessages { username, count } => {
                if chat.user_exists(&username) {
                    ResponsePayload::Messages {
                        messages: chat
                            .inbox_messages(&username, count as usize)
                            .into_iter()
                            .cloned()
                            .collect(),
                        last_applied,
                    }
                } else {
                    error_payload(ErrorCode::UnknownUser)
                }
            }

            RequestPayload::StreamMessages { username } => {
                // Streams require a prior successful login on this
                // connection for the same user.
                if authenticated.as_deref() == Some(username.as_str()) {
                    self.subscriptions.subscribe(&username, token);
                    ResponsePayload::Subscribed
                } else {
                    error_payload(ErrorCode::BadCredentials)
                }
            }

            RequestPayload::GetClusterStatus => ResponsePayload::ClusterStatus {
                leader: node.current_leader(),
                term: node.current_term().as_u64(),
                members: node
                    .config()
                    .members()
                    .map(|m| ClusterMember {
                        id: m.id,
                        addr: m.addr.clone(),
                        voting: m.voting,
                    })
                    .collect(),
            },

            // Writes never reach here.
            other => {
                tracing::error!(request = other.name(), "write routed to read path");
                error_payload(ErrorCode::Internal)
            }
        };

        Response { id, payload }
    }

    /// Routes a write through the consensus core.
    fn handle_write(
        &mut self,
        token: Token,
        request: Request,
        runtime: &mut NodeRuntime,
    ) -> ServerResult<GatewayOutput> {
        let id = request.id;
        let Some(command) = to_command(request.payload) else {
            let response = Response {
                id,
                payload: ResponsePayload::Error {
                    code: ErrorCode::Malformed,
                    leader_hint: None,
                },
            };
            return Ok((vec![(token, response)], Vec::new()));
        };

        let processed = runtime.process(NodeEvent::ClientCommand {
            command,
            client: request.client,
            now: Timestamp::now(),
        })?;

        let mut responses = Vec::new();
        match processed.submit {
            Some(SubmitResult::Accepted { term, index }) => {
                self.pending.insert(
                    (term, index),
                    PendingWrite {
                        token,
                        request_id: id,
                        deadline: Instant::now() + self.request_timeout,
                    },
                );
            }
            Some(SubmitResult::NotLeader { hint }) => {
                let code = if hint.is_some() {
                    ErrorCode::NotLeader
                } else {
                    ErrorCode::NoLeader
                };
                responses.push((
                    token,
                    Response {
                        id,
                        payload: ResponsePayload::Error {
                            code,
                            leader_hint: hint
                                .and_then(|h| member_addr(runtime.node(), h)),
                        },
                    },
                ));
            }
            Some(SubmitResult::MembershipChangeInFlight) => {
                responses.push((
                    token,
                    Response {
                        id,
                        payload: ResponsePayload::Error {
                            code: ErrorCode::Busy,
                            leader_hint: None,
                        },
                    },
                ));
            }
            None => {
                tracing::error!("client command produced no submit result");
                responses.push((
                    token,
                    Response {
                        id,
                        payload: ResponsePayload::Error {
                            code: ErrorCode::Internal,
                            leader_hint: None,
                        },
                    },
                ));
            }
        }

        let mut output = (responses, processed.messages.clone());
        let absorbed = self.absorb(&processed, runtime.node());
        output.0.extend(absorbed);
        Ok(output)
    }

    // ========================================================================
    // Consensus Plumbing
    // ========================================================================

    /// Feeds a peer envelope through the core and absorbs the fallout.
    pub fn on_consensus(
        &mut self,
        envelope: Envelope,
        runtime: &mut NodeRuntime,
    ) -> ServerResult<GatewayOutput> {
        let processed = runtime.process(NodeEvent::Rpc(envelope))?;
        let responses = self.absorb(&processed, runtime.node());
        Ok((responses, processed.messages))
    }

    /// Fires due timers and sweeps expired pending writes.
    pub fn on_tick(&mut self, now: Instant, runtime: &mut NodeRuntime) -> ServerResult<GatewayOutput> {
        let mut responses = Vec::new();
        let mut envelopes = Vec::new();

        for processed in runtime.fire_due_timers(now)? {
            responses.extend(self.absorb(&processed, runtime.node()));
            envelopes.extend(processed.messages);
        }

        // Requests that outlived their deadline: the command may still
        // commit later; dedup by (client_id, seq) makes the retry safe.
        let expired: Vec<(Term, LogIndex)> = self
            .pending
            .iter()
            .filter(|(_, w)| w.deadline <= now)
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            if let Some(write) = self.pending.remove(&key) {
                tracing::warn!(term = %key.0, index = %key.1, "pending write timed out");
                responses.push((
                    write.token,
                    Response {
                        id: write.request_id,
                        payload: ResponsePayload::Error {
                            code: ErrorCode::Timeout,
                            leader_hint: None,
                        },
                    },
                ));
            }
        }

        Ok((responses, envelopes))
    }

    /// Reacts to one processed event: resolves pending writes, invalidates
    /// on leadership loss, and fans deliveries out to subscriptions.
    fn absorb(&mut self, processed: &ProcessedEvent, node: &NodeState) -> Vec<(Token, Response)> {
        let mut responses = Vec::new();

        // Leadership lost: every pending write is in limbo. Clients retry.
        if processed.was_leader && !processed.is_leader {
            let hint = node
                .current_leader()
                .and_then(|h| member_addr(node, h));
            for (_, write) in self.pending.drain() {
                responses.push((
                    write.token,
                    Response {
                        id: write.request_id,
                        payload: ResponsePayload::Error {
                            code: ErrorCode::LeadershipLost,
                            leader_hint: hint.clone(),
                        },
                    },
                ));
            }
        }

        // Leader moved: streams are invalidated; clients reconnect.
        if processed.leader_before != processed.leader_after {
            let hint = processed
                .leader_after
                .and_then(|h| member_addr(node, h));
            for token in self.subscriptions.drain_all() {
                responses.push((
                    token,
                    Response {
                        id: STREAM_EVENT_ID,
                        payload: ResponsePayload::Event(StreamEvent::LeaderChanged {
                            leader_hint: hint.clone(),
                        }),
                    },
                ));
            }
        }

        // Committed-and-applied entries answer their waiting clients.
        for applied in &processed.applied {
            if let Some(write) = self.pending.remove(&(applied.term, applied.index)) {
                responses.push((
                    write.token,
                    Response {
                        id: write.request_id,
                        payload: outcome_payload(&applied.outcome, node),
                    },
                ));
            }
        }

        // Stream deliveries, in apply order per user.
        for effect in &processed.effects {
            match effect {
                Effect::MessageDelivered { message } => {
                    for token in self.subscriptions.subscribers(&message.recipient) {
                        responses.push((
                            token,
                            Response {
                                id: STREAM_EVENT_ID,
                                payload: ResponsePayload::Event(StreamEvent::NewMessage(
                                    message.clone(),
                                )),
                            },
                        ));
                    }
                }
                Effect::AccountDeleted { username } => {
                    self.subscriptions.drop_user(username);
                }
            }
        }

        responses
    }

    /// Forgets a disconnected client.
    pub fn drop_connection(&mut self, token: Token) {
        self.subscriptions.drop_connection(token);
        self.pending.retain(|_, w| w.token != token);
    }

    /// Pending-write count, for diagnostics and tests.
    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }
}

/// Builds the command for a write request; `None` if it is not a write.
fn to_command(payload: RequestPayload) -> Option<Command> {
    match payload {
        RequestPayload::Register { username, password } => Some(Command::Register {
            username,
            // Hashed at the gateway: the log and snapshots never hold
            // plaintext credentials.
            password_hash: hash_password(&password),
        }),
        RequestPayload::DeleteAccount { username } => Some(Command::DeleteAccount { username }),
        RequestPayload::SendMessage {
            sender,
            recipient,
            content,
        } => Some(Command::SendMessage {
            sender,
            recipient,
            content,
        }),
        RequestPayload::DeleteMessages { username, ids } => {
            Some(Command::DeleteMessages { username, ids })
        }
        RequestPayload::MarkAsRead { username, ids } => Some(Command::MarkRead { username, ids }),
        RequestPayload::JoinCluster {
            server_id,
            server_address,
        } => Some(Command::AddServerNonVoting {
            id: server_id,
            addr: server_address,
        }),
        _ => None,
    }
}

/// Maps an apply outcome to the response the waiting client sees.
fn outcome_payload(outcome: &ApplyOutcome, node: &NodeState) -> ResponsePayload {
    match outcome {
        ApplyOutcome::Ok => ResponsePayload::Ok,
        ApplyOutcome::MessageSent { id } => ResponsePayload::MessageSent { id: *id },
        ApplyOutcome::Rejected(err) => {
            let code = match err {
                ChatError::AlreadyExists => ErrorCode::AlreadyExists,
                ChatError::UnknownUser => ErrorCode::UnknownUser,
                ChatError::UnknownRecipient => ErrorCode::UnknownRecipient,
            };
            error_payload(code)
        }
    }
}

fn error_payload(code: ErrorCode) -> ResponsePayload {
    ResponsePayload::Error {
        code,
        leader_hint: None,
    }
}

/// Resolves a node id to its transport address via current membership.
fn member_addr(node: &NodeState, id: NodeId) -> Option<String> {
    node.config().member(id).map(|m| m.addr.clone())
}
