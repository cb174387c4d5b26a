//! Snapshot transfer.
//!
//! When a peer's required prefix has been compacted away, the leader
//! streams its snapshot in ordered, offset-tagged chunks. The follower
//! accumulates a stream identified by `(term, last_included_index)`,
//! installs on the final chunk, and resumes normal appends above the
//! boundary.

use palaver_types::NodeId;

use crate::config::ClusterConfig;
use crate::log::{Log, Snapshot};
use crate::message::{Envelope, Payload, SnapshotAck, SnapshotChunk, msg};

use super::state::{IncomingSnapshot, NodeState, OutgoingSnapshot};
use super::{NodeOutput, PersistAction, Role};

impl NodeState {
    // ========================================================================
    // Leader Side
    // ========================================================================

    /// Starts streaming a snapshot to a peer whose `next_index` fell below
    /// the compacted prefix.
    ///
    /// The snapshot is captured fresh at `last_applied`; the session keeps
    /// it so every chunk of one stream describes the same state.
    pub(crate) fn begin_snapshot_stream(&mut self, peer: NodeId) -> Option<Envelope> {
        let boundary = self.last_applied;
        let boundary_term = self
            .log
            .term_at(boundary)
            .expect("last_applied is always within the log");
        let snapshot = Snapshot::capture(
            boundary,
            boundary_term,
            self.config.to_members(),
            &self.chat,
        );

        tracing::info!(
            node = %self.id(),
            peer = %peer,
            boundary = %boundary,
            bytes = snapshot.state.len(),
            "starting snapshot stream"
        );

        let progress = self.peers.get_mut(&peer)?;
        progress.snapshot = Some(OutgoingSnapshot {
            snapshot,
            offset: 0,
        });
        self.snapshot_chunk_message(peer)
    }

    /// The current chunk for a peer's in-flight stream.
    ///
    /// Called on heartbeat (retransmit) and on ack (advance). Offsets only
    /// move forward when the follower acknowledges them.
    pub(crate) fn snapshot_chunk_message(&mut self, peer: NodeId) -> Option<Envelope> {
        let chunk_size = self.options().snapshot_chunk_size;
        let term = self.current_term;
        let id = self.id();
        let progress = self.peers.get_mut(&peer)?;
        let session = progress.snapshot.as_ref()?;

        let payload = &session.snapshot.state;
        let start = session.offset.min(payload.len());
        let end = (start + chunk_size).min(payload.len());
        let done = end == payload.len();

        Some(msg(
            id,
            peer,
            Payload::SnapshotChunk(SnapshotChunk {
                term,
                leader: id,
                last_included_index: session.snapshot.last_included_index,
                last_included_term: session.snapshot.last_included_term,
                members: session.snapshot.members.clone(),
                offset: start as u64,
                data: payload[start..end].to_vec(),
                done,
            }),
        ))
    }

    /// Processes a follower's stream acknowledgement.
    pub(crate) fn on_snapshot_ack(
        mut self,
        from: NodeId,
        ack: SnapshotAck,
        out: &mut NodeOutput,
    ) -> Self {
        self = self.observe_term(ack.term, out);
        if self.role != Role::Leader || ack.term != self.current_term {
            return self;
        }
        let Some(progress) = self.peers.get_mut(&from) else {
            return self;
        };
        let Some(session) = progress.snapshot.as_mut() else {
            return self;
        };
        if session.snapshot.last_included_index != ack.last_included_index {
            return self; // ack for an older stream
        }

        if ack.installed {
            let boundary = session.snapshot.last_included_index;
            progress.snapshot = None;
            progress.next_index = boundary.next();
            if boundary > progress.match_index {
                progress.match_index = boundary;
            }
            tracing::info!(
                node = %self.id(),
                peer = %from,
                boundary = %boundary,
                "snapshot installed on peer, resuming appends"
            );
            // Follow with a normal append so the peer catches the suffix.
            if let Some(envelope) = self.replication_message_for(from) {
                out.messages.push(envelope);
            }
            return self.advance_commit(out);
        }

        session.offset = ack.next_offset as usize;
        if let Some(envelope) = self.snapshot_chunk_message(from) {
            out.messages.push(envelope);
        }
        self
    }

    // ========================================================================
    // Follower Side
    // ========================================================================

    /// Accumulates one chunk of a snapshot stream, installing on `done`.
    pub(crate) fn on_snapshot_chunk(
        mut self,
        from: NodeId,
        chunk: SnapshotChunk,
        out: &mut NodeOutput,
    ) -> Self {
        if chunk.term < self.current_term {
            // Stale leader; our term in the ack makes it step down.
            out.messages.push(msg(
                self.id(),
                from,
                Payload::SnapshotAck(SnapshotAck {
                    term: self.current_term,
                    last_included_index: chunk.last_included_index,
                    next_offset: 0,
                    installed: false,
                }),
            ));
            return self;
        }

        self = self.observe_term(chunk.term, out);
        if self.role == Role::Candidate {
            self.step_down();
        }
        self.known_leader = Some(chunk.leader);
        out.reset_election_timer = true;

        // A partial stream from another term or boundary is abandoned.
        let matches_stream = self.incoming_snapshot.as_ref().is_some_and(|s| {
            s.term == chunk.term && s.last_included_index == chunk.last_included_index
        });

        if chunk.offset == 0 {
            self.incoming_snapshot = Some(IncomingSnapshot {
                term: chunk.term,
                last_included_index: chunk.last_included_index,
                last_included_term: chunk.last_included_term,
                members: chunk.members.clone(),
                buf: chunk.data.clone(),
            });
        } else if matches_stream {
            let session = self.incoming_snapshot.as_mut().expect("checked above");
            if chunk.offset as usize == session.buf.len() {
                session.buf.extend_from_slice(&chunk.data);
            }
            // Duplicate or out-of-order chunks fall through; the ack below
            // tells the leader which offset we actually expect.
        } else {
            // Mid-stream chunk for a stream we never started; ask for a restart.
            out.messages.push(msg(
                self.id(),
                from,
                Payload::SnapshotAck(SnapshotAck {
                    term: self.current_term,
                    last_included_index: chunk.last_included_index,
                    next_offset: 0,
                    installed: false,
                }),
            ));
            return self;
        }

        let received = self
            .incoming_snapshot
            .as_ref()
            .map_or(0, |s| s.buf.len() as u64);

        let complete = chunk.done && received == chunk.offset + chunk.data.len() as u64;
        if complete {
            return self.install_incoming_snapshot(from, out);
        }

        out.messages.push(msg(
            self.id(),
            from,
            Payload::SnapshotAck(SnapshotAck {
                term: self.current_term,
                last_included_index: chunk.last_included_index,
                next_offset: received,
                installed: false,
            }),
        ));
        self
    }

    /// Installs the fully received snapshot.
    fn install_incoming_snapshot(mut self, from: NodeId, out: &mut NodeOutput) -> Self {
        let incoming = self
            .incoming_snapshot
            .take()
            .expect("called only with a complete stream");
        let boundary = incoming.last_included_index;

        // Already covered by local state: acknowledge idempotently.
        if boundary <= self.commit_index {
            out.messages.push(msg(
                self.id(),
                from,
                Payload::SnapshotAck(SnapshotAck {
                    term: self.current_term,
                    last_included_index: boundary,
                    next_offset: incoming.buf.len() as u64,
                    installed: true,
                }),
            ));
            return self;
        }

        let snapshot = Snapshot {
            last_included_index: boundary,
            last_included_term: incoming.last_included_term,
            members: incoming.members,
            state: incoming.buf,
        };

        let chat = match snapshot.restore_state() {
            Ok(chat) => chat,
            Err(e) => {
                tracing::error!(node = %self.id(), error = %e, "received snapshot is corrupt, discarding stream");
                return self;
            }
        };

        // Retain the log suffix only if our entry at the boundary agrees;
        // otherwise the whole log is superseded.
        let suffix_matches = boundary < self.log.last_index()
            && self
                .log
                .term_at(boundary)
                .is_ok_and(|t| t == snapshot.last_included_term);
        let discard_through = if suffix_matches {
            self.log
                .compact_through(boundary, snapshot.last_included_term);
            boundary
        } else {
            let old_last = self.log.last_index();
            self.log = Log::from_parts(boundary, snapshot.last_included_term, Vec::new());
            old_last.max(boundary)
        };

        self.chat = chat;
        self.commit_index = boundary;
        self.last_applied = boundary;
        self.config = ClusterConfig::from_members(snapshot.members.clone());

        tracing::info!(
            node = %self.id(),
            boundary = %boundary,
            "installed snapshot from leader"
        );

        out.persist.push(PersistAction::InstallSnapshot {
            snapshot: snapshot.clone(),
            discard_through,
        });
        // Membership may have changed under us; keep the metadata record honest.
        out.persist.push(self.save_metadata_action());

        out.messages.push(msg(
            self.id(),
            from,
            Payload::SnapshotAck(SnapshotAck {
                term: self.current_term,
                last_included_index: boundary,
                next_offset: snapshot.state.len() as u64,
                installed: true,
            }),
        ));
        self
    }

    /// Test hook: whether a peer has an outgoing stream.
    #[cfg(test)]
    pub(crate) fn streaming_to(&self, peer: NodeId) -> bool {
        self.peers
            .get(&peer)
            .is_some_and(|p| p.snapshot.is_some())
    }
}
