//! Log replication.
//!
//! The leader drives every follower toward its own log: heartbeats carry
//! new entries from each peer's `next_index`, consistency is checked via
//! `(prev_log_index, prev_log_term)`, and rejected appends come back with a
//! hint that lets the leader skip a whole conflicting term per round trip.
//! Majority acknowledgement advances the commit index, subject to the
//! current-term restriction.

use palaver_kernel::Command;
use palaver_types::{LogIndex, NodeId, Term, Timestamp};

use crate::message::{
    AppendRequest, AppendResponse, ConflictHint, Envelope, Payload, msg,
};

use super::state::NodeState;
use super::{NodeOutput, PersistAction, Role};

impl NodeState {
    // ========================================================================
    // Leader Side
    // ========================================================================

    /// Heartbeat interval elapsed: replicate to every peer and run
    /// promotion housekeeping for caught-up learners.
    pub(crate) fn on_heartbeat_timeout(
        mut self,
        now: Timestamp,
        out: &mut NodeOutput,
    ) -> Self {
        if self.role != Role::Leader {
            return self;
        }

        self = self.consider_promotions(now, out);
        // A promotion append can commit immediately on small quorums.
        self = self.advance_commit(out);

        let messages = self.append_messages_for_all();
        out.messages.extend(messages);
        self
    }

    /// Builds replication traffic for every peer.
    ///
    /// Peers whose `next_index` fell below the compacted prefix get a
    /// snapshot stream started instead; peers mid-stream get their current
    /// chunk retransmitted (acks advance it).
    pub(crate) fn append_messages_for_all(&mut self) -> Vec<Envelope> {
        let peer_ids: Vec<NodeId> = self.peers.keys().copied().collect();
        let mut messages = Vec::with_capacity(peer_ids.len());
        for peer in peer_ids {
            if let Some(envelope) = self.replication_message_for(peer) {
                messages.push(envelope);
            }
        }
        messages
    }

    /// The right replication message for one peer right now.
    pub(crate) fn replication_message_for(&mut self, peer: NodeId) -> Option<Envelope> {
        let progress = self.peers.get(&peer)?;

        if progress.snapshot.is_some() {
            return self.snapshot_chunk_message(peer);
        }
        if progress.next_index <= self.log.snapshot_last_index() {
            // Required prefix is compacted; fall back to snapshot transfer.
            return self.begin_snapshot_stream(peer);
        }

        let next = progress.next_index;
        let prev = next.prev();
        let prev_term = self
            .log
            .term_at(prev)
            .expect("prev is at or above the snapshot boundary");
        let entries = self
            .log
            .slice_from(next, self.options().max_entries_per_append)
            .expect("next is above the snapshot boundary");

        Some(msg(
            self.id(),
            peer,
            Payload::Append(AppendRequest {
                term: self.current_term,
                leader: self.id(),
                prev_log_index: prev,
                prev_log_term: prev_term,
                entries,
                leader_commit: self.commit_index,
            }),
        ))
    }

    /// Promotes a learner that has stayed caught up for a full heartbeat
    /// round, one membership change at a time.
    fn consider_promotions(mut self, now: Timestamp, out: &mut NodeOutput) -> Self {
        let lag = self.options().promotion_lag;
        let last_index = self.log.last_index();

        let mut ready: Option<NodeId> = None;
        for (id, progress) in &mut self.peers {
            if self.config.is_voter(*id) {
                continue;
            }
            let caught_up = progress.match_index.as_u64() + lag >= last_index.as_u64();
            if caught_up {
                progress.caught_up_rounds += 1;
            } else {
                progress.caught_up_rounds = 0;
            }
            // Two consecutive satisfied ticks = caught up for one full round.
            if progress.caught_up_rounds >= 2 && ready.is_none() {
                ready = Some(*id);
            }
        }

        if let Some(id) = ready {
            if self.membership_in_flight.is_none() {
                tracing::info!(node = %self.id(), server = %id, "learner caught up, appending promotion");
                self.append_local(Command::PromoteServer { id }, None, now, out);
            }
        }
        self
    }

    /// Processes a follower's append acknowledgement.
    pub(crate) fn on_append_response(
        mut self,
        from: NodeId,
        response: AppendResponse,
        out: &mut NodeOutput,
    ) -> Self {
        self = self.observe_term(response.term, out);
        if self.role != Role::Leader || response.term != self.current_term {
            return self;
        }
        let Some(progress) = self.peers.get_mut(&from) else {
            return self; // unknown peer, likely removed membership
        };

        if response.success {
            // match_index is monotonic within a term.
            if response.match_index > progress.match_index {
                progress.match_index = response.match_index;
            }
            progress.next_index = progress.match_index.next();

            let behind = progress.next_index <= self.log.last_index();
            let commit_before = self.commit_index;
            self = self.advance_commit(out);

            if self.commit_index > commit_before {
                // Spread the new commit index without waiting a heartbeat.
                let messages = self.append_messages_for_all();
                out.messages.extend(messages);
            } else if behind {
                // Keep the pipeline moving for a lagging peer.
                if let Some(envelope) = self.replication_message_for(from) {
                    out.messages.push(envelope);
                }
            }
            return self;
        }

        // Rejection: walk next_index back using the conflict hint.
        let next = match response.conflict {
            Some(hint) => self.backfill_target(hint),
            // No hint (stale-term rejection already handled by observe_term).
            None => return self,
        };

        let progress = self
            .peers
            .get_mut(&from)
            .expect("peer verified above");
        progress.next_index = next.max(LogIndex::new(1));
        let new_next = progress.next_index;

        tracing::debug!(
            node = %self.id(),
            peer = %from,
            next = %new_next,
            "append rejected, backing off via conflict hint"
        );

        if let Some(envelope) = self.replication_message_for(from) {
            out.messages.push(envelope);
        }
        self
    }

    /// Where to resume replication after a conflict hint.
    ///
    /// If the leader has entries of the hinted term, resume right after its
    /// last one; otherwise skip the follower's whole run of that term.
    fn backfill_target(&self, hint: ConflictHint) -> LogIndex {
        if hint.term == Term::ZERO {
            // Follower's log is simply shorter than prev_log_index.
            return hint.first_index;
        }
        let last_of_term = self
            .log
            .entries()
            .iter()
            .rev()
            .find(|e| e.term == hint.term)
            .map(|e| e.index);
        match last_of_term {
            Some(index) => index.next(),
            None => hint.first_index,
        }
    }

    // ========================================================================
    // Follower Side
    // ========================================================================

    /// Processes a heartbeat / replication request.
    pub(crate) fn on_append_request(
        mut self,
        from: NodeId,
        request: AppendRequest,
        out: &mut NodeOutput,
    ) -> Self {
        // Stale leader: reject so it steps down.
        if request.term < self.current_term {
            out.messages.push(msg(
                self.id(),
                from,
                Payload::AppendResponse(AppendResponse {
                    term: self.current_term,
                    success: false,
                    match_index: LogIndex::ZERO,
                    conflict: None,
                }),
            ));
            return self;
        }

        self = self.observe_term(request.term, out);

        // A valid append from the current-term leader ends any candidacy.
        if self.role == Role::Candidate {
            self.step_down();
        }
        debug_assert!(
            self.role != Role::Leader,
            "two leaders in term {}: {} and {}",
            self.current_term,
            self.id(),
            request.leader
        );
        self.known_leader = Some(request.leader);
        out.reset_election_timer = true;

        // Consistency check at (prev_log_index, prev_log_term).
        if let Some(hint) = self.consistency_conflict(&request) {
            tracing::debug!(
                node = %self.id(),
                prev = %request.prev_log_index,
                hint_term = %hint.term,
                hint_index = %hint.first_index,
                "append consistency check failed"
            );
            out.messages.push(msg(
                self.id(),
                from,
                Payload::AppendResponse(AppendResponse {
                    term: self.current_term,
                    success: false,
                    match_index: LogIndex::ZERO,
                    conflict: Some(hint),
                }),
            ));
            return self;
        }

        // Merge entries: skip duplicates, truncate on conflict, append the rest.
        let match_index =
            LogIndex::new(request.prev_log_index.as_u64() + request.entries.len() as u64);
        self.merge_entries(request.entries, out);

        // Commit advances to what the leader says, bounded by what we hold.
        if request.leader_commit > self.commit_index {
            let new_commit = request.leader_commit.min(match_index).min(self.log.last_index());
            if new_commit > self.commit_index {
                self.commit_index = new_commit;
                self = self.apply_ready(out);
            }
        }

        out.messages.push(msg(
            self.id(),
            from,
            Payload::AppendResponse(AppendResponse {
                term: self.current_term,
                success: true,
                match_index,
                conflict: None,
            }),
        ));
        self
    }

    /// Returns the conflict hint if the log does not match the leader at
    /// `(prev_log_index, prev_log_term)`.
    fn consistency_conflict(&self, request: &AppendRequest) -> Option<ConflictHint> {
        let prev = request.prev_log_index;
        if prev.is_zero() {
            return None;
        }
        if prev > self.log.last_index() {
            // Too short: hint term zero, resume at our end.
            return Some(ConflictHint {
                term: Term::ZERO,
                first_index: self.log.last_index().next(),
            });
        }
        if prev <= self.log.snapshot_last_index() {
            // Inside the committed, compacted prefix - matches by
            // definition (snapshots only cover committed entries).
            return None;
        }
        let local_term = self
            .log
            .term_at(prev)
            .expect("prev is within (boundary, last]");
        if local_term == request.prev_log_term {
            return None;
        }
        let first_index = self
            .log
            .first_index_of_term_at(prev)
            .expect("prev holds an entry");
        Some(ConflictHint {
            term: local_term,
            first_index,
        })
    }

    /// Applies the entry-merge rules: existing entries with matching terms
    /// are skipped, a term mismatch truncates the (uncommitted) suffix, and
    /// genuinely new entries are appended and persisted.
    fn merge_entries(&mut self, entries: Vec<crate::log::LogEntry>, out: &mut NodeOutput) {
        let mut to_append = Vec::new();

        for entry in entries {
            // Entries inside the compacted prefix are already committed here.
            if entry.index <= self.log.snapshot_last_index() {
                continue;
            }
            if !to_append.is_empty() {
                to_append.push(entry);
                continue;
            }
            if entry.index <= self.log.last_index() {
                let local_term = self
                    .log
                    .term_at(entry.index)
                    .expect("index within (boundary, last]");
                if local_term == entry.term {
                    continue; // identical entry already present
                }
                // Conflicting suffix is uncommitted by Log Matching; drop it.
                assert!(
                    entry.index > self.commit_index,
                    "refusing to truncate committed entry {} (commit {})",
                    entry.index,
                    self.commit_index
                );
                self.log
                    .truncate_suffix_from(entry.index)
                    .expect("truncation point is above the boundary");
                out.persist.push(PersistAction::TruncateSuffix { from: entry.index });
                to_append.push(entry);
            } else {
                to_append.push(entry);
            }
        }

        if to_append.is_empty() {
            return;
        }
        for entry in &to_append {
            self.log.append(entry.clone());
        }
        out.persist.push(PersistAction::AppendEntries {
            entries: to_append,
        });
    }
}
