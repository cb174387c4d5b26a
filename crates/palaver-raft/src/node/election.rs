//! Leader election.
//!
//! A follower whose randomized election timer fires becomes a candidate:
//! it bumps its term, votes for itself, and solicits votes. A majority of
//! voters in the same term makes it leader. The up-to-date log check in
//! vote granting is what yields Leader Completeness: a winning candidate
//! holds every committed entry from earlier terms.

use palaver_types::NodeId;

use crate::message::{Payload, VoteRequest, VoteResponse, msg};

use super::state::{NodeState, PeerProgress};
use super::{NodeOutput, Role};

impl NodeState {
    /// Election timer fired: start (or restart) a candidacy.
    ///
    /// Learners and the current leader ignore the timer; a candidate whose
    /// election stalled starts over with a fresh term.
    pub(crate) fn on_election_timeout(mut self, out: &mut NodeOutput) -> Self {
        if self.role == Role::Leader {
            return self;
        }
        if !self.config.is_voter(self.id()) {
            // Non-voting learners never campaign.
            return self;
        }

        self.current_term = self.current_term.next();
        self.role = Role::Candidate;
        self.voted_for = Some(self.id());
        self.known_leader = None;
        self.votes_received.clear();
        self.votes_received.insert(self.id());

        tracing::info!(
            node = %self.id(),
            term = %self.current_term,
            last_index = %self.log.last_index(),
            "election timeout, becoming candidate"
        );

        // The vote for self must be durable before any ballot counts.
        out.persist.push(self.save_metadata_action());
        out.reset_election_timer = true;

        let request = VoteRequest {
            term: self.current_term,
            candidate: self.id(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for member in self.config.voters().filter(|m| m.id != self.id()) {
            out.messages
                .push(msg(self.id(), member.id, Payload::VoteRequest(request)));
        }

        // A single-voter cluster wins instantly.
        self.try_win_election(out)
    }

    /// Handles an incoming vote solicitation.
    pub(crate) fn on_vote_request(
        mut self,
        from: NodeId,
        request: VoteRequest,
        out: &mut NodeOutput,
    ) -> Self {
        self = self.observe_term(request.term, out);

        let up_to_date =
            request.log_up_to_date(self.log.last_term(), self.log.last_index());
        let vote_free = match self.voted_for {
            None => true,
            Some(prior) => prior == request.candidate,
        };
        let grant = request.term == self.current_term && vote_free && up_to_date;

        if grant {
            // Re-granting the same (term, candidate) is deliberate: vote
            // responses can be lost, and the repeat request must succeed.
            self.voted_for = Some(request.candidate);
            out.reset_election_timer = true;
            tracing::debug!(
                node = %self.id(),
                term = %self.current_term,
                candidate = %request.candidate,
                "granting vote"
            );
        } else {
            tracing::debug!(
                node = %self.id(),
                term = %self.current_term,
                candidate = %request.candidate,
                voted_for = ?self.voted_for,
                up_to_date,
                "rejecting vote"
            );
        }

        // The vote decision persists before the response leaves the node.
        out.persist.push(self.save_metadata_action());
        out.messages.push(msg(
            self.id(),
            from,
            Payload::VoteResponse(VoteResponse {
                term: self.current_term,
                granted: grant,
            }),
        ));
        self
    }

    /// Tallies a ballot.
    pub(crate) fn on_vote_response(
        mut self,
        from: NodeId,
        response: VoteResponse,
        out: &mut NodeOutput,
    ) -> Self {
        self = self.observe_term(response.term, out);

        if self.role != Role::Candidate
            || response.term != self.current_term
            || !response.granted
        {
            return self;
        }
        if !self.config.is_voter(from) {
            return self;
        }

        self.votes_received.insert(from);
        self.try_win_election(out)
    }

    /// Becomes leader if the tally reaches quorum.
    fn try_win_election(mut self, out: &mut NodeOutput) -> Self {
        if self.role != Role::Candidate {
            return self;
        }
        if self.votes_received.len() < self.config.quorum_size() {
            return self;
        }

        tracing::info!(
            node = %self.id(),
            term = %self.current_term,
            votes = self.votes_received.len(),
            "won election, becoming leader"
        );

        self.role = Role::Leader;
        self.known_leader = Some(self.id());
        self.votes_received.clear();

        // Fresh peer book: next = last+1, match = 0, re-proven per term.
        let my_id = self.id();
        let next = self.log.last_index().next();
        self.peers = self
            .config
            .members()
            .filter(|m| m.id != my_id)
            .map(|m| (m.id, PeerProgress::new(next)))
            .collect();

        // An uncommitted membership entry inherited from a prior leader
        // still blocks new membership changes until it resolves.
        self.membership_in_flight = self
            .log
            .entries()
            .iter()
            .filter(|e| e.index > self.commit_index)
            .find(|e| e.command.is_membership_change())
            .map(|e| e.index);

        out.reset_election_timer = true;

        // An uncommitted tail from earlier terms cannot be committed by
        // counting replicas; a no-op in the new term anchors it.
        if self.log.last_index() > self.commit_index {
            // Timestamp zero: the no-op never touches chat records.
            self.append_local(
                palaver_kernel::Command::Noop,
                None,
                palaver_types::Timestamp::new(0),
                out,
            );
        }

        // Announce immediately so followers learn the leader and stale
        // candidates stand down.
        let announce = self.append_messages_for_all();
        out.messages.extend(announce);

        // Single-voter cluster: everything already appended is committable.
        self.advance_commit(out)
    }
}
