//! Cluster membership configuration.
//!
//! The membership list is part of replicated state: `AddServerNonVoting`
//! and `PromoteServer` entries mutate it when they are applied. Quorum is
//! always computed over the *voting* members only; non-voting learners
//! receive replication traffic but never count toward majorities, never
//! vote, and never start elections.

use std::collections::BTreeMap;

use palaver_types::NodeId;
use serde::{Deserialize, Serialize};

/// One server in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    /// Transport address, opaque to the consensus core.
    pub addr: String,
    /// Whether this member counts toward quorum.
    pub voting: bool,
}

/// The cluster membership list.
///
/// Kept in a `BTreeMap` so iteration order (and therefore serialization)
/// is deterministic across replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ClusterConfig {
    members: BTreeMap<NodeId, Member>,
}

impl ClusterConfig {
    /// Builds a configuration of voting members from `(id, addr)` pairs.
    pub fn bootstrap(members: impl IntoIterator<Item = (NodeId, String)>) -> Self {
        let members = members
            .into_iter()
            .map(|(id, addr)| {
                (
                    id,
                    Member {
                        id,
                        addr,
                        voting: true,
                    },
                )
            })
            .collect();
        Self { members }
    }

    /// Rebuilds a configuration from a persisted member list.
    pub fn from_members(members: Vec<Member>) -> Self {
        Self {
            members: members.into_iter().map(|m| (m.id, m)).collect(),
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn member(&self, id: NodeId) -> Option<&Member> {
        self.members.get(&id)
    }

    pub fn is_voter(&self, id: NodeId) -> bool {
        self.members.get(&id).is_some_and(|m| m.voting)
    }

    /// All members, voters and learners.
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn voters(&self) -> impl Iterator<Item = &Member> {
        self.members.values().filter(|m| m.voting)
    }

    pub fn cluster_size(&self) -> usize {
        self.members.len()
    }

    pub fn voter_count(&self) -> usize {
        self.voters().count()
    }

    /// Majority of the voting membership: `⌊N/2⌋ + 1`.
    pub fn quorum_size(&self) -> usize {
        self.voter_count() / 2 + 1
    }

    /// Number of voter crashes the cluster can tolerate.
    pub fn max_failures(&self) -> usize {
        self.voter_count().saturating_sub(self.quorum_size())
    }

    /// Snapshot of the member list for persistence and transfer.
    pub fn to_members(&self) -> Vec<Member> {
        self.members.values().cloned().collect()
    }

    /// Adds a non-voting learner. Adding an existing id is a no-op.
    pub(crate) fn add_learner(&mut self, id: NodeId, addr: String) {
        self.members.entry(id).or_insert(Member {
            id,
            addr,
            voting: false,
        });
    }

    /// Promotes a learner to voter. Unknown ids are ignored.
    pub(crate) fn promote(&mut self, id: NodeId) {
        if let Some(member) = self.members.get_mut(&id) {
            member.voting = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn config_of(n: u64) -> ClusterConfig {
        ClusterConfig::bootstrap((0..n).map(|i| (NodeId::new(i), format!("127.0.0.1:{}", 7000 + i))))
    }

    #[test_case(1, 1, 0; "single node")]
    #[test_case(3, 2, 1; "three nodes")]
    #[test_case(5, 3, 2; "five nodes")]
    #[test_case(7, 4, 3; "seven nodes")]
    fn quorum_arithmetic(n: u64, quorum: usize, failures: usize) {
        let config = config_of(n);
        assert_eq!(config.quorum_size(), quorum);
        assert_eq!(config.max_failures(), failures);
    }

    #[test]
    fn learners_do_not_count_toward_quorum() {
        let mut config = config_of(3);
        config.add_learner(NodeId::new(9), "127.0.0.1:7009".into());

        assert_eq!(config.cluster_size(), 4);
        assert_eq!(config.voter_count(), 3);
        assert_eq!(config.quorum_size(), 2);
        assert!(!config.is_voter(NodeId::new(9)));

        config.promote(NodeId::new(9));
        assert_eq!(config.quorum_size(), 3);
        assert!(config.is_voter(NodeId::new(9)));
    }

    #[test]
    fn member_round_trip() {
        let config = config_of(3);
        let rebuilt = ClusterConfig::from_members(config.to_members());
        assert_eq!(config, rebuilt);
    }
}
