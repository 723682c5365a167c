//! Core data model (§3): node identity, client/group/vote records, and the
//! deterministic tally computation shared by the leader and every client.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// A server's identity: `(host, port)`, totally ordered, immutable for the
/// life of the process. Doubles as network address and election priority —
/// ordering is lexicographic on `(host, port)` via the derived field order,
/// so the highest `NodeId` always wins an election.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId {
    pub host: IpAddr,
    pub port: u16,
}

impl NodeId {
    pub fn new(host: IpAddr, port: u16) -> Self {
        NodeId { host, port }
    }

    pub fn to_socket_addr(self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl From<SocketAddr> for NodeId {
    fn from(addr: SocketAddr) -> Self {
        NodeId::new(addr.ip(), addr.port())
    }
}

impl From<NodeId> for SocketAddr {
    fn from(id: NodeId) -> Self {
        id.to_socket_addr()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Opaque client identifier, unique across the cluster's lifetime and stable
/// across leader failovers.
pub type ClientId = u64;

/// Opaque, unpredictable auth credential handed to a client at `REGISTER`
/// and presented on every later request. Generation is treated as an
/// external collaborator (§9); here it is 128 unpredictable bits from
/// `rand`.
pub type Token = u128;

/// A registered client, as tracked by the leader and replicated to
/// followers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: ClientId,
    pub address: NodeId,
    pub token: Token,
}

/// A named group of clients. Group names are unique cluster-wide.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub members: Vec<ClientId>,
}

impl Group {
    pub fn new(name: impl Into<String>, creator: ClientId) -> Self {
        Group {
            name: name.into(),
            members: vec![creator],
        }
    }

    pub fn is_member(&self, client: ClientId) -> bool {
        self.members.contains(&client)
    }
}

pub type VoteId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteState {
    Open,
    Closed,
}

/// The outcome of a closed vote: per-option counts and the tie-broken
/// winner (lowest index among options attaining the max count).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub counts: Vec<u32>,
    pub winner: String,
    pub winner_index: usize,
}

/// A single vote instance within a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub vote_id: VoteId,
    pub group: String,
    pub topic: String,
    pub options: Vec<String>,
    /// Milliseconds since Unix epoch; advisory only, see [`Vote::deadline_passed`].
    pub deadline_ms: u64,
    pub ballots: HashMap<ClientId, usize>,
    pub state: VoteState,
    pub tally: Option<Tally>,
}

impl Vote {
    pub fn new(
        vote_id: VoteId,
        group: impl Into<String>,
        topic: impl Into<String>,
        options: Vec<String>,
        deadline_ms: u64,
    ) -> Self {
        Vote {
            vote_id,
            group: group.into(),
            topic: topic.into(),
            options,
            deadline_ms,
            ballots: HashMap::new(),
            state: VoteState::Open,
            tally: None,
        }
    }

    pub fn deadline_passed(&self, now_ms: u64) -> bool {
        now_ms >= self.deadline_ms
    }

    /// Records `client`'s ballot if this is their first for this vote and
    /// the vote is still open. Returns `true` if the ballot was newly
    /// recorded (§4.7: duplicates are silently ignored, not errors, as long
    /// as the index is valid and the vote open).
    pub fn cast_ballot(&mut self, client: ClientId, option_index: usize) -> bool {
        if self.state != VoteState::Open || option_index >= self.options.len() {
            return false;
        }
        if self.ballots.contains_key(&client) {
            return false;
        }
        self.ballots.insert(client, option_index);
        true
    }

    /// Deterministic tally: `sum(counts) == |ballots|`, and `winner` is the
    /// lowest-index option among those attaining the max count (§4.7, §8
    /// property 4).
    pub fn compute_tally(&self) -> Tally {
        let mut counts = vec![0u32; self.options.len()];
        for &idx in self.ballots.values() {
            counts[idx] += 1;
        }
        let winner_index = counts
            .iter()
            .enumerate()
            .max_by_key(|&(idx, &count)| (count, std::cmp::Reverse(idx)))
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        Tally {
            counts,
            winner: self.options[winner_index].clone(),
            winner_index,
        }
    }

    /// Closes the vote, computing and caching its tally. Idempotent.
    pub fn close(&mut self) -> Tally {
        if self.state == VoteState::Closed {
            return self.tally.clone().unwrap_or_else(|| self.compute_tally());
        }
        let tally = self.compute_tally();
        self.state = VoteState::Closed;
        self.tally = Some(tally.clone());
        tally
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn node_id_orders_lexicographically() {
        let a = NodeId::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 6001);
        let b = NodeId::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 6002);
        let c = NodeId::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)), 6000);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn tally_sums_to_ballot_count() {
        let mut v = Vote::new(
            1,
            "g",
            "q?",
            vec!["a".into(), "b".into(), "c".into()],
            0,
        );
        assert!(v.cast_ballot(1, 1));
        assert!(v.cast_ballot(2, 1));
        assert!(!v.cast_ballot(2, 0)); // duplicate, ignored
        let tally = v.close();
        assert_eq!(tally.counts, vec![0, 2, 0]);
        assert_eq!(tally.winner, "b");
    }

    #[test]
    fn tie_break_favors_lowest_index() {
        let mut v = Vote::new(1, "g", "q?", vec!["a".into(), "b".into()], 0);
        assert!(v.cast_ballot(1, 0));
        assert!(v.cast_ballot(2, 1));
        let tally = v.close();
        assert_eq!(tally.winner_index, 0);
        assert_eq!(tally.winner, "a");
    }

    #[test]
    fn cast_ballot_rejects_out_of_range_index() {
        let mut v = Vote::new(1, "g", "q?", vec!["a".into()], 0);
        assert!(!v.cast_ballot(1, 5));
    }

    #[test]
    fn cast_ballot_rejects_after_close() {
        let mut v = Vote::new(1, "g", "q?", vec!["a".into(), "b".into()], 0);
        v.close();
        assert!(!v.cast_ballot(1, 0));
    }
}
