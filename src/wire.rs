//! Wire-level message shapes. The envelope's logical fields
//! (`tag`, `round_or_epoch`, `seq`, `sender`, `payload`) are realized as one
//! tagged enum per concern rather than a single generic struct — the
//! concrete encoding (bincode, here) is an implementation detail; only the
//! semantic fields below are load-bearing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{ClientId, ClientRecord, Group, NodeId, Tally, Token, Vote, VoteId};

/// Direction around the ring, used by HS election probes/replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Left,
    Right,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }
}

/// Discovery: periodic multicast announcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceMsg {
    pub id: NodeId,
    /// Gossip accelerant only, never authoritative: the sender's believed
    /// leader/epoch.
    pub believed_leader: Option<NodeId>,
    pub believed_epoch: u64,
}

/// Hirschberg-Sinclair election messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ElectionMsg {
    Probe {
        round: u64,
        origin: NodeId,
        direction: Direction,
        hops_remaining: u32,
        phase: u32,
    },
    Reply {
        round: u64,
        origin: NodeId,
        direction: Direction,
        phase: u32,
    },
    Leader {
        round: u64,
        leader: NodeId,
    },
}

/// Heartbeat probes between ring neighbours.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum HeartbeatMsg {
    Ping { from: NodeId, seq: u64 },
    Ack { from: NodeId, seq: u64 },
}

/// One leader-applied state mutation, replicated to followers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplKind {
    ClientRegister(ClientRecord),
    GroupCreate { name: String, creator: ClientId },
    GroupJoin { name: String, client: ClientId },
    GroupLeave { name: String, client: ClientId },
    VoteStart(VoteMeta),
    VoteBallot { vote_id: VoteId, client: ClientId, option_index: usize },
    VoteClose { vote_id: VoteId, tally: Tally },
}

/// Full authoritative state snapshot, sent by `REPL_STATE` on failover.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicatedState {
    pub clients: HashMap<ClientId, ClientRecord>,
    pub groups: HashMap<String, Group>,
    pub votes: HashMap<VoteId, Vote>,
    pub next_client_id: ClientId,
    pub next_vote_id: VoteId,
}

/// Replication protocol messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplMsg {
    Op { op_id: u64, epoch: u64, kind: ReplKind },
    Ack { op_id: u64, epoch: u64, from: NodeId },
    StateRequest { epoch: u64, from: NodeId },
    StateResponse { epoch: u64, last_op_id: u64, state: ReplicatedState, from: NodeId },
    /// Pushed by a newly-elected leader once it has picked the winning
    /// snapshot out of the `StateResponse`s it collected, so that every
    /// member (including followers whose own snapshot was NOT the winner)
    /// converges on the same baseline before any new-epoch `Op`s are sent:
    /// the new leader re-broadcasts its own view as the new baseline.
    Install { epoch: u64, last_op_id: u64, state: ReplicatedState },
}

/// Metadata describing a vote as broadcast by `VOTE_OPEN` / replicated by
/// `VOTE_START`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteMeta {
    pub vote_id: VoteId,
    pub group: String,
    pub topic: String,
    pub options: Vec<String>,
    pub deadline_ms: u64,
}

/// FO-reliable multicast payloads: vote lifecycle notifications fanned out
/// from the leader to group members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum McastPayload {
    VoteOpen(VoteMeta),
    BallotCounted { vote_id: VoteId, client: ClientId, option_index: usize },
    VoteResult { vote_id: VoteId, tally: Tally },
}

/// FO-multicast transport messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum McastMsg {
    Deliver { group: String, sender: NodeId, seq: u64, payload: McastPayload },
    Ack { group: String, sender: NodeId, seq: u64, from: ClientId },
}

/// Client-facing service operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServiceOp {
    Register { address: NodeId },
    CreateGroup { name: String },
    JoinGroup { name: String },
    LeaveGroup { name: String },
    StartVote {
        group: String,
        topic: String,
        options: Vec<String>,
        timeout_ms: u64,
    },
    CastBallot { vote_id: VoteId, option_index: usize },
}

/// Machine-readable client error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceErrorCode {
    NameTaken,
    NoSuchGroup,
    NotMember,
    NoSuchVote,
    VoteClosed,
    BadOptions,
    AuthFailed,
    NoLeader,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServiceResult {
    Registered { client_id: ClientId, token: Token, leader_id: NodeId },
    GroupCreated,
    Joined { fo_seq: u64 },
    Left,
    VoteStarted { vote_id: VoteId },
    BallotAccepted,
    /// Re-issue of an already-accepted `request_id`, or a semantic
    /// duplicate ballot: success, no new state change.
    Duplicate,
    Error { code: ServiceErrorCode, message: String },
    Redirect { leader_id: Option<NodeId> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub request_id: u64,
    pub client_id: Option<ClientId>,
    pub token: Option<Token>,
    pub op: ServiceOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceReply {
    pub request_id: u64,
    pub result: ServiceResult,
}

/// Leader-to-client broadcast on the multicast group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NewLeaderMsg {
    pub epoch: u64,
    pub leader: NodeId,
}

/// Top-level dispatch tag for everything read off a socket. The unicast
/// receiver and the multicast receiver each match on a subset of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMsg {
    Announce(AnnounceMsg),
    Election(ElectionMsg),
    Heartbeat(HeartbeatMsg),
    Repl(ReplMsg),
    Mcast(McastMsg),
    Service(ServiceRequest),
    ServiceReply(ServiceReply),
    NewLeader(NewLeaderMsg),
}

impl WireMsg {
    pub fn encode(&self) -> Result<Vec<u8>, crate::utils::RingVoteError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, crate::utils::RingVoteError> {
        Ok(bincode::deserialize(buf)?)
    }
}
