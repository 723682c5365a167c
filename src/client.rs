//! Client-side stub: request/reply against the leader, token persistence
//! across failover, and FO-multicast delivery of group notifications. This
//! is the collaborator an interactive UI would sit on top of — mirrors
//! Summerset's `GenericClient`/`GenericEndpoint` split but collapsed into
//! one struct, since ringvote has a single wire protocol rather than a
//! pluggable one per consensus scheme.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::discovery;
use crate::multicast::ReceiveState;
use crate::types::{ClientId, NodeId, Token, VoteId};
use crate::utils::{ErrorKind, RingVoteError};
use crate::wire::{
    McastMsg, McastPayload, NewLeaderMsg, ServiceErrorCode, ServiceOp, ServiceReply,
    ServiceRequest, ServiceResult, WireMsg,
};

/// Notifications an application built on [`ClientStub`] consumes, mirroring
/// the FO-multicast payloads plus the leader-change broadcast a client needs
/// to retarget its requests.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    VoteOpen {
        group: String,
        vote_id: VoteId,
        topic: String,
        options: Vec<String>,
        deadline_ms: u64,
    },
    BallotCounted {
        group: String,
        vote_id: VoteId,
        client: ClientId,
        option_index: usize,
    },
    VoteResult {
        group: String,
        vote_id: VoteId,
        tally: crate::types::Tally,
    },
    NewLeader {
        epoch: u64,
        leader: NodeId,
    },
}

struct Inner {
    client_id: Option<ClientId>,
    token: Option<Token>,
    leader: NodeId,
    pending: HashMap<u64, oneshot::Sender<ServiceReply>>,
    receive_states: HashMap<(String, NodeId), ReceiveState>,
}

/// A registered (or about-to-register) client's connection to the service.
/// Owns its own unicast socket plus a multicast listener for `NEW_LEADER`;
/// every request retargets itself on `Redirect` replies and retries up to
/// `max_retries` times against the server it currently believes is leader.
pub struct ClientStub {
    me: NodeId,
    socket: Arc<UdpSocket>,
    inner: Mutex<Inner>,
    next_request_id: AtomicU64,
    request_timeout: Duration,
    max_retries: u32,
}

impl ClientStub {
    /// Binds the client's unicast socket and its multicast `NEW_LEADER`
    /// listener, then spawns the two background tasks that keep both alive
    /// for as long as the returned [`Arc<ClientStub>`] (or its clones)
    /// survive. `initial_leader` is the best guess at startup — any server
    /// address works, since a non-leader redirects the request to the real one.
    pub async fn new_and_setup(
        me: NodeId,
        multicast_addr: SocketAddr,
        iface: Ipv4Addr,
        initial_leader: NodeId,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ClientEvent>), RingVoteError> {
        let socket = Arc::new(UdpSocket::bind(me.to_socket_addr()).await?);
        let mcast_socket = discovery::bind_multicast_socket(multicast_addr, iface).await?;

        let stub = Arc::new(ClientStub {
            me,
            socket: socket.clone(),
            inner: Mutex::new(Inner {
                client_id: None,
                token: None,
                leader: initial_leader,
                pending: HashMap::new(),
                receive_states: HashMap::new(),
            }),
            next_request_id: AtomicU64::new(1),
            request_timeout: Duration::from_millis(500),
            max_retries: 5,
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_unicast_listener(stub.clone(), events_tx.clone()));
        tokio::spawn(run_multicast_listener(mcast_socket, stub.clone(), events_tx));

        Ok((stub, events_rx))
    }

    pub async fn id(&self) -> Option<ClientId> {
        self.inner.lock().await.client_id
    }

    async fn current_leader(&self) -> NodeId {
        self.inner.lock().await.leader
    }

    /// Sends `op` to the believed leader, retrying on timeout and following
    /// `Redirect` replies, up to `max_retries` hops. Re-issuing the same
    /// `request_id` on retry makes retries idempotent server-side.
    async fn request(&self, op: ServiceOp) -> Result<ServiceResult, RingVoteError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (client_id, token) = {
            let inner = self.inner.lock().await;
            (inner.client_id, inner.token)
        };
        let req = ServiceRequest { request_id, client_id, token, op };

        for _ in 0..=self.max_retries {
            let target = self.current_leader().await;
            let (tx, rx) = oneshot::channel();
            {
                let mut inner = self.inner.lock().await;
                inner.pending.insert(request_id, tx);
            }

            let wire = WireMsg::Service(req.clone());
            let buf = wire.encode()?;
            if let Err(e) = self.socket.send_to(&buf, target.to_socket_addr()).await {
                pf_warn!("send to believed leader {} failed: {}", target, e);
            }

            match tokio::time::timeout(self.request_timeout, rx).await {
                Ok(Ok(reply)) => match reply.result {
                    ServiceResult::Redirect { leader_id: Some(leader) } => {
                        self.inner.lock().await.leader = leader;
                        continue;
                    }
                    ServiceResult::Redirect { leader_id: None } => {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                    other => return Ok(other),
                },
                _ => {
                    self.inner.lock().await.pending.remove(&request_id);
                    continue;
                }
            }
        }
        Err(RingVoteError::new(
            ErrorKind::TransientIo,
            format!("request {} exhausted retries with no leader reachable", request_id),
        ))
    }

    pub async fn register(&self) -> Result<(ClientId, Token, NodeId), RingVoteError> {
        match self.request(ServiceOp::Register { address: self.me }).await? {
            ServiceResult::Registered { client_id, token, leader_id } => {
                let mut inner = self.inner.lock().await;
                inner.client_id = Some(client_id);
                inner.token = Some(token);
                inner.leader = leader_id;
                Ok((client_id, token, leader_id))
            }
            ServiceResult::Error { code, message } => Err(service_error(code, message)),
            other => Err(unexpected_reply(other)),
        }
    }

    pub async fn create_group(&self, name: impl Into<String>) -> Result<(), RingVoteError> {
        match self.request(ServiceOp::CreateGroup { name: name.into() }).await? {
            ServiceResult::GroupCreated | ServiceResult::Duplicate => Ok(()),
            ServiceResult::Error { code, message } => Err(service_error(code, message)),
            other => Err(unexpected_reply(other)),
        }
    }

    pub async fn join_group(&self, name: impl Into<String>) -> Result<u64, RingVoteError> {
        let name = name.into();
        match self.request(ServiceOp::JoinGroup { name: name.clone() }).await? {
            ServiceResult::Joined { fo_seq } => {
                let leader = self.current_leader().await;
                let mut inner = self.inner.lock().await;
                inner
                    .receive_states
                    .entry((name, leader))
                    .or_insert_with(|| ReceiveState::new(fo_seq));
                Ok(fo_seq)
            }
            ServiceResult::Duplicate => Ok(0),
            ServiceResult::Error { code, message } => Err(service_error(code, message)),
            other => Err(unexpected_reply(other)),
        }
    }

    pub async fn leave_group(&self, name: impl Into<String>) -> Result<(), RingVoteError> {
        match self.request(ServiceOp::LeaveGroup { name: name.into() }).await? {
            ServiceResult::Left | ServiceResult::Duplicate => Ok(()),
            ServiceResult::Error { code, message } => Err(service_error(code, message)),
            other => Err(unexpected_reply(other)),
        }
    }

    pub async fn start_vote(
        &self,
        group: impl Into<String>,
        topic: impl Into<String>,
        options: Vec<String>,
        timeout_ms: u64,
    ) -> Result<VoteId, RingVoteError> {
        let op = ServiceOp::StartVote {
            group: group.into(),
            topic: topic.into(),
            options,
            timeout_ms,
        };
        match self.request(op).await? {
            ServiceResult::VoteStarted { vote_id } => Ok(vote_id),
            ServiceResult::Error { code, message } => Err(service_error(code, message)),
            other => Err(unexpected_reply(other)),
        }
    }

    pub async fn cast_ballot(
        &self,
        vote_id: VoteId,
        option_index: usize,
    ) -> Result<(), RingVoteError> {
        match self.request(ServiceOp::CastBallot { vote_id, option_index }).await? {
            ServiceResult::BallotAccepted | ServiceResult::Duplicate => Ok(()),
            ServiceResult::Error { code, message } => Err(service_error(code, message)),
            other => Err(unexpected_reply(other)),
        }
    }
}

fn service_error(code: ServiceErrorCode, message: String) -> RingVoteError {
    let kind = match code {
        ServiceErrorCode::AuthFailed => ErrorKind::Auth,
        ServiceErrorCode::NoLeader => ErrorKind::TransientIo,
        _ => ErrorKind::StateViolation,
    };
    RingVoteError::new(kind, format!("{:?}: {}", code, message))
}

fn unexpected_reply(result: ServiceResult) -> RingVoteError {
    RingVoteError::new(
        ErrorKind::ProtocolUnexpected,
        format!("unexpected service reply: {:?}", result),
    )
}

/// Reads the client's own unicast socket: [`ServiceReply`]s complete a
/// pending [`ClientStub::request`] call; [`McastMsg::Deliver`]s are run
/// through the matching [`ReceiveState`] and acked regardless of ordering.
async fn run_unicast_listener(stub: Arc<ClientStub>, events: mpsc::UnboundedSender<ClientEvent>) {
    let mut buf = [0u8; 65536];
    loop {
        let (n, _from) = match stub.socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                pf_warn!("client unicast recv error: {}", e);
                continue;
            }
        };
        let msg = match WireMsg::decode(&buf[..n]) {
            Ok(m) => m,
            Err(_) => continue,
        };
        match msg {
            WireMsg::ServiceReply(reply) => {
                let mut inner = stub.inner.lock().await;
                if let Some(tx) = inner.pending.remove(&reply.request_id) {
                    let _ = tx.send(reply);
                }
            }
            WireMsg::Mcast(McastMsg::Deliver { group, sender, seq, payload }) => {
                let client_id = stub.inner.lock().await.client_id;
                let delivered = {
                    let mut inner = stub.inner.lock().await;
                    let rs = inner
                        .receive_states
                        .entry((group.clone(), sender))
                        .or_insert_with(|| ReceiveState::new(0));
                    rs.on_deliver(seq, payload)
                };
                for p in delivered {
                    if let Some(ev) = payload_to_event(&group, p) {
                        let _ = events.send(ev);
                    }
                }
                if let Some(client_id) = client_id {
                    let ack = WireMsg::Mcast(McastMsg::Ack {
                        group,
                        sender,
                        seq,
                        from: client_id,
                    });
                    if let Ok(out) = ack.encode() {
                        let _ = stub.socket.send_to(&out, sender.to_socket_addr()).await;
                    }
                }
            }
            _ => {}
        }
    }
}

/// Reads the multicast socket for `NEW_LEADER` broadcasts and retargets the
/// stub's believed leader so subsequent requests go straight to it.
async fn run_multicast_listener(
    socket: UdpSocket,
    stub: Arc<ClientStub>,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    let mut buf = [0u8; 65536];
    loop {
        let (n, _from) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                pf_warn!("client multicast recv error: {}", e);
                continue;
            }
        };
        if let Ok(WireMsg::NewLeader(NewLeaderMsg { epoch, leader })) = WireMsg::decode(&buf[..n]) {
            stub.inner.lock().await.leader = leader;
            let _ = events.send(ClientEvent::NewLeader { epoch, leader });
        }
    }
}

fn payload_to_event(group: &str, payload: McastPayload) -> Option<ClientEvent> {
    Some(match payload {
        McastPayload::VoteOpen(meta) => ClientEvent::VoteOpen {
            group: group.to_string(),
            vote_id: meta.vote_id,
            topic: meta.topic,
            options: meta.options,
            deadline_ms: meta.deadline_ms,
        },
        McastPayload::BallotCounted { vote_id, client, option_index } => {
            ClientEvent::BallotCounted {
                group: group.to_string(),
                vote_id,
                client,
                option_index,
            }
        }
        McastPayload::VoteResult { vote_id, tally } => ClientEvent::VoteResult {
            group: group.to_string(),
            vote_id,
            tally,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_error_maps_auth_failed_to_auth_kind() {
        let err = service_error(ServiceErrorCode::AuthFailed, "bad token".into());
        assert_eq!(err.kind(), ErrorKind::Auth);
    }

    #[test]
    fn service_error_maps_name_taken_to_state_violation() {
        let err = service_error(ServiceErrorCode::NameTaken, "taken".into());
        assert_eq!(err.kind(), ErrorKind::StateViolation);
    }
}
