//! Server node orchestrator: wires up the UDP sockets and spawns the full
//! task set, dispatches inbound datagrams by their [`WireMsg`] tag, and
//! reacts to election-driven leadership transitions by starting or stopping
//! the replication leader task.
//!
//! Task inventory (eight concurrent tasks):
//! 1. [`discovery::run_announcer`] — periodic ANNOUNCE + MemberSet sweep.
//! 2. [`run_multicast_receiver`] — reads the multicast socket for ANNOUNCEs;
//!    NEW_LEADER broadcasts go out on this same multicast group, but that's
//!    an outbound-only write from [`run_leadership_manager`] below.
//! 3. [`run_unicast_receiver`] — reads the unicast socket, dispatches by tag.
//! 4. [`heartbeat::run_prober`] — neighbour liveness probing.
//! 5. [`election::run_driver`] — HS election state machine driver.
//! 6. [`multicast::run_sender`] — FO-multicast fan-out + retransmit.
//! 7. [`service::run_vote_scheduler`] — vote-deadline closer.
//! 8. [`run_leadership_manager`] — starts/stops replication leader/failover
//!    on each `LeaderElected` transition, running unconditionally rather
//!    than being gated on current role.
//!
//! Client requests are handled inline inside [`run_unicast_receiver`] rather
//! than by a ninth dedicated worker task: a single client-request worker
//! makes the coarse mutex's serialization meaningful, and the unicast
//! receiver is already that single task since nothing else reads the
//! unicast socket.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use crate::discovery::{self, BelievedLeader, Membership};
use crate::election;
use crate::heartbeat::{self, HeartbeatState};
use crate::multicast::{self, ClientDirectory, MulticastHandle};
use crate::replication::{self, ReplicationCore, ReplicationHandle, SubmitOp};
use crate::ring::RingKeeper;
use crate::service::{self, ServiceState};
use crate::types::NodeId;
use crate::utils::RingVoteError;
use crate::wire::{McastMsg, NewLeaderMsg, WireMsg};

/// Environment-tunable timing constants.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct RingVoteConfig {
    pub discovery_interval_ms: u64,
    pub discovery_timeout_ms: u64,
    pub hb_interval_ms: u64,
    pub hb_timeout_ms: u64,
    pub election_timeout_ms: u64,
    pub repl_timeout_ms: u64,
    pub fo_retransmit_ms: u64,
    pub failover_handshake_ms: u64,
}

impl Default for RingVoteConfig {
    fn default() -> Self {
        RingVoteConfig {
            discovery_interval_ms: 500,
            discovery_timeout_ms: 3_000,
            hb_interval_ms: 200,
            hb_timeout_ms: 1_000,
            election_timeout_ms: 2_000,
            repl_timeout_ms: 300,
            fo_retransmit_ms: 300,
            failover_handshake_ms: 500,
        }
    }
}

/// Parses `config_str` into a [`RingVoteConfig`], falling back field-by-field
/// to defaults when absent, mirroring Summerset's `parsed_config!`
/// convention.
pub fn parse_config(config_str: Option<&str>) -> Result<RingVoteConfig, RingVoteError> {
    parsed_config!(config_str => RingVoteConfig;
        discovery_interval_ms, discovery_timeout_ms,
        hb_interval_ms, hb_timeout_ms,
        election_timeout_ms, repl_timeout_ms,
        fo_retransmit_ms, failover_handshake_ms)
}

/// Multicast-group directory backed directly by [`ServiceState`]'s client
/// records, satisfying [`ClientDirectory`] for the FO-multicast sender.
struct ServiceDirectory(Arc<ServiceState>);

#[async_trait]
impl ClientDirectory for ServiceDirectory {
    async fn address_of(&self, client: crate::types::ClientId) -> Option<NodeId> {
        self.0.address_of(client).await
    }
}

/// A running node: holds the handles needed to drive it and to shut it down.
pub struct ServerNode {
    pub me: NodeId,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ServerNode {
    /// Binds sockets, spawns every task, and returns once the node is live.
    pub async fn start(
        me: NodeId,
        multicast_addr: SocketAddr,
        iface: Ipv4Addr,
        config: RingVoteConfig,
    ) -> Result<Self, RingVoteError> {
        crate::utils::logger_init(me.to_string());
        pf_info!("starting ringvote node at {}", me);

        let unicast_socket = Arc::new(UdpSocket::bind(me.to_socket_addr()).await?);
        let mcast_socket = Arc::new(discovery::bind_multicast_socket(multicast_addr, iface).await?);
        let mcast_recv_socket = mcast_socket.clone();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ring_keeper, ring_handle) = RingKeeper::new(me);
        let (election_needed_tx, election_needed_rx) = mpsc::unbounded_channel();
        let membership = Membership::new(me, ring_keeper, election_needed_tx.clone());
        let heartbeat_state = HeartbeatState::new(me, ring_handle.clone());

        let (believed_leader_tx, believed_leader_rx) = watch::channel::<BelievedLeader>(None);
        let (leader_lost_tx, mut leader_lost_rx) = mpsc::unbounded_channel::<NodeId>();
        let (election_inbound_tx, election_inbound_rx) = mpsc::unbounded_channel();
        let (new_leader_tx, new_leader_rx) = mpsc::unbounded_channel::<(u64, NodeId)>();

        let (repl_handle, repl_submit_rx) = ReplicationHandle::new();
        let (mcast_handle, mcast_events_rx) = MulticastHandle::new();
        let (service_state, vote_deadlines_rx) = ServiceState::new(me, repl_handle.clone(), mcast_handle.clone());
        let repl_core = ReplicationCore::new(me, service_state.clone());
        let directory: Arc<dyn ClientDirectory> = Arc::new(ServiceDirectory(service_state.clone()));

        let (repl_ack_tx, repl_ack_rx) = mpsc::unbounded_channel::<(u64, NodeId)>();
        let (state_collect_tx, state_collect_rx) = mpsc::unbounded_channel();

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(discovery::run_announcer(
            unicast_socket.clone(),
            multicast_addr,
            me,
            Duration::from_millis(config.discovery_interval_ms),
            Duration::from_millis(config.discovery_timeout_ms),
            membership.clone(),
            believed_leader_rx.clone(),
            shutdown_rx.clone(),
        )));

        tasks.push(tokio::spawn(run_multicast_receiver(
            mcast_recv_socket,
            membership.clone(),
            shutdown_rx.clone(),
        )));

        tasks.push(tokio::spawn(heartbeat::run_prober(
            unicast_socket.clone(),
            heartbeat_state.clone(),
            membership.clone(),
            Duration::from_millis(config.hb_interval_ms),
            Duration::from_millis(config.hb_timeout_ms),
            believed_leader_rx.clone(),
            leader_lost_tx,
            shutdown_rx.clone(),
        )));

        tasks.push(tokio::spawn(election::run_driver(
            unicast_socket.clone(),
            me,
            ring_handle.clone(),
            election_needed_rx,
            election_inbound_rx,
            Duration::from_millis(config.election_timeout_ms),
            believed_leader_tx,
            new_leader_tx,
            shutdown_rx.clone(),
        )));

        tasks.push(tokio::spawn(multicast::run_sender(
            unicast_socket.clone(),
            me,
            directory,
            mcast_events_rx,
            Duration::from_millis(config.fo_retransmit_ms),
            shutdown_rx.clone(),
        )));

        tasks.push(tokio::spawn(service::run_vote_scheduler(
            service_state.clone(),
            vote_deadlines_rx,
            shutdown_rx.clone(),
        )));

        // Re-trigger election on neighbour loss beyond what Membership::remove
        // already signals, so a lost believed-leader gets a fresh round even
        // if, for some reason, the membership change alone didn't (defensive
        // duplication is harmless: the driver no-ops a redundant signal).
        {
            let election_needed_tx = election_needed_tx.clone();
            let mut shutdown_rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        lost = leader_lost_rx.recv() => {
                            match lost {
                                None => break,
                                Some(_) => { let _ = election_needed_tx.send(()); }
                            }
                        }
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() { break; }
                        }
                    }
                }
            }));
        }

        tasks.push(tokio::spawn(run_leadership_manager(
            unicast_socket.clone(),
            mcast_socket,
            multicast_addr,
            me,
            ring_handle.clone(),
            repl_core.clone(),
            new_leader_rx,
            repl_submit_rx,
            repl_ack_rx,
            state_collect_rx,
            Duration::from_millis(config.repl_timeout_ms),
            Duration::from_millis(config.failover_handshake_ms),
            shutdown_rx.clone(),
        )));

        let believed_leader_for_requests = believed_leader_rx.clone();

        tasks.push(tokio::spawn(run_unicast_receiver(
            unicast_socket,
            me,
            membership,
            heartbeat_state,
            election_inbound_tx,
            repl_core,
            repl_ack_tx,
            state_collect_tx,
            mcast_handle,
            service_state,
            believed_leader_for_requests,
            shutdown_rx,
        )));

        Ok(ServerNode { me, shutdown_tx, tasks })
    }

    /// Signals every task to stop and waits for them to finish (graceful
    /// shutdown, installed behind a `ctrlc` handler by `ringvote_server`).
    pub async fn shutdown(self) {
        pf_info!("shutting down");
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Reads the multicast socket and forwards ANNOUNCEs to [`Membership`].
/// NEW_LEADER notices are sent on this same multicast group by
/// [`run_leadership_manager`], but that's an outbound-only write on a socket
/// this task only ever reads from, so it doesn't show up here.
async fn run_multicast_receiver(
    socket: Arc<UdpSocket>,
    membership: Arc<Membership>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = [0u8; 65536];
    loop {
        tokio::select! {
            recv = socket.recv_from(&mut buf) => {
                match recv {
                    Ok((n, _from)) => {
                        if let Ok(WireMsg::Announce(a)) = WireMsg::decode(&buf[..n]) {
                            membership.on_announce(a.id);
                        }
                    }
                    Err(e) => pf_warn!("multicast recv error: {}", e),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    pf_info!("multicast receiver shutting down");
                    break;
                }
            }
        }
    }
}

/// Reads the unicast socket and dispatches every inbound [`WireMsg`] by tag.
/// Client [`crate::wire::ServiceRequest`]s are handled inline; everything
/// else is routed to its owning subsystem.
#[allow(clippy::too_many_arguments)]
async fn run_unicast_receiver(
    socket: Arc<UdpSocket>,
    me: NodeId,
    membership: Arc<Membership>,
    heartbeat_state: Arc<HeartbeatState>,
    election_inbound_tx: mpsc::UnboundedSender<crate::wire::ElectionMsg>,
    repl_core: Arc<ReplicationCore>,
    repl_ack_tx: mpsc::UnboundedSender<(u64, NodeId)>,
    state_collect_tx: mpsc::UnboundedSender<(u64, u64, crate::wire::ReplicatedState, NodeId)>,
    mcast_handle: MulticastHandle,
    service_state: Arc<ServiceState>,
    believed_leader: watch::Receiver<BelievedLeader>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = [0u8; 65536];
    loop {
        tokio::select! {
            recv = socket.recv_from(&mut buf) => {
                match recv {
                    Ok((n, from_addr)) => {
                        let from: NodeId = from_addr.into();
                        let msg = match WireMsg::decode(&buf[..n]) {
                            Ok(msg) => msg,
                            Err(e) => {
                                pf_warn!("failed to decode datagram from {}: {}", from_addr, e);
                                continue;
                            }
                        };
                        match msg {
                            WireMsg::Announce(a) => {
                                membership.on_announce(a.id);
                            }
                            WireMsg::Election(em) => {
                                let _ = election_inbound_tx.send(em);
                            }
                            WireMsg::Heartbeat(crate::wire::HeartbeatMsg::Ping { from: peer, seq }) => {
                                heartbeat_state.handle_ping(&socket, peer, seq).await;
                            }
                            WireMsg::Heartbeat(crate::wire::HeartbeatMsg::Ack { from: peer, seq }) => {
                                heartbeat_state.handle_ack(peer, seq);
                            }
                            WireMsg::Repl(rm) => {
                                replication::handle_incoming_from(
                                    &repl_core, &socket, from, rm,
                                    Some(&repl_ack_tx), Some(&state_collect_tx),
                                ).await;
                            }
                            WireMsg::Mcast(McastMsg::Ack { group, seq, from: client, .. }) => {
                                multicast::handle_ack(&mcast_handle, group, seq, client);
                            }
                            WireMsg::Mcast(McastMsg::Deliver { .. }) => {
                                // servers never receive Deliver; only clients do.
                            }
                            WireMsg::Service(req) => {
                                let reply = match *believed_leader.borrow() {
                                    Some((_, leader)) if leader == me => {
                                        service_state.handle_request(req).await
                                    }
                                    Some((_, leader)) => crate::wire::ServiceReply {
                                        request_id: req.request_id,
                                        result: crate::wire::ServiceResult::Redirect { leader_id: Some(leader) },
                                    },
                                    None => crate::wire::ServiceReply {
                                        request_id: req.request_id,
                                        result: crate::wire::ServiceResult::Redirect { leader_id: None },
                                    },
                                };
                                let wire = WireMsg::ServiceReply(reply);
                                if let Ok(out) = wire.encode() {
                                    let _ = socket.send_to(&out, from_addr).await;
                                }
                            }
                            WireMsg::ServiceReply(_) | WireMsg::NewLeader(_) => {
                                // server-to-client messages; a server never
                                // receives its own downstream message shapes.
                            }
                        }
                    }
                    Err(e) => pf_warn!("unicast recv error: {}", e),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    pf_info!("unicast receiver shutting down");
                    break;
                }
            }
        }
    }
}

/// Starts and stops the replication leader task (plus the one-shot failover
/// handshake) on each `LeaderElected` transition this node wins, and tears
/// down the previous leader task (if any) the moment a new one is announced
/// — a new `HS_LEADER` always supersedes the old one.
///
/// Owns the `submit`/`ack` receiver pair across this node's non-leader
/// stretches: [`ReplicationHandle::submit`] calls queue up on the sender
/// side (held permanently by [`ServiceState`]) whether or not anyone is
/// currently reading them, and are drained the moment this node next wins
/// an election and starts [`replication::run_leader`] again.
///
/// Also broadcasts `NEW_LEADER` on the multicast group the moment the
/// failover handshake settles on a winning epoch, so clients learn of the
/// new leader without waiting for a redirected request.
#[allow(clippy::too_many_arguments)]
async fn run_leadership_manager(
    socket: Arc<UdpSocket>,
    mcast_socket: Arc<UdpSocket>,
    multicast_addr: SocketAddr,
    me: NodeId,
    ring: crate::ring::RingHandle,
    repl_core: Arc<ReplicationCore>,
    mut new_leader_rx: mpsc::UnboundedReceiver<(u64, NodeId)>,
    repl_submit_rx: mpsc::UnboundedReceiver<SubmitOp>,
    repl_ack_rx: mpsc::UnboundedReceiver<(u64, NodeId)>,
    mut state_collect_rx: mpsc::UnboundedReceiver<(u64, u64, crate::wire::ReplicatedState, NodeId)>,
    repl_timeout: Duration,
    failover_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut current_leader_task: Option<
        tokio::task::JoinHandle<(
            mpsc::UnboundedReceiver<SubmitOp>,
            mpsc::UnboundedReceiver<(u64, NodeId)>,
        )>,
    > = None;
    let mut leader_shutdown_tx: Option<watch::Sender<bool>> = None;
    let mut submit_rx = Some(repl_submit_rx);
    let mut ack_rx = Some(repl_ack_rx);

    loop {
        tokio::select! {
            ev = new_leader_rx.recv() => {
                match ev {
                    None => break,
                    Some((epoch, leader)) => {
                        if let Some(tx) = leader_shutdown_tx.take() {
                            let _ = tx.send(true);
                        }
                        if let Some(task) = current_leader_task.take() {
                            if let Ok((s, a)) = task.await {
                                submit_rx = Some(s);
                                ack_rx = Some(a);
                            }
                        }
                        if leader != me {
                            continue;
                        }
                        pf_info!("won election for epoch {}, running failover handshake", epoch);
                        let ring_view = ring.current();
                        let won_epoch = replication::run_failover_handshake(
                            &socket, me, epoch, &ring_view, &repl_core,
                            &mut state_collect_rx, failover_timeout,
                        ).await;

                        let notice = WireMsg::NewLeader(NewLeaderMsg { epoch: won_epoch, leader: me });
                        if let Ok(buf) = notice.encode() {
                            if let Err(e) = mcast_socket.send_to(&buf, multicast_addr).await {
                                pf_warn!("failed to broadcast NEW_LEADER: {}", e);
                            }
                        }

                        let (leader_shutdown, leader_shutdown_rx) = watch::channel(false);
                        leader_shutdown_tx = Some(leader_shutdown);
                        let (s, a) = (submit_rx.take().unwrap(), ack_rx.take().unwrap());
                        current_leader_task = Some(tokio::spawn(replication::run_leader(
                            socket.clone(), me, won_epoch, ring.clone(),
                            s, a, repl_timeout, leader_shutdown_rx,
                        )));
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    if let Some(tx) = leader_shutdown_tx.take() {
                        let _ = tx.send(true);
                    }
                    if let Some(task) = current_leader_task.take() {
                        let _ = task.await;
                    }
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_are_reasonable() {
        let cfg = RingVoteConfig::default();
        assert!(cfg.hb_timeout_ms > cfg.hb_interval_ms);
        assert!(cfg.discovery_timeout_ms > cfg.discovery_interval_ms);
    }

    #[test]
    fn parse_config_falls_back_to_defaults_on_empty() {
        let cfg = parse_config(None).unwrap();
        assert_eq!(cfg.hb_interval_ms, RingVoteConfig::default().hb_interval_ms);
    }

    #[test]
    fn parse_config_overrides_specified_fields() {
        let cfg = parse_config(Some("hb_interval_ms = 50")).unwrap();
        assert_eq!(cfg.hb_interval_ms, 50);
        assert_eq!(cfg.hb_timeout_ms, RingVoteConfig::default().hb_timeout_ms);
    }
}
