//! FO-reliable multicast (§4.6): FIFO, reliable-eventual delivery of vote
//! notifications from the leader to a group's members.
//!
//! The sender side ([`DeliveryState`], [`run_sender`]) runs on the leader as
//! its own task (§5 task 6). The receiver side ([`ReceiveState`]) is pure,
//! socket-free logic shared with `ringvote_client`, which owns the actual
//! per-(group, sender) instances and the socket that feeds them — mirroring
//! how `election.rs` keeps its HS transition logic synchronous and
//! testable independent of any socket.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};

use crate::types::{ClientId, NodeId};
use crate::utils::Timer;
use crate::wire::{McastMsg, McastPayload, WireMsg};

/// Looks up a client's unicast address; Service owns the real directory
/// backed by `ClientRecords` (§3).
#[async_trait]
pub trait ClientDirectory: Send + Sync {
    async fn address_of(&self, client: ClientId) -> Option<NodeId>;
}

struct Buffered {
    payload: McastPayload,
    acked_by: HashSet<ClientId>,
}

/// Per-group send-side state (§3 `DeliveryState`).
#[derive(Default)]
struct DeliveryState {
    next_send_seq: u64,
    members: HashSet<ClientId>,
    buffer: BTreeMap<u64, Buffered>,
}

enum MulticastEvent {
    Send {
        group: String,
        payload: McastPayload,
        respond_to: oneshot::Sender<u64>,
    },
    SetMembers {
        group: String,
        members: Vec<ClientId>,
    },
    Ack {
        group: String,
        seq: u64,
        client: ClientId,
    },
    CurrentSeq {
        group: String,
        respond_to: oneshot::Sender<u64>,
    },
}

/// Handle used by Service to drive the sender task.
#[derive(Clone)]
pub struct MulticastHandle {
    tx: mpsc::UnboundedSender<MulticastEvent>,
}

impl MulticastHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MulticastEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MulticastHandle { tx }, rx)
    }

    /// Multicasts `payload` to `group`'s current members, returning the
    /// assigned sequence number (useful for `JOIN_GROUP`'s "current FO seq"
    /// reply, §4.7).
    pub async fn send(&self, group: impl Into<String>, payload: McastPayload) -> Option<u64> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(MulticastEvent::Send {
                group: group.into(),
                payload,
                respond_to: tx,
            })
            .ok()?;
        rx.await.ok()
    }

    /// Updates the expected-ack set for a group on membership change
    /// (§4.6: "on member-set change, update the expected ack set").
    pub fn set_members(&self, group: impl Into<String>, members: Vec<ClientId>) {
        let _ = self.tx.send(MulticastEvent::SetMembers {
            group: group.into(),
            members,
        });
    }

    fn ack(&self, group: String, seq: u64, client: ClientId) {
        let _ = self.tx.send(MulticastEvent::Ack { group, seq, client });
    }

    /// The sender's current `S_g` for `group` (0 if nothing has been sent
    /// yet), handed to a newly-joined member so it knows where its
    /// `ReceiveState::expected_seq` starts (§4.6).
    pub async fn current_seq(&self, group: impl Into<String>) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(MulticastEvent::CurrentSeq {
                group: group.into(),
                respond_to: tx,
            })
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Runs the FO-multicast sender + retransmitter task (§5 task 6).
pub async fn run_sender(
    socket: Arc<UdpSocket>,
    me: NodeId,
    directory: Arc<dyn ClientDirectory>,
    mut events: mpsc::UnboundedReceiver<MulticastEvent>,
    retransmit_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut groups: HashMap<String, DeliveryState> = HashMap::new();
    let mut retransmit = Timer::new(retransmit_interval);

    loop {
        tokio::select! {
            ev = events.recv() => {
                match ev {
                    None => break,
                    Some(MulticastEvent::Send { group, payload, respond_to }) => {
                        let state = groups.entry(group.clone()).or_default();
                        let seq = state.next_send_seq;
                        state.next_send_seq += 1;
                        let recipients: Vec<ClientId> = state.members.iter().copied().collect();
                        state.buffer.insert(seq, Buffered { payload: payload.clone(), acked_by: HashSet::new() });
                        let _ = respond_to.send(seq);
                        for client in recipients {
                            deliver_to(&socket, &directory, me, &group, seq, &payload, client).await;
                        }
                    }
                    Some(MulticastEvent::SetMembers { group, members }) => {
                        let state = groups.entry(group).or_default();
                        state.members = members.into_iter().collect();
                        prune_fully_acked(state);
                    }
                    Some(MulticastEvent::Ack { group, seq, client }) => {
                        if let Some(state) = groups.get_mut(&group) {
                            if let Some(entry) = state.buffer.get_mut(&seq) {
                                entry.acked_by.insert(client);
                            }
                            prune_fully_acked(state);
                        }
                    }
                    Some(MulticastEvent::CurrentSeq { group, respond_to }) => {
                        let seq = groups.get(&group).map(|s| s.next_send_seq).unwrap_or(0);
                        let _ = respond_to.send(seq);
                    }
                }
            }
            _ = retransmit.fired() => {
                for (group, state) in groups.iter() {
                    for (&seq, entry) in state.buffer.iter() {
                        for &client in state.members.iter().filter(|c| !entry.acked_by.contains(c)) {
                            deliver_to(&socket, &directory, me, group, seq, &entry.payload, client).await;
                        }
                    }
                }
                retransmit.reset(retransmit_interval);
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    pf_info!("multicast sender task shutting down");
                    break;
                }
            }
        }
    }
}

fn prune_fully_acked(state: &mut DeliveryState) {
    state
        .buffer
        .retain(|_, entry| !state.members.iter().all(|c| entry.acked_by.contains(c)));
}

async fn deliver_to(
    socket: &UdpSocket,
    directory: &Arc<dyn ClientDirectory>,
    me: NodeId,
    group: &str,
    seq: u64,
    payload: &McastPayload,
    client: ClientId,
) {
    let Some(addr) = directory.address_of(client).await else {
        return; // client gone; SetMembers will eventually drop it from state.members
    };
    let msg = WireMsg::Mcast(McastMsg::Deliver {
        group: group.to_string(),
        sender: me,
        seq,
        payload: payload.clone(),
    });
    if let Ok(buf) = msg.encode() {
        if let Err(e) = socket.send_to(&buf, addr.to_socket_addr()).await {
            pf_warn!("failed to deliver fo-multicast seq {} to client {}: {}", seq, client, e);
        }
    }
}

/// Dispatches an inbound `McastMsg::Ack` seen by the unicast receiver.
pub fn handle_ack(handle: &MulticastHandle, group: String, seq: u64, client: ClientId) {
    handle.ack(group, seq, client);
}

/// Per-(group, sender) receive-side state (§3 `ReceiveState`), held by a
/// group member (client). Pure and socket-free: callers drive it with
/// [`ReceiveState::on_deliver`] and handle the returned actions themselves.
pub struct ReceiveState {
    expected_seq: u64,
    holdback: BTreeMap<u64, McastPayload>,
}

impl ReceiveState {
    /// `join_seq` is the sender's `S_g` at join time, handed to the client
    /// out-of-band in its `JOIN_GROUP` reply (§4.6).
    pub fn new(join_seq: u64) -> Self {
        ReceiveState {
            expected_seq: join_seq,
            holdback: BTreeMap::new(),
        }
    }

    /// Returns the payloads newly ready for application-level delivery, in
    /// order. Always acks regardless of duplicate/future/in-order (§4.6:
    /// "in all cases, reply ACK").
    pub fn on_deliver(&mut self, seq: u64, payload: McastPayload) -> Vec<McastPayload> {
        if seq < self.expected_seq {
            return vec![]; // duplicate
        }
        if seq > self.expected_seq {
            self.holdback.insert(seq, payload);
            return vec![];
        }
        let mut delivered = vec![payload];
        self.expected_seq += 1;
        while let Some(next) = self.holdback.remove(&self.expected_seq) {
            delivered.push(next);
            self.expected_seq += 1;
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex as StdMutex;

    fn node(port: u16) -> NodeId {
        NodeId::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    fn payload(n: u64) -> McastPayload {
        McastPayload::BallotCounted {
            vote_id: 1,
            client: n,
            option_index: 0,
        }
    }

    #[test]
    fn receive_state_delivers_in_order_with_holdback() {
        let mut rs = ReceiveState::new(0);
        assert_eq!(rs.on_deliver(1, payload(1)), vec![]); // out of order, held back
        let delivered = rs.on_deliver(0, payload(0));
        assert_eq!(delivered.len(), 2); // 0 then the held-back 1 both drain
    }

    #[test]
    fn receive_state_drops_duplicates() {
        let mut rs = ReceiveState::new(0);
        rs.on_deliver(0, payload(0));
        assert_eq!(rs.on_deliver(0, payload(0)), vec![]);
    }

    #[test]
    fn receive_state_starts_from_join_seq() {
        let mut rs = ReceiveState::new(5);
        assert_eq!(rs.on_deliver(4, payload(4)), vec![]); // before join, duplicate
        assert_eq!(rs.on_deliver(5, payload(5)).len(), 1);
    }

    struct FakeDirectory {
        addrs: StdMutex<HashMap<ClientId, NodeId>>,
    }

    #[async_trait]
    impl ClientDirectory for FakeDirectory {
        async fn address_of(&self, client: ClientId) -> Option<NodeId> {
            self.addrs.lock().unwrap().get(&client).copied()
        }
    }

    #[tokio::test]
    async fn delivery_state_tracks_acks_and_prunes_when_complete() {
        let directory = Arc::new(FakeDirectory {
            addrs: StdMutex::new(HashMap::from([(1, node(7001)), (2, node(7002))])),
        });
        let (handle, rx) = MulticastHandle::new();
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_sender(
            socket,
            node(6001),
            directory,
            rx,
            Duration::from_secs(100),
            shutdown_rx,
        ));

        handle.set_members("g", vec![1, 2]);
        let seq = handle.send("g", payload(0)).await.unwrap();
        assert_eq!(seq, 0);

        handle.ack("g".into(), 0, 1);
        handle.ack("g".into(), 0, 2);

        // give the task a beat to process the acks and prune
        tokio::time::sleep(Duration::from_millis(20)).await;
        task.abort();
    }
}
