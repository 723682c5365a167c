//! Heartbeat (§4.3): unicast liveness probing of the current left neighbour,
//! driving fast failure detection independent of Discovery's slower sweep.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use crate::discovery::Membership;
use crate::ring::RingHandle;
use crate::types::NodeId;
use crate::wire::{HeartbeatMsg, WireMsg};

/// Per-neighbour heartbeat bookkeeping. Only the current left neighbour is
/// actively probed at any moment, but entries persist across ring changes
/// within the same `Arc` so a neighbour seen again after a brief ring
/// wobble doesn't start from a cold grace period unnecessarily.
pub struct HeartbeatState {
    me: NodeId,
    ring: RingHandle,
    last_ack: Mutex<HashMap<NodeId, Instant>>,
    next_seq: Mutex<HashMap<NodeId, u64>>,
}

impl HeartbeatState {
    pub fn new(me: NodeId, ring: RingHandle) -> Arc<Self> {
        Arc::new(HeartbeatState {
            me,
            ring,
            last_ack: Mutex::new(HashMap::new()),
            next_seq: Mutex::new(HashMap::new()),
        })
    }

    /// Replies to a received `HEARTBEAT(peer, seq)` (§4.3: "on receipt ...
    /// reply HEARTBEAT_ACK to peer").
    pub async fn handle_ping(&self, socket: &UdpSocket, peer: NodeId, seq: u64) {
        let reply = WireMsg::Heartbeat(HeartbeatMsg::Ack { from: self.me, seq });
        if let Ok(buf) = reply.encode() {
            if let Err(e) = socket.send_to(&buf, SocketAddr::from(peer)).await {
                pf_warn!("failed to send heartbeat ack to {}: {}", peer, e);
            }
        }
    }

    /// Records a received `HEARTBEAT_ACK(peer, seq)`.
    pub fn handle_ack(&self, peer: NodeId, _seq: u64) {
        self.last_ack.lock().unwrap().insert(peer, Instant::now());
        pf_trace!("heartbeat ack from {}", peer);
    }

    fn touch_fresh(&self, peer: NodeId) {
        self.last_ack
            .lock()
            .unwrap()
            .entry(peer)
            .or_insert_with(Instant::now);
    }

    fn next_seq_for(&self, peer: NodeId) -> u64 {
        let mut map = self.next_seq.lock().unwrap();
        let seq = map.entry(peer).or_insert(0);
        let cur = *seq;
        *seq += 1;
        cur
    }

    fn is_dead(&self, peer: NodeId, timeout: Duration) -> bool {
        match self.last_ack.lock().unwrap().get(&peer) {
            Some(last) => Instant::now().duration_since(*last) > timeout,
            None => false, // never seen yet, still within grace period
        }
    }

    fn forget(&self, peer: NodeId) {
        self.last_ack.lock().unwrap().remove(&peer);
        self.next_seq.lock().unwrap().remove(&peer);
    }
}

/// Runs the periodic probe + timeout-check task (§5 task 4). On detecting
/// the current left neighbour's death, removes it from the `MemberSet`
/// (which itself triggers a ring rebuild and an ELECTION_NEEDED signal, see
/// [`Membership::remove`]) and additionally reports it on `leader_lost` if
/// it was the believed leader.
#[allow(clippy::too_many_arguments)]
pub async fn run_prober(
    socket: Arc<UdpSocket>,
    state: Arc<HeartbeatState>,
    membership: Arc<Membership>,
    interval: Duration,
    timeout: Duration,
    believed_leader: watch::Receiver<super::discovery::BelievedLeader>,
    leader_lost: mpsc::UnboundedSender<NodeId>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut tracked_left: Option<NodeId> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let ring = state.ring.current();
                if ring.len() <= 1 {
                    continue; // alone on the ring, nothing to probe
                }
                let left = ring.left();

                if tracked_left != Some(left) {
                    // left neighbour changed since last tick: start its
                    // grace period fresh rather than immediately declaring
                    // it dead on stale bookkeeping.
                    if let Some(old) = tracked_left {
                        state.forget(old);
                    }
                    state.touch_fresh(left);
                    tracked_left = Some(left);
                }

                if state.is_dead(left, timeout) {
                    pf_warn!("neighbour {} heartbeat timed out", left);
                    let believed = believed_leader.borrow().map(|(_, l)| l);
                    membership.remove(left);
                    state.forget(left);
                    tracked_left = None;
                    if believed == Some(left) {
                        pf_warn!("lost leader {}", left);
                        let _ = leader_lost.send(left);
                    }
                    continue;
                }

                let seq = state.next_seq_for(left);
                let msg = WireMsg::Heartbeat(HeartbeatMsg::Ping { from: state.me, seq });
                if let Ok(buf) = msg.encode() {
                    if let Err(e) = socket.send_to(&buf, SocketAddr::from(left)).await {
                        pf_warn!("failed to send heartbeat to {}: {}", left, e);
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    pf_info!("heartbeat prober shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::RingKeeper;
    use std::net::{IpAddr, Ipv4Addr};

    fn node(port: u16) -> NodeId {
        NodeId::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    #[test]
    fn unseen_neighbour_is_not_dead() {
        let (_keeper, handle) = RingKeeper::new(node(6001));
        let state = HeartbeatState::new(node(6001), handle);
        assert!(!state.is_dead(node(6002), Duration::from_millis(1)));
    }

    #[test]
    fn stale_ack_is_dead() {
        let (_keeper, handle) = RingKeeper::new(node(6001));
        let state = HeartbeatState::new(node(6001), handle);
        state
            .last_ack
            .lock()
            .unwrap()
            .insert(node(6002), Instant::now() - Duration::from_secs(10));
        assert!(state.is_dead(node(6002), Duration::from_secs(5)));
    }

    #[test]
    fn fresh_ack_is_alive() {
        let (_keeper, handle) = RingKeeper::new(node(6001));
        let state = HeartbeatState::new(node(6001), handle);
        state.handle_ack(node(6002), 1);
        assert!(!state.is_dead(node(6002), Duration::from_secs(5)));
    }

    #[test]
    fn seq_counter_increments_per_peer() {
        let (_keeper, handle) = RingKeeper::new(node(6001));
        let state = HeartbeatState::new(node(6001), handle);
        assert_eq!(state.next_seq_for(node(6002)), 0);
        assert_eq!(state.next_seq_for(node(6002)), 1);
        assert_eq!(state.next_seq_for(node(6003)), 0);
    }
}
