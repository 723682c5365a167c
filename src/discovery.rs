//! Discovery: maintains the `MemberSet` over the lossy multicast channel and
//! drives Ring rebuilds.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use crate::ring::RingKeeper;
use crate::types::NodeId;
use crate::utils::RingVoteError;
use crate::wire::{AnnounceMsg, WireMsg};

/// Shared, mutable membership bookkeeping. A plain `Mutex` is appropriate
/// here (unlike Election/FO-multicast state, which are task-owned and
/// channel-driven): `MemberSet` is read and written from both the Discovery
/// and Heartbeat tasks (owned by Discovery, read by Ring and Heartbeat),
/// plus Heartbeat removes entries directly on neighbour death.
pub struct Membership {
    me: NodeId,
    entries: Mutex<HashMap<NodeId, Instant>>,
    ring: RingKeeper,
    election_needed: mpsc::UnboundedSender<()>,
}

impl Membership {
    pub fn new(
        me: NodeId,
        ring: RingKeeper,
        election_needed: mpsc::UnboundedSender<()>,
    ) -> Arc<Self> {
        Arc::new(Membership {
            me,
            entries: Mutex::new(HashMap::new()),
            ring,
            election_needed,
        })
    }

    /// Handles a received `ANNOUNCE(peer_id)`. Returns `true` if `peer` was
    /// not previously known (a MEMBERSHIP_CHANGE).
    pub fn on_announce(&self, peer: NodeId) -> bool {
        if peer == self.me {
            return false;
        }
        let is_new = {
            let mut entries = self.entries.lock().unwrap();
            let is_new = !entries.contains_key(&peer);
            entries.insert(peer, Instant::now());
            is_new
        };
        if is_new {
            pf_info!("discovered new peer {}", peer);
            self.rebuild_and_signal();
        }
        is_new
    }

    /// Sweeps out entries whose `last_seen` exceeds `timeout`. Self is never
    /// evicted (it is not stored in `entries` to begin with).
    pub fn sweep(&self, timeout: Duration) {
        let changed = {
            let mut entries = self.entries.lock().unwrap();
            let now = Instant::now();
            let before = entries.len();
            entries.retain(|_, last_seen| now.duration_since(*last_seen) <= timeout);
            entries.len() != before
        };
        if changed {
            pf_info!("discovery sweep evicted one or more stale peers");
            self.rebuild_and_signal();
        }
    }

    /// Immediate removal, used by Heartbeat on neighbour-ack timeout, faster
    /// than waiting for the next periodic sweep.
    pub fn remove(&self, peer: NodeId) {
        let removed = self.entries.lock().unwrap().remove(&peer).is_some();
        if removed {
            pf_info!("removed dead peer {} from member set", peer);
            self.rebuild_and_signal();
        }
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.entries.lock().unwrap().keys().copied().collect()
    }

    fn rebuild_and_signal(&self) {
        let members = self.members();
        self.ring.rebuild(members);
        // Any membership change can invalidate the current leader's
        // mandate (a higher-NodeId peer may have just joined, or the
        // leader itself may have just been evicted), so every change
        // re-triggers election; the election driver quickly no-ops if
        // nothing actually needs to change.
        let _ = self.election_needed.send(());
    }
}

/// Believed-leader info piggybacked on announcements: a gossip accelerant
/// only, never authoritative.
pub type BelievedLeader = Option<(u64, NodeId)>;

/// Binds and joins the well-known multicast group. `multicast_addr`'s port
/// is bound on all interfaces; `iface` is the local interface address used
/// to join the group.
///
/// Binds with `SO_REUSEADDR`/`SO_REUSEPORT` via `socket2` so that multiple
/// server processes on the same host (the common case for every test
/// scenario, which runs a whole cluster against `127.0.0.1:600x` nodes) can
/// each join the multicast group on the same port, the way independent
/// hosts would each own it exclusively on their own network stack.
pub async fn bind_multicast_socket(
    multicast_addr: SocketAddr,
    iface: Ipv4Addr,
) -> Result<UdpSocket, RingVoteError> {
    let SocketAddr::V4(v4) = multicast_addr else {
        return Err(RingVoteError::fatal(
            "only IPv4 multicast groups are supported",
        ));
    };
    let bind_addr = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED), v4.port());

    let socket2 = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .map_err(|e| RingVoteError::fatal(format!("multicast socket creation failed: {}", e)))?;
    socket2
        .set_reuse_address(true)
        .map_err(|e| RingVoteError::fatal(format!("SO_REUSEADDR failed: {}", e)))?;
    #[cfg(unix)]
    socket2
        .set_reuse_port(true)
        .map_err(|e| RingVoteError::fatal(format!("SO_REUSEPORT failed: {}", e)))?;
    socket2
        .set_nonblocking(true)
        .map_err(|e| RingVoteError::fatal(format!("nonblocking failed: {}", e)))?;
    socket2
        .bind(&bind_addr.into())
        .map_err(|e| RingVoteError::fatal(format!("multicast bind failed: {}", e)))?;

    let socket = UdpSocket::from_std(socket2.into())
        .map_err(|e| RingVoteError::fatal(format!("tokio socket conversion failed: {}", e)))?;
    socket
        .join_multicast_v4(*v4.ip(), iface)
        .map_err(|e| RingVoteError::fatal(format!("multicast join failed: {}", e)))?;
    Ok(socket)
}

/// Runs the periodic announcement sender + sweep task. Also performs the
/// MemberSet sweep on the same tick, since both are driven by
/// the same `DISCOVERY_INTERVAL`/`DISCOVERY_TIMEOUT` cadence and neither
/// needs its own dedicated task.
pub async fn run_announcer(
    socket: Arc<UdpSocket>,
    multicast_addr: SocketAddr,
    me: NodeId,
    interval: Duration,
    timeout: Duration,
    membership: Arc<Membership>,
    believed_leader: watch::Receiver<BelievedLeader>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (epoch, leader) = believed_leader.borrow().unwrap_or((0, me));
                let leader = if leader == me && epoch == 0 { None } else { Some(leader) };
                let msg = WireMsg::Announce(AnnounceMsg {
                    id: me,
                    believed_leader: leader,
                    believed_epoch: epoch,
                });
                match msg.encode() {
                    Ok(buf) => {
                        if let Err(e) = socket.send_to(&buf, multicast_addr).await {
                            pf_warn!("failed to send announce: {}", e);
                        }
                    }
                    Err(e) => pf_warn!("failed to encode announce: {}", e),
                }
                membership.sweep(timeout);
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    pf_info!("discovery announcer shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::mpsc;

    fn node(port: u16) -> NodeId {
        NodeId::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    fn make_membership() -> (Arc<Membership>, mpsc::UnboundedReceiver<()>) {
        let (ring, _handle) = RingKeeper::new(node(6001));
        let (tx, rx) = mpsc::unbounded_channel();
        (Membership::new(node(6001), ring, tx), rx)
    }

    #[test]
    fn first_announce_is_new_and_self_never_tracked() {
        let (m, _rx) = make_membership();
        assert!(!m.on_announce(node(6001))); // self, ignored
        assert!(m.on_announce(node(6002)));
        assert!(!m.on_announce(node(6002))); // already known
        assert_eq!(m.members(), vec![node(6002)]);
    }

    #[test]
    fn sweep_evicts_only_stale_entries() {
        let (m, _rx) = make_membership();
        m.on_announce(node(6002));
        m.sweep(Duration::from_secs(5));
        assert_eq!(m.members(), vec![node(6002)]); // fresh, survives
        m.sweep(Duration::from_millis(0));
        assert!(m.members().is_empty()); // everything is "stale" at 0 timeout
    }

    #[test]
    fn announce_and_sweep_signal_election_needed() {
        let (m, mut rx) = make_membership();
        m.on_announce(node(6002));
        assert!(rx.try_recv().is_ok());
        m.remove(node(6002));
        assert!(rx.try_recv().is_ok());
    }
}
