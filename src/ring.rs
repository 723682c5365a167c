//! The ring (§4.2): a deterministic circular order projected from the
//! current `MemberSet`. Ring has no dedicated task of its own (§5 lists
//! eight tasks and none of them is "ring keeper") — it is pure,
//! synchronous recomputation triggered by Discovery's MEMBERSHIP_CHANGE,
//! published as an immutable snapshot so concurrent readers (Heartbeat,
//! Election) never observe a torn update (§9's "sole owner of the array").

use std::sync::Arc;

use tokio::sync::watch;

use crate::types::NodeId;

/// An immutable snapshot of the ring: ascending `NodeId` order plus this
/// node's position in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingView {
    nodes: Vec<NodeId>,
    self_idx: usize,
}

impl RingView {
    /// Derives the ring from the member set plus self (self is always
    /// included even if not separately passed in).
    pub fn derive(members: impl IntoIterator<Item = NodeId>, me: NodeId) -> Self {
        let mut nodes: Vec<NodeId> = members.into_iter().collect();
        if !nodes.contains(&me) {
            nodes.push(me);
        }
        nodes.sort_unstable();
        nodes.dedup();
        let self_idx = nodes
            .iter()
            .position(|&n| n == me)
            .expect("self was just inserted above");
        RingView { nodes, self_idx }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        false // always contains at least self
    }

    pub fn me(&self) -> NodeId {
        self.nodes[self.self_idx]
    }

    /// For n=1, left == right == self (§4.2).
    pub fn left(&self) -> NodeId {
        let n = self.nodes.len();
        self.nodes[(self.self_idx + n - 1) % n]
    }

    pub fn right(&self) -> NodeId {
        let n = self.nodes.len();
        self.nodes[(self.self_idx + 1) % n]
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.binary_search(&id).is_ok()
    }

    /// The maximum `NodeId` currently on the ring — the node every live
    /// node's election must converge on (§8 property 1).
    pub fn max_id(&self) -> NodeId {
        *self.nodes.iter().max().expect("ring is never empty")
    }
}

/// Handle shared by every subsystem that needs to read the current ring and
/// be notified of changes. Cloning is cheap (an `Arc` + a `watch::Receiver`).
#[derive(Clone)]
pub struct RingHandle {
    rx: watch::Receiver<Arc<RingView>>,
}

impl RingHandle {
    pub fn current(&self) -> Arc<RingView> {
        self.rx.borrow().clone()
    }

    /// Awaits the next RING_CHANGED event, returning the new view.
    pub async fn changed(&mut self) -> Arc<RingView> {
        // `changed()` only errors if every sender was dropped, which only
        // happens at process shutdown; in that case keep returning the last
        // known view rather than panicking callers mid-shutdown.
        let _ = self.rx.changed().await;
        self.rx.borrow().clone()
    }
}

/// Owning side: recomputes and publishes the ring on membership change.
/// Held by the Discovery subsystem, which calls [`RingKeeper::rebuild`]
/// whenever its `MemberSet` changes.
pub struct RingKeeper {
    me: NodeId,
    tx: watch::Sender<Arc<RingView>>,
}

impl RingKeeper {
    pub fn new(me: NodeId) -> (Self, RingHandle) {
        let initial = Arc::new(RingView::derive(std::iter::empty(), me));
        let (tx, rx) = watch::channel(initial);
        (RingKeeper { me, tx }, RingHandle { rx })
    }

    /// Recomputes the ring from the given member set and publishes it if it
    /// differs from the current view. Returns the new view.
    pub fn rebuild(&self, members: impl IntoIterator<Item = NodeId>) -> Arc<RingView> {
        let view = Arc::new(RingView::derive(members, self.me));
        if *self.tx.borrow() != view {
            pf_debug!(
                "ring rebuilt: {} nodes, left={} right={}",
                view.len(),
                view.left(),
                view.right()
            );
            let _ = self.tx.send(view.clone());
        }
        view
    }

    pub fn current(&self) -> Arc<RingView> {
        self.tx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn node(port: u16) -> NodeId {
        NodeId::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    #[test]
    fn single_node_ring_neighbours_are_self() {
        let view = RingView::derive(std::iter::empty(), node(6001));
        assert_eq!(view.len(), 1);
        assert_eq!(view.left(), node(6001));
        assert_eq!(view.right(), node(6001));
    }

    #[test]
    fn three_node_ring_is_circular() {
        let view = RingView::derive(vec![node(6002), node(6003)], node(6001));
        assert_eq!(view.nodes(), &[node(6001), node(6002), node(6003)]);
        assert_eq!(view.left(), node(6003));
        assert_eq!(view.right(), node(6002));
        assert_eq!(view.max_id(), node(6003));
    }

    #[test]
    fn ring_order_is_deterministic_regardless_of_input_order() {
        let a = RingView::derive(vec![node(6003), node(6002)], node(6001));
        let b = RingView::derive(vec![node(6002), node(6003)], node(6001));
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn rebuild_notifies_watchers() {
        let (keeper, mut handle) = RingKeeper::new(node(6001));
        assert_eq!(handle.current().len(), 1);

        let keeper_task = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            keeper.rebuild(vec![node(6002)]);
        });

        let view = handle.changed().await;
        assert_eq!(view.len(), 2);
        keeper_task.await.unwrap();
    }
}
