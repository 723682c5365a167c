//! End-to-end cluster scenarios, standing in for Summerset's multi-process
//! integration tests: every node in a scenario is a real [`ServerNode`]
//! bound to a loopback port, talking real UDP, driven by a real
//! [`ClientStub`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use ringvote::{ClientEvent, ClientStub, NodeId, RingVoteConfig, ServerNode};

fn fast_config() -> RingVoteConfig {
    RingVoteConfig {
        discovery_interval_ms: 50,
        discovery_timeout_ms: 300,
        hb_interval_ms: 50,
        hb_timeout_ms: 300,
        election_timeout_ms: 300,
        repl_timeout_ms: 100,
        fo_retransmit_ms: 100,
        failover_handshake_ms: 150,
    }
}

fn loopback(port: u16) -> NodeId {
    NodeId::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
}

async fn start_cluster(base_port: u16, mcast_port: u16, n: u16) -> Vec<ServerNode> {
    let mcast_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(239, 1, 1, 1)), mcast_port);
    let iface = Ipv4Addr::UNSPECIFIED;
    let mut nodes = Vec::new();
    for i in 0..n {
        let me = loopback(base_port + i);
        let node = ServerNode::start(me, mcast_addr, iface, fast_config())
            .await
            .expect("server failed to start");
        nodes.push(node);
    }
    nodes
}

/// Three-server election: the highest NodeId always wins.
#[tokio::test]
async fn s1_three_server_election() {
    let nodes = start_cluster(16001, 56101, 3).await;
    let highest = loopback(16003);

    let (client, _events) = ClientStub::new_and_setup(
        loopback(17001),
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(239, 1, 1, 1)), 56101),
        Ipv4Addr::UNSPECIFIED,
        nodes[0].me,
    )
    .await
    .expect("client setup failed");

    let (_, _, leader_id) =
        tokio::time::timeout(Duration::from_secs(5), client.register())
            .await
            .expect("registration timed out")
            .expect("registration failed");

    assert_eq!(leader_id, highest);
}

/// Single-group single-vote: both members see the same tally.
#[tokio::test]
async fn s2_single_group_single_vote() {
    let _nodes = start_cluster(16101, 56102, 3).await;
    let mcast_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(239, 1, 1, 1)), 56102);

    let (c1, mut c1_events) = ClientStub::new_and_setup(
        loopback(17101),
        mcast_addr,
        Ipv4Addr::UNSPECIFIED,
        _nodes[0].me,
    )
    .await
    .unwrap();
    let (c2, _c2_events) = ClientStub::new_and_setup(
        loopback(17102),
        mcast_addr,
        Ipv4Addr::UNSPECIFIED,
        _nodes[0].me,
    )
    .await
    .unwrap();

    c1.register().await.expect("c1 register");
    c2.register().await.expect("c2 register");

    c1.create_group("g").await.expect("create group");
    c1.join_group("g").await.expect("c1 join");
    c2.join_group("g").await.expect("c2 join");

    let vote_id = c1
        .start_vote("g", "q?", vec!["a".into(), "b".into(), "c".into()], 30_000)
        .await
        .expect("start vote");

    c1.cast_ballot(vote_id, 1).await.expect("c1 ballot");
    c2.cast_ballot(vote_id, 1).await.expect("c2 ballot");

    let result = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match c1_events.recv().await {
                Some(ClientEvent::VoteResult { vote_id: v, tally, .. }) if v == vote_id => {
                    return tally;
                }
                Some(_) => continue,
                None => panic!("client event stream closed before VoteResult"),
            }
        }
    })
    .await
    .expect("timed out waiting for VoteResult");

    assert_eq!(result.counts, vec![0, 2, 0]);
    assert_eq!(result.winner, "b");
}
