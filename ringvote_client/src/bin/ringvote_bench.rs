//! Synthetic load-generating demo, grounded on `summerset_client`'s
//! `ClientBench`: registers `num_clients` simulated clients against the
//! service, has them join a shared group, and casts random ballots at a
//! target aggregate rate to exercise FO-multicast retransmission and
//! replication under load.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rand::Rng;
use rand_distr::{Distribution, Exp};
use tokio::time::Instant;

use ringvote::{ClientEvent, ClientStub, NodeId};

#[derive(Parser, Debug)]
#[command(name = "ringvote-bench", about = "synthetic load generator for ringvote")]
struct Cli {
    /// Address of any server, used as the initial leader guess (a non-leader
    /// redirects the bench to the real leader on the first request).
    #[arg(long, default_value = "127.0.0.1:6001")]
    server: SocketAddr,

    /// Multicast group servers use for discovery and NEW_LEADER broadcasts.
    #[arg(long, default_value = "224.1.1.1:5007")]
    multicast_addr: SocketAddr,

    /// Local interface to join the multicast group on.
    #[arg(long, default_value = "0.0.0.0")]
    iface: Ipv4Addr,

    /// Local host simulated clients bind their unicast sockets to.
    #[arg(long, default_value = "127.0.0.1")]
    bind_host: IpAddr,

    /// First local port a simulated client binds to; each subsequent client
    /// takes the next port.
    #[arg(long, default_value_t = 20000)]
    base_port: u16,

    /// Number of simulated clients.
    #[arg(long, default_value_t = 8)]
    num_clients: usize,

    /// Target aggregate ballots-per-second across all clients.
    #[arg(long, default_value_t = 20.0)]
    freq_target: f64,

    /// Benchmark duration in seconds.
    #[arg(long, default_value_t = 30)]
    length_s: u64,

    /// Group name shared by every simulated client.
    #[arg(long, default_value = "bench-group")]
    group: String,
}

lazy_static::lazy_static! {
    static ref PRINT_INTERVAL: Duration = Duration::from_millis(500);
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let options: Vec<String> = vec!["a".into(), "b".into(), "c".into()];

    let initial_leader: NodeId = cli.server.into();
    let mut stubs = Vec::with_capacity(cli.num_clients);
    for i in 0..cli.num_clients {
        let me = NodeId::new(cli.bind_host, cli.base_port + i as u16);
        let (stub, mut events) = ClientStub::new_and_setup(
            me,
            cli.multicast_addr,
            cli.iface,
            initial_leader,
        )
        .await
        .expect("failed to set up simulated client");
        stub.register().await.expect("registration failed");
        tokio::spawn(async move { while events.recv().await.is_some() {} });
        stubs.push(stub);
    }

    stubs[0]
        .create_group(cli.group.clone())
        .await
        .expect("group creation failed");
    for stub in &stubs[1..] {
        stub.join_group(cli.group.clone()).await.expect("join failed");
    }
    stubs[0]
        .join_group(cli.group.clone())
        .await
        .expect("creator join failed");

    let vote_id = stubs[0]
        .start_vote(cli.group.clone(), "bench vote".into(), options, cli.length_s * 1000)
        .await
        .expect("vote start failed");

    let total_cnt = Arc::new(AtomicU64::new(0));
    let ok_cnt = Arc::new(AtomicU64::new(0));
    let mean_interval_s = stubs.len() as f64 / cli.freq_target;
    let exp = Exp::new(1.0 / mean_interval_s.max(1e-6)).expect("invalid freq_target");

    let mut handles = Vec::new();
    for stub in stubs {
        let total_cnt = total_cnt.clone();
        let ok_cnt = ok_cnt.clone();
        let deadline = Instant::now() + Duration::from_secs(cli.length_s);
        let exp = exp.clone();
        handles.push(tokio::spawn(async move {
            let mut rng = rand::thread_rng();
            while Instant::now() < deadline {
                let jitter = exp.sample(&mut rng).min(5.0);
                tokio::time::sleep(Duration::from_secs_f64(jitter)).await;
                let option_index = rng.gen_range(0..3);
                total_cnt.fetch_add(1, Ordering::Relaxed);
                if stub.cast_ballot(vote_id, option_index).await.is_ok() {
                    ok_cnt.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }

    let mut ticker = tokio::time::interval(*PRINT_INTERVAL);
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(cli.length_s) {
        ticker.tick().await;
        println!(
            "[{:>5.1}s] ballots sent={} ok={}",
            start.elapsed().as_secs_f64(),
            total_cnt.load(Ordering::Relaxed),
            ok_cnt.load(Ordering::Relaxed),
        );
    }

    for h in handles {
        let _ = h.await;
    }
    println!(
        "done: {} ballots sent, {} accepted",
        total_cnt.load(Ordering::Relaxed),
        ok_cnt.load(Ordering::Relaxed)
    );
}
