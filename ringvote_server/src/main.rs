//! `server <port>` executable: parses CLI flags layered over an optional
//! TOML config file, starts a [`ServerNode`], and installs a `ctrlc` handler
//! for graceful shutdown.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;

use ringvote::{parse_config, NodeId, RingVoteConfig, ServerNode};

/// CLI flags override the config file, which overrides [`RingVoteConfig`]'s
/// defaults.
#[derive(Parser, Debug)]
#[command(name = "ringvote_server", about = "ringvote coordination server node")]
struct Cli {
    /// Port this node's unicast socket binds to.
    port: u16,

    /// Host address this node binds to.
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Multicast group used for discovery and NEW_LEADER broadcasts.
    #[arg(long, default_value = "224.1.1.1:5007")]
    multicast_addr: SocketAddr,

    /// Local interface to join the multicast group on.
    #[arg(long, default_value = "0.0.0.0")]
    iface: Ipv4Addr,

    /// Path to a TOML file overriding the default timing constants.
    #[arg(long)]
    config_file: Option<String>,

    #[arg(long)]
    discovery_interval_ms: Option<u64>,
    #[arg(long)]
    discovery_timeout_ms: Option<u64>,
    #[arg(long)]
    hb_interval_ms: Option<u64>,
    #[arg(long)]
    hb_timeout_ms: Option<u64>,
    #[arg(long)]
    election_timeout_ms: Option<u64>,
    #[arg(long)]
    repl_timeout_ms: Option<u64>,
    #[arg(long)]
    fo_retransmit_ms: Option<u64>,
    #[arg(long)]
    failover_handshake_ms: Option<u64>,
}

impl Cli {
    fn apply_overrides(&self, config: &mut RingVoteConfig) {
        if let Some(v) = self.discovery_interval_ms {
            config.discovery_interval_ms = v;
        }
        if let Some(v) = self.discovery_timeout_ms {
            config.discovery_timeout_ms = v;
        }
        if let Some(v) = self.hb_interval_ms {
            config.hb_interval_ms = v;
        }
        if let Some(v) = self.hb_timeout_ms {
            config.hb_timeout_ms = v;
        }
        if let Some(v) = self.election_timeout_ms {
            config.election_timeout_ms = v;
        }
        if let Some(v) = self.repl_timeout_ms {
            config.repl_timeout_ms = v;
        }
        if let Some(v) = self.fo_retransmit_ms {
            config.fo_retransmit_ms = v;
        }
        if let Some(v) = self.failover_handshake_ms {
            config.failover_handshake_ms = v;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_str = match &cli.config_file {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(s) => Some(s),
            Err(e) => {
                eprintln!("failed to read config file {}: {}", path, e);
                return ExitCode::FAILURE;
            }
        },
        None => None,
    };

    let mut config = match parse_config(config_str.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to parse config: {}", e);
            return ExitCode::FAILURE;
        }
    };
    cli.apply_overrides(&mut config);

    let me = NodeId::new(cli.host, cli.port);
    let node = match ServerNode::start(me, cli.multicast_addr, cli.iface, config).await {
        Ok(n) => n,
        Err(e) => {
            eprintln!("fatal startup error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    }) {
        eprintln!("failed to install signal handler: {}", e);
        return ExitCode::FAILURE;
    }

    // block this task (not the reactor) on the blocking std channel until
    // ctrlc fires, then drive the async shutdown.
    let _ = tokio::task::spawn_blocking(move || shutdown_rx.recv()).await;
    node.shutdown().await;
    ExitCode::SUCCESS
}
