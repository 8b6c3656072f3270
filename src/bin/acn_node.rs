// bin/acn_node.rs - ACN Peer Node Binary

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};

use acn::node::{DuplicatePolicy, NodeConfig, PeerNode};
use acn::observability::{MetricsConfig, TracingFormat, init_metrics, init_tracing};

/// ACN Peer Node
#[derive(Parser, Debug)]
#[command(name = "acn-node")]
#[command(author = "SavageS")]
#[command(version)]
#[command(about = "Agent Communication Network peer node", long_about = None)]
struct Args {
    /// Config file path (TOML, YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Peer-to-peer listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Externally reachable multiaddr announced to other peers
    #[arg(long)]
    public_address: Option<String>,

    /// Delegate listen address for lightweight clients
    #[arg(short, long)]
    delegate: Option<SocketAddr>,

    /// Disable the delegate listener
    #[arg(long, conflicts_with = "delegate")]
    no_delegate: bool,

    /// Hex-encoded secp256k1 peer key (generated when absent)
    #[arg(long, env = "ACN_PEER_KEY", hide_env_values = true)]
    peer_key: Option<String>,

    /// Bootstrap peer multiaddrs (can be specified multiple times)
    #[arg(long)]
    bootstrap: Vec<String>,

    /// Persist agent records at this path
    #[arg(long)]
    record_store: Option<PathBuf>,

    /// Refuse duplicate registrations instead of replacing the old session
    #[arg(long)]
    reject_duplicates: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty, compact, json)
    #[arg(long)]
    log_format: Option<TracingFormat>,

    /// Enable metrics server
    #[arg(long)]
    metrics: bool,

    /// Metrics listen address
    #[arg(long, default_value = "0.0.0.0:9090")]
    metrics_addr: SocketAddr,
}

impl Args {
    fn apply(&self, mut config: NodeConfig) -> NodeConfig {
        if let Some(listen) = self.listen {
            config.p2p_listen = listen;
        }
        if let Some(public) = &self.public_address {
            config.public_address = Some(public.clone());
        }
        if self.no_delegate {
            config.delegate_listen = None;
        } else if let Some(delegate) = self.delegate {
            config.delegate_listen = Some(delegate);
        }
        if let Some(key) = &self.peer_key {
            config = config.with_peer_key(key.clone());
        }
        for peer in &self.bootstrap {
            config = config.with_bootstrap_peer(peer.clone());
        }
        if let Some(path) = &self.record_store {
            config = config.with_record_store(path.clone());
        }
        if self.reject_duplicates {
            config = config.with_duplicate_policy(DuplicatePolicy::Reject);
        }
        if let Some(level) = &self.log_level {
            config.log.filter = format!("{level},acn={level}");
            config.log.with_span_events = level == "trace" || level == "debug";
            config.log.with_file = level == "trace";
        }
        if let Some(format) = self.log_format {
            config.log.with_ansi = format != TracingFormat::Json;
            config.log.format = format;
        }
        if self.metrics {
            config.metrics = Some(MetricsConfig {
                listen_addr: self.metrics_addr,
                ..config.metrics.take().unwrap_or_default()
            });
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = NodeConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    let config = args.apply(config);

    init_tracing(&config.log)?;
    info!("Starting ACN peer node");

    let _metrics_handle = match config.metrics.clone() {
        Some(metrics_config) => {
            let addr = metrics_config.listen_addr;
            match init_metrics(metrics_config) {
                Ok(handle) => {
                    info!(%addr, "Metrics recorder initialized");
                    Some(handle)
                }
                Err(e) => {
                    warn!(error = %e, "Failed to initialize metrics");
                    None
                }
            }
        }
        None => None,
    };

    let node = PeerNode::start(config).await.context("failed to start peer node")?;
    info!(peer_id = %node.peer_id(), "Node identity");
    info!(addr = %node.multiaddr(), "Peer endpoint");
    if let Some(delegate) = node.delegate_addr() {
        info!(%delegate, "Delegate endpoint");
    }
    info!("Press Ctrl+C to shutdown");

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    node.shutdown().await;
    info!("Node shutdown complete");
    Ok(())
}
