//! VeilNet node binary

mod settings;

use anyhow::Context;
use clap::{Parser, Subcommand};
use settings::{AppConfig, Overrides};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use veilnet_crypto::IdentityKeyPair;
use veilnet_routing::{NodeConfig, OnionNode, PeerAddress, PropagationStatus, StaticMembership};

#[derive(Parser)]
#[command(name = "veilnet-node")]
#[command(about = "Onion routing relay and client", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until interrupted
    Run {
        /// entry, relay or exit
        #[arg(short, long)]
        role: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(long)]
        node_id: Option<u64>,
        #[arg(long)]
        advertise_host: Option<String>,
        /// Peer to join at startup, `host:port`
        #[arg(short, long)]
        bootstrap: Option<PeerAddress>,
    },
    /// Join a bootstrap peer and send one anonymous message
    Send {
        #[arg(short, long)]
        bootstrap: PeerAddress,
        #[arg(short, long)]
        message: String,
        /// Privacy level; the configured hop count when absent
        #[arg(long)]
        hops: Option<usize>,
    },
    /// Join a bootstrap peer and print the directory it returns
    Peers {
        #[arg(short, long)]
        bootstrap: PeerAddress,
    },
    /// Block (or unblock) a destination across the network
    Ban {
        #[arg(short, long)]
        bootstrap: PeerAddress,
        #[arg(short, long)]
        actor: String,
        #[arg(short, long)]
        destination: String,
        #[arg(long)]
        unban: bool,
    },
    /// Generate an identity key file
    Keygen {
        #[arg(short, long)]
        out: PathBuf,
    },
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        fmt().json().with_env_filter(filter).init();
    } else {
        fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let result = match cli.command {
        Commands::Run {
            role,
            port,
            node_id,
            advertise_host,
            bootstrap,
        } => {
            let overrides = Overrides {
                role,
                node_id,
                port,
                advertise_host,
            };
            let settings = AppConfig::load(cli.config.as_deref(), &overrides)?;
            run(settings.node, bootstrap).await
        }
        Commands::Send {
            bootstrap,
            message,
            hops,
        } => {
            let settings = AppConfig::load(cli.config.as_deref(), &client_overrides())?;
            send(settings.node, bootstrap, message, hops).await
        }
        Commands::Peers { bootstrap } => {
            let settings = AppConfig::load(cli.config.as_deref(), &client_overrides())?;
            peers(settings.node, bootstrap).await
        }
        Commands::Ban {
            bootstrap,
            actor,
            destination,
            unban,
        } => {
            let settings = AppConfig::load(cli.config.as_deref(), &client_overrides())?;
            ban(settings, bootstrap, actor, destination, unban).await
        }
        Commands::Keygen { out } => keygen(out),
    };

    if let Err(e) = &result {
        error!("veilnet-node failed: {:#}", e);
    }
    result
}

/// One-shot commands listen on an ephemeral port.
fn client_overrides() -> Overrides {
    Overrides {
        port: Some(0),
        ..Default::default()
    }
}

async fn run(mut config: NodeConfig, bootstrap: Option<PeerAddress>) -> anyhow::Result<()> {
    if bootstrap.is_some() {
        config.bootstrap = bootstrap;
    }
    let node = OnionNode::start(config.clone()).await.context("failed to start node")?;

    if config.bootstrap.is_some() {
        match node.join_bootstrap().await {
            Ok(peers) => info!(peers = peers.len(), "directory joined"),
            Err(e) => warn!("continuing without directory: {}", e),
        }
    }

    let mut deliveries = node
        .take_deliveries()
        .context("delivery queue already taken")?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            payload = deliveries.recv() => match payload {
                Some(payload) => {
                    info!(bytes = payload.len(), "message delivered: {}", String::from_utf8_lossy(&payload));
                }
                None => break,
            },
        }
    }

    let stats = node.stats();
    info!(
        forwarded = stats.forwarded,
        delivered = stats.delivered,
        blocked = stats.blocked,
        failed = stats.failed,
        "shutting down"
    );
    node.shutdown();
    Ok(())
}

async fn send(config: NodeConfig, bootstrap: PeerAddress, message: String, hops: Option<usize>) -> anyhow::Result<()> {
    let node = OnionNode::start(config).await.context("failed to start node")?;
    node.join(&bootstrap).await?;
    if let Some(hops) = hops {
        node.set_privacy_level(hops)?;
    }

    let dispatch = node.send_anonymous(message.as_bytes()).await?;
    let path: Vec<String> = dispatch.path.iter().map(ToString::to_string).collect();
    println!(
        "sent {} bytes via {} ({})",
        dispatch.bytes_sent,
        dispatch.first_hop,
        path.join(" -> ")
    );
    node.shutdown();
    Ok(())
}

async fn peers(config: NodeConfig, bootstrap: PeerAddress) -> anyhow::Result<()> {
    let node = OnionNode::start(config).await.context("failed to start node")?;
    for peer in node.join(&bootstrap).await? {
        if peer.node_id == node.node_id() {
            continue;
        }
        let key = peer
            .public_key
            .map(|key| key.to_hex())
            .unwrap_or_else(|| "-".to_string());
        println!("{:>20}  {:<24}  {}", peer.node_id, peer.address, key);
    }
    node.shutdown();
    Ok(())
}

async fn ban(
    settings: AppConfig,
    bootstrap: PeerAddress,
    actor: String,
    destination: String,
    unban: bool,
) -> anyhow::Result<()> {
    let node = OnionNode::start(settings.node).await.context("failed to start node")?;
    node.join(&bootstrap).await?;
    // Peers only accept updates from nodes they know.
    let reached = node.announce().await;
    info!(reached, "announced to peers");

    let administrator = node.policy_administrator(Arc::new(StaticMembership::new(settings.admins)));
    let report = if unban {
        administrator.unban_destination(&actor, &destination).await?
    } else {
        administrator.ban_destination(&actor, &destination).await?
    };

    for (node_id, status) in &report.peers {
        match status {
            PropagationStatus::Acknowledged { attempts } => {
                println!("{node_id:>20}  acknowledged after {attempts} attempt(s)");
            }
            PropagationStatus::Unreachable { attempts, reason } => {
                println!("{node_id:>20}  unreachable after {attempts} attempt(s): {reason}");
            }
        }
    }
    node.shutdown();

    if !report.is_complete() {
        anyhow::bail!("{} peer(s) did not acknowledge the update", report.unreachable().len());
    }
    Ok(())
}

fn keygen(out: PathBuf) -> anyhow::Result<()> {
    if out.exists() {
        anyhow::bail!("{} already exists", out.display());
    }
    let identity = IdentityKeyPair::generate();
    identity.save(&out)?;
    println!("{}", identity.public_key());
    Ok(())
}
