use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use placard::{Node, NodeConfig};

#[derive(Parser, Debug)]
#[command(name = "placard")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Device id of this node
    #[arg(short, long)]
    name: String,

    /// UDP port to bind (0 = OS-assigned)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Donor endpoints to bootstrap from (IP:PORT)
    #[arg(short, long = "donor", value_name = "ADDR")]
    donors: Vec<SocketAddr>,

    /// STUN server, or "disabled" to skip public address discovery
    #[arg(long, default_value = placard::DEFAULT_STUN_SERVER)]
    stun: String,

    /// Rewrite all peer addresses to 127.0.0.1 (same-host topologies)
    #[arg(long)]
    force_localhost: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let mut config = NodeConfig::new(&args.name);
    config.udp_port = args.port;
    config.force_localhost = args.force_localhost;
    config.stun_server = if args.stun == "disabled" {
        None
    } else {
        Some(args.stun.clone())
    };

    let node = Node::start(config).await?;
    info!(
        device = node.device_id(),
        node_id = %node.node_id(),
        addr = %node.local_addr(),
        "node running"
    );

    for donor in &args.donors {
        info!(%donor, "adding donor");
        node.add_donor(donor.ip(), donor.port()).await;
        if let Err(e) = node.join(donor.ip(), donor.port()).await {
            warn!(%donor, error = %e, "dht join failed");
        }
    }

    let mut messages = node.messages()?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            maybe_msg = messages.recv() => {
                match maybe_msg {
                    Some(msg) => {
                        info!(
                            from = %msg.from,
                            text = %String::from_utf8_lossy(&msg.bytes),
                            "message received"
                        );
                    }
                    None => break,
                }
            }
        }
    }

    node.stop().await;
    Ok(())
}
