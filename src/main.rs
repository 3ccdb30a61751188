use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use meshroute::{Keypair, MemoryNetwork, MemoryTransport, Node, NodeId, RoutingConfig};

#[derive(Parser, Debug)]
#[command(name = "meshroute")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Vaults in the in-memory overlay; the first one is the bootstrap.
    #[arg(short, long, default_value = "16")]
    vaults: usize,

    /// Clients attached after the vaults.
    #[arg(short, long, default_value = "2")]
    clients: usize,

    /// Group messages sent from the first client.
    #[arg(short, long, default_value = "10")]
    messages: usize,

    #[arg(long, default_value_t = meshroute::config::DEFAULT_NODE_GROUP_SIZE)]
    group_size: usize,

    #[arg(long, default_value_t = meshroute::config::DEFAULT_THREAD_COUNT)]
    threads: usize,

    /// Milliseconds to wait for the overlay to converge after each phase.
    #[arg(long, default_value = "500")]
    settle_ms: u64,

    /// Keep running and log table sizes every this many seconds until Ctrl+C.
    #[arg(long, value_name = "SECS")]
    linger: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = RoutingConfig {
        node_group_size: args.group_size,
        thread_count: args.threads,
        ..RoutingConfig::default()
    };
    config.validate().context("invalid configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.thread_count)
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(run(args, config))
}

async fn run(args: Args, config: RoutingConfig) -> Result<()> {
    if args.vaults == 0 {
        anyhow::bail!("at least one vault is required");
    }
    let settle = Duration::from_millis(args.settle_ms);
    let network = MemoryNetwork::new();
    let received = Arc::new(AtomicUsize::new(0));

    let mut vaults: Vec<Node<MemoryTransport>> = Vec::with_capacity(args.vaults);
    for _ in 0..args.vaults {
        let (transport, inbound) = network.bind()?;
        let node = Node::vault(Keypair::generate(), config.clone(), transport, inbound).await?;
        count_deliveries(&node, received.clone()).await?;
        if let Some(bootstrap) = vaults.first() {
            node.join(bootstrap.node_info()).await?;
            time::sleep(settle / 4).await;
        }
        vaults.push(node);
    }
    time::sleep(settle).await;

    let bootstrap = vaults[0].node_info();
    let mut clients: Vec<Node<MemoryTransport>> = Vec::with_capacity(args.clients);
    for _ in 0..args.clients {
        let (transport, inbound) = network.bind()?;
        let node = Node::client(Keypair::generate(), None, config.clone(), transport, inbound).await?;
        count_deliveries(&node, received.clone()).await?;
        node.join(bootstrap.clone()).await?;
        clients.push(node);
    }
    time::sleep(settle).await;

    for vault in &vaults {
        info!(id = %vault.id().short(), routing = vault.routing_len(), "vault ready");
    }

    let sender = clients.first().unwrap_or(&vaults[0]);
    let pivot = NodeId::random();
    info!(pivot = %pivot.short(), messages = args.messages, "sending group messages");
    for i in 0..args.messages {
        if let Err(e) = sender.send_group(pivot, format!("message {i}").into_bytes()).await {
            warn!(error = %e, "group send failed");
        }
    }
    time::sleep(settle).await;

    let total = received.load(Ordering::Relaxed);
    let expected = args.messages * config.node_group_size.min(args.vaults);
    info!(received = total, expected, "group delivery summary");

    if let Some(secs) = args.linger {
        let mut interval = time::interval(Duration::from_secs(secs.max(1)));
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, exiting gracefully");
                    break;
                }
                _ = interval.tick() => {
                    let routing: Vec<usize> = vaults.iter().map(|v| v.routing_len()).collect();
                    info!(?routing, received = received.load(Ordering::Relaxed), "overlay snapshot");
                }
            }
        }
    }

    for node in clients.iter().chain(vaults.iter()) {
        node.shutdown().await;
    }
    Ok(())
}

async fn count_deliveries(node: &Node<MemoryTransport>, counter: Arc<AtomicUsize>) -> Result<()> {
    let mut rx = node.deliveries().await?;
    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    });
    Ok(())
}
