use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rr_metrics::TransportMetrics;
use rr_udp::dispatch::run_relay;
use rr_udp::{spawn_transport, Config};

#[derive(Debug, Parser)]
#[command(name = "radrelay")]
#[command(
    about = "RADIUS UDP relay: peer-validated datagram transport with per-client expiry and a shared reply queue"
)]
struct Args {
    #[arg(long, default_value = "config/dev.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::from_file(&args.config)?;

    let metrics = TransportMetrics::new("radrelay")?;
    let _exporter_thread = if config.metrics.enabled {
        Some(metrics.spawn_exporter(config.metrics.listen_addr)?)
    } else {
        None
    };

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_shutdown.cancel();
        }
    });

    let transport = spawn_transport(&config, metrics.clone(), shutdown.clone()).await?;
    info!(
        listeners = config.transport.listen_addrs.len(),
        clients = transport.peers.clients.len(),
        servers = transport.peers.servers.len(),
        "radrelay up"
    );

    run_relay(transport, metrics, shutdown).await;
    Ok(())
}
