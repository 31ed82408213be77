//! buildgate gateway
//!
//! gRPC server that accepts Docker build submissions and relays build logs.

use std::net::SocketAddr;
use std::path::PathBuf;

use chrono::Utc;
use clap::Parser;
use tracing::{info, warn};

use buildgate_core::config::load_config;
use buildgate_core::tracing_init::init_tracing;

use buildgate_gateway::server::GatewayServer;

#[derive(Parser, Debug)]
#[command(name = "buildgate-gateway")]
#[command(
    version,
    about = "buildgate gateway - Docker build submission and log relay server"
)]
struct Args {
    /// Settings file layered over the global settings.
    #[arg(long, env = "BUILDGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Log level for the gateway crates (overridden by RUST_LOG).
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,

    /// Directory holding uploaded artifacts.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.server.addr = addr;
    }
    if let Some(level) = args.log_level {
        config.server.log_level = level;
    }
    if args.log_json {
        config.server.log_json = true;
    }
    if let Some(dir) = args.data_dir {
        config.storage.data_dir = dir;
    }
    config.validate()?;

    init_tracing(&config.server.log_level, config.server.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.server.addr,
        data_dir = %config.storage.data_dir.display(),
        "Starting buildgate-gateway"
    );

    let server = GatewayServer::new(config);

    // Spawn background task to delete expired artifacts
    let store = server.backends().store.clone();
    let sweep_interval = server.config().storage.sweep_interval();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        interval.tick().await; // Skip first immediate tick
        loop {
            interval.tick().await;
            match store.sweep_expired(Utc::now()).await {
                Ok(removed) if removed > 0 => {
                    info!(removed, "Background artifact sweep completed");
                }
                Err(e) => {
                    warn!(error = %e, "Background artifact sweep failed");
                }
                _ => {}
            }
        }
    });

    server.serve_tcp(shutdown_signal()).await?;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    warn!(error = %e, "Cannot listen for SIGTERM");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received shutdown signal");
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("Received shutdown signal");
}
