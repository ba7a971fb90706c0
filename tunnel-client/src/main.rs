//! Tunnel client: exposes a local TCP service through a `tunnel-server`.
//!
//! Usage mirrors the original tool: `tunnel-client <server_host>
//! <server_port> <local_port> [token]`.

mod client;
mod error;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use client::ClientConfig;

#[derive(Parser, Debug)]
#[command(name = "tunnel-client", about = "Expose a local service through a tunnel-server")]
struct Args {
    /// Hostname or IP of the tunnel server.
    server_host: String,
    /// Control port the tunnel server is listening on.
    server_port: u16,
    /// Local TCP port to expose.
    local_port: u16,
    /// Shared token presented on CONNECT.
    #[arg(default_value = "default")]
    token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    println!(
        "tunnel-client connecting to {}:{}, exposing 127.0.0.1:{}",
        args.server_host, args.server_port, args.local_port
    );

    let cfg = ClientConfig {
        server_host: args.server_host,
        server_port: args.server_port,
        local_port: args.local_port,
        token: args.token,
    };

    // `shutdown_tx` tells the control loop to stop accepting new sessions at
    // its next poll; `run` then drains every in-flight session before
    // returning, rather than having them aborted when the runtime exits.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut run_task = tokio::spawn(client::run(cfg, shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
            let _ = shutdown_tx.send(true);
        }
        res = &mut run_task => {
            if let Ok(Err(e)) = res {
                error!(error = %e, "client control loop exited");
            }
            let _ = shutdown_tx.send(true);
        }
    }

    if let Ok(res) = run_task.await {
        res?;
    }
    Ok(())
}
