//! Tunnel relay server: accepts tunnel clients on a control port, assigns
//! each a subdomain, and relays public HTTP traffic for that subdomain
//! through to the client's local service.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tunnel_server::{run_control_listener, run_http_listener, ClientRegistry, ControlConfig, HttpConfig, ServerError};

#[derive(Parser, Debug)]
#[command(name = "tunnel-server", about = "Reverse HTTP tunnel relay server")]
struct Args {
    /// Public HTTP port that tunneled traffic is served on.
    #[arg(long, default_value_t = 80)]
    http_port: u16,

    /// Control port tunnel clients connect to.
    #[arg(long, default_value_t = 7000)]
    control_port: u16,

    /// Base zone appended to each client's assigned subdomain.
    #[arg(long, default_value = "tunnel.example.com")]
    zone: String,

    /// Maximum number of simultaneously registered clients.
    #[arg(long, default_value_t = 100)]
    max_clients: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let data_port = args.control_port + 1;

    println!(
        "tunnel-server starting: http={} control={} data={} zone={}",
        args.http_port, args.control_port, data_port, args.zone
    );

    let registry = Arc::new(ClientRegistry::new(args.max_clients));

    let http_listener = TcpListener::bind(("0.0.0.0", args.http_port))
        .await
        .map_err(ServerError::Io)?;
    let control_listener = TcpListener::bind(("0.0.0.0", args.control_port))
        .await
        .map_err(ServerError::Io)?;
    info!(
        http_port = args.http_port,
        control_port = args.control_port,
        data_port,
        zone = %args.zone,
        "tunnel-server listening"
    );

    // `shutdown_tx` flips `running` (spec §9); both listener tasks observe it
    // at their next accept boundary and then drain their own in-flight
    // clients/sessions before returning, rather than being dropped when the
    // runtime exits.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_cfg = Arc::new(HttpConfig {
        data_port,
        max_payload: tunnel_protocol::DEFAULT_MAX_PAYLOAD,
    });
    let http_registry = registry.clone();
    let mut http_task = tokio::spawn(run_http_listener(
        http_listener,
        http_registry,
        http_cfg,
        shutdown_rx.clone(),
    ));

    let control_cfg = Arc::new(ControlConfig {
        zone: args.zone.clone(),
        public_port: args.http_port,
        max_payload: tunnel_protocol::DEFAULT_MAX_PAYLOAD,
    });
    let control_registry = registry.clone();
    let mut control_task = tokio::spawn(run_control_listener(
        control_listener,
        control_registry,
        control_cfg,
        shutdown_rx,
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
            let _ = shutdown_tx.send(true);
        }
        res = &mut http_task => {
            if let Err(e) = res {
                error!(error = %e, "http listener task exited");
            }
            let _ = shutdown_tx.send(true);
        }
        res = &mut control_task => {
            if let Err(e) = res {
                error!(error = %e, "control listener task exited");
            }
            let _ = shutdown_tx.send(true);
        }
    }

    // Wait for both listeners to finish draining whatever they had in
    // flight; they only return once every accepted connection has run its
    // course (spec §5: "in-flight splices are not forcibly terminated; they
    // end when their sockets close").
    let _ = http_task.await;
    let _ = control_task.await;

    Ok(())
}
