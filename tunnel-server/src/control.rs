//! Control-connection state machine (§4.1): `AWAIT_CONNECT` → `ASSIGNED` →
//! `SERVING` → `TERMINATED`.
//!
//! One task per connected client runs this loop for the lifetime of the
//! control socket. A second task drains the client's outbound queue and
//! writes to the same socket's write half, so the HTTP handler can push a
//! CONNECT message to a client without touching this task's state.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::ReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use tunnel_protocol::{recv, send, ConnectRequest, DomainAssignment, MsgType};

use crate::registry::ClientRegistry;

/// How long `AWAIT_CONNECT` waits for the client's first message before
/// giving up (the original gives an unauthenticated socket no slack).
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-recv timeout while `SERVING`; a timeout here is not itself fatal, it
/// just gives the loop a chance to check the heartbeat watchdog below.
const RECV_POLL_TIMEOUT: Duration = Duration::from_secs(5);
/// A client that hasn't sent a HEARTBEAT in this long is presumed dead.
const HEARTBEAT_TIMEOUT_SECS: u64 = 30;
/// How often the server pings an idle client to keep the watchdog fed.
const HEARTBEAT_PING_INTERVAL: Duration = Duration::from_secs(10);

pub struct ControlConfig {
    pub zone: String,
    pub public_port: u16,
    pub max_payload: u32,
}

/// Accepts tunnel-client control connections until `shutdown` fires, handing
/// each to its own task. On shutdown the accept loop stops at its next
/// boundary and this function awaits every in-flight client task so each
/// gets to reach `TERMINATED` on its own rather than being dropped mid-flight.
pub async fn run_control_listener(
    listener: TcpListener,
    registry: Arc<ClientRegistry>,
    cfg: Arc<ControlConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut clients = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "failed to accept control connection");
                        continue;
                    }
                };
                info!(%peer, "new control connection");
                let registry = registry.clone();
                let cfg = cfg.clone();
                clients.spawn(handle_control_connection(stream, registry, cfg));
            }
            _ = shutdown.changed() => {
                info!("control listener shutting down, draining connected clients");
                break;
            }
        }
    }
    while clients.join_next().await.is_some() {}
}

/// Drives one client's control connection from accept to disconnect. Never
/// returns an error: every failure is logged and simply ends the task,
/// matching spec §7 ("a transient I/O error on one client's control
/// connection must not affect any other client or in-flight session").
pub async fn handle_control_connection(
    stream: TcpStream,
    registry: Arc<ClientRegistry>,
    cfg: Arc<ControlConfig>,
) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let connect = match await_connect(&mut read_half, cfg.max_payload).await {
        Some(c) => c,
        None => {
            debug!(%peer, "control connection closed before CONNECT");
            return;
        }
    };

    info!(%peer, subdomain = %connect.subdomain, "received CONNECT");

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let registration = match registry
        .register(&connect.subdomain, connect.token.clone(), tx)
        .await
    {
        Some(r) => r,
        None => {
            warn!(%peer, "registry full, rejecting client");
            let _ = send(&mut write_half, MsgType::Reject, 0, b"registry full").await;
            return;
        }
    };

    let assignment = DomainAssignment {
        public_url: format!("http://{}.{}", registration.subdomain, cfg.zone),
        public_port: cfg.public_port as i32,
    };
    if let Err(e) = send(
        &mut write_half,
        MsgType::AssignDomain,
        0,
        &assignment.encode(),
    )
    .await
    {
        warn!(%peer, error = %e, "failed to send ASSIGN_DOMAIN");
        registry.remove(&registration.subdomain).await;
        return;
    }

    info!(
        %peer,
        subdomain = %registration.subdomain,
        "client assigned domain, entering SERVING state"
    );

    // Writer task: drains `rx` and writes framed messages to the client.
    // Lives as long as the control socket's write half does.
    let writer = tokio::spawn(async move {
        while let Some((msg_type, session_id, payload)) = rx.recv().await {
            if let Err(e) = send(&mut write_half, msg_type, session_id, &payload).await {
                warn!(error = %e, "control writer failed, closing");
                break;
            }
        }
    });

    // Heartbeat pinger: the client is expected to echo every HEARTBEAT it
    // receives; `serving_loop` below resets the watchdog clock on receipt
    // of that echo.
    let heartbeat_tx = registration.tx.clone();
    let pinger = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_PING_INTERVAL);
        loop {
            ticker.tick().await;
            if heartbeat_tx.send((MsgType::Heartbeat, 0, Vec::new())).is_err() {
                break;
            }
        }
    });

    serving_loop(&mut read_half, &registration, cfg.max_payload).await;

    registration.deactivate();
    registry.remove(&registration.subdomain).await;
    writer.abort();
    pinger.abort();
    info!(subdomain = %registration.subdomain, "control connection terminated");
}

async fn await_connect<R>(read_half: &mut R, max_payload: u32) -> Option<ConnectRequest>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let (header, payload) = match timeout(CONNECT_TIMEOUT, recv(read_half, max_payload)).await {
        Ok(Ok(v)) => v,
        Ok(Err(e)) => {
            debug!(error = %e, "error awaiting CONNECT");
            return None;
        }
        Err(_) => {
            debug!("timed out awaiting CONNECT");
            return None;
        }
    };
    if header.msg_type != MsgType::Connect {
        warn!(?header.msg_type, "expected CONNECT, got something else");
        return None;
    }
    ConnectRequest::decode(&payload).ok()
}

async fn serving_loop(
    read_half: &mut ReadHalf<TcpStream>,
    registration: &Arc<crate::registry::ClientRegistration>,
    max_payload: u32,
) {
    loop {
        match timeout(RECV_POLL_TIMEOUT, recv(read_half, max_payload)).await {
            Ok(Ok((header, _payload))) => match header.msg_type {
                MsgType::Heartbeat => {
                    registration.touch_heartbeat();
                }
                MsgType::Close => {
                    info!(subdomain = %registration.subdomain, "client sent CLOSE");
                    return;
                }
                MsgType::Accept | MsgType::Reject | MsgType::Data => {
                    // These belong to a rendezvous data connection, not the
                    // control channel; a client that sends one here is
                    // misbehaving but the session isn't worth tearing down.
                    warn!(?header.msg_type, "unexpected message on control channel");
                }
                other => warn!(?other, "unexpected message on control channel"),
            },
            Ok(Err(e)) => {
                debug!(subdomain = %registration.subdomain, error = %e, "control connection read failed");
                return;
            }
            Err(_) => {
                // Recv timed out; check whether the client has gone quiet
                // for longer than the heartbeat watchdog allows.
                if registration.seconds_since_heartbeat() > HEARTBEAT_TIMEOUT_SECS {
                    warn!(subdomain = %registration.subdomain, "heartbeat watchdog expired");
                    return;
                }
            }
        }
        if !registration.is_active() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ClientRegistry;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn rejects_when_registry_full() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(ClientRegistry::new(0));

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handle_control_connection(
                stream,
                registry,
                Arc::new(ControlConfig {
                    zone: "tunnel.example.com".to_string(),
                    public_port: 80,
                    max_payload: tunnel_protocol::DEFAULT_MAX_PAYLOAD,
                }),
            )
            .await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let req = ConnectRequest {
            token: "default".to_string(),
            local_port: 8080,
            subdomain: String::new(),
        };
        send(&mut client, MsgType::Connect, 0, &req.encode())
            .await
            .unwrap();

        let (header, _payload) =
            recv(&mut client, tunnel_protocol::DEFAULT_MAX_PAYLOAD)
                .await
                .unwrap();
        assert_eq!(header.msg_type, MsgType::Reject);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn assigns_requested_subdomain_and_enters_serving() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(ClientRegistry::new(10));
        let registry_clone = registry.clone();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handle_control_connection(
                stream,
                registry_clone,
                Arc::new(ControlConfig {
                    zone: "tunnel.example.com".to_string(),
                    public_port: 80,
                    max_payload: tunnel_protocol::DEFAULT_MAX_PAYLOAD,
                }),
            )
            .await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let req = ConnectRequest {
            token: "default".to_string(),
            local_port: 8080,
            subdomain: "fixed".to_string(),
        };
        send(&mut client, MsgType::Connect, 0, &req.encode())
            .await
            .unwrap();

        let (header, payload) =
            recv(&mut client, tunnel_protocol::DEFAULT_MAX_PAYLOAD)
                .await
                .unwrap();
        assert_eq!(header.msg_type, MsgType::AssignDomain);
        let assignment = DomainAssignment::decode(&payload).unwrap();
        assert_eq!(assignment.public_url, "http://fixed.tunnel.example.com");

        assert!(registry.find_by_subdomain("fixed").await.is_some());

        send(&mut client, MsgType::Close, 0, &[]).await.unwrap();
        server.await.unwrap();
        assert!(registry.find_by_subdomain("fixed").await.is_none());
    }
}
