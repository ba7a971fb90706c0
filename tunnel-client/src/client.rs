//! Client control loop (§4.2): connect, register, then service CONNECT and
//! HEARTBEAT messages from the server for the life of the process.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use tunnel_protocol::{recv, send, splice_raw_and_framed, ConnectRequest, DomainAssignment, MsgType};

use crate::error::{ClientError, Result};

/// Recv timeout while idling on the control connection. Generous relative
/// to the server's 10s heartbeat ping interval so a couple of missed beats
/// don't look like a dead server.
const CONTROL_RECV_TIMEOUT: Duration = Duration::from_secs(35);
/// How long the data connection waits to receive the first DATA frame
/// (the buffered public request head) after sending ACCEPT.
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(10);
/// Idle timeout for the spliced local<->tunnel byte copy.
const SPLICE_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
    pub local_port: u16,
    pub token: String,
}

/// Connects to the server, registers, and services the control connection
/// until it closes, fails, or `shutdown` fires. Returns on any fatal error;
/// per-session failures during CONNECT handling are logged and do not end
/// the process. Before returning, every session task spawned while servicing
/// CONNECTs is awaited so it can finish its own splice and close its own
/// sockets (spec §4.2: "cancellation is cooperative ... sessions finish on
/// their own sockets' closure") instead of being dropped when the process's
/// runtime exits.
pub async fn run(cfg: ClientConfig, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let mut control = TcpStream::connect((cfg.server_host.as_str(), cfg.server_port)).await?;
    info!(host = %cfg.server_host, port = cfg.server_port, "connected to tunnel server");

    let request = ConnectRequest {
        token: cfg.token.clone(),
        local_port: cfg.local_port as i32,
        subdomain: String::new(),
    };
    send(&mut control, MsgType::Connect, 0, &request.encode()).await?;

    let (header, payload) = recv(&mut control, tunnel_protocol::DEFAULT_MAX_PAYLOAD).await?;
    match header.msg_type {
        MsgType::Reject => {
            let reason = String::from_utf8_lossy(&payload).into_owned();
            return Err(ClientError::Rejected(reason));
        }
        MsgType::AssignDomain => {
            let assignment = DomainAssignment::decode(&payload)?;
            println!(
                "tunnel established: {}  ->  127.0.0.1:{}",
                assignment.public_url, cfg.local_port
            );
            info!(public_url = %assignment.public_url, "tunnel assigned");
        }
        other => {
            return Err(ClientError::UnexpectedMessage {
                expected: "ASSIGN_DOMAIN",
                got: other,
            })
        }
    }

    let mut sessions = JoinSet::new();
    let result = loop {
        let received = tokio::select! {
            r = timeout(
                CONTROL_RECV_TIMEOUT,
                recv(&mut control, tunnel_protocol::DEFAULT_MAX_PAYLOAD),
            ) => r,
            _ = shutdown.changed() => {
                info!("shutdown requested, leaving control loop");
                break Ok(());
            }
        };

        let (header, _payload) = match received {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                error!(error = %e, "control connection failed");
                break Err(e.into());
            }
            Err(_) => {
                warn!("no message from server within timeout, assuming server is gone");
                break Err(ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "control connection idle for too long",
                )));
            }
        };

        match header.msg_type {
            MsgType::Heartbeat => {
                debug!("echoing heartbeat");
                if let Err(e) = send(&mut control, MsgType::Heartbeat, 0, &[]).await {
                    break Err(e.into());
                }
            }
            MsgType::Connect => {
                let session_id = header.session_id;
                let host = cfg.server_host.clone();
                let data_port = cfg.server_port + 1;
                let local_port = cfg.local_port;
                sessions.spawn(async move {
                    if let Err(e) = service_session(host, data_port, session_id, local_port).await {
                        warn!(session_id, error = %e, "session handling failed");
                    }
                });
            }
            MsgType::Close => {
                info!("server sent CLOSE, shutting down");
                break Ok(());
            }
            other => warn!(?other, "unexpected message on control channel"),
        }
    };

    while sessions.join_next().await.is_some() {}
    result
}

/// Handles one tunneled request: dial the local service, open a new data
/// connection to the server, complete the ACCEPT handshake, and splice.
async fn service_session(
    server_host: String,
    data_port: u16,
    session_id: u32,
    local_port: u16,
) -> Result<()> {
    let mut local_conn = TcpStream::connect(("127.0.0.1", local_port)).await?;
    let mut data_conn = TcpStream::connect((server_host.as_str(), data_port)).await?;

    send(&mut data_conn, MsgType::Accept, session_id, &[]).await?;

    let (header, payload) = timeout(
        FIRST_FRAME_TIMEOUT,
        recv(&mut data_conn, tunnel_protocol::DEFAULT_MAX_PAYLOAD),
    )
    .await
    .map_err(|_| {
        ClientError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timed out waiting for first DATA frame",
        ))
    })??;

    if header.msg_type != MsgType::Data {
        return Err(ClientError::UnexpectedMessage {
            expected: "DATA",
            got: header.msg_type,
        });
    }
    if !payload.is_empty() {
        local_conn.write_all(&payload).await?;
    }

    splice_raw_and_framed(
        local_conn,
        data_conn,
        session_id,
        tunnel_protocol::DEFAULT_MAX_PAYLOAD,
        SPLICE_IDLE_TIMEOUT,
    )
    .await;
    Ok(())
}
