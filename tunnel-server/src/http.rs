//! Public HTTP listener and rendezvous (§4.1 steps 3-5).
//!
//! Each inbound HTTP request on the public port is matched to a client by
//! its `Host` header, handed a fresh session id, and announced to that
//! client over its control connection's outbound queue as a CONNECT
//! message. The client is expected to open a *new* TCP connection to the
//! server's data port and send ACCEPT with the same session id; this
//! module binds a short-lived listener on the data port per request to
//! receive that rendezvous connection, then splices the two sockets
//! together.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use tunnel_protocol::{recv, send, splice_raw_and_framed, MsgType};

use crate::registry::ClientRegistry;

/// How long the rendezvous listener waits for the client's data connection
/// after a CONNECT has been sent.
const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a spliced connection may sit idle before either side is closed.
const SPLICE_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Ceiling on the buffered bytes read from the public connection before the
/// rendezvous completes (request line + headers, not the body).
const MAX_REQUEST_HEAD: usize = 16 * 1024;

pub struct HttpConfig {
    pub data_port: u16,
    pub max_payload: u32,
}

/// Accepts public HTTP connections until `shutdown` fires, handing each to
/// its own task. On shutdown the accept loop stops at its next boundary
/// (spec §5: "acceptors observe at their next accept boundary and exit")
/// and this function then awaits every in-flight request task so they can
/// finish their splice rather than being dropped mid-byte-copy.
pub async fn run_http_listener(
    listener: TcpListener,
    registry: Arc<ClientRegistry>,
    cfg: Arc<HttpConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "failed to accept HTTP connection");
                        continue;
                    }
                };
                let registry = registry.clone();
                let cfg = cfg.clone();
                sessions.spawn(async move {
                    if let Err(e) = handle_http_request(stream, registry, cfg).await {
                        debug!(%peer, error = %e, "http request handling failed");
                    }
                });
            }
            _ = shutdown.changed() => {
                info!("http listener shutting down, draining in-flight sessions");
                break;
            }
        }
    }
    while sessions.join_next().await.is_some() {}
}

async fn handle_http_request(
    mut public_conn: TcpStream,
    registry: Arc<ClientRegistry>,
    cfg: Arc<HttpConfig>,
) -> std::io::Result<()> {
    let mut head = Vec::with_capacity(4096);
    if !read_request_head(&mut public_conn, &mut head).await? {
        write_response(&mut public_conn, 400, "Bad Request").await?;
        return Ok(());
    }

    let subdomain = match parse_host_subdomain(&head) {
        Some(s) => s,
        None => {
            write_response(&mut public_conn, 400, "Bad Request: missing Host header").await?;
            return Ok(());
        }
    };

    let registration = match registry.find_by_subdomain(&subdomain).await {
        Some(r) => r,
        None => {
            write_response(&mut public_conn, 404, "No tunnel registered for this host").await?;
            return Ok(());
        }
    };

    let session_id = registration.next_session_id();

    let rendezvous_listener = match TcpListener::bind(("0.0.0.0", cfg.data_port)).await {
        Ok(l) => l,
        Err(e) => {
            warn!(error = %e, "failed to bind data port for rendezvous");
            write_response(&mut public_conn, 502, "Tunnel unavailable").await?;
            return Ok(());
        }
    };

    if registration
        .tx
        .send((MsgType::Connect, session_id, Vec::new()))
        .is_err()
    {
        write_response(&mut public_conn, 502, "Tunnel client disconnected").await?;
        return Ok(());
    }

    let mut data_conn = match timeout(RENDEZVOUS_TIMEOUT, rendezvous_listener.accept()).await {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(e)) => {
            warn!(error = %e, "rendezvous accept failed");
            write_response(&mut public_conn, 502, "Tunnel rendezvous failed").await?;
            return Ok(());
        }
        Err(_) => {
            warn!(subdomain = %subdomain, "rendezvous timed out");
            write_response(&mut public_conn, 504, "Tunnel rendezvous timed out").await?;
            return Ok(());
        }
    };

    match recv(&mut data_conn, cfg.max_payload).await {
        Ok((header, _payload)) if header.msg_type == MsgType::Accept && header.session_id == session_id => {}
        Ok((header, _)) => {
            warn!(?header.msg_type, got = header.session_id, expected = session_id, "unexpected rendezvous handshake");
            return Ok(());
        }
        Err(e) => {
            warn!(error = %e, "rendezvous handshake read failed");
            return Ok(());
        }
    }

    // Forward the buffered request head as the first DATA frame, then
    // splice the remainder of both connections until either side closes.
    send(&mut data_conn, MsgType::Data, session_id, &head).await?;
    info!(subdomain = %subdomain, session_id, "tunnel session established");
    splice_raw_and_framed(public_conn, data_conn, session_id, cfg.max_payload, SPLICE_IDLE_TIMEOUT).await;
    Ok(())
}

/// Reads bytes from `conn` into `head` until a blank line (`\r\n\r\n`)
/// terminates the request head or `MAX_REQUEST_HEAD` is exceeded. Returns
/// `false` if the connection closed before a full head was read.
async fn read_request_head(conn: &mut TcpStream, head: &mut Vec<u8>) -> std::io::Result<bool> {
    let mut byte = [0u8; 1];
    loop {
        if head.len() >= MAX_REQUEST_HEAD {
            return Ok(false);
        }
        let n = conn.read(&mut byte).await?;
        if n == 0 {
            return Ok(false);
        }
        head.push(byte[0]);
        if head.ends_with(b"\r\n\r\n") {
            return Ok(true);
        }
    }
}

/// Extracts the leftmost label of the `Host` header as the subdomain, e.g.
/// `Host: abc123.tunnel.example.com` -> `abc123`.
fn parse_host_subdomain(head: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(head);
    for line in text.split("\r\n") {
        if let Some(rest) = line
            .strip_prefix("Host:")
            .or_else(|| line.strip_prefix("host:"))
        {
            let host = rest.trim();
            let host = host.split(':').next().unwrap_or(host);
            return host.split('.').next().map(|s| s.to_string());
        }
    }
    None
}

async fn write_response(conn: &mut TcpStream, status: u16, message: &str) -> std::io::Result<()> {
    let reason = match status {
        400 => "Bad Request",
        404 => "Not Found",
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        _ => "Error",
    };
    // §6: a 404 for an unregistered subdomain MUST carry Content-Type:
    // text/html; the other statuses get the same short HTML body for
    // consistency, since none of them have a wire-format requirement of
    // their own.
    let body = format!("<html><body><h1>{status} {reason}</h1><p>{message}</p></body></html>");
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    conn.write_all(response.as_bytes()).await
}
