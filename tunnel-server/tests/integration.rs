//! Loopback integration tests: bind real `127.0.0.1:0` listeners and drive a
//! fake tunnel client through the wire protocol directly, end to end.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tunnel_protocol::{recv, send, ConnectRequest, DomainAssignment, MsgType, DEFAULT_MAX_PAYLOAD};
use tunnel_server::{handle_control_connection, run_http_listener, ClientRegistry, ControlConfig, HttpConfig};

/// Binds an ephemeral listener just to learn a free port, then drops it.
/// Small TOCTOU race; acceptable for a loopback test.
async fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test]
async fn subdomain_assignment_and_spliced_request_round_trip() {
    let data_port = free_port().await;

    let control_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let control_addr = control_listener.local_addr().unwrap();
    let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_addr = http_listener.local_addr().unwrap();

    let registry = Arc::new(ClientRegistry::new(10));

    let http_cfg = Arc::new(HttpConfig {
        data_port,
        max_payload: DEFAULT_MAX_PAYLOAD,
    });
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(run_http_listener(http_listener, registry.clone(), http_cfg, shutdown_rx));

    let control_registry = registry.clone();
    tokio::spawn(async move {
        let (stream, _) = control_listener.accept().await.unwrap();
        handle_control_connection(
            stream,
            control_registry,
            Arc::new(ControlConfig {
                zone: "test.local".to_string(),
                public_port: http_addr.port(),
                max_payload: DEFAULT_MAX_PAYLOAD,
            }),
        )
        .await;
    });

    // Fake tunnel client: register with a fixed subdomain and check the
    // assignment it gets back.
    let mut control = TcpStream::connect(control_addr).await.unwrap();
    let req = ConnectRequest {
        token: "default".to_string(),
        local_port: 9000,
        subdomain: "abc".to_string(),
    };
    send(&mut control, MsgType::Connect, 0, &req.encode())
        .await
        .unwrap();
    let (header, payload) = recv(&mut control, DEFAULT_MAX_PAYLOAD).await.unwrap();
    assert_eq!(header.msg_type, MsgType::AssignDomain);
    let assignment = DomainAssignment::decode(&payload).unwrap();
    assert_eq!(assignment.public_url, "http://abc.test.local");

    // Fake client session handler: wait for the server's CONNECT, rendezvous
    // on the data port, hand back a canned HTTP response, then disconnect.
    let client_task = tokio::spawn(async move {
        let (header, _payload) = recv(&mut control, DEFAULT_MAX_PAYLOAD).await.unwrap();
        assert_eq!(header.msg_type, MsgType::Connect);
        let session_id = header.session_id;

        let mut data_conn = TcpStream::connect(("127.0.0.1", data_port)).await.unwrap();
        send(&mut data_conn, MsgType::Accept, session_id, &[])
            .await
            .unwrap();

        let (header, payload) = recv(&mut data_conn, DEFAULT_MAX_PAYLOAD).await.unwrap();
        assert_eq!(header.msg_type, MsgType::Data);
        let request_head = String::from_utf8(payload).unwrap();
        assert!(request_head.starts_with("GET / HTTP/1.1"));
        assert!(request_head.contains("Host: abc.test.local"));

        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi";
        send(&mut data_conn, MsgType::Data, session_id, response)
            .await
            .unwrap();
        // Dropping data_conn here ends the session from the tunnel side; the
        // server's splice sees EOF and half-closes the public socket.
    });

    let mut public = TcpStream::connect(http_addr).await.unwrap();
    public
        .write_all(b"GET / HTTP/1.1\r\nHost: abc.test.local\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    public.read_to_end(&mut response).await.unwrap();
    assert_eq!(
        response,
        b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi".to_vec()
    );

    client_task.await.unwrap();
}

#[tokio::test]
async fn unregistered_subdomain_returns_404() {
    let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_addr = http_listener.local_addr().unwrap();
    let registry = Arc::new(ClientRegistry::new(10));
    let cfg = Arc::new(HttpConfig {
        data_port: 0,
        max_payload: DEFAULT_MAX_PAYLOAD,
    });
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(run_http_listener(http_listener, registry, cfg, shutdown_rx));

    let mut conn = TcpStream::connect(http_addr).await.unwrap();
    conn.write_all(b"GET / HTTP/1.1\r\nHost: nope.test.local\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    conn.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 404"));
}

/// Exercises the real 30-second watchdog: a client that registers and then
/// goes silent (no HEARTBEAT, no CLOSE) must be dropped from the registry
/// once `last_heartbeat` is more than 30s stale. Deliberately a slow,
/// real-time test rather than a mocked clock — the watchdog compares
/// against `std::time::Instant`, not a virtual tokio clock, so there is no
/// faster way to observe the actual threshold.
#[tokio::test]
async fn heartbeat_watchdog_removes_silent_client() {
    let control_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let control_addr = control_listener.local_addr().unwrap();
    let registry = Arc::new(ClientRegistry::new(10));

    let control_registry = registry.clone();
    let server_task = tokio::spawn(async move {
        let (stream, _) = control_listener.accept().await.unwrap();
        handle_control_connection(
            stream,
            control_registry,
            Arc::new(ControlConfig {
                zone: "test.local".to_string(),
                public_port: 80,
                max_payload: DEFAULT_MAX_PAYLOAD,
            }),
        )
        .await;
    });

    let mut control = TcpStream::connect(control_addr).await.unwrap();
    let req = ConnectRequest {
        token: "default".to_string(),
        local_port: 9000,
        subdomain: "silent".to_string(),
    };
    send(&mut control, MsgType::Connect, 0, &req.encode())
        .await
        .unwrap();
    let (header, _payload) = recv(&mut control, DEFAULT_MAX_PAYLOAD).await.unwrap();
    assert_eq!(header.msg_type, MsgType::AssignDomain);
    assert!(registry.find_by_subdomain("silent").await.is_some());

    // Stay silent past the 30s watchdog without sending HEARTBEAT or CLOSE.
    tokio::time::sleep(Duration::from_secs(31)).await;

    assert!(registry.find_by_subdomain("silent").await.is_none());

    drop(control);
    server_task.await.unwrap();
}
