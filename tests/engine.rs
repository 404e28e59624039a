//! End-to-end exercises of the connection engine against a real loopback
//! TCP server: reuse after a clean response, no reuse after `Connection:
//! close`, rejection of a non-1.x status line, the reentrancy guard,
//! idempotent `close()`, upload pre-emption by an early response, a read
//! timeout mid-body, and the CONNECT tunnel sub-protocol's success/failure
//! paths. The state machine's pluggability would let a scripted
//! implementation stand in for the peer instead; here the peer itself is
//! scripted.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use sync_http1::client::tunnel;
use sync_http1::client::{Connection, TunnelConfig};
use sync_http1::error::Error;
use sync_http1::message::{Body, Request};
use sync_http1::selector::Selector;

fn spawn_server<F>(handler: F) -> (u16, thread::JoinHandle<()>)
where
    F: FnOnce(TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
    let port = listener.local_addr().expect("local_addr").port();
    let join = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept one connection");
        handler(stream);
    });
    (port, join)
}

/// Reads off the stream until a full header block (`\r\n\r\n`) has been
/// seen, returning everything read so far (headers plus any body bytes
/// that happened to arrive in the same read).
fn read_request_head(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).expect("read request head");
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    buf
}

const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn simple_get_is_reusable_afterward() {
    let (port, server) = spawn_server(|mut stream| {
        let _ = read_request_head(&mut stream);
        stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabc").unwrap();
        thread::sleep(Duration::from_millis(200));
    });

    let mut conn: Connection = Connection::new("127.0.0.1", port);
    conn.connect(None, Some(TIMEOUT)).unwrap();

    let request = Request::new("GET", "/").with_header("Host", "example.test");
    let mut response = conn.send_request(request, Some(TIMEOUT)).unwrap();
    assert_eq!(response.status_code, 200);
    assert_eq!(response.http_version, b"HTTP/1.1");
    let body = response.read_to_end(Some(TIMEOUT)).unwrap();
    assert_eq!(body, b"abc");
    drop(response);

    assert!(conn.complete());
    assert!(!conn.is_dropped());

    server.join().unwrap();
}

#[test]
fn connection_close_header_prevents_reuse() {
    let (port, server) = spawn_server(|mut stream| {
        let _ = read_request_head(&mut stream);
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
    });

    let mut conn: Connection = Connection::new("127.0.0.1", port);
    conn.connect(None, Some(TIMEOUT)).unwrap();

    let request = Request::new("GET", "/").with_header("Host", "example.test");
    let mut response = conn.send_request(request, Some(TIMEOUT)).unwrap();
    let body = response.read_to_end(Some(TIMEOUT)).unwrap();
    assert!(body.is_empty());
    drop(response);

    assert!(!conn.complete());
    assert!(conn.is_dropped());

    server.join().unwrap();
}

#[test]
fn bad_version_is_rejected_and_releases_the_engine() {
    let (port, server) = spawn_server(|mut stream| {
        let _ = read_request_head(&mut stream);
        stream.write_all(b"HTTP/2.0 200 OK\r\n\r\n").unwrap();
        thread::sleep(Duration::from_millis(100));
    });

    let mut conn: Connection = Connection::new("127.0.0.1", port);
    conn.connect(None, Some(TIMEOUT)).unwrap();

    let request = Request::new("GET", "/").with_header("Host", "example.test");
    let err = conn.send_request(request, Some(TIMEOUT)).unwrap_err();
    assert!(matches!(err, Error::BadVersionError(_)));
    assert!(conn.is_dropped());

    server.join().unwrap();
}

#[test]
fn reentrant_send_request_before_draining_body_is_a_protocol_error() {
    let (port, server) = spawn_server(|mut stream| {
        let _ = read_request_head(&mut stream);
        stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello").unwrap();
        thread::sleep(Duration::from_millis(200));
    });

    let mut conn: Connection = Connection::new("127.0.0.1", port);
    conn.connect(None, Some(TIMEOUT)).unwrap();

    {
        let request = Request::new("GET", "/").with_header("Host", "example.test");
        let response = conn.send_request(request, Some(TIMEOUT)).unwrap();
        // Dropped without consuming the body: `their_state` stays at
        // `RecvBody`, so the engine is not (IDLE, IDLE).
        drop(response);
    }
    assert!(!conn.complete());

    let request = Request::new("GET", "/").with_header("Host", "example.test");
    let err = conn.send_request(request, Some(TIMEOUT)).unwrap_err();
    assert!(matches!(err, Error::ProtocolError(_)));

    drop(conn);
    server.join().unwrap();
}

#[test]
fn close_is_idempotent() {
    let (port, server) = spawn_server(|mut stream| {
        let _ = read_request_head(&mut stream);
        stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").unwrap();
        thread::sleep(Duration::from_millis(100));
    });

    let mut conn: Connection = Connection::new("127.0.0.1", port);
    conn.connect(None, Some(TIMEOUT)).unwrap();
    let request = Request::new("GET", "/").with_header("Host", "example.test");
    let mut response = conn.send_request(request, Some(TIMEOUT)).unwrap();
    response.read_to_end(Some(TIMEOUT)).unwrap();
    drop(response);

    conn.close();
    conn.close();
    assert!(conn.is_dropped());

    server.join().unwrap();
}

#[test]
fn early_response_preempts_a_large_upload() {
    let (port, server) = spawn_server(|mut stream| {
        // Read only whatever's immediately available (far less than the
        // full body) and respond right away, never draining the rest.
        let mut buf = [0u8; 4096];
        let _ = stream.read(&mut buf).expect("read request prefix");
        stream.write_all(b"HTTP/1.1 413 Payload Too Large\r\n\r\n").unwrap();
        let _ = stream.shutdown(std::net::Shutdown::Write);
        thread::sleep(Duration::from_millis(100));
    });

    let mut conn: Connection = Connection::new("127.0.0.1", port);
    conn.connect(None, Some(TIMEOUT)).unwrap();

    let body = vec![b'x'; 8 * 1024 * 1024];
    let request = Request::new("PUT", "/upload")
        .with_header("Host", "example.test")
        .with_header("Content-Length", body.len().to_string())
        .with_body(Body::Bytes(body));

    let mut response = conn.send_request(request, Some(Duration::from_secs(10))).unwrap();
    assert_eq!(response.status_code, 413);
    let trailing = response.read_to_end(Some(Duration::from_secs(10))).unwrap();
    assert!(trailing.is_empty());

    server.join().unwrap();
}

#[test]
fn read_timeout_when_server_stalls_mid_body() {
    let (port, server) = spawn_server(|mut stream| {
        let _ = read_request_head(&mut stream);
        stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n").unwrap();
        // Never send the promised 100 bytes.
        thread::sleep(Duration::from_millis(700));
    });

    let mut conn: Connection = Connection::new("127.0.0.1", port);
    conn.connect(None, Some(TIMEOUT)).unwrap();

    let request = Request::new("GET", "/").with_header("Host", "example.test");
    let mut response = conn.send_request(request, Some(Duration::from_millis(250))).unwrap();
    let err = response.next_chunk(Some(Duration::from_millis(250))).unwrap_err();
    assert!(matches!(err, Error::ReadTimeout));

    server.join().unwrap();
}

/// Connects to `port`, handing back a non-blocking `mio::net::TcpStream`
/// the way `Connection::tcp_connect` does before the CONNECT
/// sub-protocol runs over it (`tunnel()` registers it with the selector
/// itself).
fn connect_mio(port: u16) -> mio::net::TcpStream {
    let std_sock = TcpStream::connect(("127.0.0.1", port)).expect("connect to loopback proxy");
    std_sock.set_nonblocking(true).expect("set_nonblocking");
    mio::net::TcpStream::from_std(std_sock)
}

#[test]
fn tunnel_connect_success() {
    let (port, server) = spawn_server(|mut stream| {
        let head = read_request_head(&mut stream);
        assert!(head.starts_with(b"CONNECT "));
        stream.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n").unwrap();
        thread::sleep(Duration::from_millis(100));
    });

    let mut selector = Selector::new().expect("new selector");
    let mut sock = connect_mio(port);

    let config = TunnelConfig {
        host: "origin.example.test".to_string(),
        port: 443,
        headers: Vec::new(),
    };
    let result = tunnel::tunnel(&mut sock, &mut selector, &config);
    assert!(result.is_ok(), "expected tunnel() to succeed, got {:?}", result.err());

    server.join().unwrap();
}

#[test]
fn tunnel_connect_failure_surfaces_failed_tunnel_error() {
    let (port, server) = spawn_server(|mut stream| {
        let head = read_request_head(&mut stream);
        assert!(head.starts_with(b"CONNECT "));
        stream.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").unwrap();
        thread::sleep(Duration::from_millis(100));
    });

    let mut selector = Selector::new().expect("new selector");
    let mut sock = connect_mio(port);

    let config = TunnelConfig {
        host: "origin.example.test".to_string(),
        port: 443,
        headers: Vec::new(),
    };
    let err = tunnel::tunnel(&mut sock, &mut selector, &config).unwrap_err();
    match err {
        Error::FailedTunnelError(response) => assert_eq!(response.status_code, 407),
        other => panic!("expected FailedTunnelError, got {:?}", other),
    }

    server.join().unwrap();
}
