//! CONNECT tunnel sub-protocol.
//!
//! Grounded on `original_source/urllib3/sync_connection.py`'s `_tunnel`/
//! `_build_tunnel_request`: a *separate* state machine instance drives the
//! CONNECT exchange, since tunnel traffic is not part of the main HTTP
//! exchange the caller eventually sees.

use std::borrow::Cow;

use crate::error::{Error, Result};
use crate::message::ResponseHead;
use crate::proto::{ClientConn, Event, NextEvent, RequestHead, StateMachine};
use crate::selector::{Interest, Selector, Timeout};

use super::engine::{receive_until_event, send_unless_readable};

/// Configuration for tunneling the main connection through an HTTP proxy
/// (`tunnel_host`/`tunnel_port`/`tunnel_headers`).
pub struct TunnelConfig {
    pub host: String,
    pub port: u16,
    pub headers: Vec<(Cow<'static, str>, Cow<'static, str>)>,
}

/// Builds the `CONNECT` request head, deriving a `Host` header from the
/// tunnel target the same way `add_host` does for an ordinary request
/// (`client::engine::build_request_head`) — grounded on
/// `_build_tunnel_request`'s `tunnel_request.add_host(host, port,
/// scheme='http')` call, unless the caller's own tunnel headers already
/// supply one.
fn build_tunnel_request(host: &str, port: u16, caller_headers: &[(Cow<'static, str>, Cow<'static, str>)]) -> RequestHead {
    let mut headers: Vec<(Vec<u8>, Vec<u8>)> = caller_headers
        .iter()
        .map(|(n, v)| (n.as_bytes().to_vec(), v.as_bytes().to_vec()))
        .collect();
    if !headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(b"Host")) {
        headers.push((b"Host".to_vec(), format!("{}:{}", host, port).into_bytes()));
    }
    RequestHead {
        method: b"CONNECT".to_vec(),
        target: format!("{}:{}", host, port).into_bytes(),
        headers,
    }
}

/// Runs the CONNECT exchange over an already-connected, still-blocking
/// socket. On success the socket is left
/// blocking and unregistered from `selector`, ready for TLS wrapping. On
/// failure the caller is expected to close the socket itself.
pub fn tunnel(
    sock: &mut mio::net::TcpStream,
    selector: &mut Selector,
    config: &TunnelConfig,
) -> Result<()> {
    let mut tunnel_conn = ClientConn::new();

    let head = build_tunnel_request(&config.host, config.port, &config.headers);

    let mut bytes_to_send = tunnel_conn.send_request(head);
    bytes_to_send.extend(tunnel_conn.send_end_of_message());

    selector.register(sock, Interest::READ_WRITE)?;
    send_unless_readable(sock, selector, &mut tunnel_conn, &bytes_to_send, None)?;

    selector.modify(sock, Interest::READ)?;

    let no_timeout: Timeout = None;
    let response = loop {
        match receive_until_event(sock, selector, &mut tunnel_conn, no_timeout)? {
            Event::Response { status_code, http_version, headers } => {
                break ResponseHead { status_code, http_version, headers }
            }
            Event::ConnectionClosed => return Err(Error::ConnectionClosed),
            _ => continue,
        }
    };

    if response.status_code != 200 {
        selector.unregister(sock)?;
        return Err(Error::FailedTunnelError(Box::new(response)));
    }

    selector.unregister(sock)?;
    Ok(())
}
