//! A synchronous, single-connection HTTP/1.1 client engine.
//!
//! This crate drives one TCP (optionally TLS-wrapped) connection through
//! the lifecycle of one or more HTTP request/response exchanges: readiness-
//! driven non-blocking I/O over a [`selector::Selector`], a pluggable
//! [`proto::StateMachine`] that enforces HTTP/1.1 framing, and a
//! [`client::engine::Connection`] that ties socket setup (including
//! optional CONNECT tunneling and TLS wrapping), the send/receive loop, and
//! connection-reuse decisions together.
//!
//! A lazy [`multipart::Encoder`] is included for serializing
//! `multipart/form-data` request bodies with a pre-computable length.
//!
//! What this crate deliberately does not do: HTTP/2 or HTTP/3, concurrent
//! multiplexing of requests over one connection, connection pooling, retry
//! or redirect policies, URL parsing, cookie stores, or certificate chain
//! loading. Those are the job of a layer built on top of this one.
//!
//! # Example
//!
//! ```no_run
//! use sync_http1::client::Connection;
//! use sync_http1::message::Request;
//!
//! let mut conn = Connection::new("example.test", 80);
//! conn.connect(None, Some(std::time::Duration::from_secs(10)))?;
//!
//! let request = Request::new("GET", "/").with_header("Host", "example.test");
//! let mut response = conn.send_request(request, Some(std::time::Duration::from_secs(30)))?;
//! let body = response.read_to_end(Some(std::time::Duration::from_secs(30)))?;
//! # Ok::<(), sync_http1::error::Error>(())
//! ```

pub mod client;
pub mod error;
pub mod io;
pub mod message;
pub mod multipart;
pub mod proto;
pub mod selector;

pub use client::{Connection, Response, SocketOption, SocketOptions, TlsOptions};
pub use error::{Error, Result, Warning};
pub use message::{Body, Request};
