//! Error taxonomy surfaced to callers of the connection engine.
//!
//! These are not low-level wire errors; they are the named failure kinds a
//! caller is expected to branch on (timeouts, tunnel failures, protocol
//! precondition violations, ...). Socket and TLS failures that don't have a
//! more specific kind are wrapped as `Io`/`Tls`.

use std::io;

use quick_error::quick_error;

use crate::message::ResponseHead;

quick_error! {
    /// Failure kinds a caller of [`crate::client::Connection`] may see.
    #[derive(Debug)]
    pub enum Error {
        /// TCP establishment exceeded `connect_timeout`.
        ConnectTimeout {
            display("connection timed out")
        }
        /// TCP establishment failed for a reason other than a timeout.
        NewConnectionError(err: io::Error) {
            display("failed to establish a new connection: {}", err)
        }
        /// The CONNECT proxy replied with a status other than 200.
        FailedTunnelError(response: Box<ResponseHead>) {
            display("tunnel connection failed with status {}",
                response.status_code)
        }
        /// The peer's HTTP version was not `1.0` or `1.1`.
        BadVersionError(version: Vec<u8>) {
            display("unsupported HTTP version: {}",
                String::from_utf8_lossy(version))
        }
        /// A request body was not bytes, a readable, or an iterable of
        /// chunks.
        InvalidBodyError(what: &'static str) {
            display("unacceptable request body: {}", what)
        }
        /// `send_request` was called while the state machine was not in
        /// (IDLE, IDLE), or some other state-machine precondition was
        /// violated.
        ProtocolError(msg: &'static str) {
            display("protocol error: {}", msg)
        }
        /// `read_timeout` was exceeded while waiting for response data.
        ReadTimeout {
            display("read timed out")
        }
        /// The peer closed the connection before the current message
        /// finished framing.
        ConnectionClosed {
            display("connection closed by peer")
        }
        /// TLS handshake or verification failure (fingerprint mismatch,
        /// hostname mismatch, handshake error).
        TlsError(msg: String) {
            display("TLS error: {}", msg)
        }
        /// A lower-level I/O failure not covered by a more specific kind.
        Io(err: io::Error) {
            display("I/O error: {}", err)
            from()
        }
    }
}

/// Non-fatal diagnostics. These are not returned as `Err`; they are
/// surfaced on the process-global `log` warning channel (see
/// `crate::client::tls`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Warning {
    /// The peer certificate had no `subjectAltName`; falling back to
    /// matching `commonName`.
    SubjectAltName,
    /// The system clock appears to be set before `RECENT_DATE`, which
    /// commonly causes bogus TLS verification failures.
    SystemTime,
}

impl Warning {
    pub fn log(self) {
        match self {
            Warning::SubjectAltName => log::warn!(
                "certificate has no `subjectAltName`, falling back to \
                 `commonName` matching (this is deprecated upstream)"
            ),
            Warning::SystemTime => log::warn!(
                "system clock is set before the last known-recent date; \
                 this will probably cause TLS verification errors"
            ),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
