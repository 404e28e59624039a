//! Non-blocking I/O primitives.
//!
//! Grounded on `original_source/urllib3/sync_connection.py`'s
//! `_recv_or_eagain`/`_write_or_eagain`: generic would-block conditions
//! (including a TLS want-read during recv) are normalized to an in-band
//! sentinel, while a want in the *opposite* direction is surfaced so the
//! caller can change which readiness event it waits for (the send-unless-
//! readable and receive loops in `client::engine`). Other socket errors
//! propagate as `io::Error`.

use std::io::{self, Read, Write};

/// Up to 64 KiB per read.
pub const RECV_CHUNK: usize = 65536;

/// The result of one non-blocking recv/send attempt.
#[derive(Debug)]
pub enum IoResult<T> {
    /// Made progress: bytes read (recv) or accepted by the kernel (send).
    Progress(T),
    /// Transient unavailability the caller should treat as "try again
    /// once the same readiness event fires" — a generic would-block, or
    /// (for recv) a TLS want-read, or (for send) a TLS want-write. This is
    /// the sentinel condition modeled as a sum type rather than an
    /// exception, because the send loop treats it as routine.
    WouldBlock,
    /// The *opposite*-direction readiness is required to make progress —
    /// a TLS want-write during recv, or a TLS want-read during send. The
    /// caller must wait for that specific event rather than looping.
    NeedOpposite,
}

/// Anything the engine can read from and write to in a non-blocking
/// fashion: a plain TCP socket, or the TLS adapter in
/// `crate::client::tls`.
pub trait Transport {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<IoResult<usize>>;
    fn send(&mut self, buf: &[u8]) -> io::Result<IoResult<usize>>;
}

fn is_would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

/// `recv_or_wouldblock(sock) -> bytes | WOULDBLOCK`.
pub fn recv_or_wouldblock(t: &mut impl Transport) -> io::Result<IoResult<Vec<u8>>> {
    let mut buf = vec![0u8; RECV_CHUNK];
    match t.recv(&mut buf)? {
        IoResult::Progress(n) => {
            buf.truncate(n);
            Ok(IoResult::Progress(buf))
        }
        IoResult::WouldBlock => Ok(IoResult::WouldBlock),
        IoResult::NeedOpposite => Ok(IoResult::NeedOpposite),
    }
}

/// `send_or_wouldblock(sock, buf) -> int | WOULDBLOCK`.
pub fn send_or_wouldblock(t: &mut impl Transport, buf: &[u8]) -> io::Result<IoResult<usize>> {
    t.send(buf)
}

impl Transport for mio::net::TcpStream {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<IoResult<usize>> {
        match Read::read(self, buf) {
            Ok(n) => Ok(IoResult::Progress(n)),
            Err(e) if is_would_block(&e) => Ok(IoResult::WouldBlock),
            Err(e) => Err(e),
        }
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<IoResult<usize>> {
        match Write::write(self, buf) {
            Ok(n) => Ok(IoResult::Progress(n)),
            Err(e) if is_would_block(&e) => Ok(IoResult::WouldBlock),
            Err(e) => Err(e),
        }
    }
}
