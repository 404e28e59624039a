//! Request/Response value types.
//!
//! These are plain records. A `Request` is immutable after construction and
//! its body is consumed by the engine exactly once. A `Response`'s body
//! handle is the engine itself, acting as a lazy iterator of body chunks —
//! expressed here as a mutable borrow rather than a back-reference.

use std::borrow::Cow;

/// One field of a request or response body that isn't a plain byte string.
pub enum Body {
    /// No body at all.
    None,
    /// A body whose bytes are already fully available.
    Bytes(Vec<u8>),
    /// A body sourced from a blocking `Read` implementation, consumed in
    /// `chunk_size`-sized reads until exhausted.
    Readable(Box<dyn std::io::Read + Send>, usize),
    /// A body sourced from a finite or infinite iterator of byte chunks.
    Chunks(Box<dyn Iterator<Item = Vec<u8>> + Send>),
}

impl Body {
    pub fn readable<R: std::io::Read + Send + 'static>(r: R) -> Body {
        Body::Readable(Box::new(r), 8192)
    }

    pub fn chunks<I>(iter: I) -> Body
    where
        I: IntoIterator<Item = Vec<u8>>,
        I::IntoIter: Send + 'static,
    {
        Body::Chunks(Box::new(iter.into_iter()))
    }

    /// Turns this body into an iterator of byte chunks. A `None` body
    /// yields nothing.
    pub(crate) fn into_chunks(self) -> Box<dyn Iterator<Item = Vec<u8>> + Send> {
        match self {
            Body::None => Box::new(std::iter::empty()),
            Body::Bytes(b) => Box::new(std::iter::once(b)),
            Body::Readable(mut r, chunk_size) => {
                Box::new(std::iter::from_fn(move || {
                    let mut buf = vec![0u8; chunk_size];
                    match r.read(&mut buf) {
                        Ok(0) => None,
                        Ok(n) => {
                            buf.truncate(n);
                            Some(buf)
                        }
                        Err(_) => None,
                    }
                }))
            }
            Body::Chunks(it) => it,
        }
    }
}

/// An ordered header name/value pair. Order and case are preserved exactly
/// as given by the caller.
pub type Header = (Cow<'static, str>, Cow<'static, str>);

/// Attaches `host`/`port`/`scheme` metadata to a request, for proxy/tunnel
/// purposes.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub host: String,
    pub port: u16,
    pub scheme: &'static str,
}

/// An immutable description of an HTTP request. The engine consumes
/// `body` exactly once.
pub struct Request {
    pub method: Cow<'static, str>,
    pub target: Cow<'static, str>,
    pub headers: Vec<Header>,
    pub body: Body,
    pub host_info: Option<HostInfo>,
}

impl Request {
    pub fn new(
        method: impl Into<Cow<'static, str>>,
        target: impl Into<Cow<'static, str>>,
    ) -> Request {
        Request {
            method: method.into(),
            target: target.into(),
            headers: Vec::new(),
            body: Body::None,
            host_info: None,
        }
    }

    pub fn with_header(
        mut self,
        name: impl Into<Cow<'static, str>>,
        value: impl Into<Cow<'static, str>>,
    ) -> Request {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Body) -> Request {
        self.body = body;
        self
    }

    /// Attaches `host`/`port`/`scheme` metadata for proxy/tunnel purposes:
    /// `client::engine::build_request_head` derives a `Host` header from
    /// this when the caller hasn't already set one explicitly, the same
    /// role h11's `Request.add_host` plays for
    /// `original_source/urllib3/sync_connection.py`'s tunnel request.
    pub fn add_host(mut self, host: impl Into<String>, port: u16, scheme: &'static str) -> Request {
        self.host_info = Some(HostInfo { host: host.into(), port, scheme });
        self
    }
}

/// The metadata of a response: status, headers and HTTP version, with no
/// attached body handle. A live response (returned from `send_request`)
/// pairs this with a body iterator borrowed from the engine — see
/// `client::engine::Response`. This bodyless form is what's carried by
/// `Error::FailedTunnelError`, since a failed CONNECT response never gets
/// a body stream handed to the caller.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status_code: u16,
    /// Headers decoded as Latin-1 text, in arrival order.
    pub headers: Vec<(String, String)>,
    /// e.g. `HTTP/1.1`.
    pub http_version: Vec<u8>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}
