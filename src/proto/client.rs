use super::{Event, NextEvent, RequestHead, State, StateMachine};

const MIN_HEADERS: usize = 16;
const MAX_HEADERS: usize = 1024;

/// How the currently-receiving response body is framed on the wire.
#[derive(Debug, Clone)]
enum BodyFraming {
    /// No body at all (HEAD response, 1xx/204/304, or we haven't seen
    /// headers yet).
    None,
    /// `Content-Length: N`; `remaining` counts down to zero.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked(ChunkState),
    /// Neither of the above: framed by connection close.
    CloseDelimited,
}

#[derive(Debug, Clone)]
enum ChunkState {
    /// Waiting for a `<hex-size>\r\n` line.
    AwaitingSize,
    /// `remaining` bytes of chunk data left, then a trailing `\r\n`.
    InChunk(u64),
    /// Waiting for optional trailer headers, terminated by a blank line.
    Trailer,
}

/// The client-side half of an HTTP/1.1 exchange: request serialization and
/// response parsing/framing, built on `httparse` for the status line and
/// header block (grounded on `server/headers.rs`'s `MIN_HEADERS`/
/// `MAX_HEADERS` stack-then-heap parsing idiom) with a small hand-rolled
/// chunked-transfer decoder, since `httparse` only parses heads.
pub struct ClientConn {
    our_state: State,
    their_state: State,
    /// Bytes received but not yet consumed by a completed event.
    buf: Vec<u8>,
    /// Set once `receive_data(&[])` (EOF) has been observed.
    eof: bool,
    /// Whether we've already surfaced `ConnectionClosed` once.
    closed_reported: bool,
    /// Whether the current request was a `HEAD` (its response never has
    /// a body, regardless of headers).
    is_head: bool,
    /// Whether our own request declared `Connection: close`.
    we_will_close: bool,
    framing: BodyFraming,
}

fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

fn headers_to_owned(headers: &[httparse::Header]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect()
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

impl ClientConn {
    pub fn new() -> ClientConn {
        ClientConn {
            our_state: State::Idle,
            their_state: State::Idle,
            buf: Vec::new(),
            eof: false,
            closed_reported: false,
            is_head: false,
            we_will_close: false,
            framing: BodyFraming::None,
        }
    }

    fn try_parse_response(&mut self) -> Option<Event> {
        // Try with a small stack-allocated header array first (the common
        // case), and fall back to a heap-allocated one sized up to
        // `MAX_HEADERS` only if the response carries an unusually large
        // header block, mirroring `server/headers.rs`'s stack-then-heap
        // parsing idiom.
        let mut small = [httparse::EMPTY_HEADER; MIN_HEADERS];
        let mut large;
        let result = {
            let mut resp = httparse::Response::new(&mut small);
            match resp.parse(&self.buf) {
                Ok(httparse::Status::Complete(n)) => Some((
                    resp.code.unwrap_or(0),
                    resp.version.unwrap_or(1),
                    headers_to_owned(resp.headers),
                    n,
                )),
                Ok(httparse::Status::Partial) => None,
                Err(httparse::Error::TooManyHeaders) => {
                    large = vec![httparse::EMPTY_HEADER; MAX_HEADERS];
                    let mut resp = httparse::Response::new(&mut large);
                    match resp.parse(&self.buf) {
                        Ok(httparse::Status::Complete(n)) => Some((
                            resp.code.unwrap_or(0),
                            resp.version.unwrap_or(1),
                            headers_to_owned(resp.headers),
                            n,
                        )),
                        Ok(httparse::Status::Partial) => None,
                        Err(httparse::Error::Version) => {
                            return Some(self.unparseable_version_event())
                        }
                        Err(_) => return Some(Event::ConnectionClosed),
                    }
                }
                Err(httparse::Error::Version) => return Some(self.unparseable_version_event()),
                Err(_) => return Some(Event::ConnectionClosed),
            }
        };
        let (status_code, version_minor, headers, consumed) = result?;

        self.buf.drain(..consumed);

        let http_version = if version_minor == 0 {
            b"HTTP/1.0".to_vec()
        } else {
            b"HTTP/1.1".to_vec()
        };

        let server_close = find_header(&headers, "connection")
            .map(|v| has_token(v, "close"))
            .unwrap_or(false)
            || (version_minor == 0
                && !find_header(&headers, "connection")
                    .map(|v| has_token(v, "keep-alive"))
                    .unwrap_or(false));

        let no_body = self.is_head
            || matches!(status_code, 100..=199 | 204 | 304);

        self.framing = if no_body {
            BodyFraming::None
        } else if let Some(te) = find_header(&headers, "transfer-encoding") {
            if has_token(te, "chunked") {
                BodyFraming::Chunked(ChunkState::AwaitingSize)
            } else {
                BodyFraming::CloseDelimited
            }
        } else if let Some(len) = find_header(&headers, "content-length") {
            match len.trim().parse::<u64>() {
                Ok(n) => BodyFraming::Length(n),
                Err(_) => BodyFraming::CloseDelimited,
            }
        } else {
            BodyFraming::CloseDelimited
        };

        self.we_will_close = self.we_will_close || server_close;
        self.their_state = if matches!(self.framing, BodyFraming::None) {
            if server_close { State::MustClose } else { State::Done }
        } else {
            State::RecvBody
        };

        Some(Event::Response { status_code, http_version, headers })
    }

    /// `httparse` hard-codes the `HTTP/1.` status-line prefix and errors
    /// out on any other major version rather than parsing it, so a
    /// literal `HTTP/2.0` (or any non-1.x) status line never reaches the
    /// `Ok(Status::Complete(..))` arm above. Since rejecting such a
    /// response is the *engine's* job (`BadVersionError`),
    /// not the state machine's, this surfaces it as an ordinary `Response`
    /// event carrying whatever version token the peer actually declared —
    /// the engine's own `http_version != {HTTP/1.0, HTTP/1.1}` check then
    /// rejects it exactly as it would for a well-formed-but-wrong version.
    fn unparseable_version_event(&mut self) -> Event {
        let version = extract_declared_version(&self.buf).unwrap_or_else(|| b"HTTP/?.?".to_vec());
        self.their_state = State::Closed;
        Event::Response { status_code: 0, http_version: version, headers: Vec::new() }
    }

    /// Attempts to pull one `Data`/`EndOfMessage` event out of the body
    /// framing state and the buffered bytes. Returns `None` if more input
    /// is required.
    fn try_parse_body(&mut self) -> Option<Event> {
        match &mut self.framing {
            BodyFraming::None => {
                self.their_state = if self.we_will_close { State::MustClose } else { State::Done };
                Some(Event::EndOfMessage)
            }
            BodyFraming::Length(remaining) => {
                if *remaining == 0 {
                    self.their_state = if self.we_will_close { State::MustClose } else { State::Done };
                    return Some(Event::EndOfMessage);
                }
                if self.buf.is_empty() {
                    return None;
                }
                let take = (*remaining).min(self.buf.len() as u64) as usize;
                let chunk: Vec<u8> = self.buf.drain(..take).collect();
                *remaining -= chunk.len() as u64;
                Some(Event::Data(chunk))
            }
            BodyFraming::CloseDelimited => {
                if !self.buf.is_empty() {
                    let chunk = std::mem::take(&mut self.buf);
                    return Some(Event::Data(chunk));
                }
                if self.eof {
                    self.their_state = State::MustClose;
                    return Some(Event::EndOfMessage);
                }
                None
            }
            BodyFraming::Chunked(state) => self.try_parse_chunk(state.clone()),
        }
    }

    fn try_parse_chunk(&mut self, mut state: ChunkState) -> Option<Event> {
        loop {
            match state {
                ChunkState::AwaitingSize => {
                    let line_end = find_crlf(&self.buf)?;
                    let line = self.buf[..line_end].to_vec();
                    self.buf.drain(..line_end + 2);
                    let line_str = std::str::from_utf8(&line).ok()?;
                    let size_str = line_str.split(';').next().unwrap_or("").trim();
                    let size = u64::from_str_radix(size_str, 16).ok()?;
                    if size == 0 {
                        state = ChunkState::Trailer;
                        continue;
                    }
                    state = ChunkState::InChunk(size);
                    continue;
                }
                ChunkState::InChunk(remaining) => {
                    if remaining == 0 {
                        // Consume the trailing CRLF after chunk data.
                        if self.buf.len() < 2 {
                            self.framing = BodyFraming::Chunked(ChunkState::InChunk(0));
                            return None;
                        }
                        self.buf.drain(..2);
                        self.framing = BodyFraming::Chunked(ChunkState::AwaitingSize);
                        return self.try_parse_body();
                    }
                    if self.buf.is_empty() {
                        self.framing = BodyFraming::Chunked(ChunkState::InChunk(remaining));
                        return None;
                    }
                    let take = remaining.min(self.buf.len() as u64) as usize;
                    let chunk: Vec<u8> = self.buf.drain(..take).collect();
                    let left = remaining - chunk.len() as u64;
                    self.framing = BodyFraming::Chunked(ChunkState::InChunk(left));
                    return Some(Event::Data(chunk));
                }
                ChunkState::Trailer => {
                    let line_end = match find_crlf(&self.buf) {
                        Some(n) => n,
                        None => {
                            self.framing = BodyFraming::Chunked(ChunkState::Trailer);
                            return None;
                        }
                    };
                    if line_end == 0 {
                        self.buf.drain(..2);
                        self.their_state =
                            if self.we_will_close { State::MustClose } else { State::Done };
                        return Some(Event::EndOfMessage);
                    }
                    // Discard trailer header line and keep scanning.
                    self.buf.drain(..line_end + 2);
                    continue;
                }
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Pulls the raw `HTTP/x.y` token a peer declared out of a buffered status
/// line, for reporting in a `BadVersionError` when the token isn't the
/// `HTTP/1.` prefix `httparse` accepts. Returns `None` if the buffer
/// doesn't even start with `HTTP/`.
fn extract_declared_version(buf: &[u8]) -> Option<Vec<u8>> {
    if !buf.starts_with(b"HTTP/") {
        return None;
    }
    let rest = &buf[b"HTTP/".len()..];
    let end = rest.iter().position(|&b| b == b' ' || b == b'\r' || b == b'\n').unwrap_or(rest.len());
    Some([b"HTTP/", &rest[..end]].concat())
}

impl Default for ClientConn {
    fn default() -> ClientConn {
        ClientConn::new()
    }
}

impl StateMachine for ClientConn {
    fn our_state(&self) -> State {
        self.our_state
    }

    fn their_state(&self) -> State {
        self.their_state
    }

    fn send_request(&mut self, head: RequestHead) -> Vec<u8> {
        self.is_head = head.method.eq_ignore_ascii_case(b"HEAD");
        self.we_will_close = head
            .headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(b"connection"))
            .map(|(_, v)| has_token(&String::from_utf8_lossy(v), "close"))
            .unwrap_or(false);

        let mut out = Vec::new();
        out.extend_from_slice(&head.method);
        out.push(b' ');
        out.extend_from_slice(&head.target);
        out.extend_from_slice(b" HTTP/1.1\r\n");
        for (name, value) in &head.headers {
            out.extend_from_slice(name);
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        self.our_state = State::SendBody;
        out
    }

    fn send_data(&mut self, data: &[u8]) -> Vec<u8> {
        data.to_vec()
    }

    fn send_end_of_message(&mut self) -> Vec<u8> {
        self.our_state = if self.we_will_close { State::MustClose } else { State::Done };
        Vec::new()
    }

    fn receive_data(&mut self, data: &[u8]) {
        if data.is_empty() {
            self.eof = true;
        } else {
            self.buf.extend_from_slice(data);
        }
    }

    fn next_event(&mut self) -> NextEvent {
        if self.their_state == State::Idle {
            if let Some(event) = self.try_parse_response() {
                return NextEvent::Ready(event);
            }
            if self.eof {
                if self.closed_reported {
                    return NextEvent::NeedData;
                }
                self.closed_reported = true;
                self.their_state = State::Closed;
                return NextEvent::Ready(Event::ConnectionClosed);
            }
            return NextEvent::NeedData;
        }

        if self.their_state == State::RecvBody {
            if let Some(event) = self.try_parse_body() {
                return NextEvent::Ready(event);
            }
            if self.eof && !self.closed_reported {
                self.closed_reported = true;
                return NextEvent::Ready(Event::ConnectionClosed);
            }
            return NextEvent::NeedData;
        }

        NextEvent::NeedData
    }

    fn start_next_cycle(&mut self) {
        self.our_state = State::Idle;
        self.their_state = State::Idle;
        self.is_head = false;
        self.we_will_close = false;
        self.framing = BodyFraming::None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(method: &str, target: &str, headers: &[(&str, &str)]) -> RequestHead {
        RequestHead {
            method: method.as_bytes().to_vec(),
            target: target.as_bytes().to_vec(),
            headers: headers
                .iter()
                .map(|(n, v)| (n.as_bytes().to_vec(), v.as_bytes().to_vec()))
                .collect(),
        }
    }

    #[test]
    fn serializes_request_head() {
        let mut conn = ClientConn::new();
        let bytes = conn.send_request(head("GET", "/", &[("Host", "example.test")]));
        assert_eq!(bytes, b"GET / HTTP/1.1\r\nHost: example.test\r\n\r\n");
        assert_eq!(conn.our_state(), State::SendBody);
    }

    #[test]
    fn parses_content_length_response() {
        let mut conn = ClientConn::new();
        conn.send_request(head("GET", "/", &[]));
        conn.send_end_of_message();
        conn.receive_data(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabc");
        let ev = conn.next_event();
        match ev {
            NextEvent::Ready(Event::Response { status_code, .. }) => assert_eq!(status_code, 200),
            other => panic!("unexpected event: {:?}", other),
        }
        match conn.next_event() {
            NextEvent::Ready(Event::Data(d)) => assert_eq!(d, b"abc"),
            other => panic!("unexpected event: {:?}", other),
        }
        match conn.next_event() {
            NextEvent::Ready(Event::EndOfMessage) => {}
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(conn.their_state(), State::Done);
    }

    #[test]
    fn parses_chunked_response() {
        let mut conn = ClientConn::new();
        conn.send_request(head("GET", "/", &[]));
        conn.send_end_of_message();
        conn.receive_data(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
              4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
        );
        assert!(matches!(conn.next_event(), NextEvent::Ready(Event::Response { .. })));
        let mut collected = Vec::new();
        loop {
            match conn.next_event() {
                NextEvent::Ready(Event::Data(d)) => collected.extend(d),
                NextEvent::Ready(Event::EndOfMessage) => break,
                other => panic!("unexpected: {:?}", other),
            }
        }
        assert_eq!(collected, b"Wikipedia");
    }

    #[test]
    fn connection_close_forces_must_close() {
        let mut conn = ClientConn::new();
        conn.send_request(head("GET", "/", &[]));
        conn.send_end_of_message();
        conn.receive_data(b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n");
        assert!(matches!(conn.next_event(), NextEvent::Ready(Event::Response { .. })));
        assert!(matches!(conn.next_event(), NextEvent::Ready(Event::EndOfMessage)));
        assert_eq!(conn.their_state(), State::MustClose);
    }

    #[test]
    fn unsupported_major_version_surfaces_as_response_with_declared_version() {
        let mut conn = ClientConn::new();
        conn.send_request(head("GET", "/", &[]));
        conn.send_end_of_message();
        conn.receive_data(b"HTTP/2.0 200 OK\r\n\r\n");
        match conn.next_event() {
            NextEvent::Ready(Event::Response { http_version, .. }) => {
                assert_eq!(http_version, b"HTTP/2.0");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
