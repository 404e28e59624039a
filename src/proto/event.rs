//! Event and state types for the HTTP/1.1 state machine contract.

/// Which side of the exchange a state belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// States a single role can be in. Named after h11's states, since the
/// engine's reuse decision explicitly checks `IDLE`/`DONE`/`MUST_CLOSE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Not currently sending or receiving a message.
    Idle,
    /// Client has sent headers, is still sending body chunks.
    SendBody,
    /// Server is sending response body.
    RecvBody,
    /// This role has finished its half of the current exchange.
    Done,
    /// This role (or the other one) has signalled the connection must be
    /// torn down after the current exchange.
    MustClose,
    /// The underlying connection has been observed closed.
    Closed,
}

/// One event exchanged between caller and state machine.
#[derive(Debug, Clone)]
pub enum Event {
    /// A request is about to be sent (`send`-only; carries nothing back to
    /// the caller beyond its serialized bytes).
    Request,
    /// A chunk of body data, arriving (response) or leaving (request).
    Data(Vec<u8>),
    /// No more bytes belong to the current message.
    EndOfMessage,
    /// A fully parsed response status line + header block.
    Response {
        status_code: u16,
        http_version: Vec<u8>,
        headers: Vec<(String, String)>,
    },
    /// The peer closed the connection.
    ConnectionClosed,
}
