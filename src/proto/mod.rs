//! The HTTP/1.1 state machine contract and one concrete implementation of
//! it (`ClientConn`).
//!
//! The state machine is a pluggable black box; this module defines the
//! trait the engine is generic over, plus a real client-side
//! implementation built on `httparse`.

mod client;
mod event;

pub use client::ClientConn;
pub use event::{Event, Role, State};

/// Bytes to serialize for a request head. Callers (the engine) are
/// responsible for normalizing header names to ASCII and values to
/// Latin-1 before building this.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Vec<u8>,
    pub target: Vec<u8>,
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
}

/// The state machine's answer to a `next_event()` query: either it needs
/// more input bytes (`NEED_DATA`) or it has an event ready.
#[derive(Debug, Clone)]
pub enum NextEvent {
    NeedData,
    Ready(Event),
}

/// The pluggable collaborator the engine drives.
///
/// An engine (`crate::client::engine::Connection`) is generic over this
/// trait so that tests can substitute a state machine fed from scripted
/// byte streams without touching engine control flow.
pub trait StateMachine {
    fn our_state(&self) -> State;
    fn their_state(&self) -> State;

    /// Serializes a request head for sending; transitions `our_state`
    /// from `Idle` to `SendBody`.
    fn send_request(&mut self, head: RequestHead) -> Vec<u8>;
    /// Serializes one body chunk for sending.
    fn send_data(&mut self, data: &[u8]) -> Vec<u8>;
    /// Serializes the end-of-body marker (a no-op on the wire unless
    /// chunked trailers are in play) and transitions `our_state` to
    /// `Done` or `MustClose`.
    fn send_end_of_message(&mut self) -> Vec<u8>;

    /// Feeds received bytes in. An empty slice signals EOF.
    fn receive_data(&mut self, data: &[u8]);
    /// Asks for the next event the buffered input makes available.
    fn next_event(&mut self) -> NextEvent;

    /// Resets both roles to `Idle` for a new exchange on the same
    /// connection.
    fn start_next_cycle(&mut self);
}
