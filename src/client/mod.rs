//! The client-side connection engine and its collaborators:
//! TLS wrapping ([`tls`]) and CONNECT tunneling ([`tunnel`]).

pub mod engine;
pub mod tls;
pub mod tunnel;

pub use engine::{Connection, Response, SocketOption, SocketOptions, TlsOptions};
pub use tunnel::TunnelConfig;
