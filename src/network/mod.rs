//! Network subsystem: WebSocket transport to the remote agent

pub mod transport;

pub use transport::{connect, parse_frame, RemoteEnd, TransportEvent, TransportLink};
