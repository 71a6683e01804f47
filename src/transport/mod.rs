//! The `transport` module speaks the wire protocol.
//!
//! It holds the STOMP frame model and codec, the protocol engine that runs a
//! session over an established byte stream, and the dialing seams (name
//! resolution, TCP/TLS connectors, certificate loading) used to establish
//! those streams.

pub mod codec;
pub mod connector;
pub mod engine;
pub mod frame;
pub mod tls;

pub use connector::{
    BoxedTransport, Connector, DnsResolver, Endpoint, Resolver, TcpConnector, split_host_port,
};
pub use engine::{Connection, Delivery};
pub use frame::{Command, Frame, Headers};
pub use tls::TlsSettings;

#[cfg(test)]
pub(crate) mod testing;
