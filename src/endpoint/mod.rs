//! # Endpoint Scaffolding (C4/C5 shared types)
//!
//! `EndpointId`/`Destination` identify an endpoint or a per-remote
//! destination the way endpoint identifiers are described: `(protocol,
//! address, port)` for network transports, `(protocol, path)` for
//! filesystem-backed local transports. `client.rs` and `server.rs` build the
//! C4/C5 state machines on top of these.

pub mod client;
pub mod server;

use std::fmt;
use std::net::SocketAddr;

/// Wire protocol family an endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    LocalUds,
    LocalTcp,
}

/// Identifies one endpoint instance for logging and routing-host callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EndpointId {
    Network {
        protocol: Protocol,
        address: std::net::IpAddr,
        port: u16,
    },
    Local {
        protocol: Protocol,
        path: String,
    },
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointId::Network {
                protocol,
                address,
                port,
            } => write!(f, "{protocol:?}://{address}:{port}"),
            EndpointId::Local { protocol, path } => write!(f, "{protocol:?}://{path}"),
        }
    }
}

/// A destination the transmit-train scheduler and send queue
/// operate against: a connected client endpoint has exactly one, a server
/// endpoint has one per remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    Remote(SocketAddr),
    LocalClient(u16),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Remote(addr) => write!(f, "{addr}"),
            Destination::LocalClient(client) => write!(f, "client#{client:04x}"),
        }
    }
}

/// Connection state for a client endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Connected,
    Established,
}
