//! # SOME/IP Endpoint & Transport Core
//!
//! The endpoint and transport core of a SOME/IP middleware: concurrent,
//! multi-protocol endpoints over UDP, TCP, and host-local transports, with
//! large-message segmentation/reassembly, connection lifecycle management,
//! and a debounce/batching transmission scheduler.
//!
//! Service-discovery semantics, routing-table decisions, configuration
//! loading, security policy, and the application-facing subscribe/offer API
//! are explicitly out of scope: this crate talks to those concerns only
//! through the [`config::ConfigurationView`] and [`routing::RoutingHost`]
//! trait seams, owned and implemented by a host crate.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod local;
pub mod logging;
pub mod manager;
pub mod registry;
pub mod routing;
pub mod tp;
pub mod train;
pub mod transport;
pub mod utils;
pub mod wire;

pub use config::{ConfigurationView, StaticConfiguration};
pub use error::EndpointError;
pub use routing::{PeerIdentity, RoutingHost};

/// The crate version, re-exported for hosts that want to log it alongside
/// their own.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
