//! # Fleetlink
//!
//! Client-side transport core for a device-management agent: one long-lived
//! bidirectional message stream to a management server, request/response
//! correlation multiplexed over that stream, and periodic background
//! producers (heartbeat, inventory).
//!
//! The embedding application supplies an [`EventHandler`] for inbound push
//! events and drives everything through [`Client::run`], which returns
//! exactly once with the first fatal error (or `Ok` after a deliberate
//! [`Client::close`]).

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use fleetlink_proto as proto;

/// Error types for the Fleetlink library
pub mod error;

/// Connection parameters and builder
pub mod config;

/// Transport seam and the in-tree development connector
pub mod transport;

/// Pending-request registry for correlated exchanges
pub mod pending;

/// Transport session: stream ownership and write serialization
pub mod session;

/// Handler contract for inbound push events
pub mod handler;

/// Client: dispatch loop, background runners, correlated requests
pub mod client;

/// In-memory transport for tests
pub mod test_utils;

pub use client::{ChunkSender, Client, KeyClient};
pub use config::{ClientBuilder, ClientConfig, TransportSecurity};
pub use error::ClientError;
pub use handler::{
    EventHandler, InventoryHandler, RevocationHandler, RevokeOutcome, StreamingHandler,
};
pub use pending::PendingRequests;
pub use session::Session;
pub use transport::{Connector, MessageSink, MessageSource, TcpConnector};

/// Result type alias for Fleetlink operations
pub type Result<T> = std::result::Result<T, ClientError>;
