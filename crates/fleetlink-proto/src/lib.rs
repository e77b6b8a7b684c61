//! # Fleetlink Protocol
//!
//! Envelope types and codec for the Fleetlink agent control channel.
//!
//! Every message on the channel is an envelope carrying a time-ordered
//! correlation id and exactly one typed payload variant. Outbound envelopes
//! ([`AgentMessage`]) flow from the agent to the management server, inbound
//! envelopes ([`ServerMessage`]) flow back. The codec frames envelopes with a
//! length prefix over any async byte stream.

#![warn(missing_docs)]

/// Envelope and payload types
pub mod message;

/// Message codec for async streams
pub mod codec;

/// Error types for protocol operations
pub mod error;

pub use codec::MessageCodec;
pub use error::ProtocolError;
pub use message::{new_id, AgentMessage, AgentPayload, ServerMessage, ServerPayload};
