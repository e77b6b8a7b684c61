//! Error types for the Fleetlink library

use fleetlink_proto::ProtocolError;
use thiserror::Error;

/// Main error type for Fleetlink operations
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connect called while a stream is already open
    #[error("already connected")]
    AlreadyConnected,

    /// Operation requires an open stream
    #[error("not connected")]
    NotConnected,

    /// Transport-level failure (I/O error, peer closed the stream)
    #[error("transport error: {0}")]
    Transport(String),

    /// Session was closed while the operation was in flight
    #[error("session closed")]
    Closed,

    /// Server-reported application error in a correlated response
    #[error("server error: {message}")]
    Server {
        /// Message reported by the server
        message: String,
    },

    /// Correlated reply carried a payload variant the request cannot accept
    #[error("unexpected response type")]
    UnexpectedResponse,

    /// Fatal error from a handler callback
    #[error("handler error: {0}")]
    Handler(String),

    /// Invalid connection parameters
    #[error("configuration error: {0}")]
    Config(String),

    /// Wire protocol error
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
