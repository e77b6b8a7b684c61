//! Error types for protocol operations

use thiserror::Error;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Message truncated or malformed
    #[error("Invalid message framing")]
    InvalidMessage,

    /// Message exceeds the configured size limit
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Actual message size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// I/O error on the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
