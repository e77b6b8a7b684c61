//! Transport seam and the in-tree development connector
//!
//! The wire transport is an external collaborator: production deployments
//! supply a [`Connector`] that applies the configured TLS material. The
//! in-tree [`TcpConnector`] frames messages with the protocol codec over a
//! plain TCP stream and exists for development and tests.

use crate::config::{ClientConfig, TransportSecurity};
use crate::error::ClientError;
use crate::Result;
use async_trait::async_trait;
use fleetlink_proto::{AgentMessage, MessageCodec, ServerMessage};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

/// Write half of a connected stream.
///
/// Implementations need not be internally synchronized; the session wraps
/// the sink in its single write lock.
#[async_trait]
pub trait MessageSink: Send {
    /// Write one complete message.
    async fn send(&mut self, message: &AgentMessage) -> Result<()>;

    /// Flush and close the write side.
    async fn shutdown(&mut self) -> Result<()>;
}

/// Read half of a connected stream.
///
/// There is exactly one logical consumer at a time; the session hands the
/// source to the dispatch loop by ownership rather than locking.
#[async_trait]
pub trait MessageSource: Send {
    /// Block until the next inbound message. `Ok(None)` means the peer
    /// closed the stream cleanly.
    async fn recv(&mut self) -> Result<Option<ServerMessage>>;
}

/// Factory for connected stream halves.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish the stream and return its split halves.
    async fn connect(&self) -> Result<(Box<dyn MessageSink>, Box<dyn MessageSource>)>;
}

/// Development connector: codec-framed messages over plain TCP.
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    /// Create a connector for the given address
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// Create a connector from client configuration.
    ///
    /// Rejects TLS security modes: those require an embedder-supplied
    /// connector that owns the TLS stack.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        match config.security {
            TransportSecurity::Plaintext | TransportSecurity::InsecureSkipVerify => {
                Ok(Self::new(config.server_addr.clone()))
            }
            _ => Err(ClientError::Config(
                "TLS transport requires an external connector".to_string(),
            )),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<(Box<dyn MessageSink>, Box<dyn MessageSource>)> {
        debug!(addr = %self.addr, "connecting");
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| ClientError::Transport(format!("connect {}: {}", self.addr, e)))?;
        let (read_half, write_half) = stream.into_split();

        Ok((
            Box::new(TcpSink {
                writer: write_half,
                codec: MessageCodec::new(),
            }),
            Box::new(TcpSource {
                reader: read_half,
                codec: MessageCodec::new(),
            }),
        ))
    }
}

struct TcpSink {
    writer: OwnedWriteHalf,
    codec: MessageCodec,
}

#[async_trait]
impl MessageSink for TcpSink {
    async fn send(&mut self, message: &AgentMessage) -> Result<()> {
        self.codec
            .write_message(&mut self.writer, message)
            .await
            .map_err(ClientError::from)
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.writer
            .shutdown()
            .await
            .map_err(|e| ClientError::Transport(format!("shutdown: {}", e)))
    }
}

struct TcpSource {
    reader: OwnedReadHalf,
    codec: MessageCodec,
}

#[async_trait]
impl MessageSource for TcpSource {
    async fn recv(&mut self) -> Result<Option<ServerMessage>> {
        self.codec
            .read_message(&mut self.reader)
            .await
            .map_err(ClientError::from)
    }
}
