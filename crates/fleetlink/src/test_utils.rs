//! In-memory transport for tests
//!
//! A channel-backed [`Connector`] whose far end is a [`ChannelServer`]: the
//! test script pushes server messages, observes what the client sent, and can
//! simulate a peer close. Message-level only; wire framing is covered by the
//! protocol crate's own tests.

use crate::error::ClientError;
use crate::transport::{Connector, MessageSink, MessageSource};
use crate::Result;
use async_trait::async_trait;
use fleetlink_proto::{AgentMessage, ServerMessage};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// The server's end of an in-memory transport.
pub struct ChannelServer {
    to_client: Option<mpsc::UnboundedSender<ServerMessage>>,
    from_client: mpsc::UnboundedReceiver<AgentMessage>,
}

impl ChannelServer {
    /// Push a message toward the client.
    ///
    /// # Panics
    ///
    /// Panics if the client end is gone or the stream was disconnected.
    pub fn push(&self, message: ServerMessage) {
        self.to_client
            .as_ref()
            .expect("push after disconnect")
            .send(message)
            .expect("client source dropped");
    }

    /// Receive the next message the client sent. `None` once the client
    /// side has shut down its sink.
    pub async fn recv(&mut self) -> Option<AgentMessage> {
        self.from_client.recv().await
    }

    /// Simulate the peer closing the stream: the client's source observes
    /// a clean end-of-stream on its next read.
    pub fn disconnect(&mut self) {
        self.to_client = None;
    }
}

/// Single-use connector producing the client end of an in-memory transport.
pub struct ChannelConnector {
    halves: Mutex<Option<(ChannelSink, ChannelSource)>>,
}

/// Create a connected in-memory transport pair.
pub fn channel_transport() -> (ChannelConnector, ChannelServer) {
    let (to_server, from_client) = mpsc::unbounded_channel();
    let (to_client, from_server) = mpsc::unbounded_channel();

    let connector = ChannelConnector {
        halves: Mutex::new(Some((
            ChannelSink { outbound: to_server },
            ChannelSource {
                inbound: from_server,
            },
        ))),
    };
    let server = ChannelServer {
        to_client: Some(to_client),
        from_client,
    };

    (connector, server)
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self) -> Result<(Box<dyn MessageSink>, Box<dyn MessageSource>)> {
        let (sink, source) = self
            .halves
            .lock()
            .expect("transport halves poisoned")
            .take()
            .ok_or_else(|| ClientError::Transport("transport already consumed".to_string()))?;
        Ok((Box::new(sink), Box::new(source)))
    }
}

struct ChannelSink {
    outbound: mpsc::UnboundedSender<AgentMessage>,
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn send(&mut self, message: &AgentMessage) -> Result<()> {
        self.outbound
            .send(message.clone())
            .map_err(|_| ClientError::Transport("server end dropped".to_string()))
    }

    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

struct ChannelSource {
    inbound: mpsc::UnboundedReceiver<ServerMessage>,
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn recv(&mut self) -> Result<Option<ServerMessage>> {
        Ok(self.inbound.recv().await)
    }
}
