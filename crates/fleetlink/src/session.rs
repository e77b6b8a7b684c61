//! Transport session: stream ownership and write serialization
//!
//! A [`Session`] owns one bidirectional stream. All writers share a single
//! write lock (concurrent unsynchronized writes would interleave bytes and
//! corrupt wire framing); the read half is handed out by ownership to the
//! one dispatch loop instead of being guarded by a lock.

use crate::pending::PendingRequests;
use crate::transport::{Connector, MessageSink, MessageSource};
use crate::{ClientError, Result};
use fleetlink_proto::AgentMessage;
use std::sync::Mutex as StdMutex;
use tokio::sync::{watch, Mutex};
use tracing::debug;

/// One logical connection attempt to the server.
pub struct Session {
    /// Write half behind the session-wide write lock. `None` until connected.
    sink: Mutex<Option<Box<dyn MessageSink>>>,
    /// Read half, present between connect and the dispatch loop taking it.
    source: StdMutex<Option<Box<dyn MessageSource>>>,
    /// Close signal observed by every task of the session
    closed_tx: watch::Sender<bool>,
    /// Correlation slots to fail on close
    pending: PendingRequests,
}

impl Session {
    /// Create a disconnected session sharing the given registry.
    pub fn new(pending: PendingRequests) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            sink: Mutex::new(None),
            source: StdMutex::new(None),
            closed_tx,
            pending,
        }
    }

    /// Establish the stream. Fails with [`ClientError::AlreadyConnected`] if
    /// one is already open. Not idempotent.
    pub async fn connect(&self, connector: &dyn Connector) -> Result<()> {
        let mut sink_slot = self.sink.lock().await;
        if sink_slot.is_some() {
            return Err(ClientError::AlreadyConnected);
        }

        let (sink, source) = connector.connect().await?;

        *sink_slot = Some(sink);
        *self.source.lock().expect("source slot poisoned") = Some(source);
        self.closed_tx.send_replace(false);

        debug!("session connected");
        Ok(())
    }

    /// Write one message. Serializes all concurrent callers through the
    /// session write lock; once a caller holds it, its message goes out
    /// complete and uninterleaved.
    ///
    /// Both the lock wait and the transport write race the close signal, so
    /// a stalled transport cannot wedge producers or [`Session::close`]
    /// itself behind the lock.
    pub async fn send(&self, message: &AgentMessage) -> Result<()> {
        let mut sink_slot = tokio::select! {
            biased;
            slot = self.sink.lock() => slot,
            _ = self.closed() => return Err(ClientError::Closed),
        };
        let sink = sink_slot.as_mut().ok_or(ClientError::NotConnected)?;

        tokio::select! {
            biased;
            result = sink.send(message) => result,
            _ = self.closed() => Err(ClientError::Closed),
        }
    }

    /// Take ownership of the read half.
    ///
    /// The dispatch loop is the only legal consumer of inbound traffic;
    /// handing the source out by value makes a second reader a hard error
    /// instead of a silent message-routing bug.
    pub fn take_receiver(&self) -> Result<Box<dyn MessageSource>> {
        self.source
            .lock()
            .expect("source slot poisoned")
            .take()
            .ok_or(ClientError::NotConnected)
    }

    /// Whether the session has been closed
    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Wait until the session is closed. Returns immediately if it already
    /// is. Cancellation-safe; intended for use inside `select!`.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Tear the session down. Idempotent.
    ///
    /// Flips the close signal (unblocking the dispatch loop and every task
    /// waiting on it), fails all pending correlation slots so no caller
    /// hangs past teardown, and releases both stream halves.
    pub async fn close(&self) {
        let already_closed = self.closed_tx.send_replace(true);

        // Waiters first: a caller blocked on a correlation slot must not
        // outlive the stream.
        self.pending.fail_all();

        let sink = self.sink.lock().await.take();
        let _ = self.source.lock().expect("source slot poisoned").take();

        if let Some(mut sink) = sink {
            if let Err(e) = sink.shutdown().await {
                debug!("sink shutdown failed: {}", e);
            }
        }

        if !already_closed {
            debug!("session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fleetlink_proto::message::Heartbeat;
    use fleetlink_proto::{new_id, ServerMessage};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    struct FakeSink {
        sent: mpsc::UnboundedSender<AgentMessage>,
    }

    #[async_trait]
    impl MessageSink for FakeSink {
        async fn send(&mut self, message: &AgentMessage) -> Result<()> {
            self.sent
                .send(message.clone())
                .map_err(|_| ClientError::Transport("sink closed".to_string()))
        }

        async fn shutdown(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct FakeSource {
        inbound: mpsc::UnboundedReceiver<ServerMessage>,
    }

    #[async_trait]
    impl MessageSource for FakeSource {
        async fn recv(&mut self) -> Result<Option<ServerMessage>> {
            Ok(self.inbound.recv().await)
        }
    }

    struct FakeConnector {
        sent: mpsc::UnboundedSender<AgentMessage>,
        inbound: StdMutex<Option<mpsc::UnboundedReceiver<ServerMessage>>>,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self) -> Result<(Box<dyn MessageSink>, Box<dyn MessageSource>)> {
            let inbound = self
                .inbound
                .lock()
                .unwrap()
                .take()
                .ok_or(ClientError::AlreadyConnected)?;
            Ok((
                Box::new(FakeSink {
                    sent: self.sent.clone(),
                }),
                Box::new(FakeSource { inbound }),
            ))
        }
    }

    fn fake_connector() -> (FakeConnector, mpsc::UnboundedReceiver<AgentMessage>) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (_inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            FakeConnector {
                sent: sent_tx,
                inbound: StdMutex::new(Some(inbound_rx)),
            },
            sent_rx,
        )
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let (connector, _sent) = fake_connector();
        let session = Session::new(PendingRequests::new());

        session.connect(&connector).await.unwrap();
        let result = session.connect(&connector).await;
        assert!(matches!(result, Err(ClientError::AlreadyConnected)));
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let session = Session::new(PendingRequests::new());
        let msg = AgentMessage::heartbeat(Heartbeat::default());

        let result = session.send(&msg).await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn test_send_goes_through_sink() {
        let (connector, mut sent) = fake_connector();
        let session = Session::new(PendingRequests::new());
        session.connect(&connector).await.unwrap();

        let msg = AgentMessage::heartbeat(Heartbeat::default());
        session.send(&msg).await.unwrap();

        let observed = sent.recv().await.unwrap();
        assert_eq!(observed.id, msg.id);
    }

    #[tokio::test]
    async fn test_receiver_taken_once() {
        let (connector, _sent) = fake_connector();
        let session = Session::new(PendingRequests::new());
        session.connect(&connector).await.unwrap();

        assert!(session.take_receiver().is_ok());
        assert!(matches!(
            session.take_receiver(),
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (connector, _sent) = fake_connector();
        let session = Session::new(PendingRequests::new());
        session.connect(&connector).await.unwrap();

        session.close().await;
        session.close().await;

        assert!(session.is_closed());
        let msg = AgentMessage::heartbeat(Heartbeat::default());
        assert!(matches!(
            session.send(&msg).await,
            Err(ClientError::NotConnected)
        ));
    }

    struct StalledSink;

    #[async_trait]
    impl MessageSink for StalledSink {
        async fn send(&mut self, _message: &AgentMessage) -> Result<()> {
            std::future::pending().await
        }

        async fn shutdown(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct StalledConnector;

    #[async_trait]
    impl Connector for StalledConnector {
        async fn connect(&self) -> Result<(Box<dyn MessageSink>, Box<dyn MessageSource>)> {
            let (_tx, inbound) = mpsc::unbounded_channel();
            Ok((Box::new(StalledSink), Box::new(FakeSource { inbound })))
        }
    }

    #[tokio::test]
    async fn test_close_returns_while_transport_write_is_stalled() {
        let session = Arc::new(Session::new(PendingRequests::new()));
        session.connect(&StalledConnector).await.unwrap();

        let sender = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .send(&AgentMessage::heartbeat(Heartbeat::default()))
                    .await
            })
        };
        // Let the send reach the transport and stall there.
        tokio::time::sleep(Duration::from_millis(10)).await;

        timeout(Duration::from_secs(1), session.close())
            .await
            .expect("close blocked behind a stalled write");

        let result = timeout(Duration::from_secs(1), sender).await.unwrap().unwrap();
        assert!(matches!(result, Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn test_close_unblocks_sender_queued_on_write_lock() {
        let session = Arc::new(Session::new(PendingRequests::new()));
        session.connect(&StalledConnector).await.unwrap();

        // First sender stalls inside the transport holding the write lock;
        // second sender queues on the lock itself.
        let mut senders = Vec::new();
        for _ in 0..2 {
            let session = session.clone();
            senders.push(tokio::spawn(async move {
                session
                    .send(&AgentMessage::heartbeat(Heartbeat::default()))
                    .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        timeout(Duration::from_secs(1), session.close()).await.unwrap();

        for sender in senders {
            let result = timeout(Duration::from_secs(1), sender).await.unwrap().unwrap();
            assert!(matches!(result, Err(ClientError::Closed)));
        }
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_unblocks_closed_waiters() {
        let (connector, _sent) = fake_connector();
        let pending = PendingRequests::new();
        let session = Arc::new(Session::new(pending.clone()));
        session.connect(&connector).await.unwrap();

        let slot = pending.register(new_id());

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.closed().await })
        };

        session.close().await;

        timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(slot.await.is_err());
    }
}
