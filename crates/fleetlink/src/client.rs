//! Client: dispatch loop, background runners, correlated requests
//!
//! [`Client::run`] owns the session lifecycle: connect, hello, spawn the
//! heartbeat and inventory runners, then drive the dispatch loop (the sole
//! reader of inbound traffic) until a fatal error or a deliberate close.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::handler::EventHandler;
use crate::pending::PendingRequests;
use crate::session::Session;
use crate::transport::{Connector, TcpConnector};
use crate::Result;
use fleetlink_proto::message::{
    ActionResult, DeviceInventory, GetKeyRequest, Heartbeat, Hello, OsQueryResult, OutputChunk,
    RevokeKeyResult, SecurityAlert, ServerPayload, StoreKeyRequest,
};
use fleetlink_proto::{AgentMessage, ServerMessage};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Client for the Fleetlink control channel.
///
/// Cheap to share behind an `Arc`; [`Client::close`] may be called from any
/// task and acts as the session's top-level cancellation signal.
pub struct Client {
    config: ClientConfig,
    connector: Box<dyn Connector>,
    session: Arc<Session>,
    pending: PendingRequests,
}

impl Client {
    /// Create a client using the in-tree development connector.
    ///
    /// Fails when the configured security mode needs a real TLS transport;
    /// use [`Client::with_connector`] to supply one.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let connector = TcpConnector::from_config(&config)?;
        Ok(Self::with_connector(config, Box::new(connector)))
    }

    /// Create a client with an embedder-supplied transport.
    pub fn with_connector(config: ClientConfig, connector: Box<dyn Connector>) -> Self {
        let pending = PendingRequests::new();
        Self {
            config,
            connector,
            session: Arc::new(Session::new(pending.clone())),
            pending,
        }
    }

    /// The configuration this client was built with
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Handle for correlated key operations, usable from any task.
    pub fn keys(&self) -> KeyClient {
        KeyClient {
            session: self.session.clone(),
            pending: self.pending.clone(),
        }
    }

    /// Establish the stream. Fails with [`ClientError::AlreadyConnected`]
    /// if one is already open.
    pub async fn connect(&self) -> Result<()> {
        self.session.connect(self.connector.as_ref()).await
    }

    /// Tear the session down. Idempotent; unblocks the dispatch loop and
    /// every caller waiting on a correlated response.
    pub async fn close(&self) {
        self.session.close().await;
    }

    /// Send the identification message.
    pub async fn send_hello(&self) -> Result<()> {
        self.session
            .send(&AgentMessage::hello(Hello {
                device_id: self.config.device_id.clone(),
                auth_token: self.config.auth_token.clone(),
                hostname: self.config.hostname.clone(),
                agent_version: self.config.agent_version.clone(),
            }))
            .await
    }

    /// Send a heartbeat message.
    pub async fn send_heartbeat(&self, heartbeat: Heartbeat) -> Result<()> {
        self.session.send(&AgentMessage::heartbeat(heartbeat)).await
    }

    /// Send a terminal action result.
    pub async fn send_action_result(&self, result: ActionResult) -> Result<()> {
        self.session
            .send(&AgentMessage::action_result(result))
            .await
    }

    /// Send an output chunk produced during action execution.
    pub async fn send_output_chunk(&self, chunk: OutputChunk) -> Result<()> {
        self.session.send(&AgentMessage::output_chunk(chunk)).await
    }

    /// Send an OS query result.
    pub async fn send_query_result(&self, result: OsQueryResult) -> Result<()> {
        self.session.send(&AgentMessage::query_result(result)).await
    }

    /// Send a security alert for server-side audit logging.
    pub async fn send_security_alert(&self, alert: SecurityAlert) -> Result<()> {
        self.session
            .send(&AgentMessage::security_alert(alert))
            .await
    }

    /// Send an inventory snapshot. `None` means nothing to send and is not
    /// an error.
    pub async fn send_inventory(&self, inventory: Option<DeviceInventory>) -> Result<()> {
        match inventory {
            Some(inventory) => self.session.send(&AgentMessage::inventory(inventory)).await,
            None => Ok(()),
        }
    }

    /// Send the outcome of a key revocation.
    pub async fn send_revoke_result(&self, result: RevokeKeyResult) -> Result<()> {
        self.session
            .send(&AgentMessage::revoke_key_result(result))
            .await
    }

    /// Fetch the stored passphrase for an action (correlated request).
    pub async fn get_key(&self, action_id: &str) -> Result<String> {
        self.keys().get_key(action_id).await
    }

    /// Store a rotated passphrase (correlated request).
    pub async fn store_key(
        &self,
        action_id: &str,
        device_path: &str,
        passphrase: &str,
        rotation_reason: &str,
    ) -> Result<()> {
        self.keys()
            .store_key(action_id, device_path, passphrase, rotation_reason)
            .await
    }

    /// Spawn a correlation-only receiver instead of the full [`Client::run`]
    /// loop, for callers that only need the key operations. Inbound messages
    /// that match a pending request are delivered; everything else is
    /// dropped at debug. The task ends on close or transport failure and
    /// closes the session behind it.
    ///
    /// Requires an established stream; fails with
    /// [`ClientError::NotConnected`] before [`Client::connect`].
    pub fn start_receiver(&self) -> Result<()> {
        let mut source = self.session.take_receiver()?;
        let session = self.session.clone();
        let pending = self.pending.clone();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    result = source.recv() => match result {
                        Ok(Some(message)) => message,
                        Ok(None) | Err(_) => break,
                    },
                    _ = session.closed() => break,
                };
                if let Some(message) = pending.deliver(message) {
                    debug!(id = %message.id, "dropping uncorrelated message");
                }
            }
            session.close().await;
        });

        Ok(())
    }

    /// Connect and process messages with the given handler.
    ///
    /// Returns exactly once: `Ok(())` after a deliberate [`Client::close`],
    /// otherwise the first fatal error (transport failure, peer close, or a
    /// handler error on a fatal path). The session is closed and all
    /// pending correlations are failed before returning.
    pub async fn run(&self, handler: Arc<dyn EventHandler>) -> Result<()> {
        self.connect().await?;

        let result = self.run_session(handler).await;
        self.close().await;

        match result {
            Err(ClientError::Closed) => Ok(()),
            other => other,
        }
    }

    async fn run_session(&self, handler: Arc<dyn EventHandler>) -> Result<()> {
        self.send_hello().await?;

        self.spawn_heartbeat();
        if handler.inventory().is_some() {
            self.spawn_inventory(handler.clone());
        }

        // Sole reader of inbound traffic. Anything that must itself wait
        // for an inbound message runs on a spawned task, never here.
        let mut source = self.session.take_receiver()?;

        loop {
            let message = tokio::select! {
                result = source.recv() => match result {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        return Err(ClientError::Transport(
                            "stream closed by peer".to_string(),
                        ))
                    }
                    Err(e) => return Err(e),
                },
                _ = self.session.closed() => return Err(ClientError::Closed),
            };

            // Registry membership decides routing: a matched correlation
            // id belongs to its waiting caller and never reaches the
            // handler.
            let message = match self.pending.deliver(message) {
                None => continue,
                Some(message) => message,
            };

            self.dispatch(message, &handler).await?;
        }
    }

    async fn dispatch(&self, message: ServerMessage, handler: &Arc<dyn EventHandler>) -> Result<()> {
        let ServerMessage { id, payload } = message;

        match payload {
            ServerPayload::Welcome(welcome) => {
                handler.on_welcome(welcome).await.map_err(handler_error)?;
            }

            ServerPayload::Action(action) => {
                let result = if let Some(streaming) = handler.streaming() {
                    let chunks = ChunkSender {
                        session: self.session.clone(),
                    };
                    streaming.on_action_streaming(action, &chunks).await
                } else {
                    handler.on_action(action).await
                }
                .map_err(handler_error)?;

                if let Some(result) = result {
                    self.send_action_result(result).await?;
                }
            }

            ServerPayload::Query(query) => {
                let result = handler.on_query(query).await.map_err(handler_error)?;
                if let Some(result) = result {
                    self.send_query_result(result).await?;
                }
            }

            ServerPayload::Error(error) => {
                handler.on_error(error).await.map_err(handler_error)?;
            }

            ServerPayload::GetKeyResponse(_) | ServerPayload::StoreKeyResponse(_) => {
                // Correlated response whose caller already gave up.
                debug!(%id, "dropping unmatched correlated response");
            }

            ServerPayload::InventoryRequest => {
                if handler.inventory().is_some() {
                    let handler = handler.clone();
                    let session = self.session.clone();
                    // Collection may be slow and IO-bound; never block
                    // dispatch on it.
                    tokio::spawn(async move {
                        if let Some(inventory_handler) = handler.inventory() {
                            collect_and_send(inventory_handler, &session).await;
                        }
                    });
                } else {
                    debug!("inventory requested but handler lacks the capability");
                }
            }

            ServerPayload::RevokeKeyRequest(request) => {
                if handler.revocation().is_some() {
                    let handler = handler.clone();
                    let keys = self.keys();
                    let session = self.session.clone();
                    // Own task: the handler may call get_key, whose response
                    // only this dispatch loop can deliver. Running it inline
                    // would deadlock the session against itself.
                    tokio::spawn(async move {
                        let Some(revocation) = handler.revocation() else {
                            return;
                        };
                        let outcome = revocation.on_revoke_key(&keys, &request.action_id).await;
                        let result = AgentMessage::revoke_key_result(RevokeKeyResult {
                            action_id: request.action_id,
                            success: outcome.success,
                            error: outcome.error,
                        });
                        if let Err(e) = session.send(&result).await {
                            debug!("revoke result send failed: {}", e);
                        }
                    });
                } else {
                    warn!("revoke requested but handler lacks the capability");
                }
            }
        }

        Ok(())
    }

    fn spawn_heartbeat(&self) {
        let session = self.session.clone();
        let period = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick of a tokio interval fires immediately; the first
            // heartbeat should come one period after hello.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = session.closed() => return,
                    _ = ticker.tick() => {
                        let heartbeat = AgentMessage::heartbeat(Heartbeat::default());
                        if let Err(e) = session.send(&heartbeat).await {
                            // The dispatch loop observes the underlying
                            // failure itself; just stop ticking.
                            debug!("heartbeat send failed, stopping runner: {}", e);
                            return;
                        }
                    }
                }
            }
        });
    }

    fn spawn_inventory(&self, handler: Arc<dyn EventHandler>) {
        let session = self.session.clone();
        let period = self.config.inventory_interval;

        tokio::spawn(async move {
            let Some(inventory_handler) = handler.inventory() else {
                return;
            };

            // Initial snapshot on connect
            collect_and_send(inventory_handler, &session).await;

            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = session.closed() => return,
                    _ = ticker.tick() => {
                        collect_and_send(inventory_handler, &session).await;
                    }
                }
            }
        });
    }
}

async fn collect_and_send(handler: &dyn crate::handler::InventoryHandler, session: &Session) {
    match handler.collect_inventory().await {
        Some(inventory) => {
            if let Err(e) = session.send(&AgentMessage::inventory(inventory)).await {
                debug!("inventory send failed: {}", e);
            }
        }
        None => debug!("no inventory available, skipping send"),
    }
}

fn handler_error(e: anyhow::Error) -> ClientError {
    ClientError::Handler(format!("{:#}", e))
}

/// Handle for correlated key operations.
///
/// Cloneable and independent of the dispatch loop's lifetime; revocation
/// handlers receive one so they can fetch or store passphrases while their
/// own request is still being processed.
#[derive(Clone)]
pub struct KeyClient {
    session: Arc<Session>,
    pending: PendingRequests,
}

impl KeyClient {
    /// Fetch the stored passphrase for an action.
    pub async fn get_key(&self, action_id: &str) -> Result<String> {
        let message = AgentMessage::get_key(GetKeyRequest {
            action_id: action_id.to_string(),
        });
        let reply = self.request(message).await?;

        match reply.payload {
            ServerPayload::Error(error) => Err(ClientError::Server {
                message: error.message,
            }),
            ServerPayload::GetKeyResponse(response) => Ok(response.passphrase),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Store a rotated passphrase and wait for the server's confirmation.
    pub async fn store_key(
        &self,
        action_id: &str,
        device_path: &str,
        passphrase: &str,
        rotation_reason: &str,
    ) -> Result<()> {
        let message = AgentMessage::store_key(StoreKeyRequest {
            action_id: action_id.to_string(),
            device_path: device_path.to_string(),
            passphrase: passphrase.to_string(),
            rotation_reason: rotation_reason.to_string(),
        });
        let reply = self.request(message).await?;

        match reply.payload {
            ServerPayload::Error(error) => Err(ClientError::Server {
                message: error.message,
            }),
            ServerPayload::StoreKeyResponse(response) if response.success => Ok(()),
            ServerPayload::StoreKeyResponse(_) => Err(ClientError::Server {
                message: "server rejected key storage".to_string(),
            }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Send a correlated request and wait for its reply: register the slot
    /// before sending (no lost-response race), then race delivery against
    /// session closure, unregistering unconditionally on the way out.
    async fn request(&self, message: AgentMessage) -> Result<ServerMessage> {
        let id = message.id;
        let slot = self.pending.register(id);
        // Covers every exit path, including cancellation by drop.
        let _guard = UnregisterGuard {
            pending: &self.pending,
            id,
        };

        self.session.send(&message).await?;
        tokio::select! {
            result = slot => result.map_err(|_| ClientError::Closed),
            _ = self.session.closed() => Err(ClientError::Closed),
        }
    }
}

struct UnregisterGuard<'a> {
    pending: &'a PendingRequests,
    id: Uuid,
}

impl Drop for UnregisterGuard<'_> {
    fn drop(&mut self) {
        self.pending.unregister(self.id);
    }
}

/// Side channel for streaming output chunks during action execution.
///
/// Writes go through the session's serialized send path, so chunks never
/// interleave with heartbeats or other producers on the wire.
pub struct ChunkSender {
    session: Arc<Session>,
}

impl ChunkSender {
    /// Send one output chunk.
    pub async fn send(&self, chunk: OutputChunk) -> Result<()> {
        self.session.send(&AgentMessage::output_chunk(chunk)).await
    }
}
