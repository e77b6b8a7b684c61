//! Handler contract for inbound push events
//!
//! The embedding application supplies an [`EventHandler`] for the base
//! capability set. Optional capabilities (streaming output, inventory
//! collection, key revocation) are separate traits discovered at runtime
//! through the query methods on the base trait, so the dispatch loop can
//! branch on what a concrete handler actually supports.

use crate::client::{ChunkSender, KeyClient};
use async_trait::async_trait;
use fleetlink_proto::message::{
    Action, ActionResult, DeviceInventory, OsQuery, OsQueryResult, ServerError, Welcome,
};

/// Base capability: react to the push events every agent must understand.
///
/// An error returned from any of these callbacks is fatal to the whole
/// session: the dispatch loop stops and the session closes.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called when the server sends its welcome after hello.
    async fn on_welcome(&self, welcome: Welcome) -> anyhow::Result<()>;

    /// Called when the server dispatches an action. Returning `Ok(None)`
    /// means there is no terminal result to report (e.g. the result was
    /// already streamed) and is not an error.
    async fn on_action(&self, action: Action) -> anyhow::Result<Option<ActionResult>>;

    /// Called when the server sends an OS query. A non-`None` result is
    /// sent back to the server.
    async fn on_query(&self, query: OsQuery) -> anyhow::Result<Option<OsQueryResult>>;

    /// Called when the server pushes an error.
    async fn on_error(&self, error: ServerError) -> anyhow::Result<()>;

    /// Streaming-output capability, if this handler has one.
    fn streaming(&self) -> Option<&dyn StreamingHandler> {
        None
    }

    /// Inventory-collection capability, if this handler has one.
    fn inventory(&self) -> Option<&dyn InventoryHandler> {
        None
    }

    /// Key-revocation capability, if this handler has one.
    fn revocation(&self) -> Option<&dyn RevocationHandler> {
        None
    }
}

/// Optional capability: stream output chunks while an action executes.
///
/// When a handler exposes this capability, the dispatch loop routes actions
/// here instead of [`EventHandler::on_action`].
#[async_trait]
pub trait StreamingHandler: Send + Sync {
    /// Handle an action with a side channel for incremental output. Chunks
    /// written through `chunks` go out through the session's serialized
    /// send path while the action is still running.
    async fn on_action_streaming(
        &self,
        action: Action,
        chunks: &ChunkSender,
    ) -> anyhow::Result<Option<ActionResult>>;
}

/// Optional capability: collect hardware/software inventory.
#[async_trait]
pub trait InventoryHandler: Send + Sync {
    /// Gather inventory from the device. `None` means no inventory is
    /// available right now (not an error); nothing is sent.
    async fn collect_inventory(&self) -> Option<DeviceInventory>;
}

/// Outcome of a key revocation.
#[derive(Debug, Clone)]
pub struct RevokeOutcome {
    /// Whether revocation succeeded
    pub success: bool,
    /// Error description when `success` is false
    pub error: Option<String>,
}

impl RevokeOutcome {
    /// Successful outcome
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    /// Failed outcome with a description
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Optional capability: revoke a device-bound disk-encryption key.
///
/// Revocation runs on its own task, never inline in the dispatch loop: the
/// handler typically calls [`KeyClient::get_key`], which sends a correlated
/// request and waits for a response that only the dispatch loop can
/// deliver.
#[async_trait]
pub trait RevocationHandler: Send + Sync {
    /// Revoke the key for the given action. `keys` may be used to fetch or
    /// store passphrases mid-revocation.
    async fn on_revoke_key(&self, keys: &KeyClient, action_id: &str) -> RevokeOutcome;
}
