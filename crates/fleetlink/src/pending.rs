//! Pending-request registry for correlated exchanges
//!
//! Implements request/response correlation on top of an otherwise
//! push-oriented stream: a caller registers a single-use delivery slot under
//! a fresh correlation id before sending its request, and the dispatch loop
//! hands matching inbound messages into the slot.

use fleetlink_proto::ServerMessage;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

/// Registry mapping correlation ids to one-shot delivery slots.
///
/// Cloneable handle; all clones share the same map. The internal lock is
/// only held for map operations, never across I/O or an await point.
#[derive(Clone, Default)]
pub struct PendingRequests {
    slots: Arc<Mutex<HashMap<Uuid, oneshot::Sender<ServerMessage>>>>,
}

impl PendingRequests {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a delivery slot for `id` and return its receiving end.
    ///
    /// Must be called before the correlated request is sent, so a fast
    /// response cannot arrive before the slot exists.
    pub fn register(&self, id: Uuid) -> oneshot::Receiver<ServerMessage> {
        let (tx, rx) = oneshot::channel();
        let mut slots = self.slots.lock().expect("pending map poisoned");
        slots.insert(id, tx);
        rx
    }

    /// Remove the slot for `id`. Safe to call repeatedly; callers unregister
    /// unconditionally when their wait ends, whichever way it ended.
    pub fn unregister(&self, id: Uuid) {
        let mut slots = self.slots.lock().expect("pending map poisoned");
        slots.remove(&id);
    }

    /// Attempt to deliver an inbound message to the slot matching its id.
    ///
    /// Returns `None` when a slot matched: the message now belongs to the
    /// waiting caller, even if that caller has already given up, and the
    /// hand-off never blocks. Returns the message back when no slot
    /// matched, so the dispatch loop can route it to the handler instead.
    pub fn deliver(&self, message: ServerMessage) -> Option<ServerMessage> {
        let sender = {
            let mut slots = self.slots.lock().expect("pending map poisoned");
            slots.remove(&message.id)
        };

        match sender {
            Some(tx) => {
                if tx.send(message).is_err() {
                    // Caller gave up between lookup and hand-off; drop.
                    debug!("pending slot receiver dropped before delivery");
                }
                None
            }
            None => Some(message),
        }
    }

    /// Drop every registered slot so all waiters observe termination.
    pub fn fail_all(&self) {
        let drained: Vec<_> = {
            let mut slots = self.slots.lock().expect("pending map poisoned");
            slots.drain().collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "failing pending requests");
        }
        // Dropping the senders resolves every receiver with a closed error.
    }

    /// Number of outstanding slots
    pub fn len(&self) -> usize {
        self.slots.lock().expect("pending map poisoned").len()
    }

    /// Whether the registry has no outstanding slots
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetlink_proto::message::{GetKeyResponse, ServerPayload};
    use fleetlink_proto::new_id;
    use proptest::prelude::*;

    fn key_response(id: Uuid, passphrase: &str) -> ServerMessage {
        ServerMessage {
            id,
            payload: ServerPayload::GetKeyResponse(GetKeyResponse {
                passphrase: passphrase.to_string(),
            }),
        }
    }

    #[tokio::test]
    async fn test_register_then_deliver() {
        let pending = PendingRequests::new();
        let id = new_id();

        let rx = pending.register(id);
        assert_eq!(pending.len(), 1);

        let undelivered = pending.deliver(key_response(id, "abc123"));
        assert!(undelivered.is_none());
        assert!(pending.is_empty());

        let msg = rx.await.unwrap();
        assert_eq!(msg.id, id);
    }

    #[tokio::test]
    async fn test_deliver_unknown_id_returns_message() {
        let pending = PendingRequests::new();
        let msg = key_response(new_id(), "abc123");
        let msg_id = msg.id;

        let undelivered = pending.deliver(msg);
        assert_eq!(undelivered.unwrap().id, msg_id);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_goes_nowhere() {
        let pending = PendingRequests::new();
        let id = new_id();

        let rx = pending.register(id);
        assert!(pending.deliver(key_response(id, "first")).is_none());
        rx.await.unwrap();

        // Slot consumed; a duplicate is no longer correlated.
        let dup = pending.deliver(key_response(id, "second"));
        assert!(dup.is_some());
    }

    #[tokio::test]
    async fn test_delivery_to_abandoned_slot_does_not_block() {
        let pending = PendingRequests::new();
        let id = new_id();

        let rx = pending.register(id);
        drop(rx);

        // Matched the registry, so it is consumed rather than re-routed.
        let undelivered = pending.deliver(key_response(id, "late"));
        assert!(undelivered.is_none());
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let pending = PendingRequests::new();
        let id = new_id();

        let _rx = pending.register(id);
        pending.unregister(id);
        pending.unregister(id);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_fail_all_unblocks_waiters() {
        let pending = PendingRequests::new();
        let rx1 = pending.register(new_id());
        let rx2 = pending.register(new_id());

        pending.fail_all();

        assert!(rx1.await.is_err());
        assert!(rx2.await.is_err());
        assert!(pending.is_empty());
    }

    proptest! {
        #[test]
        fn test_every_registered_slot_receives_its_message(count in 1usize..32) {
            tokio_test::block_on(async {
                let pending = PendingRequests::new();

                let mut slots = Vec::new();
                for _ in 0..count {
                    let id = new_id();
                    slots.push((id, pending.register(id)));
                }

                // Deliver in reverse of registration order; matching is by
                // id, not order.
                for (id, _) in slots.iter().rev() {
                    prop_assert!(pending.deliver(key_response(*id, "k")).is_none());
                }

                for (id, rx) in slots {
                    prop_assert_eq!(rx.await.unwrap().id, id);
                }
                prop_assert!(pending.is_empty());
                Ok(())
            })?;
        }
    }
}
