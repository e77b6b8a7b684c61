//! Envelope and payload types

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Generate a fresh correlation id.
///
/// Version-7 UUIDs are time-ordered, so ids sort by creation time on the
/// wire and in server logs.
pub fn new_id() -> Uuid {
    Uuid::now_v7()
}

/// Outbound envelope: agent to server.
///
/// Every envelope carries a freshly generated id, even when no response is
/// expected, so that all traffic is uniformly correlatable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Correlation id for this message
    pub id: Uuid,
    /// Typed payload
    pub payload: AgentPayload,
}

/// Payload variants the agent can send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AgentPayload {
    /// Initial identification after connecting
    Hello(Hello),
    /// Periodic liveness signal
    Heartbeat(Heartbeat),
    /// Terminal result of a dispatched action
    ActionResult(ActionResult),
    /// Incremental output emitted while an action runs
    OutputChunk(OutputChunk),
    /// Result of an OS query
    QueryResult(OsQueryResult),
    /// Security-relevant event for server-side audit logging
    SecurityAlert(SecurityAlert),
    /// Hardware/software inventory snapshot
    Inventory(DeviceInventory),
    /// Request a stored disk-encryption passphrase (correlated)
    GetKey(GetKeyRequest),
    /// Store a rotated disk-encryption passphrase (correlated)
    StoreKey(StoreKeyRequest),
    /// Outcome of a server-requested key revocation
    RevokeKeyResult(RevokeKeyResult),
}

impl AgentMessage {
    /// Wrap a payload in an envelope with a fresh id.
    pub fn new(payload: AgentPayload) -> Self {
        Self {
            id: new_id(),
            payload,
        }
    }

    /// Create a hello message.
    pub fn hello(hello: Hello) -> Self {
        Self::new(AgentPayload::Hello(hello))
    }

    /// Create a heartbeat message.
    pub fn heartbeat(heartbeat: Heartbeat) -> Self {
        Self::new(AgentPayload::Heartbeat(heartbeat))
    }

    /// Create an action-result message.
    pub fn action_result(result: ActionResult) -> Self {
        Self::new(AgentPayload::ActionResult(result))
    }

    /// Create an output-chunk message.
    pub fn output_chunk(chunk: OutputChunk) -> Self {
        Self::new(AgentPayload::OutputChunk(chunk))
    }

    /// Create a query-result message.
    pub fn query_result(result: OsQueryResult) -> Self {
        Self::new(AgentPayload::QueryResult(result))
    }

    /// Create a security-alert message.
    pub fn security_alert(alert: SecurityAlert) -> Self {
        Self::new(AgentPayload::SecurityAlert(alert))
    }

    /// Create an inventory message.
    pub fn inventory(inventory: DeviceInventory) -> Self {
        Self::new(AgentPayload::Inventory(inventory))
    }

    /// Create a get-key request message.
    pub fn get_key(request: GetKeyRequest) -> Self {
        Self::new(AgentPayload::GetKey(request))
    }

    /// Create a store-key request message.
    pub fn store_key(request: StoreKeyRequest) -> Self {
        Self::new(AgentPayload::StoreKey(request))
    }

    /// Create a revoke-key result message.
    pub fn revoke_key_result(result: RevokeKeyResult) -> Self {
        Self::new(AgentPayload::RevokeKeyResult(result))
    }
}

/// Inbound envelope: server to agent.
///
/// For correlated exchanges the server echoes the id of the originating
/// agent request; push messages carry a server-generated id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMessage {
    /// Correlation id for this message
    pub id: Uuid,
    /// Typed payload
    pub payload: ServerPayload,
}

/// Payload variants the server can send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerPayload {
    /// Greeting after a successful hello
    Welcome(Welcome),
    /// Action dispatched for execution
    Action(Action),
    /// OS query to answer
    Query(OsQuery),
    /// Server-reported error
    Error(ServerError),
    /// Response to a get-key request
    GetKeyResponse(GetKeyResponse),
    /// Response to a store-key request
    StoreKeyResponse(StoreKeyResponse),
    /// Server-initiated request for a fresh inventory
    InventoryRequest,
    /// Server-initiated request to revoke a device-bound key
    RevokeKeyRequest(RevokeKeyRequest),
}

/// Agent identification sent once after connecting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    /// Device identifier assigned at enrollment
    pub device_id: String,
    /// Auth token obtained at enrollment
    pub auth_token: String,
    /// Hostname of the device
    pub hostname: String,
    /// Agent software version
    pub agent_version: String,
}

/// Periodic liveness signal. The server infers liveness from arrival time,
/// so the payload stays minimal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Seconds since the agent process started
    pub uptime_secs: Option<u64>,
}

/// Greeting the server sends after accepting a hello.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Welcome {
    /// Server software version
    pub server_version: String,
    /// Human-readable greeting or MOTD
    pub message: Option<String>,
}

/// An action the server dispatches to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Action identifier, referenced by results and key requests
    pub id: String,
    /// Action kind understood by the embedding application
    pub kind: String,
    /// Kind-specific parameters
    pub params: HashMap<String, String>,
}

/// Terminal result of a dispatched action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    /// Id of the action this result belongs to
    pub action_id: String,
    /// Whether the action succeeded
    pub success: bool,
    /// Captured output, if any
    pub output: Option<String>,
    /// Error description when `success` is false
    pub error: Option<String>,
}

/// Which output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputStream {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// Incremental output emitted while an action executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputChunk {
    /// Id of the action producing the output
    pub action_id: String,
    /// Monotonic sequence number within the action
    pub sequence: u64,
    /// Raw output bytes
    pub data: Bytes,
    /// Stream the bytes came from
    pub stream: OutputStream,
}

/// An OS query the server wants answered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsQuery {
    /// Query identifier
    pub id: String,
    /// Query text in the embedding application's query language
    pub query: String,
}

/// Result of an OS query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsQueryResult {
    /// Id of the query this result answers
    pub query_id: String,
    /// Result rows as JSON text
    pub rows_json: String,
    /// Error description when the query failed
    pub error: Option<String>,
}

/// Security-relevant event reported for audit logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityAlert {
    /// Alert kind (e.g. "tamper", "auth-failure")
    pub kind: String,
    /// Human-readable description
    pub message: String,
}

/// Hardware/software inventory snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceInventory {
    /// OS name and version
    pub os: Option<String>,
    /// Hardware model
    pub hardware_model: Option<String>,
    /// Installed packages (name -> version)
    pub packages: HashMap<String, String>,
    /// Free-form extra fields
    pub extra: HashMap<String, String>,
}

/// Server-reported error. May arrive as a push or as the reply to a
/// correlated request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerError {
    /// Machine-readable error code
    pub code: String,
    /// Human-readable message
    pub message: String,
}

/// Request a stored disk-encryption passphrase for an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetKeyRequest {
    /// Action the passphrase belongs to
    pub action_id: String,
}

/// Correlated reply to [`GetKeyRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetKeyResponse {
    /// The stored passphrase
    pub passphrase: String,
}

/// Store a rotated disk-encryption passphrase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreKeyRequest {
    /// Action the rotation belongs to
    pub action_id: String,
    /// Block device the passphrase unlocks
    pub device_path: String,
    /// The new passphrase
    pub passphrase: String,
    /// Why the key was rotated
    pub rotation_reason: String,
}

/// Correlated reply to [`StoreKeyRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreKeyResponse {
    /// Whether the server accepted the key
    pub success: bool,
}

/// Server-initiated request to revoke a device-bound key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeKeyRequest {
    /// Action the revocation belongs to
    pub action_id: String,
}

/// Outcome of a key revocation, reported back to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeKeyResult {
    /// Action the revocation belonged to
    pub action_id: String,
    /// Whether revocation succeeded
    pub success: bool,
    /// Error description when `success` is false
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_envelope_gets_fresh_id() {
        let a = AgentMessage::heartbeat(Heartbeat::default());
        let b = AgentMessage::heartbeat(Heartbeat::default());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_hello_constructor() {
        let msg = AgentMessage::hello(Hello {
            device_id: "dev-1".to_string(),
            auth_token: "tok".to_string(),
            hostname: "host".to_string(),
            agent_version: "0.1.0".to_string(),
        });

        match msg.payload {
            AgentPayload::Hello(hello) => {
                assert_eq!(hello.device_id, "dev-1");
                assert_eq!(hello.hostname, "host");
            }
            _ => panic!("Expected Hello payload"),
        }
    }

    #[test]
    fn test_message_serialization() {
        let msg = AgentMessage::get_key(GetKeyRequest {
            action_id: "act-7".to_string(),
        });

        let serialized = rmp_serde::to_vec(&msg).unwrap();
        let deserialized: AgentMessage = rmp_serde::from_slice(&serialized).unwrap();

        assert_eq!(msg.id, deserialized.id);
        match deserialized.payload {
            AgentPayload::GetKey(req) => assert_eq!(req.action_id, "act-7"),
            _ => panic!("Expected GetKey payload"),
        }
    }

    #[test]
    fn test_server_message_serialization() {
        let msg = ServerMessage {
            id: new_id(),
            payload: ServerPayload::GetKeyResponse(GetKeyResponse {
                passphrase: "abc123".to_string(),
            }),
        };

        let serialized = rmp_serde::to_vec(&msg).unwrap();
        let deserialized: ServerMessage = rmp_serde::from_slice(&serialized).unwrap();

        assert_eq!(msg.id, deserialized.id);
        match deserialized.payload {
            ServerPayload::GetKeyResponse(resp) => assert_eq!(resp.passphrase, "abc123"),
            _ => panic!("Expected GetKeyResponse payload"),
        }
    }

    proptest! {
        #[test]
        fn test_ids_unique_and_v7(count in 2usize..50) {
            let ids: Vec<_> = (0..count)
                .map(|_| AgentMessage::heartbeat(Heartbeat::default()).id)
                .collect();

            let mut deduped = ids.clone();
            deduped.sort();
            deduped.dedup();
            prop_assert_eq!(deduped.len(), ids.len());

            for id in &ids {
                prop_assert_eq!(id.get_version_num(), 7);
            }
        }
    }
}
