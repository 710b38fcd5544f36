//! Wire protocol between leader and followers
//!
//! Every message is one variant of [`SyncMessage`], serialized as JSON
//! (`{"event": "...", "payload": ...}`) inside a length-prefixed frame
//! (see [`super::transport`]). Records are schemaless JSON, which is why the
//! payload format is JSON rather than a binary codec.

use serde::{Deserialize, Serialize};

use crate::adapter::Record;

/// Opaque identifier the leader assigns to each accepted connection
pub type PeerId = String;

/// Type of mutation recorded in the change log and carried by requests
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::Insert => write!(f, "insert"),
            ChangeKind::Update => write!(f, "update"),
            ChangeKind::Delete => write!(f, "delete"),
        }
    }
}

/// A single entry of the per-collection change log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeRecord {
    /// Change index, monotonic per identifier on the peer that appended it
    pub index: i64,
    /// Collection identifier
    pub identifier: String,
    /// External id of the affected record
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
}

/// Payload of `insert_request` / `update_request` / `delete_request`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mutation {
    pub identifier: String,
    pub data: Record,
    #[serde(rename = "externalId")]
    pub external_id: i64,
}

/// Payload of `insert_response` / `update_response` / `delete_response`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ack {
    pub identifier: String,
    #[serde(rename = "externalId")]
    pub external_id: i64,
}

/// Entry of the peer list the leader distributes with `set_clients`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub connected: bool,
    pub host: String,
    pub port: u16,
    /// Instance name; only sent to the peer that asked with `get_clients`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl PeerInfo {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Copy without the instance name, for membership broadcasts
    pub fn anonymized(&self) -> Self {
        Self {
            name: None,
            ..self.clone()
        }
    }
}

/// Messages exchanged between peers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum SyncMessage {
    // === Membership ===
    /// Follower asks the leader to validate its service name
    CheckValidServer {
        service_name: String,
        instance_name: String,
        /// Port the follower listens on if it ever becomes leader
        listen_port: u16,
    },
    /// Leader accepted the follower
    ValidServer { leader_name: String, peer_id: PeerId },
    /// Follower requests the peer list
    GetClients,
    /// Leader distributes the peer list
    SetClients { clients: Vec<PeerInfo> },

    // === Mutations ===
    InsertRequest(Mutation),
    UpdateRequest(Mutation),
    DeleteRequest(Mutation),
    InsertResponse(Ack),
    UpdateResponse(Ack),
    DeleteResponse(Ack),

    // === Bulk catch-up ===
    GetData {
        identifier: String,
        last_external_id: i64,
        latest_change_index: Option<i64>,
    },
    SetData {
        identifier: String,
        data: Vec<Record>,
        changes: Vec<ChangeRecord>,
        last_external_id: Option<i64>,
    },

    /// Peer must close the connection
    Disconnect,
}

impl SyncMessage {
    pub fn request(kind: ChangeKind, mutation: Mutation) -> Self {
        match kind {
            ChangeKind::Insert => SyncMessage::InsertRequest(mutation),
            ChangeKind::Update => SyncMessage::UpdateRequest(mutation),
            ChangeKind::Delete => SyncMessage::DeleteRequest(mutation),
        }
    }

    pub fn response(kind: ChangeKind, ack: Ack) -> Self {
        match kind {
            ChangeKind::Insert => SyncMessage::InsertResponse(ack),
            ChangeKind::Update => SyncMessage::UpdateResponse(ack),
            ChangeKind::Delete => SyncMessage::DeleteResponse(ack),
        }
    }

    /// Event name as it appears on the wire
    pub fn event(&self) -> &'static str {
        match self {
            SyncMessage::CheckValidServer { .. } => "check_valid_server",
            SyncMessage::ValidServer { .. } => "valid_server",
            SyncMessage::GetClients => "get_clients",
            SyncMessage::SetClients { .. } => "set_clients",
            SyncMessage::InsertRequest(_) => "insert_request",
            SyncMessage::UpdateRequest(_) => "update_request",
            SyncMessage::DeleteRequest(_) => "delete_request",
            SyncMessage::InsertResponse(_) => "insert_response",
            SyncMessage::UpdateResponse(_) => "update_response",
            SyncMessage::DeleteResponse(_) => "delete_response",
            SyncMessage::GetData { .. } => "get_data",
            SyncMessage::SetData { .. } => "set_data",
            SyncMessage::Disconnect => "disconnect",
        }
    }

    /// Encode message to JSON bytes (without frame header)
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode message from JSON bytes (without frame header)
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sync_message_encode_decode() {
        let msg = SyncMessage::SetData {
            identifier: "messages".to_string(),
            data: vec![json!({"externalId": 3, "message": "hi"})],
            changes: vec![ChangeRecord {
                index: 4,
                identifier: "messages".to_string(),
                id: 3,
                kind: ChangeKind::Update,
            }],
            last_external_id: Some(2),
        };

        let encoded = msg.encode().unwrap();
        let decoded = SyncMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_wire_event_names() {
        let msg = SyncMessage::InsertResponse(Ack {
            identifier: "messages".to_string(),
            external_id: 9,
        });
        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();

        assert_eq!(value["event"], "insert_response");
        assert_eq!(value["payload"]["externalId"], 9);
        assert_eq!(msg.event(), "insert_response");

        let value = serde_json::to_value(SyncMessage::GetClients).unwrap();
        assert_eq!(value["event"], "get_clients");
    }

    #[test]
    fn test_change_record_uses_type_field() {
        let change = ChangeRecord {
            index: 1,
            identifier: "messages".to_string(),
            id: 1,
            kind: ChangeKind::Delete,
        };
        let value = serde_json::to_value(&change).unwrap();
        assert_eq!(value["type"], "delete");
    }

    #[test]
    fn test_peer_info_anonymized_drops_name() {
        let peer = PeerInfo {
            id: "p1".to_string(),
            connected: true,
            host: "10.0.0.2".to_string(),
            port: 8001,
            name: Some("chat_2".to_string()),
        };

        let anon = peer.anonymized();
        assert_eq!(anon.name, None);
        assert_eq!(anon.addr(), "10.0.0.2:8001");

        let value = serde_json::to_value(&anon).unwrap();
        assert!(value.get("name").is_none());
    }

    #[test]
    fn test_request_response_constructors() {
        let mutation = Mutation {
            identifier: "m".to_string(),
            data: json!({}),
            external_id: 1,
        };
        assert_eq!(
            SyncMessage::request(ChangeKind::Delete, mutation).event(),
            "delete_request"
        );
        let ack = Ack {
            identifier: "m".to_string(),
            external_id: 1,
        };
        assert_eq!(
            SyncMessage::response(ChangeKind::Update, ack).event(),
            "update_response"
        );
    }
}
