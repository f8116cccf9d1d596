use chrono::{DateTime, Utc};
use fidoreg_types::{now_seconds, Credential, ServerId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    FidoKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Add,
    Update,
    /// Withdraws an `Add` whose registration was rolled back at the origin.
    Remove,
}

/// One state change as shipped to peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationMessage {
    pub origin: ServerId,
    /// Issue order at the origin; strictly increasing per origin.
    pub sequence: u64,
    pub entity: EntityType,
    pub operation: Operation,
    pub primary_key: String,
    pub payload: Value,
    pub issued_at: DateTime<Utc>,
}

impl ReplicationMessage {
    pub fn for_credential(
        origin: ServerId,
        sequence: u64,
        operation: Operation,
        credential: &Credential,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            origin,
            sequence,
            entity: EntityType::FidoKey,
            operation,
            primary_key: credential.handle.to_string(),
            payload: serde_json::to_value(credential)?,
            issued_at: now_seconds(),
        })
    }
}

/// Peer acknowledgement, `{status, message}` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationResponse {
    pub status: bool,
    pub message: String,
}

impl ReplicationResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: false,
            message: message.into(),
        }
    }
}
