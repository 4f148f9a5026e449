//! Sync data models: log messages, envelopes, and relay wire format.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A cell value carried by a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageValue {
    Null,
    Integer(i64),
    Text(String),
    Boolean(bool),
}

impl MessageValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Boolean(b) => Some(i64::from(*b)),
            _ => None,
        }
    }
}

impl From<&str> for MessageValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for MessageValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for MessageValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<bool> for MessageValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl<T: Into<MessageValue>> From<Option<T>> for MessageValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

impl ToSql for MessageValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Self::Null => Ok(ToSqlOutput::from(rusqlite::types::Null)),
            Self::Integer(i) => Ok(ToSqlOutput::from(*i)),
            Self::Text(s) => Ok(ToSqlOutput::from(s.as_str())),
            Self::Boolean(b) => Ok(ToSqlOutput::from(*b)),
        }
    }
}

impl FromSql for MessageValue {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Null => Ok(Self::Null),
            ValueRef::Integer(i) => Ok(Self::Integer(i)),
            ValueRef::Text(t) => std::str::from_utf8(t)
                .map(|s| Self::Text(s.to_string()))
                .map_err(|e| FromSqlError::Other(Box::new(e))),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

/// One change to the ledger: set `column` of `row_id` in `table` to `value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellChange {
    pub table: String,
    pub row_id: String,
    pub column: String,
    pub value: MessageValue,
}

impl CellChange {
    pub fn new(
        table: impl Into<String>,
        row_id: impl Into<String>,
        column: impl Into<String>,
        value: impl Into<MessageValue>,
    ) -> Self {
        Self {
            table: table.into(),
            row_id: row_id.into(),
            column: column.into(),
            value: value.into(),
        }
    }
}

/// A decoded log message.
///
/// `(device_id, sequence)` identifies a message globally. Merge order is
/// `(timestamp, device_id, sequence)`; `Uuid` ordering matches the
/// lexicographic order of its lowercase hyphenated string form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub ledger_id: String,
    pub timestamp: u64,
    pub device_id: Uuid,
    pub sequence: u64,
    pub table: String,
    pub row_id: String,
    pub column: String,
    pub value: MessageValue,
    /// Hex SHA-256 over every other field.
    pub checksum: String,
}

#[derive(Serialize)]
struct ChecksumInput<'a> {
    ledger_id: &'a str,
    timestamp: u64,
    device_id: &'a Uuid,
    sequence: u64,
    table: &'a str,
    row_id: &'a str,
    column: &'a str,
    value: &'a MessageValue,
}

impl Message {
    pub fn new(
        ledger_id: &str,
        timestamp: u64,
        device_id: Uuid,
        sequence: u64,
        change: CellChange,
    ) -> Self {
        let mut message = Self {
            ledger_id: ledger_id.to_string(),
            timestamp,
            device_id,
            sequence,
            table: change.table,
            row_id: change.row_id,
            column: change.column,
            value: change.value,
            checksum: String::new(),
        };
        message.checksum = message.compute_checksum();
        message
    }

    pub fn compute_checksum(&self) -> String {
        let input = ChecksumInput {
            ledger_id: &self.ledger_id,
            timestamp: self.timestamp,
            device_id: &self.device_id,
            sequence: self.sequence,
            table: &self.table,
            row_id: &self.row_id,
            column: &self.column,
            value: &self.value,
        };
        // Serializing plain structs of strings and integers cannot fail.
        let bytes = bincode::serialize(&input).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    pub fn has_valid_checksum(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    pub fn id(&self) -> MessageId {
        MessageId {
            device_id: self.device_id,
            sequence: self.sequence,
        }
    }

    /// Key used for last-writer-wins ordering.
    pub fn order_key(&self) -> (u64, Uuid, u64) {
        (self.timestamp, self.device_id, self.sequence)
    }
}

/// Global identity of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId {
    pub device_id: Uuid,
    pub sequence: u64,
}

/// Wire/storage form of a message.
///
/// The header fields are cleartext and bound to the ciphertext as associated
/// data. Everything else, including the timestamp and the cell coordinates,
/// is inside `ciphertext`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    pub ledger_id: String,
    pub device_id: Uuid,
    pub sequence: u64,
    pub key_version: u32,
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub auth_tag: Vec<u8>,
}

impl EncryptedMessage {
    pub fn id(&self) -> MessageId {
        MessageId {
            device_id: self.device_id,
            sequence: self.sequence,
        }
    }
}

/// An envelope as returned by the relay, tagged with the relay's ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulledMessage {
    pub server_sequence: u64,
    #[serde(flatten)]
    pub envelope: EncryptedMessage,
}

/// Request body for pushing local messages to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub ledger_id: String,
    /// Remote head this device has fully merged.
    pub cursor: u64,
    pub messages: Vec<EncryptedMessage>,
}

/// Relay response after a push operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub accepted: u64,
    pub duplicates: u64,
    pub head: u64,
}

/// Body of a 409 reply to a stale push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResponse {
    pub error: String,
    pub head: u64,
}

/// Outcome of a push, as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted { head: u64 },
    /// The remote moved past our cursor; pull and merge before retrying.
    Conflict { head: u64 },
}

/// Request body for pulling remote messages from the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub ledger_id: String,
    pub since: u64,
    pub limit: Option<u64>,
}

/// Relay response containing pulled messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub messages: Vec<PulledMessage>,
    pub head: u64,
    pub has_more: bool,
}

/// Request body for clearing a ledger on the relay after key rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetRequest {
    pub ledger_id: String,
    pub key: crate::crypto::KeyRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetResponse {
    pub head: u64,
}

/// Device registration payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterDeviceRequest {
    pub ledger_id: String,
    pub device_id: Uuid,
    pub device_name: String,
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
}

/// Current sync status summary for the local device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub enabled: bool,
    pub ledger_id: String,
    pub device_id: Uuid,
    pub device_name: String,
    pub relay_url: Option<String>,
    pub cursor: u64,
    pub last_sync_at: Option<i64>,
    pub pending_messages: u64,
    pub needs_remote_reset: bool,
}

/// Custom base64 serialization for `Vec<u8>`.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
