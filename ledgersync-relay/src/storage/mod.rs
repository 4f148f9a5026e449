//! SQLite storage backend for the relay.
//!
//! Each ledger is an ordered list of opaque envelopes numbered by a
//! per-ledger `head` sequence. The head never decreases, not even across a
//! reset.

pub mod models;

use crate::error::RelayError;
use chrono::Utc;
use ledgersync_core::crypto::KeyRecord;
use ledgersync_core::sync::models::{
    EncryptedMessage, PullResponse, PulledMessage, PushResponse,
};
use models::StoredDevice;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Thread-safe relay storage.
#[derive(Clone)]
pub struct RelayStorage {
    conn: Arc<Mutex<Connection>>,
}

impl RelayStorage {
    pub fn open(path: &Path) -> Result<Self, anyhow::Error> {
        let conn = Connection::open(path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self, anyhow::Error> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    fn initialize_schema(&self) -> Result<(), anyhow::Error> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS ledgers (
                ledger_id TEXT PRIMARY KEY,
                head INTEGER NOT NULL DEFAULT 0,
                key_record TEXT,
                created_at INTEGER NOT NULL,
                reset_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS devices (
                device_id TEXT PRIMARY KEY,
                ledger_id TEXT NOT NULL,
                device_name TEXT NOT NULL,
                public_key BLOB NOT NULL,
                registered_at INTEGER NOT NULL,
                revoked INTEGER NOT NULL DEFAULT 0,
                revoked_at INTEGER,
                FOREIGN KEY (ledger_id) REFERENCES ledgers(ledger_id)
            );

            CREATE TABLE IF NOT EXISTS messages (
                ledger_id TEXT NOT NULL,
                server_sequence INTEGER NOT NULL,
                device_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                key_version INTEGER NOT NULL,
                nonce BLOB NOT NULL,
                ciphertext BLOB NOT NULL,
                auth_tag BLOB NOT NULL,
                received_at INTEGER NOT NULL,
                PRIMARY KEY (ledger_id, server_sequence),
                UNIQUE (ledger_id, device_id, sequence),
                FOREIGN KEY (ledger_id) REFERENCES ledgers(ledger_id)
            );

            CREATE TABLE IF NOT EXISTS seen_nonces (
                nonce TEXT PRIMARY KEY,
                device_id TEXT NOT NULL,
                seen_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_devices_ledger
                ON devices(ledger_id);
            CREATE INDEX IF NOT EXISTS idx_seen_nonces_seen_at
                ON seen_nonces(seen_at);",
        )?;
        Ok(())
    }

    pub fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, RelayError> {
        self.conn
            .lock()
            .map_err(|e| RelayError::Internal(format!("Lock error: {}", e)))
    }

    /// Register a device for a ledger, creating the ledger on first use.
    ///
    /// Registering again with the same key is a no-op; a different key for
    /// a known device id is refused.
    pub fn register_device(
        &self,
        ledger_id: &str,
        device_id: &str,
        device_name: &str,
        public_key: &[u8],
    ) -> Result<(), RelayError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now().timestamp();

        if let Some(existing) = device_row(&tx, device_id)? {
            if existing.ledger_id != ledger_id || existing.public_key != public_key {
                return Err(RelayError::Forbidden(
                    "Device id already registered".to_string(),
                ));
            }
            if existing.revoked {
                return Err(RelayError::Forbidden("Device has been revoked".to_string()));
            }
            tx.execute(
                "UPDATE devices SET device_name = ?1 WHERE device_id = ?2",
                params![device_name, device_id],
            )?;
        } else {
            tx.execute(
                "INSERT OR IGNORE INTO ledgers (ledger_id, created_at) VALUES (?1, ?2)",
                params![ledger_id, now],
            )?;
            tx.execute(
                "INSERT INTO devices (device_id, ledger_id, device_name, public_key, registered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![device_id, ledger_id, device_name, public_key, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn device(&self, device_id: &str) -> Result<Option<StoredDevice>, RelayError> {
        let conn = self.conn()?;
        device_row(&conn, device_id)
    }

    pub fn list_devices(&self, ledger_id: &str) -> Result<Vec<StoredDevice>, RelayError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT device_id, ledger_id, device_name, public_key, registered_at, revoked, revoked_at
             FROM devices WHERE ledger_id = ?1 ORDER BY registered_at, device_id",
        )?;
        let devices = stmt
            .query_map([ledger_id], device_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(devices)
    }

    /// Revoke `device_id` if it belongs to `ledger_id`. Returns whether a
    /// device was revoked.
    pub fn revoke_device(&self, ledger_id: &str, device_id: &str) -> Result<bool, RelayError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE devices SET revoked = 1, revoked_at = ?1
             WHERE device_id = ?2 AND ledger_id = ?3 AND revoked = 0",
            params![Utc::now().timestamp(), device_id, ledger_id],
        )?;
        Ok(changed > 0)
    }

    /// Record a request nonce. Returns `false` if it was already used.
    pub fn remember_nonce(&self, nonce: &str, device_id: &str, now: i64) -> Result<bool, RelayError> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO seen_nonces (nonce, device_id, seen_at) VALUES (?1, ?2, ?3)",
            params![nonce, device_id, now],
        )?;
        Ok(inserted == 1)
    }

    pub fn prune_nonces(&self, before: i64) -> Result<usize, RelayError> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM seen_nonces WHERE seen_at < ?1", [before])?)
    }

    /// Append envelopes if `cursor` is at the ledger head.
    ///
    /// Envelopes already stored under the same `(device_id, sequence)` are
    /// counted as duplicates and skipped.
    pub fn append(
        &self,
        ledger_id: &str,
        cursor: u64,
        messages: &[EncryptedMessage],
        max_messages: usize,
    ) -> Result<PushResponse, RelayError> {
        if let Some(foreign) = messages.iter().find(|m| m.ledger_id != ledger_id) {
            return Err(RelayError::BadRequest(format!(
                "Message {}/{} belongs to ledger {}",
                foreign.device_id, foreign.sequence, foreign.ledger_id
            )));
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut head = ledger_head(&tx, ledger_id)?
            .ok_or_else(|| RelayError::NotFound(format!("Ledger {}", ledger_id)))?;
        if head > cursor {
            return Err(RelayError::Stale { head });
        }

        let stored: i64 = tx.query_row(
            "SELECT COUNT(*) FROM messages WHERE ledger_id = ?1",
            [ledger_id],
            |row| row.get(0),
        )?;
        if stored as usize + messages.len() > max_messages {
            return Err(RelayError::QuotaExceeded);
        }

        let now = Utc::now().timestamp();
        let mut accepted = 0u64;
        let mut duplicates = 0u64;
        {
            let mut insert = tx.prepare(
                "INSERT OR IGNORE INTO messages
                    (ledger_id, server_sequence, device_id, sequence, key_version,
                     nonce, ciphertext, auth_tag, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for message in messages {
                let inserted = insert.execute(params![
                    ledger_id,
                    (head + 1) as i64,
                    message.device_id.to_string(),
                    message.sequence as i64,
                    message.key_version,
                    message.nonce,
                    message.ciphertext,
                    message.auth_tag,
                    now,
                ])?;
                if inserted == 1 {
                    head += 1;
                    accepted += 1;
                } else {
                    duplicates += 1;
                }
            }
        }
        tx.execute(
            "UPDATE ledgers SET head = ?1 WHERE ledger_id = ?2",
            params![head as i64, ledger_id],
        )?;
        tx.commit()?;

        Ok(PushResponse {
            accepted,
            duplicates,
            head,
        })
    }

    /// Envelopes with `server_sequence > since`, oldest first.
    pub fn pull(&self, ledger_id: &str, since: u64, limit: u64) -> Result<PullResponse, RelayError> {
        let conn = self.conn()?;
        let head = ledger_head(&conn, ledger_id)?
            .ok_or_else(|| RelayError::NotFound(format!("Ledger {}", ledger_id)))?;

        let mut stmt = conn.prepare(
            "SELECT server_sequence, device_id, sequence, key_version, nonce, ciphertext, auth_tag
             FROM messages
             WHERE ledger_id = ?1 AND server_sequence > ?2
             ORDER BY server_sequence ASC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![ledger_id, since as i64, (limit + 1) as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                    row.get::<_, Vec<u8>>(5)?,
                    row.get::<_, Vec<u8>>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let has_more = rows.len() as u64 > limit;
        let messages = rows
            .into_iter()
            .take(limit as usize)
            .map(
                |(server_sequence, device_id, sequence, key_version, nonce, ciphertext, auth_tag)|
                 -> Result<PulledMessage, RelayError> {
                    let device_id = device_id.parse().map_err(|_| {
                        RelayError::Internal(format!("Stored device id {} is not a UUID", device_id))
                    })?;
                    Ok(PulledMessage {
                        server_sequence: server_sequence as u64,
                        envelope: EncryptedMessage {
                            ledger_id: ledger_id.to_string(),
                            device_id,
                            sequence: sequence as u64,
                            key_version,
                            nonce,
                            ciphertext,
                            auth_tag,
                        },
                    })
                },
            )
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PullResponse {
            messages,
            head,
            has_more,
        })
    }

    /// Drop every envelope of a ledger and publish its new key record.
    /// Returns the (unchanged) head.
    pub fn reset(&self, ledger_id: &str, key: &KeyRecord) -> Result<u64, RelayError> {
        if key.ledger_id != ledger_id {
            return Err(RelayError::BadRequest(
                "Key record belongs to another ledger".to_string(),
            ));
        }
        let record = serde_json::to_string(key)
            .map_err(|e| RelayError::Internal(format!("Key record encoding: {}", e)))?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let head = ledger_head(&tx, ledger_id)?
            .ok_or_else(|| RelayError::NotFound(format!("Ledger {}", ledger_id)))?;
        let dropped = tx.execute("DELETE FROM messages WHERE ledger_id = ?1", [ledger_id])?;
        tx.execute(
            "UPDATE ledgers SET key_record = ?1, reset_at = ?2 WHERE ledger_id = ?3",
            params![record, Utc::now().timestamp(), ledger_id],
        )?;
        tx.commit()?;

        tracing::info!(ledger_id, head, dropped, key_version = key.key_version, "Ledger reset");
        Ok(head)
    }

    pub fn key_record(&self, ledger_id: &str) -> Result<Option<KeyRecord>, RelayError> {
        let conn = self.conn()?;
        let record: Option<Option<String>> = conn
            .query_row(
                "SELECT key_record FROM ledgers WHERE ledger_id = ?1",
                [ledger_id],
                |row| row.get(0),
            )
            .optional()?;
        record
            .flatten()
            .map(|json| {
                serde_json::from_str(&json)
                    .map_err(|e| RelayError::Internal(format!("Stored key record: {}", e)))
            })
            .transpose()
    }
}

fn ledger_head(conn: &Connection, ledger_id: &str) -> Result<Option<u64>, RelayError> {
    let head: Option<i64> = conn
        .query_row(
            "SELECT head FROM ledgers WHERE ledger_id = ?1",
            [ledger_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(head.map(|h| h as u64))
}

fn device_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredDevice> {
    Ok(StoredDevice {
        device_id: row.get(0)?,
        ledger_id: row.get(1)?,
        device_name: row.get(2)?,
        public_key: row.get(3)?,
        registered_at: row.get(4)?,
        revoked: row.get(5)?,
        revoked_at: row.get(6)?,
    })
}

fn device_row(conn: &Connection, device_id: &str) -> Result<Option<StoredDevice>, RelayError> {
    Ok(conn
        .query_row(
            "SELECT device_id, ledger_id, device_name, public_key, registered_at, revoked, revoked_at
             FROM devices WHERE device_id = ?1",
            [device_id],
            device_from_row,
        )
        .optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgersync_core::crypto::KdfParams;
    use uuid::Uuid;

    fn envelope(ledger: &str, device: Uuid, sequence: u64) -> EncryptedMessage {
        EncryptedMessage {
            ledger_id: ledger.to_string(),
            device_id: device,
            sequence,
            key_version: 1,
            nonce: vec![1; 12],
            ciphertext: vec![sequence as u8; 8],
            auth_tag: vec![2; 16],
        }
    }

    fn key_record(ledger: &str, version: u32) -> KeyRecord {
        KeyRecord {
            ledger_id: ledger.to_string(),
            key_version: version,
            kdf: KdfParams::minimal(),
            verifier: vec![7; 32],
            created_at: 0,
        }
    }

    fn storage_with_ledger() -> (RelayStorage, Uuid) {
        let storage = RelayStorage::in_memory().unwrap();
        let device = Uuid::new_v4();
        storage
            .register_device("budget", &device.to_string(), "laptop", &[9; 32])
            .unwrap();
        (storage, device)
    }

    #[test]
    fn append_advances_head_and_skips_duplicates() {
        let (storage, device) = storage_with_ledger();
        let first = storage
            .append("budget", 0, &[envelope("budget", device, 1), envelope("budget", device, 2)], 100)
            .unwrap();
        assert_eq!((first.accepted, first.duplicates, first.head), (2, 0, 2));

        let retry = storage
            .append("budget", 2, &[envelope("budget", device, 2), envelope("budget", device, 3)], 100)
            .unwrap();
        assert_eq!((retry.accepted, retry.duplicates, retry.head), (1, 1, 3));
    }

    #[test]
    fn stale_cursor_is_rejected_with_head() {
        let (storage, device) = storage_with_ledger();
        storage
            .append("budget", 0, &[envelope("budget", device, 1)], 100)
            .unwrap();
        match storage.append("budget", 0, &[envelope("budget", device, 2)], 100) {
            Err(RelayError::Stale { head }) => assert_eq!(head, 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn foreign_ledger_messages_rejected() {
        let (storage, device) = storage_with_ledger();
        let result = storage.append("budget", 0, &[envelope("other", device, 1)], 100);
        assert!(matches!(result, Err(RelayError::BadRequest(_))));
    }

    #[test]
    fn quota_is_enforced() {
        let (storage, device) = storage_with_ledger();
        let batch: Vec<_> = (1..=3).map(|s| envelope("budget", device, s)).collect();
        assert!(matches!(
            storage.append("budget", 0, &batch, 2),
            Err(RelayError::QuotaExceeded)
        ));
    }

    #[test]
    fn pull_pages_in_order() {
        let (storage, device) = storage_with_ledger();
        let batch: Vec<_> = (1..=5).map(|s| envelope("budget", device, s)).collect();
        storage.append("budget", 0, &batch, 100).unwrap();

        let page = storage.pull("budget", 0, 2).unwrap();
        assert!(page.has_more);
        assert_eq!(page.head, 5);
        let seqs: Vec<u64> = page.messages.iter().map(|m| m.server_sequence).collect();
        assert_eq!(seqs, vec![1, 2]);

        let rest = storage.pull("budget", 2, 10).unwrap();
        assert!(!rest.has_more);
        assert_eq!(rest.messages.len(), 3);
        assert_eq!(rest.messages[0].envelope, batch[2]);
    }

    #[test]
    fn reset_keeps_head_and_publishes_key() {
        let (storage, device) = storage_with_ledger();
        storage
            .append("budget", 0, &[envelope("budget", device, 1), envelope("budget", device, 2)], 100)
            .unwrap();
        assert!(storage.key_record("budget").unwrap().is_none());

        let head = storage.reset("budget", &key_record("budget", 2)).unwrap();
        assert_eq!(head, 2);
        assert!(storage.pull("budget", 0, 10).unwrap().messages.is_empty());
        assert_eq!(storage.key_record("budget").unwrap().unwrap().key_version, 2);

        // Old sequences come back under new server sequences after a reset.
        let again = storage
            .append("budget", 2, &[envelope("budget", device, 1)], 100)
            .unwrap();
        assert_eq!(again.head, 3);

        assert!(matches!(
            storage.reset("budget", &key_record("other", 3)),
            Err(RelayError::BadRequest(_))
        ));
    }

    #[test]
    fn registration_is_idempotent_but_not_transferable() {
        let (storage, device) = storage_with_ledger();
        let id = device.to_string();
        storage.register_device("budget", &id, "renamed", &[9; 32]).unwrap();
        assert_eq!(storage.device(&id).unwrap().unwrap().device_name, "renamed");

        assert!(matches!(
            storage.register_device("budget", &id, "thief", &[1; 32]),
            Err(RelayError::Forbidden(_))
        ));
        assert!(matches!(
            storage.register_device("other", &id, "laptop", &[9; 32]),
            Err(RelayError::Forbidden(_))
        ));
    }

    #[test]
    fn revoked_devices_cannot_reregister() {
        let (storage, device) = storage_with_ledger();
        let id = device.to_string();
        assert!(storage.revoke_device("budget", &id).unwrap());
        assert!(!storage.revoke_device("budget", &id).unwrap());
        assert!(storage.device(&id).unwrap().unwrap().revoked);
        assert!(storage.register_device("budget", &id, "laptop", &[9; 32]).is_err());
        assert_eq!(storage.list_devices("budget").unwrap().len(), 1);
    }

    #[test]
    fn nonces_are_single_use_until_pruned() {
        let storage = RelayStorage::in_memory().unwrap();
        assert!(storage.remember_nonce("n1", "d", 100).unwrap());
        assert!(!storage.remember_nonce("n1", "d", 101).unwrap());
        assert_eq!(storage.prune_nonces(200).unwrap(), 1);
        assert!(storage.remember_nonce("n1", "d", 300).unwrap());
    }

    #[test]
    fn storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");
        let device = Uuid::new_v4();
        {
            let storage = RelayStorage::open(&path).unwrap();
            storage
                .register_device("budget", &device.to_string(), "laptop", &[9; 32])
                .unwrap();
            storage
                .append("budget", 0, &[envelope("budget", device, 1)], 100)
                .unwrap();
        }
        let storage = RelayStorage::open(&path).unwrap();
        assert_eq!(storage.pull("budget", 0, 10).unwrap().head, 1);
    }
}
