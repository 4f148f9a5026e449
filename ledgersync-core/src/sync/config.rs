//! Sync configuration stored in the local database.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{DatabaseError, Result};

/// Sync configuration for this device and ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub sync_enabled: bool,
    pub ledger_id: String,
    pub device_id: Uuid,
    pub device_name: String,
    pub relay_url: Option<String>,
    /// Highest remote sequence fully merged into the local log.
    pub cursor: u64,
    /// Set after key rotation; the next sync clears the remote first.
    pub needs_remote_reset: bool,
    pub last_sync_at: Option<i64>,
}

impl SyncConfig {
    /// A fresh configuration with a new random device id.
    pub fn new(ledger_id: &str, device_name: &str) -> Self {
        Self {
            sync_enabled: false,
            ledger_id: ledger_id.to_string(),
            device_id: Uuid::new_v4(),
            device_name: device_name.to_string(),
            relay_url: None,
            cursor: 0,
            needs_remote_reset: false,
            last_sync_at: None,
        }
    }

    /// Load sync config from the database. Returns `None` if no row exists.
    pub fn load(conn: &rusqlite::Connection) -> Result<Option<Self>> {
        let result = conn.query_row(
            "SELECT ledger_id, device_id, device_name, relay_url,
                    cursor, needs_remote_reset, last_sync_at, sync_enabled
             FROM sync_metadata WHERE id = 1",
            [],
            |row| {
                let device_id: String = row.get(1)?;
                let cursor: i64 = row.get(4)?;
                Ok((
                    row.get::<_, String>(0)?,
                    device_id,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    cursor,
                    row.get::<_, bool>(5)?,
                    row.get::<_, Option<i64>>(6)?,
                    row.get::<_, bool>(7)?,
                ))
            },
        );

        match result {
            Ok((
                ledger_id,
                device_id,
                device_name,
                relay_url,
                cursor,
                needs_remote_reset,
                last_sync_at,
                sync_enabled,
            )) => {
                let device_id = Uuid::parse_str(&device_id).map_err(|e| {
                    DatabaseError::Serialization(format!("invalid device id: {}", e))
                })?;
                Ok(Some(Self {
                    sync_enabled,
                    ledger_id,
                    device_id,
                    device_name,
                    relay_url,
                    cursor: cursor as u64,
                    needs_remote_reset,
                    last_sync_at,
                }))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DatabaseError::Sqlite(e).into()),
        }
    }

    /// Load the stored config, creating and saving a new one on first use.
    pub fn load_or_init(conn: &rusqlite::Connection, ledger_id: &str, device_name: &str) -> Result<Self> {
        if let Some(config) = Self::load(conn)? {
            return Ok(config);
        }
        let config = Self::new(ledger_id, device_name);
        config.save(conn)?;
        Ok(config)
    }

    /// Save sync config to the database (upsert).
    pub fn save(&self, conn: &rusqlite::Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO sync_metadata (id, ledger_id, device_id, device_name, relay_url,
                                        cursor, needs_remote_reset, last_sync_at, sync_enabled)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                ledger_id = excluded.ledger_id,
                device_id = excluded.device_id,
                device_name = excluded.device_name,
                relay_url = excluded.relay_url,
                cursor = excluded.cursor,
                needs_remote_reset = excluded.needs_remote_reset,
                last_sync_at = excluded.last_sync_at,
                sync_enabled = excluded.sync_enabled",
            rusqlite::params![
                self.ledger_id,
                self.device_id.to_string(),
                self.device_name,
                self.relay_url,
                self.cursor as i64,
                self.needs_remote_reset,
                self.last_sync_at,
                self.sync_enabled,
            ],
        )
        .map_err(DatabaseError::Sqlite)?;

        Ok(())
    }

    /// Persist only the cursor.
    pub fn store_cursor(conn: &rusqlite::Connection, cursor: u64) -> Result<()> {
        conn.execute(
            "UPDATE sync_metadata SET cursor = ?1 WHERE id = 1",
            [cursor as i64],
        )
        .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    /// Record a completed sync cycle.
    pub fn store_last_sync_at(conn: &rusqlite::Connection, at: i64) -> Result<()> {
        conn.execute(
            "UPDATE sync_metadata SET last_sync_at = ?1 WHERE id = 1",
            [at],
        )
        .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    /// Persist only the remote-reset flag.
    pub fn store_needs_remote_reset(conn: &rusqlite::Connection, needed: bool) -> Result<()> {
        conn.execute(
            "UPDATE sync_metadata SET needs_remote_reset = ?1 WHERE id = 1",
            [needed],
        )
        .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }
}
