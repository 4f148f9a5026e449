//! Per-ledger key management.
//!
//! Password → Argon2id → HKDF → { message key (memory only), verifier (stored) }
//!
//! The manager caches at most one key per ledger. Readers (encode/decode)
//! take a shared lock on the ledger's slot; creating or rotating a key takes
//! the exclusive lock, so no message is sealed under a key that is being
//! replaced.

use crate::crypto::kdf::{derive_key_material, verify_token, KdfParams};
use crate::{DatabaseError, LedgerSyncError, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};
use zeroize::ZeroizeOnDrop;

/// A ledger's message key. Zeroized when the last reference is dropped.
#[derive(ZeroizeOnDrop)]
pub struct LedgerKey {
    ledger_id: String,
    version: u32,
    key: [u8; 32],
}

impl LedgerKey {
    pub(crate) fn new(ledger_id: &str, version: u32, key: [u8; 32]) -> Self {
        Self {
            ledger_id: ledger_id.to_string(),
            version,
            key,
        }
    }

    pub fn ledger_id(&self) -> &str {
        &self.ledger_id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Get a reference to the key bytes (use sparingly)
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl fmt::Debug for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerKey")
            .field("ledger_id", &self.ledger_id)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Non-secret record of a ledger key: KDF parameters plus verifier.
///
/// Stored locally in `key_metadata` and published to the remote on reset so
/// other devices can run `key-test`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub ledger_id: String,
    pub key_version: u32,
    pub kdf: KdfParams,
    #[serde(with = "crate::sync::models::base64_bytes")]
    pub verifier: Vec<u8>,
    pub created_at: i64,
}

impl KeyRecord {
    pub fn load(conn: &Connection, ledger_id: &str) -> Result<Option<Self>> {
        conn.query_row(
            "SELECT key_version, kdf_salt, kdf_mem_cost, kdf_time_cost, kdf_parallelism,
                    verifier, created_at
             FROM key_metadata WHERE ledger_id = ?1",
            [ledger_id],
            |row| {
                let salt: Vec<u8> = row.get(1)?;
                Ok((
                    row.get::<_, u32>(0)?,
                    salt,
                    row.get::<_, u32>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, Vec<u8>>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            },
        )
        .optional()
        .map_err(DatabaseError::Sqlite)?
        .map(
            |(key_version, salt, mem_cost, time_cost, parallelism, verifier, created_at)| -> Result<Self> {
                let salt: [u8; 16] = salt.try_into().map_err(|_| {
                    DatabaseError::Serialization("stored KDF salt is not 16 bytes".to_string())
                })?;
                Ok(Self {
                    ledger_id: ledger_id.to_string(),
                    key_version,
                    kdf: KdfParams {
                        salt,
                        mem_cost,
                        time_cost,
                        parallelism,
                    },
                    verifier,
                    created_at,
                })
            },
        )
        .transpose()
    }

    pub fn save(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO key_metadata (ledger_id, key_version, kdf_salt, kdf_mem_cost,
                 kdf_time_cost, kdf_parallelism, verifier, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(ledger_id) DO UPDATE SET
                 key_version = excluded.key_version,
                 kdf_salt = excluded.kdf_salt,
                 kdf_mem_cost = excluded.kdf_mem_cost,
                 kdf_time_cost = excluded.kdf_time_cost,
                 kdf_parallelism = excluded.kdf_parallelism,
                 verifier = excluded.verifier,
                 created_at = excluded.created_at",
            params![
                self.ledger_id,
                self.key_version,
                self.kdf.salt.to_vec(),
                self.kdf.mem_cost,
                self.kdf.time_cost,
                self.kdf.parallelism,
                self.verifier,
                self.created_at,
            ],
        )
        .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }
}

type KeySlot = RwLock<Option<Arc<LedgerKey>>>;

/// Process-wide cache of ledger keys
pub struct KeyManager {
    kdf_template: KdfParams,
    slots: Mutex<HashMap<String, Arc<KeySlot>>>,
}

impl Default for KeyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyManager {
    pub fn new() -> Self {
        Self::with_kdf_params(KdfParams::default())
    }

    /// Use the cost settings of `params` for every key made by this manager.
    /// The salt is always regenerated.
    pub fn with_kdf_params(params: KdfParams) -> Self {
        Self {
            kdf_template: params,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, ledger_id: &str) -> Result<Arc<KeySlot>> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|e| DatabaseError::LockPoisoned(e.to_string()))?;
        Ok(slots
            .entry(ledger_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(None)))
            .clone())
    }

    /// Derive and store a new key for `ledger_id`.
    ///
    /// Fails with `KeyExists` when a key record is already present and
    /// `rotate` is false.
    pub fn make_key(
        &self,
        conn: &Connection,
        ledger_id: &str,
        password: &[u8],
        rotate: bool,
    ) -> Result<Arc<LedgerKey>> {
        self.make_key_with(conn, ledger_id, password, rotate, |_, _, _| Ok(()))
    }

    /// Like [`make_key`](Self::make_key), running `on_install` inside the same
    /// database transaction while the ledger's key slot is exclusively held.
    ///
    /// `on_install` receives the previously cached key (if any) and the new
    /// one. If it fails nothing is stored and the old key stays cached.
    pub fn make_key_with<F>(
        &self,
        conn: &Connection,
        ledger_id: &str,
        password: &[u8],
        rotate: bool,
        on_install: F,
    ) -> Result<Arc<LedgerKey>>
    where
        F: FnOnce(&Connection, Option<&LedgerKey>, &LedgerKey) -> Result<()>,
    {
        if password.is_empty() {
            return Err(LedgerSyncError::InvalidPassword);
        }

        let existing = KeyRecord::load(conn, ledger_id)?;
        if let Some(record) = &existing {
            if !rotate {
                return Err(LedgerSyncError::KeyExists {
                    ledger_id: ledger_id.to_string(),
                    version: record.key_version,
                });
            }
        }

        let version = existing.map(|r| r.key_version + 1).unwrap_or(1);
        let kdf = self.kdf_template.with_fresh_salt();
        let material = derive_key_material(password, &kdf, ledger_id)?;
        let new_key = Arc::new(LedgerKey::new(ledger_id, version, material.message_key));

        let slot = self.slot(ledger_id)?;
        let mut cached = slot
            .write()
            .map_err(|e| DatabaseError::LockPoisoned(e.to_string()))?;

        let tx = conn
            .unchecked_transaction()
            .map_err(DatabaseError::Sqlite)?;
        on_install(&tx, cached.as_deref(), &new_key)?;
        KeyRecord {
            ledger_id: ledger_id.to_string(),
            key_version: version,
            kdf,
            verifier: material.verifier.to_vec(),
            created_at: chrono::Utc::now().timestamp(),
        }
        .save(&tx)?;
        tx.commit().map_err(DatabaseError::Sqlite)?;

        *cached = Some(new_key.clone());
        info!(ledger_id, version, "Ledger key installed");
        Ok(new_key)
    }

    /// Check `password` against the stored key record.
    ///
    /// On success the derived key is cached for the rest of the process.
    pub fn test_key(&self, conn: &Connection, ledger_id: &str, password: &[u8]) -> Result<bool> {
        let record = KeyRecord::load(conn, ledger_id)?
            .ok_or_else(|| LedgerSyncError::NotFound(format!("key for ledger {}", ledger_id)))?;

        let Some(key) = Self::unlock(&record, password)? else {
            warn!(ledger_id, "Key test failed");
            return Ok(false);
        };
        self.install(ledger_id, key, |_| Ok(()))?;
        Ok(true)
    }

    /// Check `password` against a record that is not stored yet, such as one
    /// fetched from the remote.
    ///
    /// The record replaces the local one only if the password verifies; on a
    /// mismatch `key_metadata` is left as it was.
    pub fn adopt_key(&self, conn: &Connection, record: &KeyRecord, password: &[u8]) -> Result<bool> {
        let ledger_id = record.ledger_id.as_str();
        let Some(key) = Self::unlock(record, password)? else {
            warn!(ledger_id, key_version = record.key_version, "Key record not adopted");
            return Ok(false);
        };
        self.install(ledger_id, key, |_| record.save(conn))?;
        info!(ledger_id, key_version = record.key_version, "Adopted ledger key record");
        Ok(true)
    }

    fn unlock(record: &KeyRecord, password: &[u8]) -> Result<Option<LedgerKey>> {
        if password.is_empty() {
            return Ok(None);
        }
        let material = derive_key_material(password, &record.kdf, &record.ledger_id)?;
        if !verify_token(&record.verifier, &material.verifier) {
            return Ok(None);
        }
        Ok(Some(LedgerKey::new(
            &record.ledger_id,
            record.key_version,
            material.message_key,
        )))
    }

    /// Cache `key` after `persist` succeeds, holding the slot exclusively.
    fn install<F>(&self, ledger_id: &str, key: LedgerKey, persist: F) -> Result<()>
    where
        F: FnOnce(&LedgerKey) -> Result<()>,
    {
        let slot = self.slot(ledger_id)?;
        let mut cached = slot
            .write()
            .map_err(|e| DatabaseError::LockPoisoned(e.to_string()))?;
        persist(&key)?;
        *cached = Some(Arc::new(key));
        Ok(())
    }

    /// Run `f` with the cached key, holding the slot's shared lock.
    pub fn with_key<T, F>(&self, ledger_id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&LedgerKey) -> Result<T>,
    {
        let slot = self.slot(ledger_id)?;
        let cached = slot
            .read()
            .map_err(|e| DatabaseError::LockPoisoned(e.to_string()))?;
        let key = cached
            .as_deref()
            .ok_or_else(|| LedgerSyncError::KeyNotLoaded(ledger_id.to_string()))?;
        f(key)
    }

    /// Version of the cached key, if one is loaded
    pub fn loaded_version(&self, ledger_id: &str) -> Result<Option<u32>> {
        let slot = self.slot(ledger_id)?;
        let cached = slot
            .read()
            .map_err(|e| DatabaseError::LockPoisoned(e.to_string()))?;
        Ok(cached.as_ref().map(|k| k.version()))
    }

    /// Drop the cached key for `ledger_id`
    pub fn forget(&self, ledger_id: &str) -> Result<()> {
        let slot = self.slot(ledger_id)?;
        let mut cached = slot
            .write()
            .map_err(|e| DatabaseError::LockPoisoned(e.to_string()))?;
        *cached = None;
        Ok(())
    }
}
