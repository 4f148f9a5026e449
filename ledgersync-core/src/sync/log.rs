//! The append-only sync log.
//!
//! Every change to a ledger is a [`Message`] stored encrypted in the
//! `messages` table. Local changes are appended with the next per-device
//! sequence number and a hybrid-logical timestamp; remote messages are
//! merged with last-writer-wins per cell. Each append or merge runs in one
//! SQLite transaction, so a failure leaves the log and the materialized
//! ledger exactly as they were.

use crate::crypto::LedgerKey;
use crate::database::Database;
use crate::ledger::projection;
use crate::sync::clock::Clock;
use crate::sync::codec;
use crate::sync::conflict::{CellVersion, ConflictResolver, Resolution};
use crate::sync::models::{CellChange, EncryptedMessage, Message, PulledMessage};
use crate::sync::repair::{find_gaps, DuplicateSequence, LogScan, SequenceGap};
use crate::{DatabaseError, KeyManager, LedgerSyncError, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

/// Outcome of merging a batch of remote messages
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeResult {
    pub received: usize,
    /// Messages that became the current value of their cell
    pub applied: Vec<Message>,
    /// New messages that lost to an existing write
    pub superseded: usize,
    /// Messages already in the log
    pub duplicates: usize,
    pub anomalies: Vec<DuplicateSequence>,
}

impl MergeResult {
    /// Fold the result of a later batch into this one.
    pub fn absorb(&mut self, other: MergeResult) {
        self.received += other.received;
        self.applied.extend(other.applied);
        self.superseded += other.superseded;
        self.duplicates += other.duplicates;
        self.anomalies.extend(other.anomalies);
    }
}

/// A local message that has not reached the remote yet
#[derive(Debug, Clone)]
pub struct UnpushedMessage {
    pub position: i64,
    pub envelope: EncryptedMessage,
}

#[derive(Debug, Clone, Copy, Default)]
struct LogState {
    last_sequence: u64,
    last_timestamp: u64,
    last_wall_ms: u64,
}

impl LogState {
    fn load(conn: &Connection) -> Result<Self> {
        let state = conn
            .query_row(
                "SELECT last_sequence, last_timestamp, last_wall_ms FROM log_state WHERE id = 1",
                [],
                |row| {
                    Ok(Self {
                        last_sequence: row.get::<_, i64>(0)? as u64,
                        last_timestamp: row.get::<_, i64>(1)? as u64,
                        last_wall_ms: row.get::<_, i64>(2)? as u64,
                    })
                },
            )
            .optional()
            .map_err(DatabaseError::Sqlite)?;
        Ok(state.unwrap_or_default())
    }

    fn save(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO log_state (id, last_sequence, last_timestamp, last_wall_ms)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                last_sequence = excluded.last_sequence,
                last_timestamp = excluded.last_timestamp,
                last_wall_ms = excluded.last_wall_ms",
            params![
                self.last_sequence as i64,
                self.last_timestamp as i64,
                self.last_wall_ms as i64
            ],
        )
        .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }
}

pub struct SyncLog {
    ledger_id: String,
    device_id: Uuid,
    db: Arc<Mutex<Database>>,
    keys: Arc<KeyManager>,
    clock: Arc<dyn Clock>,
}

impl SyncLog {
    pub fn new(
        ledger_id: &str,
        device_id: Uuid,
        db: Arc<Mutex<Database>>,
        keys: Arc<KeyManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger_id: ledger_id.to_string(),
            device_id,
            db,
            keys,
            clock,
        }
    }

    pub fn ledger_id(&self) -> &str {
        &self.ledger_id
    }

    pub fn device_id(&self) -> Uuid {
        self.device_id
    }

    fn lock_db(&self) -> Result<MutexGuard<'_, Database>> {
        self.db
            .lock()
            .map_err(|e| DatabaseError::LockPoisoned(e.to_string()).into())
    }

    /// Run a query against the ledger database.
    ///
    /// The closure must not append or merge; use the log for writes.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let db = self.lock_db()?;
        f(db.conn())
    }

    /// Append one local change.
    pub fn append(&self, change: CellChange) -> Result<EncryptedMessage> {
        self.append_batch(vec![change])?
            .into_iter()
            .next()
            .ok_or_else(|| LedgerSyncError::OutOfSync("append produced no message".to_string()))
    }

    /// Append local changes atomically.
    ///
    /// Sequences are contiguous and timestamps strictly increase within the
    /// batch. Fails with `ClockRollback` when the wall clock reads earlier
    /// than it did for the previous append.
    pub fn append_batch(&self, changes: Vec<CellChange>) -> Result<Vec<EncryptedMessage>> {
        if changes.is_empty() {
            return Ok(Vec::new());
        }

        let db = self.lock_db()?;
        let conn = db.conn();
        self.keys.with_key(&self.ledger_id, |key| {
            let tx = conn
                .unchecked_transaction()
                .map_err(DatabaseError::Sqlite)?;
            let mut state = LogState::load(&tx)?;

            let now = self.clock.now_ms();
            if now < state.last_wall_ms {
                return Err(LedgerSyncError::ClockRollback {
                    last_ms: state.last_wall_ms,
                    now_ms: now,
                });
            }
            state.last_wall_ms = now;

            let mut envelopes = Vec::with_capacity(changes.len());
            for change in changes {
                state.last_timestamp = now.max(state.last_timestamp + 1);
                state.last_sequence += 1;
                let message = Message::new(
                    &self.ledger_id,
                    state.last_timestamp,
                    self.device_id,
                    state.last_sequence,
                    change,
                );
                let envelope = codec::encode(key, &message)?;
                insert_envelope(&tx, &envelope, &message.checksum, None, false)?;
                apply_message(&tx, &message)?;
                envelopes.push(envelope);
            }

            state.save(&tx)?;
            tx.commit().map_err(DatabaseError::Sqlite)?;
            debug!(
                ledger_id = %self.ledger_id,
                count = envelopes.len(),
                last_sequence = state.last_sequence,
                "Appended local messages"
            );
            Ok(envelopes)
        })
    }

    /// Merge remote messages into the log.
    ///
    /// All messages are decrypted and verified before anything is written;
    /// one bad envelope rejects the whole batch. Re-merging a message that is
    /// already present is a no-op.
    pub fn merge(&self, remote: &[EncryptedMessage]) -> Result<MergeResult> {
        let items: Vec<(&EncryptedMessage, Option<u64>)> =
            remote.iter().map(|envelope| (envelope, None)).collect();
        self.merge_items(&items)
    }

    /// Like [`merge`](Self::merge), remembering each message's position on
    /// the relay.
    pub fn merge_pulled(&self, pulled: &[PulledMessage]) -> Result<MergeResult> {
        let items: Vec<(&EncryptedMessage, Option<u64>)> = pulled
            .iter()
            .map(|p| (&p.envelope, Some(p.server_sequence)))
            .collect();
        self.merge_items(&items)
    }

    fn merge_items(&self, items: &[(&EncryptedMessage, Option<u64>)]) -> Result<MergeResult> {
        if items.is_empty() {
            return Ok(MergeResult::default());
        }
        let db = self.lock_db()?;
        let conn = db.conn();
        self.keys.with_key(&self.ledger_id, |key| {
            let tx = conn
                .unchecked_transaction()
                .map_err(DatabaseError::Sqlite)?;
            let result = self.merge_into(&tx, key, items)?;
            tx.commit().map_err(DatabaseError::Sqlite)?;
            Ok(result)
        })
    }

    fn merge_into(
        &self,
        conn: &Connection,
        key: &LedgerKey,
        items: &[(&EncryptedMessage, Option<u64>)],
    ) -> Result<MergeResult> {
        let mut decoded = items
            .iter()
            .map(|(envelope, server_sequence)| {
                codec::decode(key, envelope).map(|message| (message, *envelope, *server_sequence))
            })
            .collect::<Result<Vec<_>>>()?;

        // Newest first: the first write to reach a cell in this batch is
        // its final winner, so `applied` lists only surviving values.
        decoded.sort_by(|a, b| b.0.order_key().cmp(&a.0.order_key()));

        let mut state = LogState::load(conn)?;
        let mut result = MergeResult {
            received: decoded.len(),
            ..Default::default()
        };

        for (message, envelope, server_sequence) in decoded {
            match stored_checksum(conn, &message.device_id, message.sequence)? {
                Some(existing) if existing == message.checksum => {
                    result.duplicates += 1;
                    if let Some(server_sequence) = server_sequence {
                        conn.execute(
                            "UPDATE messages SET server_sequence = ?3, pushed = 1
                             WHERE device_id = ?1 AND sequence = ?2 AND server_sequence IS NULL",
                            params![
                                message.device_id.to_string(),
                                message.sequence as i64,
                                server_sequence as i64
                            ],
                        )
                        .map_err(DatabaseError::Sqlite)?;
                    }
                }
                Some(existing) => {
                    warn!(
                        device_id = %message.device_id,
                        sequence = message.sequence,
                        "Conflicting message under an existing sequence number"
                    );
                    let anomaly = DuplicateSequence {
                        device_id: message.device_id,
                        sequence: message.sequence,
                        existing_checksum: existing,
                        incoming_checksum: message.checksum.clone(),
                    };
                    record_anomaly(conn, &anomaly)?;
                    result.anomalies.push(anomaly);
                }
                None => {
                    insert_envelope(conn, envelope, &message.checksum, server_sequence, true)?;
                    state.last_timestamp = state.last_timestamp.max(message.timestamp);
                    if message.device_id == self.device_id {
                        state.last_sequence = state.last_sequence.max(message.sequence);
                    }
                    if apply_message(conn, &message)? {
                        result.applied.push(message);
                    } else {
                        result.superseded += 1;
                    }
                }
            }
        }

        state.save(conn)?;
        debug!(
            ledger_id = %self.ledger_id,
            received = result.received,
            applied = result.applied.len(),
            superseded = result.superseded,
            duplicates = result.duplicates,
            "Merged remote messages"
        );
        Ok(result)
    }

    /// Replace the whole log and ledger with a remote snapshot.
    ///
    /// The local sequence counter and clock are kept so this device never
    /// reuses a sequence number it may already have published.
    pub fn replace_all(&self, snapshot: &[PulledMessage]) -> Result<MergeResult> {
        let items: Vec<(&EncryptedMessage, Option<u64>)> = snapshot
            .iter()
            .map(|p| (&p.envelope, Some(p.server_sequence)))
            .collect();

        let db = self.lock_db()?;
        let conn = db.conn();
        self.keys.with_key(&self.ledger_id, |key| {
            let tx = conn
                .unchecked_transaction()
                .map_err(DatabaseError::Sqlite)?;
            tx.execute_batch(
                "DELETE FROM messages; DELETE FROM cells; DELETE FROM sequence_anomalies;",
            )
            .map_err(DatabaseError::Sqlite)?;
            projection::clear(&tx)?;
            let result = self.merge_into(&tx, key, &items)?;
            tx.commit().map_err(DatabaseError::Sqlite)?;
            Ok(result)
        })
    }

    /// Local messages not yet accepted by the remote, in log order.
    pub fn unpushed(&self) -> Result<Vec<UnpushedMessage>> {
        let db = self.lock_db()?;
        let mut stmt = db
            .conn()
            .prepare(
                "SELECT log_position, device_id, sequence, key_version, nonce, ciphertext, auth_tag
                 FROM messages WHERE pushed = 0 ORDER BY log_position",
            )
            .map_err(DatabaseError::Sqlite)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                    row.get::<_, Vec<u8>>(5)?,
                    row.get::<_, Vec<u8>>(6)?,
                ))
            })
            .map_err(DatabaseError::Sqlite)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(DatabaseError::Sqlite)?;

        rows.into_iter()
            .map(
                |(position, device_id, sequence, key_version, nonce, ciphertext, auth_tag)| {
                    Ok(UnpushedMessage {
                        position,
                        envelope: EncryptedMessage {
                            ledger_id: self.ledger_id.clone(),
                            device_id: parse_device_id(&device_id)?,
                            sequence: sequence as u64,
                            key_version,
                            nonce,
                            ciphertext,
                            auth_tag,
                        },
                    })
                },
            )
            .collect()
    }

    pub fn pending_count(&self) -> Result<u64> {
        let db = self.lock_db()?;
        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM messages WHERE pushed = 0", [], |row| {
                row.get(0)
            })
            .map_err(DatabaseError::Sqlite)?;
        Ok(count as u64)
    }

    /// Record that the remote accepted the messages at `positions`.
    pub fn mark_pushed(&self, positions: &[i64]) -> Result<()> {
        let db = self.lock_db()?;
        let tx = db
            .conn()
            .unchecked_transaction()
            .map_err(DatabaseError::Sqlite)?;
        {
            let mut stmt = tx
                .prepare("UPDATE messages SET pushed = 1 WHERE log_position = ?1")
                .map_err(DatabaseError::Sqlite)?;
            for position in positions {
                stmt.execute([position]).map_err(DatabaseError::Sqlite)?;
            }
        }
        tx.commit().map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    /// Find sequence gaps and recorded duplicate-sequence anomalies.
    pub fn scan(&self) -> Result<LogScan> {
        let db = self.lock_db()?;
        let conn = db.conn();

        let mut stmt = conn
            .prepare("SELECT device_id, sequence FROM messages ORDER BY device_id, sequence")
            .map_err(DatabaseError::Sqlite)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(DatabaseError::Sqlite)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(DatabaseError::Sqlite)?;
        let sorted = rows
            .into_iter()
            .map(|(device, sequence)| Ok((parse_device_id(&device)?, sequence as u64)))
            .collect::<Result<Vec<_>>>()?;

        let mut stmt = conn
            .prepare(
                "SELECT device_id, sequence, existing_checksum, incoming_checksum
                 FROM sequence_anomalies ORDER BY device_id, sequence",
            )
            .map_err(DatabaseError::Sqlite)?;
        let raw_anomalies = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(DatabaseError::Sqlite)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(DatabaseError::Sqlite)?;
        let anomalies = raw_anomalies
            .into_iter()
            .map(|(device, sequence, existing_checksum, incoming_checksum)| {
                Ok(DuplicateSequence {
                    device_id: parse_device_id(&device)?,
                    sequence: sequence as u64,
                    existing_checksum,
                    incoming_checksum,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(LogScan {
            gaps: find_gaps(sorted),
            anomalies,
        })
    }

    /// Highest remote cursor from which a re-pull would refill `gaps`.
    ///
    /// For each gap this is just before the first relay-ordered message the
    /// device sent after the gap. Without any relay position, 0.
    pub fn checkpoint_before(&self, gaps: &[SequenceGap]) -> Result<u64> {
        let db = self.lock_db()?;
        let mut checkpoint: Option<u64> = None;
        for gap in gaps {
            let first_after: Option<i64> = db
                .conn()
                .query_row(
                    "SELECT MIN(server_sequence) FROM messages
                     WHERE device_id = ?1 AND sequence > ?2 AND server_sequence IS NOT NULL",
                    params![gap.device_id.to_string(), gap.to as i64],
                    |row| row.get(0),
                )
                .map_err(DatabaseError::Sqlite)?;
            let candidate = first_after.map(|s| (s as u64).saturating_sub(1)).unwrap_or(0);
            checkpoint = Some(checkpoint.map_or(candidate, |c| c.min(candidate)));
        }
        Ok(checkpoint.unwrap_or(0))
    }

    /// Decrypt the whole log in append order.
    pub fn messages(&self) -> Result<Vec<Message>> {
        let db = self.lock_db()?;
        let mut stmt = db
            .conn()
            .prepare(
                "SELECT device_id, sequence, key_version, nonce, ciphertext, auth_tag
                 FROM messages ORDER BY log_position",
            )
            .map_err(DatabaseError::Sqlite)?;
        let envelopes = load_envelopes(&mut stmt, &self.ledger_id)?;
        self.keys.with_key(&self.ledger_id, |key| {
            envelopes
                .iter()
                .map(|(_, envelope)| codec::decode(key, envelope))
                .collect()
        })
    }

    /// Re-encrypt every stored envelope from `old` to `new` and queue all of
    /// them for upload again.
    ///
    /// Runs on the caller's connection so it can share a transaction with
    /// the new key record.
    pub fn rekey(conn: &Connection, old: Option<&LedgerKey>, new: &LedgerKey) -> Result<usize> {
        let mut stmt = conn
            .prepare(
                "SELECT device_id, sequence, key_version, nonce, ciphertext, auth_tag, log_position
                 FROM messages ORDER BY log_position",
            )
            .map_err(DatabaseError::Sqlite)?;
        let envelopes = load_envelopes(&mut stmt, new.ledger_id())?;
        if envelopes.is_empty() {
            return Ok(0);
        }
        let old = old.ok_or_else(|| LedgerSyncError::KeyNotLoaded(new.ledger_id().to_string()))?;

        let mut update = conn
            .prepare(
                "UPDATE messages
                 SET key_version = ?2, nonce = ?3, ciphertext = ?4, auth_tag = ?5,
                     pushed = 0, server_sequence = NULL
                 WHERE log_position = ?1",
            )
            .map_err(DatabaseError::Sqlite)?;
        for (position, envelope) in &envelopes {
            let resealed = codec::reseal(old, new, envelope)?;
            update
                .execute(params![
                    position,
                    resealed.key_version,
                    resealed.nonce,
                    resealed.ciphertext,
                    resealed.auth_tag
                ])
                .map_err(DatabaseError::Sqlite)?;
        }
        Ok(envelopes.len())
    }
}

/// Rows must select device_id, sequence, key_version, nonce, ciphertext,
/// auth_tag and optionally log_position as the seventh column.
fn load_envelopes(
    stmt: &mut rusqlite::Statement<'_>,
    ledger_id: &str,
) -> Result<Vec<(i64, EncryptedMessage)>> {
    let has_position = stmt.column_count() > 6;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                if has_position { row.get::<_, i64>(6)? } else { 0 },
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, Vec<u8>>(3)?,
                row.get::<_, Vec<u8>>(4)?,
                row.get::<_, Vec<u8>>(5)?,
            ))
        })
        .map_err(DatabaseError::Sqlite)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(DatabaseError::Sqlite)?;

    rows.into_iter()
        .map(
            |(position, device_id, sequence, key_version, nonce, ciphertext, auth_tag)| {
                Ok((
                    position,
                    EncryptedMessage {
                        ledger_id: ledger_id.to_string(),
                        device_id: parse_device_id(&device_id)?,
                        sequence: sequence as u64,
                        key_version,
                        nonce,
                        ciphertext,
                        auth_tag,
                    },
                ))
            },
        )
        .collect()
}

fn parse_device_id(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| {
        DatabaseError::Serialization(format!("invalid device id {}: {}", s, e)).into()
    })
}

fn stored_checksum(conn: &Connection, device_id: &Uuid, sequence: u64) -> Result<Option<String>> {
    conn.query_row(
        "SELECT checksum FROM messages WHERE device_id = ?1 AND sequence = ?2",
        params![device_id.to_string(), sequence as i64],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| DatabaseError::Sqlite(e).into())
}

fn insert_envelope(
    conn: &Connection,
    envelope: &EncryptedMessage,
    checksum: &str,
    server_sequence: Option<u64>,
    pushed: bool,
) -> Result<()> {
    conn.execute(
        "INSERT INTO messages (device_id, sequence, key_version, nonce, ciphertext, auth_tag,
                               checksum, server_sequence, pushed, received_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            envelope.device_id.to_string(),
            envelope.sequence as i64,
            envelope.key_version,
            envelope.nonce,
            envelope.ciphertext,
            envelope.auth_tag,
            checksum,
            server_sequence.map(|s| s as i64),
            pushed,
            chrono::Utc::now().timestamp(),
        ],
    )
    .map_err(DatabaseError::Sqlite)?;
    Ok(())
}

fn record_anomaly(conn: &Connection, anomaly: &DuplicateSequence) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO sequence_anomalies
             (device_id, sequence, existing_checksum, incoming_checksum, detected_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            anomaly.device_id.to_string(),
            anomaly.sequence as i64,
            anomaly.existing_checksum,
            anomaly.incoming_checksum,
            chrono::Utc::now().timestamp(),
        ],
    )
    .map_err(DatabaseError::Sqlite)?;
    Ok(())
}

/// Apply `message` to its cell if it wins. Returns whether it did.
fn apply_message(conn: &Connection, message: &Message) -> Result<bool> {
    let current = conn
        .query_row(
            "SELECT timestamp, device_id, sequence FROM cells
             WHERE table_name = ?1 AND row_id = ?2 AND column_name = ?3",
            params![message.table, message.row_id, message.column],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()
        .map_err(DatabaseError::Sqlite)?
        .map(|(timestamp, device_id, sequence)| {
            Ok::<_, LedgerSyncError>(CellVersion {
                timestamp: timestamp as u64,
                device_id: parse_device_id(&device_id)?,
                sequence: sequence as u64,
            })
        })
        .transpose()?;

    let incoming = CellVersion::from(message);
    if ConflictResolver::resolve(current.as_ref(), &incoming) == Resolution::KeepCurrent {
        return Ok(false);
    }

    let value = serde_json::to_string(&message.value)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    conn.execute(
        "INSERT INTO cells (table_name, row_id, column_name, value, timestamp, device_id, sequence)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(table_name, row_id, column_name) DO UPDATE SET
            value = excluded.value,
            timestamp = excluded.timestamp,
            device_id = excluded.device_id,
            sequence = excluded.sequence",
        params![
            message.table,
            message.row_id,
            message.column,
            value,
            message.timestamp as i64,
            message.device_id.to_string(),
            message.sequence as i64,
        ],
    )
    .map_err(DatabaseError::Sqlite)?;

    projection::apply_cell(
        conn,
        &message.table,
        &message.row_id,
        &message.column,
        &message.value,
    )?;
    Ok(true)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crypto::KdfParams;
    use crate::ledger::TRANSACTIONS;
    use crate::sync::clock::ManualClock;
    use crate::sync::models::MessageValue;

    pub(crate) struct Replica {
        pub db: Arc<Mutex<Database>>,
        pub keys: Arc<KeyManager>,
        pub clock: Arc<ManualClock>,
        pub log: SyncLog,
    }

    /// A device with the ledger key for `ledger_id` already loaded.
    ///
    /// Every replica made with the same `key_source` shares the same key.
    pub(crate) fn replica(ledger_id: &str, key_source: Option<&Replica>) -> Replica {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();
        db.bind_ledger(ledger_id).unwrap();

        let keys = match key_source {
            Some(source) => source.keys.clone(),
            None => {
                let keys = Arc::new(KeyManager::with_kdf_params(KdfParams::minimal()));
                keys.make_key(db.conn(), ledger_id, b"test-password", false)
                    .unwrap();
                keys
            }
        };
        let db = Arc::new(Mutex::new(db));
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let log = SyncLog::new(ledger_id, Uuid::new_v4(), db.clone(), keys.clone(), clock.clone());
        Replica {
            db,
            keys,
            clock,
            log,
        }
    }

    fn cell(row: &str, column: &str, value: impl Into<MessageValue>) -> CellChange {
        CellChange::new(TRANSACTIONS, row, column, value)
    }

    fn amount_of(replica: &Replica, row: &str) -> Option<i64> {
        let db = replica.db.lock().unwrap();
        db.conn()
            .query_row("SELECT amount FROM transactions WHERE id = ?1", [row], |r| {
                r.get(0)
            })
            .optional()
            .unwrap()
    }

    #[test]
    fn append_assigns_contiguous_sequences_and_increasing_timestamps() {
        let device = replica("budget", None);
        let envelopes = device
            .log
            .append_batch(vec![
                cell("t1", "amount", 100i64),
                cell("t1", "payee_id", "p1"),
                cell("t2", "amount", 5i64),
            ])
            .unwrap();
        let more = device.log.append(cell("t3", "amount", 7i64)).unwrap();

        let sequences: Vec<u64> = envelopes.iter().chain([&more]).map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4]);

        let messages = device.log.messages().unwrap();
        assert!(messages.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(amount_of(&device, "t1"), Some(100));
        assert_eq!(device.log.pending_count().unwrap(), 4);
    }

    #[test]
    fn clock_rollback_is_refused() {
        let device = replica("budget", None);
        device.log.append(cell("t1", "amount", 1i64)).unwrap();
        device.clock.set(1_600_000_000_000);

        let err = device.log.append(cell("t1", "amount", 2i64)).unwrap_err();
        assert!(matches!(err, LedgerSyncError::ClockRollback { .. }));
        assert_eq!(err.reason(), "clock-rollback");
        assert_eq!(amount_of(&device, "t1"), Some(1));
        assert_eq!(device.log.messages().unwrap().len(), 1);
    }

    #[test]
    fn stalled_clock_still_advances_timestamps() {
        let device = replica("budget", None);
        let a = device.log.append(cell("t1", "amount", 1i64)).unwrap();
        let b = device.log.append(cell("t1", "amount", 2i64)).unwrap();
        assert_eq!((a.sequence, b.sequence), (1, 2));
        let messages = device.log.messages().unwrap();
        assert_eq!(messages[1].timestamp, messages[0].timestamp + 1);
        assert_eq!(amount_of(&device, "t1"), Some(2));
    }

    #[test]
    fn merge_converges_regardless_of_order() {
        let a = replica("budget", None);
        let b = replica("budget", Some(&a));
        let c = replica("budget", Some(&a));
        let d = replica("budget", Some(&a));

        let from_a = a.log.append(cell("t1", "amount", 10i64)).unwrap();
        b.clock.advance(5);
        let from_b = b.log.append(cell("t1", "amount", 20i64)).unwrap();

        c.log.merge(&[from_a.clone(), from_b.clone()]).unwrap();
        d.log.merge(&[from_b.clone()]).unwrap();
        d.log.merge(&[from_a.clone()]).unwrap();
        a.log.merge(&[from_b]).unwrap();
        b.log.merge(&[from_a]).unwrap();

        for replica in [&a, &b, &c, &d] {
            assert_eq!(amount_of(replica, "t1"), Some(20));
        }
    }

    #[test]
    fn merge_is_idempotent() {
        let a = replica("budget", None);
        let b = replica("budget", Some(&a));
        let envelopes = a
            .log
            .append_batch(vec![cell("t1", "amount", 3i64), cell("t1", "date", "2024-01-02")])
            .unwrap();

        let first = b.log.merge(&envelopes).unwrap();
        assert_eq!(first.received, 2);
        assert_eq!(first.applied.len(), 2);

        let second = b.log.merge(&envelopes).unwrap();
        assert_eq!(second.duplicates, 2);
        assert!(second.applied.is_empty());
        assert_eq!(b.log.messages().unwrap().len(), 2);
    }

    #[test]
    fn older_remote_write_is_superseded() {
        let a = replica("budget", None);
        let b = replica("budget", Some(&a));
        let old = a.log.append(cell("t1", "amount", 1i64)).unwrap();
        b.clock.advance(1_000);
        b.log.append(cell("t1", "amount", 2i64)).unwrap();

        let result = b.log.merge(&[old]).unwrap();
        assert_eq!(result.superseded, 1);
        assert_eq!(amount_of(&b, "t1"), Some(2));
    }

    #[test]
    fn merge_bumps_clock_past_remote_timestamps() {
        let a = replica("budget", None);
        let b = replica("budget", Some(&a));
        a.clock.advance(60_000);
        let future = a.log.append(cell("t1", "amount", 1i64)).unwrap();

        b.log.merge(&[future]).unwrap();
        b.log.append(cell("t1", "amount", 2i64)).unwrap();
        assert_eq!(amount_of(&b, "t1"), Some(2));
    }

    #[test]
    fn tampered_batch_is_rejected_whole() {
        let a = replica("budget", None);
        let b = replica("budget", Some(&a));
        let mut envelopes = a
            .log
            .append_batch(vec![cell("t1", "amount", 1i64), cell("t2", "amount", 2i64)])
            .unwrap();
        envelopes[1].ciphertext[3] ^= 0x10;

        let err = b.log.merge(&envelopes).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Integrity);
        assert!(b.log.messages().unwrap().is_empty());
        assert_eq!(amount_of(&b, "t1"), None);
    }

    #[test]
    fn conflicting_sequence_is_recorded_not_applied() {
        let a = replica("budget", None);
        let b = replica("budget", Some(&a));
        let genuine = a.log.append(cell("t1", "amount", 1i64)).unwrap();
        b.log.merge(&[genuine.clone()]).unwrap();

        // Same device and sequence, different content.
        let forged = a.keys.with_key("budget", |key| {
            let message = Message::new("budget", 1, genuine.device_id, 1, cell("t1", "amount", 999i64));
            codec::encode(key, &message)
        })
        .unwrap();

        let result = b.log.merge(&[forged]).unwrap();
        assert_eq!(result.anomalies.len(), 1);
        assert_eq!(amount_of(&b, "t1"), Some(1));

        let scan = b.log.scan().unwrap();
        assert_eq!(scan.anomalies.len(), 1);
        assert_eq!(scan.anomalies[0].sequence, 1);
    }

    #[test]
    fn scan_reports_gaps() {
        let a = replica("budget", None);
        let b = replica("budget", Some(&a));
        let envelopes = a
            .log
            .append_batch(vec![
                cell("t1", "amount", 1i64),
                cell("t2", "amount", 2i64),
                cell("t3", "amount", 3i64),
            ])
            .unwrap();
        let pulled: Vec<PulledMessage> = [&envelopes[0], &envelopes[2]]
            .into_iter()
            .zip([10u64, 12])
            .map(|(e, s)| PulledMessage {
                server_sequence: s,
                envelope: e.clone(),
            })
            .collect();
        b.log.merge_pulled(&pulled).unwrap();

        let scan = b.log.scan().unwrap();
        assert_eq!(
            scan.gaps,
            vec![SequenceGap {
                device_id: a.log.device_id(),
                from: 2,
                to: 2
            }]
        );
        assert_eq!(b.log.checkpoint_before(&scan.gaps).unwrap(), 11);
        assert!(a.log.scan().unwrap().is_clean());
    }

    #[test]
    fn mark_pushed_clears_pending() {
        let device = replica("budget", None);
        device
            .log
            .append_batch(vec![cell("t1", "amount", 1i64), cell("t2", "amount", 2i64)])
            .unwrap();
        let pending = device.log.unpushed().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].envelope.sequence, 1);

        device.log.mark_pushed(&[pending[0].position]).unwrap();
        let pending = device.log.unpushed().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].envelope.sequence, 2);
    }

    #[test]
    fn replace_all_keeps_sequence_counter() {
        let a = replica("budget", None);
        let b = replica("budget", Some(&a));
        b.log.append(cell("local", "amount", 9i64)).unwrap();
        let remote = a.log.append(cell("t1", "amount", 1i64)).unwrap();

        let result = b
            .log
            .replace_all(&[PulledMessage {
                server_sequence: 1,
                envelope: remote,
            }])
            .unwrap();
        assert_eq!(result.applied.len(), 1);
        assert_eq!(amount_of(&b, "local"), None);
        assert_eq!(amount_of(&b, "t1"), Some(1));

        let next = b.log.append(cell("t2", "amount", 2i64)).unwrap();
        assert_eq!(next.sequence, 2);
    }

    #[test]
    fn rekey_reseals_and_requeues_everything() {
        let a = replica("budget", None);
        a.log.append(cell("t1", "amount", 1i64)).unwrap();
        let pending = a.log.unpushed().unwrap();
        a.log
            .mark_pushed(&pending.iter().map(|p| p.position).collect::<Vec<_>>())
            .unwrap();

        {
            let db = a.db.lock().unwrap();
            a.keys
                .make_key_with(db.conn(), "budget", b"new-password", true, |conn, old, new| {
                    assert_eq!(SyncLog::rekey(conn, old, new)?, 1);
                    Ok(())
                })
                .unwrap();
        }

        let pending = a.log.unpushed().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].envelope.key_version, 2);
        let messages = a.log.messages().unwrap();
        assert_eq!(messages[0].value, MessageValue::Integer(1));
    }

    #[test]
    fn rekey_without_old_key_fails() {
        let a = replica("budget", None);
        a.log.append(cell("t1", "amount", 1i64)).unwrap();
        let new = LedgerKey::new("budget", 2, [9; 32]);
        let db = a.db.lock().unwrap();
        assert!(matches!(
            SyncLog::rekey(db.conn(), None, &new),
            Err(LedgerSyncError::KeyNotLoaded(_))
        ));
    }

    #[test]
    fn append_without_key_fails() {
        let device = replica("budget", None);
        device.keys.forget("budget").unwrap();
        assert!(matches!(
            device.log.append(cell("t1", "amount", 1i64)),
            Err(LedgerSyncError::KeyNotLoaded(_))
        ));
    }
}
