//! Database schema and connection management.

use crate::{DatabaseError, LedgerSyncError, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// Current schema version. Incremented when the schema changes.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Main database connection and schema manager
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open a database at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path).map_err(DatabaseError::Sqlite)?;

        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")
            .map_err(DatabaseError::Sqlite)?;

        Ok(Self { conn })
    }

    /// Create a new in-memory database for testing
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(DatabaseError::Sqlite)?;

        conn.execute("PRAGMA foreign_keys = ON", [])
            .map_err(DatabaseError::Sqlite)?;

        Ok(Self { conn })
    }

    /// Create all tables and indexes. Safe to call on an existing ledger.
    pub fn initialize_schema(&self) -> Result<()> {
        self.create_db_metadata_table()?;
        self.create_key_tables()?;
        self.create_log_tables()?;
        self.create_ledger_tables()?;
        self.create_sync_tables()?;
        self.create_indexes()?;
        self.create_triggers()?;
        Ok(())
    }

    /// Stamp a freshly created database with its ledger id.
    ///
    /// Opening an existing file for a different ledger is refused.
    pub fn bind_ledger(&self, ledger_id: &str) -> Result<()> {
        let existing: Option<String> = self
            .conn
            .query_row("SELECT ledger_id FROM db_metadata WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(DatabaseError::Sqlite)?;

        match existing {
            Some(id) if id == ledger_id => Ok(()),
            Some(id) => Err(LedgerSyncError::InvalidInput(format!(
                "database belongs to ledger {}, not {}",
                id, ledger_id
            ))),
            None => {
                let now = chrono::Utc::now().timestamp();
                self.conn
                    .execute(
                        "INSERT INTO db_metadata (id, version, ledger_id, created_at, last_modified)
                         VALUES (1, ?1, ?2, ?3, ?3)",
                        params![CURRENT_SCHEMA_VERSION, ledger_id, now],
                    )
                    .map_err(DatabaseError::Sqlite)?;
                Ok(())
            }
        }
    }

    fn create_db_metadata_table(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS db_metadata (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL,
                ledger_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_modified INTEGER NOT NULL
            )",
                [],
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_key_tables(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS key_metadata (
                ledger_id TEXT PRIMARY KEY,
                key_version INTEGER NOT NULL,
                kdf_salt BLOB NOT NULL,
                kdf_mem_cost INTEGER NOT NULL,
                kdf_time_cost INTEGER NOT NULL,
                kdf_parallelism INTEGER NOT NULL,
                verifier BLOB NOT NULL,
                created_at INTEGER NOT NULL
            )",
                [],
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_log_tables(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS messages (
                    log_position INTEGER PRIMARY KEY AUTOINCREMENT,
                    device_id TEXT NOT NULL,
                    sequence INTEGER NOT NULL,
                    key_version INTEGER NOT NULL,
                    nonce BLOB NOT NULL,
                    ciphertext BLOB NOT NULL,
                    auth_tag BLOB NOT NULL,
                    checksum TEXT NOT NULL,
                    server_sequence INTEGER,
                    pushed INTEGER NOT NULL DEFAULT 0,
                    received_at INTEGER NOT NULL,
                    UNIQUE (device_id, sequence)
                );

                CREATE TABLE IF NOT EXISTS cells (
                    table_name TEXT NOT NULL,
                    row_id TEXT NOT NULL,
                    column_name TEXT NOT NULL,
                    value TEXT NOT NULL,
                    timestamp INTEGER NOT NULL,
                    device_id TEXT NOT NULL,
                    sequence INTEGER NOT NULL,
                    PRIMARY KEY (table_name, row_id, column_name)
                );

                CREATE TABLE IF NOT EXISTS log_state (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    last_sequence INTEGER NOT NULL DEFAULT 0,
                    last_timestamp INTEGER NOT NULL DEFAULT 0,
                    last_wall_ms INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS sequence_anomalies (
                    device_id TEXT NOT NULL,
                    sequence INTEGER NOT NULL,
                    existing_checksum TEXT NOT NULL,
                    incoming_checksum TEXT NOT NULL,
                    detected_at INTEGER NOT NULL,
                    PRIMARY KEY (device_id, sequence, incoming_checksum)
                );",
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_ledger_tables(&self) -> Result<()> {
        // No unique constraint on imported_id: two devices may import the same
        // bank row concurrently and both rows must survive the merge.
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS transactions (
                    id TEXT PRIMARY KEY,
                    account_id TEXT,
                    amount INTEGER NOT NULL DEFAULT 0,
                    date TEXT,
                    payee_id TEXT,
                    imported_payee TEXT,
                    notes TEXT,
                    cleared INTEGER NOT NULL DEFAULT 0,
                    imported_id TEXT,
                    is_matched INTEGER NOT NULL DEFAULT 0,
                    sort_order INTEGER NOT NULL DEFAULT 0,
                    tombstone INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS payee_rules (
                    id TEXT PRIMARY KEY,
                    account_id TEXT,
                    kind TEXT,
                    pattern TEXT,
                    payee_id TEXT,
                    priority INTEGER NOT NULL DEFAULT 0,
                    active INTEGER NOT NULL DEFAULT 1,
                    tombstone INTEGER NOT NULL DEFAULT 0
                );",
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_sync_tables(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS sync_metadata (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    ledger_id TEXT NOT NULL,
                    device_id TEXT NOT NULL,
                    device_name TEXT NOT NULL,
                    relay_url TEXT,
                    device_signing_key_encrypted BLOB,
                    cursor INTEGER NOT NULL DEFAULT 0,
                    needs_remote_reset INTEGER NOT NULL DEFAULT 0,
                    last_sync_at INTEGER,
                    sync_enabled INTEGER NOT NULL DEFAULT 0
                )",
                [],
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_indexes(&self) -> Result<()> {
        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_messages_pushed ON messages(pushed)",
            "CREATE INDEX IF NOT EXISTS idx_messages_server_sequence ON messages(server_sequence)",
            "CREATE INDEX IF NOT EXISTS idx_transactions_account ON transactions(account_id)",
            "CREATE INDEX IF NOT EXISTS idx_transactions_imported_id ON transactions(account_id, imported_id)",
            "CREATE INDEX IF NOT EXISTS idx_payee_rules_account ON payee_rules(account_id)",
        ];
        for sql in &indexes {
            self.conn.execute(sql, []).map_err(DatabaseError::Sqlite)?;
        }
        Ok(())
    }

    fn create_triggers(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TRIGGER IF NOT EXISTS touch_db_metadata_on_message
                 AFTER INSERT ON messages
                 BEGIN
                     UPDATE db_metadata SET last_modified = (strftime('%s', 'now')) WHERE id = 1;
                 END;",
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    /// Validate the database schema version.
    pub fn validate_schema_version(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .query_row("SELECT version FROM db_metadata WHERE id = 1", [], |row| {
                row.get(0)
            })
            .map_err(DatabaseError::Sqlite)?;

        if version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        Err(LedgerSyncError::from(DatabaseError::SchemaMismatch {
            expected: CURRENT_SCHEMA_VERSION,
            found: version,
        }))
    }

    /// Get a reference to the underlying connection
    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}
