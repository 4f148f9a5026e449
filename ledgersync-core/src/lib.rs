//! LedgerSync Core Library
//!
//! This library provides the core of the ledger application: password-derived
//! ledger keys, the encrypted message codec, the append-only sync log, the
//! bank reconciliation engine, and the sync coordinator that ties them to a
//! remote store.

pub mod crypto;
pub mod database;
pub mod handlers;
pub mod ledger;
pub mod platform;
pub mod reconcile;
pub mod sync;

pub use crypto::{CryptoError, KdfParams, KeyManager, LedgerKey};
pub use database::Database;
pub use handlers::LedgerService;
pub use ledger::{LedgerTransaction, PayeeRule};
pub use reconcile::{BankTransaction, ReconcileOptions, ReconcileResult};
pub use sync::{
    EncryptedMessage, LedgerLocks, Message, MessageValue, RemoteStore, SyncCoordinator, SyncLog,
};

use thiserror::Error;

/// Result type for ledger sync operations
pub type Result<T> = std::result::Result<T, LedgerSyncError>;

/// Errors raised by the SQLite persistence layer
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: i32, found: i32 },

    #[error("{0}")]
    Other(String),
}

/// General error type for ledger sync operations
#[derive(Error, Debug)]
pub enum LedgerSyncError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Invalid password")]
    InvalidPassword,

    #[error("Ledger {ledger_id} already has key version {version}")]
    KeyExists { ledger_id: String, version: u32 },

    #[error("No key loaded for ledger {0}")]
    KeyNotLoaded(String),

    #[error("Key version mismatch: loaded {expected}, message uses {found}")]
    KeyVersionMismatch { expected: u32, found: u32 },

    #[error("Message {device_id}/{sequence} failed integrity check: {reason}")]
    Tamper {
        device_id: String,
        sequence: u64,
        reason: String,
    },

    #[error("Clock rollback: last reading {last_ms}ms, now {now_ms}ms")]
    ClockRollback { last_ms: u64, now_ms: u64 },

    #[error("Push rejected: remote head {remote_head} is ahead of cursor {cursor}")]
    Conflict { cursor: u64, remote_head: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Sync log out of sync: {0}")]
    OutOfSync(String),

    #[error("Reconciliation error: {0}")]
    Reconciliation(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used by the coordinator and the handler surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad password or key mismatch. Never retried automatically.
    Credential,
    /// Authentication-tag or checksum failure. Sync halts until repair/reset.
    Integrity,
    /// Stale push cursor.
    Conflict,
    /// Timeout or unreachable remote. Cursor is untouched.
    Transport,
    /// Per-item bank transaction problems.
    Reconciliation,
    /// Storage, serialization, and invariant violations.
    Structural,
}

impl LedgerSyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidPassword
            | Self::KeyExists { .. }
            | Self::KeyNotLoaded(_)
            | Self::KeyVersionMismatch { .. } => ErrorKind::Credential,
            Self::Tamper { .. } | Self::Crypto(crypto::CryptoError::AuthenticationFailed) => {
                ErrorKind::Integrity
            }
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Reconciliation(_) => ErrorKind::Reconciliation,
            Self::Crypto(_)
            | Self::Database(_)
            | Self::ClockRollback { .. }
            | Self::OutOfSync(_)
            | Self::InvalidInput(_)
            | Self::NotFound(_)
            | Self::Io(_) => ErrorKind::Structural,
        }
    }

    /// Whether the same call may simply be retried later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport | ErrorKind::Conflict | ErrorKind::Reconciliation
        )
    }

    /// Stable reason code reported to the application layer.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidPassword => "invalid-password",
            Self::KeyExists { .. } => "key-exists",
            Self::KeyNotLoaded(_) => "key-not-loaded",
            Self::KeyVersionMismatch { .. } => "key-mismatch",
            Self::Tamper { .. } | Self::Crypto(crypto::CryptoError::AuthenticationFailed) => {
                "decrypt-failure"
            }
            Self::ClockRollback { .. } => "clock-rollback",
            Self::Conflict { .. } => "conflict",
            Self::Transport(_) => "network",
            Self::OutOfSync(_) => "out-of-sync",
            Self::InvalidInput(_) | Self::Reconciliation(_) => "invalid-input",
            Self::NotFound(_) => "not-found",
            Self::Crypto(_) | Self::Database(_) | Self::Io(_) => "internal",
        }
    }
}
