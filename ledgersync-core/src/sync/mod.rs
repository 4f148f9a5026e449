//! Encrypted multi-device sync for ledgers
//!
//! - Every field mutation is a [`Message`] sealed with AES-256-GCM under the
//!   ledger key and appended to a local log
//! - Remote messages merge cell by cell, last writer wins on
//!   `(timestamp, device_id, sequence)`
//! - A [`RemoteStore`] orders envelopes; the relay never sees plaintext
//! - Ed25519 device identities sign every relay request

pub mod auth;
#[cfg(feature = "sync")]
pub mod client;
pub mod clock;
pub mod codec;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod device;
pub mod locks;
pub mod log;
pub mod models;
pub mod remote;
pub mod repair;
#[cfg(test)]
pub(crate) mod testing;

#[cfg(feature = "sync")]
pub use client::RelayClient;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use conflict::{CellVersion, ConflictResolver, Resolution};
pub use coordinator::{ResetConfirmation, SyncCoordinator, SyncOutcome, SyncState};
pub use device::DeviceIdentity;
pub use locks::LedgerLocks;
pub use log::{MergeResult, SyncLog};
pub use models::{
    CellChange, EncryptedMessage, Message, MessageValue, PullResponse, PulledMessage,
    PushOutcome, SyncStatus,
};
pub use remote::RemoteStore;
pub use repair::{LogScan, RepairReport, SequenceGap};
