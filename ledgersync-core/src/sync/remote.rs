//! The remote side of sync: anything that stores envelopes in a total order.

use crate::crypto::KeyRecord;
use crate::sync::models::{EncryptedMessage, PullResponse, PushOutcome};
use crate::Result;
use async_trait::async_trait;

/// Largest page requested from a remote in one pull
pub const DEFAULT_PAGE_SIZE: u64 = 500;

/// A store that orders envelopes by an increasing remote sequence.
///
/// Implementations must be idempotent on `(device_id, sequence)`: pushing an
/// envelope the remote already holds is accepted and not stored twice.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Append `messages` if the remote head still equals `cursor`.
    async fn push(
        &self,
        ledger_id: &str,
        cursor: u64,
        messages: &[EncryptedMessage],
    ) -> Result<PushOutcome>;

    /// Envelopes with a remote sequence above `since`, oldest first.
    async fn pull(&self, ledger_id: &str, since: u64, limit: Option<u64>) -> Result<PullResponse>;

    /// Drop every stored envelope and publish `key` as the ledger's key
    /// record. Returns the remote head afterwards.
    async fn reset(&self, ledger_id: &str, key: &KeyRecord) -> Result<u64>;

    /// The key record published by the last reset, if any.
    async fn key_record(&self, ledger_id: &str) -> Result<Option<KeyRecord>>;
}
