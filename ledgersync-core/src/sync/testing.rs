//! In-memory [`RemoteStore`] for coordinator and handler tests.

use crate::crypto::KeyRecord;
use crate::sync::models::{EncryptedMessage, PullResponse, PulledMessage, PushOutcome};
use crate::sync::remote::RemoteStore;
use crate::{LedgerSyncError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct RemoteLedger {
    messages: Vec<PulledMessage>,
    head: u64,
    key: Option<KeyRecord>,
}

/// Behaves like the relay: head-checked pushes, idempotent on
/// `(device_id, sequence)`, paged pulls, monotonic head across resets.
#[derive(Default)]
pub(crate) struct MemoryRemote {
    ledgers: Mutex<HashMap<String, RemoteLedger>>,
    fail_calls: AtomicUsize,
    always_conflict: AtomicBool,
    pub pushes: AtomicUsize,
    pub resets: AtomicUsize,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` calls fail with a transport error.
    pub fn fail_next(&self, n: usize) {
        self.fail_calls.store(n, Ordering::SeqCst);
    }

    /// Every push is rejected as stale.
    pub fn conflict_forever(&self) {
        self.always_conflict.store(true, Ordering::SeqCst);
    }

    fn check_transport(&self) -> Result<()> {
        let remaining = self.fail_calls.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_calls.store(remaining - 1, Ordering::SeqCst);
            return Err(LedgerSyncError::Transport("connection refused".to_string()));
        }
        Ok(())
    }

    pub fn head(&self, ledger_id: &str) -> u64 {
        let ledgers = self.ledgers.lock().unwrap();
        ledgers.get(ledger_id).map(|l| l.head).unwrap_or(0)
    }

    pub fn stored(&self, ledger_id: &str) -> Vec<PulledMessage> {
        let ledgers = self.ledgers.lock().unwrap();
        ledgers
            .get(ledger_id)
            .map(|l| l.messages.clone())
            .unwrap_or_default()
    }

    /// Lose a message, as a misbehaving relay would.
    pub fn drop_message(&self, ledger_id: &str, device_id: Uuid, sequence: u64) {
        let mut ledgers = self.ledgers.lock().unwrap();
        if let Some(ledger) = ledgers.get_mut(ledger_id) {
            ledger
                .messages
                .retain(|m| !(m.envelope.device_id == device_id && m.envelope.sequence == sequence));
        }
    }

    /// Modify a stored envelope in place.
    pub fn corrupt(&self, ledger_id: &str, server_sequence: u64, f: impl FnOnce(&mut EncryptedMessage)) {
        let mut ledgers = self.ledgers.lock().unwrap();
        if let Some(m) = ledgers
            .get_mut(ledger_id)
            .and_then(|l| l.messages.iter_mut().find(|m| m.server_sequence == server_sequence))
        {
            f(&mut m.envelope);
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn push(
        &self,
        ledger_id: &str,
        cursor: u64,
        messages: &[EncryptedMessage],
    ) -> Result<PushOutcome> {
        self.check_transport()?;
        self.pushes.fetch_add(1, Ordering::SeqCst);
        let mut ledgers = self.ledgers.lock().unwrap();
        let ledger = ledgers.entry(ledger_id.to_string()).or_default();
        if ledger.head > cursor || self.always_conflict.load(Ordering::SeqCst) {
            return Ok(PushOutcome::Conflict { head: ledger.head });
        }
        for envelope in messages {
            let known = ledger.messages.iter().any(|m| {
                m.envelope.device_id == envelope.device_id && m.envelope.sequence == envelope.sequence
            });
            if !known {
                ledger.head += 1;
                ledger.messages.push(PulledMessage {
                    server_sequence: ledger.head,
                    envelope: envelope.clone(),
                });
            }
        }
        Ok(PushOutcome::Accepted { head: ledger.head })
    }

    async fn pull(&self, ledger_id: &str, since: u64, limit: Option<u64>) -> Result<PullResponse> {
        self.check_transport()?;
        let ledgers = self.ledgers.lock().unwrap();
        let Some(ledger) = ledgers.get(ledger_id) else {
            return Ok(PullResponse {
                messages: Vec::new(),
                head: 0,
                has_more: false,
            });
        };
        let newer: Vec<&PulledMessage> = ledger
            .messages
            .iter()
            .filter(|m| m.server_sequence > since)
            .collect();
        let limit = limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(PullResponse {
            has_more: newer.len() > limit,
            messages: newer.into_iter().take(limit).cloned().collect(),
            head: ledger.head,
        })
    }

    async fn reset(&self, ledger_id: &str, key: &KeyRecord) -> Result<u64> {
        self.check_transport()?;
        self.resets.fetch_add(1, Ordering::SeqCst);
        let mut ledgers = self.ledgers.lock().unwrap();
        let ledger = ledgers.entry(ledger_id.to_string()).or_default();
        ledger.messages.clear();
        ledger.key = Some(key.clone());
        Ok(ledger.head)
    }

    async fn key_record(&self, ledger_id: &str) -> Result<Option<KeyRecord>> {
        self.check_transport()?;
        let ledgers = self.ledgers.lock().unwrap();
        Ok(ledgers.get(ledger_id).and_then(|l| l.key.clone()))
    }
}
