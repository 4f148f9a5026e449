//! Per-ledger exclusive locks.
//!
//! Sync cycles and reconciliation batches on the same ledger take the same
//! lock, so a reconcile never observes a half-merged pull and two syncs never
//! interleave. Different ledgers proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Registry of one async mutex per ledger id
#[derive(Clone, Default)]
pub struct LedgerLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl LedgerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, ledger_id: &str) -> Arc<AsyncMutex<()>> {
        // A poisoned registry only means another thread panicked while
        // inserting; the map itself is still usable.
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(ledger_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `ledger_id`.
    pub async fn acquire(&self, ledger_id: &str) -> OwnedMutexGuard<()> {
        self.entry(ledger_id).lock_owned().await
    }

    /// Exclusive access to `ledger_id` if nobody holds it.
    pub fn try_acquire(&self, ledger_id: &str) -> Option<OwnedMutexGuard<()>> {
        self.entry(ledger_id).try_lock_owned().ok()
    }
}
