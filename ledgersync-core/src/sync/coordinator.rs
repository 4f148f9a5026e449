//! Sync coordinator: drives push, pull and merge against a [`RemoteStore`].
//!
//! One cycle moves through `Idle -> Pushing -> Pulling -> Merging -> Idle`.
//! Any failure parks the coordinator in `Error` until the next call. The
//! pull cursor is only persisted after the page it covers has been merged,
//! so a transport failure or a rejected batch never skips messages.

use crate::crypto::KeyRecord;
use crate::database::Database;
use crate::sync::config::SyncConfig;
use crate::sync::locks::LedgerLocks;
use crate::sync::log::{MergeResult, SyncLog};
use crate::sync::models::{PulledMessage, PushOutcome};
use crate::sync::remote::{RemoteStore, DEFAULT_PAGE_SIZE};
use crate::sync::repair::{RepairReport, SequenceGap};
use crate::{DatabaseError, LedgerSyncError, Result};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Pushing,
    Pulling,
    Merging,
    Error,
}

/// What one sync cycle did
#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub pushed: usize,
    pub pulled: usize,
    pub merge: MergeResult,
    pub cursor: u64,
    /// Sequence gaps left after the cycle; run repair to resolve them
    pub gaps: Vec<SequenceGap>,
    pub state: SyncState,
}

/// Proof that the caller asked to discard local state.
///
/// There is no default; front ends construct it only after an explicit
/// confirmation from the user.
#[derive(Debug, Clone, Copy)]
pub struct ResetConfirmation {
    _private: (),
}

impl ResetConfirmation {
    pub fn confirmed() -> Self {
        Self { _private: () }
    }
}

pub struct SyncCoordinator {
    log: Arc<SyncLog>,
    db: Arc<Mutex<Database>>,
    remote: Arc<dyn RemoteStore>,
    locks: LedgerLocks,
    state: watch::Sender<SyncState>,
    page_size: u64,
}

impl SyncCoordinator {
    pub fn new(
        log: Arc<SyncLog>,
        db: Arc<Mutex<Database>>,
        remote: Arc<dyn RemoteStore>,
        locks: LedgerLocks,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::Idle);
        Self {
            log,
            db,
            remote,
            locks,
            state,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    fn transition(&self, to: SyncState) {
        let from = self.state.send_replace(to);
        if from != to {
            debug!(ledger_id = %self.log.ledger_id(), ?from, ?to, "Sync state transition");
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let db = self
            .db
            .lock()
            .map_err(|e| DatabaseError::LockPoisoned(e.to_string()))?;
        f(db.conn())
    }

    fn load_config(&self) -> Result<SyncConfig> {
        self.with_conn(SyncConfig::load)?.ok_or_else(|| {
            LedgerSyncError::NotFound(format!(
                "sync configuration for ledger {}",
                self.log.ledger_id()
            ))
        })
    }

    fn finish<T>(&self, operation: &str, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.transition(SyncState::Idle),
            Err(e) => {
                self.transition(SyncState::Error);
                if e.is_recoverable() {
                    warn!(ledger_id = %self.log.ledger_id(), operation, error = %e, "Sync operation failed");
                } else {
                    error!(ledger_id = %self.log.ledger_id(), operation, error = %e, "Sync operation failed");
                }
            }
        }
        result
    }

    /// Push local messages, pull and merge remote ones.
    pub async fn sync(&self) -> Result<SyncOutcome> {
        let _guard = self.locks.acquire(self.log.ledger_id()).await;
        let result = self.run_cycle().await;
        self.finish("sync", result)
    }

    async fn run_cycle(&self) -> Result<SyncOutcome> {
        let ledger_id = self.log.ledger_id().to_string();
        let config = self.load_config()?;
        let mut cursor = config.cursor;

        if config.needs_remote_reset {
            cursor = self.reset_remote(&ledger_id).await?;
        }

        let mut merge = MergeResult::default();
        let mut pulled = 0;
        let mut pushed = 0;
        let mut conflicts = 0;

        loop {
            let pending = self.log.unpushed()?;
            if pending.is_empty() {
                break;
            }
            self.transition(SyncState::Pushing);
            let envelopes: Vec<_> = pending.iter().map(|p| p.envelope.clone()).collect();
            match self.remote.push(&ledger_id, cursor, &envelopes).await? {
                PushOutcome::Accepted { head } => {
                    let positions: Vec<i64> = pending.iter().map(|p| p.position).collect();
                    self.log.mark_pushed(&positions)?;
                    // The relay only accepts at an unchanged head, so
                    // everything up to the new head is ours.
                    cursor = head.max(cursor);
                    self.with_conn(|conn| SyncConfig::store_cursor(conn, cursor))?;
                    pushed = envelopes.len();
                    break;
                }
                PushOutcome::Conflict { head } => {
                    conflicts += 1;
                    if conflicts > 1 {
                        return Err(LedgerSyncError::Conflict {
                            cursor,
                            remote_head: head,
                        });
                    }
                    info!(ledger_id = %ledger_id, cursor, head, "Push rejected as stale, pulling first");
                    pulled += self.pull_all(&ledger_id, &mut cursor, &mut merge).await?;
                }
            }
        }

        pulled += self.pull_all(&ledger_id, &mut cursor, &mut merge).await?;

        let gaps = self.log.scan()?.gaps;
        if !gaps.is_empty() {
            warn!(ledger_id = %ledger_id, gaps = gaps.len(), "Sync log has sequence gaps; run repair");
        }

        self.with_conn(|conn| SyncConfig::store_last_sync_at(conn, chrono::Utc::now().timestamp()))?;
        info!(ledger_id = %ledger_id, pushed, pulled, cursor, "Sync cycle complete");

        Ok(SyncOutcome {
            pushed,
            pulled,
            merge,
            cursor,
            gaps,
            state: SyncState::Idle,
        })
    }

    /// Clear the remote after key rotation and publish the new key record.
    async fn reset_remote(&self, ledger_id: &str) -> Result<u64> {
        let record = self
            .with_conn(|conn| KeyRecord::load(conn, ledger_id))?
            .ok_or_else(|| LedgerSyncError::KeyNotLoaded(ledger_id.to_string()))?;
        info!(ledger_id, key_version = record.key_version, "Resetting remote after key rotation");
        let head = self.remote.reset(ledger_id, &record).await?;
        self.with_conn(|conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(DatabaseError::Sqlite)?;
            SyncConfig::store_cursor(&tx, head)?;
            SyncConfig::store_needs_remote_reset(&tx, false)?;
            tx.commit().map_err(DatabaseError::Sqlite)?;
            Ok(())
        })?;
        Ok(head)
    }

    /// Pull and merge every page after `cursor`, advancing it per page.
    async fn pull_all(
        &self,
        ledger_id: &str,
        cursor: &mut u64,
        merge: &mut MergeResult,
    ) -> Result<usize> {
        let mut pulled = 0;
        loop {
            self.transition(SyncState::Pulling);
            let page = self
                .remote
                .pull(ledger_id, *cursor, Some(self.page_size))
                .await?;

            let mut next = page
                .messages
                .iter()
                .map(|m| m.server_sequence)
                .max()
                .unwrap_or(*cursor)
                .max(*cursor);
            if !page.has_more {
                next = next.max(page.head);
            }

            if !page.messages.is_empty() {
                self.transition(SyncState::Merging);
                merge.absorb(self.log.merge_pulled(&page.messages)?);
                pulled += page.messages.len();
            }
            if next != *cursor {
                *cursor = next;
                self.with_conn(|conn| SyncConfig::store_cursor(conn, next))?;
            }
            if !page.has_more || page.messages.is_empty() {
                return Ok(pulled);
            }
        }
    }

    /// Every message after `since`, across all pages.
    async fn pull_snapshot(&self, ledger_id: &str, since: u64) -> Result<(Vec<PulledMessage>, u64)> {
        let mut messages = Vec::new();
        let mut cursor = since;
        loop {
            let page = self
                .remote
                .pull(ledger_id, cursor, Some(self.page_size))
                .await?;
            let has_more = page.has_more && !page.messages.is_empty();
            if let Some(last) = page.messages.iter().map(|m| m.server_sequence).max() {
                cursor = cursor.max(last);
            }
            messages.extend(page.messages);
            if !has_more {
                return Ok((messages, cursor.max(page.head)));
            }
        }
    }

    /// Discard the local log and ledger and rebuild both from the remote.
    ///
    /// Unpushed local changes are lost.
    pub async fn reset(&self, _confirmation: ResetConfirmation) -> Result<MergeResult> {
        let _guard = self.locks.acquire(self.log.ledger_id()).await;
        let result = self.run_reset().await;
        self.finish("reset", result)
    }

    async fn run_reset(&self) -> Result<MergeResult> {
        let ledger_id = self.log.ledger_id().to_string();
        self.transition(SyncState::Pulling);
        let (snapshot, head) = self.pull_snapshot(&ledger_id, 0).await?;

        self.transition(SyncState::Merging);
        let result = self.log.replace_all(&snapshot)?;
        self.with_conn(|conn| SyncConfig::store_cursor(conn, head))?;
        warn!(
            ledger_id = %ledger_id,
            messages = snapshot.len(),
            cursor = head,
            "Local ledger replaced with remote snapshot"
        );
        Ok(result)
    }

    /// Find gaps and conflicting duplicates, re-fetch what the remote still
    /// has, and rewind the cursor before anything it cannot supply.
    pub async fn repair(&self) -> Result<RepairReport> {
        let _guard = self.locks.acquire(self.log.ledger_id()).await;
        let result = self.run_repair().await;
        self.finish("repair", result)
    }

    async fn run_repair(&self) -> Result<RepairReport> {
        let ledger_id = self.log.ledger_id().to_string();
        let scan = self.log.scan()?;
        let mut report = RepairReport {
            gaps_found: scan.gaps.clone(),
            anomalies: scan.anomalies.clone(),
            needs_reset: !scan.anomalies.is_empty(),
            ..Default::default()
        };
        if scan.gaps.is_empty() {
            info!(ledger_id = %ledger_id, anomalies = report.anomalies.len(), "Sync log has no gaps");
            return Ok(report);
        }

        self.transition(SyncState::Pulling);
        let (snapshot, _) = self.pull_snapshot(&ledger_id, 0).await?;
        let refill: Vec<PulledMessage> = snapshot
            .into_iter()
            .filter(|m| {
                scan.gaps
                    .iter()
                    .any(|gap| gap.contains(&m.envelope.device_id, m.envelope.sequence))
            })
            .collect();

        if !refill.is_empty() {
            self.transition(SyncState::Merging);
            let merged = self.log.merge_pulled(&refill)?;
            report.refetched = merged.received - merged.duplicates;
        }

        report.unresolved = self.log.scan()?.gaps;
        if !report.unresolved.is_empty() {
            let checkpoint = self.log.checkpoint_before(&report.unresolved)?;
            let cursor = self.load_config()?.cursor;
            if checkpoint < cursor {
                self.with_conn(|conn| SyncConfig::store_cursor(conn, checkpoint))?;
                report.rewound_to = Some(checkpoint);
            }
            report.needs_reset = true;
            let unresolved: HashSet<_> = report.unresolved.iter().map(|g| g.device_id).collect();
            error!(
                ledger_id = %ledger_id,
                devices = unresolved.len(),
                "Remote cannot fill sequence gaps; reset required"
            );
        }

        info!(
            ledger_id = %ledger_id,
            gaps = report.gaps_found.len(),
            refetched = report.refetched,
            unresolved = report.unresolved.len(),
            "Repair finished"
        );
        Ok(report)
    }
}
