//! Application-facing operations on one ledger.
//!
//! Each handler returns a serializable response instead of a `Result`:
//! failures are reported as `{ error: { reason, message, meta } }` with the
//! stable reason codes from [`LedgerSyncError::reason`].

use crate::crypto::{KeyManager, KeyRecord};
use crate::database::Database;
use crate::ledger::PayeeRule;
use crate::reconcile::{
    reconcile_account, BankConnector, BankTransaction, ConnectorError, ItemError,
    ReconcileOptions, ReconcileResult, UpdatePreview,
};
use crate::sync::clock::Clock;
use crate::sync::config::SyncConfig;
use crate::sync::coordinator::{ResetConfirmation, SyncCoordinator};
use crate::sync::device::DeviceIdentity;
use crate::sync::locks::LedgerLocks;
use crate::sync::log::SyncLog;
use crate::sync::models::{Message, SyncStatus};
use crate::sync::remote::RemoteStore;
use crate::sync::repair::RepairReport;
use crate::{DatabaseError, LedgerSyncError, Result};
use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Error payload shared by every handler response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandlerError {
    pub reason: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl From<&LedgerSyncError> for HandlerError {
    fn from(err: &LedgerSyncError) -> Self {
        let meta = match err {
            LedgerSyncError::Conflict {
                cursor,
                remote_head,
            } => Some(json!({ "cursor": cursor, "remoteHead": remote_head })),
            LedgerSyncError::KeyVersionMismatch { expected, found } => {
                Some(json!({ "expected": expected, "found": found }))
            }
            LedgerSyncError::Tamper {
                device_id,
                sequence,
                ..
            } => Some(json!({ "deviceId": device_id, "sequence": sequence })),
            _ => None,
        };
        Self {
            reason: err.reason().to_string(),
            message: err.to_string(),
            meta,
        }
    }
}

impl From<LedgerSyncError> for HandlerError {
    fn from(err: LedgerSyncError) -> Self {
        Self::from(&err)
    }
}

/// `{}` on success, `{ error }` otherwise
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<HandlerError>,
}

impl StatusResponse {
    fn from_result(result: Result<()>) -> Self {
        Self {
            error: result.err().map(HandlerError::from),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

pub type KeyResponse = StatusResponse;
pub type SyncResetResponse = StatusResponse;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SyncResponse {
    Messages { messages: Vec<Message> },
    Error { error: HandlerError },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<RepairReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<HandlerError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResponse {
    pub errors: Vec<ItemError>,
    pub added: Vec<String>,
    pub updated: Vec<String>,
    /// Subset of `updated` claimed by a bank row
    pub matched: Vec<String>,
    pub updated_preview: Vec<UpdatePreview>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<HandlerError>,
}

/// A per-account failure during bank sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BankSyncError {
    pub account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub error_code: String,
    pub reason: String,
}

impl BankSyncError {
    fn connector(account_id: &str, err: ConnectorError) -> Self {
        Self {
            account_id: account_id.to_string(),
            external_id: None,
            error_code: err.error_code,
            reason: err.reason,
        }
    }

    fn item(err: ItemError) -> Self {
        Self {
            account_id: err.account_id,
            external_id: err.external_id,
            error_code: "INVALID_TRANSACTION".to_string(),
            reason: err.message,
        }
    }

    fn ledger(account_id: &str, err: &LedgerSyncError) -> Self {
        Self {
            account_id: account_id.to_string(),
            external_id: None,
            error_code: err.reason().to_string(),
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BankSyncResponse {
    pub errors: Vec<BankSyncError>,
    pub new_transactions: Vec<String>,
    pub matched_transactions: Vec<String>,
    pub updated_accounts: Vec<String>,
}

impl BankSyncResponse {
    fn absorb(&mut self, account_id: &str, result: ReconcileResult) {
        if !result.added.is_empty() || !result.updated.is_empty() {
            self.updated_accounts.push(account_id.to_string());
        }
        self.new_transactions.extend(result.added);
        self.matched_transactions.extend(result.matched);
        self.errors
            .extend(result.errors.into_iter().map(BankSyncError::item));
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSyncEntry {
    pub account_id: String,
    pub res: BankSyncResponse,
}

/// One open ledger with its key manager, log and optional remote/bank seams.
pub struct LedgerService {
    ledger_id: String,
    db: Arc<Mutex<Database>>,
    keys: Arc<KeyManager>,
    log: Arc<SyncLog>,
    locks: LedgerLocks,
    remote: Option<Arc<dyn RemoteStore>>,
    coordinator: Option<SyncCoordinator>,
    connector: Option<Arc<dyn BankConnector>>,
}

impl LedgerService {
    /// Prepare `db` for `ledger_id` and load (or create) this device's sync
    /// configuration.
    pub fn open(
        ledger_id: &str,
        db: Database,
        device_name: &str,
        keys: Arc<KeyManager>,
        clock: Arc<dyn Clock>,
        locks: LedgerLocks,
    ) -> Result<Self> {
        db.initialize_schema()?;
        db.bind_ledger(ledger_id)?;
        db.validate_schema_version()?;
        let config = SyncConfig::load_or_init(db.conn(), ledger_id, device_name)?;

        let db = Arc::new(Mutex::new(db));
        let log = Arc::new(SyncLog::new(
            ledger_id,
            config.device_id,
            db.clone(),
            keys.clone(),
            clock,
        ));
        info!(ledger_id, device_id = %config.device_id, "Ledger opened");
        Ok(Self {
            ledger_id: ledger_id.to_string(),
            db,
            keys,
            log,
            locks,
            remote: None,
            coordinator: None,
            connector: None,
        })
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.coordinator = Some(SyncCoordinator::new(
            self.log.clone(),
            self.db.clone(),
            remote.clone(),
            self.locks.clone(),
        ));
        self.remote = Some(remote);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn BankConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn ledger_id(&self) -> &str {
        &self.ledger_id
    }

    pub fn log(&self) -> &Arc<SyncLog> {
        &self.log
    }

    fn lock_db(&self) -> Result<std::sync::MutexGuard<'_, Database>> {
        self.db
            .lock()
            .map_err(|e| DatabaseError::LockPoisoned(e.to_string()).into())
    }

    fn coordinator(&self) -> Result<&SyncCoordinator> {
        self.coordinator
            .as_ref()
            .ok_or_else(|| LedgerSyncError::NotFound("no remote store configured".to_string()))
    }

    fn connector(&self) -> Result<&Arc<dyn BankConnector>> {
        self.connector
            .as_ref()
            .ok_or_else(|| LedgerSyncError::NotFound("no bank connector configured".to_string()))
    }

    /// Store relay settings for this device.
    pub fn configure_sync(&self, relay_url: Option<&str>, enabled: bool) -> Result<SyncConfig> {
        let db = self.lock_db()?;
        let mut config = SyncConfig::load(db.conn())?
            .ok_or_else(|| LedgerSyncError::NotFound("sync configuration".to_string()))?;
        config.relay_url = relay_url.map(str::to_string);
        config.sync_enabled = enabled;
        config.save(db.conn())?;
        Ok(config)
    }

    pub fn status(&self) -> Result<SyncStatus> {
        let pending = self.log.pending_count()?;
        let db = self.lock_db()?;
        let config = SyncConfig::load(db.conn())?
            .ok_or_else(|| LedgerSyncError::NotFound("sync configuration".to_string()))?;
        Ok(SyncStatus {
            enabled: config.sync_enabled,
            ledger_id: config.ledger_id,
            device_id: config.device_id,
            device_name: config.device_name,
            relay_url: config.relay_url,
            cursor: config.cursor,
            last_sync_at: config.last_sync_at,
            pending_messages: pending,
            needs_remote_reset: config.needs_remote_reset,
        })
    }

    /// This device's signing identity, created on first use. Needs the key.
    pub fn device_identity(&self) -> Result<DeviceIdentity> {
        let db = self.lock_db()?;
        let config = SyncConfig::load(db.conn())?
            .ok_or_else(|| LedgerSyncError::NotFound("sync configuration".to_string()))?;
        self.keys.with_key(&self.ledger_id, |key| {
            DeviceIdentity::load_or_create(db.conn(), key, config.device_id, &config.device_name)
        })
    }

    /// `sync`: push, pull and merge. Returns the messages that changed local
    /// state.
    pub async fn sync(&self) -> SyncResponse {
        let result = async { self.coordinator()?.sync().await }.await;
        match result {
            Ok(outcome) => SyncResponse::Messages {
                messages: outcome.merge.applied,
            },
            Err(err) => SyncResponse::Error {
                error: HandlerError::from(err),
            },
        }
    }

    /// `sync-reset`: replace local state with the remote snapshot.
    pub async fn sync_reset(&self, confirmation: ResetConfirmation) -> SyncResetResponse {
        let result = async {
            self.coordinator()?.reset(confirmation).await?;
            Ok::<(), LedgerSyncError>(())
        }
        .await;
        StatusResponse::from_result(result)
    }

    /// `sync-repair`: fill or report sequence gaps.
    pub async fn sync_repair(&self) -> RepairResponse {
        match async { self.coordinator()?.repair().await }.await {
            Ok(report) => {
                let error = report.needs_reset.then(|| {
                    HandlerError::from(LedgerSyncError::OutOfSync(
                        "sync log cannot be repaired from the remote; reset required".to_string(),
                    ))
                });
                RepairResponse {
                    report: Some(report),
                    error,
                }
            }
            Err(err) => RepairResponse {
                report: None,
                error: Some(err.into()),
            },
        }
    }

    /// `key-make`: create the ledger key, or rotate it when `rotate` is set.
    ///
    /// The whole log is re-encrypted under the new key in the same
    /// transaction, and the next sync replaces the remote copy.
    pub async fn key_make(&self, password: &str, rotate: bool) -> KeyResponse {
        let _guard = self.locks.acquire(&self.ledger_id).await;
        let result = (|| -> Result<()> {
            let db = self.lock_db()?;
            self.keys.make_key_with(
                db.conn(),
                &self.ledger_id,
                password.as_bytes(),
                rotate,
                |conn, old, new| {
                    let resealed = SyncLog::rekey(conn, old, new)?;
                    DeviceIdentity::reseal(conn, old, new)?;
                    SyncConfig::store_needs_remote_reset(conn, true)?;
                    if resealed > 0 {
                        info!(ledger_id = %self.ledger_id, resealed, "Log re-encrypted under new key");
                    }
                    Ok(())
                },
            )?;
            Ok(())
        })();
        StatusResponse::from_result(result)
    }

    /// `key-test`: check `password` and load the key on success.
    ///
    /// When the remote publishes a record newer than the local one (or there
    /// is no local one), the password is checked against the remote record
    /// and the record is stored only if it verifies. A password that only
    /// opens the local record still loads the local key.
    pub async fn key_test(&self, ledger_id: &str, password: &str) -> KeyResponse {
        let result = async {
            if ledger_id != self.ledger_id {
                return Err(LedgerSyncError::InvalidInput(format!(
                    "this service holds ledger {}, not {}",
                    self.ledger_id, ledger_id
                )));
            }
            let (local, newer) = self.newer_remote_key_record().await?;

            let db = self.lock_db()?;
            if let Some(record) = newer {
                if self.keys.adopt_key(db.conn(), &record, password.as_bytes())? {
                    if local.is_some() {
                        warn!(
                            ledger_id = %self.ledger_id,
                            key_version = record.key_version,
                            "Ledger key was rotated on another device; run sync-reset"
                        );
                    }
                    return Ok(());
                }
                if local.is_none() {
                    return Err(LedgerSyncError::InvalidPassword);
                }
            }

            if self
                .keys
                .test_key(db.conn(), &self.ledger_id, password.as_bytes())?
            {
                Ok::<(), LedgerSyncError>(())
            } else {
                Err(LedgerSyncError::InvalidPassword)
            }
        }
        .await;
        StatusResponse::from_result(result)
    }

    /// The local key record, plus the remote one when it is newer.
    async fn newer_remote_key_record(&self) -> Result<(Option<KeyRecord>, Option<KeyRecord>)> {
        let local = {
            let db = self.lock_db()?;
            KeyRecord::load(db.conn(), &self.ledger_id)?
        };
        let Some(remote) = &self.remote else {
            return Ok((local, None));
        };
        let remote_record = match remote.key_record(&self.ledger_id).await {
            Ok(record) => record,
            // Without the remote the local record is still usable.
            Err(err) if local.is_some() && err.is_recoverable() => {
                warn!(ledger_id = %self.ledger_id, error = %err, "Could not fetch remote key record");
                None
            }
            Err(err) => return Err(err),
        };
        let Some(record) = remote_record else {
            return Ok((local, None));
        };
        if record.ledger_id != self.ledger_id {
            return Err(LedgerSyncError::InvalidInput(
                "remote key record belongs to another ledger".to_string(),
            ));
        }
        if local
            .as_ref()
            .is_some_and(|l| l.key_version >= record.key_version)
        {
            return Ok((local, None));
        }
        Ok((local, Some(record)))
    }

    /// `transactions-import`: reconcile a statement into one account.
    pub async fn transactions_import(
        &self,
        account_id: &str,
        transactions: &[BankTransaction],
        is_preview: bool,
        options: &ReconcileOptions,
    ) -> ImportResponse {
        let _guard = self.locks.acquire(&self.ledger_id).await;
        match reconcile_account(&self.log, account_id, transactions, options, is_preview) {
            Ok(result) => ImportResponse {
                errors: result.errors,
                added: result.added,
                updated: result.updated,
                matched: result.matched,
                updated_preview: result.updated_preview,
                error: None,
            },
            Err(err) => ImportResponse {
                error: Some(err.into()),
                ..Default::default()
            },
        }
    }

    async fn reconcile_fetched(
        &self,
        account_id: &str,
        fetched: std::result::Result<Vec<BankTransaction>, ConnectorError>,
        response: &mut BankSyncResponse,
    ) {
        let transactions = match fetched {
            Ok(transactions) => transactions,
            Err(err) => {
                warn!(account_id, error = %err, "Bank fetch failed");
                response.errors.push(BankSyncError::connector(account_id, err));
                return;
            }
        };
        let _guard = self.locks.acquire(&self.ledger_id).await;
        match reconcile_account(
            &self.log,
            account_id,
            &transactions,
            &ReconcileOptions::default(),
            false,
        ) {
            Ok(result) => response.absorb(account_id, result),
            Err(err) => response.errors.push(BankSyncError::ledger(account_id, &err)),
        }
    }

    /// `accounts-bank-sync`: fetch and reconcile `account_ids`, or every
    /// linked account when `None`.
    pub async fn accounts_bank_sync(&self, account_ids: Option<Vec<String>>) -> BankSyncResponse {
        let mut response = BankSyncResponse::default();
        let connector = match self.connector() {
            Ok(connector) => connector.clone(),
            Err(err) => {
                response.errors.push(BankSyncError::ledger("", &err));
                return response;
            }
        };
        let account_ids = match account_ids {
            Some(ids) => ids,
            None => match connector.linked_accounts().await {
                Ok(ids) => ids,
                Err(err) => {
                    response.errors.push(BankSyncError::connector("", err));
                    return response;
                }
            },
        };

        for account_id in &account_ids {
            let fetched = connector.fetch_transactions(account_id).await;
            self.reconcile_fetched(account_id, fetched, &mut response)
                .await;
        }
        response
    }

    /// `simplefin-batch-sync`: one batched fetch, one result per account.
    pub async fn simplefin_batch_sync(&self, ids: &[String]) -> Vec<BatchSyncEntry> {
        let connector = match self.connector() {
            Ok(connector) => connector.clone(),
            Err(err) => {
                return ids
                    .iter()
                    .map(|id| BatchSyncEntry {
                        account_id: id.clone(),
                        res: BankSyncResponse {
                            errors: vec![BankSyncError::ledger(id, &err)],
                            ..Default::default()
                        },
                    })
                    .collect();
            }
        };

        let mut entries = Vec::with_capacity(ids.len());
        for (account_id, fetched) in connector.fetch_batch(ids).await {
            let mut res = BankSyncResponse::default();
            self.reconcile_fetched(&account_id, fetched, &mut res).await;
            entries.push(BatchSyncEntry { account_id, res });
        }
        entries
    }

    /// Add or replace a payee rule through the log.
    pub async fn save_payee_rule(&self, rule: &PayeeRule) -> Result<()> {
        let _guard = self.locks.acquire(&self.ledger_id).await;
        self.log.append_batch(rule.changes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KdfParams;
    use crate::ledger::{LedgerTransaction, RuleKind};
    use crate::reconcile::connector::tests::StaticConnector;
    use crate::sync::clock::SystemClock;
    use crate::sync::testing::MemoryRemote;

    fn service(remote: Option<Arc<MemoryRemote>>) -> LedgerService {
        let keys = Arc::new(KeyManager::with_kdf_params(KdfParams::minimal()));
        let service = LedgerService::open(
            "budget",
            Database::in_memory().unwrap(),
            "test",
            keys,
            Arc::new(SystemClock),
            LedgerLocks::new(),
        )
        .unwrap();
        match remote {
            Some(remote) => service.with_remote(remote),
            None => service,
        }
    }

    fn bank(key: &str, account: &str, amount: i64, date: &str) -> BankTransaction {
        BankTransaction {
            external_id: Some(key.to_string()),
            account_id: account.to_string(),
            amount,
            date: date.to_string(),
            payee_raw: "Corner Shop".to_string(),
            imported_id: None,
            notes: None,
        }
    }

    fn reason(response: &StatusResponse) -> Option<&str> {
        response.error.as_ref().map(|e| e.reason.as_str())
    }

    #[tokio::test]
    async fn key_make_and_test() {
        let service = service(None);
        assert!(service.key_make("hunter2", false).await.is_ok());
        assert_eq!(reason(&service.key_make("again", false).await), Some("key-exists"));
        assert_eq!(reason(&service.key_make("", true).await), Some("invalid-password"));

        assert!(service.key_test("budget", "hunter2").await.is_ok());
        assert_eq!(reason(&service.key_test("budget", "wrong").await), Some("invalid-password"));
        assert_eq!(reason(&service.key_test("other", "hunter2").await), Some("invalid-input"));
    }

    #[tokio::test]
    async fn key_test_without_any_record() {
        let service = service(None);
        assert_eq!(reason(&service.key_test("budget", "pw").await), Some("not-found"));
    }

    #[tokio::test]
    async fn wrong_password_keeps_local_key_record() {
        let remote = Arc::new(MemoryRemote::new());
        let other = service(None);
        other.key_make("theirs", false).await;
        other.key_make("theirs-rotated", true).await;
        let published = {
            let db = other.lock_db().unwrap();
            KeyRecord::load(db.conn(), "budget").unwrap().unwrap()
        };
        remote.reset("budget", &published).await.unwrap();

        let local = service(Some(remote));
        assert!(local.key_make("mine", false).await.is_ok());
        let before = {
            let db = local.lock_db().unwrap();
            KeyRecord::load(db.conn(), "budget").unwrap()
        };
        assert_eq!(before.as_ref().map(|r| r.key_version), Some(1));

        assert_eq!(reason(&local.key_test("budget", "wrong-guess").await), Some("invalid-password"));
        let after = {
            let db = local.lock_db().unwrap();
            KeyRecord::load(db.conn(), "budget").unwrap()
        };
        assert_eq!(before, after);
        assert!(local.key_test("budget", "mine").await.is_ok());

        assert!(local.key_test("budget", "theirs-rotated").await.is_ok());
        let adopted = {
            let db = local.lock_db().unwrap();
            KeyRecord::load(db.conn(), "budget").unwrap()
        };
        assert_eq!(adopted, Some(published));
    }

    #[tokio::test]
    async fn sync_without_key_reports_reason() {
        let remote = Arc::new(MemoryRemote::new());
        let a = service(Some(remote.clone()));
        assert!(a.key_make("pw", false).await.is_ok());
        a.transactions_import(
            "checking",
            &[bank("x1", "checking", -1, "2024-01-01")],
            false,
            &ReconcileOptions::default(),
        )
        .await;
        assert!(matches!(a.sync().await, SyncResponse::Messages { .. }));

        let b = service(Some(remote));
        match b.sync().await {
            SyncResponse::Error { error } => assert_eq!(error.reason, "key-not-loaded"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn sync_without_remote_is_not_found() {
        let service = service(None);
        match service.sync().await {
            SyncResponse::Error { error } => assert_eq!(error.reason, "not-found"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn second_device_joins_with_published_key() {
        let remote = Arc::new(MemoryRemote::new());
        let a = service(Some(remote.clone()));
        assert!(a.key_make("shared secret", false).await.is_ok());
        let import = a
            .transactions_import(
                "checking",
                &[bank("x1", "checking", -1250, "2024-03-01")],
                false,
                &ReconcileOptions::default(),
            )
            .await;
        assert_eq!(import.added.len(), 1);
        assert!(matches!(a.sync().await, SyncResponse::Messages { .. }));
        assert_eq!(remote.resets.load(std::sync::atomic::Ordering::SeqCst), 1);

        let b = service(Some(remote.clone()));
        assert_eq!(reason(&b.key_test("budget", "nope").await), Some("invalid-password"));
        assert!(b.key_test("budget", "shared secret").await.is_ok());
        match b.sync().await {
            SyncResponse::Messages { messages } => assert!(!messages.is_empty()),
            SyncResponse::Error { error } => panic!("{:?}", error),
        }

        let rows = b
            .log()
            .read(|conn| LedgerTransaction::load_for_account(conn, "checking", false))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amount, -1250);
    }

    #[tokio::test]
    async fn rotation_rekeys_and_flags_remote_reset() {
        let remote = Arc::new(MemoryRemote::new());
        let service = service(Some(remote.clone()));
        service.key_make("old", false).await;
        service
            .transactions_import("checking", &[bank("x1", "checking", -1, "2024-01-01")], false, &ReconcileOptions::default())
            .await;
        assert!(matches!(service.sync().await, SyncResponse::Messages { .. }));
        service.device_identity().unwrap();
        assert!(!service.status().unwrap().needs_remote_reset);

        assert!(service.key_make("new", true).await.is_ok());
        let status = service.status().unwrap();
        assert!(status.needs_remote_reset);
        assert!(status.pending_messages > 0);
        service.device_identity().unwrap();

        assert!(matches!(service.sync().await, SyncResponse::Messages { .. }));
        assert_eq!(remote.resets.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert!(remote
            .stored("budget")
            .iter()
            .all(|m| m.envelope.key_version == 2));
    }

    #[tokio::test]
    async fn import_preview_then_apply() {
        let service = service(None);
        service.key_make("pw", false).await;
        let rows = [
            bank("x1", "checking", -500, "2024-01-10"),
            bank("x2", "checking", -700, "not a date"),
        ];

        let preview = service
            .transactions_import("checking", &rows, true, &ReconcileOptions::default())
            .await;
        assert!(preview.error.is_none());
        assert_eq!(preview.added.len(), 1);
        assert_eq!(preview.errors.len(), 1);
        assert_eq!(service.status().unwrap().pending_messages, 0);

        let applied = service
            .transactions_import("checking", &rows, false, &ReconcileOptions::default())
            .await;
        assert_eq!(applied.added, preview.added);
        assert!(applied.matched.is_empty());
        assert!(service.status().unwrap().pending_messages > 0);

        let json = serde_json::to_value(&applied).unwrap();
        assert!(json.get("updatedPreview").is_some());
        assert!(json.get("matched").is_some());
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn import_reports_matched_manual_entry() {
        let service = service(None);
        service.key_make("pw", false).await;
        let manual = crate::ledger::tests::sample("m1", "checking", -500, "2024-01-10");
        service.log().append_batch(manual.changes()).unwrap();

        let response = service
            .transactions_import(
                "checking",
                &[bank("x1", "checking", -500, "2024-01-11")],
                false,
                &ReconcileOptions::default(),
            )
            .await;
        assert!(response.added.is_empty());
        assert_eq!(response.updated, vec!["m1".to_string()]);
        assert_eq!(response.matched, vec!["m1".to_string()]);
        assert_eq!(serde_json::to_value(&response).unwrap()["matched"][0], "m1");
    }

    #[tokio::test]
    async fn bank_sync_reports_per_account() {
        let mut connector = StaticConnector::default();
        connector.statements.insert(
            "checking".to_string(),
            vec![bank("x1", "checking", -500, "2024-01-10")],
        );
        connector.statements.insert("savings".to_string(), Vec::new());

        let service = service(None).with_connector(Arc::new(connector));
        service.key_make("pw", false).await;
        service
            .save_payee_rule(&PayeeRule {
                id: "r1".to_string(),
                account_id: None,
                kind: RuleKind::Contains,
                pattern: "corner".to_string(),
                payee_id: "shop".to_string(),
                priority: 0,
                active: true,
            })
            .await
            .unwrap();

        let all = service.accounts_bank_sync(None).await;
        assert_eq!(all.new_transactions.len(), 1);
        assert_eq!(all.updated_accounts, vec!["checking".to_string()]);
        assert!(all.errors.is_empty());

        let rows = service
            .log()
            .read(|conn| LedgerTransaction::load_for_account(conn, "checking", false))
            .unwrap();
        assert_eq!(rows[0].payee_id.as_deref(), Some("shop"));

        let missing = service
            .accounts_bank_sync(Some(vec!["closed".to_string()]))
            .await;
        assert_eq!(missing.errors.len(), 1);
        assert_eq!(missing.errors[0].error_code, "ITEM_ERROR");
        assert_eq!(missing.errors[0].account_id, "closed");
    }

    #[tokio::test]
    async fn batch_sync_returns_one_entry_per_id() {
        let mut connector = StaticConnector::default();
        connector.statements.insert(
            "checking".to_string(),
            vec![
                bank("x1", "checking", -500, "2024-01-10"),
                bank("x1", "checking", -500, "2024-01-10"),
            ],
        );
        let service = service(None).with_connector(Arc::new(connector));
        service.key_make("pw", false).await;

        let entries = service
            .simplefin_batch_sync(&["checking".to_string(), "gone".to_string()])
            .await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].account_id, "checking");
        assert_eq!(entries[0].res.new_transactions.len(), 1);
        assert_eq!(entries[1].res.errors.len(), 1);

        let json = serde_json::to_value(&entries[0]).unwrap();
        assert!(json["res"].get("newTransactions").is_some());
    }

    #[tokio::test]
    async fn repair_and_reset_on_clean_log() {
        let remote = Arc::new(MemoryRemote::new());
        let service = service(Some(remote));
        service.key_make("pw", false).await;

        let repair = service.sync_repair().await;
        assert!(repair.error.is_none());
        assert!(repair.report.unwrap().is_clean());

        assert!(service
            .sync_reset(ResetConfirmation::confirmed())
            .await
            .is_ok());
    }
}
