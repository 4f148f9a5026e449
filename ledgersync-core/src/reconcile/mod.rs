//! Bank transaction reconciliation.
//!
//! Statements fetched from a bank are deduplicated against the ledger,
//! matched to manually entered transactions where possible, and otherwise
//! added as new transactions. [`compute_diff`] is pure; [`apply_diff`] turns
//! its output into log messages.

pub mod connector;
pub mod engine;

pub use connector::{BankConnector, ConnectorError};
pub use engine::{apply_diff, compute_diff, reconcile_account};

use crate::ledger::LedgerTransaction;
use serde::{Deserialize, Serialize};

/// One transaction as reported by a bank. Never modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankTransaction {
    /// Bank-assigned id; preferred dedup key.
    #[serde(default)]
    pub external_id: Option<String>,
    pub account_id: String,
    /// Amount in cents. Negative for outflows.
    pub amount: i64,
    /// ISO `YYYY-MM-DD`
    pub date: String,
    #[serde(default)]
    pub payee_raw: String,
    #[serde(default)]
    pub imported_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl BankTransaction {
    /// `external_id` if non-empty, else `imported_id` if non-empty.
    pub fn dedup_key(&self) -> Option<&str> {
        [self.external_id.as_deref(), self.imported_id.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|key| !key.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconcileOptions {
    /// Largest date distance, in days, for a fuzzy match
    pub date_window_days: i64,
    /// `cleared` flag for newly added transactions
    pub default_cleared: bool,
    /// Add bank rows again even when a deleted transaction carries their key
    pub reimport_deleted: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            date_window_days: 4,
            default_cleared: true,
            reimport_deleted: false,
        }
    }
}

/// A bank row that could not be processed. Does not stop the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemError {
    pub account_id: String,
    pub external_id: Option<String>,
    pub message: String,
}

/// An existing transaction and what reconciliation turns it into
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePreview {
    pub existing: LedgerTransaction,
    pub updated: LedgerTransaction,
    /// Whether this update claims the row for a bank transaction
    pub matched: bool,
}

/// Everything a batch would change, computed without touching storage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileDiff {
    pub added: Vec<LedgerTransaction>,
    pub updated: Vec<UpdatePreview>,
    pub errors: Vec<ItemError>,
}

impl ReconcileDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty()
    }
}

/// Outcome reported to callers of an import or bank sync
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResult {
    pub errors: Vec<ItemError>,
    /// Ids of new transactions
    pub added: Vec<String>,
    /// Ids of changed transactions, matched ones included
    pub updated: Vec<String>,
    /// Ids of transactions newly claimed by a bank row
    pub matched: Vec<String>,
    pub updated_preview: Vec<UpdatePreview>,
}

impl From<ReconcileDiff> for ReconcileResult {
    fn from(diff: ReconcileDiff) -> Self {
        Self {
            added: diff.added.iter().map(|t| t.id.clone()).collect(),
            updated: diff.updated.iter().map(|u| u.updated.id.clone()).collect(),
            matched: diff
                .updated
                .iter()
                .filter(|u| u.matched)
                .map(|u| u.updated.id.clone())
                .collect(),
            errors: diff.errors,
            updated_preview: diff.updated,
        }
    }
}
