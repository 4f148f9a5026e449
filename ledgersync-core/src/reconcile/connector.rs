//! The seam to bank data providers.

use crate::reconcile::BankTransaction;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A provider failure, passed through to callers unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{error_code}: {reason}")]
pub struct ConnectorError {
    pub error_code: String,
    pub reason: String,
}

impl ConnectorError {
    pub fn new(error_code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            reason: reason.into(),
        }
    }
}

/// Fetches statements for linked accounts.
#[async_trait]
pub trait BankConnector: Send + Sync {
    /// Accounts this connector can fetch for.
    async fn linked_accounts(&self) -> Result<Vec<String>, ConnectorError>;

    async fn fetch_transactions(
        &self,
        account_id: &str,
    ) -> Result<Vec<BankTransaction>, ConnectorError>;

    /// Fetch several accounts. Providers with a batch endpoint override this;
    /// a failure for one account does not fail the others.
    async fn fetch_batch(
        &self,
        account_ids: &[String],
    ) -> Vec<(String, Result<Vec<BankTransaction>, ConnectorError>)> {
        let mut results = Vec::with_capacity(account_ids.len());
        for account_id in account_ids {
            results.push((account_id.clone(), self.fetch_transactions(account_id).await));
        }
        results
    }
}
