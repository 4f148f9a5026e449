//! Materialized ledger rows.
//!
//! The sync log is the source of truth. Every accepted cell write is copied
//! into a plain SQL table here so readers (and the reconciliation engine)
//! can query whole rows.

pub mod projection;
pub mod rules;

pub use projection::apply_cell;
pub use rules::{PayeeRule, PayeeRules, RuleKind};

use crate::sync::models::CellChange;
use crate::{DatabaseError, Result};
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const TRANSACTIONS: &str = "transactions";
pub const PAYEE_RULES: &str = "payee_rules";

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// A transaction as stored in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerTransaction {
    pub id: String,
    pub account_id: String,
    /// Amount in cents. Negative for outflows.
    pub amount: i64,
    pub date: NaiveDate,
    pub payee_id: Option<String>,
    pub imported_payee: Option<String>,
    pub notes: Option<String>,
    pub cleared: bool,
    pub imported_id: Option<String>,
    pub is_matched: bool,
    pub sort_order: i64,
    pub tombstone: bool,
}

const SELECT_COLUMNS: &str = "id, account_id, amount, date, payee_id, imported_payee, notes,
     cleared, imported_id, is_matched, sort_order, tombstone";

impl LedgerTransaction {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Option<Self>> {
        let id: String = row.get(0)?;
        let date: String = row.get(3)?;
        let date = match NaiveDate::parse_from_str(&date, DATE_FORMAT) {
            Ok(date) => date,
            Err(_) => {
                warn!(transaction_id = %id, "Skipping transaction with unparseable date");
                return Ok(None);
            }
        };
        Ok(Some(Self {
            id,
            account_id: row.get(1)?,
            amount: row.get(2)?,
            date,
            payee_id: row.get(4)?,
            imported_payee: row.get(5)?,
            notes: row.get(6)?,
            cleared: row.get(7)?,
            imported_id: row.get(8)?,
            is_matched: row.get(9)?,
            sort_order: row.get(10)?,
            tombstone: row.get(11)?,
        }))
    }

    /// Transactions of `account_id`, oldest first.
    ///
    /// Rows still missing their account or date (partially merged) are not
    /// returned.
    pub fn load_for_account(
        conn: &Connection,
        account_id: &str,
        include_tombstoned: bool,
    ) -> Result<Vec<Self>> {
        let sql = format!(
            "SELECT {} FROM transactions
             WHERE account_id = ?1 AND date IS NOT NULL AND (?2 OR tombstone = 0)
             ORDER BY date, sort_order, id",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql).map_err(DatabaseError::Sqlite)?;
        let rows = stmt
            .query_map(params![account_id, include_tombstoned], Self::from_row)
            .map_err(DatabaseError::Sqlite)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(DatabaseError::Sqlite)?;
        Ok(rows.into_iter().flatten().collect())
    }

    pub fn get(conn: &Connection, id: &str) -> Result<Option<Self>> {
        let sql = format!(
            "SELECT {} FROM transactions WHERE id = ?1 AND account_id IS NOT NULL AND date IS NOT NULL",
            SELECT_COLUMNS
        );
        let row = conn
            .query_row(&sql, [id], Self::from_row)
            .optional()
            .map_err(DatabaseError::Sqlite)?;
        Ok(row.flatten())
    }

    /// One cell change per column, for inserting this row through the log.
    pub fn changes(&self) -> Vec<CellChange> {
        let cell = |column: &str, value: crate::sync::models::MessageValue| {
            CellChange::new(TRANSACTIONS, self.id.as_str(), column, value)
        };
        vec![
            cell("account_id", self.account_id.clone().into()),
            cell("amount", self.amount.into()),
            cell("date", self.date.format(DATE_FORMAT).to_string().into()),
            cell("payee_id", self.payee_id.clone().into()),
            cell("imported_payee", self.imported_payee.clone().into()),
            cell("notes", self.notes.clone().into()),
            cell("cleared", self.cleared.into()),
            cell("imported_id", self.imported_id.clone().into()),
            cell("is_matched", self.is_matched.into()),
            cell("sort_order", self.sort_order.into()),
            cell("tombstone", self.tombstone.into()),
        ]
    }

    /// Cell changes turning `self` into `updated`. Unchanged columns are
    /// left out so concurrent edits to other columns survive the merge.
    pub fn changes_to(&self, updated: &Self) -> Vec<CellChange> {
        let current = self.changes();
        updated
            .changes()
            .into_iter()
            .zip(current)
            .filter(|(new, old)| new.value != old.value)
            .map(|(new, _)| new)
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::database::Database;

    pub(crate) fn sample(id: &str, account: &str, amount: i64, date: &str) -> LedgerTransaction {
        LedgerTransaction {
            id: id.to_string(),
            account_id: account.to_string(),
            amount,
            date: NaiveDate::parse_from_str(date, DATE_FORMAT).unwrap(),
            payee_id: None,
            imported_payee: None,
            notes: None,
            cleared: false,
            imported_id: None,
            is_matched: false,
            sort_order: 0,
            tombstone: false,
        }
    }

    fn store(conn: &Connection, txn: &LedgerTransaction) {
        for change in txn.changes() {
            apply_cell(conn, &change.table, &change.row_id, &change.column, &change.value).unwrap();
        }
    }

    #[test]
    fn projected_rows_load_back() {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();

        let mut a = sample("t1", "checking", -450, "2024-03-02");
        a.payee_id = Some("coffee".to_string());
        a.cleared = true;
        let b = sample("t2", "checking", 10_000, "2024-03-01");
        let mut gone = sample("t3", "checking", 1, "2024-03-03");
        gone.tombstone = true;
        let other = sample("t4", "savings", 5, "2024-03-01");
        for txn in [&a, &b, &gone, &other] {
            store(db.conn(), txn);
        }

        let rows = LedgerTransaction::load_for_account(db.conn(), "checking", false).unwrap();
        assert_eq!(rows, vec![b.clone(), a.clone()]);

        let all = LedgerTransaction::load_for_account(db.conn(), "checking", true).unwrap();
        assert_eq!(all.len(), 3);

        assert_eq!(LedgerTransaction::get(db.conn(), "t1").unwrap(), Some(a));
        assert_eq!(LedgerTransaction::get(db.conn(), "missing").unwrap(), None);
    }

    #[test]
    fn partial_rows_are_hidden() {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();
        apply_cell(db.conn(), TRANSACTIONS, "t1", "account_id", &"checking".into()).unwrap();
        assert!(LedgerTransaction::load_for_account(db.conn(), "checking", true)
            .unwrap()
            .is_empty());
        assert_eq!(LedgerTransaction::get(db.conn(), "t1").unwrap(), None);
    }

    #[test]
    fn changes_to_only_lists_modified_columns() {
        let before = sample("t1", "checking", -450, "2024-03-02");
        let mut after = before.clone();
        after.imported_id = Some("bank-1".to_string());
        after.is_matched = true;

        let changes = before.changes_to(&after);
        let columns: Vec<&str> = changes.iter().map(|c| c.column.as_str()).collect();
        assert_eq!(columns, vec!["imported_id", "is_matched"]);
    }
}
