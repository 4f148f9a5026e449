//! Copies accepted cell writes into the ledger tables.

use crate::ledger::{PAYEE_RULES, TRANSACTIONS};
use crate::sync::models::MessageValue;
use crate::{DatabaseError, Result};
use rusqlite::{params, Connection};

/// SQL column for a synced column, and whether it is NOT NULL.
fn projected_column(table: &str, column: &str) -> Option<(&'static str, &'static str, bool)> {
    let found = match (table, column) {
        (TRANSACTIONS, "account_id") => (TRANSACTIONS, "account_id", false),
        (TRANSACTIONS, "amount") => (TRANSACTIONS, "amount", true),
        (TRANSACTIONS, "date") => (TRANSACTIONS, "date", false),
        (TRANSACTIONS, "payee_id") => (TRANSACTIONS, "payee_id", false),
        (TRANSACTIONS, "imported_payee") => (TRANSACTIONS, "imported_payee", false),
        (TRANSACTIONS, "notes") => (TRANSACTIONS, "notes", false),
        (TRANSACTIONS, "cleared") => (TRANSACTIONS, "cleared", true),
        (TRANSACTIONS, "imported_id") => (TRANSACTIONS, "imported_id", false),
        (TRANSACTIONS, "is_matched") => (TRANSACTIONS, "is_matched", true),
        (TRANSACTIONS, "sort_order") => (TRANSACTIONS, "sort_order", true),
        (TRANSACTIONS, "tombstone") => (TRANSACTIONS, "tombstone", true),
        (PAYEE_RULES, "account_id") => (PAYEE_RULES, "account_id", false),
        (PAYEE_RULES, "kind") => (PAYEE_RULES, "kind", false),
        (PAYEE_RULES, "pattern") => (PAYEE_RULES, "pattern", false),
        (PAYEE_RULES, "payee_id") => (PAYEE_RULES, "payee_id", false),
        (PAYEE_RULES, "priority") => (PAYEE_RULES, "priority", true),
        (PAYEE_RULES, "active") => (PAYEE_RULES, "active", true),
        (PAYEE_RULES, "tombstone") => (PAYEE_RULES, "tombstone", true),
        _ => return None,
    };
    Some(found)
}

/// Write one accepted cell into its ledger table.
///
/// Cells of tables or columns this build does not know are kept only in the
/// sync log, so newer clients can add columns without breaking older ones.
/// Returns whether a ledger row was touched.
pub fn apply_cell(
    conn: &Connection,
    table: &str,
    row_id: &str,
    column: &str,
    value: &MessageValue,
) -> Result<bool> {
    let Some((table, column, not_null)) = projected_column(table, column) else {
        return Ok(false);
    };

    let zero = MessageValue::Integer(0);
    let value = if not_null && *value == MessageValue::Null {
        &zero
    } else {
        value
    };

    conn.execute(
        &format!("INSERT INTO {} (id) VALUES (?1) ON CONFLICT(id) DO NOTHING", table),
        [row_id],
    )
    .map_err(DatabaseError::Sqlite)?;
    conn.execute(
        &format!("UPDATE {} SET {} = ?2 WHERE id = ?1", table, column),
        params![row_id, value],
    )
    .map_err(DatabaseError::Sqlite)?;
    Ok(true)
}

/// Remove every materialized row. Used when the log is replaced wholesale.
pub fn clear(conn: &Connection) -> Result<()> {
    conn.execute_batch("DELETE FROM transactions; DELETE FROM payee_rules;")
        .map_err(DatabaseError::Sqlite)?;
    Ok(())
}
