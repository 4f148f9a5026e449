//! Matching bank rows against ledger transactions.
//!
//! For each bank row, in order:
//! 1. A transaction of the account already carries its dedup key: update
//!    amount and date if they changed, else nothing.
//! 2. Otherwise the best unclaimed, unmatched transaction with the same
//!    amount inside the date window is claimed and takes the bank's date.
//!    Payee-confirmed candidates rank first, then smaller date distance,
//!    then creation order. A keyless row leaves its row id on the claimed
//!    transaction.
//! 3. Otherwise a new transaction is added.

use crate::ledger::{LedgerTransaction, PayeeRules, DATE_FORMAT};
use crate::reconcile::{
    BankTransaction, ItemError, ReconcileDiff, ReconcileOptions, ReconcileResult, UpdatePreview,
};
use crate::sync::log::SyncLog;
use crate::sync::models::CellChange;
use crate::Result;
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};
use uuid::Uuid;

/// Namespace for ids of transactions created from bank rows
const IMPORT_NAMESPACE: Uuid = Uuid::from_u128(0x6c65_6467_6572_5f69_6d70_6f72_745f_7631);

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Stable id for a transaction created from a bank row, so a preview and
/// the following apply agree and re-importing a keyless row is a no-op.
fn import_id(account_id: &str, key: Option<&str>, fallback: impl FnOnce() -> String) -> String {
    let name = match key {
        Some(key) => format!("{}\u{1f}key\u{1f}{}", account_id, key),
        None => format!("{}\u{1f}row\u{1f}{}", account_id, fallback()),
    };
    Uuid::new_v5(&IMPORT_NAMESPACE, name.as_bytes()).to_string()
}

fn is_confirmed(candidate: &LedgerTransaction, payee: &str, resolved: Option<&str>) -> bool {
    if resolved.is_some() && candidate.payee_id.as_deref() == resolved {
        return true;
    }
    let payee = normalize(payee);
    !payee.is_empty()
        && candidate
            .imported_payee
            .as_deref()
            .map(normalize)
            .is_some_and(|p| p == payee)
}

/// Work out what reconciling `bank` into `account_id` would change.
///
/// `existing` should hold every transaction of the account, tombstoned
/// ones included.
pub fn compute_diff(
    account_id: &str,
    existing: &[LedgerTransaction],
    rules: &PayeeRules,
    bank: &[BankTransaction],
    options: &ReconcileOptions,
) -> ReconcileDiff {
    let mut diff = ReconcileDiff::default();
    let by_id: HashMap<&str, &LedgerTransaction> =
        existing.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut claimed: HashSet<&str> = HashSet::new();
    let mut seen_keys: HashSet<&str> = HashSet::new();
    let mut occurrences: HashMap<(NaiveDate, i64, String), u32> = HashMap::new();
    let mut next_sort_order = existing.iter().map(|t| t.sort_order).max().unwrap_or(0) + 1;
    let window = options.date_window_days.max(0);

    for item in bank {
        let item_error = |message: String| ItemError {
            account_id: item.account_id.clone(),
            external_id: item.external_id.clone(),
            message,
        };

        if !item.account_id.is_empty() && item.account_id != account_id {
            diff.errors.push(item_error(format!(
                "transaction belongs to account {}, not {}",
                item.account_id, account_id
            )));
            continue;
        }
        let Ok(date) = NaiveDate::parse_from_str(item.date.trim(), DATE_FORMAT) else {
            diff.errors
                .push(item_error(format!("invalid date: {:?}", item.date)));
            continue;
        };
        let payee = item.payee_raw.trim();
        let key = item.dedup_key();
        if payee.is_empty() && key.is_none() {
            diff.errors.push(item_error(
                "transaction has neither a payee nor an id".to_string(),
            ));
            continue;
        }

        if let Some(key) = key {
            if !seen_keys.insert(key) {
                debug!(account_id, key, "Folding duplicate bank row");
                continue;
            }
            if let Some(current) = existing
                .iter()
                .find(|t| t.imported_id.as_deref() == Some(key))
            {
                claimed.insert(current.id.as_str());
                if current.tombstone {
                    if options.reimport_deleted {
                        diff.updated.push(restore(current, item.amount, date, payee));
                    }
                } else if current.amount != item.amount || current.date != date {
                    let mut updated = current.clone();
                    updated.amount = item.amount;
                    updated.date = date;
                    diff.updated.push(UpdatePreview {
                        existing: current.clone(),
                        updated,
                        matched: false,
                    });
                }
                continue;
            }
        }

        let id = import_id(account_id, key, || {
            let slot = (date, item.amount, normalize(payee));
            let occurrence = occurrences.entry(slot).or_insert(0);
            *occurrence += 1;
            format!("{}\u{1f}{}\u{1f}{}\u{1f}{}", date, item.amount, normalize(payee), occurrence)
        });
        // Added by an earlier import of this same row, or matched by one.
        let earlier = by_id.get(id.as_str()).copied().or_else(|| {
            key.is_none()
                .then(|| {
                    existing
                        .iter()
                        .find(|t| t.imported_id.as_deref() == Some(id.as_str()))
                })
                .flatten()
        });
        if let Some(current) = earlier {
            if claimed.insert(current.id.as_str()) && current.tombstone && options.reimport_deleted
            {
                diff.updated.push(restore(current, item.amount, date, payee));
            }
            continue;
        }

        let resolved = rules.resolve(payee);
        let best = existing
            .iter()
            .filter(|t| {
                !t.tombstone
                    && t.imported_id.is_none()
                    && t.amount == item.amount
                    && !claimed.contains(t.id.as_str())
            })
            .filter_map(|t| {
                let distance = (t.date - date).num_days().abs();
                (distance <= window).then(|| (t, distance, is_confirmed(t, payee, resolved)))
            })
            .min_by(|a, b| {
                b.2.cmp(&a.2)
                    .then(a.1.cmp(&b.1))
                    .then(a.0.sort_order.cmp(&b.0.sort_order))
                    .then(a.0.id.cmp(&b.0.id))
            });

        if let Some((candidate, distance, confirmed)) = best {
            claimed.insert(candidate.id.as_str());
            let mut updated = candidate.clone();
            // Matched rows take the bank's posting date.
            updated.date = date;
            // Keyless rows leave their row id behind so a re-import finds them.
            updated.imported_id = Some(key.map_or_else(|| id.clone(), str::to_string));
            updated.is_matched = confirmed;
            if !payee.is_empty() {
                updated.imported_payee = Some(payee.to_string());
            }
            if updated.payee_id.is_none() {
                updated.payee_id = resolved.map(str::to_string);
            }
            debug!(account_id, transaction_id = %candidate.id, distance, confirmed, "Matched bank row");
            if candidate.changes_to(&updated).is_empty() {
                continue;
            }
            diff.updated.push(UpdatePreview {
                existing: candidate.clone(),
                updated,
                matched: true,
            });
            continue;
        }

        diff.added.push(LedgerTransaction {
            id,
            account_id: account_id.to_string(),
            amount: item.amount,
            date,
            payee_id: resolved.map(str::to_string),
            imported_payee: (!payee.is_empty()).then(|| payee.to_string()),
            notes: item.notes.clone(),
            cleared: options.default_cleared,
            imported_id: key.map(str::to_string),
            is_matched: false,
            sort_order: next_sort_order,
            tombstone: false,
        });
        next_sort_order += 1;
    }

    diff
}

fn restore(current: &LedgerTransaction, amount: i64, date: NaiveDate, payee: &str) -> UpdatePreview {
    let mut updated = current.clone();
    updated.tombstone = false;
    updated.amount = amount;
    updated.date = date;
    if !payee.is_empty() {
        updated.imported_payee = Some(payee.to_string());
    }
    UpdatePreview {
        existing: current.clone(),
        updated,
        matched: false,
    }
}

/// Append the messages for `diff` to the log in one batch.
///
/// Updates only carry the columns that changed.
pub fn apply_diff(diff: &ReconcileDiff, log: &SyncLog) -> Result<usize> {
    let changes: Vec<CellChange> = diff
        .added
        .iter()
        .flat_map(LedgerTransaction::changes)
        .chain(
            diff.updated
                .iter()
                .flat_map(|u| u.existing.changes_to(&u.updated)),
        )
        .collect();
    let count = changes.len();
    log.append_batch(changes)?;
    Ok(count)
}

/// Reconcile a statement into one account. With `preview` nothing is
/// written.
///
/// Callers hold the ledger lock so the diff is applied to the state it was
/// computed from.
pub fn reconcile_account(
    log: &SyncLog,
    account_id: &str,
    bank: &[BankTransaction],
    options: &ReconcileOptions,
    preview: bool,
) -> Result<ReconcileResult> {
    let (existing, rules) = log.read(|conn| {
        Ok((
            LedgerTransaction::load_for_account(conn, account_id, true)?,
            PayeeRules::load(conn, account_id)?,
        ))
    })?;

    let diff = compute_diff(account_id, &existing, &rules, bank, options);
    if !preview && !diff.is_empty() {
        let messages = apply_diff(&diff, log)?;
        debug!(account_id, messages, "Reconciliation applied");
    }
    info!(
        account_id,
        preview,
        added = diff.added.len(),
        updated = diff.updated.len(),
        errors = diff.errors.len(),
        "Reconciled bank transactions"
    );
    Ok(diff.into())
}
