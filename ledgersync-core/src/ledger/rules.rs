//! Payee rules: map a bank's raw payee text to a ledger payee.

use crate::ledger::PAYEE_RULES;
use crate::sync::models::CellChange;
use crate::{DatabaseError, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

/// How a rule's pattern is compared with the imported payee text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Is,
    Contains,
    /// Pattern is a newline-separated list; any exact entry matches.
    OneOf,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Is => "is",
            Self::Contains => "contains",
            Self::OneOf => "one_of",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "contains" => Self::Contains,
            "one_of" => Self::OneOf,
            _ => Self::Is,
        }
    }
}

/// A payee rule row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayeeRule {
    pub id: String,
    /// `None` applies the rule to every account.
    pub account_id: Option<String>,
    pub kind: RuleKind,
    pub pattern: String,
    pub payee_id: String,
    pub priority: i64,
    pub active: bool,
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

impl PayeeRule {
    pub fn matches(&self, imported_payee: &str) -> bool {
        let payee = normalize(imported_payee);
        if payee.is_empty() {
            return false;
        }
        match self.kind {
            RuleKind::Is => normalize(&self.pattern) == payee,
            RuleKind::Contains => {
                let pattern = normalize(&self.pattern);
                !pattern.is_empty() && payee.contains(&pattern)
            }
            RuleKind::OneOf => self
                .pattern
                .lines()
                .map(normalize)
                .any(|candidate| !candidate.is_empty() && candidate == payee),
        }
    }

    /// One cell change per column, for writing this rule through the log.
    pub fn changes(&self) -> Vec<CellChange> {
        let id = self.id.as_str();
        vec![
            CellChange::new(PAYEE_RULES, id, "account_id", self.account_id.clone()),
            CellChange::new(PAYEE_RULES, id, "kind", self.kind.as_str()),
            CellChange::new(PAYEE_RULES, id, "pattern", self.pattern.as_str()),
            CellChange::new(PAYEE_RULES, id, "payee_id", self.payee_id.as_str()),
            CellChange::new(PAYEE_RULES, id, "priority", self.priority),
            CellChange::new(PAYEE_RULES, id, "active", self.active),
        ]
    }
}

/// The active rules that apply to one account, in evaluation order.
#[derive(Debug, Clone, Default)]
pub struct PayeeRules {
    rules: Vec<PayeeRule>,
}

impl PayeeRules {
    /// Order: account-specific rules before global ones, then higher
    /// priority first, then rule id.
    pub fn new(mut rules: Vec<PayeeRule>) -> Self {
        rules.retain(|r| r.active);
        rules.sort_by(|a, b| {
            b.account_id
                .is_some()
                .cmp(&a.account_id.is_some())
                .then(b.priority.cmp(&a.priority))
                .then(a.id.cmp(&b.id))
        });
        Self { rules }
    }

    pub fn load(conn: &Connection, account_id: &str) -> Result<Self> {
        let mut stmt = conn
            .prepare(
                "SELECT id, account_id, kind, pattern, payee_id, priority, active
                 FROM payee_rules
                 WHERE tombstone = 0 AND active = 1 AND payee_id IS NOT NULL
                   AND (account_id IS NULL OR account_id = ?1)",
            )
            .map_err(DatabaseError::Sqlite)?;
        let rules = stmt
            .query_map(params![account_id], |row| {
                Ok(PayeeRule {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    kind: RuleKind::parse(&row.get::<_, Option<String>>(2)?.unwrap_or_default()),
                    pattern: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                    payee_id: row.get(4)?,
                    priority: row.get(5)?,
                    active: row.get(6)?,
                })
            })
            .map_err(DatabaseError::Sqlite)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(DatabaseError::Sqlite)?;
        Ok(Self::new(rules))
    }

    /// Payee chosen by the first matching rule
    pub fn resolve(&self, imported_payee: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| rule.matches(imported_payee))
            .map(|rule| rule.payee_id.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
