pub mod snapshot;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use snapshot::{ConflictChoice, ConflictPrompt, SyncSnapshot, SyncSummary};

/// The entity kinds tracked by the commit log and the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Envelope,
    Transaction,
    Bill,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Envelope => "envelope",
            Self::Transaction => "transaction",
            Self::Bill => "bill",
        }
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "envelope" => Ok(Self::Envelope),
            "transaction" => Ok(Self::Transaction),
            "bill" => Ok(Self::Bill),
            _ => Err(format!("unknown entity kind: {s}")),
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The shape of one entity-level mutation inside a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Create,
    Update,
    Delete,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::str::FromStr for ChangeOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            _ => Err(format!("unknown change op: {s}")),
        }
    }
}

impl std::fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A spending envelope: a named pot of money within the budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub name: String,
    pub category: String,
    pub balance: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(name: &str, category: &str, balance: Decimal) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.to_string(),
            category: category.to_string(),
            balance,
            updated_at: Utc::now(),
        }
    }
}

/// A ledger transaction, optionally attributed to an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub envelope_id: Option<Uuid>,
    pub description: String,
    pub amount: Decimal,
    pub date: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(description: &str, amount: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            envelope_id: None,
            description: description.to_string(),
            amount,
            date: now,
            updated_at: now,
        }
    }

    pub fn with_envelope(mut self, envelope_id: Uuid) -> Self {
        self.envelope_id = Some(envelope_id);
        self
    }
}

/// A recurring bill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bill {
    pub id: Uuid,
    pub name: String,
    pub amount: Decimal,
    pub due_date: DateTime<Utc>,
    pub frequency: String,
    pub envelope_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

impl Bill {
    pub fn new(name: &str, amount: Decimal, due_date: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.to_string(),
            amount,
            due_date,
            frequency: "monthly".to_string(),
            envelope_id: None,
            updated_at: Utc::now(),
        }
    }
}

/// Singleton budget-level totals, versioned for sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetMeta {
    pub unassigned_cash: Decimal,
    pub actual_balance: Decimal,
    pub last_modified: DateTime<Utc>,
    pub sync_version: u64,
}

impl Default for BudgetMeta {
    fn default() -> Self {
        Self {
            unassigned_cash: Decimal::ZERO,
            actual_balance: Decimal::ZERO,
            // A never-touched budget dates from the epoch, so any real
            // modification on either side is unambiguously newer.
            last_modified: DateTime::UNIX_EPOCH,
            sync_version: 0,
        }
    }
}

/// An immutable record of one logical local mutation, chained to its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    /// Content-derived hash covering parent, author, timestamp, message,
    /// device fingerprint, and the full change set.
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub author: String,
    pub parent_hash: Option<String>,
    pub device_fingerprint: String,
}

/// One entity-level mutation attributed to a commit.
///
/// `old_value` is `None` iff the op is a create; `new_value` is `None` iff
/// the op is a delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub commit_hash: String,
    pub entity: EntityKind,
    pub entity_id: String,
    pub op: ChangeOp,
    pub description: String,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_kind_roundtrip() {
        for kind in [EntityKind::Envelope, EntityKind::Transaction, EntityKind::Bill] {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert!("budget".parse::<EntityKind>().is_err());
    }

    #[test]
    fn change_op_roundtrip() {
        for op in [ChangeOp::Create, ChangeOp::Update, ChangeOp::Delete] {
            assert_eq!(op.as_str().parse::<ChangeOp>().unwrap(), op);
        }
        assert!("modify".parse::<ChangeOp>().is_err());
    }

    #[test]
    fn entity_kind_serde_uses_snake_case() {
        let json = serde_json::to_string(&EntityKind::Envelope).unwrap();
        assert_eq!(json, "\"envelope\"");
    }

    #[test]
    fn transaction_builder_attaches_envelope() {
        let envelope = Envelope::new("Groceries", "food", Decimal::new(12000, 2));
        let tx = Transaction::new("weekly shop", Decimal::new(-4550, 2))
            .with_envelope(envelope.id);
        assert_eq!(tx.envelope_id, Some(envelope.id));
    }

    #[test]
    fn budget_meta_defaults_to_version_zero() {
        let meta = BudgetMeta::default();
        assert_eq!(meta.sync_version, 0);
        assert_eq!(meta.unassigned_cash, Decimal::ZERO);
    }
}
