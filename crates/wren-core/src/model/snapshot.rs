//! Snapshot and conflict types exchanged between the local store, the sync
//! orchestrator, and the remote store.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Bill, Envelope, Transaction};

/// A full materialized view of one side's budget state, used for diffing
/// during a sync cycle. Transient; never persisted as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSnapshot {
    /// Display name of the user/device that produced the snapshot.
    pub author: String,
    pub device_fingerprint: String,
    pub envelopes: Vec<Envelope>,
    pub transactions: Vec<Transaction>,
    pub bills: Vec<Bill>,
    pub unassigned_cash: Decimal,
    pub actual_balance: Decimal,
    pub last_modified: DateTime<Utc>,
    pub sync_version: u64,
}

impl SyncSnapshot {
    /// Total entity count across all tracked kinds.
    pub fn entity_count(&self) -> usize {
        self.envelopes.len() + self.transactions.len() + self.bills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entity_count() == 0
    }

    pub fn summary(&self) -> SyncSummary {
        SyncSummary {
            envelopes: self.envelopes.len(),
            transactions: self.transactions.len(),
            bills: self.bills.len(),
            last_modified: self.last_modified,
            sync_version: self.sync_version,
        }
    }
}

/// Compact description of a snapshot, shown to the user when resolving a
/// conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub envelopes: usize,
    pub transactions: usize,
    pub bills: usize,
    pub last_modified: DateTime<Utc>,
    pub sync_version: u64,
}

/// What the orchestrator surfaces when local and remote both changed the
/// same entities since the last agreed sync point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictPrompt {
    /// The remote actor whose changes collide with ours.
    pub cloud_user: String,
    pub local_summary: SyncSummary,
    pub remote_summary: SyncSummary,
    /// Human-readable description of each colliding entity.
    pub conflicts: Vec<String>,
    pub detected_at: DateTime<Utc>,
}

/// The only two terminal resolutions. There is deliberately no automatic
/// merge: merging financial ledgers silently risks corrupting them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictChoice {
    /// Keep the local state and schedule it for re-push.
    KeepMine,
    /// Discard local pending changes for the affected scope, adopt remote.
    LoadTheirs,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn snapshot_with(envelopes: usize) -> SyncSnapshot {
        SyncSnapshot {
            author: "alex".into(),
            device_fingerprint: "dev-1".into(),
            envelopes: (0..envelopes)
                .map(|i| Envelope::new(&format!("env-{i}"), "general", Decimal::ZERO))
                .collect(),
            transactions: vec![],
            bills: vec![],
            unassigned_cash: Decimal::ZERO,
            actual_balance: Decimal::ZERO,
            last_modified: Utc::now(),
            sync_version: 3,
        }
    }

    #[test]
    fn entity_count_sums_all_kinds() {
        let mut snap = snapshot_with(2);
        snap.transactions.push(Transaction::new("coffee", Decimal::new(-450, 2)));
        assert_eq!(snap.entity_count(), 3);
        assert!(!snap.is_empty());
    }

    #[test]
    fn empty_snapshot_reports_empty() {
        assert!(snapshot_with(0).is_empty());
    }

    #[test]
    fn summary_carries_version() {
        let snap = snapshot_with(1);
        let summary = snap.summary();
        assert_eq!(summary.envelopes, 1);
        assert_eq!(summary.sync_version, 3);
    }

    #[test]
    fn conflict_choice_serde() {
        let json = serde_json::to_string(&ConflictChoice::KeepMine).unwrap();
        assert_eq!(json, "\"keep_mine\"");
        let back: ConflictChoice = serde_json::from_str("\"load_theirs\"").unwrap();
        assert_eq!(back, ConflictChoice::LoadTheirs);
    }
}
