//! Automatic pre-sync backups.
//!
//! Before each sync cycle the local snapshot is serialized into the
//! `backups` table so a bad merge can be undone. Only the newest N are
//! retained.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use wren_core::{SyncSnapshot, WrenError, WrenResult};
use wren_storage::{BackupRow, BudgetStore};

use crate::config::{BackupConfig, IdentityConfig};

pub struct BackupService {
    store: Arc<BudgetStore>,
    config: BackupConfig,
    identity: IdentityConfig,
}

impl BackupService {
    pub fn new(store: Arc<BudgetStore>, config: BackupConfig, identity: IdentityConfig) -> Self {
        Self {
            store,
            config,
            identity,
        }
    }

    /// Snapshot the local state under a reason tag, pruning old backups.
    /// Returns the backup id, or `None` when backups are disabled.
    pub fn create_pre_sync(&self, reason: &str) -> WrenResult<Option<Uuid>> {
        if !self.config.enabled {
            return Ok(None);
        }
        let snapshot = self
            .store
            .load_snapshot(&self.identity.author, &self.identity.device_fingerprint)?;
        let row = BackupRow {
            id: Uuid::now_v7(),
            created_at: Utc::now(),
            reason: reason.to_string(),
            payload: serde_json::to_string(&snapshot)?,
        };
        self.store.insert_backup(&row)?;
        let pruned = self.store.prune_backups(self.config.retain)?;
        tracing::debug!(backup_id = %row.id, reason, pruned, "pre-sync backup created");
        Ok(Some(row.id))
    }

    pub fn latest_backup(&self) -> WrenResult<Option<BackupRow>> {
        Ok(self.store.list_backups(1)?.into_iter().next())
    }

    pub fn list_backups(&self) -> WrenResult<Vec<BackupRow>> {
        self.store.list_backups(self.config.retain)
    }

    /// Restore entity tables from a stored backup in one transaction.
    pub fn restore_from_backup(&self, id: Uuid) -> WrenResult<SyncSnapshot> {
        let row = self
            .store
            .get_backup(id)?
            .ok_or_else(|| WrenError::NotFound(format!("backup {id}")))?;
        let snapshot: SyncSnapshot = serde_json::from_str(&row.payload)?;
        self.store.replace_all(&snapshot)?;
        tracing::info!(backup_id = %id, "restored local state from backup");
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use wren_core::Envelope;

    fn service(retain: usize) -> BackupService {
        let store = Arc::new(BudgetStore::open_in_memory().unwrap());
        BackupService::new(
            store,
            BackupConfig {
                enabled: true,
                retain,
            },
            IdentityConfig::default(),
        )
    }

    #[test]
    fn backup_captures_current_state() {
        let svc = service(5);
        svc.store
            .upsert_envelope(&Envelope::new("Groceries", "food", Decimal::new(100, 0)))
            .unwrap();

        let id = svc.create_pre_sync("cloud_sync").unwrap().unwrap();
        let row = svc.latest_backup().unwrap().unwrap();
        assert_eq!(row.id, id);
        assert_eq!(row.reason, "cloud_sync");

        let snapshot: SyncSnapshot = serde_json::from_str(&row.payload).unwrap();
        assert_eq!(snapshot.envelopes.len(), 1);
    }

    #[test]
    fn retention_caps_backup_count() {
        let svc = service(2);
        for _ in 0..4 {
            svc.create_pre_sync("cloud_sync").unwrap();
        }
        assert_eq!(svc.store.list_backups(10).unwrap().len(), 2);
    }

    #[test]
    fn disabled_backups_are_skipped() {
        let store = Arc::new(BudgetStore::open_in_memory().unwrap());
        let svc = BackupService::new(
            store,
            BackupConfig {
                enabled: false,
                retain: 5,
            },
            IdentityConfig::default(),
        );
        assert!(svc.create_pre_sync("cloud_sync").unwrap().is_none());
        assert!(svc.latest_backup().unwrap().is_none());
    }

    #[test]
    fn restore_round_trips_entities() {
        let svc = service(5);
        svc.store
            .upsert_envelope(&Envelope::new("Groceries", "food", Decimal::new(100, 0)))
            .unwrap();
        let id = svc.create_pre_sync("pre_restore_test").unwrap().unwrap();

        // Wipe the table, then restore.
        let mut wiped = svc.store.load_snapshot("x", "y").unwrap();
        wiped.envelopes.clear();
        svc.store.replace_all(&wiped).unwrap();

        svc.restore_from_backup(id).unwrap();
        assert_eq!(svc.store.list_envelopes().unwrap().len(), 1);
    }

    #[test]
    fn restore_unknown_backup_is_not_found() {
        let svc = service(5);
        assert!(matches!(
            svc.restore_from_backup(Uuid::now_v7()).unwrap_err(),
            WrenError::NotFound(_)
        ));
    }
}
