//! Git-like commit log for budget changes.
//!
//! Every logical mutation becomes one commit fanning out to one change per
//! mutated entity, chained to a parent commit by content hash. The log is
//! append-only and independent of the network; replaying changes from a
//! commit's root reproduces the entity state at that point.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use wren_core::*;
use wren_storage::{BudgetStore, RawChange};

use crate::config::HistoryConfig;
use crate::lock::SyncLock;

/// Input for one commit. `parent_hash` must reference an existing commit
/// when present; `None` roots a new chain.
#[derive(Debug, Clone)]
pub struct NewCommit {
    pub message: String,
    pub author: String,
    pub device_fingerprint: String,
    pub parent_hash: Option<String>,
    pub changes: Vec<NewChange>,
}

#[derive(Debug, Clone)]
pub struct NewChange {
    pub entity: EntityKind,
    pub entity_id: String,
    pub op: ChangeOp,
    pub description: String,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
}

/// Entity state reconstructed by replaying changes up to a commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntitySnapshot {
    /// kind → entity id → last written value.
    pub entities: HashMap<EntityKind, HashMap<String, serde_json::Value>>,
}

impl EntitySnapshot {
    pub fn get(&self, kind: EntityKind, id: &str) -> Option<&serde_json::Value> {
        self.entities.get(&kind).and_then(|m| m.get(id))
    }

    pub fn count(&self, kind: EntityKind) -> usize {
        self.entities.get(&kind).map(|m| m.len()).unwrap_or(0)
    }
}

pub struct HistoryLog {
    store: Arc<BudgetStore>,
    lock: Arc<SyncLock>,
    config: HistoryConfig,
}

impl HistoryLog {
    pub fn new(store: Arc<BudgetStore>, lock: Arc<SyncLock>, config: HistoryConfig) -> Self {
        Self {
            store,
            lock,
            config,
        }
    }

    /// Record one logical mutation: validates the change set, computes the
    /// content hash, and persists commit + changes in one storage
    /// transaction under the shared lock.
    pub async fn commit(&self, input: NewCommit) -> WrenResult<Commit> {
        if input.changes.is_empty() {
            return Err(WrenError::InvalidInput(
                "a commit must carry at least one change".into(),
            ));
        }
        for change in &input.changes {
            validate_change_shape(change)?;
        }
        if let Some(parent) = &input.parent_hash {
            if self.store.get_commit(parent)?.is_none() {
                return Err(WrenError::InvalidInput(format!(
                    "parent commit not found: {parent}"
                )));
            }
        }

        let timestamp = Utc::now();
        let hash = commit_hash(&input, timestamp);
        let commit = Commit {
            hash: hash.clone(),
            timestamp,
            message: input.message.clone(),
            author: input.author.clone(),
            parent_hash: input.parent_hash.clone(),
            device_fingerprint: input.device_fingerprint.clone(),
        };
        let rows: Vec<RawChange> = input
            .changes
            .iter()
            .map(|c| RawChange {
                commit_hash: hash.clone(),
                entity: c.entity.as_str().to_string(),
                entity_id: c.entity_id.clone(),
                op: c.op.as_str().to_string(),
                description: c.description.clone(),
                old_value: c.old_value.as_ref().map(|v| v.to_string()),
                new_value: c.new_value.as_ref().map(|v| v.to_string()),
            })
            .collect();

        let store = Arc::clone(&self.store);
        self.lock
            .execute("history-commit", async move {
                store.create_commit_with_changes(&commit, &rows)?;
                Ok(commit)
            })
            .await
            .map(|commit| {
                let short_hash = &commit.hash[..8.min(commit.hash.len())];
                tracing::info!(
                    hash = %short_hash,
                    author = %commit.author,
                    changes = input.changes.len(),
                    "commit created"
                );
                commit
            })
    }

    /// Convenience: chain a commit onto the newest commit in the log.
    pub async fn commit_chained(&self, mut input: NewCommit) -> WrenResult<Commit> {
        if input.parent_hash.is_none() {
            input.parent_hash = self.head()?.map(|c| c.hash);
        }
        self.commit(input).await
    }

    /// The newest commit, if any.
    pub fn head(&self) -> WrenResult<Option<Commit>> {
        Ok(self.store.list_commits(1)?.into_iter().next())
    }

    /// Commits ordered newest-first.
    pub fn history(&self, limit: usize) -> WrenResult<Vec<Commit>> {
        self.store.list_commits(limit)
    }

    /// Typed changes for a commit. Rows whose entity kind the current
    /// schema no longer knows are skipped with a warning.
    pub fn changes_for(&self, commit_hash: &str) -> WrenResult<Vec<Change>> {
        let rows = self.store.changes_for(commit_hash)?;
        Ok(rows.into_iter().filter_map(parse_change).collect())
    }

    /// Reconstruct entity state as of `hash` by replaying changes from the
    /// chain's root up to and including the target commit.
    ///
    /// Replay is deterministic: the same hash always yields the same
    /// snapshot. Changes referencing an unknown entity kind are skipped
    /// with a warning rather than failing the whole restore.
    pub fn restore_to(&self, hash: &str) -> WrenResult<EntitySnapshot> {
        let target = self
            .store
            .get_commit(hash)?
            .ok_or_else(|| WrenError::NotFound(format!("commit {hash}")))?;

        // Walk parent links back to the root, then replay oldest-first.
        let mut chain = vec![target];
        while let Some(parent_hash) = chain.last().and_then(|c| c.parent_hash.clone()) {
            let parent = self.store.get_commit(&parent_hash)?.ok_or_else(|| {
                WrenError::Storage(format!("dangling parent hash: {parent_hash}"))
            })?;
            chain.push(parent);
        }
        chain.reverse();

        let mut snapshot = EntitySnapshot::default();
        for commit in &chain {
            for row in self.store.changes_for(&commit.hash)? {
                apply_change(&mut snapshot, &row);
            }
        }
        Ok(snapshot)
    }

    /// Whether `fingerprint` is plausible for `author`: either already seen
    /// in the author's recent commits, or the author is still under the
    /// configured device limit.
    pub fn verify_device_consistency(
        &self,
        author: &str,
        fingerprint: &str,
    ) -> WrenResult<bool> {
        let recent = self
            .store
            .commits_by_author(author, self.config.device_check_depth)?;
        if recent.is_empty() {
            return Ok(true);
        }

        let mut known: Vec<&str> = Vec::new();
        for commit in &recent {
            if !commit.device_fingerprint.is_empty()
                && !known.contains(&commit.device_fingerprint.as_str())
            {
                known.push(&commit.device_fingerprint);
            }
        }

        Ok(known.contains(&fingerprint) || known.len() < self.config.max_devices_per_author)
    }
}

fn validate_change_shape(change: &NewChange) -> WrenResult<()> {
    match change.op {
        ChangeOp::Create => {
            if change.old_value.is_some() {
                return Err(WrenError::InvalidInput(
                    "create change must not carry an old value".into(),
                ));
            }
            if change.new_value.is_none() {
                return Err(WrenError::InvalidInput(
                    "create change requires a new value".into(),
                ));
            }
        }
        ChangeOp::Update => {
            if change.old_value.is_none() || change.new_value.is_none() {
                return Err(WrenError::InvalidInput(
                    "update change requires both old and new values".into(),
                ));
            }
        }
        ChangeOp::Delete => {
            if change.new_value.is_some() {
                return Err(WrenError::InvalidInput(
                    "delete change must not carry a new value".into(),
                ));
            }
            if change.old_value.is_none() {
                return Err(WrenError::InvalidInput(
                    "delete change requires an old value".into(),
                ));
            }
        }
    }
    Ok(())
}

/// Content hash covering the parent link, author, device, timestamp,
/// message, and the full change set. Including the parent makes chains
/// acyclic by construction.
fn commit_hash(input: &NewCommit, timestamp: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"wren.commit.v1\n");
    hasher.update(input.parent_hash.as_deref().unwrap_or("-").as_bytes());
    hasher.update(b"\n");
    hasher.update(input.author.as_bytes());
    hasher.update(b"\n");
    hasher.update(input.device_fingerprint.as_bytes());
    hasher.update(b"\n");
    hasher.update(timestamp.to_rfc3339().as_bytes());
    hasher.update(b"\n");
    hasher.update(input.message.as_bytes());
    hasher.update(b"\n");
    for change in &input.changes {
        hasher.update(change.entity.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(change.entity_id.as_bytes());
        hasher.update(b":");
        hasher.update(change.op.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(
            change
                .old_value
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_default()
                .as_bytes(),
        );
        hasher.update(b":");
        hasher.update(
            change
                .new_value
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_default()
                .as_bytes(),
        );
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn parse_change(row: RawChange) -> Option<Change> {
    let entity: EntityKind = match row.entity.parse() {
        Ok(kind) => kind,
        Err(_) => {
            tracing::warn!(
                commit = %row.commit_hash,
                entity = %row.entity,
                "skipping change with unknown entity kind"
            );
            return None;
        }
    };
    let op: ChangeOp = match row.op.parse() {
        Ok(op) => op,
        Err(_) => {
            tracing::warn!(commit = %row.commit_hash, op = %row.op, "skipping change with unknown op");
            return None;
        }
    };
    Some(Change {
        commit_hash: row.commit_hash,
        entity,
        entity_id: row.entity_id,
        op,
        description: row.description,
        old_value: row.old_value.and_then(|s| serde_json::from_str(&s).ok()),
        new_value: row.new_value.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

fn apply_change(snapshot: &mut EntitySnapshot, row: &RawChange) {
    let Ok(kind) = row.entity.parse::<EntityKind>() else {
        tracing::warn!(
            commit = %row.commit_hash,
            entity = %row.entity,
            "restore: skipping change for entity kind missing from current schema"
        );
        return;
    };
    let Ok(op) = row.op.parse::<ChangeOp>() else {
        tracing::warn!(commit = %row.commit_hash, op = %row.op, "restore: skipping unknown op");
        return;
    };

    let entities = snapshot.entities.entry(kind).or_default();
    match op {
        ChangeOp::Create | ChangeOp::Update => {
            let Some(value) = row
                .new_value
                .as_ref()
                .and_then(|s| serde_json::from_str(s).ok())
            else {
                tracing::warn!(commit = %row.commit_hash, "restore: change missing new value");
                return;
            };
            entities.insert(row.entity_id.clone(), value);
        }
        ChangeOp::Delete => {
            entities.remove(&row.entity_id);
        }
    }
}
