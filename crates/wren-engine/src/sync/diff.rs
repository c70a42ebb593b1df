//! Generic per-entity diff + resolve.
//!
//! The conflict/merge policy is written once over the `SyncEntity` seam and
//! instantiated per entity kind, rather than duplicated per domain object.
//! Winners are decided at entity granularity, never whole-document.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use wren_core::{Bill, Envelope, Transaction};

/// Implemented by every entity kind the sync engine reconciles.
pub trait SyncEntity: Clone {
    fn entity_id(&self) -> Uuid;
    fn modified_at(&self) -> DateTime<Utc>;
    fn same_content(&self, other: &Self) -> bool;
    /// Short human-readable handle for conflict prompts.
    fn label(&self) -> String;
}

impl SyncEntity for Envelope {
    fn entity_id(&self) -> Uuid {
        self.id
    }
    fn modified_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
    fn same_content(&self, other: &Self) -> bool {
        self == other
    }
    fn label(&self) -> String {
        format!("envelope '{}'", self.name)
    }
}

impl SyncEntity for Transaction {
    fn entity_id(&self) -> Uuid {
        self.id
    }
    fn modified_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
    fn same_content(&self, other: &Self) -> bool {
        self == other
    }
    fn label(&self) -> String {
        format!("transaction '{}'", self.description)
    }
}

impl SyncEntity for Bill {
    fn entity_id(&self) -> Uuid {
        self.id
    }
    fn modified_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
    fn same_content(&self, other: &Self) -> bool {
        self == other
    }
    fn label(&self) -> String {
        format!("bill '{}'", self.name)
    }
}

/// Two sides changed the same entity independently since the last agreed
/// sync point; only a human decision picks the winner.
#[derive(Debug, Clone)]
pub struct EntityConflict<T> {
    pub local: T,
    pub remote: T,
}

/// Outcome of diffing one entity kind.
#[derive(Debug, Clone)]
pub struct EntityDiff<T> {
    /// The merged set when no conflict blocks this kind.
    pub merged: Vec<T>,
    pub accepted_remote: usize,
    pub kept_local: usize,
    /// Entities present only on the remote, adopted locally.
    pub added_from_remote: usize,
    pub conflicts: Vec<EntityConflict<T>>,
}

impl<T: SyncEntity> EntityDiff<T> {
    pub fn conflict_labels(&self) -> Vec<String> {
        self.conflicts
            .iter()
            .map(|c| format!("{} edited on both sides", c.local.label()))
            .collect()
    }
}

/// Diff one entity kind between the local and remote snapshots.
///
/// An entity counts as "changed" when its modification time is after the
/// last agreed sync point, minus the configured clock-skew tolerance; with
/// no agreed point yet, every entity counts as changed. Changed on both
/// sides with differing content ⇒ conflict. Changed on one side ⇒ that
/// side wins (last-writer-wins at entity granularity). Present on only one
/// side ⇒ merged, never dropped.
pub fn diff_entities<T: SyncEntity>(
    local: &[T],
    remote: &[T],
    last_synced_at: Option<DateTime<Utc>>,
    skew: Duration,
) -> EntityDiff<T> {
    let changed = |entity: &T| -> bool {
        match last_synced_at {
            Some(ls) => entity.modified_at() + skew > ls,
            None => true,
        }
    };

    let local_by_id: BTreeMap<Uuid, &T> = local.iter().map(|e| (e.entity_id(), e)).collect();
    let remote_by_id: BTreeMap<Uuid, &T> = remote.iter().map(|e| (e.entity_id(), e)).collect();

    let mut diff = EntityDiff {
        merged: Vec::new(),
        accepted_remote: 0,
        kept_local: 0,
        added_from_remote: 0,
        conflicts: Vec::new(),
    };

    for (&id, &ours) in &local_by_id {
        match remote_by_id.get(&id).copied() {
            None => {
                // Local-only: keep. Snapshot absence is not a deletion
                // signal; deletions flow through the commit log.
                diff.merged.push(ours.clone());
            }
            Some(theirs) if ours.same_content(theirs) => {
                diff.merged.push(ours.clone());
            }
            Some(theirs) => {
                let ours_changed = changed(ours);
                let theirs_changed = changed(theirs);
                if ours_changed && theirs_changed {
                    diff.conflicts.push(EntityConflict {
                        local: ours.clone(),
                        remote: theirs.clone(),
                    });
                } else if theirs_changed {
                    diff.merged.push(theirs.clone());
                    diff.accepted_remote += 1;
                } else if ours_changed {
                    diff.merged.push(ours.clone());
                    diff.kept_local += 1;
                } else {
                    // Neither side changed since the sync point yet the
                    // content differs: newer timestamp wins outside the
                    // skew window, conflict inside it.
                    let gap = (ours.modified_at() - theirs.modified_at())
                        .num_milliseconds()
                        .abs();
                    if gap <= skew.num_milliseconds() {
                        diff.conflicts.push(EntityConflict {
                            local: ours.clone(),
                            remote: theirs.clone(),
                        });
                    } else if theirs.modified_at() > ours.modified_at() {
                        diff.merged.push(theirs.clone());
                        diff.accepted_remote += 1;
                    } else {
                        diff.merged.push(ours.clone());
                        diff.kept_local += 1;
                    }
                }
            }
        }
    }

    for (&id, &theirs) in &remote_by_id {
        if !local_by_id.contains_key(&id) {
            diff.merged.push(theirs.clone());
            diff.added_from_remote += 1;
        }
    }

    diff
}
