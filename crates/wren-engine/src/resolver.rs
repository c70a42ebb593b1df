//! Manual conflict resolution.
//!
//! Divergent local/remote state is never auto-merged: the resolver parks
//! one prompt at a time and waits for a human (or an explicit policy
//! upstream) to pick a side. If a newer conflict arrives while one is
//! pending, the newer one supersedes it: the superseded cycle resolves as
//! keep-mine, the only default that cannot drop data without a decision.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::oneshot;

use wren_core::{ConflictArbiter, ConflictChoice, ConflictPrompt, WrenError, WrenResult};

struct PendingConflict {
    prompt: ConflictPrompt,
    decision: oneshot::Sender<ConflictChoice>,
}

#[derive(Default)]
pub struct ManualConflictResolver {
    pending: Mutex<Option<PendingConflict>>,
}

impl ManualConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The prompt currently awaiting a decision, for UI polling.
    pub fn pending(&self) -> Option<ConflictPrompt> {
        self.lock().as_ref().map(|p| p.prompt.clone())
    }

    /// Adopt the remote snapshot, discarding local pending changes for the
    /// affected scope.
    pub fn resolve_load_theirs(&self) -> WrenResult<()> {
        self.resolve(ConflictChoice::LoadTheirs)
    }

    /// Keep the local state; the orchestrator re-pushes it.
    pub fn resolve_keep_mine(&self) -> WrenResult<()> {
        self.resolve(ConflictChoice::KeepMine)
    }

    /// Dismissing the prompt keeps local data.
    pub fn dismiss(&self) -> WrenResult<()> {
        self.resolve_keep_mine()
    }

    fn resolve(&self, choice: ConflictChoice) -> WrenResult<()> {
        let Some(pending) = self.lock().take() else {
            return Err(WrenError::NotFound("no pending conflict".into()));
        };
        tracing::info!(
            cloud_user = %pending.prompt.cloud_user,
            ?choice,
            "conflict resolved"
        );
        // A dropped receiver means the waiting cycle is gone; nothing to do.
        let _ = pending.decision.send(choice);
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<PendingConflict>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl ConflictArbiter for ManualConflictResolver {
    async fn on_conflict(&self, prompt: ConflictPrompt) -> WrenResult<ConflictChoice> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.lock();
            if let Some(superseded) = pending.take() {
                tracing::warn!(
                    cloud_user = %superseded.prompt.cloud_user,
                    "conflict superseded by a newer one; resolving keep-mine"
                );
                let _ = superseded.decision.send(ConflictChoice::KeepMine);
            }
            *pending = Some(PendingConflict {
                prompt: prompt.clone(),
                decision: tx,
            });
        }
        tracing::info!(
            cloud_user = %prompt.cloud_user,
            conflicts = prompt.conflicts.len(),
            "conflict awaiting resolution"
        );

        match rx.await {
            Ok(choice) => Ok(choice),
            Err(_) => {
                tracing::warn!("conflict decision channel closed; keeping local data");
                Ok(ConflictChoice::KeepMine)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;
    use wren_core::SyncSummary;

    fn prompt(cloud_user: &str) -> ConflictPrompt {
        let summary = SyncSummary {
            envelopes: 1,
            transactions: 0,
            bills: 0,
            last_modified: Utc::now(),
            sync_version: 1,
        };
        ConflictPrompt {
            cloud_user: cloud_user.to_string(),
            local_summary: summary.clone(),
            remote_summary: summary,
            conflicts: vec!["envelope 'Groceries' edited on both devices".into()],
            detected_at: Utc::now(),
        }
    }

    async fn wait_for_pending(resolver: &ManualConflictResolver) {
        while resolver.pending().is_none() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn load_theirs_resolves_waiting_cycle() {
        let resolver = Arc::new(ManualConflictResolver::new());
        let waiter = {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move { resolver.on_conflict(prompt("blair")).await })
        };

        wait_for_pending(&resolver).await;
        assert_eq!(resolver.pending().unwrap().cloud_user, "blair");

        resolver.resolve_load_theirs().unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), ConflictChoice::LoadTheirs);
        assert!(resolver.pending().is_none());
    }

    #[tokio::test]
    async fn dismiss_keeps_local() {
        let resolver = Arc::new(ManualConflictResolver::new());
        let waiter = {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move { resolver.on_conflict(prompt("blair")).await })
        };

        wait_for_pending(&resolver).await;
        resolver.dismiss().unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), ConflictChoice::KeepMine);
    }

    #[tokio::test]
    async fn newer_conflict_supersedes_pending_one() {
        let resolver = Arc::new(ManualConflictResolver::new());
        let first = {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move { resolver.on_conflict(prompt("first")).await })
        };
        wait_for_pending(&resolver).await;

        let second = {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move { resolver.on_conflict(prompt("second")).await })
        };

        // The superseded waiter resolves immediately as keep-mine.
        assert_eq!(first.await.unwrap().unwrap(), ConflictChoice::KeepMine);

        // The newer prompt is the one shown now.
        while resolver.pending().map(|p| p.cloud_user) != Some("second".into()) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        resolver.resolve_load_theirs().unwrap();
        assert_eq!(second.await.unwrap().unwrap(), ConflictChoice::LoadTheirs);
    }

    #[tokio::test]
    async fn resolving_without_pending_is_not_found() {
        let resolver = ManualConflictResolver::new();
        assert!(matches!(
            resolver.resolve_keep_mine().unwrap_err(),
            WrenError::NotFound(_)
        ));
    }
}
