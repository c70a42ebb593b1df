//! The sync orchestrator.
//!
//! Each cycle reads a consistent local snapshot under the shared lock,
//! fetches the remote counterpart outside it, diffs per entity, and applies
//! the accepted result in one storage transaction. Divergent two-sided
//! edits block on the conflict arbiter; remote I/O failures defer work to
//! the offline queue and never escape this module.

pub mod diff;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use wren_core::*;
use wren_storage::BudgetStore;

use crate::backup::BackupService;
use crate::config::EngineConfig;
use crate::health::SyncHealthMonitor;
use crate::lock::SyncLock;
use crate::queue::{NewRequest, Priority, QueuedRequest, RequestQueue, RequestTransport};
use diff::{diff_entities, EntityDiff};

/// Where a sync cycle currently is, readable for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    FetchingLocal,
    FetchingRemote,
    Diffing,
    AwaitingResolution,
    Applying,
}

/// How a sync cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing to reconcile beyond pushing local state.
    UpToDate,
    /// Per-entity merge applied locally and pushed.
    Merged {
        accepted_remote: usize,
        kept_local: usize,
        added_from_remote: usize,
    },
    /// Conflict resolved by adopting the remote snapshot.
    RemoteAdopted,
    /// Conflict resolved keep-mine; local state requeued for push.
    LocalKept,
    /// Remote unreachable; outstanding work parked on the offline queue.
    Deferred { reason: String },
}

pub struct SyncEngine {
    budget_id: String,
    store: Arc<BudgetStore>,
    remote: Arc<dyn RemoteStore>,
    arbiter: Arc<dyn ConflictArbiter>,
    queue: Arc<RequestQueue>,
    health: Arc<SyncHealthMonitor>,
    lock: Arc<SyncLock>,
    backup: BackupService,
    config: EngineConfig,
    phase: Mutex<CyclePhase>,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        budget_id: &str,
        store: Arc<BudgetStore>,
        remote: Arc<dyn RemoteStore>,
        arbiter: Arc<dyn ConflictArbiter>,
        queue: Arc<RequestQueue>,
        health: Arc<SyncHealthMonitor>,
        lock: Arc<SyncLock>,
        config: EngineConfig,
    ) -> Self {
        let backup = BackupService::new(
            Arc::clone(&store),
            config.backup.clone(),
            config.identity.clone(),
        );
        Self {
            budget_id: budget_id.to_string(),
            store,
            remote,
            arbiter,
            queue,
            health,
            lock,
            backup,
            config,
            phase: Mutex::new(CyclePhase::Idle),
        }
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_phase(&self, phase: CyclePhase) {
        *self.phase.lock().unwrap_or_else(|p| p.into_inner()) = phase;
    }

    /// Run one full sync cycle. Conflicts block on the arbiter; network
    /// failures surface as `Deferred`, never as errors.
    pub async fn sync_cycle(&self) -> WrenResult<SyncOutcome> {
        let health_id = self.health.record_sync_start("cloud_sync");

        if let Err(e) = self.backup.create_pre_sync("cloud_sync") {
            tracing::warn!(error = %e, "pre-sync backup failed; continuing");
        }

        let result = self.run_cycle().await;
        self.set_phase(CyclePhase::Idle);

        match &result {
            Ok(SyncOutcome::Deferred { reason }) => {
                self.health.record_sync_end(health_id, false, Some(reason));
            }
            Ok(outcome) => {
                tracing::info!(?outcome, "sync cycle completed");
                self.health.record_sync_end(health_id, true, None);
            }
            Err(e) => {
                let category = categorize_error(e);
                self.health
                    .record_sync_end(health_id, false, Some(&format!("{category}: {e}")));
            }
        }
        result
    }

    /// A consistent read-only view of local state, guarded against
    /// concurrent local commits.
    pub async fn fetch_local_snapshot(&self) -> WrenResult<SyncSnapshot> {
        let store = Arc::clone(&self.store);
        let author = self.config.identity.author.clone();
        let fingerprint = self.config.identity.device_fingerprint.clone();
        self.lock
            .execute("sync-fetch-local", async move {
                store.load_snapshot(&author, &fingerprint)
            })
            .await
    }

    async fn run_cycle(&self) -> WrenResult<SyncOutcome> {
        self.set_phase(CyclePhase::FetchingLocal);
        let local = self.fetch_local_snapshot().await?;

        self.set_phase(CyclePhase::FetchingRemote);
        let remote = match self.remote.fetch(&self.budget_id).await {
            Ok(remote) => remote,
            Err(WrenError::Network(e)) => {
                tracing::warn!(error = %e, "remote fetch failed; deferring push");
                self.enqueue_push(&local).await?;
                return Ok(SyncOutcome::Deferred {
                    reason: format!("network: {e}"),
                });
            }
            Err(e) => return Err(e),
        };

        let Some(remote) = remote else {
            // Nothing in the cloud yet: first push for this budget.
            self.set_phase(CyclePhase::Applying);
            return self.push_or_defer(&local, SyncOutcome::UpToDate).await;
        };

        self.set_phase(CyclePhase::Diffing);
        let last_synced = self.last_synced_at()?;
        let skew = Duration::milliseconds(self.config.sync.max_clock_skew_ms as i64);
        let envelopes = diff_entities(&local.envelopes, &remote.envelopes, last_synced, skew);
        let transactions =
            diff_entities(&local.transactions, &remote.transactions, last_synced, skew);
        let bills = diff_entities(&local.bills, &remote.bills, last_synced, skew);

        let conflict_count =
            envelopes.conflicts.len() + transactions.conflicts.len() + bills.conflicts.len();
        if conflict_count > 0 {
            return self
                .resolve_conflicts(&local, &remote, &envelopes, &transactions, &bills)
                .await;
        }

        // No conflict: apply the whole accepted diff in one transaction,
        // then push the merged result.
        self.set_phase(CyclePhase::Applying);
        let outcome = SyncOutcome::Merged {
            accepted_remote: envelopes.accepted_remote
                + transactions.accepted_remote
                + bills.accepted_remote,
            kept_local: envelopes.kept_local + transactions.kept_local + bills.kept_local,
            added_from_remote: envelopes.added_from_remote
                + transactions.added_from_remote
                + bills.added_from_remote,
        };
        let merged = self.merge_snapshot(&local, &remote, envelopes, transactions, bills);
        self.apply_locally(merged.clone()).await?;
        self.set_last_synced(Utc::now())?;
        self.push_or_defer(&merged, outcome).await
    }

    async fn resolve_conflicts(
        &self,
        local: &SyncSnapshot,
        remote: &SyncSnapshot,
        envelopes: &EntityDiff<Envelope>,
        transactions: &EntityDiff<Transaction>,
        bills: &EntityDiff<Bill>,
    ) -> WrenResult<SyncOutcome> {
        self.set_phase(CyclePhase::AwaitingResolution);
        let mut conflicts = envelopes.conflict_labels();
        conflicts.extend(transactions.conflict_labels());
        conflicts.extend(bills.conflict_labels());

        let prompt = ConflictPrompt {
            cloud_user: remote.author.clone(),
            local_summary: local.summary(),
            remote_summary: remote.summary(),
            conflicts,
            detected_at: Utc::now(),
        };
        tracing::info!(
            cloud_user = %remote.author,
            conflicts = prompt.conflicts.len(),
            "conflict detected; awaiting resolution"
        );

        match self.arbiter.on_conflict(prompt).await? {
            ConflictChoice::LoadTheirs => {
                self.set_phase(CyclePhase::Applying);
                self.apply_locally(remote.clone()).await?;
                self.set_last_synced(Utc::now())?;
                tracing::info!("conflict resolved: remote snapshot adopted");
                Ok(SyncOutcome::RemoteAdopted)
            }
            ConflictChoice::KeepMine => {
                // Local wins; the remote snapshot is discarded and our
                // state goes back out through the queue.
                self.enqueue_push(local).await?;
                tracing::info!("conflict resolved: local state kept and requeued for push");
                Ok(SyncOutcome::LocalKept)
            }
        }
    }

    /// Apply a snapshot to the local tables in one transaction, under the
    /// shared lock: either the whole accepted diff lands, or none of it.
    async fn apply_locally(&self, snapshot: SyncSnapshot) -> WrenResult<()> {
        let store = Arc::clone(&self.store);
        self.lock
            .execute("sync-apply", async move { store.replace_all(&snapshot) })
            .await
    }

    fn merge_snapshot(
        &self,
        local: &SyncSnapshot,
        remote: &SyncSnapshot,
        envelopes: EntityDiff<Envelope>,
        transactions: EntityDiff<Transaction>,
        bills: EntityDiff<Bill>,
    ) -> SyncSnapshot {
        // Budget-level totals follow the side modified most recently;
        // entity winners were already decided per entity.
        let (unassigned_cash, actual_balance) = if remote.last_modified > local.last_modified {
            (remote.unassigned_cash, remote.actual_balance)
        } else {
            (local.unassigned_cash, local.actual_balance)
        };
        SyncSnapshot {
            author: self.config.identity.author.clone(),
            device_fingerprint: self.config.identity.device_fingerprint.clone(),
            envelopes: envelopes.merged,
            transactions: transactions.merged,
            bills: bills.merged,
            unassigned_cash,
            actual_balance,
            last_modified: Utc::now(),
            sync_version: local.sync_version.max(remote.sync_version) + 1,
        }
    }

    async fn push_or_defer(
        &self,
        snapshot: &SyncSnapshot,
        success: SyncOutcome,
    ) -> WrenResult<SyncOutcome> {
        match self.remote.push(&self.budget_id, snapshot).await {
            Ok(()) => {
                self.set_last_synced(Utc::now())?;
                Ok(success)
            }
            Err(WrenError::Network(e)) => {
                tracing::warn!(error = %e, "remote push failed; deferring to offline queue");
                self.enqueue_push(snapshot).await?;
                Ok(SyncOutcome::Deferred {
                    reason: format!("network: {e}"),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Park a snapshot push on the offline queue. The idempotency key is
    /// derived from the budget and snapshot identity, so repeated deferrals
    /// of the same state collapse into one queued request.
    async fn enqueue_push(&self, snapshot: &SyncSnapshot) -> WrenResult<()> {
        let request_id = format!(
            "push-{}-{}",
            self.budget_id,
            snapshot.last_modified.timestamp_millis()
        );
        let request = NewRequest::new(
            &request_id,
            "PUT",
            &format!("/budgets/{}/snapshot", self.budget_id),
            serde_json::to_value(snapshot)?,
        )
        .with_priority(Priority::High);
        self.queue.enqueue(request).await?;
        Ok(())
    }

    fn last_synced_at(&self) -> WrenResult<Option<DateTime<Utc>>> {
        let Some(raw) = self.store.sync_state_get("last_synced_at")? else {
            return Ok(None);
        };
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| WrenError::Storage(format!("parse last_synced_at: {e}")))
    }

    fn set_last_synced(&self, at: DateTime<Utc>) -> WrenResult<()> {
        self.store.sync_state_set("last_synced_at", &at.to_rfc3339())
    }
}

/// Bucket an error for health metadata.
fn categorize_error(e: &WrenError) -> &'static str {
    match e {
        WrenError::Network(_) => "network",
        WrenError::Storage(_) | WrenError::Transaction(_) => "storage",
        WrenError::InvalidInput(_) | WrenError::Serialization(_) => "validation",
        WrenError::LockTimeout { .. } => "lock",
        WrenError::QueueExhausted { .. } => "queue",
        _ => "unknown",
    }
}

/// Queue transport that replays deferred snapshot pushes against the
/// remote store.
pub struct RemotePushTransport {
    budget_id: String,
    remote: Arc<dyn RemoteStore>,
}

impl RemotePushTransport {
    pub fn new(budget_id: &str, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            budget_id: budget_id.to_string(),
            remote,
        }
    }
}

#[async_trait]
impl RequestTransport for RemotePushTransport {
    async fn execute(&self, request: &QueuedRequest) -> WrenResult<()> {
        let snapshot: SyncSnapshot = serde_json::from_value(request.body.clone())?;
        self.remote.push(&self.budget_id, &snapshot).await
    }
}
