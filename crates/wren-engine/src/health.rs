//! Rolling-window health tracking for sync attempts.
//!
//! A fixed-capacity ring buffer of recent attempts keeps memory bounded and
//! the derived status reactive to recent behavior rather than all-time
//! history.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::HealthConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Slow,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRecord {
    pub id: Uuid,
    pub kind: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthMetrics {
    pub total_attempts: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub consecutive_failures: u32,
    pub average_sync_ms: f64,
    /// Failure fraction over the rolling window (0.0..1.0).
    pub error_rate: f64,
    pub last_success_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub issues: Vec<String>,
    pub metrics: HealthMetrics,
    pub recent_syncs: Vec<SyncRecord>,
}

struct Inner {
    recent: VecDeque<SyncRecord>,
    in_flight: Option<SyncRecord>,
    total_attempts: u64,
    successful_syncs: u64,
    failed_syncs: u64,
    consecutive_failures: u32,
    last_success_at: Option<DateTime<Utc>>,
}

pub struct SyncHealthMonitor {
    config: HealthConfig,
    inner: Mutex<Inner>,
}

impl SyncHealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                recent: VecDeque::new(),
                in_flight: None,
                total_attempts: 0,
                successful_syncs: 0,
                failed_syncs: 0,
                consecutive_failures: 0,
                last_success_at: None,
            }),
        }
    }

    /// Begin tracking one sync attempt. An attempt still in flight when a
    /// new one starts is recorded as failed (it never finished).
    pub fn record_sync_start(&self, kind: &str) -> Uuid {
        let mut inner = self.lock();
        if let Some(mut orphan) = inner.in_flight.take() {
            tracing::warn!(sync_id = %orphan.id, "previous sync never finished; recording as failed");
            orphan.finished_at = Some(Utc::now());
            orphan.success = Some(false);
            orphan.error = Some("sync attempt abandoned".into());
            Self::finish(&mut inner, orphan, &self.config);
        }

        let record = SyncRecord {
            id: Uuid::now_v7(),
            kind: kind.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            success: None,
            error: None,
            duration_ms: None,
        };
        let id = record.id;
        inner.total_attempts += 1;
        inner.in_flight = Some(record);
        tracing::debug!(sync_id = %id, kind, "sync attempt started");
        id
    }

    /// Finish the attempt started with `record_sync_start`. Unknown ids are
    /// counted as orphaned failures so nothing disappears silently.
    pub fn record_sync_end(&self, id: Uuid, success: bool, error: Option<&str>) {
        let mut inner = self.lock();
        let Some(current) = inner.in_flight.take() else {
            if !success {
                inner.failed_syncs += 1;
                inner.consecutive_failures += 1;
            }
            tracing::warn!(sync_id = %id, "sync end for unknown attempt");
            return;
        };
        if current.id != id {
            tracing::warn!(sync_id = %id, current = %current.id, "sync end id mismatch");
            inner.in_flight = Some(current);
            if !success {
                inner.failed_syncs += 1;
                inner.consecutive_failures += 1;
            }
            return;
        }

        let mut record = current;
        let finished = Utc::now();
        record.duration_ms = Some((finished - record.started_at).num_milliseconds());
        record.finished_at = Some(finished);
        record.success = Some(success);
        record.error = error.map(|e| e.to_string());

        if success {
            tracing::debug!(sync_id = %id, duration_ms = record.duration_ms, "sync succeeded");
        } else {
            tracing::warn!(sync_id = %id, error, "sync failed");
        }
        Self::finish(&mut inner, record, &self.config);
    }

    fn finish(inner: &mut Inner, record: SyncRecord, config: &HealthConfig) {
        match record.success {
            Some(true) => {
                inner.successful_syncs += 1;
                inner.consecutive_failures = 0;
                inner.last_success_at = record.finished_at;
            }
            _ => {
                inner.failed_syncs += 1;
                inner.consecutive_failures += 1;
            }
        }
        inner.recent.push_front(record);
        while inner.recent.len() > config.window {
            inner.recent.pop_back();
        }
    }

    pub fn metrics(&self) -> HealthMetrics {
        let inner = self.lock();
        Self::metrics_of(&inner)
    }

    fn metrics_of(inner: &Inner) -> HealthMetrics {
        let finished: Vec<&SyncRecord> = inner
            .recent
            .iter()
            .filter(|r| r.duration_ms.is_some())
            .collect();
        let average_sync_ms = if finished.is_empty() {
            0.0
        } else {
            finished
                .iter()
                .filter_map(|r| r.duration_ms)
                .sum::<i64>() as f64
                / finished.len() as f64
        };
        let windowed_failures = finished
            .iter()
            .filter(|r| r.success == Some(false))
            .count();
        let error_rate = if finished.is_empty() {
            0.0
        } else {
            windowed_failures as f64 / finished.len() as f64
        };

        HealthMetrics {
            total_attempts: inner.total_attempts,
            successful_syncs: inner.successful_syncs,
            failed_syncs: inner.failed_syncs,
            consecutive_failures: inner.consecutive_failures,
            average_sync_ms,
            error_rate,
            last_success_at: inner.last_success_at,
        }
    }

    /// Derive the coarse status from the rolling window. Severity wins:
    /// unhealthy > degraded > slow > healthy.
    pub fn health_status(&self) -> HealthStatus {
        let inner = self.lock();
        let metrics = Self::metrics_of(&inner);

        let mut status = HealthState::Healthy;
        let mut issues = Vec::new();

        if metrics.average_sync_ms > self.config.slow_sync_ms as f64 {
            status = HealthState::Slow;
            issues.push(format!(
                "slow sync: {:.0}ms average",
                metrics.average_sync_ms
            ));
        }
        if metrics.error_rate > self.config.error_rate_threshold {
            status = HealthState::Degraded;
            issues.push(format!(
                "high error rate: {:.1}%",
                metrics.error_rate * 100.0
            ));
        }
        if metrics.consecutive_failures >= self.config.consecutive_failure_threshold {
            status = HealthState::Unhealthy;
            issues.push(format!(
                "{} consecutive failures",
                metrics.consecutive_failures
            ));
        }

        HealthStatus {
            status,
            issues,
            metrics,
            recent_syncs: inner.recent.iter().take(10).cloned().collect(),
        }
    }

    /// Human-readable hints derived from the same metrics.
    pub fn recommendations(&self) -> Vec<String> {
        let status = self.health_status();
        let mut out = Vec::new();
        if status.status == HealthState::Unhealthy {
            out.push("check network connection stability".to_string());
            out.push("consider a manual sync once connectivity returns".to_string());
        }
        if status.metrics.average_sync_ms > 15_000.0 {
            out.push("large dataset detected; consider archiving old transactions".to_string());
        }
        if status.metrics.error_rate > 0.1 {
            out.push("high error rate; verify the remote store is reachable".to_string());
        }
        out
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        *inner = Inner {
            recent: VecDeque::new(),
            in_flight: None,
            total_attempts: 0,
            successful_syncs: 0,
            failed_syncs: 0,
            consecutive_failures: 0,
            last_success_at: None,
        };
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}
