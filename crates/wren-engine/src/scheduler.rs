//! Debounced sync scheduling.
//!
//! Mutations arrive in bursts (a paycheck distribution touches a dozen
//! envelopes); the scheduler coalesces them into one sync cycle after a
//! quiet window. High-priority changes use a shorter window, and critical
//! ones can skip the wait entirely.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;

use wren_core::WrenResult;

use crate::config::SyncConfig;
use crate::sync::SyncEngine;

/// How urgently a scheduled sync should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePriority {
    Normal,
    High,
}

/// The thing the scheduler drives. Split out so the loop is testable
/// without a full engine.
#[async_trait]
pub trait SyncRunner: Send + Sync {
    async fn run_sync(&self) -> WrenResult<()>;
}

#[async_trait]
impl SyncRunner for SyncEngine {
    async fn run_sync(&self) -> WrenResult<()> {
        self.sync_cycle().await.map(|_| ())
    }
}

pub struct SyncScheduler {
    runner: Arc<dyn SyncRunner>,
    debounce: Duration,
    high_priority_debounce: Duration,
    deadline: Mutex<Option<Instant>>,
    changed: Notify,
}

impl SyncScheduler {
    pub fn new(runner: Arc<dyn SyncRunner>, config: &SyncConfig) -> Self {
        Self {
            runner,
            debounce: Duration::from_millis(config.debounce_ms),
            high_priority_debounce: Duration::from_millis(config.high_priority_debounce_ms),
            deadline: Mutex::new(None),
            changed: Notify::new(),
        }
    }

    /// Schedule a sync after the debounce window. Another call before the
    /// window elapses replaces the deadline, so bursts coalesce.
    pub fn schedule(&self, priority: SchedulePriority) {
        let window = match priority {
            SchedulePriority::Normal => self.debounce,
            SchedulePriority::High => self.high_priority_debounce,
        };
        *self.lock_deadline() = Some(Instant::now() + window);
        tracing::debug!(?priority, window_ms = window.as_millis() as u64, "sync scheduled");
        self.changed.notify_one();
    }

    /// Skip the debounce for critical changes (paychecks, imports).
    pub fn trigger_now(&self, reason: &str) {
        tracing::info!(reason, "critical change; triggering immediate sync");
        *self.lock_deadline() = Some(Instant::now());
        self.changed.notify_one();
    }

    /// Whether a sync is currently scheduled.
    pub fn is_scheduled(&self) -> bool {
        self.lock_deadline().is_some()
    }

    /// Await deadlines and drive the runner until shutdown.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        tracing::info!(
            debounce_ms = self.debounce.as_millis() as u64,
            "sync scheduler started"
        );
        loop {
            let next = *self.lock_deadline();
            match next {
                None => {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = self.changed.notified() => {}
                    }
                }
                Some(at) if at <= Instant::now() => {
                    *self.lock_deadline() = None;
                    if let Err(e) = self.runner.run_sync().await {
                        tracing::error!(error = %e, "scheduled sync failed");
                    }
                }
                Some(at) => {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = self.changed.notified() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
            }
        }
        tracing::info!("sync scheduler shutting down");
    }

    fn lock_deadline(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.deadline.lock().unwrap_or_else(|p| p.into_inner())
    }
}
