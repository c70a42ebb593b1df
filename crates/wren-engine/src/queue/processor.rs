//! Replays queued requests against the network when connectivity allows.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;

use wren_core::WrenResult;

use super::store::RequestQueue;
use super::{QueuedRequest, RequestStatus};
use crate::config::EngineConfig;
use crate::lock::SyncLock;

/// Executes one outbound request. `WrenError::Network` is retryable; any
/// other error parks the request as failed.
#[async_trait]
pub trait RequestTransport: Send + Sync {
    async fn execute(&self, request: &QueuedRequest) -> WrenResult<()>;
}

/// Read-only queue surface polled by the UI.
#[derive(Debug, Clone, Serialize)]
pub struct QueueReport {
    pub is_online: bool,
    pub pending_count: usize,
    pub failed_count: usize,
    pub processing_count: usize,
    pub requests: Vec<QueuedRequest>,
}

pub struct QueueProcessor {
    queue: Arc<RequestQueue>,
    transport: Arc<dyn RequestTransport>,
    /// The queue's own lock namespace, so drain never contends with commits.
    lock: SyncLock,
    online: AtomicBool,
    poll_interval: Duration,
}

impl QueueProcessor {
    pub fn new(
        queue: Arc<RequestQueue>,
        transport: Arc<dyn RequestTransport>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            queue,
            transport,
            lock: SyncLock::new(
                "request-queue",
                Duration::from_millis(config.lock.acquire_timeout_ms),
            ),
            online: AtomicBool::new(true),
            poll_interval: Duration::from_millis(config.queue.poll_interval_ms),
        }
    }

    /// Clear crash leftovers, then drain anything already due.
    pub async fn initialize(&self) -> WrenResult<()> {
        let reset = self.queue.reset_stale_processing().await?;
        tracing::info!(
            stale_reset = reset,
            is_online = self.is_online(),
            "request queue processor initialized"
        );
        if self.is_online() {
            self.process_queue().await?;
        }
        Ok(())
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Network transition. Coming online triggers an immediate drain;
    /// going offline halts processing so retries don't burn attempts
    /// against a dead link.
    pub async fn set_online(&self, online: bool) -> WrenResult<()> {
        let was = self.online.swap(online, Ordering::SeqCst);
        if online && !was {
            tracing::info!("device came online; draining request queue");
            self.process_queue().await?;
        } else if !online && was {
            tracing::info!("device went offline; queue processing halted");
        }
        Ok(())
    }

    /// Attempt every ready request in priority order, FIFO within a tier.
    /// Serialized on the queue's own lock; checks the online flag between
    /// attempts (cancellation is cooperative, never mid-request).
    /// Returns the number of requests that replayed successfully.
    pub async fn process_queue(&self) -> WrenResult<usize> {
        if !self.is_online() {
            return Ok(0);
        }

        let queue = Arc::clone(&self.queue);
        let transport = Arc::clone(&self.transport);
        let online = &self.online;
        self.lock
            .execute("process-queue", async move {
                let ready = queue.ready_requests(Utc::now()).await?;
                if ready.is_empty() {
                    return Ok(0);
                }
                tracing::info!(ready = ready.len(), "processing request queue");

                let mut replayed = 0usize;
                for request in ready {
                    if !online.load(Ordering::SeqCst) {
                        tracing::info!("went offline mid-drain; stopping between requests");
                        break;
                    }

                    // The remote may already have seen this idempotency key
                    // through an earlier drain that died before deleting the
                    // row. Confirm and skip instead of re-sending.
                    if queue.completed_contains(&request.request_id).await? {
                        queue.complete(request.id).await?;
                        continue;
                    }

                    queue.mark_processing(request.id).await?;
                    match transport.execute(&request).await {
                        Ok(()) => {
                            queue.complete(request.id).await?;
                            replayed += 1;
                        }
                        Err(e) => {
                            let status = queue
                                .fail(request.id, &e.to_string(), e.is_retryable())
                                .await?;
                            if status == RequestStatus::Failed {
                                tracing::error!(
                                    request_id = %request.request_id,
                                    "request moved to failed after replay attempt"
                                );
                            }
                        }
                    }
                }
                Ok(replayed)
            })
            .await
    }

    /// Poll loop; runs until the shutdown signal.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        tracing::info!(
            poll_ms = self.poll_interval.as_millis() as u64,
            "queue processor started"
        );
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("queue processor shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    if let Err(e) = self.process_queue().await {
                        tracing::error!(error = %e, "queue processing error");
                    }
                }
            }
        }
    }

    /// The pull-based inspection surface polled by the UI.
    pub async fn status_report(&self) -> WrenResult<QueueReport> {
        let status = self.queue.status().await?;
        let processing = self
            .queue
            .count_with_status(RequestStatus::Processing)
            .await?;
        let requests = self.queue.list(100).await?;
        Ok(QueueReport {
            is_online: self.is_online(),
            pending_count: status.pending_count,
            failed_count: status.failed_count,
            processing_count: processing,
            requests,
        })
    }
}
