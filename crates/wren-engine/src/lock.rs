//! Named, queued, timeout-bounded cooperative lock.
//!
//! Serializes every operation that must not interleave with another: a
//! local commit versus a remote snapshot apply, for example. Waiters form a
//! strict FIFO queue; a release hands the lock to the next waiter before
//! returning to the releaser. Holders are expected to be short-lived (DB
//! writes); a long-held lock is itself a bug signal.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use wren_core::{WrenError, WrenResult};

pub struct SyncLock {
    name: String,
    default_timeout: Duration,
    state: Mutex<LockState>,
}

struct LockState {
    holder: Option<Holder>,
    queue: VecDeque<Waiter>,
    next_ticket: u64,
}

struct Holder {
    ticket: u64,
    operation: String,
}

struct Waiter {
    ticket: u64,
    operation: String,
    grant: oneshot::Sender<()>,
}

/// Releases the lock when dropped, so `execute` cannot leak a hold on any
/// exit path.
struct ReleaseGuard<'a>(&'a SyncLock);

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

impl SyncLock {
    pub fn new(name: &str, default_timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            default_timeout,
            state: Mutex::new(LockState {
                holder: None,
                queue: VecDeque::new(),
                next_ticket: 0,
            }),
        }
    }

    /// Acquire with the lock's default timeout.
    pub async fn acquire(&self, operation: &str) -> WrenResult<()> {
        self.acquire_timeout(operation, self.default_timeout).await
    }

    /// Acquire within `timeout`, failing loudly with `LockTimeout` rather
    /// than deadlocking. Grant order among waiters is strict FIFO; a new
    /// caller never overtakes an already-queued waiter.
    pub async fn acquire_timeout(&self, operation: &str, timeout: Duration) -> WrenResult<()> {
        let (ticket, rx) = {
            let mut state = self.lock_state();
            if state.holder.is_none() && state.queue.is_empty() {
                let ticket = state.next_ticket;
                state.next_ticket += 1;
                state.holder = Some(Holder {
                    ticket,
                    operation: operation.to_string(),
                });
                tracing::debug!(lock = %self.name, operation, "lock acquired");
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.queue.push_back(Waiter {
                ticket,
                operation: operation.to_string(),
                grant: tx,
            });
            tracing::debug!(
                lock = %self.name,
                operation,
                queue_depth = state.queue.len(),
                "lock contended, waiting"
            );
            (ticket, rx)
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => {
                tracing::debug!(lock = %self.name, operation, "lock acquired after wait");
                Ok(())
            }
            Ok(Err(_)) => Err(WrenError::Internal(format!(
                "lock '{}' wait channel closed",
                self.name
            ))),
            Err(_) => {
                let mut state = self.lock_state();
                if let Some(pos) = state.queue.iter().position(|w| w.ticket == ticket) {
                    state.queue.remove(pos);
                    tracing::warn!(
                        lock = %self.name,
                        operation,
                        waited_ms = timeout.as_millis() as u64,
                        "lock acquire timed out"
                    );
                    return Err(WrenError::LockTimeout {
                        lock: self.name.clone(),
                        operation: operation.to_string(),
                        waited_ms: timeout.as_millis() as u64,
                    });
                }
                // Not queued anymore: the release handed us the lock in the
                // same instant the timeout fired. Honor the grant.
                if state.holder.as_ref().is_some_and(|h| h.ticket == ticket) {
                    return Ok(());
                }
                Err(WrenError::LockTimeout {
                    lock: self.name.clone(),
                    operation: operation.to_string(),
                    waited_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Release the lock, handing it to the next queued waiter synchronously.
    /// A release without a hold is a warning, not an error.
    pub fn release(&self) {
        let mut state = self.lock_state();
        let Some(holder) = state.holder.take() else {
            tracing::warn!(lock = %self.name, "release called while not held");
            return;
        };
        tracing::debug!(lock = %self.name, operation = %holder.operation, "lock released");

        while let Some(waiter) = state.queue.pop_front() {
            let ticket = waiter.ticket;
            let operation = waiter.operation;
            state.holder = Some(Holder {
                ticket,
                operation: operation.clone(),
            });
            if waiter.grant.send(()).is_ok() {
                tracing::debug!(lock = %self.name, operation = %operation, "lock handed off");
                return;
            }
            // Waiter timed out before the hand-off; skip to the next.
            state.holder = None;
        }
    }

    /// Acquire, run `fut`, always release, including the error path.
    pub async fn execute<T, F>(&self, operation: &str, fut: F) -> WrenResult<T>
    where
        F: std::future::Future<Output = WrenResult<T>>,
    {
        self.acquire(operation).await?;
        let _guard = ReleaseGuard(self);
        fut.await
    }

    pub fn is_locked(&self) -> bool {
        self.lock_state().holder.is_some()
    }

    pub fn queue_depth(&self) -> usize {
        self.lock_state().queue.len()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}
