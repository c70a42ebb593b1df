//! SQLite-backed durable store for the offline request queue.
//!
//! The queue keeps its own connection and tables so that queue drain and
//! local commits never contend on the same lock.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

use wren_core::{WrenError, WrenResult};

use super::{NewRequest, Priority, QueueStatus, QueuedRequest, RequestStatus};
use crate::config::QueueConfig;

pub struct RequestQueue {
    db: Arc<Mutex<Connection>>,
    config: QueueConfig,
}

impl RequestQueue {
    pub fn new(db_path: &Path, config: QueueConfig) -> WrenResult<Self> {
        let conn = Connection::open(db_path)
            .map_err(|e| WrenError::Storage(format!("request queue open: {e}")))?;
        Self::create_tables(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    /// In-memory queue (for tests).
    pub fn in_memory(config: QueueConfig) -> WrenResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| WrenError::Storage(format!("request queue in-memory: {e}")))?;
        Self::create_tables(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    fn create_tables(conn: &Connection) -> WrenResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS queued_requests (
                id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL UNIQUE,
                method TEXT NOT NULL,
                url TEXT NOT NULL,
                body TEXT NOT NULL,
                body_hash TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                created_at TEXT NOT NULL,
                last_attempt_at TEXT,
                next_retry_at TEXT,
                error_message TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_requests_status_priority
                ON queued_requests(status, priority DESC, created_at ASC);
            CREATE TABLE IF NOT EXISTS completed_requests (
                request_id TEXT PRIMARY KEY,
                completed_at TEXT NOT NULL
            );",
        )
        .map_err(|e| WrenError::Storage(format!("request queue schema: {e}")))?;
        Ok(())
    }

    /// Enqueue a request for later replay. Returns `None` when the
    /// idempotency key has already completed (nothing to send); an existing
    /// live row with the same key is returned as-is instead of duplicated.
    pub async fn enqueue(&self, request: NewRequest) -> WrenResult<Option<QueuedRequest>> {
        let db = self.db.lock().await;

        if Self::completed_with_conn(&db, &request.request_id)? {
            tracing::info!(
                request_id = %request.request_id,
                "enqueue skipped: request already completed"
            );
            return Ok(None);
        }

        let existing: Option<String> = db
            .query_row(
                "SELECT id FROM queued_requests WHERE request_id = ?1",
                params![request.request_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| WrenError::Storage(format!("idempotency check: {e}")))?;
        if let Some(id) = existing {
            let id = Uuid::parse_str(&id)
                .map_err(|e| WrenError::Storage(format!("parse uuid: {e}")))?;
            return Self::get_with_conn(&db, id);
        }

        let body_text = request.body.to_string();
        let body_hash = {
            let mut hasher = Sha256::new();
            hasher.update(body_text.as_bytes());
            hasher
                .finalize()
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<String>()
        };

        let row = QueuedRequest {
            id: Uuid::now_v7(),
            request_id: request.request_id.clone(),
            method: request.method,
            url: request.url,
            body: request.body,
            body_hash,
            priority: request.priority,
            status: RequestStatus::Pending,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(self.config.max_retries),
            created_at: Utc::now(),
            last_attempt_at: None,
            next_retry_at: None,
            error_message: None,
        };

        db.execute(
            "INSERT INTO queued_requests
               (id, request_id, method, url, body, body_hash, priority, status,
                retry_count, max_retries, created_at, last_attempt_at, next_retry_at, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                row.id.to_string(),
                row.request_id,
                row.method,
                row.url,
                body_text,
                row.body_hash,
                row.priority.rank(),
                row.status.as_str(),
                row.retry_count,
                row.max_retries,
                row.created_at.to_rfc3339(),
                Option::<String>::None,
                Option::<String>::None,
                Option::<String>::None,
            ],
        )
        .map_err(|e| WrenError::Storage(format!("enqueue request: {e}")))?;

        tracing::info!(
            request_id = %row.request_id,
            method = %row.method,
            url = %row.url,
            priority = %row.priority,
            "request enqueued"
        );
        Ok(Some(row))
    }

    /// Requests eligible to run now: pending and past any backoff deadline,
    /// ordered High → Normal → Low then FIFO within a tier.
    pub async fn ready_requests(&self, now: DateTime<Utc>) -> WrenResult<Vec<QueuedRequest>> {
        let db = self.db.lock().await;
        let mut stmt = db
            .prepare(
                "SELECT id, request_id, method, url, body, body_hash, priority, status,
                        retry_count, max_retries, created_at, last_attempt_at, next_retry_at, error_message
                 FROM queued_requests
                 WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= ?1)
                 ORDER BY priority DESC, created_at ASC",
            )
            .map_err(|e| WrenError::Storage(format!("ready select: {e}")))?;
        let rows = stmt
            .query_map(params![now.to_rfc3339()], row_to_request)
            .map_err(|e| WrenError::Storage(format!("ready query: {e}")))?;
        collect(rows)
    }

    pub async fn get(&self, id: Uuid) -> WrenResult<Option<QueuedRequest>> {
        let db = self.db.lock().await;
        Self::get_with_conn(&db, id)
    }

    pub async fn get_by_request_id(&self, request_id: &str) -> WrenResult<Option<QueuedRequest>> {
        let db = self.db.lock().await;
        db.query_row(
            "SELECT id, request_id, method, url, body, body_hash, priority, status,
                    retry_count, max_retries, created_at, last_attempt_at, next_retry_at, error_message
             FROM queued_requests WHERE request_id = ?1",
            params![request_id],
            row_to_request,
        )
        .optional()
        .map_err(|e| WrenError::Storage(format!("get by request id: {e}")))
    }

    /// All live rows, priority then FIFO; the UI inspection list.
    pub async fn list(&self, limit: usize) -> WrenResult<Vec<QueuedRequest>> {
        let db = self.db.lock().await;
        let mut stmt = db
            .prepare(
                "SELECT id, request_id, method, url, body, body_hash, priority, status,
                        retry_count, max_retries, created_at, last_attempt_at, next_retry_at, error_message
                 FROM queued_requests ORDER BY priority DESC, created_at ASC LIMIT ?1",
            )
            .map_err(|e| WrenError::Storage(format!("list prepare: {e}")))?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_request)
            .map_err(|e| WrenError::Storage(format!("list query: {e}")))?;
        collect(rows)
    }

    /// Transition a row to `processing` ahead of a replay attempt.
    pub async fn mark_processing(&self, id: Uuid) -> WrenResult<()> {
        let db = self.db.lock().await;
        let affected = db
            .execute(
                "UPDATE queued_requests SET status = 'processing', last_attempt_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), id.to_string()],
            )
            .map_err(|e| WrenError::Storage(format!("mark processing: {e}")))?;
        if affected == 0 {
            return Err(WrenError::NotFound(format!("queued request {id}")));
        }
        Ok(())
    }

    /// Confirmed success: delete the row and remember the idempotency key so
    /// a duplicate replay is skipped rather than re-sent.
    pub async fn complete(&self, id: Uuid) -> WrenResult<()> {
        let db = self.db.lock().await;
        let request_id: String = db
            .query_row(
                "SELECT request_id FROM queued_requests WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| WrenError::Storage(format!("complete lookup: {e}")))?;

        db.execute(
            "DELETE FROM queued_requests WHERE id = ?1",
            params![id.to_string()],
        )
        .map_err(|e| WrenError::Storage(format!("complete delete: {e}")))?;
        db.execute(
            "INSERT OR REPLACE INTO completed_requests (request_id, completed_at) VALUES (?1, ?2)",
            params![request_id, Utc::now().to_rfc3339()],
        )
        .map_err(|e| WrenError::Storage(format!("complete ledger: {e}")))?;

        tracing::info!(request_id = %request_id, "request completed and removed from queue");
        Ok(())
    }

    /// Record a failed attempt. Retryable failures back off exponentially
    /// (base * 2^(n-1), capped); a non-retryable error or exhausted retries
    /// parks the row as `failed` until a manual retry clears it.
    pub async fn fail(&self, id: Uuid, error: &str, retryable: bool) -> WrenResult<RequestStatus> {
        let db = self.db.lock().await;
        let (request_id, retry_count, max_retries): (String, u32, u32) = db
            .query_row(
                "SELECT request_id, retry_count, max_retries FROM queued_requests WHERE id = ?1",
                params![id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(|e| WrenError::Storage(format!("fail lookup: {e}")))?;

        let new_count = retry_count + 1;
        if new_count >= max_retries || !retryable {
            db.execute(
                "UPDATE queued_requests
                 SET status = 'failed', retry_count = ?1, error_message = ?2, next_retry_at = NULL
                 WHERE id = ?3",
                params![new_count.min(max_retries), error, id.to_string()],
            )
            .map_err(|e| WrenError::Storage(format!("fail park: {e}")))?;
            tracing::error!(
                request_id = %request_id,
                retry_count = new_count,
                max_retries,
                retryable,
                error,
                "request failed permanently; awaiting manual retry"
            );
            return Ok(RequestStatus::Failed);
        }

        let exponent = (new_count - 1).min(20);
        let delay_ms = (self.config.base_delay_ms.saturating_mul(1u64 << exponent))
            .min(self.config.max_delay_ms);
        let next_retry = Utc::now() + Duration::milliseconds(delay_ms as i64);
        db.execute(
            "UPDATE queued_requests
             SET status = 'pending', retry_count = ?1, error_message = ?2, next_retry_at = ?3
             WHERE id = ?4",
            params![new_count, error, next_retry.to_rfc3339(), id.to_string()],
        )
        .map_err(|e| WrenError::Storage(format!("fail reschedule: {e}")))?;
        tracing::warn!(
            request_id = %request_id,
            retry_count = new_count,
            next_retry_at = %next_retry.to_rfc3339(),
            delay_ms,
            error,
            "request failed; retry scheduled"
        );
        Ok(RequestStatus::Pending)
    }

    /// Manual retry of a failed request: back to pending with a clean slate.
    pub async fn retry_request(&self, request_id: &str) -> WrenResult<()> {
        let db = self.db.lock().await;
        let affected = db
            .execute(
                "UPDATE queued_requests
                 SET status = 'pending', retry_count = 0, next_retry_at = NULL, error_message = NULL
                 WHERE request_id = ?1 AND status = 'failed'",
                params![request_id],
            )
            .map_err(|e| WrenError::Storage(format!("retry request: {e}")))?;
        if affected == 0 {
            return Err(WrenError::NotFound(format!(
                "no failed request with id {request_id}"
            )));
        }
        tracing::info!(request_id, "request reset for manual retry");
        Ok(())
    }

    /// Drop failed rows. Returns rows deleted.
    pub async fn clear_failed(&self) -> WrenResult<u64> {
        let db = self.db.lock().await;
        let deleted = db
            .execute("DELETE FROM queued_requests WHERE status = 'failed'", [])
            .map_err(|e| WrenError::Storage(format!("clear failed: {e}")))?;
        if deleted > 0 {
            tracing::info!(count = deleted, "cleared failed requests");
        }
        Ok(deleted as u64)
    }

    /// Drop everything, including pending work. Use with caution.
    pub async fn clear_all(&self) -> WrenResult<u64> {
        let db = self.db.lock().await;
        let deleted = db
            .execute("DELETE FROM queued_requests", [])
            .map_err(|e| WrenError::Storage(format!("clear all: {e}")))?;
        tracing::warn!(count = deleted, "cleared entire request queue");
        Ok(deleted as u64)
    }

    /// Return rows stuck in `processing` (crash mid-replay) to `pending`.
    /// Called once on startup.
    pub async fn reset_stale_processing(&self) -> WrenResult<u64> {
        let db = self.db.lock().await;
        let reset = db
            .execute(
                "UPDATE queued_requests SET status = 'pending' WHERE status = 'processing'",
                [],
            )
            .map_err(|e| WrenError::Storage(format!("reset stale processing: {e}")))?;
        if reset > 0 {
            tracing::info!(count = reset, "reset stale processing requests");
        }
        Ok(reset as u64)
    }

    pub async fn status(&self) -> WrenResult<QueueStatus> {
        let now = Utc::now();
        let rows = self.list(100_000).await?;
        let mut status = QueueStatus {
            pending_count: 0,
            ready_to_sync: 0,
            waiting_for_retry: 0,
            failed_count: 0,
        };
        for row in &rows {
            match row.status {
                RequestStatus::Pending => {
                    status.pending_count += 1;
                    if row.is_ready(now) {
                        status.ready_to_sync += 1;
                    } else {
                        status.waiting_for_retry += 1;
                    }
                }
                RequestStatus::Failed => status.failed_count += 1,
                RequestStatus::Processing => {}
            }
        }
        Ok(status)
    }

    pub async fn count_with_status(&self, status: RequestStatus) -> WrenResult<usize> {
        let db = self.db.lock().await;
        let count: i64 = db
            .query_row(
                "SELECT COUNT(*) FROM queued_requests WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| WrenError::Storage(format!("count status: {e}")))?;
        Ok(count as usize)
    }

    /// Whether this idempotency key already replayed successfully.
    pub async fn completed_contains(&self, request_id: &str) -> WrenResult<bool> {
        let db = self.db.lock().await;
        Self::completed_with_conn(&db, request_id)
    }

    fn completed_with_conn(conn: &Connection, request_id: &str) -> WrenResult<bool> {
        let hit: Option<String> = conn
            .query_row(
                "SELECT request_id FROM completed_requests WHERE request_id = ?1",
                params![request_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| WrenError::Storage(format!("completed lookup: {e}")))?;
        Ok(hit.is_some())
    }

    fn get_with_conn(conn: &Connection, id: Uuid) -> WrenResult<Option<QueuedRequest>> {
        conn.query_row(
            "SELECT id, request_id, method, url, body, body_hash, priority, status,
                    retry_count, max_retries, created_at, last_attempt_at, next_retry_at, error_message
             FROM queued_requests WHERE id = ?1",
            params![id.to_string()],
            row_to_request,
        )
        .optional()
        .map_err(|e| WrenError::Storage(format!("get request: {e}")))
    }
}

fn row_to_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueuedRequest> {
    let id: String = row.get(0)?;
    let body: String = row.get(4)?;
    let priority: i32 = row.get(6)?;
    let status: String = row.get(7)?;
    let created_at: String = row.get(10)?;
    let last_attempt_at: Option<String> = row.get(11)?;
    let next_retry_at: Option<String> = row.get(12)?;

    let parse_dt = |s: &str| -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    };

    Ok(QueuedRequest {
        id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
        request_id: row.get(1)?,
        method: row.get(2)?,
        url: row.get(3)?,
        body: serde_json::from_str(&body).unwrap_or(serde_json::Value::Null),
        body_hash: row.get(5)?,
        priority: Priority::from_rank(priority),
        status: status.parse().unwrap_or(RequestStatus::Pending),
        retry_count: row.get(8)?,
        max_retries: row.get(9)?,
        created_at: parse_dt(&created_at),
        last_attempt_at: last_attempt_at.as_deref().map(parse_dt),
        next_retry_at: next_retry_at.as_deref().map(parse_dt),
        error_message: row.get(13)?,
    })
}

fn collect(
    rows: impl Iterator<Item = rusqlite::Result<QueuedRequest>>,
) -> WrenResult<Vec<QueuedRequest>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| WrenError::Storage(format!("read request row: {e}")))?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_queue() -> RequestQueue {
        RequestQueue::in_memory(QueueConfig::default()).expect("in-memory queue")
    }

    fn new_request(request_id: &str) -> NewRequest {
        NewRequest::new(
            request_id,
            "PUT",
            "/budgets/b-1/snapshot",
            serde_json::json!({"v": 1}),
        )
    }

    #[tokio::test]
    async fn enqueue_and_fetch() {
        let q = make_queue();
        let row = q.enqueue(new_request("r-1")).await.unwrap().unwrap();
        assert_eq!(row.status, RequestStatus::Pending);
        assert_eq!(row.retry_count, 0);
        assert_eq!(row.max_retries, 3);
        assert_eq!(row.body_hash.len(), 64);

        let fetched = q.get(row.id).await.unwrap().unwrap();
        assert_eq!(fetched.request_id, "r-1");
    }

    #[tokio::test]
    async fn duplicate_request_id_returns_existing_row() {
        let q = make_queue();
        let first = q.enqueue(new_request("r-1")).await.unwrap().unwrap();
        let second = q.enqueue(new_request("r-1")).await.unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(q.list(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn completed_request_id_skips_enqueue() {
        let q = make_queue();
        let row = q.enqueue(new_request("r-1")).await.unwrap().unwrap();
        q.complete(row.id).await.unwrap();

        assert!(q.completed_contains("r-1").await.unwrap());
        assert!(q.enqueue(new_request("r-1")).await.unwrap().is_none());
        assert!(q.list(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ready_order_is_priority_then_fifo() {
        let q = make_queue();
        let low = q
            .enqueue(new_request("low").with_priority(Priority::Low))
            .await
            .unwrap()
            .unwrap();
        let normal_1 = q.enqueue(new_request("n-1")).await.unwrap().unwrap();
        let normal_2 = q.enqueue(new_request("n-2")).await.unwrap().unwrap();
        let high = q
            .enqueue(new_request("high").with_priority(Priority::High))
            .await
            .unwrap()
            .unwrap();

        let ready = q.ready_requests(Utc::now()).await.unwrap();
        let ids: Vec<Uuid> = ready.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![high.id, normal_1.id, normal_2.id, low.id]);
    }

    #[tokio::test]
    async fn fail_schedules_backoff_and_excludes_until_due() {
        let q = make_queue();
        let row = q.enqueue(new_request("r-1")).await.unwrap().unwrap();

        let status = q.fail(row.id, "connection refused", true).await.unwrap();
        assert_eq!(status, RequestStatus::Pending);

        let fetched = q.get(row.id).await.unwrap().unwrap();
        assert_eq!(fetched.retry_count, 1);
        let next = fetched.next_retry_at.unwrap();
        assert!(next > Utc::now());

        // Not ready while inside the backoff window; ready once it passes.
        assert!(q.ready_requests(Utc::now()).await.unwrap().is_empty());
        let later = next + Duration::milliseconds(1);
        assert_eq!(q.ready_requests(later).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn backoff_doubles_and_caps() {
        let config = QueueConfig {
            base_delay_ms: 1_000,
            max_delay_ms: 3_000,
            max_retries: 10,
            ..Default::default()
        };
        let q = RequestQueue::in_memory(config).unwrap();
        let row = q.enqueue(new_request("r-1")).await.unwrap().unwrap();

        // attempt 1 → ~1s, attempt 2 → ~2s, attempt 3 → capped at 3s.
        let mut last_delay = 0i64;
        for expected_ms in [1_000i64, 2_000, 3_000] {
            let before = Utc::now();
            q.fail(row.id, "err", true).await.unwrap();
            let fetched = q.get(row.id).await.unwrap().unwrap();
            let delay = (fetched.next_retry_at.unwrap() - before).num_milliseconds();
            assert!(
                (delay - expected_ms).abs() < 500,
                "expected ~{expected_ms}ms, got {delay}ms"
            );
            assert!(delay >= last_delay);
            last_delay = delay;
        }
    }

    #[tokio::test]
    async fn exhausted_retries_park_as_failed() {
        let q = make_queue();
        let row = q.enqueue(new_request("r-1")).await.unwrap().unwrap();

        q.fail(row.id, "err 1", true).await.unwrap();
        q.fail(row.id, "err 2", true).await.unwrap();
        let status = q.fail(row.id, "err 3", true).await.unwrap();
        assert_eq!(status, RequestStatus::Failed);

        let fetched = q.get(row.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, RequestStatus::Failed);
        assert_eq!(fetched.retry_count, 3);
        assert!(fetched.next_retry_at.is_none());
        assert_eq!(fetched.error_message.as_deref(), Some("err 3"));

        // Excluded from automatic replay.
        assert!(q.ready_requests(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_count_never_exceeds_max() {
        let q = make_queue();
        let row = q.enqueue(new_request("r-1")).await.unwrap().unwrap();
        for _ in 0..5 {
            let _ = q.fail(row.id, "err", true).await;
        }
        let fetched = q.get(row.id).await.unwrap().unwrap();
        assert!(fetched.retry_count <= fetched.max_retries);
    }

    #[tokio::test]
    async fn non_retryable_error_parks_immediately() {
        let q = make_queue();
        let row = q.enqueue(new_request("r-1")).await.unwrap().unwrap();
        let status = q.fail(row.id, "validation rejected", false).await.unwrap();
        assert_eq!(status, RequestStatus::Failed);
    }

    #[tokio::test]
    async fn manual_retry_resets_failed_row() {
        let q = make_queue();
        let row = q.enqueue(new_request("r-1")).await.unwrap().unwrap();
        q.fail(row.id, "bad", false).await.unwrap();

        q.retry_request("r-1").await.unwrap();
        let fetched = q.get(row.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, RequestStatus::Pending);
        assert_eq!(fetched.retry_count, 0);
        assert!(fetched.error_message.is_none());
    }

    #[tokio::test]
    async fn manual_retry_of_pending_row_is_not_found() {
        let q = make_queue();
        q.enqueue(new_request("r-1")).await.unwrap();
        let err = q.retry_request("r-1").await.unwrap_err();
        assert!(matches!(err, WrenError::NotFound(_)));
    }

    #[tokio::test]
    async fn clear_failed_leaves_pending() {
        let q = make_queue();
        let failed = q.enqueue(new_request("r-1")).await.unwrap().unwrap();
        q.fail(failed.id, "bad", false).await.unwrap();
        q.enqueue(new_request("r-2")).await.unwrap();

        let deleted = q.clear_failed().await.unwrap();
        assert_eq!(deleted, 1);
        let remaining = q.list(10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].request_id, "r-2");
    }

    #[tokio::test]
    async fn stale_processing_rows_reset_on_startup() {
        let q = make_queue();
        let row = q.enqueue(new_request("r-1")).await.unwrap().unwrap();
        q.mark_processing(row.id).await.unwrap();
        assert!(q.ready_requests(Utc::now()).await.unwrap().is_empty());

        let reset = q.reset_stale_processing().await.unwrap();
        assert_eq!(reset, 1);
        assert_eq!(q.ready_requests(Utc::now()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("queue.sqlite");

        {
            let q = RequestQueue::new(&db_path, QueueConfig::default()).unwrap();
            q.enqueue(new_request("r-1")).await.unwrap();
            let done = q.enqueue(new_request("r-2")).await.unwrap().unwrap();
            q.complete(done.id).await.unwrap();
        }

        let reopened = RequestQueue::new(&db_path, QueueConfig::default()).unwrap();
        let rows = reopened.list(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].request_id, "r-1");
        // The completed ledger survives too.
        assert!(reopened.completed_contains("r-2").await.unwrap());
    }

    #[tokio::test]
    async fn status_classifies_four_ways() {
        let q = make_queue();
        // Ready.
        q.enqueue(new_request("ready")).await.unwrap();
        // Waiting for retry.
        let waiting = q.enqueue(new_request("waiting")).await.unwrap().unwrap();
        q.fail(waiting.id, "net", true).await.unwrap();
        // Failed.
        let failed = q.enqueue(new_request("failed")).await.unwrap().unwrap();
        q.fail(failed.id, "fatal", false).await.unwrap();

        let status = q.status().await.unwrap();
        assert_eq!(status.pending_count, 2);
        assert_eq!(status.ready_to_sync, 1);
        assert_eq!(status.waiting_for_retry, 1);
        assert_eq!(status.failed_count, 1);
    }
}
