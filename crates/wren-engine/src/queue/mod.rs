//! Durable offline request queue.
//!
//! Outbound writes that cannot reach the network are captured here and
//! replayed in priority + FIFO order with capped exponential backoff once
//! connectivity returns. Rows survive process restarts; a confirmed success
//! deletes the row and records its idempotency key so a duplicate replay is
//! skipped instead of re-sent.

pub mod processor;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use processor::{QueueProcessor, QueueReport, RequestTransport};
pub use store::RequestQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }

    /// Numeric rank for ORDER BY; higher drains first.
    pub fn rank(&self) -> i32 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
        }
    }

    pub fn from_rank(rank: i32) -> Self {
        match rank {
            2 => Self::High,
            1 => Self::Normal,
            _ => Self::Low,
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            _ => Err(format!("unknown priority: {s}")),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Processing,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown request status: {s}")),
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub id: Uuid,
    /// Caller-supplied idempotency key, unique across live rows.
    pub request_id: String,
    pub method: String,
    pub url: String,
    pub body: serde_json::Value,
    pub body_hash: String,
    pub priority: Priority,
    pub status: RequestStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl QueuedRequest {
    /// Pending and past any backoff deadline.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == RequestStatus::Pending
            && self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Pending but still inside its backoff window.
    pub fn is_waiting_for_retry(&self, now: DateTime<Utc>) -> bool {
        self.status == RequestStatus::Pending
            && self.next_retry_at.is_some_and(|at| at > now)
    }
}

#[derive(Debug, Clone)]
pub struct NewRequest {
    pub request_id: String,
    pub method: String,
    pub url: String,
    pub body: serde_json::Value,
    pub priority: Priority,
    /// `None` uses the queue's configured default.
    pub max_retries: Option<u32>,
}

impl NewRequest {
    pub fn new(request_id: &str, method: &str, url: &str, body: serde_json::Value) -> Self {
        Self {
            request_id: request_id.to_string(),
            method: method.to_string(),
            url: url.to_string(),
            body,
            priority: Priority::Normal,
            max_retries: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Aggregate queue counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending_count: usize,
    pub ready_to_sync: usize,
    pub waiting_for_retry: usize,
    pub failed_count: usize,
}
