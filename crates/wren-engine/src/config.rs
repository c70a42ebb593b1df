use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub identity: IdentityConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

/// Who this device is. The author name attributes commits; the fingerprint
/// distinguishes devices sharing the same author.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub author: String,
    pub device_fingerprint: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            author: "Unknown User".into(),
            device_fingerprint: "unknown-device".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// How long an `acquire` waits before failing with a lock timeout.
    pub acquire_timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// First-retry delay; doubles per attempt.
    pub base_delay_ms: u64,
    /// Backoff ceiling.
    pub max_delay_ms: u64,
    pub max_retries: u32,
    /// How often the processor polls for ready requests.
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_retries: 3,
            poll_interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Debounce window for coalescing mutation-triggered syncs.
    pub debounce_ms: u64,
    /// Shorter window for high-priority changes (paychecks, imports).
    pub high_priority_debounce_ms: u64,
    /// Timestamps within this tolerance are treated as the same instant:
    /// differing entities inside it are conflicts, never a silent
    /// last-writer-wins pick. Device clocks are not assumed synchronized.
    pub max_clock_skew_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 10_000,
            high_priority_debounce_ms: 2_000,
            max_clock_skew_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Ring-buffer capacity for recent sync attempts.
    pub window: usize,
    pub consecutive_failure_threshold: u32,
    /// Windowed error rate above which status degrades (0.0..1.0).
    pub error_rate_threshold: f64,
    /// Average sync duration above which status is "slow".
    pub slow_sync_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window: 50,
            consecutive_failure_threshold: 3,
            error_rate_threshold: 0.25,
            slow_sync_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    pub enabled: bool,
    /// How many pre-sync backups to retain.
    pub retain: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retain: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// How many distinct device fingerprints one author may use before
    /// consistency checks flag the commit.
    pub max_devices_per_author: usize,
    /// Recent commits inspected for the consistency check.
    pub device_check_depth: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_devices_per_author: 3,
            device_check_depth: 10,
        }
    }
}
