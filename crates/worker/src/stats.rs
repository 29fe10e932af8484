//! In-memory counters for the running worker, served by the status endpoint.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Snapshot of worker activity since process start.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkerStats {
    /// Job currently in the pipeline, if any
    pub current_job: Option<String>,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    /// Last time the scheduler scanned for queued jobs
    pub last_scan_unix_ms: i64,
    pub started_unix_ms: i64,
}

/// Shared stats state for the scheduler and the status server
pub type SharedStats = Arc<RwLock<WorkerStats>>;

/// Creates stats stamped with the current start time.
pub fn new_shared_stats() -> SharedStats {
    Arc::new(RwLock::new(WorkerStats {
        started_unix_ms: now_unix_ms(),
        ..WorkerStats::default()
    }))
}

/// Current wall clock in milliseconds since the epoch.
pub fn now_unix_ms() -> i64 {
    Utc::now().timestamp_millis()
}
