use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_GC_GRACE_PERIOD_HOURS: i64 = 24;
pub const DEFAULT_JOB_QUEUE_DEPTH: usize = 1024;
pub const DEFAULT_JOB_WORKER_COUNT: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathDbConfig {
    /// Index database file.
    pub db_path: PathBuf,
    /// How long a statement waits for a busy engine before the session
    /// guard tears down and retries.
    pub busy_timeout_ms: u64,
    /// Minimum age of a reclaim record before it is listed for physical
    /// deletion. Zero or negative disables the delay.
    pub gc_grace_period_hours: i64,
    /// Bound of the background job queue.
    pub job_queue_depth: usize,
    /// Workers draining the background job queue.
    pub job_worker_count: usize,
}

impl PathDbConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Default::default()
        }
    }
}

impl Default for PathDbConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("pathmap.db"),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            gc_grace_period_hours: DEFAULT_GC_GRACE_PERIOD_HOURS,
            job_queue_depth: DEFAULT_JOB_QUEUE_DEPTH,
            job_worker_count: DEFAULT_JOB_WORKER_COUNT,
        }
    }
}
