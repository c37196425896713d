//! Component configuration.
//!
//! All knobs are explicit and passed into constructors; nothing here is
//! process-global.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Configuration for one orchestrator instance.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum number of partitions produced per partitioned stage.
    pub grid_size: usize,
    /// Maximum partitions executing concurrently.
    pub pool_size: usize,
    /// Caller identity forwarded to upstream resolvers.
    pub caller_id: String,
    /// Prefix under which uploaded documents are stored.
    pub storage_prefix: String,
    /// Retry policy for upload-side external calls (resolvers, storage).
    pub upload_retry: RetryPolicy,
    /// Retry policy for answering-service calls.
    pub answer_retry: RetryPolicy,
    /// Max verification polls before a task gives up.
    pub verification_max_attempts: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            grid_size: 8,
            pool_size: 4,
            caller_id: "dossier-pipeline".to_string(),
            storage_prefix: "dossier".to_string(),
            upload_retry: RetryPolicy::default(),
            answer_retry: RetryPolicy::default(),
            verification_max_attempts: 10,
        }
    }
}

impl PipelineConfig {
    pub fn with_grid_size(mut self, grid_size: usize) -> Self {
        self.grid_size = grid_size;
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_answer_retry(mut self, policy: RetryPolicy) -> Self {
        self.answer_retry = policy;
        self
    }

    pub fn with_upload_retry(mut self, policy: RetryPolicy) -> Self {
        self.upload_retry = policy;
        self
    }
}

/// Configuration for the verification scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often a tick runs when nothing triggers one earlier.
    pub interval: Duration,
    /// Maximum tasks claimed per tick.
    pub batch_size: usize,
    /// Fixed delay before a still-pending task is polled again.
    pub retry_delay: Duration,
    /// Name for logging.
    pub name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_size: 25,
            retry_delay: Duration::from_secs(60),
            name: "verification-scheduler".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}
