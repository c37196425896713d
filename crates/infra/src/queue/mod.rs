//! Claim-based work queue.
//!
//! A persisted work table plus an atomic claim operation: a general
//! at-most-one-worker polling primitive for cooperating worker processes.
//! Claimed rows are marked in-progress with the caller's owner id in the
//! same round trip that selects them, so no two concurrent callers ever
//! receive the same row.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dossier_core::{CaseId, DocumentId, TaskId, WorkerId};

pub use in_memory::InMemoryClaimQueue;
pub use postgres::PgClaimQueue;

/// Queue processing status of a task.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a worker.
    Pending,
    /// Claimed by a worker. Rows whose claim lease has expired are
    /// reclaimable (crash recovery).
    InProgress,
    /// Verification confirmed; terminal.
    Succeeded,
    /// Verification failed or gave up; terminal.
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }
}

impl core::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// What the external status source last reported for a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedStatus {
    pub status: Option<String>,
    pub reason: Option<String>,
}

impl ObservedStatus {
    pub fn new(status: impl Into<String>, reason: Option<String>) -> Self {
        Self {
            status: Some(status.into()),
            reason,
        }
    }
}

/// One row of the document-verification work table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationTask {
    pub id: TaskId,
    pub document_id: DocumentId,
    pub case_id: CaseId,
    /// Identifier the ingestion status source reports on.
    pub external_id: String,
    /// Polls performed so far.
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: TaskStatus,
    pub last_observed: ObservedStatus,
    /// Earliest instant the task is eligible for (re)claiming. Only ever
    /// moves forward.
    pub next_attempt_at: DateTime<Utc>,
    pub lock_owner: Option<WorkerId>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl VerificationTask {
    pub fn new(
        document_id: DocumentId,
        case_id: CaseId,
        external_id: impl Into<String>,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            document_id,
            case_id,
            external_id: external_id.into(),
            attempts: 0,
            max_attempts,
            status: TaskStatus::Pending,
            last_observed: ObservedStatus::default(),
            next_attempt_at: now,
            lock_owner: None,
            locked_at: None,
            created_at: now,
        }
    }

    /// Whether the next poll would exceed the attempt budget.
    pub fn budget_exhausted(&self) -> bool {
        self.attempts + 1 >= self.max_attempts
    }
}

/// Claim queue error.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl QueueError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

/// Persisted work table with an atomic claim operation.
#[async_trait]
pub trait ClaimQueue: Send + Sync {
    /// Add a task to the queue.
    async fn enqueue(&self, task: VerificationTask) -> Result<TaskId, QueueError>;

    /// Atomically claim up to `limit` eligible tasks for `owner`.
    ///
    /// Eligible: status in {Pending, InProgress} and `next_attempt_at <= now`,
    /// offered in `next_attempt_at` order. Claimed rows are marked
    /// InProgress with the owner set and returned in full. Batches handed to
    /// concurrent owners are pairwise disjoint.
    async fn claim_batch(
        &self,
        owner: WorkerId,
        limit: usize,
    ) -> Result<Vec<VerificationTask>, QueueError>;

    /// Terminal success: no further polling.
    async fn mark_succeeded(&self, id: TaskId, observed: ObservedStatus)
        -> Result<(), QueueError>;

    /// Terminal failure: no further polling.
    async fn mark_failed(&self, id: TaskId, observed: ObservedStatus) -> Result<(), QueueError>;

    /// Non-terminal poll outcome: count the attempt, release the lock, and
    /// schedule the next poll. `next_attempt_at` never moves backwards.
    async fn reschedule(
        &self,
        id: TaskId,
        next_attempt_at: DateTime<Utc>,
        observed: ObservedStatus,
    ) -> Result<(), QueueError>;

    /// Fetch a task by id.
    async fn get(&self, id: TaskId) -> Result<Option<VerificationTask>, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_task_is_pending_and_due() {
        let task = VerificationTask::new(DocumentId::new(), CaseId::new(), "ext-1", 5);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert!(task.next_attempt_at <= Utc::now());
        assert!(task.lock_owner.is_none());
    }

    #[test]
    fn budget_exhaustion_counts_the_upcoming_poll() {
        let mut task = VerificationTask::new(DocumentId::new(), CaseId::new(), "ext-1", 3);
        assert!(!task.budget_exhausted());
        task.attempts = 1;
        assert!(!task.budget_exhausted());
        task.attempts = 2;
        assert!(task.budget_exhausted());
    }
}
