//! In-memory claim queue for tests/dev.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use dossier_core::{TaskId, WorkerId};

use super::{ClaimQueue, ObservedStatus, QueueError, TaskStatus, VerificationTask};

/// Mutexed map standing in for the work table. Claims are atomic because
/// selection and ownership marking happen under one lock; locks held longer
/// than the lease are treated as expired and their rows become reclaimable.
#[derive(Debug)]
pub struct InMemoryClaimQueue {
    tasks: Mutex<HashMap<TaskId, VerificationTask>>,
    lease: Duration,
}

impl Default for InMemoryClaimQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryClaimQueue {
    pub fn new() -> Self {
        Self::with_lease(Duration::from_secs(300))
    }

    pub fn with_lease(lease: Duration) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            lease,
        }
    }

    /// Snapshot of all tasks, for assertions in tests.
    pub fn all(&self) -> Vec<VerificationTask> {
        self.tasks.lock().unwrap().values().cloned().collect()
    }
}

#[async_trait]
impl ClaimQueue for InMemoryClaimQueue {
    async fn enqueue(&self, task: VerificationTask) -> Result<TaskId, QueueError> {
        let id = task.id;
        self.tasks.lock().unwrap().insert(id, task);
        Ok(id)
    }

    async fn claim_batch(
        &self,
        owner: WorkerId,
        limit: usize,
    ) -> Result<Vec<VerificationTask>, QueueError> {
        let mut tasks = self.tasks.lock().unwrap();
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.lease).unwrap_or(chrono::Duration::zero());

        let mut eligible: Vec<TaskId> = tasks
            .values()
            .filter(|t| {
                matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress)
                    && t.next_attempt_at <= now
                    && match t.locked_at {
                        None => true,
                        // Lease expired: a crashed owner's row is reclaimable.
                        Some(locked_at) => locked_at + lease <= now,
                    }
            })
            .map(|t| t.id)
            .collect();
        eligible.sort_by_key(|id| tasks[id].next_attempt_at);
        eligible.truncate(limit);

        let mut claimed = Vec::with_capacity(eligible.len());
        for id in eligible {
            if let Some(task) = tasks.get_mut(&id) {
                task.status = TaskStatus::InProgress;
                task.lock_owner = Some(owner);
                task.locked_at = Some(now);
                claimed.push(task.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_succeeded(
        &self,
        id: TaskId,
        observed: ObservedStatus,
    ) -> Result<(), QueueError> {
        self.finish(id, TaskStatus::Succeeded, observed)
    }

    async fn mark_failed(&self, id: TaskId, observed: ObservedStatus) -> Result<(), QueueError> {
        self.finish(id, TaskStatus::Failed, observed)
    }

    async fn reschedule(
        &self,
        id: TaskId,
        next_attempt_at: DateTime<Utc>,
        observed: ObservedStatus,
    ) -> Result<(), QueueError> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        task.attempts += 1;
        task.status = TaskStatus::Pending;
        task.last_observed = observed;
        // Forward-only.
        if next_attempt_at > task.next_attempt_at {
            task.next_attempt_at = next_attempt_at;
        }
        task.lock_owner = None;
        task.locked_at = None;
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<VerificationTask>, QueueError> {
        Ok(self.tasks.lock().unwrap().get(&id).cloned())
    }
}

impl InMemoryClaimQueue {
    fn finish(
        &self,
        id: TaskId,
        status: TaskStatus,
        observed: ObservedStatus,
    ) -> Result<(), QueueError> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        task.attempts += 1;
        task.status = status;
        task.last_observed = observed;
        task.lock_owner = None;
        task.locked_at = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    use dossier_core::{CaseId, DocumentId};

    fn task() -> VerificationTask {
        VerificationTask::new(DocumentId::new(), CaseId::new(), "ext", 5)
    }

    #[tokio::test]
    async fn claim_marks_ownership_and_excludes_claimed_rows() {
        let queue = InMemoryClaimQueue::new();
        let owner = WorkerId::new();
        queue.enqueue(task()).await.unwrap();
        queue.enqueue(task()).await.unwrap();

        let first = queue.claim_batch(owner, 1).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].status, TaskStatus::InProgress);
        assert_eq!(first[0].lock_owner, Some(owner));

        let second = queue.claim_batch(owner, 10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].id, second[0].id);

        // Everything is locked now.
        assert!(queue.claim_batch(owner, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_offers_rows_in_next_attempt_order() {
        let queue = InMemoryClaimQueue::new();
        let early = {
            let mut t = task();
            t.next_attempt_at = Utc::now() - chrono::Duration::minutes(10);
            t
        };
        let late = {
            let mut t = task();
            t.next_attempt_at = Utc::now() - chrono::Duration::minutes(1);
            t
        };
        let early_id = early.id;
        queue.enqueue(late).await.unwrap();
        queue.enqueue(early).await.unwrap();

        let claimed = queue.claim_batch(WorkerId::new(), 1).await.unwrap();
        assert_eq!(claimed[0].id, early_id);
    }

    #[tokio::test]
    async fn future_tasks_are_not_claimable() {
        let queue = InMemoryClaimQueue::new();
        let mut t = task();
        t.next_attempt_at = Utc::now() + chrono::Duration::minutes(5);
        queue.enqueue(t).await.unwrap();

        assert!(queue.claim_batch(WorkerId::new(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reschedule_counts_attempt_and_releases_lock() {
        let queue = InMemoryClaimQueue::new();
        let id = queue.enqueue(task()).await.unwrap();
        let claimed = queue.claim_batch(WorkerId::new(), 1).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let next = Utc::now() + chrono::Duration::minutes(1);
        queue
            .reschedule(id, next, ObservedStatus::new("processing", None))
            .await
            .unwrap();

        let stored = queue.get(id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.next_attempt_at, next);
        assert!(stored.lock_owner.is_none());
    }

    #[tokio::test]
    async fn next_attempt_at_never_moves_backwards() {
        let queue = InMemoryClaimQueue::new();
        let mut t = task();
        let future = Utc::now() + chrono::Duration::minutes(30);
        t.next_attempt_at = future;
        let id = t.id;
        queue.enqueue(t).await.unwrap();

        queue
            .reschedule(id, Utc::now(), ObservedStatus::default())
            .await
            .unwrap();

        let stored = queue.get(id).await.unwrap().unwrap();
        assert_eq!(stored.next_attempt_at, future);
    }

    #[tokio::test]
    async fn terminal_tasks_stay_out_of_claims() {
        let queue = InMemoryClaimQueue::new();
        let id = queue.enqueue(task()).await.unwrap();
        queue.claim_batch(WorkerId::new(), 1).await.unwrap();
        queue
            .mark_succeeded(id, ObservedStatus::new("done", None))
            .await
            .unwrap();

        assert!(queue.claim_batch(WorkerId::new(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable() {
        let queue = InMemoryClaimQueue::with_lease(Duration::ZERO);
        queue.enqueue(task()).await.unwrap();

        let crashed_owner = WorkerId::new();
        let first = queue.claim_batch(crashed_owner, 1).await.unwrap();
        assert_eq!(first.len(), 1);

        // Lease of zero: the row is immediately reclaimable by another owner.
        let second_owner = WorkerId::new();
        let second = queue.claim_batch(second_owner, 1).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].lock_owner, Some(second_owner));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claimers_get_disjoint_batches() {
        let queue = Arc::new(InMemoryClaimQueue::new());
        let total = 40usize;
        for _ in 0..total {
            queue.enqueue(task()).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let owner = WorkerId::new();
                let mut mine = Vec::new();
                loop {
                    let batch = queue.claim_batch(owner, 3).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|t| t.id));
                }
                mine
            }));
        }

        let mut seen: HashSet<TaskId> = HashSet::new();
        let mut claimed_total = 0usize;
        for handle in handles {
            let ids = handle.await.unwrap();
            claimed_total += ids.len();
            for id in ids {
                // Disjointness: no id appears in two batches.
                assert!(seen.insert(id));
            }
        }
        assert_eq!(claimed_total, total);
    }
}
