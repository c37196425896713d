//! Postgres-backed claim queue.
//!
//! The claim is a single statement: a `FOR UPDATE SKIP LOCKED` selection
//! feeding an `UPDATE … RETURNING`, so concurrent workers never receive the
//! same row and no application-level lock is held across statements. Engines
//! without skip-locked semantics would substitute a lease-based conditional
//! update on (lock_owner, locked_at); the columns are already shaped for
//! that.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use dossier_core::{CaseId, DocumentId, TaskId, WorkerId};

use super::{ClaimQueue, ObservedStatus, QueueError, TaskStatus, VerificationTask};

/// Claim queue over the `document_verification_task` table.
pub struct PgClaimQueue {
    pool: PgPool,
    lease: Duration,
}

impl PgClaimQueue {
    pub fn new(pool: PgPool) -> Self {
        Self::with_lease(pool, Duration::from_secs(300))
    }

    pub fn with_lease(pool: PgPool, lease: Duration) -> Self {
        Self { pool, lease }
    }
}

fn row_to_task(row: &PgRow) -> Result<VerificationTask, QueueError> {
    let status_raw: String = row
        .try_get("status")
        .map_err(|e| QueueError::storage(e.to_string()))?;
    let status =
        TaskStatus::from_str(&status_raw).map_err(QueueError::Storage)?;

    let get_uuid = |name: &str| -> Result<Uuid, QueueError> {
        row.try_get::<Uuid, _>(name)
            .map_err(|e| QueueError::storage(e.to_string()))
    };

    Ok(VerificationTask {
        id: TaskId::from_uuid(get_uuid("id")?),
        document_id: DocumentId::from_uuid(get_uuid("document_id")?),
        case_id: CaseId::from_uuid(get_uuid("case_id")?),
        external_id: row
            .try_get("external_id")
            .map_err(|e| QueueError::storage(e.to_string()))?,
        attempts: row
            .try_get::<i32, _>("attempts")
            .map_err(|e| QueueError::storage(e.to_string()))? as u32,
        max_attempts: row
            .try_get::<i32, _>("max_attempts")
            .map_err(|e| QueueError::storage(e.to_string()))? as u32,
        status,
        last_observed: ObservedStatus {
            status: row
                .try_get("last_observed_status")
                .map_err(|e| QueueError::storage(e.to_string()))?,
            reason: row
                .try_get("last_observed_reason")
                .map_err(|e| QueueError::storage(e.to_string()))?,
        },
        next_attempt_at: row
            .try_get("next_attempt_at")
            .map_err(|e| QueueError::storage(e.to_string()))?,
        lock_owner: row
            .try_get::<Option<Uuid>, _>("lock_owner")
            .map_err(|e| QueueError::storage(e.to_string()))?
            .map(WorkerId::from_uuid),
        locked_at: row
            .try_get("locked_at")
            .map_err(|e| QueueError::storage(e.to_string()))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| QueueError::storage(e.to_string()))?,
    })
}

#[async_trait]
impl ClaimQueue for PgClaimQueue {
    async fn enqueue(&self, task: VerificationTask) -> Result<TaskId, QueueError> {
        sqlx::query(
            r#"
            INSERT INTO document_verification_task
                (id, document_id, case_id, external_id, attempts, max_attempts,
                 status, last_observed_status, last_observed_reason,
                 next_attempt_at, lock_owner, locked_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(task.id.as_uuid())
        .bind(task.document_id.as_uuid())
        .bind(task.case_id.as_uuid())
        .bind(&task.external_id)
        .bind(task.attempts as i32)
        .bind(task.max_attempts as i32)
        .bind(task.status.as_str())
        .bind(&task.last_observed.status)
        .bind(&task.last_observed.reason)
        .bind(task.next_attempt_at)
        .bind(task.lock_owner.map(|w| *w.as_uuid()))
        .bind(task.locked_at)
        .bind(task.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::storage(e.to_string()))?;

        Ok(task.id)
    }

    async fn claim_batch(
        &self,
        owner: WorkerId,
        limit: usize,
    ) -> Result<Vec<VerificationTask>, QueueError> {
        let lease_secs = self.lease.as_secs() as f64;

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM document_verification_task
                WHERE status IN ('pending', 'in_progress')
                  AND next_attempt_at <= now()
                  AND (locked_at IS NULL
                       OR locked_at + make_interval(secs => $3) <= now())
                ORDER BY next_attempt_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE document_verification_task t
            SET status = 'in_progress',
                lock_owner = $1,
                locked_at = now()
            FROM claimable c
            WHERE t.id = c.id
            RETURNING t.id, t.document_id, t.case_id, t.external_id,
                      t.attempts, t.max_attempts, t.status,
                      t.last_observed_status, t.last_observed_reason,
                      t.next_attempt_at, t.lock_owner, t.locked_at, t.created_at
            "#,
        )
        .bind(owner.as_uuid())
        .bind(limit as i64)
        .bind(lease_secs)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueueError::storage(e.to_string()))?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            tasks.push(row_to_task(row)?);
        }
        tasks.sort_by_key(|t| t.next_attempt_at);
        Ok(tasks)
    }

    async fn mark_succeeded(
        &self,
        id: TaskId,
        observed: ObservedStatus,
    ) -> Result<(), QueueError> {
        self.finish(id, TaskStatus::Succeeded, observed).await
    }

    async fn mark_failed(&self, id: TaskId, observed: ObservedStatus) -> Result<(), QueueError> {
        self.finish(id, TaskStatus::Failed, observed).await
    }

    async fn reschedule(
        &self,
        id: TaskId,
        next_attempt_at: DateTime<Utc>,
        observed: ObservedStatus,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE document_verification_task
            SET attempts = attempts + 1,
                status = 'pending',
                last_observed_status = $2,
                last_observed_reason = $3,
                next_attempt_at = GREATEST(next_attempt_at, $4),
                lock_owner = NULL,
                locked_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(&observed.status)
        .bind(&observed.reason)
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::storage(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<VerificationTask>, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT id, document_id, case_id, external_id, attempts, max_attempts,
                   status, last_observed_status, last_observed_reason,
                   next_attempt_at, lock_owner, locked_at, created_at
            FROM document_verification_task
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| QueueError::storage(e.to_string()))?;

        row.as_ref().map(row_to_task).transpose()
    }
}

impl PgClaimQueue {
    async fn finish(
        &self,
        id: TaskId,
        status: TaskStatus,
        observed: ObservedStatus,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE document_verification_task
            SET attempts = attempts + 1,
                status = $2,
                last_observed_status = $3,
                last_observed_reason = $4,
                lock_owner = NULL,
                locked_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(&observed.status)
        .bind(&observed.reason)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::storage(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }
}
