//! Verification scheduler.
//!
//! A recurring loop, independent of orchestrator runs, that claims a bounded
//! batch of verification tasks, polls the external status source, advances
//! document state, and fans out exactly one downstream run for the cases
//! that just succeeded.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use dossier_core::{CaseId, WorkerId};
use dossier_documents::IngestionPhase;

use crate::config::SchedulerConfig;
use crate::external::{IngestionStatusSource, StatusMapping, StatusOutcome};
use crate::pipeline::RunTrigger;
use crate::queue::{ClaimQueue, ObservedStatus, QueueError, VerificationTask};
use crate::stores::DocumentStore;

/// What one scheduler tick did. Mostly for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rescheduled: usize,
    /// Distinct cases forwarded to the downstream trigger (empty when no
    /// task succeeded this tick).
    pub triggered_cases: Vec<CaseId>,
}

/// Handle to control a running scheduler (trigger + shutdown).
#[derive(Debug)]
pub struct VerificationSchedulerHandle {
    shutdown: mpsc::Sender<()>,
    trigger: mpsc::Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl VerificationSchedulerHandle {
    /// Request an early tick (e.g. right after new uploads were queued).
    ///
    /// Triggers are coalesced: if a tick is already pending this is a no-op.
    pub fn trigger(&self) {
        let _ = self.trigger.try_send(());
    }

    /// Request graceful shutdown and wait for the loop to stop.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(()).await;
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

/// The recurring verification poller.
pub struct VerificationScheduler {
    cfg: SchedulerConfig,
    worker_id: WorkerId,
    queue: Arc<dyn ClaimQueue>,
    documents: Arc<dyn DocumentStore>,
    status_source: Arc<dyn IngestionStatusSource>,
    mapping: StatusMapping,
    run_trigger: Arc<dyn RunTrigger>,
}

impl VerificationScheduler {
    pub fn new(
        cfg: SchedulerConfig,
        queue: Arc<dyn ClaimQueue>,
        documents: Arc<dyn DocumentStore>,
        status_source: Arc<dyn IngestionStatusSource>,
        mapping: StatusMapping,
        run_trigger: Arc<dyn RunTrigger>,
    ) -> Self {
        Self {
            cfg,
            worker_id: WorkerId::new(),
            queue,
            documents,
            status_source,
            mapping,
            run_trigger,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Spawn the scheduler loop on the runtime.
    pub fn spawn(self) -> VerificationSchedulerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        // Coalesce: capacity 1, try_send drops extra triggers.
        let (trigger_tx, trigger_rx) = mpsc::channel::<()>(1);

        let join = tokio::spawn(scheduler_loop(self, shutdown_rx, trigger_rx));

        VerificationSchedulerHandle {
            shutdown: shutdown_tx,
            trigger: trigger_tx,
            join: Some(join),
        }
    }

    /// Run one batch: claim, poll, transition, fan out.
    pub async fn tick(&self) -> Result<TickSummary, QueueError> {
        let batch = self
            .queue
            .claim_batch(self.worker_id, self.cfg.batch_size)
            .await?;

        let mut summary = TickSummary {
            claimed: batch.len(),
            ..TickSummary::default()
        };
        if batch.is_empty() {
            return Ok(summary);
        }

        let mut succeeded_cases: Vec<CaseId> = Vec::new();
        for task in batch {
            match self.poll_task(&task).await? {
                PollResult::Succeeded => {
                    summary.succeeded += 1;
                    succeeded_cases.push(task.case_id);
                }
                PollResult::Failed => summary.failed += 1,
                PollResult::Rescheduled => summary.rescheduled += 1,
            }
        }

        // Exactly one downstream run, restricted to the cases that just
        // succeeded — never the whole table.
        if !succeeded_cases.is_empty() {
            succeeded_cases.sort();
            succeeded_cases.dedup();
            let run_id = self.run_trigger.trigger(succeeded_cases.clone()).await;
            info!(
                scheduler = %self.cfg.name,
                run = %run_id,
                cases = succeeded_cases.len(),
                "triggered downstream run for verified cases"
            );
            summary.triggered_cases = succeeded_cases;
        }

        Ok(summary)
    }

    async fn poll_task(&self, task: &VerificationTask) -> Result<PollResult, QueueError> {
        let observation = match self.status_source.status_of(&task.external_id).await {
            Ok(observation) => observation,
            Err(err) => {
                // Status-source trouble is handled like a pending poll: the
                // claim queue reschedules it cross-process.
                warn!(
                    scheduler = %self.cfg.name,
                    task = %task.id,
                    error = %err,
                    "status poll failed"
                );
                return self.handle_pending(task, ObservedStatus::default()).await;
            }
        };

        let observed = ObservedStatus {
            status: Some(observation.status.clone()),
            reason: observation.reason.clone(),
        };
        match self.mapping.classify(&observation.status) {
            StatusOutcome::Success => {
                self.documents
                    .set_phase(task.document_id, IngestionPhase::Ingested)
                    .await
                    .map_err(|e| QueueError::storage(e.to_string()))?;
                self.queue.mark_succeeded(task.id, observed).await?;
                info!(
                    scheduler = %self.cfg.name,
                    task = %task.id,
                    document = %task.document_id,
                    "document ingested"
                );
                Ok(PollResult::Succeeded)
            }
            StatusOutcome::Failure => {
                self.documents
                    .set_phase(task.document_id, IngestionPhase::Failed)
                    .await
                    .map_err(|e| QueueError::storage(e.to_string()))?;
                self.queue.mark_failed(task.id, observed).await?;
                warn!(
                    scheduler = %self.cfg.name,
                    task = %task.id,
                    document = %task.document_id,
                    reason = observation.reason.as_deref().unwrap_or("-"),
                    "document ingestion failed"
                );
                Ok(PollResult::Failed)
            }
            StatusOutcome::Pending => self.handle_pending(task, observed).await,
        }
    }

    async fn handle_pending(
        &self,
        task: &VerificationTask,
        observed: ObservedStatus,
    ) -> Result<PollResult, QueueError> {
        if task.budget_exhausted() {
            // Out of attempts: give up instead of rescheduling.
            self.documents
                .set_phase(task.document_id, IngestionPhase::Failed)
                .await
                .map_err(|e| QueueError::storage(e.to_string()))?;
            self.queue.mark_failed(task.id, observed).await?;
            warn!(
                scheduler = %self.cfg.name,
                task = %task.id,
                attempts = task.attempts + 1,
                "verification gave up after max attempts"
            );
            return Ok(PollResult::Failed);
        }

        let next_attempt_at = Utc::now()
            + chrono::Duration::from_std(self.cfg.retry_delay)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.queue
            .reschedule(task.id, next_attempt_at, observed)
            .await?;
        debug!(
            scheduler = %self.cfg.name,
            task = %task.id,
            attempt = task.attempts + 1,
            "still pending; rescheduled"
        );
        Ok(PollResult::Rescheduled)
    }
}

enum PollResult {
    Succeeded,
    Failed,
    Rescheduled,
}

async fn scheduler_loop(
    scheduler: VerificationScheduler,
    mut shutdown_rx: mpsc::Receiver<()>,
    mut trigger_rx: mpsc::Receiver<()>,
) {
    info!(scheduler = %scheduler.cfg.name, "verification scheduler started");

    let mut interval = tokio::time::interval(scheduler.cfg.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {}
            Some(_) = trigger_rx.recv() => {}
        }

        // Drain coalesced triggers so one tick covers them all.
        while trigger_rx.try_recv().is_ok() {}

        if let Err(err) = scheduler.tick().await {
            error!(scheduler = %scheduler.cfg.name, error = %err, "scheduler tick failed");
        }
    }

    info!(scheduler = %scheduler.cfg.name, "verification scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use dossier_core::MaterialId;
    use dossier_documents::CaseDocument;

    use crate::external::{ScriptedStatusSource, StatusObservation};
    use crate::pipeline::RecordingRunTrigger;
    use crate::queue::{InMemoryClaimQueue, TaskStatus};
    use crate::stores::{DocumentStore, InMemoryDocumentStore};

    struct Fixture {
        queue: Arc<InMemoryClaimQueue>,
        documents: Arc<InMemoryDocumentStore>,
        status: Arc<ScriptedStatusSource>,
        trigger: Arc<RecordingRunTrigger>,
        scheduler: VerificationScheduler,
    }

    fn fixture(retry_delay: Duration) -> Fixture {
        let queue = Arc::new(InMemoryClaimQueue::new());
        let documents = Arc::new(InMemoryDocumentStore::new());
        let status = Arc::new(ScriptedStatusSource::new());
        let trigger = Arc::new(RecordingRunTrigger::new());

        let scheduler = VerificationScheduler::new(
            SchedulerConfig::default()
                .with_batch_size(10)
                .with_retry_delay(retry_delay),
            queue.clone(),
            documents.clone(),
            status.clone(),
            StatusMapping::default(),
            trigger.clone(),
        );

        Fixture {
            queue,
            documents,
            status,
            trigger,
            scheduler,
        }
    }

    async fn seed_document(f: &Fixture, external_id: &str, max_attempts: u32) -> VerificationTask {
        let doc = CaseDocument::uploaded(
            dossier_core::CaseId::new(),
            MaterialId::new(),
            "mem://x",
            1,
            "application/pdf",
        );
        let (doc, _) = f.documents.insert_if_absent(doc).await.unwrap();
        let task = VerificationTask::new(doc.id, doc.case_id, external_id, max_attempts);
        f.queue.enqueue(task.clone()).await.unwrap();
        task
    }

    #[tokio::test]
    async fn success_flips_document_and_triggers_downstream_run() {
        let f = fixture(Duration::from_secs(60));
        let task = seed_document(&f, "ext-ok", 5).await;
        f.status.script(
            "ext-ok",
            vec![StatusObservation::new("INGESTED")],
        );

        let summary = f.scheduler.tick().await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.triggered_cases, vec![task.case_id]);

        let doc = f.documents.get(task.document_id).await.unwrap().unwrap();
        assert_eq!(doc.ingestion_phase, IngestionPhase::Ingested);
        let stored = f.queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Succeeded);

        // Exactly one downstream run for the succeeded cases.
        assert_eq!(f.trigger.calls(), vec![vec![task.case_id]]);
    }

    #[tokio::test]
    async fn terminal_failure_marks_document_and_stops_polling() {
        let f = fixture(Duration::from_secs(60));
        let task = seed_document(&f, "ext-bad", 5).await;
        f.status.script(
            "ext-bad",
            vec![StatusObservation::new("REJECTED").with_reason("unreadable scan")],
        );

        let summary = f.scheduler.tick().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert!(f.trigger.calls().is_empty());

        let doc = f.documents.get(task.document_id).await.unwrap().unwrap();
        assert_eq!(doc.ingestion_phase, IngestionPhase::Failed);
        let stored = f.queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.last_observed.reason.as_deref(), Some("unreadable scan"));

        // Nothing left to claim.
        let summary = f.scheduler.tick().await.unwrap();
        assert_eq!(summary.claimed, 0);
    }

    #[tokio::test]
    async fn pending_reschedules_at_fixed_delay() {
        let delay = Duration::from_secs(120);
        let f = fixture(delay);
        let task = seed_document(&f, "ext-slow", 5).await;

        let before = Utc::now();
        let summary = f.scheduler.tick().await.unwrap();
        assert_eq!(summary.rescheduled, 1);

        let stored = f.queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.status, TaskStatus::Pending);
        assert!(stored.lock_owner.is_none());

        // Next poll is scheduled a fixed delay out.
        let lower = before + chrono::Duration::from_std(delay).unwrap();
        assert!(stored.next_attempt_at >= lower);
        assert!(
            stored.next_attempt_at
                <= Utc::now() + chrono::Duration::from_std(delay).unwrap()
        );
    }

    #[tokio::test]
    async fn gives_up_exactly_at_max_attempts() {
        // Zero retry delay so every tick can reclaim immediately.
        let f = fixture(Duration::ZERO);
        let task = seed_document(&f, "ext-stuck", 3).await;

        // Polls 1 and 2 reschedule…
        for expected_attempts in 1..=2 {
            let summary = f.scheduler.tick().await.unwrap();
            assert_eq!(summary.rescheduled, 1, "poll {expected_attempts}");
            let stored = f.queue.get(task.id).await.unwrap().unwrap();
            assert_eq!(stored.attempts, expected_attempts);
        }

        // …poll 3 exhausts the budget and gives up.
        let summary = f.scheduler.tick().await.unwrap();
        assert_eq!(summary.failed, 1);

        let stored = f.queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        let doc = f.documents.get(task.document_id).await.unwrap().unwrap();
        assert_eq!(doc.ingestion_phase, IngestionPhase::Failed);
    }

    #[tokio::test]
    async fn status_source_errors_count_as_pending_polls() {
        let f = fixture(Duration::ZERO);
        let task = seed_document(&f, "ext-dark", 4).await;
        f.status.fail_with_transient("ext-dark");

        let summary = f.scheduler.tick().await.unwrap();
        assert_eq!(summary.rescheduled, 1);
        let stored = f.queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn one_trigger_covers_all_succeeded_cases_in_a_batch() {
        let f = fixture(Duration::from_secs(60));
        let a = seed_document(&f, "ext-a", 5).await;
        let b = seed_document(&f, "ext-b", 5).await;
        f.status.script("ext-a", vec![StatusObservation::new("INGESTED")]);
        f.status.script("ext-b", vec![StatusObservation::new("INGESTED")]);

        let summary = f.scheduler.tick().await.unwrap();
        assert_eq!(summary.succeeded, 2);

        let calls = f.trigger.calls();
        assert_eq!(calls.len(), 1);
        let mut expected = vec![a.case_id, b.case_id];
        expected.sort();
        assert_eq!(calls[0], expected);
    }

    #[tokio::test]
    async fn spawned_scheduler_shuts_down_cleanly() {
        let f = fixture(Duration::from_secs(60));
        let _ = seed_document(&f, "ext-live", 5).await;
        f.status.script("ext-live", vec![StatusObservation::new("INGESTED")]);

        let handle = f.scheduler.spawn();
        handle.trigger();
        // Give the loop a moment to process the startup tick.
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;

        assert!(!f.trigger.calls().is_empty());
        let _ = f.documents.all();
    }
}
