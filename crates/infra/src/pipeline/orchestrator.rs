//! Composition of the stage workers into one fixed-order run.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use dossier_core::CaseId;

use crate::config::PipelineConfig;
use crate::external::{
    AnsweringService, CaseListing, ContentResolver, MaterialResolver, ObjectStore,
};
use crate::queue::ClaimQueue;
use crate::stores::{AnswerStore, CatalogStore, DocumentStore, ReservationStore, StoreError};

use super::context::{ReadyDocument, RunScope};
use super::partition::fan_out;
use super::report::{PartitionFailure, RunReport};
use super::stages::{GenerationOutcome, StageError, StageWorkers};

/// Structural failure that aborts a run.
///
/// Business ineligibility and per-unit failures never surface here; they
/// are recorded in the report and the affected units' own state.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("configuration: {0}")]
    Config(String),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("candidate resolution failed: {0}")]
    Candidates(String),
}

/// Everything the orchestrator talks to.
pub struct PipelineDeps {
    pub listing: Arc<dyn CaseListing>,
    pub materials: Arc<dyn MaterialResolver>,
    pub content: Arc<dyn ContentResolver>,
    pub storage: Arc<dyn ObjectStore>,
    pub answering: Arc<dyn AnsweringService>,
    pub documents: Arc<dyn DocumentStore>,
    pub reservations: Arc<dyn ReservationStore>,
    pub answers: Arc<dyn AnswerStore>,
    pub catalog: Arc<dyn CatalogStore>,
    pub queue: Arc<dyn ClaimQueue>,
}

/// Runs the fixed stage sequence over a bounded worker pool.
pub struct Orchestrator {
    cfg: PipelineConfig,
    workers: Arc<StageWorkers>,
}

impl Orchestrator {
    pub fn new(cfg: PipelineConfig, deps: PipelineDeps) -> Self {
        let workers = Arc::new(StageWorkers {
            cfg: cfg.clone(),
            listing: deps.listing,
            materials: deps.materials,
            content: deps.content,
            storage: deps.storage,
            answering: deps.answering,
            documents: deps.documents,
            reservations: deps.reservations,
            answers: deps.answers,
            catalog: deps.catalog,
            queue: deps.queue,
        });
        Self { cfg, workers }
    }

    /// Execute one run for the given scope.
    ///
    /// The run succeeds once every partition reached a terminal state;
    /// partial failure is expected and lands in the report.
    pub async fn run(&self, scope: RunScope) -> Result<RunReport, PipelineError> {
        if self.cfg.grid_size == 0 {
            return Err(PipelineError::Config("grid_size must be positive".into()));
        }
        if self.cfg.pool_size == 0 {
            return Err(PipelineError::Config("pool_size must be positive".into()));
        }

        let run_id = Uuid::now_v7();
        let mut report = RunReport::default();
        let pool = Arc::new(Semaphore::new(self.cfg.pool_size));

        // Stage 1: candidates (global).
        let candidates = self
            .workers
            .fetch_candidates(&scope)
            .await
            .map_err(|e| PipelineError::Candidates(e.to_string()))?;
        if candidates.is_empty() {
            info!(run = %run_id, "no candidate cases; run is a no-op");
            return Ok(report);
        }
        report.candidate_cases = candidates.len();
        info!(run = %run_id, candidates = candidates.len(), "pipeline run started");

        // Stage 2: eligibility, partitioned by case.
        let parts = fan_out("case", candidates.clone(), self.cfg.grid_size, |c| {
            c.to_string()
        });
        let workers = self.workers.clone();
        let resolved = run_partitioned(
            "resolve-eligibility",
            pool.clone(),
            parts,
            &mut report,
            move |cases| {
                let workers = workers.clone();
                async move {
                    let mut out = Vec::new();
                    for case_id in cases {
                        if let Some(resolved) = workers.resolve_eligibility(case_id).await? {
                            out.push(resolved);
                        }
                    }
                    Ok(out)
                }
            },
        )
        .await;
        report.eligible_cases = resolved.len();

        // Stage 3: upload, partitioned by eligible material.
        let parts = fan_out("material", resolved, self.cfg.grid_size, |r| {
            r.material.material_id.to_string()
        });
        let workers = self.workers.clone();
        let uploads = run_partitioned(
            "upload-and-persist",
            pool.clone(),
            parts,
            &mut report,
            move |resolved_cases| {
                let workers = workers.clone();
                async move {
                    let mut out = Vec::new();
                    for resolved in resolved_cases {
                        if let Some(outcome) = workers.upload_and_persist(&resolved).await? {
                            out.push(outcome);
                        }
                    }
                    Ok(out)
                }
            },
        )
        .await;
        report.documents_uploaded = uploads.iter().filter(|u| !u.reused).count();
        report.documents_reused = uploads.iter().filter(|u| u.reused).count();

        // Stage 4: readiness gate. Verification itself runs in the
        // scheduler; only documents it already confirmed proceed here.
        let ready: Vec<ReadyDocument> = self
            .workers
            .documents
            .ready_documents(Some(&candidates))
            .await?
            .into_iter()
            .map(|d| ReadyDocument {
                case_id: d.case_id,
                document_id: d.id,
            })
            .collect();
        report.ready_documents = ready.len();
        if ready.is_empty() {
            info!(run = %run_id, "no ingested documents yet; downstream stages skipped");
            return Ok(report);
        }

        let catalog = self.workers.catalog.list().await?;
        if catalog.is_empty() {
            info!(run = %run_id, "query catalogue is empty; nothing to reserve");
            return Ok(report);
        }

        // Stage 5: reservations, partitioned by case.
        let parts = fan_out("case", ready.clone(), self.cfg.grid_size, |d| {
            d.case_id.to_string()
        });
        let workers = self.workers.clone();
        let catalog_for_reserve = catalog.clone();
        let reserve_counts = run_partitioned(
            "reserve-answer-version",
            pool.clone(),
            parts,
            &mut report,
            move |documents| {
                let workers = workers.clone();
                let catalog = catalog_for_reserve.clone();
                async move {
                    let mut created = 0;
                    let mut existing = 0;
                    for doc in documents {
                        let (c, e) = workers
                            .reserve_for_document(doc.case_id, doc.document_id, &catalog)
                            .await?;
                        created += c;
                        existing += e;
                    }
                    Ok(vec![(created, existing)])
                }
            },
        )
        .await;
        for (created, existing) in reserve_counts {
            report.reservations_created += created;
            report.reservations_existing += existing;
        }

        // Stage 6: generation, partitioned by query, forwarding the ready
        // (case, document) pairs resolved above.
        let parts = fan_out("query", catalog, self.cfg.grid_size, |d| {
            d.query.id.to_string()
        });
        let workers = self.workers.clone();
        let targets = ready;
        let outcomes = run_partitioned(
            "generate-answer",
            pool,
            parts,
            &mut report,
            move |definitions| {
                let workers = workers.clone();
                let targets = targets.clone();
                async move {
                    let mut out = Vec::new();
                    for definition in &definitions {
                        for target in &targets {
                            out.push(
                                workers
                                    .generate_for_target(
                                        definition,
                                        target.case_id,
                                        target.document_id,
                                    )
                                    .await?,
                            );
                        }
                    }
                    Ok(out)
                }
            },
        )
        .await;
        for outcome in outcomes {
            match outcome {
                GenerationOutcome::Generated => report.answers_generated += 1,
                GenerationOutcome::Skipped => report.answers_skipped += 1,
                GenerationOutcome::Failed => report.answers_failed += 1,
            }
        }

        info!(
            run = %run_id,
            uploaded = report.documents_uploaded,
            reused = report.documents_reused,
            reserved = report.reservations_created,
            generated = report.answers_generated,
            failed = report.answers_failed,
            partition_failures = report.partition_failures.len(),
            "pipeline run finished"
        );
        Ok(report)
    }
}

/// Execute one partitioned stage on the bounded pool.
///
/// Partition failures are recorded and do not stop sibling partitions.
async fn run_partitioned<T, R, F, Fut>(
    stage: &'static str,
    pool: Arc<Semaphore>,
    partitions: BTreeMap<String, Vec<T>>,
    report: &mut RunReport,
    make: F,
) -> Vec<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(Vec<T>) -> Fut,
    Fut: Future<Output = Result<Vec<R>, StageError>> + Send + 'static,
{
    let mut set = JoinSet::new();
    for (key, items) in partitions {
        let fut = make(items);
        let pool = pool.clone();
        set.spawn(async move {
            let _permit = pool
                .acquire_owned()
                .await
                .expect("worker pool semaphore closed");
            (key, fut.await)
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(mut partial))) => results.append(&mut partial),
            Ok((key, Err(err))) => {
                warn!(stage, partition = %key, error = %err, "partition failed");
                report.partition_failures.push(PartitionFailure {
                    stage,
                    partition: key,
                    error: err.to_string(),
                });
            }
            Err(join_err) => {
                warn!(stage, error = %join_err, "partition task panicked");
                report.partition_failures.push(PartitionFailure {
                    stage,
                    partition: "<join>".to_string(),
                    error: join_err.to_string(),
                });
            }
        }
    }
    results
}

/// Convenience used by tests and the trigger path: distinct case ids.
pub(crate) fn distinct_cases(case_ids: Vec<CaseId>) -> Vec<CaseId> {
    let mut out = case_ids;
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{
        InMemoryAnsweringService, InMemoryCaseListing, InMemoryContentResolver,
        InMemoryMaterialResolver, InMemoryObjectStore,
    };
    use crate::queue::InMemoryClaimQueue;
    use crate::stores::{
        InMemoryAnswerStore, InMemoryCatalogStore, InMemoryDocumentStore,
        InMemoryReservationStore,
    };

    fn deps() -> PipelineDeps {
        PipelineDeps {
            listing: Arc::new(InMemoryCaseListing::new()),
            materials: Arc::new(InMemoryMaterialResolver::new()),
            content: Arc::new(InMemoryContentResolver::new()),
            storage: Arc::new(InMemoryObjectStore::new()),
            answering: Arc::new(InMemoryAnsweringService::new()),
            documents: Arc::new(InMemoryDocumentStore::new()),
            reservations: Arc::new(InMemoryReservationStore::new()),
            answers: Arc::new(InMemoryAnswerStore::new()),
            catalog: Arc::new(InMemoryCatalogStore::new()),
            queue: Arc::new(InMemoryClaimQueue::new()),
        }
    }

    #[tokio::test]
    async fn unknown_scope_is_a_no_op() {
        let orchestrator = Orchestrator::new(PipelineConfig::default(), deps());
        let report = orchestrator
            .run(RunScope::listing("unknown-scope"))
            .await
            .unwrap();

        assert_eq!(report.candidate_cases, 0);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn blank_scope_key_is_a_no_op() {
        let orchestrator = Orchestrator::new(PipelineConfig::default(), deps());
        let report = orchestrator.run(RunScope::listing("  ")).await.unwrap();
        assert_eq!(report.candidate_cases, 0);
    }

    #[tokio::test]
    async fn zero_grid_size_is_a_config_error() {
        let cfg = PipelineConfig::default().with_grid_size(0);
        let orchestrator = Orchestrator::new(cfg, deps());
        let err = orchestrator
            .run(RunScope::cases(vec![CaseId::new()]))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[tokio::test]
    async fn ineligible_cases_are_silently_excluded() {
        let orchestrator = Orchestrator::new(PipelineConfig::default(), deps());
        // Cases exist in the scope but resolve no material.
        let report = orchestrator
            .run(RunScope::cases(vec![CaseId::new(), CaseId::new()]))
            .await
            .unwrap();

        assert_eq!(report.candidate_cases, 2);
        assert_eq!(report.eligible_cases, 0);
        assert!(report.is_clean());
    }

    #[test]
    fn distinct_cases_dedups() {
        let a = CaseId::new();
        let b = CaseId::new();
        assert_eq!(distinct_cases(vec![a, b, a]).len(), 2);
    }
}
