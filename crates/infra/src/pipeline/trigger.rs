//! Asynchronous run triggering.
//!
//! The trigger seam always acknowledges immediately; runs execute in the
//! background and failures surface later through document/reservation state,
//! never synchronously to the caller.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};
use uuid::Uuid;

use dossier_core::CaseId;

use super::context::RunScope;
use super::orchestrator::{Orchestrator, distinct_cases};

/// Entry point for downstream pipeline runs scoped to an explicit case set.
///
/// Used by the verification scheduler's fan-out and by manual triggers.
#[async_trait]
pub trait RunTrigger: Send + Sync {
    /// Accept a run for the given cases; returns the accepted run id.
    async fn trigger(&self, case_ids: Vec<CaseId>) -> Uuid;
}

/// Spawns an orchestrator run per trigger on the runtime.
pub struct SpawningRunTrigger {
    orchestrator: Arc<Orchestrator>,
}

impl SpawningRunTrigger {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl RunTrigger for SpawningRunTrigger {
    async fn trigger(&self, case_ids: Vec<CaseId>) -> Uuid {
        let run_id = Uuid::now_v7();
        let cases = distinct_cases(case_ids);
        info!(run = %run_id, cases = cases.len(), "run accepted");

        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            match orchestrator.run(RunScope::cases(cases)).await {
                Ok(report) => info!(
                    run = %run_id,
                    generated = report.answers_generated,
                    failed = report.answers_failed,
                    "triggered run finished"
                ),
                Err(err) => error!(run = %run_id, error = %err, "triggered run aborted"),
            }
        });
        run_id
    }
}

/// Records trigger calls instead of running anything. Test double.
#[derive(Debug, Default)]
pub struct RecordingRunTrigger {
    calls: std::sync::Mutex<Vec<Vec<CaseId>>>,
}

impl RecordingRunTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Vec<CaseId>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RunTrigger for RecordingRunTrigger {
    async fn trigger(&self, case_ids: Vec<CaseId>) -> Uuid {
        self.calls.lock().unwrap().push(case_ids);
        Uuid::now_v7()
    }
}
