//! Per-run outcome reporting.

use serde::Serialize;

/// One partition that ended in a recorded failure.
///
/// Recorded failures never abort the run; they surface here and in the
/// affected unit's own state.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionFailure {
    pub stage: &'static str,
    pub partition: String,
    pub error: String,
}

/// Counters describing what one orchestrator run did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub candidate_cases: usize,
    pub eligible_cases: usize,
    pub documents_uploaded: usize,
    pub documents_reused: usize,
    pub ready_documents: usize,
    pub reservations_created: usize,
    pub reservations_existing: usize,
    pub answers_generated: usize,
    pub answers_failed: usize,
    pub answers_skipped: usize,
    pub partition_failures: Vec<PartitionFailure>,
}

impl RunReport {
    /// A run is clean when no partition recorded a failure.
    pub fn is_clean(&self) -> bool {
        self.partition_failures.is_empty()
    }
}
