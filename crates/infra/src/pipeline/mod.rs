//! The ingestion/answering pipeline.
//!
//! A fixed-order stage sequence composed by the orchestrator: candidate
//! fetch, per-case eligibility, upload, a readiness gate (verification
//! itself is the scheduler's job), version reservation, and answer
//! generation. Partitioned stages fan out onto a bounded worker pool;
//! partition outcomes never block siblings.

pub mod context;
pub mod orchestrator;
pub mod partition;
pub mod report;
pub mod stages;
pub mod trigger;

pub use context::{ReadyDocument, ResolvedCase, RunScope, UploadOutcome};
pub use orchestrator::{Orchestrator, PipelineDeps, PipelineError};
pub use partition::{fan_out, parse_case_allow_list};
pub use report::{PartitionFailure, RunReport};
pub use stages::{GenerationOutcome, StageError, StageWorkers};
pub use trigger::{RecordingRunTrigger, RunTrigger, SpawningRunTrigger};
