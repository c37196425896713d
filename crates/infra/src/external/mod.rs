//! External collaborator seams.
//!
//! Every upstream the pipeline talks to — listing, material/content
//! resolvers, object storage, the ingestion status source, and the
//! answering service — is a trait here. Real clients live outside this
//! workspace; the in-memory fakes back tests and dev wiring.

pub mod in_memory;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dossier_core::{CaseId, DocumentId, MaterialId};
use dossier_documents::MaterialRef;

use crate::retry::Transient;

pub use in_memory::{
    InMemoryAnsweringService, InMemoryCaseListing, InMemoryContentResolver,
    InMemoryMaterialResolver, InMemoryObjectStore, ScriptedStatusSource,
};

/// External call failure.
#[derive(Debug, thiserror::Error)]
pub enum ExternalError {
    /// Worth retrying: network trouble, timeouts, empty responses.
    #[error("transient external failure: {0}")]
    Transient(String),
    /// Not worth retrying: the upstream rejected the request outright.
    #[error("terminal external failure: {0}")]
    Terminal(String),
}

impl ExternalError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal(msg.into())
    }
}

impl Transient for ExternalError {
    fn is_transient(&self) -> bool {
        matches!(self, ExternalError::Transient(_))
    }
}

/// Upstream listing source for candidate cases.
#[async_trait]
pub trait CaseListing: Send + Sync {
    async fn list_candidates(&self, scope_key: &str) -> Result<Vec<CaseId>, ExternalError>;
}

/// Resolves the latest ingestible material for a case.
#[async_trait]
pub trait MaterialResolver: Send + Sync {
    async fn resolve_latest(
        &self,
        case_id: CaseId,
        caller_id: &str,
    ) -> Result<Option<MaterialRef>, ExternalError>;
}

/// Resolves a download URL for a material.
#[async_trait]
pub trait ContentResolver: Send + Sync {
    async fn download_url(
        &self,
        material_id: MaterialId,
        caller_id: &str,
    ) -> Result<Option<String>, ExternalError>;
}

/// Durable object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Copy `source_url` to `dest_path`; returns the durable URI.
    async fn copy(
        &self,
        source_url: &str,
        dest_path: &str,
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<String, ExternalError>;

    async fn size(&self, path: &str) -> Result<i64, ExternalError>;

    async fn exists(&self, path: &str) -> Result<bool, ExternalError>;
}

/// One observation from the ingestion status source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusObservation {
    pub status: String,
    pub reason: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl StatusObservation {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            reason: None,
            last_updated: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// How raw status strings map onto outcomes.
///
/// One terminal-success value, a set of terminal-failure values; anything
/// else is still pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMapping {
    pub success: String,
    pub failures: Vec<String>,
}

impl Default for StatusMapping {
    fn default() -> Self {
        Self {
            success: "INGESTED".to_string(),
            failures: vec!["FAILED".to_string(), "REJECTED".to_string()],
        }
    }
}

/// Classified poll outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    Success,
    Failure,
    Pending,
}

impl StatusMapping {
    pub fn classify(&self, status: &str) -> StatusOutcome {
        if status == self.success {
            StatusOutcome::Success
        } else if self.failures.iter().any(|f| f == status) {
            StatusOutcome::Failure
        } else {
            StatusOutcome::Pending
        }
    }
}

/// Polls the external processor for a document's ingestion state.
#[async_trait]
pub trait IngestionStatusSource: Send + Sync {
    async fn status_of(&self, external_id: &str) -> Result<StatusObservation, ExternalError>;
}

/// Retrieval scope forwarded to the answering service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerScope {
    pub case_id: CaseId,
    pub document_id: DocumentId,
}

/// Response from the answering service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub text: String,
    pub supporting_chunks: serde_json::Value,
}

/// The external answering service. Blank text is a failure, not an answer.
#[async_trait]
pub trait AnsweringService: Send + Sync {
    async fn answer(
        &self,
        question: &str,
        prompt_template: &str,
        scope: &AnswerScope,
    ) -> Result<AnswerPayload, ExternalError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_classifies_terminal_and_pending() {
        let mapping = StatusMapping::default();

        assert_eq!(mapping.classify("INGESTED"), StatusOutcome::Success);
        assert_eq!(mapping.classify("FAILED"), StatusOutcome::Failure);
        assert_eq!(mapping.classify("REJECTED"), StatusOutcome::Failure);
        // Unknown strings never terminate a task.
        assert_eq!(mapping.classify("PROCESSING"), StatusOutcome::Pending);
        assert_eq!(mapping.classify(""), StatusOutcome::Pending);
    }

    #[test]
    fn transient_classification() {
        assert!(ExternalError::transient("timeout").is_transient());
        assert!(!ExternalError::terminal("403").is_transient());
    }
}
