//! Run scopes and the context values stages pass along.

use serde::{Deserialize, Serialize};

use dossier_core::{CaseId, DocumentId};
use dossier_documents::{CaseDocument, MaterialRef};

/// What a pipeline run is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunScope {
    /// Resolve candidates from the upstream listing source.
    Listing { scope_key: String },
    /// An explicit case set (scheduler fan-out, manual triggers).
    Cases(Vec<CaseId>),
}

impl RunScope {
    pub fn listing(scope_key: impl Into<String>) -> Self {
        Self::Listing {
            scope_key: scope_key.into(),
        }
    }

    pub fn cases(case_ids: Vec<CaseId>) -> Self {
        Self::Cases(case_ids)
    }
}

/// A case that passed eligibility, with its resolved material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCase {
    pub case_id: CaseId,
    pub material: MaterialRef,
}

/// Result of the upload stage for one case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub document: CaseDocument,
    /// An existing document for the same (case, material) was reused.
    pub reused: bool,
}

/// A document that cleared the readiness gate, forwarded into the
/// reservation and generation stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyDocument {
    pub case_id: CaseId,
    pub document_id: DocumentId,
}
