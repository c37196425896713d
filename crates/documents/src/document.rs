//! Case documents and their ingestion lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dossier_core::{CaseId, DocumentId, MaterialId};

/// Lifecycle state of an uploaded document as it moves through external
/// content processing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionPhase {
    /// Uploaded; waiting for the external processor to confirm ingestion.
    AwaitingVerification,
    /// Terminal success: the document is queryable downstream.
    Ingested,
    /// Terminal failure: the external processor rejected the document or
    /// verification gave up.
    Failed,
}

impl IngestionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IngestionPhase::Ingested | IngestionPhase::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionPhase::AwaitingVerification => "awaiting_verification",
            IngestionPhase::Ingested => "ingested",
            IngestionPhase::Failed => "failed",
        }
    }
}

impl core::str::FromStr for IngestionPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "awaiting_verification" => Ok(IngestionPhase::AwaitingVerification),
            "ingested" => Ok(IngestionPhase::Ingested),
            "failed" => Ok(IngestionPhase::Failed),
            other => Err(format!("unknown ingestion phase: {other}")),
        }
    }
}

/// One uploaded source document for a case.
///
/// At most one current document exists per (case, material); a second upload
/// for the same pair reuses the existing row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseDocument {
    pub id: DocumentId,
    pub case_id: CaseId,
    pub material_id: MaterialId,
    pub storage_uri: String,
    pub ingestion_phase: IngestionPhase,
    pub phase_changed_at: DateTime<Utc>,
    pub size_bytes: i64,
    pub content_type: String,
    pub uploaded_at: DateTime<Utc>,
}

impl CaseDocument {
    /// Create a freshly uploaded document awaiting verification.
    pub fn uploaded(
        case_id: CaseId,
        material_id: MaterialId,
        storage_uri: impl Into<String>,
        size_bytes: i64,
        content_type: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: DocumentId::new(),
            case_id,
            material_id,
            storage_uri: storage_uri.into(),
            ingestion_phase: IngestionPhase::AwaitingVerification,
            phase_changed_at: now,
            size_bytes,
            content_type: content_type.into(),
            uploaded_at: now,
        }
    }

    /// Advance the ingestion phase.
    ///
    /// Terminal phases are sticky: once Ingested or Failed the phase no
    /// longer moves.
    pub fn advance_phase(&mut self, phase: IngestionPhase) -> bool {
        if self.ingestion_phase.is_terminal() {
            return false;
        }
        self.ingestion_phase = phase;
        self.phase_changed_at = Utc::now();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> CaseDocument {
        CaseDocument::uploaded(
            CaseId::new(),
            MaterialId::new(),
            "s3://bucket/cases/x",
            1024,
            "application/pdf",
        )
    }

    #[test]
    fn fresh_upload_awaits_verification() {
        let d = doc();
        assert_eq!(d.ingestion_phase, IngestionPhase::AwaitingVerification);
        assert!(!d.ingestion_phase.is_terminal());
    }

    #[test]
    fn terminal_phase_is_sticky() {
        let mut d = doc();
        assert!(d.advance_phase(IngestionPhase::Ingested));
        assert!(!d.advance_phase(IngestionPhase::Failed));
        assert_eq!(d.ingestion_phase, IngestionPhase::Ingested);
    }

    #[test]
    fn phase_parse_roundtrip() {
        for p in [
            IngestionPhase::AwaitingVerification,
            IngestionPhase::Ingested,
            IngestionPhase::Failed,
        ] {
            assert_eq!(p.as_str().parse::<IngestionPhase>().unwrap(), p);
        }
    }
}
