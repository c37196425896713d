//! Immutable answer records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dossier_core::{CaseId, QueryId};

/// One generated answer per (case, query, version).
///
/// Immutable once its reservation is Done; re-upsert is only permitted to
/// replace the content of a failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub case_id: CaseId,
    pub query_id: QueryId,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub text: String,
    /// The supporting input payload the answering service grounded on
    /// (chunks, citations), kept verbatim for audit.
    pub supporting_input: serde_json::Value,
}

impl Answer {
    pub fn new(
        case_id: CaseId,
        query_id: QueryId,
        version: i32,
        text: impl Into<String>,
        supporting_input: serde_json::Value,
    ) -> Self {
        Self {
            case_id,
            query_id,
            version,
            created_at: Utc::now(),
            text: text.into(),
            supporting_input,
        }
    }
}
