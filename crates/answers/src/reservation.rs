//! Answer reservations: the pipeline's idempotency ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dossier_core::{CaseId, DocumentId, QueryId};

/// Generation lifecycle of one reserved answer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    /// Reserved, never attempted.
    New,
    /// Claimed by a worker; generation is underway.
    InProgress,
    /// Answer persisted. Permanently blocks regeneration.
    Done,
    /// Last attempt failed; eligible for a future retry.
    Failed,
}

impl ReservationStatus {
    /// Whether a worker may claim this reservation for generation.
    pub fn is_claimable(&self) -> bool {
        matches!(self, ReservationStatus::New | ReservationStatus::Failed)
    }

    /// Valid transitions: New|Failed -> InProgress -> Done|Failed.
    pub fn can_transition_to(&self, next: ReservationStatus) -> bool {
        match (self, next) {
            (ReservationStatus::New, ReservationStatus::InProgress) => true,
            (ReservationStatus::Failed, ReservationStatus::InProgress) => true,
            (ReservationStatus::InProgress, ReservationStatus::Done) => true,
            (ReservationStatus::InProgress, ReservationStatus::Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::New => "new",
            ReservationStatus::InProgress => "in_progress",
            ReservationStatus::Done => "done",
            ReservationStatus::Failed => "failed",
        }
    }
}

impl core::str::FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(ReservationStatus::New),
            "in_progress" => Ok(ReservationStatus::InProgress),
            "done" => Ok(ReservationStatus::Done),
            "failed" => Ok(ReservationStatus::Failed),
            other => Err(format!("unknown reservation status: {other}")),
        }
    }
}

/// Natural key of a reservation: one row per (case, query, document).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReservationKey {
    pub case_id: CaseId,
    pub query_id: QueryId,
    pub document_id: DocumentId,
}

/// A durable reservation pre-allocating a version number and tracking one
/// answer's generation lifecycle.
///
/// The version is assigned exactly once (atomic get-or-create) and is
/// immutable afterwards; re-running reserve for the same key is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerReservation {
    pub key: ReservationKey,
    pub version: i32,
    pub status: ReservationStatus,
    pub updated_at: DateTime<Utc>,
}

impl AnswerReservation {
    pub fn new(key: ReservationKey, version: i32) -> Self {
        Self {
            key,
            version,
            status: ReservationStatus::New,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claimable_states() {
        assert!(ReservationStatus::New.is_claimable());
        assert!(ReservationStatus::Failed.is_claimable());
        assert!(!ReservationStatus::InProgress.is_claimable());
        assert!(!ReservationStatus::Done.is_claimable());
    }

    #[test]
    fn transition_matrix() {
        use ReservationStatus::*;

        assert!(New.can_transition_to(InProgress));
        assert!(Failed.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Done));
        assert!(InProgress.can_transition_to(Failed));

        // Done is terminal.
        assert!(!Done.can_transition_to(InProgress));
        assert!(!Done.can_transition_to(Failed));
        // No shortcut from New straight to Done.
        assert!(!New.can_transition_to(Done));
    }

    #[test]
    fn status_parse_roundtrip() {
        use ReservationStatus::*;
        for s in [New, InProgress, Done, Failed] {
            assert_eq!(s.as_str().parse::<ReservationStatus>().unwrap(), s);
        }
    }
}
