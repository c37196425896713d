//! Persistence seams for documents, reservations, answers, and the query
//! catalogue.
//!
//! Every trait ships an in-memory implementation (tests/dev) and a Postgres
//! implementation. All coordination points (idempotent insert, claim flip,
//! phase advance) are single conditional statements; correctness never
//! depends on holding an application-level lock across statements.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use dossier_answers::{Answer, AnswerReservation, ReservationKey};
use dossier_catalog::QueryDefinition;
use dossier_core::{CaseId, DocumentId, MaterialId, QueryId};
use dossier_documents::{CaseDocument, IngestionPhase};

pub use in_memory::{
    InMemoryAnswerStore, InMemoryCatalogStore, InMemoryDocumentStore, InMemoryReservationStore,
};
pub use postgres::{PgAnswerStore, PgCatalogStore, PgDocumentStore, PgReservationStore};

/// Store error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

/// Case document persistence.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert unless a document already exists for the same (case, material).
    ///
    /// Returns the current row plus whether this call inserted it. The
    /// existing row wins on a race; callers treat `false` as "reuse".
    async fn insert_if_absent(
        &self,
        document: CaseDocument,
    ) -> Result<(CaseDocument, bool), StoreError>;

    async fn find_by_case_and_material(
        &self,
        case_id: CaseId,
        material_id: MaterialId,
    ) -> Result<Option<CaseDocument>, StoreError>;

    async fn get(&self, id: DocumentId) -> Result<Option<CaseDocument>, StoreError>;

    /// Advance the ingestion phase. Terminal phases are sticky; returns
    /// whether a row actually changed.
    async fn set_phase(&self, id: DocumentId, phase: IngestionPhase) -> Result<bool, StoreError>;

    /// Documents ready for downstream stages (phase Ingested), optionally
    /// restricted to the given cases.
    async fn ready_documents(
        &self,
        cases: Option<&[CaseId]>,
    ) -> Result<Vec<CaseDocument>, StoreError>;

    /// Latest ingestion phase for a case (most recent phase change wins).
    async fn latest_phase_for_case(
        &self,
        case_id: CaseId,
    ) -> Result<Option<(IngestionPhase, DateTime<Utc>)>, StoreError>;
}

/// Answer reservation persistence.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Atomic get-or-create for (case, query, document).
    ///
    /// On create, assigns the next version for (case, query); on hit, the
    /// stored row is returned untouched. Returns whether this call created
    /// the row. The version never changes after first assignment.
    async fn reserve(&self, key: ReservationKey) -> Result<(AnswerReservation, bool), StoreError>;

    async fn get(&self, key: ReservationKey) -> Result<Option<AnswerReservation>, StoreError>;

    /// Conditional claim: New|Failed -> InProgress.
    ///
    /// The affected-row count is the concurrency guard; `false` means
    /// another worker holds it or it is already Done.
    async fn try_claim(&self, key: ReservationKey) -> Result<bool, StoreError>;

    /// InProgress -> Done.
    async fn complete(&self, key: ReservationKey) -> Result<(), StoreError>;

    /// InProgress -> Failed (eligible for a future retry).
    async fn fail(&self, key: ReservationKey) -> Result<(), StoreError>;

    async fn list_for_case(&self, case_id: CaseId) -> Result<Vec<AnswerReservation>, StoreError>;
}

/// Answer persistence.
#[async_trait]
pub trait AnswerStore: Send + Sync {
    /// Insert or replace the answer for (case, query, version).
    ///
    /// Replacement only ever happens when a prior attempt failed before its
    /// reservation reached Done; the pipeline never re-generates a Done
    /// reservation, so a Done answer is immutable in practice.
    async fn upsert(&self, answer: Answer) -> Result<(), StoreError>;

    async fn get(
        &self,
        case_id: CaseId,
        query_id: QueryId,
        version: i32,
    ) -> Result<Option<Answer>, StoreError>;

    async fn list_for_case(&self, case_id: CaseId) -> Result<Vec<Answer>, StoreError>;
}

/// Query catalogue persistence (read side).
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// All catalogue queries with their version history, ordered by position.
    async fn list(&self) -> Result<Vec<QueryDefinition>, StoreError>;

    async fn get(&self, id: QueryId) -> Result<Option<QueryDefinition>, StoreError>;
}
