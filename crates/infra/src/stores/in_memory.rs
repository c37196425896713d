//! In-memory store implementations for tests/dev.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use dossier_answers::{Answer, AnswerReservation, ReservationKey, ReservationStatus};
use dossier_catalog::QueryDefinition;
use dossier_core::{CaseId, DocumentId, MaterialId, QueryId};
use dossier_documents::{CaseDocument, IngestionPhase};

use super::{AnswerStore, CatalogStore, DocumentStore, ReservationStore, StoreError};

/// In-memory document store.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    documents: Mutex<HashMap<DocumentId, CaseDocument>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<CaseDocument> {
        self.documents.lock().unwrap().values().cloned().collect()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn insert_if_absent(
        &self,
        document: CaseDocument,
    ) -> Result<(CaseDocument, bool), StoreError> {
        let mut documents = self.documents.lock().unwrap();
        if let Some(existing) = documents
            .values()
            .find(|d| d.case_id == document.case_id && d.material_id == document.material_id)
        {
            return Ok((existing.clone(), false));
        }
        documents.insert(document.id, document.clone());
        Ok((document, true))
    }

    async fn find_by_case_and_material(
        &self,
        case_id: CaseId,
        material_id: MaterialId,
    ) -> Result<Option<CaseDocument>, StoreError> {
        let documents = self.documents.lock().unwrap();
        Ok(documents
            .values()
            .find(|d| d.case_id == case_id && d.material_id == material_id)
            .cloned())
    }

    async fn get(&self, id: DocumentId) -> Result<Option<CaseDocument>, StoreError> {
        Ok(self.documents.lock().unwrap().get(&id).cloned())
    }

    async fn set_phase(&self, id: DocumentId, phase: IngestionPhase) -> Result<bool, StoreError> {
        let mut documents = self.documents.lock().unwrap();
        match documents.get_mut(&id) {
            Some(doc) => Ok(doc.advance_phase(phase)),
            None => Ok(false),
        }
    }

    async fn ready_documents(
        &self,
        cases: Option<&[CaseId]>,
    ) -> Result<Vec<CaseDocument>, StoreError> {
        let documents = self.documents.lock().unwrap();
        let mut ready: Vec<CaseDocument> = documents
            .values()
            .filter(|d| d.ingestion_phase == IngestionPhase::Ingested)
            .filter(|d| cases.is_none_or(|cs| cs.contains(&d.case_id)))
            .cloned()
            .collect();
        ready.sort_by_key(|d| (d.case_id, d.id));
        Ok(ready)
    }

    async fn latest_phase_for_case(
        &self,
        case_id: CaseId,
    ) -> Result<Option<(IngestionPhase, DateTime<Utc>)>, StoreError> {
        let documents = self.documents.lock().unwrap();
        Ok(documents
            .values()
            .filter(|d| d.case_id == case_id)
            .max_by_key(|d| d.phase_changed_at)
            .map(|d| (d.ingestion_phase, d.phase_changed_at)))
    }
}

/// In-memory reservation store.
#[derive(Debug, Default)]
pub struct InMemoryReservationStore {
    reservations: Mutex<HashMap<ReservationKey, AnswerReservation>>,
}

impl InMemoryReservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<AnswerReservation> {
        self.reservations.lock().unwrap().values().cloned().collect()
    }

    fn transition(
        &self,
        key: ReservationKey,
        next: ReservationStatus,
    ) -> Result<(), StoreError> {
        let mut reservations = self.reservations.lock().unwrap();
        let reservation = reservations.get_mut(&key).ok_or(StoreError::NotFound)?;
        if !reservation.status.can_transition_to(next) {
            return Err(StoreError::conflict(format!(
                "reservation {:?} -> {:?} not allowed",
                reservation.status, next
            )));
        }
        reservation.status = next;
        reservation.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl ReservationStore for InMemoryReservationStore {
    async fn reserve(&self, key: ReservationKey) -> Result<(AnswerReservation, bool), StoreError> {
        let mut reservations = self.reservations.lock().unwrap();
        if let Some(existing) = reservations.get(&key) {
            return Ok((existing.clone(), false));
        }
        // Next version per (case, query), assigned under the same lock that
        // inserts the row.
        let version = reservations
            .values()
            .filter(|r| r.key.case_id == key.case_id && r.key.query_id == key.query_id)
            .map(|r| r.version)
            .max()
            .unwrap_or(0)
            + 1;
        let reservation = AnswerReservation::new(key, version);
        reservations.insert(key, reservation.clone());
        Ok((reservation, true))
    }

    async fn get(&self, key: ReservationKey) -> Result<Option<AnswerReservation>, StoreError> {
        Ok(self.reservations.lock().unwrap().get(&key).cloned())
    }

    async fn try_claim(&self, key: ReservationKey) -> Result<bool, StoreError> {
        let mut reservations = self.reservations.lock().unwrap();
        match reservations.get_mut(&key) {
            Some(r) if r.status.is_claimable() => {
                r.status = ReservationStatus::InProgress;
                r.updated_at = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn complete(&self, key: ReservationKey) -> Result<(), StoreError> {
        self.transition(key, ReservationStatus::Done)
    }

    async fn fail(&self, key: ReservationKey) -> Result<(), StoreError> {
        self.transition(key, ReservationStatus::Failed)
    }

    async fn list_for_case(&self, case_id: CaseId) -> Result<Vec<AnswerReservation>, StoreError> {
        let reservations = self.reservations.lock().unwrap();
        let mut out: Vec<AnswerReservation> = reservations
            .values()
            .filter(|r| r.key.case_id == case_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.key);
        Ok(out)
    }
}

/// In-memory answer store.
#[derive(Debug, Default)]
pub struct InMemoryAnswerStore {
    answers: Mutex<HashMap<(CaseId, QueryId, i32), Answer>>,
}

impl InMemoryAnswerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.answers.lock().unwrap().len()
    }
}

#[async_trait]
impl AnswerStore for InMemoryAnswerStore {
    async fn upsert(&self, answer: Answer) -> Result<(), StoreError> {
        let key = (answer.case_id, answer.query_id, answer.version);
        self.answers.lock().unwrap().insert(key, answer);
        Ok(())
    }

    async fn get(
        &self,
        case_id: CaseId,
        query_id: QueryId,
        version: i32,
    ) -> Result<Option<Answer>, StoreError> {
        Ok(self
            .answers
            .lock()
            .unwrap()
            .get(&(case_id, query_id, version))
            .cloned())
    }

    async fn list_for_case(&self, case_id: CaseId) -> Result<Vec<Answer>, StoreError> {
        let answers = self.answers.lock().unwrap();
        let mut out: Vec<Answer> = answers
            .values()
            .filter(|a| a.case_id == case_id)
            .cloned()
            .collect();
        out.sort_by_key(|a| (a.query_id, a.version));
        Ok(out)
    }
}

/// In-memory catalogue store, seeded up front.
#[derive(Debug, Default)]
pub struct InMemoryCatalogStore {
    definitions: Mutex<Vec<QueryDefinition>>,
}

impl InMemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(definitions: Vec<QueryDefinition>) -> Self {
        Self {
            definitions: Mutex::new(definitions),
        }
    }

    pub fn seed(&self, definition: QueryDefinition) {
        self.definitions.lock().unwrap().push(definition);
    }
}

#[async_trait]
impl CatalogStore for InMemoryCatalogStore {
    async fn list(&self) -> Result<Vec<QueryDefinition>, StoreError> {
        let mut definitions = self.definitions.lock().unwrap().clone();
        definitions.sort_by_key(|d| d.query.position);
        Ok(definitions)
    }

    async fn get(&self, id: QueryId) -> Result<Option<QueryDefinition>, StoreError> {
        Ok(self
            .definitions
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.query.id == id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ReservationKey {
        ReservationKey {
            case_id: CaseId::new(),
            query_id: QueryId::new(),
            document_id: DocumentId::new(),
        }
    }

    #[tokio::test]
    async fn upload_is_idempotent_per_case_and_material() {
        let store = InMemoryDocumentStore::new();
        let case_id = CaseId::new();
        let material_id = MaterialId::new();

        let first = CaseDocument::uploaded(case_id, material_id, "s3://a", 1, "application/pdf");
        let (stored, inserted) = store.insert_if_absent(first.clone()).await.unwrap();
        assert!(inserted);
        assert_eq!(stored.id, first.id);

        let second = CaseDocument::uploaded(case_id, material_id, "s3://b", 2, "application/pdf");
        let (stored, inserted) = store.insert_if_absent(second).await.unwrap();
        assert!(!inserted);
        // The original row is reused, not replaced.
        assert_eq!(stored.id, first.id);
        assert_eq!(store.all().len(), 1);
    }

    #[tokio::test]
    async fn reserve_is_get_or_create_with_stable_version() {
        let store = InMemoryReservationStore::new();
        let k = key();

        let (first, created) = store.reserve(k).await.unwrap();
        assert!(created);
        assert_eq!(first.version, 1);
        assert_eq!(first.status, ReservationStatus::New);

        let (second, created) = store.reserve(k).await.unwrap();
        assert!(!created);
        assert_eq!(second.version, 1);
    }

    #[tokio::test]
    async fn versions_increase_per_case_and_query_across_documents() {
        let store = InMemoryReservationStore::new();
        let case_id = CaseId::new();
        let query_id = QueryId::new();

        let (first, _) = store
            .reserve(ReservationKey {
                case_id,
                query_id,
                document_id: DocumentId::new(),
            })
            .await
            .unwrap();
        let (second, _) = store
            .reserve(ReservationKey {
                case_id,
                query_id,
                document_id: DocumentId::new(),
            })
            .await
            .unwrap();

        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
    }

    #[tokio::test]
    async fn claim_guard_rejects_done_and_in_progress() {
        let store = InMemoryReservationStore::new();
        let k = key();
        store.reserve(k).await.unwrap();

        assert!(store.try_claim(k).await.unwrap());
        // Already in progress: second claim loses.
        assert!(!store.try_claim(k).await.unwrap());

        store.complete(k).await.unwrap();
        // Done blocks regeneration permanently.
        assert!(!store.try_claim(k).await.unwrap());
    }

    #[tokio::test]
    async fn failed_reservation_is_reclaimable() {
        let store = InMemoryReservationStore::new();
        let k = key();
        store.reserve(k).await.unwrap();

        assert!(store.try_claim(k).await.unwrap());
        store.fail(k).await.unwrap();
        assert!(store.try_claim(k).await.unwrap());
    }

    #[tokio::test]
    async fn invalid_transition_is_a_conflict() {
        let store = InMemoryReservationStore::new();
        let k = key();
        store.reserve(k).await.unwrap();

        // Never claimed: New -> Done is not a legal edge.
        let err = store.complete(k).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn sticky_terminal_document_phase() {
        let store = InMemoryDocumentStore::new();
        let doc = CaseDocument::uploaded(
            CaseId::new(),
            MaterialId::new(),
            "s3://a",
            1,
            "application/pdf",
        );
        let id = doc.id;
        store.insert_if_absent(doc).await.unwrap();

        assert!(store.set_phase(id, IngestionPhase::Ingested).await.unwrap());
        assert!(!store.set_phase(id, IngestionPhase::Failed).await.unwrap());
        assert_eq!(
            store.get(id).await.unwrap().unwrap().ingestion_phase,
            IngestionPhase::Ingested
        );
    }

    #[tokio::test]
    async fn ready_documents_filters_by_phase_and_case() {
        let store = InMemoryDocumentStore::new();
        let case_a = CaseId::new();
        let case_b = CaseId::new();

        let doc_a = CaseDocument::uploaded(case_a, MaterialId::new(), "s3://a", 1, "text/plain");
        let doc_b = CaseDocument::uploaded(case_b, MaterialId::new(), "s3://b", 1, "text/plain");
        let a_id = doc_a.id;
        store.insert_if_absent(doc_a).await.unwrap();
        store.insert_if_absent(doc_b).await.unwrap();
        store.set_phase(a_id, IngestionPhase::Ingested).await.unwrap();

        let ready = store.ready_documents(None).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].case_id, case_a);

        let ready = store.ready_documents(Some(&[case_b])).await.unwrap();
        assert!(ready.is_empty());
    }
}
