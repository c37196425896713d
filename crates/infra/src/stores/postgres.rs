//! Postgres store implementations.
//!
//! Every coordination point is a single conditional statement (conditional
//! update, insert-on-conflict, returning clause); no application-level lock
//! spans more than one statement.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use dossier_answers::{Answer, AnswerReservation, ReservationKey, ReservationStatus};
use dossier_catalog::{Query, QueryDefinition, QueryVersion};
use dossier_core::{CaseId, DocumentId, MaterialId, QueryId};
use dossier_documents::{CaseDocument, IngestionPhase};

use super::{AnswerStore, CatalogStore, DocumentStore, ReservationStore, StoreError};

fn storage_err(e: sqlx::Error) -> StoreError {
    StoreError::storage(e.to_string())
}

fn column_err(e: sqlx::Error) -> StoreError {
    StoreError::storage(format!("row decode: {e}"))
}

/// Postgres-backed document store over `case_documents`.
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_document(row: &PgRow) -> Result<CaseDocument, StoreError> {
    let phase_raw: String = row.try_get("ingestion_phase").map_err(column_err)?;
    let ingestion_phase = IngestionPhase::from_str(&phase_raw).map_err(StoreError::Storage)?;

    Ok(CaseDocument {
        id: DocumentId::from_uuid(row.try_get::<Uuid, _>("id").map_err(column_err)?),
        case_id: CaseId::from_uuid(row.try_get::<Uuid, _>("case_id").map_err(column_err)?),
        material_id: MaterialId::from_uuid(
            row.try_get::<Uuid, _>("material_id").map_err(column_err)?,
        ),
        storage_uri: row.try_get("storage_uri").map_err(column_err)?,
        ingestion_phase,
        phase_changed_at: row.try_get("phase_changed_at").map_err(column_err)?,
        size_bytes: row.try_get("size_bytes").map_err(column_err)?,
        content_type: row.try_get("content_type").map_err(column_err)?,
        uploaded_at: row.try_get("uploaded_at").map_err(column_err)?,
    })
}

const DOCUMENT_COLUMNS: &str = "id, case_id, material_id, storage_uri, ingestion_phase, \
     phase_changed_at, size_bytes, content_type, uploaded_at";

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn insert_if_absent(
        &self,
        document: CaseDocument,
    ) -> Result<(CaseDocument, bool), StoreError> {
        // The unique index on (case_id, material_id) makes the insert a
        // no-op on a race; the follow-up select reads whichever row won.
        let inserted = sqlx::query(
            r#"
            INSERT INTO case_documents
                (id, case_id, material_id, storage_uri, ingestion_phase,
                 phase_changed_at, size_bytes, content_type, uploaded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (case_id, material_id) DO NOTHING
            "#,
        )
        .bind(document.id.as_uuid())
        .bind(document.case_id.as_uuid())
        .bind(document.material_id.as_uuid())
        .bind(&document.storage_uri)
        .bind(document.ingestion_phase.as_str())
        .bind(document.phase_changed_at)
        .bind(document.size_bytes)
        .bind(&document.content_type)
        .bind(document.uploaded_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?
        .rows_affected()
            == 1;

        if inserted {
            return Ok((document, true));
        }

        let existing = self
            .find_by_case_and_material(document.case_id, document.material_id)
            .await?
            .ok_or(StoreError::NotFound)?;
        Ok((existing, false))
    }

    async fn find_by_case_and_material(
        &self,
        case_id: CaseId,
        material_id: MaterialId,
    ) -> Result<Option<CaseDocument>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM case_documents \
             WHERE case_id = $1 AND material_id = $2"
        ))
        .bind(case_id.as_uuid())
        .bind(material_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.as_ref().map(row_to_document).transpose()
    }

    async fn get(&self, id: DocumentId) -> Result<Option<CaseDocument>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM case_documents WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.as_ref().map(row_to_document).transpose()
    }

    async fn set_phase(&self, id: DocumentId, phase: IngestionPhase) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE case_documents
            SET ingestion_phase = $2, phase_changed_at = now()
            WHERE id = $1 AND ingestion_phase NOT IN ('ingested', 'failed')
            "#,
        )
        .bind(id.as_uuid())
        .bind(phase.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn ready_documents(
        &self,
        cases: Option<&[CaseId]>,
    ) -> Result<Vec<CaseDocument>, StoreError> {
        let rows = match cases {
            Some(cases) => {
                let ids: Vec<Uuid> = cases.iter().map(|c| *c.as_uuid()).collect();
                sqlx::query(&format!(
                    "SELECT {DOCUMENT_COLUMNS} FROM case_documents \
                     WHERE ingestion_phase = 'ingested' AND case_id = ANY($1) \
                     ORDER BY case_id, id"
                ))
                .bind(&ids)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {DOCUMENT_COLUMNS} FROM case_documents \
                     WHERE ingestion_phase = 'ingested' ORDER BY case_id, id"
                ))
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(storage_err)?;

        rows.iter().map(row_to_document).collect()
    }

    async fn latest_phase_for_case(
        &self,
        case_id: CaseId,
    ) -> Result<Option<(IngestionPhase, DateTime<Utc>)>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT ingestion_phase, phase_changed_at
            FROM case_documents
            WHERE case_id = $1
            ORDER BY phase_changed_at DESC
            LIMIT 1
            "#,
        )
        .bind(case_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.map(|r| {
            let phase_raw: String = r.try_get("ingestion_phase").map_err(column_err)?;
            let phase = IngestionPhase::from_str(&phase_raw).map_err(StoreError::Storage)?;
            let at: DateTime<Utc> = r.try_get("phase_changed_at").map_err(column_err)?;
            Ok((phase, at))
        })
        .transpose()
    }
}

/// Postgres-backed reservation store over `answer_reservations`.
pub struct PgReservationStore {
    pool: PgPool,
}

impl PgReservationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_reservation(row: &PgRow) -> Result<AnswerReservation, StoreError> {
    let status_raw: String = row.try_get("status").map_err(column_err)?;
    let status = ReservationStatus::from_str(&status_raw).map_err(StoreError::Storage)?;

    Ok(AnswerReservation {
        key: ReservationKey {
            case_id: CaseId::from_uuid(row.try_get::<Uuid, _>("case_id").map_err(column_err)?),
            query_id: QueryId::from_uuid(row.try_get::<Uuid, _>("query_id").map_err(column_err)?),
            document_id: DocumentId::from_uuid(
                row.try_get::<Uuid, _>("document_id").map_err(column_err)?,
            ),
        },
        version: row.try_get("version").map_err(column_err)?,
        status,
        updated_at: row.try_get("updated_at").map_err(column_err)?,
    })
}

impl PgReservationStore {
    async fn transition(
        &self,
        key: ReservationKey,
        from: &str,
        to: ReservationStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE answer_reservations
            SET status = $4, updated_at = now()
            WHERE case_id = $1 AND query_id = $2 AND document_id = $3 AND status = $5
            "#,
        )
        .bind(key.case_id.as_uuid())
        .bind(key.query_id.as_uuid())
        .bind(key.document_id.as_uuid())
        .bind(to.as_str())
        .bind(from)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::conflict(format!(
                "reservation not {from} (or missing)"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ReservationStore for PgReservationStore {
    async fn reserve(&self, key: ReservationKey) -> Result<(AnswerReservation, bool), StoreError> {
        // Version assignment happens inside the insert itself; the unique
        // index on (case_id, query_id, version) turns a concurrent sibling
        // insert into a retryable unique violation instead of a duplicate
        // version.
        for _ in 0..3 {
            let inserted = sqlx::query(
                r#"
                INSERT INTO answer_reservations
                    (case_id, query_id, document_id, version, status, updated_at)
                SELECT $1, $2, $3,
                       COALESCE((SELECT MAX(version) FROM answer_reservations
                                 WHERE case_id = $1 AND query_id = $2), 0) + 1,
                       'new', now()
                ON CONFLICT (case_id, query_id, document_id) DO NOTHING
                RETURNING case_id, query_id, document_id, version, status, updated_at
                "#,
            )
            .bind(key.case_id.as_uuid())
            .bind(key.query_id.as_uuid())
            .bind(key.document_id.as_uuid())
            .fetch_optional(&self.pool)
            .await;

            match inserted {
                Ok(Some(row)) => return Ok((row_to_reservation(&row)?, true)),
                Ok(None) => {
                    // Conflict on the natural key: the row already exists.
                    let existing = self.get(key).await?.ok_or(StoreError::NotFound)?;
                    return Ok((existing, false));
                }
                Err(e) => {
                    let unique_version_race = e
                        .as_database_error()
                        .and_then(|d| d.constraint())
                        .is_some_and(|c| c.contains("version"));
                    if !unique_version_race {
                        return Err(storage_err(e));
                    }
                    // Sibling document grabbed the version; recompute.
                }
            }
        }

        Err(StoreError::conflict(
            "reservation version contention, gave up",
        ))
    }

    async fn get(&self, key: ReservationKey) -> Result<Option<AnswerReservation>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT case_id, query_id, document_id, version, status, updated_at
            FROM answer_reservations
            WHERE case_id = $1 AND query_id = $2 AND document_id = $3
            "#,
        )
        .bind(key.case_id.as_uuid())
        .bind(key.query_id.as_uuid())
        .bind(key.document_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.as_ref().map(row_to_reservation).transpose()
    }

    async fn try_claim(&self, key: ReservationKey) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE answer_reservations
            SET status = 'in_progress', updated_at = now()
            WHERE case_id = $1 AND query_id = $2 AND document_id = $3
              AND status IN ('new', 'failed')
            "#,
        )
        .bind(key.case_id.as_uuid())
        .bind(key.query_id.as_uuid())
        .bind(key.document_id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        // Zero rows updated: another worker already claimed it, or it is
        // Done. Either way this worker skips.
        Ok(result.rows_affected() == 1)
    }

    async fn complete(&self, key: ReservationKey) -> Result<(), StoreError> {
        self.transition(key, "in_progress", ReservationStatus::Done)
            .await
    }

    async fn fail(&self, key: ReservationKey) -> Result<(), StoreError> {
        self.transition(key, "in_progress", ReservationStatus::Failed)
            .await
    }

    async fn list_for_case(&self, case_id: CaseId) -> Result<Vec<AnswerReservation>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT case_id, query_id, document_id, version, status, updated_at
            FROM answer_reservations
            WHERE case_id = $1
            ORDER BY query_id, document_id
            "#,
        )
        .bind(case_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(row_to_reservation).collect()
    }
}

/// Postgres-backed answer store over `answers`.
pub struct PgAnswerStore {
    pool: PgPool,
}

impl PgAnswerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_answer(row: &PgRow) -> Result<Answer, StoreError> {
    Ok(Answer {
        case_id: CaseId::from_uuid(row.try_get::<Uuid, _>("case_id").map_err(column_err)?),
        query_id: QueryId::from_uuid(row.try_get::<Uuid, _>("query_id").map_err(column_err)?),
        version: row.try_get("version").map_err(column_err)?,
        created_at: row.try_get("created_at").map_err(column_err)?,
        text: row.try_get("answer_text").map_err(column_err)?,
        supporting_input: row.try_get("supporting_input").map_err(column_err)?,
    })
}

#[async_trait]
impl AnswerStore for PgAnswerStore {
    async fn upsert(&self, answer: Answer) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO answers
                (case_id, query_id, version, created_at, answer_text, supporting_input)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (case_id, query_id, version)
            DO UPDATE SET created_at = EXCLUDED.created_at,
                          answer_text = EXCLUDED.answer_text,
                          supporting_input = EXCLUDED.supporting_input
            "#,
        )
        .bind(answer.case_id.as_uuid())
        .bind(answer.query_id.as_uuid())
        .bind(answer.version)
        .bind(answer.created_at)
        .bind(&answer.text)
        .bind(&answer.supporting_input)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn get(
        &self,
        case_id: CaseId,
        query_id: QueryId,
        version: i32,
    ) -> Result<Option<Answer>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT case_id, query_id, version, created_at, answer_text, supporting_input
            FROM answers
            WHERE case_id = $1 AND query_id = $2 AND version = $3
            "#,
        )
        .bind(case_id.as_uuid())
        .bind(query_id.as_uuid())
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.as_ref().map(row_to_answer).transpose()
    }

    async fn list_for_case(&self, case_id: CaseId) -> Result<Vec<Answer>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT case_id, query_id, version, created_at, answer_text, supporting_input
            FROM answers
            WHERE case_id = $1
            ORDER BY query_id, version
            "#,
        )
        .bind(case_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(row_to_answer).collect()
    }
}

/// Postgres-backed catalogue store over `queries` + `query_versions`.
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn versions_for(&self, query_id: QueryId) -> Result<Vec<QueryVersion>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT query_id, effective_at, question, prompt_template
            FROM query_versions
            WHERE query_id = $1
            ORDER BY effective_at
            "#,
        )
        .bind(query_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter()
            .map(|row| {
                Ok(QueryVersion {
                    query_id: QueryId::from_uuid(
                        row.try_get::<Uuid, _>("query_id").map_err(column_err)?,
                    ),
                    effective_at: row.try_get("effective_at").map_err(column_err)?,
                    question: row.try_get("question").map_err(column_err)?,
                    prompt_template: row.try_get("prompt_template").map_err(column_err)?,
                })
            })
            .collect()
    }
}

fn row_to_query(row: &PgRow) -> Result<Query, StoreError> {
    Ok(Query {
        id: QueryId::from_uuid(row.try_get::<Uuid, _>("id").map_err(column_err)?),
        label: row.try_get("label").map_err(column_err)?,
        position: row.try_get("position").map_err(column_err)?,
    })
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn list(&self) -> Result<Vec<QueryDefinition>, StoreError> {
        let rows = sqlx::query("SELECT id, label, position FROM queries ORDER BY position")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;

        let mut definitions = Vec::with_capacity(rows.len());
        for row in &rows {
            let query = row_to_query(row)?;
            let versions = self.versions_for(query.id).await?;
            definitions.push(QueryDefinition { query, versions });
        }
        Ok(definitions)
    }

    async fn get(&self, id: QueryId) -> Result<Option<QueryDefinition>, StoreError> {
        let row = sqlx::query("SELECT id, label, position FROM queries WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        match row {
            Some(row) => {
                let query = row_to_query(&row)?;
                let versions = self.versions_for(query.id).await?;
                Ok(Some(QueryDefinition { query, versions }))
            }
            None => Ok(None),
        }
    }
}
