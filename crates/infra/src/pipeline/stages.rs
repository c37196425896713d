//! Stage workers.
//!
//! One function per stage, sharing a bag of store/external seams. Stage
//! workers return `Ok(None)`/skip outcomes for business ineligibility and
//! reserve errors for retry-worthy or structural conditions — a skipped
//! case is not a failure.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use dossier_answers::{Answer, ReservationKey};
use dossier_catalog::QueryDefinition;
use dossier_core::{CaseId, DocumentId};
use dossier_documents::CaseDocument;

use crate::config::PipelineConfig;
use crate::external::{
    AnswerScope, AnsweringService, CaseListing, ContentResolver, ExternalError, MaterialResolver,
    ObjectStore,
};
use crate::queue::{ClaimQueue, QueueError, VerificationTask};
use crate::retry::RetryExecutor;
use crate::stores::{AnswerStore, CatalogStore, DocumentStore, ReservationStore, StoreError};

use super::context::{ResolvedCase, RunScope, UploadOutcome};

/// Failure inside one stage unit.
///
/// These are retry-worthy or structural; business-skip cases never surface
/// as errors.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("queue: {0}")]
    Queue(#[from] QueueError),
    #[error("external: {0}")]
    External(#[from] ExternalError),
}

/// Outcome of one generation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// Answer persisted, reservation Done.
    Generated,
    /// Nothing to do: unreserved, already Done, or claimed by another worker.
    Skipped,
    /// Retries exhausted or the response was unusable; reservation Failed.
    Failed,
}

/// The stage workers plus their shared dependencies.
pub struct StageWorkers {
    pub(crate) cfg: PipelineConfig,
    pub(crate) listing: Arc<dyn CaseListing>,
    pub(crate) materials: Arc<dyn MaterialResolver>,
    pub(crate) content: Arc<dyn ContentResolver>,
    pub(crate) storage: Arc<dyn ObjectStore>,
    pub(crate) answering: Arc<dyn AnsweringService>,
    pub(crate) documents: Arc<dyn DocumentStore>,
    pub(crate) reservations: Arc<dyn ReservationStore>,
    pub(crate) answers: Arc<dyn AnswerStore>,
    pub(crate) catalog: Arc<dyn CatalogStore>,
    pub(crate) queue: Arc<dyn ClaimQueue>,
}

fn content_type_for(name: &str) -> &'static str {
    match name.rsplit('.').next() {
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        Some("html") | Some("htm") => "text/html",
        Some("docx") => {
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        }
        _ => "application/octet-stream",
    }
}

impl StageWorkers {
    /// Stage 1: resolve candidate case ids for the requested scope.
    ///
    /// A blank scope key is a no-op, not an error.
    pub async fn fetch_candidates(&self, scope: &RunScope) -> Result<Vec<CaseId>, StageError> {
        let mut candidates = match scope {
            RunScope::Cases(ids) => ids.clone(),
            RunScope::Listing { scope_key } => {
                if scope_key.trim().is_empty() {
                    warn!("blank listing scope key; nothing to fetch");
                    return Ok(Vec::new());
                }
                let retry = RetryExecutor::new(self.cfg.upload_retry.clone());
                retry
                    .run("fetch-candidates", || {
                        let listing = self.listing.clone();
                        let scope_key = scope_key.clone();
                        async move { listing.list_candidates(&scope_key).await }
                    })
                    .await?
            }
        };
        candidates.sort();
        candidates.dedup();
        Ok(candidates)
    }

    /// Stage 2: confirm the case has something to ingest.
    ///
    /// `None` means ineligible — silently excluded from the rest of the run.
    pub async fn resolve_eligibility(
        &self,
        case_id: CaseId,
    ) -> Result<Option<ResolvedCase>, StageError> {
        let retry = RetryExecutor::new(self.cfg.upload_retry.clone());
        let material = retry
            .run("resolve-eligibility", || {
                let materials = self.materials.clone();
                let caller_id = self.cfg.caller_id.clone();
                async move { materials.resolve_latest(case_id, &caller_id).await }
            })
            .await?;

        match material {
            Some(material) => Ok(Some(ResolvedCase { case_id, material })),
            None => {
                debug!(case = %case_id, "no ingestible material; excluding case");
                Ok(None)
            }
        }
    }

    /// Stage 3: download, copy to durable storage, persist the document, and
    /// enqueue its verification task.
    ///
    /// Idempotent: an existing document for the same (case, material) is
    /// reused without touching any external service. `None` means the case
    /// was skipped (no downloadable content).
    pub async fn upload_and_persist(
        &self,
        resolved: &ResolvedCase,
    ) -> Result<Option<UploadOutcome>, StageError> {
        let case_id = resolved.case_id;
        let material = &resolved.material;

        if let Some(existing) = self
            .documents
            .find_by_case_and_material(case_id, material.material_id)
            .await?
        {
            debug!(case = %case_id, material = %material.material_id, document = %existing.id,
                "document already persisted; reusing");
            return Ok(Some(UploadOutcome {
                document: existing,
                reused: true,
            }));
        }

        let retry = RetryExecutor::new(self.cfg.upload_retry.clone());
        let material_id = material.material_id;
        let source_url = retry
            .run("resolve-download-url", || {
                let content = self.content.clone();
                let caller_id = self.cfg.caller_id.clone();
                async move { content.download_url(material_id, &caller_id).await }
            })
            .await?;
        let Some(source_url) = source_url else {
            debug!(case = %case_id, material = %material.material_id,
                "no downloadable content; skipping upload");
            return Ok(None);
        };

        // Deterministic destination: re-running lands on the same object.
        let dest_path = format!(
            "{}/cases/{}/materials/{}/{}",
            self.cfg.storage_prefix, case_id, material.material_id, material.display_name
        );
        let content_type = content_type_for(&material.display_name);
        let metadata = HashMap::from([
            ("case_id".to_string(), case_id.to_string()),
            ("material_id".to_string(), material.material_id.to_string()),
        ]);

        let storage_uri = retry
            .run("storage-copy", || {
                let storage = self.storage.clone();
                let source_url = source_url.clone();
                let dest_path = dest_path.clone();
                let metadata = metadata.clone();
                async move {
                    storage
                        .copy(&source_url, &dest_path, content_type, &metadata)
                        .await
                }
            })
            .await?;
        let size_bytes = retry
            .run("storage-size", || {
                let storage = self.storage.clone();
                let dest_path = dest_path.clone();
                async move { storage.size(&dest_path).await }
            })
            .await?;

        let document = CaseDocument::uploaded(
            case_id,
            material.material_id,
            storage_uri,
            size_bytes,
            content_type,
        );
        let (document, inserted) = self.documents.insert_if_absent(document).await?;

        if inserted {
            self.queue
                .enqueue(VerificationTask::new(
                    document.id,
                    case_id,
                    material.external_document_id.clone(),
                    self.cfg.verification_max_attempts,
                ))
                .await?;
            info!(case = %case_id, document = %document.id, "document uploaded, verification queued");
        }

        Ok(Some(UploadOutcome {
            document,
            reused: !inserted,
        }))
    }

    /// Stage 5: reserve a version for every catalogue query not yet reserved
    /// for (case, document). Already-reserved pairs are untouched.
    ///
    /// Returns (created, existing) counts.
    pub async fn reserve_for_document(
        &self,
        case_id: CaseId,
        document_id: DocumentId,
        catalog: &[QueryDefinition],
    ) -> Result<(usize, usize), StageError> {
        let mut created = 0;
        let mut existing = 0;
        for definition in catalog {
            let key = ReservationKey {
                case_id,
                query_id: definition.query.id,
                document_id,
            };
            let (reservation, was_created) = self.reservations.reserve(key).await?;
            if was_created {
                debug!(case = %case_id, query = %definition.query.id,
                    version = reservation.version, "reserved answer version");
                created += 1;
            } else {
                existing += 1;
            }
        }
        Ok((created, existing))
    }

    /// Stage 6: generate the answer for one (query, case, document) target.
    ///
    /// The conditional claim flip is the concurrency guard: zero rows
    /// updated means another worker owns it (or it is Done) and this worker
    /// skips. Failures land on the reservation, never on siblings.
    pub async fn generate_for_target(
        &self,
        definition: &QueryDefinition,
        case_id: CaseId,
        document_id: DocumentId,
    ) -> Result<GenerationOutcome, StageError> {
        let key = ReservationKey {
            case_id,
            query_id: definition.query.id,
            document_id,
        };

        let Some(reservation) = self.reservations.get(key).await? else {
            return Ok(GenerationOutcome::Skipped);
        };
        if !reservation.status.is_claimable() {
            return Ok(GenerationOutcome::Skipped);
        }
        if !self.reservations.try_claim(key).await? {
            debug!(case = %case_id, query = %definition.query.id, "lost reservation claim; skipping");
            return Ok(GenerationOutcome::Skipped);
        }

        let Some(in_force) = definition.in_force_at(Utc::now()) else {
            warn!(query = %definition.query.id, "no query definition in force; failing reservation");
            self.reservations.fail(key).await?;
            return Ok(GenerationOutcome::Failed);
        };

        let scope = AnswerScope {
            case_id,
            document_id,
        };
        let retry = RetryExecutor::new(self.cfg.answer_retry.clone());
        let result = retry
            .run("generate-answer", || {
                let answering = self.answering.clone();
                let question = in_force.question.clone();
                let template = in_force.prompt_template.clone();
                async move {
                    let payload = answering.answer(&question, &template, &scope).await?;
                    if payload.text.trim().is_empty() {
                        return Err(ExternalError::transient("blank answer text"));
                    }
                    Ok(payload)
                }
            })
            .await;

        match result {
            Ok(payload) => {
                let answer = Answer::new(
                    case_id,
                    definition.query.id,
                    reservation.version,
                    payload.text,
                    payload.supporting_chunks,
                );
                self.answers.upsert(answer).await?;
                self.reservations.complete(key).await?;
                info!(case = %case_id, query = %definition.query.id,
                    version = reservation.version, "answer generated");
                Ok(GenerationOutcome::Generated)
            }
            Err(err) => {
                warn!(case = %case_id, query = %definition.query.id, error = %err,
                    "answer generation failed; reservation marked for retry");
                self.reservations.fail(key).await?;
                Ok(GenerationOutcome::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_inference() {
        assert_eq!(content_type_for("brief.pdf"), "application/pdf");
        assert_eq!(content_type_for("notes.txt"), "text/plain");
        assert_eq!(content_type_for("blob"), "application/octet-stream");
    }
}
