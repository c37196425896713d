//! Application wiring and HTTP surface.
//!
//! Two endpoints: an asynchronous run trigger that always acknowledges
//! immediately, and a read-only ingestion status query. Failures never
//! surface synchronously to the trigger caller; they show up later through
//! the status query.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use dossier_catalog::{Query, QueryDefinition, QueryVersion};
use dossier_core::{CaseId, QueryId};
use dossier_infra::config::{PipelineConfig, SchedulerConfig};
use dossier_infra::external::{
    InMemoryAnsweringService, InMemoryCaseListing, InMemoryContentResolver,
    InMemoryMaterialResolver, InMemoryObjectStore, ScriptedStatusSource, StatusMapping,
};
use dossier_infra::pipeline::{
    Orchestrator, PipelineDeps, RunTrigger, SpawningRunTrigger, parse_case_allow_list,
};
use dossier_infra::queue::{ClaimQueue, InMemoryClaimQueue, PgClaimQueue};
use dossier_infra::scheduler::{VerificationScheduler, VerificationSchedulerHandle};
use dossier_infra::stores::{
    AnswerStore, CatalogStore, DocumentStore, InMemoryAnswerStore, InMemoryCatalogStore,
    InMemoryDocumentStore, InMemoryReservationStore, PgAnswerStore, PgCatalogStore,
    PgDocumentStore, PgReservationStore, ReservationStore,
};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    trigger: Arc<dyn RunTrigger>,
    documents: Arc<dyn DocumentStore>,
    // Keeps the scheduler loop alive for the lifetime of the app.
    _scheduler: Arc<VerificationSchedulerHandle>,
}

struct Stores {
    documents: Arc<dyn DocumentStore>,
    reservations: Arc<dyn ReservationStore>,
    answers: Arc<dyn AnswerStore>,
    catalog: Arc<dyn CatalogStore>,
    queue: Arc<dyn ClaimQueue>,
}

fn in_memory_stores() -> Stores {
    // Dev/test wiring: a small seeded catalogue so triggered runs have
    // something to reserve.
    let catalog = InMemoryCatalogStore::new();
    for (position, label) in ["parties", "claims", "relief-sought"].iter().enumerate() {
        let id = QueryId::new();
        catalog.seed(
            QueryDefinition::new(Query {
                id,
                label: (*label).to_string(),
                position: position as i32,
            })
            .with_version(QueryVersion {
                query_id: id,
                effective_at: Utc::now(),
                question: format!("Summarize the {label} for this case."),
                prompt_template: format!("{label}-v1"),
            }),
        );
    }

    Stores {
        documents: Arc::new(InMemoryDocumentStore::new()),
        reservations: Arc::new(InMemoryReservationStore::new()),
        answers: Arc::new(InMemoryAnswerStore::new()),
        catalog: Arc::new(catalog),
        queue: Arc::new(InMemoryClaimQueue::new()),
    }
}

fn postgres_stores(database_url: &str) -> Result<Stores, sqlx::Error> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect_lazy(database_url)?;

    Ok(Stores {
        documents: Arc::new(PgDocumentStore::new(pool.clone())),
        reservations: Arc::new(PgReservationStore::new(pool.clone())),
        answers: Arc::new(PgAnswerStore::new(pool.clone())),
        catalog: Arc::new(PgCatalogStore::new(pool.clone())),
        queue: Arc::new(PgClaimQueue::new(pool)),
    })
}

/// Build the application: stores, orchestrator, scheduler, and routes.
///
/// With `DATABASE_URL` set the stores and queue are Postgres-backed;
/// otherwise everything runs in memory. The upstream collaborators (listing,
/// resolvers, storage, status source, answering service) are deployment
/// clients; the in-process fakes stand in until one is wired.
pub async fn build_app() -> Router {
    let stores = match std::env::var("DATABASE_URL") {
        Ok(url) => match postgres_stores(&url) {
            Ok(stores) => {
                tracing::info!("using postgres-backed stores");
                stores
            }
            Err(err) => {
                tracing::warn!(error = %err, "DATABASE_URL unusable; falling back to in-memory");
                in_memory_stores()
            }
        },
        Err(_) => {
            tracing::info!("DATABASE_URL not set; using in-memory stores");
            in_memory_stores()
        }
    };

    let status_source = Arc::new(ScriptedStatusSource::new());

    let orchestrator = Arc::new(Orchestrator::new(
        PipelineConfig::default(),
        PipelineDeps {
            listing: Arc::new(InMemoryCaseListing::new()),
            materials: Arc::new(InMemoryMaterialResolver::new()),
            content: Arc::new(InMemoryContentResolver::new()),
            storage: Arc::new(InMemoryObjectStore::new()),
            answering: Arc::new(InMemoryAnsweringService::new()),
            documents: stores.documents.clone(),
            reservations: stores.reservations.clone(),
            answers: stores.answers.clone(),
            catalog: stores.catalog.clone(),
            queue: stores.queue.clone(),
        },
    ));
    let trigger: Arc<dyn RunTrigger> = Arc::new(SpawningRunTrigger::new(orchestrator));

    let scheduler = VerificationScheduler::new(
        SchedulerConfig::default(),
        stores.queue.clone(),
        stores.documents.clone(),
        status_source,
        StatusMapping::default(),
        trigger.clone(),
    );
    let scheduler_handle = Arc::new(scheduler.spawn());

    let state = AppState {
        trigger,
        documents: stores.documents,
        _scheduler: scheduler_handle,
    };

    build_router(state)
}

/// Routes only; state is injected so tests can wire their own.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/pipeline/runs", post(trigger_run))
        .route("/cases/:case_id/ingestion", get(ingestion_status))
        .layer(Extension(state))
}

#[derive(Debug, Deserialize)]
pub struct TriggerRunRequest {
    /// Explicit case allow-list. Malformed ids are dropped with a warning.
    #[serde(default)]
    pub case_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct TriggerRunResponse {
    pub status: &'static str,
    pub run_id: Uuid,
    pub accepted_cases: usize,
}

async fn trigger_run(
    Extension(state): Extension<AppState>,
    Json(request): Json<TriggerRunRequest>,
) -> impl IntoResponse {
    let case_ids = parse_case_allow_list(&request.case_ids);
    let accepted_cases = case_ids.len();
    let run_id = state.trigger.trigger(case_ids).await;

    (
        StatusCode::ACCEPTED,
        Json(TriggerRunResponse {
            status: "accepted",
            run_id,
            accepted_cases,
        }),
    )
}

#[derive(Debug, Serialize)]
pub struct IngestionStatusResponse {
    pub case_id: CaseId,
    pub phase: &'static str,
    pub changed_at: DateTime<Utc>,
}

async fn ingestion_status(
    Extension(state): Extension<AppState>,
    Path(case_id): Path<String>,
) -> axum::response::Response {
    let case_id: CaseId = match case_id.parse() {
        Ok(case_id) => case_id,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": err.to_string() })))
                .into_response();
        }
    };

    match state.documents.latest_phase_for_case(case_id).await {
        Ok(Some((phase, changed_at))) => (
            StatusCode::OK,
            Json(IngestionStatusResponse {
                case_id,
                phase: phase.as_str(),
                changed_at,
            }),
        )
            .into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            tracing::error!(case = %case_id, error = %err, "ingestion status lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dossier_core::MaterialId;
    use dossier_documents::{CaseDocument, IngestionPhase};
    use dossier_infra::pipeline::RecordingRunTrigger;

    fn test_state(
        trigger: Arc<RecordingRunTrigger>,
        documents: Arc<InMemoryDocumentStore>,
    ) -> AppState {
        let scheduler = VerificationScheduler::new(
            SchedulerConfig::default(),
            Arc::new(InMemoryClaimQueue::new()),
            documents.clone(),
            Arc::new(ScriptedStatusSource::new()),
            StatusMapping::default(),
            trigger.clone(),
        );
        AppState {
            trigger,
            documents,
            _scheduler: Arc::new(scheduler.spawn()),
        }
    }

    #[tokio::test]
    async fn trigger_accepts_and_drops_malformed_ids() {
        let trigger = Arc::new(RecordingRunTrigger::new());
        let documents = Arc::new(InMemoryDocumentStore::new());
        let state = test_state(trigger.clone(), documents);

        let case_id = CaseId::new();
        let response = trigger_run(
            Extension(state),
            Json(TriggerRunRequest {
                case_ids: vec![case_id.to_string(), "garbage".to_string()],
            }),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(trigger.calls(), vec![vec![case_id]]);
    }

    #[tokio::test]
    async fn trigger_accepts_empty_sets() {
        let trigger = Arc::new(RecordingRunTrigger::new());
        let documents = Arc::new(InMemoryDocumentStore::new());
        let state = test_state(trigger.clone(), documents);

        let response = trigger_run(
            Extension(state),
            Json(TriggerRunRequest { case_ids: vec![] }),
        )
        .await
        .into_response();

        // Always "accepted": failures surface via the status query only.
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn ingestion_status_reflects_latest_phase() {
        let trigger = Arc::new(RecordingRunTrigger::new());
        let documents = Arc::new(InMemoryDocumentStore::new());
        let state = test_state(trigger, documents.clone());

        let doc = CaseDocument::uploaded(
            CaseId::new(),
            MaterialId::new(),
            "mem://x",
            1,
            "application/pdf",
        );
        let case_id = doc.case_id;
        let (doc, _) = documents.insert_if_absent(doc).await.unwrap();
        documents
            .set_phase(doc.id, IngestionPhase::Ingested)
            .await
            .unwrap();

        let response =
            ingestion_status(Extension(state), Path(case_id.to_string())).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_case_is_not_found_and_bad_id_is_rejected() {
        let trigger = Arc::new(RecordingRunTrigger::new());
        let documents = Arc::new(InMemoryDocumentStore::new());
        let state = test_state(trigger, documents);

        let response = ingestion_status(
            Extension(state.clone()),
            Path(CaseId::new().to_string()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = ingestion_status(Extension(state), Path("nope".to_string())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
