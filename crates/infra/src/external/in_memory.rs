//! In-memory fakes for the external collaborators.
//!
//! Used by tests and dev wiring. The fakes count their calls so tests can
//! assert that idempotent re-runs make zero additional external calls.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use dossier_core::{CaseId, MaterialId};
use dossier_documents::MaterialRef;

use super::{
    AnswerPayload, AnswerScope, AnsweringService, CaseListing, ContentResolver, ExternalError,
    IngestionStatusSource, MaterialResolver, ObjectStore, StatusObservation,
};

/// Listing fake keyed by scope key.
#[derive(Debug, Default)]
pub struct InMemoryCaseListing {
    scopes: Mutex<HashMap<String, Vec<CaseId>>>,
}

impl InMemoryCaseListing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, scope_key: impl Into<String>, cases: Vec<CaseId>) {
        self.scopes.lock().unwrap().insert(scope_key.into(), cases);
    }
}

#[async_trait]
impl CaseListing for InMemoryCaseListing {
    async fn list_candidates(&self, scope_key: &str) -> Result<Vec<CaseId>, ExternalError> {
        Ok(self
            .scopes
            .lock()
            .unwrap()
            .get(scope_key)
            .cloned()
            .unwrap_or_default())
    }
}

/// Material resolver fake: one latest material per case.
#[derive(Debug, Default)]
pub struct InMemoryMaterialResolver {
    materials: Mutex<HashMap<CaseId, MaterialRef>>,
}

impl InMemoryMaterialResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, case_id: CaseId, material: MaterialRef) {
        self.materials.lock().unwrap().insert(case_id, material);
    }
}

#[async_trait]
impl MaterialResolver for InMemoryMaterialResolver {
    async fn resolve_latest(
        &self,
        case_id: CaseId,
        _caller_id: &str,
    ) -> Result<Option<MaterialRef>, ExternalError> {
        Ok(self.materials.lock().unwrap().get(&case_id).cloned())
    }
}

/// Content resolver fake with a download-call counter.
#[derive(Debug, Default)]
pub struct InMemoryContentResolver {
    urls: Mutex<HashMap<MaterialId, String>>,
    calls: AtomicU64,
}

impl InMemoryContentResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, material_id: MaterialId, url: impl Into<String>) {
        self.urls.lock().unwrap().insert(material_id, url.into());
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentResolver for InMemoryContentResolver {
    async fn download_url(
        &self,
        material_id: MaterialId,
        _caller_id: &str,
    ) -> Result<Option<String>, ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.urls.lock().unwrap().get(&material_id).cloned())
    }
}

/// Object storage fake with a copy-call counter.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<String, i64>>,
    copy_calls: AtomicU64,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn copy_calls(&self) -> u64 {
        self.copy_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn copy(
        &self,
        source_url: &str,
        dest_path: &str,
        _content_type: &str,
        _metadata: &HashMap<String, String>,
    ) -> Result<String, ExternalError> {
        self.copy_calls.fetch_add(1, Ordering::SeqCst);
        // Fake size derived from the source url so tests get stable values.
        let size = source_url.len() as i64 * 100;
        self.objects
            .lock()
            .unwrap()
            .insert(dest_path.to_string(), size);
        Ok(format!("mem://{dest_path}"))
    }

    async fn size(&self, path: &str) -> Result<i64, ExternalError> {
        self.objects
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .ok_or_else(|| ExternalError::terminal(format!("no such object: {path}")))
    }

    async fn exists(&self, path: &str) -> Result<bool, ExternalError> {
        Ok(self.objects.lock().unwrap().contains_key(path))
    }
}

/// Scripted status source: per external id, a sequence of observations
/// consumed one per poll; the last one repeats. Unknown ids report pending.
#[derive(Debug, Default)]
pub struct ScriptedStatusSource {
    scripts: Mutex<HashMap<String, VecDeque<StatusObservation>>>,
    erroring: Mutex<HashSet<String>>,
    calls: AtomicU64,
}

impl ScriptedStatusSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, external_id: impl Into<String>, observations: Vec<StatusObservation>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(external_id.into(), observations.into());
    }

    /// Make every poll for this id error transiently (e.g. a non-2xx).
    pub fn fail_with_transient(&self, external_id: impl Into<String>) {
        self.erroring.lock().unwrap().insert(external_id.into());
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IngestionStatusSource for ScriptedStatusSource {
    async fn status_of(&self, external_id: &str) -> Result<StatusObservation, ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.erroring.lock().unwrap().contains(external_id) {
            return Err(ExternalError::transient("status source unavailable"));
        }
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(external_id) {
            Some(queue) => {
                let observation = if queue.len() > 1 {
                    queue.pop_front().unwrap()
                } else {
                    queue
                        .front()
                        .cloned()
                        .unwrap_or_else(|| StatusObservation::new("PROCESSING"))
                };
                Ok(observation)
            }
            None => Ok(StatusObservation::new("PROCESSING")),
        }
    }
}

/// Answering-service fake.
///
/// Answers deterministically from the question text; specific scopes can be
/// scripted to fail transiently or return blank text.
#[derive(Debug, Default)]
pub struct InMemoryAnsweringService {
    calls: AtomicU64,
    fail_cases: Mutex<HashSet<CaseId>>,
    blank_cases: Mutex<HashSet<CaseId>>,
}

impl InMemoryAnsweringService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Make every call for this case error transiently.
    pub fn fail_case(&self, case_id: CaseId) {
        self.fail_cases.lock().unwrap().insert(case_id);
    }

    pub fn heal_case(&self, case_id: CaseId) {
        self.fail_cases.lock().unwrap().remove(&case_id);
        self.blank_cases.lock().unwrap().remove(&case_id);
    }

    /// Make every call for this case return blank text.
    pub fn blank_case(&self, case_id: CaseId) {
        self.blank_cases.lock().unwrap().insert(case_id);
    }
}

#[async_trait]
impl AnsweringService for InMemoryAnsweringService {
    async fn answer(
        &self,
        question: &str,
        _prompt_template: &str,
        scope: &AnswerScope,
    ) -> Result<AnswerPayload, ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_cases.lock().unwrap().contains(&scope.case_id) {
            return Err(ExternalError::transient("answering service unavailable"));
        }
        if self.blank_cases.lock().unwrap().contains(&scope.case_id) {
            return Ok(AnswerPayload {
                text: String::new(),
                supporting_chunks: serde_json::json!([]),
            });
        }

        Ok(AnswerPayload {
            text: format!("answer to: {question}"),
            supporting_chunks: serde_json::json!([
                { "document_id": scope.document_id, "snippet": "…" }
            ]),
        })
    }
}
