//! Upstream material references.

use serde::{Deserialize, Serialize};

use dossier_core::MaterialId;

/// Reference to the upstream material that backs a case document.
///
/// Resolved by the material resolver; `external_document_id` is the
/// identifier the ingestion status source reports on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialRef {
    pub material_id: MaterialId,
    pub display_name: String,
    pub external_document_id: String,
}

impl MaterialRef {
    pub fn new(
        material_id: MaterialId,
        display_name: impl Into<String>,
        external_document_id: impl Into<String>,
    ) -> Self {
        Self {
            material_id,
            display_name: display_name.into(),
            external_document_id: external_document_id.into(),
        }
    }
}
