//! Catalogue queries and their temporal versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dossier_core::QueryId;

/// A catalogue entry: one structured question asked per case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub id: QueryId,
    /// Short human-facing label, e.g. "parties".
    pub label: String,
    /// Display/processing order within the catalogue.
    pub position: i32,
}

/// One temporal version of a query's definition.
///
/// Versions form a sequence ordered by `effective_at`; the definition in
/// force at instant T is the latest version with `effective_at <= T`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryVersion {
    pub query_id: QueryId,
    pub effective_at: DateTime<Utc>,
    pub question: String,
    pub prompt_template: String,
}

/// A query together with its version history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDefinition {
    pub query: Query,
    pub versions: Vec<QueryVersion>,
}

impl QueryDefinition {
    pub fn new(query: Query) -> Self {
        Self {
            query,
            versions: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: QueryVersion) -> Self {
        self.versions.push(version);
        self
    }

    /// Resolve the definition in force at `at`.
    ///
    /// Returns `None` when no version was effective yet at that instant.
    pub fn in_force_at(&self, at: DateTime<Utc>) -> Option<&QueryVersion> {
        self.versions
            .iter()
            .filter(|v| v.effective_at <= at)
            .max_by_key(|v| v.effective_at)
    }

    /// The currently effective definition.
    pub fn current(&self) -> Option<&QueryVersion> {
        self.in_force_at(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn definition() -> QueryDefinition {
        let id = QueryId::new();
        QueryDefinition::new(Query {
            id,
            label: "parties".to_string(),
            position: 1,
        })
        .with_version(QueryVersion {
            query_id: id,
            effective_at: at(2024, 1, 1),
            question: "Who are the parties?".to_string(),
            prompt_template: "v1".to_string(),
        })
        .with_version(QueryVersion {
            query_id: id,
            effective_at: at(2024, 6, 1),
            question: "List all parties to the case.".to_string(),
            prompt_template: "v2".to_string(),
        })
    }

    #[test]
    fn picks_latest_version_not_after_instant() {
        let def = definition();

        assert_eq!(def.in_force_at(at(2024, 3, 1)).unwrap().prompt_template, "v1");
        assert_eq!(def.in_force_at(at(2024, 7, 1)).unwrap().prompt_template, "v2");
        // Exactly on the boundary the new version is already in force.
        assert_eq!(def.in_force_at(at(2024, 6, 1)).unwrap().prompt_template, "v2");
    }

    #[test]
    fn no_version_in_force_before_first_effective_at() {
        let def = definition();
        assert!(def.in_force_at(at(2023, 12, 31)).is_none());
    }
}
