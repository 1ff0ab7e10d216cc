//! Row service contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use poleshift_common::{Result, Row, TableSpec};

/// Equality filters applied to a remote select.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteFilter {
    /// `(column, value)` pairs that must all match.
    pub eq: Vec<(String, Value)>,
}

impl RemoteFilter {
    /// A filter matching every row.
    pub fn all() -> Self {
        Self::default()
    }

    /// Add an equality condition.
    pub fn with_eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.eq.push((column.into(), value.into()));
        self
    }

    /// Check a row against every condition.
    pub fn matches(&self, row: &Row) -> bool {
        self.eq
            .iter()
            .all(|(column, value)| row.get(column) == Some(value))
    }
}

/// Remote service holding the authoritative copy of every table.
///
/// Implementations must be idempotent for `batch_upsert` and
/// `batch_delete`: applying the same batch twice leaves the same state.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Insert or overwrite rows by primary key.
    async fn batch_upsert(&self, table: &TableSpec, rows: &[Row]) -> Result<()>;

    /// Apply a partial patch to one row.
    async fn update(&self, table: &TableSpec, id: &str, patch: &Row) -> Result<()>;

    /// Delete rows by primary key. Missing ids are not an error.
    async fn batch_delete(&self, table: &TableSpec, ids: &[String]) -> Result<()>;

    /// Fetch rows matching `filter` modified strictly after `since`,
    /// ordered by modification time ascending.
    async fn select(
        &self,
        table: &TableSpec,
        filter: &RemoteFilter,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Row>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matches() {
        let row = json!({"id": "a", "org_id": "org-1"})
            .as_object()
            .cloned()
            .unwrap();

        assert!(RemoteFilter::all().matches(&row));
        assert!(RemoteFilter::all().with_eq("org_id", "org-1").matches(&row));
        assert!(!RemoteFilter::all().with_eq("org_id", "org-2").matches(&row));
        assert!(!RemoteFilter::all().with_eq("missing", "x").matches(&row));
    }
}
