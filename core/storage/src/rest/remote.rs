//! PostgREST-style row service.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Method;
use serde_json::Value;
use tracing::debug;

use poleshift_common::{Result, Row, TableSpec};

use super::client::{check_response, encode_segment, transport_error, RestClient, RestConfig};
use crate::remote::{RemoteApi, RemoteFilter};

/// Row service speaking the PostgREST dialect under `/rest/v1`.
pub struct RestRemote {
    client: RestClient,
}

impl RestRemote {
    /// Create a new row service client.
    pub fn new(config: &RestConfig) -> Result<Self> {
        Ok(Self {
            client: RestClient::new(config)?,
        })
    }

    fn table_path(table: &TableSpec) -> String {
        format!("/rest/v1/{}", encode_segment(table.name.as_str()))
    }
}

/// Render a scalar for a PostgREST filter operand.
fn filter_operand(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Build the `in.(...)` operand, quoting every id.
fn in_list(ids: &[String]) -> String {
    let quoted: Vec<String> = ids
        .iter()
        .map(|id| format!("\"{}\"", id.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("in.({})", quoted.join(","))
}

fn same_columns(a: &Row, b: &Row) -> bool {
    a.len() == b.len() && a.keys().all(|key| b.contains_key(key))
}

/// Split `rows` into consecutive runs sharing one column set.
///
/// PostgREST rejects bulk bodies whose objects differ in keys. Runs keep the
/// caller's row order, so a later write to the same key still lands last.
fn column_runs(rows: &[Row]) -> Vec<&[Row]> {
    let mut runs = Vec::new();
    let mut start = 0;
    for (i, row) in rows.iter().enumerate().skip(1) {
        if !same_columns(&rows[start], row) {
            runs.push(&rows[start..i]);
            start = i;
        }
    }
    if start < rows.len() {
        runs.push(&rows[start..]);
    }
    runs
}

#[async_trait]
impl RemoteApi for RestRemote {
    async fn batch_upsert(&self, table: &TableSpec, rows: &[Row]) -> Result<()> {
        for run in column_runs(rows) {
            let response = self
                .client
                .request(Method::POST, &Self::table_path(table))
                .query(&[("on_conflict", table.primary_key.as_str())])
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(run)
                .send()
                .await
                .map_err(transport_error)?;
            check_response(response).await?;

            debug!("Upserted {} rows into {}", run.len(), table.name);
        }
        Ok(())
    }

    async fn update(&self, table: &TableSpec, id: &str, patch: &Row) -> Result<()> {
        let response = self
            .client
            .request(Method::PATCH, &Self::table_path(table))
            .query(&[(table.primary_key.as_str(), format!("eq.{}", id))])
            .header("Prefer", "return=minimal")
            .json(patch)
            .send()
            .await
            .map_err(transport_error)?;
        check_response(response).await?;
        Ok(())
    }

    async fn batch_delete(&self, table: &TableSpec, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .request(Method::DELETE, &Self::table_path(table))
            .query(&[(table.primary_key.as_str(), in_list(ids))])
            .header("Prefer", "return=minimal")
            .send()
            .await
            .map_err(transport_error)?;
        check_response(response).await?;

        debug!("Deleted {} rows from {}", ids.len(), table.name);
        Ok(())
    }

    async fn select(
        &self,
        table: &TableSpec,
        filter: &RemoteFilter,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Row>> {
        let mut query: Vec<(String, String)> = vec![
            ("select".to_string(), "*".to_string()),
            (
                "order".to_string(),
                format!("{}.asc", table.updated_at_column),
            ),
        ];
        if let Some(since) = since {
            query.push((
                table.updated_at_column.clone(),
                format!("gt.{}", since.to_rfc3339_opts(SecondsFormat::Micros, true)),
            ));
        }
        for (column, value) in &filter.eq {
            query.push((column.clone(), format!("eq.{}", filter_operand(value))));
        }

        let response = self
            .client
            .request(Method::GET, &Self::table_path(table))
            .query(&query)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_response(response).await?;

        response.json::<Vec<Row>>().await.map_err(transport_error)
    }
}
