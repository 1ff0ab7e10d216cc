//! Pull cycle: merges remote changes into local tables.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use poleshift_common::{parse_timestamp, Error, Result, Row, TableName, TableSpec};
use poleshift_storage::{RemoteApi, RemoteFilter};
use poleshift_store::{json_to_sql, LocalStore, SqlValue, Statement};

use crate::cursor::CursorStore;
use crate::network::NetworkMonitor;

/// Outcome of one pull.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullReport {
    /// Tables pulled successfully.
    pub tables: usize,
    /// Remote rows written locally.
    pub rows_merged: usize,
    /// Tables whose fetch failed; their cursors did not move.
    pub failed_tables: Vec<TableName>,
}

/// Fetches rows changed since each table's cursor and upserts them locally.
///
/// Merges are last-write-wins by primary key: the remote row replaces the
/// columns it carries.
pub struct RemotePuller {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteApi>,
    cursors: CursorStore,
    monitor: NetworkMonitor,
    tables: Vec<TableSpec>,
    tenant_id: Option<String>,
}

impl RemotePuller {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteApi>,
        monitor: NetworkMonitor,
        tables: Vec<TableSpec>,
    ) -> Self {
        Self {
            cursors: CursorStore::new(store.clone()),
            store,
            remote,
            monitor,
            tables,
            tenant_id: None,
        }
    }

    /// Scope tables with a tenant column to `tenant_id`.
    pub fn with_tenant(mut self, tenant_id: Option<String>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    /// Pull every watched table.
    ///
    /// A table whose fetch fails is reported and skipped; the others are
    /// still pulled.
    ///
    /// # Errors
    /// - `Offline` when connectivity drops between tables
    /// - `LocalStore` on any local read or write failure
    pub async fn pull(&self) -> Result<PullReport> {
        let mut report = PullReport::default();

        for spec in &self.tables {
            if !self.monitor.is_online() {
                return Err(Error::Offline);
            }

            match self.pull_table(spec).await {
                Ok(merged) => {
                    report.tables += 1;
                    report.rows_merged += merged;
                }
                Err(e) if e.is_local_store() => return Err(e),
                Err(e) => {
                    warn!("Pull of {} failed: {}", spec.name, e);
                    report.failed_tables.push(spec.name.clone());
                }
            }
        }

        if report.rows_merged > 0 {
            info!(
                "Pulled {} rows across {} tables",
                report.rows_merged, report.tables
            );
        }
        Ok(report)
    }

    /// Pull one table and return the number of merged rows.
    pub async fn pull_table(&self, spec: &TableSpec) -> Result<usize> {
        let since = self.cursors.get(&spec.name)?;
        let filter = match (&spec.tenant_column, &self.tenant_id) {
            (Some(column), Some(tenant)) => RemoteFilter::all().with_eq(column.clone(), tenant.clone()),
            _ => RemoteFilter::all(),
        };

        let rows = self.remote.select(spec, &filter, since).await?;
        if rows.is_empty() {
            return Ok(0);
        }

        let local_columns = self.local_columns(&spec.name)?;
        let statements = rows
            .iter()
            .map(|row| merge_statement(spec, row, &local_columns))
            .collect::<Result<Vec<_>>>()?;
        self.store.execute_all(&statements)?;

        // Rows without a readable timestamp are merged but do not move the cursor.
        let latest = rows
            .iter()
            .filter_map(|row| row.get(&spec.updated_at_column).and_then(parse_timestamp))
            .max();
        if let Some(latest) = latest {
            self.cursors.advance(&spec.name, latest)?;
        }

        debug!("Merged {} rows into {} (cursor {:?})", rows.len(), spec.name, latest);
        Ok(rows.len())
    }

    /// Forget a table's cursor so the next pull fetches everything.
    pub fn reset_cursor(&self, table: &TableName) -> Result<()> {
        self.cursors.reset(table)
    }

    fn local_columns(&self, table: &TableName) -> Result<HashSet<String>> {
        let columns: HashSet<String> = self
            .store
            .get_all(
                "SELECT name FROM pragma_table_info(?1)",
                &[SqlValue::Text(table.as_str().to_string())],
            )?
            .iter()
            .map(|row| row.text("name"))
            .collect::<Result<_>>()?;

        if columns.is_empty() {
            return Err(Error::LocalStore(format!("Local table {} does not exist", table)));
        }
        Ok(columns)
    }
}

/// Build the upsert of one remote row.
///
/// Columns unknown to the local table are dropped.
fn merge_statement(spec: &TableSpec, row: &Row, local_columns: &HashSet<String>) -> Result<Statement> {
    let id = spec.row_id(row)?;
    let columns: Vec<&String> = row
        .keys()
        .filter(|column| local_columns.contains(column.as_str()))
        .collect();
    if !columns.iter().any(|column| **column == spec.primary_key) {
        return Err(Error::LocalStore(format!(
            "Local table {} has no column {}",
            spec.name, spec.primary_key
        )));
    }

    let column_list = columns
        .iter()
        .map(|column| format!("\"{}\"", column))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=columns.len())
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");
    let updates = columns
        .iter()
        .filter(|column| ***column != spec.primary_key)
        .map(|column| format!("\"{0}\" = excluded.\"{0}\"", column))
        .collect::<Vec<_>>();

    let conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    let sql = format!(
        "INSERT INTO \"{table}\" ({columns}) VALUES ({placeholders}) ON CONFLICT(\"{pk}\") {conflict}",
        table = spec.name,
        columns = column_list,
        placeholders = placeholders,
        pk = spec.primary_key,
        conflict = conflict,
    );
    let params = columns.iter().map(|column| json_to_sql(&row[column.as_str()])).collect();

    debug!("Merge {} {}", spec.name, id);
    Ok(Statement::new(sql, params))
}
