//! Per-table pull cursors.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use poleshift_common::{Error, Result, TableName};
use poleshift_store::{LocalStore, SqlValue};

/// Durable high-water marks of pulled remote changes.
#[derive(Clone)]
pub struct CursorStore {
    store: Arc<dyn LocalStore>,
}

impl CursorStore {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// Last merged remote modification time, if any.
    pub fn get(&self, table: &TableName) -> Result<Option<DateTime<Utc>>> {
        let row = self.store.get(
            "SELECT last_synced_at FROM sync_cursors WHERE table_name = ?1",
            &[SqlValue::Text(table.as_str().to_string())],
        )?;
        row.map(|row| Self::decode(row.integer("last_synced_at")?))
            .transpose()
    }

    /// Move the cursor to `at`. A cursor never moves backwards.
    pub fn advance(&self, table: &TableName, at: DateTime<Utc>) -> Result<()> {
        self.store.execute(
            "INSERT INTO sync_cursors (table_name, last_synced_at) VALUES (?1, ?2) \
             ON CONFLICT(table_name) DO UPDATE SET \
             last_synced_at = MAX(last_synced_at, excluded.last_synced_at)",
            &[
                SqlValue::Text(table.as_str().to_string()),
                SqlValue::Integer(at.timestamp_micros()),
            ],
        )?;
        Ok(())
    }

    /// Forget the cursor so the next pull fetches the whole table.
    pub fn reset(&self, table: &TableName) -> Result<()> {
        self.store.execute(
            "DELETE FROM sync_cursors WHERE table_name = ?1",
            &[SqlValue::Text(table.as_str().to_string())],
        )?;
        Ok(())
    }

    /// Every stored cursor, ordered by table name.
    pub fn all(&self) -> Result<Vec<(TableName, DateTime<Utc>)>> {
        self.store
            .get_all(
                "SELECT table_name, last_synced_at FROM sync_cursors ORDER BY table_name",
                &[],
            )?
            .iter()
            .map(|row| {
                Ok((
                    TableName::new(row.text("table_name")?)?,
                    Self::decode(row.integer("last_synced_at")?)?,
                ))
            })
            .collect()
    }

    fn decode(micros: i64) -> Result<DateTime<Utc>> {
        DateTime::from_timestamp_micros(micros)
            .ok_or_else(|| Error::LocalStore(format!("Invalid cursor value {}", micros)))
    }
}
