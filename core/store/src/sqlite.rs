//! SQLite-backed local store.

use rusqlite::{params_from_iter, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use poleshift_common::{Error, Result};

use crate::schema::ENGINE_SCHEMA;
use crate::store::{LocalStore, SqlValue, Statement, StoreRow};

fn store_err(err: rusqlite::Error) -> Error {
    Error::LocalStore(err.to_string())
}

/// Local store on top of a single SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open a store database and apply the engine schema.
    ///
    /// # Errors
    /// - Database creation or schema migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(store_err)?;
        let store = Self::from_connection(conn)?;
        info!("Local store opened at {}", db_path.as_ref().display());
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(ENGINE_SCHEMA).map_err(store_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::LocalStore("Connection lock poisoned".to_string()))
    }

    fn query(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<Vec<StoreRow>> {
        let mut stmt = conn.prepare(sql).map_err(store_err)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                let mut values = Vec::with_capacity(columns.len());
                for (idx, name) in columns.iter().enumerate() {
                    values.push((name.clone(), row.get::<_, SqlValue>(idx)?));
                }
                Ok(StoreRow::new(values))
            })
            .map_err(store_err)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row.map_err(store_err)?);
        }
        Ok(result)
    }
}

impl LocalStore for SqliteStore {
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        let conn = self.lock()?;
        conn.execute(sql, params_from_iter(params.iter()))
            .map_err(store_err)
    }

    fn get(&self, sql: &str, params: &[SqlValue]) -> Result<Option<StoreRow>> {
        let conn = self.lock()?;
        Ok(Self::query(&conn, sql, params)?.into_iter().next())
    }

    fn get_all(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<StoreRow>> {
        let conn = self.lock()?;
        Self::query(&conn, sql, params)
    }

    fn execute_all(&self, statements: &[Statement]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(store_err)?;

        let mut affected = 0;
        for statement in statements {
            affected += tx
                .execute(&statement.sql, params_from_iter(statement.params.iter()))
                .map_err(store_err)?;
        }

        tx.commit().map_err(store_err)?;
        debug!("Committed {} statements ({} rows)", statements.len(), affected);
        Ok(affected)
    }
}
