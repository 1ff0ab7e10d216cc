//! Local store contract.

use serde_json::Value;

use poleshift_common::{Error, Result, Row};

pub use rusqlite::types::Value as SqlValue;

/// One statement of a transactional batch.
#[derive(Debug, Clone)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    /// Create a new statement.
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// A row read back from the store, in column order.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRow {
    columns: Vec<(String, SqlValue)>,
}

impl StoreRow {
    /// Build a row from `(column, value)` pairs.
    pub fn new(columns: Vec<(String, SqlValue)>) -> Self {
        Self { columns }
    }

    /// Get the raw value of a column.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// Get a non-null text column.
    pub fn text(&self, column: &str) -> Result<String> {
        match self.get(column) {
            Some(SqlValue::Text(s)) => Ok(s.clone()),
            other => Err(Self::type_error(column, "text", other)),
        }
    }

    /// Get a nullable text column.
    pub fn opt_text(&self, column: &str) -> Result<Option<String>> {
        match self.get(column) {
            Some(SqlValue::Null) => Ok(None),
            Some(SqlValue::Text(s)) => Ok(Some(s.clone())),
            other => Err(Self::type_error(column, "text", other)),
        }
    }

    /// Get a non-null integer column.
    pub fn integer(&self, column: &str) -> Result<i64> {
        match self.get(column) {
            Some(SqlValue::Integer(i)) => Ok(*i),
            other => Err(Self::type_error(column, "integer", other)),
        }
    }

    /// Get a blob column.
    pub fn blob(&self, column: &str) -> Result<Vec<u8>> {
        match self.get(column) {
            Some(SqlValue::Blob(b)) => Ok(b.clone()),
            other => Err(Self::type_error(column, "blob", other)),
        }
    }

    /// Column names in order.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    /// Convert into a JSON row (domain tables).
    pub fn into_json(self) -> Row {
        self.columns
            .into_iter()
            .map(|(name, value)| (name, sql_to_json(value)))
            .collect()
    }

    fn type_error(column: &str, expected: &str, found: Option<&SqlValue>) -> Error {
        Error::LocalStore(format!(
            "Column '{}' expected {}, found {:?}",
            column, expected, found
        ))
    }
}

/// Map a JSON value onto a SQLite value.
///
/// Booleans become 0/1; arrays and objects are stored as JSON text.
pub fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

/// Map a SQLite value back to JSON. Blobs become arrays of bytes.
pub fn sql_to_json(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::from(i),
        SqlValue::Real(f) => Value::from(f),
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Blob(b) => Value::from(b),
    }
}

/// Embedded relational store.
///
/// Calls are short and synchronous; implementations serialise access
/// internally. Every failure is reported as [`Error::LocalStore`].
pub trait LocalStore: Send + Sync {
    /// Run a statement, returning the number of affected rows.
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize>;

    /// Run a query and return its first row, if any.
    fn get(&self, sql: &str, params: &[SqlValue]) -> Result<Option<StoreRow>>;

    /// Run a query and return all rows.
    fn get_all(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<StoreRow>>;

    /// Run all statements in one transaction. Either all apply or none do.
    fn execute_all(&self, statements: &[Statement]) -> Result<usize>;
}
