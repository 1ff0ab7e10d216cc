//! Common types used throughout the sync engine.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// A row as exchanged with the local store and the remote service.
///
/// Keys are column names, values are JSON scalars or documents.
pub type Row = serde_json::Map<String, Value>;

/// Maximum identifier length accepted by the relational backends.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Check that `ident` is safe to splice into SQL or a REST path.
///
/// Accepts `[A-Za-z_][A-Za-z0-9_]*` up to 63 characters.
pub fn validate_identifier(ident: &str) -> crate::Result<()> {
    let mut chars = ident.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_start || !valid_rest || ident.len() > MAX_IDENTIFIER_LEN {
        return Err(crate::Error::InvalidInput(format!(
            "Invalid identifier: {:?}",
            ident
        )));
    }
    Ok(())
}

/// Name of a replicated table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableName(String);

impl TableName {
    /// Create a new TableName.
    ///
    /// # Errors
    /// - Returns error if the name is not a plain identifier
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        validate_identifier(&name)?;
        Ok(Self(name))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for TableName {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<TableName> for String {
    fn from(value: TableName) -> Self {
        value.0
    }
}

/// Locally generated, stable identifier of a queued entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(String);

impl OperationId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an existing identifier (e.g. read back from the store).
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a queued local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Insert,
    Update,
    Upsert,
    Delete,
}

impl OpType {
    /// Stable string form used in the persisted queue.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Insert => "insert",
            OpType::Update => "update",
            OpType::Upsert => "upsert",
            OpType::Delete => "delete",
        }
    }

    /// Whether the remote applies this kind with one batched upsert.
    pub fn is_upsert_like(&self) -> bool {
        matches!(self, OpType::Insert | OpType::Upsert)
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "insert" => Ok(OpType::Insert),
            "update" => Ok(OpType::Update),
            "upsert" => Ok(OpType::Upsert),
            "delete" => Ok(OpType::Delete),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown operation type: {}",
                other
            ))),
        }
    }
}

fn default_primary_key() -> String {
    "id".to_string()
}

fn default_updated_at() -> String {
    "updated_at".to_string()
}

/// Replication schema of one table.
///
/// Payloads are checked against this at the queue boundary so the uploader
/// and the puller can rely on a primary key being present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    /// Table name, identical locally and remotely.
    pub name: TableName,
    /// Primary key column.
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    /// Column holding the remote modification time.
    #[serde(default = "default_updated_at")]
    pub updated_at_column: String,
    /// Column scoping rows to an organization, if any.
    #[serde(default)]
    pub tenant_column: Option<String>,
}

impl TableSpec {
    /// Create a spec with the default `id` / `updated_at` columns.
    pub fn new(name: TableName) -> Self {
        Self {
            name,
            primary_key: default_primary_key(),
            updated_at_column: default_updated_at(),
            tenant_column: None,
        }
    }

    /// Set the tenant scoping column.
    pub fn with_tenant_column(mut self, column: impl Into<String>) -> Self {
        self.tenant_column = Some(column.into());
        self
    }

    /// Set the primary key column.
    pub fn with_primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = column.into();
        self
    }

    /// Check that every configured column is a plain identifier.
    pub fn validate(&self) -> crate::Result<()> {
        validate_identifier(&self.primary_key)?;
        validate_identifier(&self.updated_at_column)?;
        if let Some(tenant) = &self.tenant_column {
            validate_identifier(tenant)?;
        }
        Ok(())
    }

    /// Extract the primary key of `row` as a string.
    ///
    /// # Errors
    /// - Key missing, null, empty, or not a string/integer
    pub fn row_id(&self, row: &Row) -> crate::Result<String> {
        match row.get(&self.primary_key) {
            Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
            _ => Err(crate::Error::InvalidInput(format!(
                "Row for table {} has no usable primary key '{}'",
                self.name, self.primary_key
            ))),
        }
    }

    /// Validate a payload for `op` and return the normalized row.
    ///
    /// Delete payloads are reduced to the primary key.
    pub fn normalize_payload(&self, op: OpType, payload: Value) -> crate::Result<Row> {
        let Value::Object(row) = payload else {
            return Err(crate::Error::InvalidInput(format!(
                "Payload for table {} must be an object",
                self.name
            )));
        };

        let id = self.row_id(&row)?;
        for column in row.keys() {
            validate_identifier(column)?;
        }

        if op == OpType::Delete {
            let mut key_only = Row::new();
            key_only.insert(
                self.primary_key.clone(),
                row.get(&self.primary_key).cloned().unwrap_or(Value::String(id)),
            );
            return Ok(key_only);
        }

        Ok(row)
    }
}

/// Parse a remote timestamp value.
///
/// Accepts RFC 3339 strings and epoch-millisecond integers.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok(),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_table_name_validation() {
        assert!(TableName::new("sample_group_metadata").is_ok());
        assert!(TableName::new("_private").is_ok());
        assert!(TableName::new("").is_err());
        assert!(TableName::new("1abc").is_err());
        assert!(TableName::new("drop table;").is_err());
        assert!(TableName::new("a".repeat(64)).is_err());
    }

    #[test]
    fn test_table_name_serde_validates() {
        let ok: TableName = serde_json::from_value(json!("samples")).unwrap();
        assert_eq!(ok.as_str(), "samples");
        assert!(serde_json::from_value::<TableName>(json!("bad name")).is_err());
    }

    #[test]
    fn test_op_type_round_trip() {
        for op in [OpType::Insert, OpType::Update, OpType::Upsert, OpType::Delete] {
            assert_eq!(op.as_str().parse::<OpType>().unwrap(), op);
        }
        assert!("patch".parse::<OpType>().is_err());
    }

    #[test]
    fn test_row_id_accepts_strings_and_integers() {
        let spec = TableSpec::new(TableName::new("samples").unwrap());
        let row = json!({"id": "abc"}).as_object().cloned().unwrap();
        assert_eq!(spec.row_id(&row).unwrap(), "abc");

        let row = json!({"id": 42}).as_object().cloned().unwrap();
        assert_eq!(spec.row_id(&row).unwrap(), "42");

        let row = json!({"id": ""}).as_object().cloned().unwrap();
        assert!(spec.row_id(&row).is_err());

        let row = json!({"name": "x"}).as_object().cloned().unwrap();
        assert!(spec.row_id(&row).is_err());
    }

    #[test]
    fn test_normalize_delete_keeps_only_key() {
        let spec = TableSpec::new(TableName::new("samples").unwrap());
        let row = spec
            .normalize_payload(OpType::Delete, json!({"id": "a", "name": "x"}))
            .unwrap();
        assert_eq!(row.len(), 1);
        assert_eq!(row.get("id"), Some(&json!("a")));
    }

    #[test]
    fn test_normalize_rejects_bad_payloads() {
        let spec = TableSpec::new(TableName::new("samples").unwrap());
        assert!(spec.normalize_payload(OpType::Insert, json!([1, 2])).is_err());
        assert!(spec
            .normalize_payload(OpType::Insert, json!({"id": "a", "bad col": 1}))
            .is_err());
    }

    #[test]
    fn test_parse_timestamp() {
        let ts = parse_timestamp(&json!("2024-11-30T06:44:44.315Z")).unwrap();
        assert_eq!(ts.timestamp_millis(), 1_732_949_084_315);

        let ts = parse_timestamp(&json!(1_732_949_084_315i64)).unwrap();
        assert_eq!(ts.timestamp_millis(), 1_732_949_084_315);

        assert!(parse_timestamp(&json!("yesterday")).is_none());
        assert!(parse_timestamp(&Value::Null).is_none());
    }
}
