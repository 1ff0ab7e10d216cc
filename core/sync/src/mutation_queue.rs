//! Durable queue of local writes awaiting remote confirmation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use poleshift_common::{Error, OpType, OperationId, Result, Row, TableName, TableSpec};
use poleshift_store::{LocalStore, SqlValue, Statement, StoreRow};

/// A queued local write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Unique ID for this operation.
    pub id: OperationId,
    /// Target table.
    pub table: TableName,
    /// Kind of write.
    pub op_type: OpType,
    /// Row content (key only for deletes).
    pub payload: Row,
    /// Enqueue time; strictly increasing across the queue.
    pub enqueued_at: DateTime<Utc>,
    /// Failed push attempts so far.
    pub retry_count: u32,
}

impl PendingOperation {
    fn from_row(row: &StoreRow) -> Result<Self> {
        let payload: Value = serde_json::from_str(&row.text("payload_json")?)?;
        let Value::Object(payload) = payload else {
            return Err(Error::LocalStore("Queued payload is not an object".to_string()));
        };
        let micros = row.integer("enqueued_at")?;

        Ok(Self {
            id: OperationId::from_string(row.text("id")?),
            table: TableName::new(row.text("table_name")?)?,
            op_type: row.text("op_type")?.parse()?,
            payload,
            enqueued_at: DateTime::from_timestamp_micros(micros).ok_or_else(|| {
                Error::LocalStore(format!("Invalid enqueue time {}", micros))
            })?,
            retry_count: u32::try_from(row.integer("retry_count")?).unwrap_or(u32::MAX),
        })
    }
}

const SELECT_COLUMNS: &str =
    "SELECT id, table_name, op_type, payload_json, enqueued_at, retry_count FROM pending_operations";

/// Durable FIFO of [`PendingOperation`]s.
///
/// Every write is persisted here before any network attempt. Entries leave
/// the queue only when the remote confirmed them or a discard policy
/// dropped them.
pub struct MutationQueue {
    store: Arc<dyn LocalStore>,
    tables: HashMap<TableName, TableSpec>,
    /// Last assigned enqueue time in microseconds.
    clock: Mutex<i64>,
}

impl MutationQueue {
    /// Open the queue over `store` for the registered `tables`.
    ///
    /// # Errors
    /// - Local store read failure
    pub fn open(store: Arc<dyn LocalStore>, tables: &[TableSpec]) -> Result<Self> {
        let last = store
            .get(
                "SELECT COALESCE(MAX(enqueued_at), 0) AS last FROM pending_operations",
                &[],
            )?
            .map(|row| row.integer("last"))
            .transpose()?
            .unwrap_or(0);

        Ok(Self {
            store,
            tables: tables
                .iter()
                .map(|spec| (spec.name.clone(), spec.clone()))
                .collect(),
            clock: Mutex::new(last),
        })
    }

    /// Spec of a registered table.
    pub fn table_spec(&self, table: &TableName) -> Option<&TableSpec> {
        self.tables.get(table)
    }

    /// Persist a new operation.
    ///
    /// # Preconditions
    /// - `table` is registered
    /// - `payload` is an object carrying the table's primary key
    ///
    /// # Errors
    /// - `InvalidInput` for unknown tables or malformed payloads
    /// - `LocalStore` if the insert fails
    pub fn enqueue(
        &self,
        table: &TableName,
        op_type: OpType,
        payload: Value,
    ) -> Result<PendingOperation> {
        let spec = self
            .table_spec(table)
            .ok_or_else(|| Error::InvalidInput(format!("Table {} is not replicated", table)))?;
        let payload = spec.normalize_payload(op_type, payload)?;
        let payload_json = serde_json::to_string(&payload)?;

        let mut clock = self
            .clock
            .lock()
            .map_err(|_| Error::LocalStore("Queue clock poisoned".to_string()))?;
        let micros = Utc::now().timestamp_micros().max(*clock + 1);
        let enqueued_at = DateTime::from_timestamp_micros(micros)
            .ok_or_else(|| Error::LocalStore(format!("Invalid enqueue time {}", micros)))?;

        let op = PendingOperation {
            id: OperationId::generate(),
            table: table.clone(),
            op_type,
            payload,
            enqueued_at,
            retry_count: 0,
        };

        self.store.execute(
            "INSERT INTO pending_operations (id, table_name, op_type, payload_json, enqueued_at, retry_count) \
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            &[
                SqlValue::Text(op.id.as_str().to_string()),
                SqlValue::Text(table.as_str().to_string()),
                SqlValue::Text(op_type.as_str().to_string()),
                SqlValue::Text(payload_json),
                SqlValue::Integer(micros),
            ],
        )?;
        *clock = micros;

        debug!("Queued {} on {} ({})", op_type, table, op.id);
        Ok(op)
    }

    /// All entries in enqueue order.
    pub fn peek_ordered(&self) -> Result<Vec<PendingOperation>> {
        self.load(&format!("{} ORDER BY enqueued_at ASC, rowid ASC", SELECT_COLUMNS), &[])
    }

    /// Entries of one table in enqueue order.
    pub fn entries_for_table(&self, table: &TableName) -> Result<Vec<PendingOperation>> {
        self.load(
            &format!(
                "{} WHERE table_name = ?1 ORDER BY enqueued_at ASC, rowid ASC",
                SELECT_COLUMNS
            ),
            &[SqlValue::Text(table.as_str().to_string())],
        )
    }

    /// Look up one entry.
    pub fn get(&self, id: &OperationId) -> Result<Option<PendingOperation>> {
        self.store
            .get(
                &format!("{} WHERE id = ?1", SELECT_COLUMNS),
                &[SqlValue::Text(id.as_str().to_string())],
            )?
            .map(|row| PendingOperation::from_row(&row))
            .transpose()
    }

    /// Remove one entry. Returns whether it existed.
    pub fn remove(&self, id: &OperationId) -> Result<bool> {
        let affected = self.store.execute(
            "DELETE FROM pending_operations WHERE id = ?1",
            &[SqlValue::Text(id.as_str().to_string())],
        )?;
        Ok(affected > 0)
    }

    /// Remove several entries in one transaction.
    pub fn remove_many(&self, ids: &[OperationId]) -> Result<usize> {
        let statements: Vec<Statement> = ids
            .iter()
            .map(|id| {
                Statement::new(
                    "DELETE FROM pending_operations WHERE id = ?1",
                    vec![SqlValue::Text(id.as_str().to_string())],
                )
            })
            .collect();
        self.store.execute_all(&statements)
    }

    /// Record one more failed attempt for each entry.
    pub fn increment_retries(&self, ids: &[OperationId]) -> Result<()> {
        let statements: Vec<Statement> = ids
            .iter()
            .map(|id| {
                Statement::new(
                    "UPDATE pending_operations SET retry_count = retry_count + 1 WHERE id = ?1",
                    vec![SqlValue::Text(id.as_str().to_string())],
                )
            })
            .collect();
        let affected = self.store.execute_all(&statements)?;
        if affected != ids.len() {
            warn!(
                "Retry count updated for {} of {} operations",
                affected,
                ids.len()
            );
        }
        Ok(())
    }

    /// Number of queued entries.
    pub fn len(&self) -> Result<usize> {
        let row = self
            .store
            .get("SELECT COUNT(*) AS n FROM pending_operations", &[])?
            .ok_or_else(|| Error::LocalStore("COUNT returned no row".to_string()))?;
        Ok(row.integer("n")? as usize)
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn load(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<PendingOperation>> {
        self.store
            .get_all(sql, params)?
            .iter()
            .map(PendingOperation::from_row)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poleshift_store::SqliteStore;
    use proptest::prelude::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn tables() -> Vec<TableSpec> {
        vec![
            TableSpec::new(TableName::new("samples").unwrap()),
            TableSpec::new(TableName::new("stations").unwrap()),
        ]
    }

    fn queue() -> MutationQueue {
        let store: Arc<dyn LocalStore> = Arc::new(SqliteStore::in_memory().unwrap());
        MutationQueue::open(store, &tables()).unwrap()
    }

    fn samples() -> TableName {
        TableName::new("samples").unwrap()
    }

    #[test]
    fn test_enqueue_and_peek() {
        let queue = queue();
        let op = queue
            .enqueue(&samples(), OpType::Insert, json!({"id": "s1", "depth": 4}))
            .unwrap();

        assert_eq!(op.retry_count, 0);
        assert_eq!(queue.len().unwrap(), 1);

        let entries = queue.peek_ordered().unwrap();
        assert_eq!(entries, vec![op]);
        assert_eq!(entries[0].payload["depth"], json!(4));
    }

    #[test]
    fn test_enqueue_rejects_bad_input() {
        let queue = queue();
        let unknown = TableName::new("unknown").unwrap();

        assert!(matches!(
            queue.enqueue(&unknown, OpType::Insert, json!({"id": "x"})),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            queue.enqueue(&samples(), OpType::Insert, json!({"name": "no key"})),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            queue.enqueue(&samples(), OpType::Insert, json!(["not", "an", "object"])),
            Err(Error::InvalidInput(_))
        ));
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_delete_payload_reduced_to_key() {
        let queue = queue();
        let op = queue
            .enqueue(&samples(), OpType::Delete, json!({"id": "s1", "depth": 4}))
            .unwrap();
        assert_eq!(Value::Object(op.payload), json!({"id": "s1"}));
    }

    #[test]
    fn test_enqueue_times_strictly_increase() {
        let queue = queue();
        let ops: Vec<_> = (0..50)
            .map(|i| {
                queue
                    .enqueue(&samples(), OpType::Upsert, json!({"id": format!("s{}", i)}))
                    .unwrap()
            })
            .collect();

        for pair in ops.windows(2) {
            assert!(pair[0].enqueued_at < pair[1].enqueued_at);
        }
    }

    #[test]
    fn test_remove_and_retries() {
        let queue = queue();
        let a = queue.enqueue(&samples(), OpType::Insert, json!({"id": "a"})).unwrap();
        let b = queue.enqueue(&samples(), OpType::Insert, json!({"id": "b"})).unwrap();
        let c = queue.enqueue(&samples(), OpType::Insert, json!({"id": "c"})).unwrap();

        queue.increment_retries(&[a.id.clone(), b.id.clone()]).unwrap();
        queue.increment_retries(&[a.id.clone()]).unwrap();
        assert_eq!(queue.get(&a.id).unwrap().unwrap().retry_count, 2);
        assert_eq!(queue.get(&b.id).unwrap().unwrap().retry_count, 1);

        assert!(queue.remove(&c.id).unwrap());
        assert!(!queue.remove(&c.id).unwrap());
        assert_eq!(queue.remove_many(&[a.id.clone(), b.id.clone()]).unwrap(), 2);
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_entries_for_table() {
        let queue = queue();
        let stations = TableName::new("stations").unwrap();
        queue.enqueue(&samples(), OpType::Insert, json!({"id": "a"})).unwrap();
        queue.enqueue(&stations, OpType::Insert, json!({"id": "b"})).unwrap();
        queue.enqueue(&samples(), OpType::Update, json!({"id": "a", "x": 1})).unwrap();

        let entries = queue.entries_for_table(&samples()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].op_type, OpType::Insert);
        assert_eq!(entries[1].op_type, OpType::Update);
    }

    #[test]
    fn test_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("local.db");

        let first = {
            let store: Arc<dyn LocalStore> = Arc::new(SqliteStore::open(&path).unwrap());
            let queue = MutationQueue::open(store, &tables()).unwrap();
            queue.enqueue(&samples(), OpType::Insert, json!({"id": "a"})).unwrap()
        };

        let store: Arc<dyn LocalStore> = Arc::new(SqliteStore::open(&path).unwrap());
        let queue = MutationQueue::open(store, &tables()).unwrap();
        let second = queue.enqueue(&samples(), OpType::Insert, json!({"id": "b"})).unwrap();

        let entries = queue.peek_ordered().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, first.id);
        assert!(second.enqueued_at > first.enqueued_at);
    }

    proptest! {
        #[test]
        fn prop_peek_preserves_enqueue_order(ids in prop::collection::vec("[a-z]{1,8}", 1..30)) {
            let queue = queue();
            let mut expected = Vec::new();
            for id in &ids {
                let op = queue.enqueue(&samples(), OpType::Upsert, json!({"id": id})).unwrap();
                expected.push(op.id);
            }

            let actual: Vec<_> = queue.peek_ordered().unwrap().into_iter().map(|op| op.id).collect();
            prop_assert_eq!(actual, expected);
        }
    }
}
