//! In-memory remote backends for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use poleshift_common::{parse_timestamp, Error, Result, Row, TableSpec};

use crate::object::ObjectStorage;
use crate::remote::{RemoteApi, RemoteFilter};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A call received by [`MemoryRemote`], recorded in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    BatchUpsert { table: String, ids: Vec<String> },
    Update { table: String, id: String },
    BatchDelete { table: String, ids: Vec<String> },
    Select { table: String },
}

/// Failure to inject into upcoming calls.
#[derive(Debug, Clone, Copy)]
enum Injected {
    Network,
    Rejected(u16),
}

impl Injected {
    fn into_error(self) -> Error {
        match self {
            Injected::Network => Error::Network("Injected network failure".to_string()),
            Injected::Rejected(status) => Error::RemoteRejected {
                status,
                message: "Injected rejection".to_string(),
            },
        }
    }
}

type CallHook = Box<dyn Fn(&RemoteCall) + Send + Sync>;

/// In-memory row service.
///
/// Stores rows per table keyed by primary key. Records every call and can
/// fail the next N calls, which makes retry behaviour observable.
#[derive(Default)]
pub struct MemoryRemote {
    tables: Mutex<HashMap<String, BTreeMap<String, Row>>>,
    calls: Mutex<Vec<RemoteCall>>,
    failures: Mutex<VecDeque<Injected>>,
    hook: Mutex<Option<CallHook>>,
}

impl MemoryRemote {
    /// Create a new empty remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls with a transient network error.
    pub fn fail_next(&self, count: usize) {
        lock(&self.failures).extend(std::iter::repeat(Injected::Network).take(count));
    }

    /// Reject the next `count` calls with the given HTTP status.
    pub fn reject_next(&self, count: usize, status: u16) {
        lock(&self.failures).extend(std::iter::repeat(Injected::Rejected(status)).take(count));
    }

    /// Run `hook` on every call before it is applied.
    pub fn set_call_hook(&self, hook: impl Fn(&RemoteCall) + Send + Sync + 'static) {
        *lock(&self.hook) = Some(Box::new(hook));
    }

    /// Put a row directly into a table, bypassing call recording.
    pub fn seed_row(&self, table: &TableSpec, row: Row) -> Result<()> {
        let id = table.row_id(&row)?;
        lock(&self.tables)
            .entry(table.name.to_string())
            .or_default()
            .insert(id, row);
        Ok(())
    }

    /// Get a row by primary key.
    pub fn row(&self, table: &str, id: &str) -> Option<Row> {
        lock(&self.tables)
            .get(table)
            .and_then(|rows| rows.get(id))
            .cloned()
    }

    /// All rows of a table in primary key order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        lock(&self.tables)
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Calls received so far.
    pub fn calls(&self) -> Vec<RemoteCall> {
        lock(&self.calls).clone()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    fn record(&self, call: RemoteCall) -> Result<()> {
        if let Some(hook) = lock(&self.hook).as_ref() {
            hook(&call);
        }
        lock(&self.calls).push(call);

        match lock(&self.failures).pop_front() {
            Some(injected) => Err(injected.into_error()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteApi for MemoryRemote {
    async fn batch_upsert(&self, table: &TableSpec, rows: &[Row]) -> Result<()> {
        let ids = rows
            .iter()
            .map(|row| table.row_id(row))
            .collect::<Result<Vec<_>>>()?;
        self.record(RemoteCall::BatchUpsert {
            table: table.name.to_string(),
            ids: ids.clone(),
        })?;

        let mut tables = lock(&self.tables);
        let stored = tables.entry(table.name.to_string()).or_default();
        for (id, row) in ids.into_iter().zip(rows) {
            let existing = stored.entry(id).or_default();
            for (column, value) in row {
                existing.insert(column.clone(), value.clone());
            }
        }
        Ok(())
    }

    async fn update(&self, table: &TableSpec, id: &str, patch: &Row) -> Result<()> {
        self.record(RemoteCall::Update {
            table: table.name.to_string(),
            id: id.to_string(),
        })?;

        let mut tables = lock(&self.tables);
        if let Some(existing) = tables
            .get_mut(table.name.as_str())
            .and_then(|rows| rows.get_mut(id))
        {
            for (column, value) in patch {
                existing.insert(column.clone(), value.clone());
            }
        }
        Ok(())
    }

    async fn batch_delete(&self, table: &TableSpec, ids: &[String]) -> Result<()> {
        self.record(RemoteCall::BatchDelete {
            table: table.name.to_string(),
            ids: ids.to_vec(),
        })?;

        let mut tables = lock(&self.tables);
        if let Some(rows) = tables.get_mut(table.name.as_str()) {
            for id in ids {
                rows.remove(id);
            }
        }
        Ok(())
    }

    async fn select(
        &self,
        table: &TableSpec,
        filter: &RemoteFilter,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Row>> {
        self.record(RemoteCall::Select {
            table: table.name.to_string(),
        })?;

        let tables = lock(&self.tables);
        let Some(rows) = tables.get(table.name.as_str()) else {
            return Ok(Vec::new());
        };

        let mut matched: Vec<(Option<DateTime<Utc>>, Row)> = rows
            .values()
            .filter(|row| filter.matches(row))
            .map(|row| {
                let updated = row.get(&table.updated_at_column).and_then(parse_timestamp);
                (updated, row.clone())
            })
            .filter(|(updated, _)| match (since, updated) {
                (None, _) => true,
                (Some(since), Some(updated)) => *updated > since,
                (Some(_), None) => false,
            })
            .collect();

        matched.sort_by_key(|(updated, _)| *updated);
        Ok(matched.into_iter().map(|(_, row)| row).collect())
    }
}

/// In-memory object storage.
///
/// Counts transfers and tracks peak concurrency so callers can assert on
/// dedup and worker-pool limits.
#[derive(Default)]
pub struct MemoryObjectStorage {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
    failures: Mutex<VecDeque<Injected>>,
    upload_delay: Mutex<Duration>,
    transfers: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MemoryObjectStorage {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every upload take `delay` before completing.
    pub fn set_upload_delay(&self, delay: Duration) {
        *lock(&self.upload_delay) = delay;
    }

    /// Fail the next `count` uploads with a transient network error.
    pub fn fail_next_uploads(&self, count: usize) {
        lock(&self.failures).extend(std::iter::repeat(Injected::Network).take(count));
    }

    /// Put an object directly into storage.
    pub fn seed(&self, bucket: &str, path: &str, data: Vec<u8>) {
        lock(&self.objects).insert((bucket.to_string(), path.to_string()), data);
    }

    /// Get an object's content.
    pub fn object(&self, bucket: &str, path: &str) -> Option<Vec<u8>> {
        lock(&self.objects)
            .get(&(bucket.to_string(), path.to_string()))
            .cloned()
    }

    /// Number of completed transfers.
    pub fn transfers(&self) -> usize {
        self.transfers.load(Ordering::SeqCst)
    }

    /// Highest number of uploads observed in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn exists(&self, bucket: &str, path: &str) -> Result<bool> {
        Ok(lock(&self.objects).contains_key(&(bucket.to_string(), path.to_string())))
    }

    async fn upload(&self, bucket: &str, path: &str, data: Vec<u8>) -> Result<()> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = *lock(&self.upload_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = match lock(&self.failures).pop_front() {
            Some(injected) => Err(injected.into_error()),
            None => {
                let key = (bucket.to_string(), path.to_string());
                let mut objects = lock(&self.objects);
                if objects.contains_key(&key) {
                    Err(Error::RemoteRejected {
                        status: 409,
                        message: format!("Duplicate: {}/{}", bucket, path),
                    })
                } else {
                    objects.insert(key, data);
                    self.transfers.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<()> {
        let mut objects = lock(&self.objects);
        for path in paths {
            objects.remove(&(bucket.to_string(), path.clone()));
        }
        Ok(())
    }

    async fn create_signed_url(&self, bucket: &str, path: &str, ttl: Duration) -> Result<String> {
        if !self.exists(bucket, path).await? {
            return Err(Error::NotFound(format!("{}/{}", bucket, path)));
        }
        Ok(format!(
            "memory://{}/{}?expires_in={}",
            bucket,
            path,
            ttl.as_secs()
        ))
    }
}
