//! Durable queue of pending binary uploads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use poleshift_common::{Error, OperationId, Result};
use poleshift_store::{LocalStore, SqlValue, StoreRow};

/// Lifecycle state of an upload task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    /// Waiting for a worker.
    Queued,
    /// Claimed by a worker or a direct attempt.
    Uploading,
    /// Last attempt failed; waiting for its backoff to expire.
    Error,
    /// Transfer confirmed.
    Done,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Queued => "queued",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Error => "error",
            UploadStatus::Done => "done",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(UploadStatus::Queued),
            "uploading" => Ok(UploadStatus::Uploading),
            "error" => Ok(UploadStatus::Error),
            "done" => Ok(UploadStatus::Done),
            other => Err(Error::LocalStore(format!("Unknown upload status '{}'", other))),
        }
    }
}

/// A binary to place at `bucket/path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    /// Caller-defined category (e.g. "raw_data").
    pub kind: String,
    /// Domain record this file belongs to.
    pub sample_ref: Option<String>,
    pub bucket: String,
    pub path: String,
    pub data: Vec<u8>,
}

impl UploadRequest {
    pub fn new(
        kind: impl Into<String>,
        bucket: impl Into<String>,
        path: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            kind: kind.into(),
            sample_ref: None,
            bucket: bucket.into(),
            path: path.into(),
            data,
        }
    }

    /// Attach the owning domain record.
    pub fn with_sample_ref(mut self, sample_ref: impl Into<String>) -> Self {
        self.sample_ref = Some(sample_ref.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.bucket.trim().is_empty() {
            return Err(Error::InvalidInput("Upload bucket is empty".to_string()));
        }
        if self.path.trim_matches('/').is_empty() {
            return Err(Error::InvalidInput("Upload path is empty".to_string()));
        }
        if self.path.split('/').any(|segment| segment == "..") {
            return Err(Error::InvalidInput(format!(
                "Upload path {} escapes its bucket",
                self.path
            )));
        }
        Ok(())
    }
}

/// A persisted upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTask {
    pub id: OperationId,
    pub kind: String,
    pub sample_ref: Option<String>,
    pub bucket: String,
    pub path: String,
    pub data: Vec<u8>,
    /// Failed attempts so far.
    pub retry_count: u32,
    pub status: UploadStatus,
    pub created_at: DateTime<Utc>,
    /// Earliest time a worker may pick the task up.
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl UploadTask {
    fn from_row(row: &StoreRow) -> Result<Self> {
        Ok(Self {
            id: OperationId::from_string(row.text("id")?),
            kind: row.text("type")?,
            sample_ref: row.opt_text("sample_ref")?,
            bucket: row.text("bucket")?,
            path: row.text("file_path")?,
            data: row.blob("blob")?,
            retry_count: u32::try_from(row.integer("retry_count")?).unwrap_or(u32::MAX),
            status: row.text("status")?.parse()?,
            created_at: decode_time(row.integer("created_at")?)?,
            available_at: decode_time(row.integer("available_at")?)?,
            last_error: row.opt_text("last_error")?,
        })
    }

    /// Rebuild the original request.
    pub fn to_request(&self) -> UploadRequest {
        UploadRequest {
            kind: self.kind.clone(),
            sample_ref: self.sample_ref.clone(),
            bucket: self.bucket.clone(),
            path: self.path.clone(),
            data: self.data.clone(),
        }
    }
}

fn decode_time(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| Error::LocalStore(format!("Invalid timestamp {}", micros)))
}

fn text(value: &str) -> SqlValue {
    SqlValue::Text(value.to_string())
}

const SELECT_COLUMNS: &str = "SELECT id, type, sample_ref, bucket, file_path, blob, retry_count, \
     status, created_at, available_at, last_error FROM processing_queue";

/// Durable registry of [`UploadTask`]s.
pub struct UploadQueue {
    store: Arc<dyn LocalStore>,
}

impl UploadQueue {
    /// Open the queue and return interrupted uploads to the queue.
    ///
    /// A task still marked uploading was cut off by a crash or shutdown.
    pub fn open(store: Arc<dyn LocalStore>) -> Result<Self> {
        let recovered = store.execute(
            "UPDATE processing_queue SET status = 'queued' WHERE status = 'uploading'",
            &[],
        )?;
        if recovered > 0 {
            info!("Recovered {} interrupted uploads", recovered);
        }
        Ok(Self { store })
    }

    /// Persist a request for background processing.
    pub fn enqueue(&self, request: UploadRequest) -> Result<UploadTask> {
        self.insert(request, UploadStatus::Queued)
    }

    /// Persist a request already claimed by the caller.
    pub(crate) fn enqueue_claimed(&self, request: UploadRequest) -> Result<UploadTask> {
        self.insert(request, UploadStatus::Uploading)
    }

    fn insert(&self, request: UploadRequest, status: UploadStatus) -> Result<UploadTask> {
        request.validate()?;
        let now = decode_time(Utc::now().timestamp_micros())?;
        let task = UploadTask {
            id: OperationId::generate(),
            kind: request.kind,
            sample_ref: request.sample_ref,
            bucket: request.bucket,
            path: request.path,
            data: request.data,
            retry_count: 0,
            status,
            created_at: now,
            available_at: now,
            last_error: None,
        };

        self.store.execute(
            "INSERT INTO processing_queue \
             (id, type, sample_ref, bucket, file_path, blob, retry_count, status, created_at, available_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?8)",
            &[
                text(task.id.as_str()),
                text(&task.kind),
                task.sample_ref
                    .as_deref()
                    .map(text)
                    .unwrap_or(SqlValue::Null),
                text(&task.bucket),
                text(&task.path),
                SqlValue::Blob(task.data.clone()),
                text(status.as_str()),
                SqlValue::Integer(now.timestamp_micros()),
            ],
        )?;

        debug!("Queued upload {} -> {}/{}", task.id, task.bucket, task.path);
        Ok(task)
    }

    /// IDs of tasks a worker may pick up at `now`, oldest first.
    pub fn ready_ids(&self, now: DateTime<Utc>) -> Result<Vec<OperationId>> {
        self.store
            .get_all(
                "SELECT id FROM processing_queue \
                 WHERE status IN ('queued', 'error') AND available_at <= ?1 \
                 ORDER BY created_at ASC, rowid ASC",
                &[SqlValue::Integer(now.timestamp_micros())],
            )?
            .iter()
            .map(|row| Ok(OperationId::from_string(row.text("id")?)))
            .collect()
    }

    /// Mark a waiting task as uploading and return it.
    ///
    /// Returns `None` if the task is gone or already claimed.
    pub fn claim(&self, id: &OperationId) -> Result<Option<UploadTask>> {
        let claimed = self.store.execute(
            "UPDATE processing_queue SET status = 'uploading' \
             WHERE id = ?1 AND status IN ('queued', 'error')",
            &[text(id.as_str())],
        )?;
        if claimed == 0 {
            return Ok(None);
        }
        self.get(id)
    }

    /// Hand a claimed task back without counting an attempt.
    pub fn release(&self, id: &OperationId) -> Result<()> {
        self.store.execute(
            "UPDATE processing_queue SET status = 'queued' WHERE id = ?1",
            &[text(id.as_str())],
        )?;
        Ok(())
    }

    /// Drop a task whose transfer is confirmed.
    pub fn complete(&self, id: &OperationId) -> Result<()> {
        self.store.execute(
            "DELETE FROM processing_queue WHERE id = ?1",
            &[text(id.as_str())],
        )?;
        Ok(())
    }

    /// Record a failed attempt and schedule the next one.
    pub fn record_failure(
        &self,
        id: &OperationId,
        retry_count: u32,
        available_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        self.store.execute(
            "UPDATE processing_queue \
             SET status = 'error', retry_count = ?2, available_at = ?3, last_error = ?4 \
             WHERE id = ?1",
            &[
                text(id.as_str()),
                SqlValue::Integer(i64::from(retry_count)),
                SqlValue::Integer(available_at.timestamp_micros()),
                text(error),
            ],
        )?;
        Ok(())
    }

    /// Remove a task regardless of its state. Returns whether it existed.
    pub fn cancel(&self, id: &OperationId) -> Result<bool> {
        let removed = self.store.execute(
            "DELETE FROM processing_queue WHERE id = ?1",
            &[text(id.as_str())],
        )?;
        Ok(removed > 0)
    }

    /// Look up one task.
    pub fn get(&self, id: &OperationId) -> Result<Option<UploadTask>> {
        self.store
            .get(
                &format!("{} WHERE id = ?1", SELECT_COLUMNS),
                &[text(id.as_str())],
            )?
            .map(|row| UploadTask::from_row(&row))
            .transpose()
    }

    /// Every task, oldest first.
    pub fn list(&self) -> Result<Vec<UploadTask>> {
        self.store
            .get_all(
                &format!("{} ORDER BY created_at ASC, rowid ASC", SELECT_COLUMNS),
                &[],
            )?
            .iter()
            .map(UploadTask::from_row)
            .collect()
    }

    /// Number of persisted tasks.
    pub fn len(&self) -> Result<usize> {
        let row = self
            .store
            .get("SELECT COUNT(*) AS n FROM processing_queue", &[])?
            .ok_or_else(|| Error::LocalStore("COUNT returned no row".to_string()))?;
        Ok(row.integer("n")? as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Earliest time a waiting task becomes ready.
    pub fn next_available_at(&self) -> Result<Option<DateTime<Utc>>> {
        let row = self.store.get(
            "SELECT MIN(available_at) AS next FROM processing_queue \
             WHERE status IN ('queued', 'error')",
            &[],
        )?;
        match row.as_ref().and_then(|row| row.get("next")) {
            Some(SqlValue::Integer(micros)) => decode_time(*micros).map(Some),
            _ => Ok(None),
        }
    }
}
