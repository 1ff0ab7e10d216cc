//! Binary upload worker pool.

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use poleshift_common::{Error, OperationId, Result};
use poleshift_storage::ObjectStorage;

use crate::config::UploadConfig;
use crate::events::UploadEvent;
use crate::network::NetworkMonitor;
use crate::retry::Backoff;
use crate::upload_queue::{UploadQueue, UploadRequest, UploadTask};

/// Result of one upload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Bytes were transferred.
    Uploaded,
    /// The destination already held an object.
    AlreadyPresent,
    /// Persisted for a later attempt.
    Queued { id: OperationId },
    /// Gave up after the retry cap; the task was removed.
    Abandoned,
}

impl UploadOutcome {
    /// Whether the object is known to be at its destination.
    pub fn is_done(&self) -> bool {
        matches!(self, UploadOutcome::Uploaded | UploadOutcome::AlreadyPresent)
    }
}

/// Tally of one pass over the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolReport {
    pub uploaded: usize,
    pub already_present: usize,
    pub retrying: usize,
    pub abandoned: usize,
}

impl PoolReport {
    fn record(&mut self, outcome: &UploadOutcome) {
        match outcome {
            UploadOutcome::Uploaded => self.uploaded += 1,
            UploadOutcome::AlreadyPresent => self.already_present += 1,
            UploadOutcome::Queued { .. } => self.retrying += 1,
            UploadOutcome::Abandoned => self.abandoned += 1,
        }
    }

    /// Tasks that left the queue during the pass.
    pub fn completed(&self) -> usize {
        self.uploaded + self.already_present + self.abandoned
    }
}

/// One async mutex per destination, created on demand.
#[derive(Default)]
struct DestinationLocks {
    locks: Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>,
}

struct DestinationGuard<'a> {
    owner: &'a DestinationLocks,
    key: (String, String),
    guard: Option<OwnedMutexGuard<()>>,
}

impl DestinationLocks {
    async fn acquire(&self, bucket: &str, path: &str) -> DestinationGuard<'_> {
        let key = (bucket.to_string(), path.to_string());
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks.entry(key.clone()).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        DestinationGuard {
            owner: self,
            key,
            guard: Some(guard),
        }
    }
}

impl Drop for DestinationGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.owner.locks.lock().unwrap_or_else(|p| p.into_inner());
        // Only the map still holds it: nobody is waiting.
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

/// Resets the pass flag on every exit path.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Moves queued binaries to object storage.
///
/// At most `concurrency` transfers run at once, and at most one per
/// destination. An existing destination counts as success, so a file
/// queued twice is transferred once.
pub struct UploadWorkerPool {
    queue: Arc<UploadQueue>,
    storage: Arc<dyn ObjectStorage>,
    monitor: NetworkMonitor,
    config: UploadConfig,
    locks: DestinationLocks,
    running: AtomicBool,
    events: Option<mpsc::UnboundedSender<UploadEvent>>,
}

impl UploadWorkerPool {
    pub fn new(
        queue: Arc<UploadQueue>,
        storage: Arc<dyn ObjectStorage>,
        monitor: NetworkMonitor,
        config: UploadConfig,
    ) -> Self {
        Self {
            queue,
            storage,
            monitor,
            config,
            locks: DestinationLocks::default(),
            running: AtomicBool::new(false),
            events: None,
        }
    }

    /// Emit progress on `events`.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<UploadEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// The backing queue.
    pub fn queue(&self) -> &Arc<UploadQueue> {
        &self.queue
    }

    /// Upload now if online, otherwise queue.
    ///
    /// The request is persisted before the attempt, so a failed or
    /// interrupted direct upload stays queued with a fresh retry count.
    ///
    /// # Errors
    /// - `InvalidInput` for an empty or escaping destination
    /// - `LocalStore` if the request cannot be persisted
    pub async fn upload(&self, request: UploadRequest) -> Result<UploadOutcome> {
        if !self.monitor.is_online() {
            let task = self.queue.enqueue(request)?;
            debug!("Offline; queued upload to {}/{}", task.bucket, task.path);
            self.emit(UploadEvent::Queued { id: task.id.clone() });
            return Ok(UploadOutcome::Queued { id: task.id });
        }

        let mut task = self.queue.enqueue_claimed(request)?;
        let _destination = self.locks.acquire(&task.bucket, &task.path).await;
        let data = std::mem::take(&mut task.data);

        match self.transfer(&task.bucket, &task.path, data).await {
            Ok(outcome) => {
                self.queue.complete(&task.id)?;
                self.emit_done(&task, &outcome);
                Ok(outcome)
            }
            Err(e) if e.is_local_store() => Err(e),
            Err(e) => {
                warn!(
                    "Direct upload to {}/{} failed: {}. Queued for retry",
                    task.bucket, task.path, e
                );
                self.queue.release(&task.id)?;
                self.emit(UploadEvent::Queued { id: task.id.clone() });
                Ok(UploadOutcome::Queued { id: task.id })
            }
        }
    }

    /// Process every task that is ready now.
    ///
    /// Tasks are taken in chunks of `concurrency`; each chunk finishes
    /// before the next starts. Returns immediately if another pass is
    /// running. Stops between chunks when connectivity drops.
    pub async fn process_ready(&self) -> Result<PoolReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Upload pass already running");
            return Ok(PoolReport::default());
        }
        let _pass = PassGuard(&self.running);

        let mut report = PoolReport::default();
        let ready = self.queue.ready_ids(Utc::now())?;
        if ready.is_empty() {
            return Ok(report);
        }
        debug!("{} uploads ready", ready.len());

        for chunk in ready.chunks(self.config.concurrency.max(1)) {
            if !self.monitor.is_online() {
                debug!("Offline; pausing upload pass");
                break;
            }

            let results = join_all(chunk.iter().map(|id| self.process_task(id))).await;
            for result in results {
                if let Some(outcome) = result? {
                    report.record(&outcome);
                }
            }
        }

        if report.completed() > 0 {
            info!(
                "Upload pass: {} uploaded, {} already present, {} retrying, {} abandoned",
                report.uploaded, report.already_present, report.retrying, report.abandoned
            );
        }
        Ok(report)
    }

    /// Remove a queued task.
    pub fn cancel(&self, id: &OperationId) -> Result<bool> {
        self.queue.cancel(id)
    }

    /// Create a time-limited download URL for an uploaded object.
    pub async fn signed_url(&self, bucket: &str, path: &str, ttl: Duration) -> Result<String> {
        self.storage.create_signed_url(bucket, path, ttl).await
    }

    /// Delete uploaded objects.
    pub async fn remove_objects(&self, bucket: &str, paths: &[String]) -> Result<()> {
        self.storage.remove(bucket, paths).await
    }

    async fn process_task(&self, id: &OperationId) -> Result<Option<UploadOutcome>> {
        let Some(mut task) = self.queue.claim(id)? else {
            // Cancelled or picked up elsewhere since the snapshot.
            return Ok(None);
        };

        if !self.monitor.is_online() {
            self.queue.release(&task.id)?;
            return Ok(None);
        }

        let _destination = self.locks.acquire(&task.bucket, &task.path).await;
        let data = std::mem::take(&mut task.data);

        match self.transfer(&task.bucket, &task.path, data).await {
            Ok(outcome) => {
                self.queue.complete(&task.id)?;
                self.emit_done(&task, &outcome);
                Ok(Some(outcome))
            }
            Err(e) if e.is_local_store() => Err(e),
            Err(e) => self.handle_failure(&task, &e).map(Some),
        }
    }

    /// Check the destination, then transfer.
    ///
    /// Callers hold the destination lock.
    async fn transfer(&self, bucket: &str, path: &str, data: Vec<u8>) -> Result<UploadOutcome> {
        if self.storage.exists(bucket, path).await? {
            debug!("{}/{} already present; skipping transfer", bucket, path);
            return Ok(UploadOutcome::AlreadyPresent);
        }

        match self.storage.upload(bucket, path, data).await {
            Ok(()) => Ok(UploadOutcome::Uploaded),
            Err(Error::RemoteRejected { status: 409, .. }) => Ok(UploadOutcome::AlreadyPresent),
            Err(e) => Err(e),
        }
    }

    fn handle_failure(&self, task: &UploadTask, err: &Error) -> Result<UploadOutcome> {
        let retry_count = task.retry_count.saturating_add(1);

        if self.config.exhaustion.is_exhausted(retry_count) {
            self.queue.cancel(&task.id)?;
            error!(
                "Upload to {}/{} failed after {} attempts: {}",
                task.bucket, task.path, retry_count, err
            );
            self.emit(UploadEvent::Failed {
                id: task.id.clone(),
                bucket: task.bucket.clone(),
                path: task.path.clone(),
                error: err.to_string(),
            });
            return Ok(UploadOutcome::Abandoned);
        }

        let delay = self.backoff().delay_for_attempt(task.retry_count);
        let available_at =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        self.queue
            .record_failure(&task.id, retry_count, available_at, &err.to_string())?;

        warn!(
            "Upload to {}/{} failed: {}. Retrying in {:?}...",
            task.bucket, task.path, err, delay
        );
        self.emit(UploadEvent::Retrying {
            id: task.id.clone(),
            retry_count,
            delay,
            error: err.to_string(),
        });
        Ok(UploadOutcome::Queued {
            id: task.id.clone(),
        })
    }

    fn backoff(&self) -> Backoff {
        Backoff::exponential(
            Duration::from_millis(self.config.base_delay_ms),
            Duration::from_millis(self.config.max_delay_ms),
        )
        .with_jitter(self.config.jitter)
    }

    fn emit_done(&self, task: &UploadTask, outcome: &UploadOutcome) {
        let event = match outcome {
            UploadOutcome::Uploaded => UploadEvent::Uploaded {
                bucket: task.bucket.clone(),
                path: task.path.clone(),
            },
            UploadOutcome::AlreadyPresent => UploadEvent::AlreadyPresent {
                bucket: task.bucket.clone(),
                path: task.path.clone(),
            },
            _ => return,
        };
        self.emit(event);
    }

    fn emit(&self, event: UploadEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}
