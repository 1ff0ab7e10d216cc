//! Sync orchestrator: sequences push and pull cycles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, warn};

use poleshift_common::{Error, OpType, Result, TableName};
use poleshift_storage::{ConnectivityProbe, ObjectStorage, RemoteApi};
use poleshift_store::LocalStore;

use crate::config::EngineConfig;
use crate::events::{SyncEvent, UploadEvent};
use crate::mutation_queue::{MutationQueue, PendingOperation};
use crate::network::NetworkMonitor;
use crate::puller::{PullReport, RemotePuller};
use crate::scheduler::{self, SchedulerHandle};
use crate::state::SkipReason;
use crate::upload_queue::{UploadQueue, UploadRequest};
use crate::uploader::{BatchUploader, PushReport};
use crate::workers::{PoolReport, UploadOutcome, UploadWorkerPool};

/// Collaborators the engine runs against.
pub struct EngineServices {
    /// Holds the domain tables and the engine's bookkeeping tables.
    pub store: Arc<dyn LocalStore>,
    pub remote: Arc<dyn RemoteApi>,
    pub storage: Arc<dyn ObjectStorage>,
    pub probe: Arc<dyn ConnectivityProbe>,
}

/// Receivers for engine notifications.
pub struct EngineEvents {
    pub sync: mpsc::UnboundedReceiver<SyncEvent>,
    pub uploads: mpsc::UnboundedReceiver<UploadEvent>,
}

/// Summary of a completed cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub push: PushReport,
    pub pull: PullReport,
    pub duration_ms: u64,
}

/// What a call to [`SyncEngine::sync_now`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// The cycle ran and stopped on an error. Queued work is kept.
    Failed(String),
    Skipped(SkipReason),
}

/// Observable engine status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    /// End of the last successful cycle.
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Error of the last cycle, cleared by a successful one.
    pub last_error: Option<String>,
    pub last_report: Option<CycleReport>,
    pub pending_operations: usize,
    pub pending_uploads: usize,
}

/// Offline-first replication engine.
///
/// Local writes go through [`SyncEngine::write`] and are persisted before
/// any network attempt. Cycles push the queue, then pull remote changes.
/// At most one cycle runs at a time.
pub struct SyncEngine {
    config: EngineConfig,
    queue: Arc<MutationQueue>,
    uploader: BatchUploader,
    puller: RemotePuller,
    uploads: Arc<UploadWorkerPool>,
    monitor: NetworkMonitor,
    status: watch::Sender<EngineStatus>,
    sync_events: mpsc::UnboundedSender<SyncEvent>,
    nudge: Notify,
}

impl SyncEngine {
    /// Build an engine over `services`.
    ///
    /// # Errors
    /// - `Config` if the configuration is invalid
    /// - `LocalStore` if the queues cannot be opened
    pub fn new(config: EngineConfig, services: EngineServices) -> Result<(Self, EngineEvents)> {
        config.validate()?;

        let (sync_tx, sync_rx) = mpsc::unbounded_channel();
        let (upload_tx, upload_rx) = mpsc::unbounded_channel();

        let monitor = NetworkMonitor::new(services.probe, config.network.clone());
        let queue = Arc::new(MutationQueue::open(services.store.clone(), &config.tables)?);
        let upload_queue = Arc::new(UploadQueue::open(services.store.clone())?);

        let uploader = BatchUploader::new(
            queue.clone(),
            services.remote.clone(),
            monitor.clone(),
            config.push.clone(),
        )
        .with_events(sync_tx.clone());

        let puller = RemotePuller::new(
            services.store,
            services.remote,
            monitor.clone(),
            config.pulled_tables(),
        )
        .with_tenant(config.pull.tenant_id.clone());

        let uploads = Arc::new(
            UploadWorkerPool::new(
                upload_queue,
                services.storage,
                monitor.clone(),
                config.uploads.clone(),
            )
            .with_events(upload_tx),
        );

        let (status, _) = watch::channel(EngineStatus::default());
        let engine = Self {
            config,
            queue,
            uploader,
            puller,
            uploads,
            monitor,
            status,
            sync_events: sync_tx,
            nudge: Notify::new(),
        };
        engine.refresh_pending();

        info!(
            "Sync engine ready: {} tables, {} pending operations",
            engine.config.tables.len(),
            engine.status.borrow().pending_operations
        );

        Ok((
            engine,
            EngineEvents {
                sync: sync_rx,
                uploads: upload_rx,
            },
        ))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn monitor(&self) -> &NetworkMonitor {
        &self.monitor
    }

    pub fn queue(&self) -> &Arc<MutationQueue> {
        &self.queue
    }

    pub fn uploads(&self) -> &Arc<UploadWorkerPool> {
        &self.uploads
    }

    pub fn puller(&self) -> &RemotePuller {
        &self.puller
    }

    /// Observe status changes.
    pub fn status(&self) -> watch::Receiver<EngineStatus> {
        self.status.subscribe()
    }

    /// Current status snapshot.
    pub fn status_snapshot(&self) -> EngineStatus {
        self.status.borrow().clone()
    }

    /// Record a local write.
    ///
    /// The operation is queued first; if online, the scheduler is asked for
    /// a cycle.
    pub fn write(&self, table: &TableName, op_type: OpType, payload: Value) -> Result<PendingOperation> {
        let op = self.queue.enqueue(table, op_type, payload)?;
        self.refresh_pending();
        if self.monitor.is_online() {
            self.nudge.notify_one();
        }
        Ok(op)
    }

    /// Upload a binary now, or queue it while offline.
    pub async fn upload(&self, request: UploadRequest) -> Result<UploadOutcome> {
        let outcome = self.uploads.upload(request).await;
        self.refresh_pending();
        outcome
    }

    /// Run one pass of the upload worker pool.
    pub async fn process_uploads(&self) -> Result<PoolReport> {
        let report = self.uploads.process_ready().await;
        self.refresh_pending();
        report
    }

    /// Run one push-then-pull cycle.
    ///
    /// Skipped when offline or when another cycle is running. A failed push
    /// skips the pull so unconfirmed local writes are not overwritten.
    ///
    /// # Errors
    /// - `LocalStore` failures, after being recorded in the status
    pub async fn sync_now(&self) -> Result<CycleOutcome> {
        let _guard = match self.monitor.begin_sync() {
            Ok(guard) => guard,
            Err(reason) => {
                debug!("Sync skipped: {:?}", reason);
                return Ok(CycleOutcome::Skipped(reason));
            }
        };

        let started = Instant::now();
        debug!("Sync cycle started");

        let result = async {
            let push = self.uploader.push().await?;
            let pull = self.puller.pull().await?;
            Ok::<_, Error>((push, pull))
        }
        .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok((push, pull)) if push.skipped == 0 && pull.failed_tables.is_empty() => {
                let report = CycleReport {
                    push,
                    pull,
                    duration_ms,
                };
                info!(
                    "Sync cycle completed in {}ms: {} pushed, {} pulled",
                    duration_ms, report.push.applied, report.pull.rows_merged
                );
                self.status.send_modify(|status| {
                    status.last_synced_at = Some(Utc::now());
                    status.last_error = None;
                    status.last_report = Some(report.clone());
                });
                self.emit(SyncEvent::CycleCompleted {
                    applied: report.push.applied,
                    merged: report.pull.rows_merged,
                });
                self.refresh_pending();
                Ok(CycleOutcome::Completed(report))
            }
            Ok((push, pull)) => {
                let mut problems = Vec::new();
                if push.skipped > 0 {
                    problems.push(format!("{} operations could not be sent", push.skipped));
                }
                if !pull.failed_tables.is_empty() {
                    let tables: Vec<&str> = pull.failed_tables.iter().map(|t| t.as_str()).collect();
                    problems.push(format!("Pull failed for tables: {}", tables.join(", ")));
                }
                let message = problems.join("; ");
                self.record_failure(&message);
                self.refresh_pending();
                Ok(CycleOutcome::Failed(message))
            }
            Err(e) => {
                self.record_failure(&e.to_string());
                if e.is_local_store() {
                    return Err(e);
                }
                Ok(CycleOutcome::Failed(e.to_string()))
            }
        }
    }

    /// Start the background scheduler.
    pub fn start(self: &Arc<Self>) -> SchedulerHandle {
        scheduler::spawn(self.clone())
    }

    /// Stop automatic connectivity probing.
    pub fn shutdown(&self) {
        self.monitor.shutdown();
    }

    /// Resolves when a local write asked for a cycle.
    pub(crate) async fn nudged(&self) {
        self.nudge.notified().await;
    }

    fn record_failure(&self, message: &str) {
        error!("Sync cycle failed: {}", message);
        self.status.send_modify(|status| {
            status.last_error = Some(message.to_string());
        });
        self.emit(SyncEvent::CycleFailed {
            error: message.to_string(),
        });
        self.refresh_pending();
    }

    fn refresh_pending(&self) {
        let operations = self.queue.len();
        let uploads = self.uploads.queue().len();
        match (operations, uploads) {
            (Ok(operations), Ok(uploads)) => {
                self.status.send_if_modified(|status| {
                    let changed = status.pending_operations != operations
                        || status.pending_uploads != uploads;
                    status.pending_operations = operations;
                    status.pending_uploads = uploads;
                    changed
                });
            }
            (Err(e), _) | (_, Err(e)) => warn!("Failed to count pending work: {}", e),
        }
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.sync_events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poleshift_common::TableSpec;
    use poleshift_storage::{MemoryObjectStorage, MemoryRemote, StaticProbe};
    use poleshift_store::SqliteStore;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        engine: Arc<SyncEngine>,
        remote: Arc<MemoryRemote>,
        events: EngineEvents,
    }

    fn samples() -> TableName {
        TableName::new("samples").unwrap()
    }

    fn harness() -> Harness {
        let store: Arc<dyn LocalStore> = Arc::new(SqliteStore::in_memory().unwrap());
        store
            .execute(
                "CREATE TABLE samples (id TEXT PRIMARY KEY, name TEXT, updated_at TEXT)",
                &[],
            )
            .unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let mut config = EngineConfig::with_tables(vec![TableSpec::new(samples())]);
        config.push.base_delay_ms = 100;

        let (engine, events) = SyncEngine::new(
            config,
            EngineServices {
                store,
                remote: remote.clone(),
                storage: Arc::new(MemoryObjectStorage::new()),
                probe: Arc::new(StaticProbe::new(true)),
            },
        )
        .unwrap();

        Harness {
            engine: Arc::new(engine),
            remote,
            events,
        }
    }

    #[tokio::test]
    async fn test_write_while_offline_is_kept() {
        let h = harness();
        h.engine
            .write(&samples(), OpType::Insert, json!({"id": "s1", "name": "core"}))
            .unwrap();

        let outcome = h.engine.sync_now().await.unwrap();

        assert_eq!(outcome, CycleOutcome::Skipped(SkipReason::Offline));
        assert_eq!(h.engine.status_snapshot().pending_operations, 1);
        assert!(h.remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_pushes_then_pulls() {
        let mut h = harness();
        h.engine.monitor().connectivity_restored().await;
        h.engine
            .write(&samples(), OpType::Insert, json!({"id": "s1", "name": "core"}))
            .unwrap();

        let outcome = h.engine.sync_now().await.unwrap();

        let CycleOutcome::Completed(report) = outcome else {
            panic!("expected a completed cycle");
        };
        assert_eq!(report.push.applied, 1);
        let status = h.engine.status_snapshot();
        assert!(status.last_synced_at.is_some());
        assert_eq!(status.pending_operations, 0);
        assert!(h.remote.row("samples", "s1").is_some());
        assert_eq!(
            h.events.sync.try_recv().unwrap(),
            SyncEvent::CycleCompleted {
                applied: 1,
                merged: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_cycles_are_skipped() {
        let h = harness();
        h.engine.monitor().connectivity_restored().await;
        h.engine
            .write(&samples(), OpType::Insert, json!({"id": "s1"}))
            .unwrap();
        // Forces the first cycle into its backoff sleep.
        h.remote.fail_next(1);

        let (first, second) = tokio::join!(h.engine.sync_now(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            h.engine.sync_now().await
        });

        assert!(matches!(first.unwrap(), CycleOutcome::Completed(_)));
        assert_eq!(
            second.unwrap(),
            CycleOutcome::Skipped(SkipReason::AlreadySyncing)
        );
        assert!(!h.engine.monitor().state().is_syncing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_records_error_and_releases_guard() {
        let h = harness();
        h.engine.monitor().connectivity_restored().await;
        h.engine
            .write(&samples(), OpType::Insert, json!({"id": "s1"}))
            .unwrap();
        h.remote.reject_next(3, 422);

        let outcome = h.engine.sync_now().await.unwrap();

        assert!(matches!(outcome, CycleOutcome::Failed(_)));
        let status = h.engine.status_snapshot();
        assert!(status.last_error.is_some());
        assert_eq!(status.pending_operations, 1);
        assert!(!h.engine.monitor().state().is_syncing);
        // No pull after a failed push.
        assert!(!h
            .remote
            .calls()
            .iter()
            .any(|c| matches!(c, poleshift_storage::RemoteCall::Select { .. })));
    }

    #[tokio::test]
    async fn test_write_rejects_unknown_table() {
        let h = harness();
        let result = h.engine.write(
            &TableName::new("unknown").unwrap(),
            OpType::Insert,
            json!({"id": "x"}),
        );
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
