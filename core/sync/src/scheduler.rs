//! Background scheduling of sync cycles and upload passes.

use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use poleshift_common::{Error, Result};

use crate::engine::{CycleOutcome, SyncEngine};
use crate::state::ConnectivityState;

/// Why a cycle was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Explicit request through the handle.
    Manual,
    /// Periodic tick.
    Tick,
    /// Connectivity came back.
    Reconnected,
    /// A local write asked for a cycle.
    LocalWrite,
}

/// Handle to the background scheduler.
pub struct SchedulerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    engine: Arc<SyncEngine>,
}

impl SchedulerHandle {
    /// Run a cycle and an upload pass now.
    ///
    /// Goes through the same single-flight guard as scheduled cycles, so a
    /// request made while a cycle is running returns
    /// `Skipped(AlreadySyncing)` instead of queueing another cycle.
    pub async fn request_sync(&self) -> Result<CycleOutcome> {
        if self.task.is_finished() {
            return Err(Error::Config("Scheduler not running".to_string()));
        }
        debug!("Sync triggered: {:?}", SyncTrigger::Manual);

        let (uploads, outcome) =
            tokio::join!(self.engine.process_uploads(), self.engine.sync_now());
        if let Err(e) = uploads {
            error!("Upload pass failed: {}", e);
        }
        outcome
    }

    /// Stop the scheduler and automatic probing, waiting for the loop to exit.
    ///
    /// A cycle in progress finishes first, and so do upload passes the
    /// scheduler started.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
        self.engine.shutdown();
    }
}

/// Spawn the scheduler loop for `engine`.
///
/// A cycle and an upload pass run at startup, on every tick, when
/// connectivity returns, and after local writes.
pub fn spawn(engine: Arc<SyncEngine>) -> SchedulerHandle {
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let connectivity = engine.monitor().subscribe();

    let task = tokio::spawn(run(engine.clone(), shutdown_rx, connectivity));

    SchedulerHandle {
        shutdown_tx: Some(shutdown_tx),
        task,
        engine,
    }
}

async fn run(
    engine: Arc<SyncEngine>,
    mut shutdown_rx: oneshot::Receiver<()>,
    mut connectivity: watch::Receiver<ConnectivityState>,
) {
    let mut ticker = interval(engine.config().tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut was_online = connectivity.borrow_and_update().is_online();
    let mut upload_passes = JoinSet::new();

    info!("Sync scheduler started");

    loop {
        let trigger = tokio::select! {
            _ = &mut shutdown_rx => break,

            _ = ticker.tick() => SyncTrigger::Tick,

            changed = connectivity.changed() => {
                if changed.is_err() {
                    break;
                }
                let online = connectivity.borrow_and_update().is_online();
                let reconnected = online && !was_online;
                was_online = online;
                if !reconnected {
                    continue;
                }
                SyncTrigger::Reconnected
            }

            _ = engine.nudged() => SyncTrigger::LocalWrite,

            Some(finished) = upload_passes.join_next() => {
                if let Err(e) = finished {
                    error!("Upload pass task failed: {}", e);
                }
                continue;
            }
        };

        debug!("Sync triggered: {:?}", trigger);

        let uploads = engine.clone();
        upload_passes.spawn(async move {
            if let Err(e) = uploads.process_uploads().await {
                error!("Upload pass failed: {}", e);
            }
        });

        if let Err(e) = engine.sync_now().await {
            error!("Sync cycle aborted: {}", e);
        }
    }

    while let Some(finished) = upload_passes.join_next().await {
        if let Err(e) = finished {
            error!("Upload pass task failed: {}", e);
        }
    }

    info!("Sync scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use poleshift_common::{OpType, TableName, TableSpec};
    use poleshift_storage::{MemoryObjectStorage, MemoryRemote, StaticProbe};
    use poleshift_store::{LocalStore, SqliteStore};
    use serde_json::json;
    use std::time::Duration;

    use crate::config::EngineConfig;
    use crate::engine::EngineServices;
    use crate::state::SkipReason;
    use crate::upload_queue::UploadRequest;

    fn engine(storage: Arc<MemoryObjectStorage>, remote: Arc<MemoryRemote>) -> Arc<SyncEngine> {
        let store: Arc<dyn LocalStore> = Arc::new(SqliteStore::in_memory().unwrap());
        store
            .execute("CREATE TABLE samples (id TEXT PRIMARY KEY, updated_at TEXT)", &[])
            .unwrap();
        let mut config =
            EngineConfig::with_tables(vec![TableSpec::new(TableName::new("samples").unwrap())]);
        config.tick_interval_ms = 60_000;

        let (engine, _events) = SyncEngine::new(
            config,
            EngineServices {
                store,
                remote,
                storage,
                probe: Arc::new(StaticProbe::new(true)),
            },
        )
        .unwrap();
        Arc::new(engine)
    }

    #[tokio::test]
    async fn test_manual_request_while_offline() {
        let engine = engine(Arc::new(MemoryObjectStorage::new()), Arc::new(MemoryRemote::new()));
        let handle = engine.start();

        let outcome = handle.request_sync().await.unwrap();
        assert_eq!(outcome, CycleOutcome::Skipped(SkipReason::Offline));

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_drains_queues() {
        let storage = Arc::new(MemoryObjectStorage::new());
        let remote = Arc::new(MemoryRemote::new());
        let engine = engine(storage.clone(), remote.clone());
        let samples = TableName::new("samples").unwrap();

        engine
            .write(&samples, OpType::Insert, json!({"id": "s1"}))
            .unwrap();
        engine
            .upload(UploadRequest::new("raw_data", "raw-data", "s1.csv", vec![1]))
            .await
            .unwrap();

        let handle = engine.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(remote.row("samples", "s1").is_none());

        engine.monitor().connectivity_restored().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(remote.row("samples", "s1").is_some());
        assert_eq!(storage.transfers(), 1);
        assert_eq!(engine.status_snapshot().pending_operations, 0);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_request_during_cycle_is_skipped() {
        let remote = Arc::new(MemoryRemote::new());
        let engine = engine(Arc::new(MemoryObjectStorage::new()), remote.clone());
        engine.monitor().connectivity_restored().await;
        engine
            .write(&TableName::new("samples").unwrap(), OpType::Insert, json!({"id": "s1"}))
            .unwrap();
        // Keeps the startup cycle in push backoff.
        remote.fail_next(1);

        let handle = engine.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(engine.monitor().state().is_syncing);

        let outcome = handle.request_sync().await.unwrap();
        assert_eq!(outcome, CycleOutcome::Skipped(SkipReason::AlreadySyncing));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(remote.row("samples", "s1").is_some());
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_upload_pass() {
        let storage = Arc::new(MemoryObjectStorage::new());
        let engine = engine(storage.clone(), Arc::new(MemoryRemote::new()));
        storage.set_upload_delay(Duration::from_millis(500));
        engine
            .upload(UploadRequest::new("raw_data", "raw-data", "s1.csv", vec![1]))
            .await
            .unwrap();

        let handle = engine.start();
        engine.monitor().connectivity_restored().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!engine.uploads().queue().is_empty().unwrap());

        handle.shutdown().await;

        assert_eq!(storage.transfers(), 1);
        assert!(engine.uploads().queue().is_empty().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_write_nudges_cycle() {
        let remote = Arc::new(MemoryRemote::new());
        let engine = engine(Arc::new(MemoryObjectStorage::new()), remote.clone());
        engine.monitor().connectivity_restored().await;

        let handle = engine.start();
        tokio::time::sleep(Duration::from_millis(10)).await;

        engine
            .write(&TableName::new("samples").unwrap(), OpType::Upsert, json!({"id": "s2"}))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(remote.row("samples", "s2").is_some());
        handle.shutdown().await;
    }
}
