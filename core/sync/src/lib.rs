//! Poleshift Sync Engine
//!
//! Offline-first replication between the local store and the remote
//! backend:
//! - Durable mutation queue drained by a batched, retrying uploader
//! - Incremental puller with per-table cursors and last-write-wins merges
//! - Network monitor owning connectivity state and the single-flight guard
//! - Durable binary upload queue with a bounded worker pool
//! - Orchestrator and background scheduler

pub mod config;
pub mod cursor;
pub mod engine;
pub mod events;
pub mod mutation_queue;
pub mod network;
pub mod puller;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod upload_queue;
pub mod uploader;
pub mod workers;

// Re-export main types
pub use config::{
    EngineConfig, ExhaustionPolicy, NetworkConfig, PullConfig, PushConfig, UploadConfig,
};
pub use cursor::CursorStore;
pub use engine::{CycleOutcome, CycleReport, EngineEvents, EngineServices, EngineStatus, SyncEngine};
pub use events::{SyncEvent, UploadEvent};
pub use mutation_queue::{MutationQueue, PendingOperation};
pub use network::{NetworkMonitor, SyncGuard};
pub use puller::{PullReport, RemotePuller};
pub use retry::Backoff;
pub use scheduler::{SchedulerHandle, SyncTrigger};
pub use state::{ConnectivityState, NetworkPhase, SkipReason};
pub use upload_queue::{UploadQueue, UploadRequest, UploadStatus, UploadTask};
pub use uploader::{group_operations, BatchUploader, OpGroup, PushReport};
pub use workers::{PoolReport, UploadOutcome, UploadWorkerPool};
