//! Notifications emitted by the engine.

use std::time::Duration;

use poleshift_common::{OpType, OperationId, TableName};

/// Events from the sync cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A cycle finished; `applied` operations were confirmed remotely.
    CycleCompleted { applied: usize, merged: usize },
    /// A cycle ended with an error.
    CycleFailed { error: String },
    /// An operation exceeded its retry cap and was dropped.
    OperationDiscarded {
        id: OperationId,
        table: TableName,
        op_type: OpType,
        retry_count: u32,
    },
}

/// Events from the binary upload pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    /// Task persisted for later processing.
    Queued { id: OperationId },
    /// Bytes transferred to the destination.
    Uploaded { bucket: String, path: String },
    /// Destination already held an object; nothing was transferred.
    AlreadyPresent { bucket: String, path: String },
    /// Attempt failed; the task will be retried after `delay`.
    Retrying {
        id: OperationId,
        retry_count: u32,
        delay: Duration,
        error: String,
    },
    /// Terminal failure; the task was removed.
    Failed {
        id: OperationId,
        bucket: String,
        path: String,
        error: String,
    },
}
