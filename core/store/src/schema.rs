//! Schema of the engine's bookkeeping tables.

/// DDL applied on every open. Idempotent.
pub const ENGINE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pending_operations (
    id TEXT PRIMARY KEY,
    table_name TEXT NOT NULL,
    op_type TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    enqueued_at INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_pending_operations_enqueued
    ON pending_operations(enqueued_at);

CREATE TABLE IF NOT EXISTS processing_queue (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    sample_ref TEXT,
    bucket TEXT NOT NULL,
    file_path TEXT NOT NULL,
    blob BLOB NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    available_at INTEGER NOT NULL,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_processing_queue_ready
    ON processing_queue(status, available_at);

CREATE TABLE IF NOT EXISTS sync_cursors (
    table_name TEXT PRIMARY KEY,
    last_synced_at INTEGER NOT NULL
);
"#;
