//! Push cycle: drains the mutation queue to the remote in grouped batches.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use poleshift_common::{Error, OpType, OperationId, Result, Row, TableName, TableSpec};
use poleshift_storage::RemoteApi;

use crate::config::{ExhaustionPolicy, PushConfig};
use crate::events::SyncEvent;
use crate::mutation_queue::{MutationQueue, PendingOperation};
use crate::network::NetworkMonitor;
use crate::retry::Backoff;

/// Outcome of one push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushReport {
    /// Operations confirmed by the remote and removed from the queue.
    pub applied: usize,
    /// Groups in the snapshot.
    pub groups: usize,
    /// Attempts used.
    pub attempts: u32,
    /// Operations dropped by the exhaustion policy.
    pub discarded: usize,
    /// Operations left queued because their group cannot be sent as is.
    pub skipped: usize,
}

/// Operations of one (table, kind) pair, in enqueue order.
#[derive(Debug, Clone)]
pub struct OpGroup {
    pub table: TableName,
    pub op_type: OpType,
    pub ops: Vec<PendingOperation>,
}

/// Partition a queue snapshot by (table, kind).
///
/// Groups keep the order in which their first operation was enqueued.
/// Tables listed in `table_order` come first, in that order.
pub fn group_operations(ops: Vec<PendingOperation>, table_order: &[TableName]) -> Vec<OpGroup> {
    let mut groups: Vec<OpGroup> = Vec::new();
    let mut index: HashMap<(TableName, OpType), usize> = HashMap::new();

    for op in ops {
        let key = (op.table.clone(), op.op_type);
        match index.get(&key) {
            Some(&i) => groups[i].ops.push(op),
            None => {
                index.insert(key, groups.len());
                groups.push(OpGroup {
                    table: op.table.clone(),
                    op_type: op.op_type,
                    ops: vec![op],
                });
            }
        }
    }

    if !table_order.is_empty() {
        let rank = |table: &TableName| {
            table_order
                .iter()
                .position(|t| t == table)
                .unwrap_or(table_order.len())
        };
        // Stable, so first-seen order holds within a rank.
        groups.sort_by_key(|group| rank(&group.table));
    }

    groups
}

/// Pushes queued operations to the remote.
pub struct BatchUploader {
    queue: Arc<MutationQueue>,
    remote: Arc<dyn RemoteApi>,
    monitor: NetworkMonitor,
    config: PushConfig,
    events: Option<mpsc::UnboundedSender<SyncEvent>>,
}

impl BatchUploader {
    pub fn new(
        queue: Arc<MutationQueue>,
        remote: Arc<dyn RemoteApi>,
        monitor: NetworkMonitor,
        config: PushConfig,
    ) -> Self {
        Self {
            queue,
            remote,
            monitor,
            config,
            events: None,
        }
    }

    /// Emit discard notifications on `events`.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<SyncEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Push a snapshot of the queue.
    ///
    /// Each group's operations are removed from the queue as soon as the
    /// remote confirms them. A failed attempt bumps the retry count of the
    /// operations it carried and retries the unconfirmed remainder with
    /// linear backoff.
    ///
    /// A group failing with a non-retryable error other than `Offline` or
    /// `LocalStore` is left queued and counted in `skipped`.
    ///
    /// # Errors
    /// - `Offline` when connectivity drops; no attempt is counted
    /// - the last remote error once `max_attempts` is used up
    /// - `LocalStore` immediately
    pub async fn push(&self) -> Result<PushReport> {
        let snapshot = self.queue.peek_ordered()?;
        let mut report = PushReport::default();
        if snapshot.is_empty() {
            return Ok(report);
        }

        let total = snapshot.len();
        let mut remaining = group_operations(snapshot, &self.config.table_order);
        report.groups = remaining.len();
        debug!("Pushing {} operations in {} groups", total, report.groups);

        let backoff = Backoff::linear(self.config.base_delay());
        let max_attempts = self.config.max_attempts.max(1);

        loop {
            report.attempts += 1;
            match self.push_groups(&mut remaining, &mut report).await {
                Ok(()) => {
                    info!(
                        "Pushed {} operations in {} attempt(s)",
                        report.applied, report.attempts
                    );
                    return Ok(report);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if remaining.iter().all(|group| group.ops.is_empty()) => {
                    warn!("Push ended after discarding exhausted operations: {}", e);
                    return Ok(report);
                }
                Err(e) if report.attempts >= max_attempts => {
                    error!("Push failed after {} attempts: {}", report.attempts, e);
                    return Err(e);
                }
                Err(e) => {
                    let delay = backoff.delay_for_attempt(report.attempts);
                    warn!(
                        "Attempt {} failed: {}. Retrying in {:?}...",
                        report.attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn push_groups(&self, remaining: &mut Vec<OpGroup>, report: &mut PushReport) -> Result<()> {
        while let Some(group) = remaining.first_mut() {
            match self.push_group(group, report).await {
                Ok(()) => {}
                Err(e) if e.is_retryable() || e.is_local_store() => return Err(e),
                Err(Error::Offline) => return Err(Error::Offline),
                Err(e) => {
                    // Stays queued for a later cycle; the other groups go on.
                    error!(
                        "Skipping {} {} operations on {}: {}",
                        group.ops.len(),
                        group.op_type,
                        group.table,
                        e
                    );
                    report.skipped += group.ops.len();
                }
            }
            remaining.remove(0);
        }
        Ok(())
    }

    async fn push_group(&self, group: &mut OpGroup, report: &mut PushReport) -> Result<()> {
        let spec = match self.queue.table_spec(&group.table) {
            Some(spec) => spec.clone(),
            None => {
                warn!("Table {} is no longer registered; using defaults", group.table);
                TableSpec::new(group.table.clone())
            }
        };

        while !group.ops.is_empty() {
            if !self.monitor.is_online() {
                return Err(Error::Offline);
            }

            let take = match group.op_type {
                OpType::Update => 1,
                _ => self.config.max_batch_size.max(1).min(group.ops.len()),
            };

            match self.send(&spec, group.op_type, &group.ops[..take]).await {
                Ok(()) => {
                    let ids: Vec<OperationId> =
                        group.ops[..take].iter().map(|op| op.id.clone()).collect();
                    self.queue.remove_many(&ids)?;
                    group.ops.drain(..take);
                    report.applied += take;
                }
                Err(e) => {
                    if e.is_retryable() {
                        report.discarded += self.record_failure(group, take)?;
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn send(&self, spec: &TableSpec, op_type: OpType, ops: &[PendingOperation]) -> Result<()> {
        match op_type {
            OpType::Insert | OpType::Upsert => {
                let rows: Vec<Row> = ops.iter().map(|op| op.payload.clone()).collect();
                self.remote.batch_upsert(spec, &rows).await
            }
            OpType::Delete => {
                let ids = ops
                    .iter()
                    .map(|op| spec.row_id(&op.payload))
                    .collect::<Result<Vec<_>>>()?;
                self.remote.batch_delete(spec, &ids).await
            }
            OpType::Update => {
                for op in ops {
                    let id = spec.row_id(&op.payload)?;
                    self.remote.update(spec, &id, &op.payload).await?;
                }
                Ok(())
            }
        }
    }

    /// Count a failed attempt against the first `attempted` operations.
    ///
    /// Returns how many operations the exhaustion policy dropped.
    fn record_failure(&self, group: &mut OpGroup, attempted: usize) -> Result<usize> {
        let ids: Vec<OperationId> = group.ops[..attempted]
            .iter()
            .map(|op| op.id.clone())
            .collect();
        self.queue.increment_retries(&ids)?;
        for op in &mut group.ops[..attempted] {
            op.retry_count += 1;
        }

        if self.config.exhaustion == ExhaustionPolicy::Retain {
            return Ok(0);
        }

        let (exhausted, kept): (Vec<_>, Vec<_>) = group
            .ops
            .drain(..)
            .partition(|op| self.config.exhaustion.is_exhausted(op.retry_count));
        group.ops = kept;

        if !exhausted.is_empty() {
            let ids: Vec<OperationId> = exhausted.iter().map(|op| op.id.clone()).collect();
            self.queue.remove_many(&ids)?;
            for op in &exhausted {
                error!(
                    "Discarding {} on {} ({}) after {} failed attempts",
                    op.op_type, op.table, op.id, op.retry_count
                );
                if let Some(events) = &self.events {
                    let _ = events.send(SyncEvent::OperationDiscarded {
                        id: op.id.clone(),
                        table: op.table.clone(),
                        op_type: op.op_type,
                        retry_count: op.retry_count,
                    });
                }
            }
        }
        Ok(exhausted.len())
    }
}
