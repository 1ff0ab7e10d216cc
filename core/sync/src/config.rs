//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use poleshift_common::{Error, Result, TableName, TableSpec};

/// What a queue does with an entry whose retries reached the cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Keep the entry and keep retrying on later passes.
    Retain,
    /// Remove the entry once `retry_count` reaches `max_retries`.
    Discard { max_retries: u32 },
}

impl ExhaustionPolicy {
    /// Whether an entry with `retry_count` failed attempts must be dropped.
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        match self {
            ExhaustionPolicy::Retain => false,
            ExhaustionPolicy::Discard { max_retries } => retry_count >= *max_retries,
        }
    }
}

/// Push cycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// Attempts per cycle before the cycle gives up.
    pub max_attempts: u32,
    /// Linear backoff unit between attempts.
    pub base_delay_ms: u64,
    /// Maximum rows per batched call.
    pub max_batch_size: usize,
    /// Policy for operations that keep failing.
    pub exhaustion: ExhaustionPolicy,
    /// Tables whose groups are pushed first, in this order.
    pub table_order: Vec<TableName>,
}

impl PushConfig {
    /// Backoff unit as a duration.
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_batch_size: 500,
            exhaustion: ExhaustionPolicy::Retain,
            table_order: Vec::new(),
        }
    }
}

/// Pull cycle settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PullConfig {
    /// Tables to pull. Empty means every registered table.
    pub tables: Vec<TableName>,
    /// Organization id used to scope tables that have a tenant column.
    pub tenant_id: Option<String>,
}

/// Binary upload settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Uploads in flight at once.
    pub concurrency: usize,
    /// Exponential backoff unit.
    pub base_delay_ms: u64,
    /// Cap on the exponential backoff.
    pub max_delay_ms: u64,
    /// Randomise backoff by +/- 25%.
    pub jitter: bool,
    /// Policy for tasks that keep failing.
    pub exhaustion: ExhaustionPolicy,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            base_delay_ms: 1000,
            max_delay_ms: 300_000,
            jitter: false,
            exhaustion: ExhaustionPolicy::Discard { max_retries: 3 },
        }
    }
}

/// Network monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// First reconnect delay after a failed probe.
    pub initial_reconnect_interval_ms: u64,
    /// Upper bound for the doubling reconnect delay.
    pub max_reconnect_interval_ms: u64,
    /// Failed probes before auto-probing stops.
    pub max_reconnect_attempts: u32,
    /// Timeout of a single HTTP probe.
    pub probe_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            initial_reconnect_interval_ms: 1000,
            max_reconnect_interval_ms: 60_000,
            max_reconnect_attempts: 5,
            probe_timeout_ms: 5000,
        }
    }
}

/// Configuration for the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Every replicated table.
    pub tables: Vec<TableSpec>,
    /// Periodic cycle interval.
    pub tick_interval_ms: u64,
    pub push: PushConfig,
    pub pull: PullConfig,
    pub uploads: UploadConfig,
    pub network: NetworkConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tables: Vec::new(),
            tick_interval_ms: 30_000,
            push: PushConfig::default(),
            pull: PullConfig::default(),
            uploads: UploadConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a config replicating `tables` with default settings.
    pub fn with_tables(tables: Vec<TableSpec>) -> Self {
        Self {
            tables,
            ..Self::default()
        }
    }

    /// Periodic cycle interval as a duration.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Look up a registered table.
    pub fn table(&self, name: &TableName) -> Option<&TableSpec> {
        self.tables.iter().find(|spec| &spec.name == name)
    }

    /// Tables the puller watches.
    pub fn pulled_tables(&self) -> Vec<TableSpec> {
        if self.pull.tables.is_empty() {
            return self.tables.clone();
        }
        self.pull
            .tables
            .iter()
            .filter_map(|name| self.table(name).cloned())
            .collect()
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for spec in &self.tables {
            spec.validate()?;
            if !seen.insert(spec.name.clone()) {
                return Err(Error::Config(format!("Table {} registered twice", spec.name)));
            }
        }
        for name in self.pull.tables.iter().chain(&self.push.table_order) {
            if !seen.contains(name) {
                return Err(Error::Config(format!("Unknown table {}", name)));
            }
        }
        if self.push.max_attempts == 0 {
            return Err(Error::Config("push.max_attempts must be at least 1".into()));
        }
        if self.push.max_batch_size == 0 {
            return Err(Error::Config("push.max_batch_size must be at least 1".into()));
        }
        if self.uploads.concurrency == 0 {
            return Err(Error::Config("uploads.concurrency must be at least 1".into()));
        }
        if self.tick_interval_ms == 0 {
            return Err(Error::Config("tick_interval_ms must be positive".into()));
        }
        Ok(())
    }

    /// Load a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)?;
        Ok(())
    }
}
