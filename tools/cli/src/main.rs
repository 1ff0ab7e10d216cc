//! Poleshift sync CLI - operator tool for the replication engine.
//!
//! Inspects the local mutation and upload queues, queues files for upload,
//! and runs one-shot or long-running sync against a configured backend.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use poleshift_storage::{HttpProbe, RestConfig, RestObjectStorage, RestRemote};
use poleshift_store::{LocalStore, SqliteStore};
use poleshift_sync::{
    CursorStore, CycleOutcome, EngineConfig, EngineServices, MutationQueue, SyncEngine,
    UploadOutcome, UploadQueue, UploadRequest,
};

const API_KEY_ENV: &str = "POLESHIFT_API_KEY";

#[derive(Parser)]
#[command(name = "poleshift-sync")]
#[command(about = "Poleshift - Offline replication and upload queue")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (default: platform config dir).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Local database (default: platform data dir).
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file.
    Init {
        /// Base URL of the REST backend.
        #[arg(short, long)]
        url: String,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Show pending operations, uploads and pull cursors.
    Status,

    /// Queue a file for upload.
    Upload {
        /// Local file to upload.
        #[arg(short, long)]
        file: PathBuf,

        /// Destination bucket.
        #[arg(short, long)]
        bucket: String,

        /// Destination path inside the bucket.
        #[arg(short, long)]
        path: String,

        /// Upload kind recorded with the task.
        #[arg(short, long, default_value = "raw_data")]
        kind: String,

        /// Domain record the file belongs to.
        #[arg(long)]
        sample: Option<String>,
    },

    /// Run one sync cycle and one upload pass, then exit.
    Sync,

    /// Keep syncing in the background until interrupted.
    Run,
}

/// Remote backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BackendConfig {
    rest_url: String,
    /// Falls back to the `POLESHIFT_API_KEY` environment variable.
    #[serde(default)]
    api_key: Option<String>,
    /// Liveness URL; defaults to the REST URL.
    #[serde(default)]
    health_url: Option<String>,
}

/// Contents of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CliConfig {
    backend: BackendConfig,
    #[serde(flatten)]
    engine: EngineConfig,
}

impl CliConfig {
    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content).context("Invalid config file")?;
        config.engine.validate().context("Invalid engine configuration")?;
        Ok(config)
    }

    fn rest_config(&self) -> Result<RestConfig> {
        let api_key = match std::env::var(API_KEY_ENV) {
            Ok(key) if !key.is_empty() => key,
            _ => self
                .backend
                .api_key
                .clone()
                .with_context(|| format!("No API key in config or {}", API_KEY_ENV))?,
        };
        Ok(RestConfig::new(self.backend.rest_url.clone(), api_key))
    }

    fn health_url(&self) -> &str {
        self.backend
            .health_url
            .as_deref()
            .unwrap_or(&self.backend.rest_url)
    }
}

fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("No config directory on this platform")?;
    Ok(dir.join("poleshift").join("config.json"))
}

fn default_database_path() -> Result<PathBuf> {
    let dir = dirs::data_dir().context("No data directory on this platform")?;
    Ok(dir.join("poleshift").join("poleshift.db"))
}

fn open_store(path: &Path) -> Result<Arc<dyn LocalStore>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = SqliteStore::open(path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };

    if let Commands::Init { url, force } = &cli.command {
        return cmd_init(&config_path, url, *force);
    }

    let config = CliConfig::load(&config_path)?;
    let database = match cli.database {
        Some(path) => path,
        None => default_database_path()?,
    };

    match cli.command {
        Commands::Init { .. } => Ok(()),

        Commands::Status => cmd_status(&config, &database),

        Commands::Upload {
            file,
            bucket,
            path,
            kind,
            sample,
        } => cmd_upload(&config, &database, &file, bucket, path, kind, sample).await,

        Commands::Sync => cmd_sync(&config, &database).await,

        Commands::Run => cmd_run(&config, &database).await,
    }
}

/// Write a default configuration file.
fn cmd_init(path: &Path, url: &str, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }

    let config = CliConfig {
        backend: BackendConfig {
            rest_url: url.to_string(),
            api_key: None,
            health_url: None,
        },
        engine: EngineConfig::default(),
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(&config)?;
    std::fs::write(path, content).context("Failed to write config")?;

    println!("Config written to {}", path.display());
    println!("  Add synced tables under \"tables\" and set {}.", API_KEY_ENV);

    Ok(())
}

/// Show queue and cursor state without touching the network.
fn cmd_status(config: &CliConfig, database: &Path) -> Result<()> {
    let store = open_store(database)?;
    let queue = MutationQueue::open(store.clone(), &config.engine.tables)
        .context("Failed to open mutation queue")?;
    let uploads = UploadQueue::open(store.clone()).context("Failed to open upload queue")?;
    let cursors = CursorStore::new(store);

    let pending = queue.peek_ordered()?;
    println!("Pending operations: {}", pending.len());
    let mut per_table: BTreeMap<String, (usize, u32)> = BTreeMap::new();
    for op in &pending {
        let entry = per_table.entry(op.table.to_string()).or_default();
        entry.0 += 1;
        entry.1 = entry.1.max(op.retry_count);
    }
    for (table, (count, retries)) in per_table {
        println!("  {:<24} {:>6} (max retries {})", table, count, retries);
    }

    let tasks = uploads.list()?;
    println!("Pending uploads: {}", tasks.len());
    for task in tasks {
        let error = task.last_error.as_deref().unwrap_or("-");
        println!(
            "  {} {}/{} [{}] retries={} next={} error={}",
            task.id,
            task.bucket,
            task.path,
            task.status,
            task.retry_count,
            task.available_at.to_rfc3339(),
            error
        );
    }

    let cursors = cursors.all()?;
    if cursors.is_empty() {
        println!("No tables pulled yet.");
    } else {
        println!("Pull cursors:");
        for (table, at) in cursors {
            println!("  {:<24} {}", table, at.to_rfc3339());
        }
    }

    Ok(())
}

/// Queue a file; it goes out on the next upload pass.
async fn cmd_upload(
    config: &CliConfig,
    database: &Path,
    file: &Path,
    bucket: String,
    path: String,
    kind: String,
    sample: Option<String>,
) -> Result<()> {
    info!("Queueing {} for {}/{}", file.display(), bucket, path);

    let data = tokio::fs::read(file)
        .await
        .context("Failed to read source file")?;
    let size = data.len();

    let mut request = UploadRequest::new(kind, bucket, path, data);
    if let Some(sample) = sample {
        request = request.with_sample_ref(sample);
    }

    let engine = build_engine(config, database)?;
    engine.monitor().connectivity_restored().await;

    match engine.upload(request).await.context("Failed to upload")? {
        UploadOutcome::Uploaded => println!("Uploaded ({} bytes)", size),
        UploadOutcome::AlreadyPresent => println!("Already present remotely, nothing sent"),
        UploadOutcome::Queued { id } => println!("Queued as {} ({} bytes)", id, size),
        UploadOutcome::Abandoned => println!("Upload abandoned"),
    }

    engine.shutdown();
    Ok(())
}

/// Run a single cycle.
async fn cmd_sync(config: &CliConfig, database: &Path) -> Result<()> {
    let engine = build_engine(config, database)?;

    if !engine.monitor().connectivity_restored().await {
        engine.shutdown();
        anyhow::bail!("Backend unreachable at {}", config.health_url());
    }

    let uploads = engine
        .process_uploads()
        .await
        .context("Upload pass failed")?;
    let outcome = engine.sync_now().await.context("Sync failed")?;
    engine.shutdown();

    println!(
        "Uploads: {} sent, {} already present, {} retrying, {} abandoned",
        uploads.uploaded, uploads.already_present, uploads.retrying, uploads.abandoned
    );

    match outcome {
        CycleOutcome::Completed(report) => {
            println!("Sync completed in {}ms", report.duration_ms);
            println!("  Pushed: {} operations", report.push.applied);
            println!("  Discarded: {} operations", report.push.discarded);
            println!("  Skipped: {} operations", report.push.skipped);
            println!(
                "  Pulled: {} rows from {} tables",
                report.pull.rows_merged, report.pull.tables
            );
            Ok(())
        }
        CycleOutcome::Failed(message) => anyhow::bail!("Sync failed: {}", message),
        CycleOutcome::Skipped(reason) => {
            println!("Sync skipped: {:?}", reason);
            Ok(())
        }
    }
}

/// Run the scheduler until Ctrl-C.
async fn cmd_run(config: &CliConfig, database: &Path) -> Result<()> {
    let engine = Arc::new(build_engine(config, database)?);
    let mut status = engine.status();

    let handle = engine.start();
    engine.monitor().connectivity_restored().await;

    info!(
        "Syncing every {}s, press Ctrl-C to stop",
        config.engine.tick_interval().as_secs()
    );

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                match current.last_error {
                    Some(error) => warn!("Last cycle failed: {}", error),
                    None => info!(
                        "{} operations and {} uploads pending",
                        current.pending_operations, current.pending_uploads
                    ),
                }
            }
        }
    }

    info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}

fn build_engine(config: &CliConfig, database: &Path) -> Result<SyncEngine> {
    let rest = config.rest_config()?;
    let probe_timeout = Duration::from_millis(config.engine.network.probe_timeout_ms);

    let services = EngineServices {
        store: open_store(database)?,
        remote: Arc::new(RestRemote::new(&rest).context("Failed to create REST client")?),
        storage: Arc::new(
            RestObjectStorage::new(&rest).context("Failed to create storage client")?,
        ),
        probe: Arc::new(
            HttpProbe::new(config.health_url(), probe_timeout)
                .context("Failed to create connectivity probe")?,
        ),
    };

    let (engine, mut events) =
        SyncEngine::new(config.engine.clone(), services).context("Failed to start engine")?;

    // Surface terminal events in the log.
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(event) = events.sync.recv() => info!("{:?}", event),
                Some(event) = events.uploads.recv() => info!("{:?}", event),
                else => break,
            }
        }
    });

    Ok(engine)
}
