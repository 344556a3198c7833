//! Project Sync - Command line driver
//!
//! Runs a scripted sync session against the in-process remote, and offers
//! inspection and purge commands for an on-disk cache.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use project_sync::connectivity::ToggleConnectivity;
use project_sync::events::SyncEvent;
use project_sync::identity::WatchIdentity;
use project_sync::models::{EntityKind, Project, Task, User};
use project_sync::remote::MemoryRemote;
use project_sync::store::{LocalStore, SqliteStore};
use project_sync::sync::{BackgroundFlusher, SyncDeps};
use project_sync::{Config, SyncEngine};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "syncd")]
#[command(about = "Offline-first project sync engine")]
struct Cli {
    /// Path to a YAML config file (defaults to ./config.yaml)
    #[arg(short, long, env = "SYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scripted session: out-of-order snapshots, offline edits, flush
    Demo {
        /// Keep the cache at the configured db path instead of in memory
        #[arg(long)]
        persist: bool,

        /// Seconds to wait for each expected sync step
        #[arg(long, default_value = "5")]
        step_timeout: u64,
    },

    /// Print the contents of the local cache as JSON
    Inspect,

    /// Delete every row from the local cache
    Purge,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,project_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config = Config::from_yaml_and_env(cli.config.as_deref())?;

    match cli.command {
        Commands::Demo {
            persist,
            step_timeout,
        } => run_demo(config, persist, Duration::from_secs(step_timeout)).await,
        Commands::Inspect => run_inspect(&config).await,
        Commands::Purge => run_purge(&config).await,
    }
}

fn open_store(config: &Config) -> Result<SqliteStore> {
    SqliteStore::open(&config.db_path)
        .with_context(|| format!("opening local store at {}", config.db_path.display()))
}

/// Wait for the first event matching `pred`
async fn expect_event(
    rx: &mut broadcast::Receiver<SyncEvent>,
    timeout: Duration,
    what: &str,
    pred: impl Fn(&SyncEvent) -> bool,
) -> Result<SyncEvent> {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    anyhow::bail!("event bus closed while waiting for {what}")
                }
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .with_context(|| format!("timed out waiting for {what}"))?
}

async fn run_demo(config: Config, persist: bool, step_timeout: Duration) -> Result<()> {
    let store = if persist {
        open_store(&config)?
    } else {
        SqliteStore::open_in_memory()?
    };
    let store: Arc<dyn LocalStore> = Arc::new(store);

    let user = User::new("demo-user", "demo@example.com", "Demo User");
    let remote = MemoryRemote::new();
    remote.sign_in(user.clone()).await;
    let identity = Arc::new(WatchIdentity::new(Some(user.clone())));
    let connectivity = Arc::new(ToggleConnectivity::default());

    let engine = Arc::new(SyncEngine::new(
        SyncDeps {
            store: store.clone(),
            remote: Arc::new(remote.clone()),
            identity: identity.clone(),
            connectivity: connectivity.clone(),
        },
        &config,
    ));
    let mut events = engine.events();

    engine.start().await;
    let state = engine.wait_ready().await;
    if let Some(err) = state.error {
        anyhow::bail!("initial sync failed: {err}");
    }
    tracing::info!("Initial sync complete");

    let flusher = BackgroundFlusher::spawn(
        engine.clone(),
        Duration::from_secs(config.flush_interval_secs),
    );

    // A task shared by a collaborator lands before its project
    let project = Project::new(&user.id, "Quarterly planning");
    let early = Task::new(&user.id, "Draft agenda").in_project(project.id.clone());
    remote.put_task(early.clone()).await;
    expect_event(&mut events, step_timeout, "deferred task", |e| {
        matches!(e, SyncEvent::Deferred { key, .. } if key == &early.id)
    })
    .await?;
    tracing::info!(task = %early.id, "Task parked until its project arrives");

    remote.put_project(project.clone()).await;
    let landed = tokio::time::timeout(step_timeout, async {
        loop {
            if let Some(task) = store.get_task(&early.id).await? {
                return Ok::<_, anyhow::Error>(task);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .context("deferred task never reached the local store")??;
    tracing::info!(task = %landed.id, status = %landed.sync_status, "Deferred task applied");

    // Edits made offline stay pending until the next flush
    connectivity.set_online(false);
    remote.set_online(false);
    let offline = engine
        .tasks()
        .create(Task::new(&user.id, "Book a room").in_project(project.id.clone()))
        .await?;
    engine.tasks().toggle_completion(&early.id).await?;
    engine.settle().await;
    tracing::info!(task = %offline.id, "Created while offline");

    connectivity.set_online(true);
    remote.set_online(true);
    let report = engine.sync_pending().await?;
    tracing::info!(
        synced = report.synced,
        failed = report.failed,
        retryable = report.retryable,
        "Pending changes flushed"
    );

    let on_server = remote.get_task(&offline.id).await.is_some();
    tracing::info!(on_server, "Offline task reached the remote");

    flusher.shutdown().await;
    engine.shutdown().await;

    let tasks = store.list_tasks().await?;
    println!("{}", serde_json::to_string_pretty(&tasks)?);
    Ok(())
}

async fn run_inspect(config: &Config) -> Result<()> {
    let store = open_store(config)?;

    let dump = serde_json::json!({
        "projects": store.list_projects().await?,
        "tasks": store.list_tasks().await?,
        "invitations": store.list_invitations(None).await?,
        "pending": {
            "projects": store.pending_rows(EntityKind::Project).await?.len(),
            "tasks": store.pending_rows(EntityKind::Task).await?.len(),
            "invitations": store.pending_rows(EntityKind::Invitation).await?.len(),
        },
    });
    println!("{}", serde_json::to_string_pretty(&dump)?);
    Ok(())
}

async fn run_purge(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    store.purge_all().await?;
    tracing::info!("Purged local store at {}", config.db_path.display());
    Ok(())
}
