use std::path::{Path, PathBuf};
use std::sync::Arc;

use cadence_core::CadenceConfig;
use cadence_scheduler::{
    ChannelNotifier, Clock, CompletionHook, CompletionReactor, MaterializationPipeline, NewSchedule,
    PipelineOptions, SchedulerEngine, SqliteScheduleStore, SqliteTaskSink, SystemClock, TaskStatus,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Cadence: recurring task scheduler.
#[derive(Parser)]
#[command(name = "cadence", version, about)]
struct Cli {
    /// Path to TOML configuration file (overrides CADENCE_CONFIG).
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler loop until Ctrl-C.
    Run,
    /// Materialize everything due now, print the report and exit.
    Tick,
    /// Create a schedule from a JSON file.
    Add {
        #[arg(long)]
        file: PathBuf,
        /// First eligible instant; overrides `start` in the file.
        #[arg(long)]
        start: Option<DateTime<Utc>>,
    },
    /// Print all schedules as JSON.
    List,
    Pause { id: String },
    Resume { id: String },
    Remove { id: String },
    /// Mark a task instance complete.
    Complete { instance_id: String },
}

struct Services {
    store: Arc<SqliteScheduleStore>,
    sink: Arc<SqliteTaskSink>,
    clock: Arc<SystemClock>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence_daemon=info,cadence_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > CADENCE_CONFIG > ~/.cadence/cadence.toml
    let config_path = cli
        .config
        .map(|p| p.to_string_lossy().into_owned())
        .or_else(|| std::env::var("CADENCE_CONFIG").ok());
    let config = CadenceConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        CadenceConfig::default()
    });

    let services = open_services(&config.database.path)?;

    match cli.command {
        Command::Run => run(config, services).await,
        Command::Tick => {
            let report = pipeline(&config, &services).process_due_schedules().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Add { file, start } => {
            let new = read_schedule(&file, start)
                .map_err(|e| anyhow::anyhow!("{}: {} ({e})", e.code(), file.display()))?;
            let schedule = services.store.create(new, services.clock.now())?;
            println!("{}", serde_json::to_string_pretty(&schedule)?);
            Ok(())
        }
        Command::List => {
            println!("{}", serde_json::to_string_pretty(&services.store.list()?)?);
            Ok(())
        }
        Command::Pause { id } => Ok(services.store.pause(&id, services.clock.now())?),
        Command::Resume { id } => Ok(services.store.resume(&id, services.clock.now())?),
        Command::Remove { id } => Ok(services.store.delete(&id)?),
        Command::Complete { instance_id } => {
            let reactor = CompletionReactor::new(services.store.clone(), services.clock.clone());
            let hook = CompletionHook::new(services.sink.clone(), reactor);
            let (instance, outcome) = hook
                .transition(&instance_id, TaskStatus::Complete, services.clock.now())
                .await?;
            println!(
                "{}",
                serde_json::json!({ "instance": instance, "outcome": outcome })
            );
            Ok(())
        }
    }
}

async fn run(config: CadenceConfig, services: Services) -> anyhow::Result<()> {
    // Event channel: pipeline → logging consumer
    let (notifier, mut events) = ChannelNotifier::channel(config.notifications.channel_capacity);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => info!(event = %json, "schedule event"),
                Err(e) => warn!("unprintable schedule event: {e}"),
            }
        }
    });

    let pipeline = Arc::new(pipeline(&config, &services).with_notifier(Arc::new(notifier)));
    let engine = SchedulerEngine::new(pipeline, config.scheduler.tick_interval());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(engine.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, stopping scheduler");
    let _ = shutdown_tx.send(true);
    handle.await?;
    Ok(())
}

fn pipeline(config: &CadenceConfig, services: &Services) -> MaterializationPipeline {
    MaterializationPipeline::new(services.store.clone(), services.sink.clone(), services.clock.clone())
        .with_options(PipelineOptions::from(&config.scheduler))
}

/// Open the schedule store and the task sink, each on its own connection.
fn open_services(db_path: &str) -> anyhow::Result<Services> {
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");

    let clock = Arc::new(SystemClock);
    Ok(Services {
        store: Arc::new(SqliteScheduleStore::new(open_connection(db_path)?)?),
        sink: Arc::new(SqliteTaskSink::new(open_connection(db_path)?, clock.clone())?),
        clock,
    })
}

fn open_connection(db_path: &str) -> rusqlite::Result<rusqlite::Connection> {
    let conn = rusqlite::Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    // store and sink write the same file from separate connections
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}

fn read_schedule(path: &Path, start: Option<DateTime<Utc>>) -> cadence_core::Result<NewSchedule> {
    let raw = std::fs::read_to_string(path)?;
    let mut value: serde_json::Value = serde_json::from_str(&raw)?;
    if let (Some(start), Some(obj)) = (start, value.as_object_mut()) {
        obj.insert("start".into(), serde_json::to_value(start)?);
    }
    Ok(serde_json::from_value(value)?)
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
