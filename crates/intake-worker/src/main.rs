//! intake-worker: runs queue workers and the worker manager against Postgres.
//!
//! ```text
//! intake-worker work --job-type analysis --limit 20
//! intake-worker work --loop
//! intake-worker manage --loop --interval 60
//! intake-worker requeue-stale
//! intake-worker reset-failed --job-type analysis --error timeout
//! intake-worker stats
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use intake_core::{JobQueue, JobType, QueueStore};
use intake_db::{log_pool_metrics, Database, PoolConfig};
use intake_inference::OpenAIBackend;
use intake_jobs::{
    AnalysisHandler, FollowUpHandler, ManagerConfig, NormalizeHandler, QueueMonitor,
    WorkerBuilder, WorkerConfig, WorkerManager,
};

#[derive(Debug, Parser)]
#[command(name = "intake-worker", version, about = "Intake job worker and manager")]
struct Cli {
    /// Postgres connection string.
    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "postgres://localhost/intake",
        global = true
    )]
    database_url: String,

    /// Skip running pending migrations on startup.
    #[arg(long, global = true)]
    skip_migrations: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Lease and run due jobs.
    Work {
        /// Only run jobs of this type (analysis, normalize, follow_up).
        #[arg(long)]
        job_type: Option<String>,
        /// Jobs to consider per batch.
        #[arg(long)]
        limit: Option<i64>,
        /// Lease duration in seconds.
        #[arg(long)]
        lease_seconds: Option<u64>,
        /// Keep polling until interrupted.
        #[arg(long = "loop")]
        continuous: bool,
    },
    /// Run the scheduled rules.
    Manage {
        /// Keep running cycles until interrupted.
        #[arg(long = "loop")]
        continuous: bool,
        /// Seconds between cycles in loop mode.
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Return jobs with expired leases to the queue.
    RequeueStale,
    /// Requeue failed jobs of a type whose last error matches exactly.
    ResetFailed {
        #[arg(long)]
        job_type: String,
        #[arg(long)]
        error: String,
    },
    /// Print queue and item counts as JSON.
    Stats,
}

/// Initialize tracing with configurable output.
///
/// | Variable | Default | Description |
/// |----------|---------|-------------|
/// | `LOG_FORMAT` | `text` | `json` or `text` |
/// | `LOG_FILE` | none | Enables daily-rotated file output |
/// | `LOG_ANSI` | auto | Override ANSI colors |
/// | `RUST_LOG` | `intake=info` | Standard env filter |
fn init_tracing() -> Option<WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "intake_worker=info,intake_jobs=info,intake_db=info,intake_inference=info".into()
    });

    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let file_dir = Path::new(path).parent().unwrap_or(Path::new("."));
        let file_name = Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("intake-worker.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );
    guard
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn parse_job_type(raw: &str) -> anyhow::Result<JobType> {
    raw.parse::<JobType>()
        .with_context(|| format!("unknown job type: {raw}"))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_tracing();

    let cli = Cli::parse();

    info!("Connecting to database...");
    let db = Database::connect_with_config(&cli.database_url, PoolConfig::from_env())
        .await
        .context("failed to connect to database")?;
    log_pool_metrics(&db.pool);

    if !cli.skip_migrations {
        info!("Running database migrations...");
        db.migrate().await?;
        info!("Database migrations complete");
    }

    let store: Arc<dyn QueueStore> = Arc::new(db);

    match cli.command {
        Command::Work {
            job_type,
            limit,
            lease_seconds,
            continuous,
        } => {
            let job_type = job_type.as_deref().map(parse_job_type).transpose()?;

            let mut config = WorkerConfig::from_env().with_job_type(job_type);
            if let Some(limit) = limit {
                config = config.with_batch_limit(limit);
            }
            if let Some(secs) = lease_seconds {
                config = config.with_lease_secs(secs);
            }

            let backend = Arc::new(OpenAIBackend::from_env()?);
            let batch_limit = config.batch_limit;
            let worker = WorkerBuilder::new(store.clone())
                .with_config(config)
                .with_handler(AnalysisHandler::new(store.clone(), backend.clone()))
                .with_handler(NormalizeHandler::new(store.clone(), backend.clone()))
                .with_handler(FollowUpHandler::new(store.clone(), backend))
                .build()
                .await;

            if continuous {
                info!(worker_id = worker.worker_id(), "Starting job worker");
                let handle = worker.start();
                shutdown_signal().await;
                handle.shutdown().await?;
            } else {
                let report = worker.run_batch(job_type, batch_limit).await?;
                print_json(&report)?;
            }
        }
        Command::Manage {
            continuous,
            interval,
        } => {
            let mut config = ManagerConfig::from_env();
            if let Some(secs) = interval {
                config = config.with_interval(Duration::from_secs(secs));
            }
            let manager = WorkerManager::new(store, config);

            if continuous {
                manager.run_until(shutdown_signal()).await;
            } else {
                let report = manager.run_cycle().await;
                print_json(&report)?;
            }
        }
        Command::RequeueStale => {
            let requeued = store.requeue_stale_leases().await?;
            info!(requeued, "Requeued stale leases");
            print_json(&serde_json::json!({ "requeued": requeued }))?;
        }
        Command::ResetFailed { job_type, error } => {
            let job_type = parse_job_type(&job_type)?;
            let reset = store.reset_failed(job_type, &error).await?;
            info!(%job_type, reset, "Reset failed jobs");
            print_json(&serde_json::json!({ "job_type": job_type, "reset": reset }))?;
        }
        Command::Stats => {
            let snapshot = QueueMonitor::new(store).snapshot().await?;
            print_json(&snapshot)?;
        }
    }

    Ok(())
}
