//! Queue Admin CLI
//!
//! Operator commands against the Redis-backed job queue runtime:
//!
//! ```text
//! queue-admin queue list
//! queue-admin queue pause tournament
//! queue-admin queue drain tournament --include-active
//! queue-admin queue clean tournament --status completed --grace-ms 0
//! queue-admin scheduler list tournament
//! queue-admin job peek tournament live-sync:4
//! queue-admin worker stats tournament
//! queue-admin monitor tournament --port 8082
//! ```
//!
//! Exit codes: 0 on success, 2 on invalid arguments (clap), 1 on runtime
//! failure.

use clap::{Parser, Subcommand};
use core_config::{Environment, FromEnv};
use database::redis::{RedisConfig, RedisConnector};
use eyre::WrapErr;
use job_queue::{
    EventSubscriber, HealthState, JobScheduler, JobState, MonitorOptions, Queue, QueueMonitor,
    QueueOptions, SchedulerOptions, health_router, metrics,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "queue-admin",
    version,
    about = "Operator tooling for the job queue runtime"
)]
struct Cli {
    /// Key prefix shared with the workers
    #[arg(long, global = true, default_value = job_queue::DEFAULT_PREFIX)]
    prefix: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Queue lifecycle operations
    #[command(subcommand)]
    Queue(QueueCommand),

    /// Scheduler inspection
    #[command(subcommand)]
    Scheduler(SchedulerCommand),

    /// Single-job inspection
    #[command(subcommand)]
    Job(JobCommand),

    /// Worker-side statistics
    #[command(subcommand)]
    Worker(WorkerCommand),

    /// Run the live monitor with health/metrics endpoints
    Monitor {
        /// Queue name
        queue: String,

        /// Health server port
        #[arg(long, default_value_t = 8082)]
        port: u16,

        /// Poll interval in milliseconds
        #[arg(long, default_value_t = 5000)]
        interval_ms: u64,
    },
}

#[derive(Subcommand)]
enum QueueCommand {
    /// List every queue under the prefix with its counts
    List,

    /// Pause dispatching (jobs keep accumulating)
    Pause { queue: String },

    /// Resume dispatching
    Resume { queue: String },

    /// Remove waiting and delayed jobs
    Drain {
        queue: String,

        /// Also remove active jobs
        #[arg(long)]
        include_active: bool,
    },

    /// Remove old finished (or stale queued) jobs
    Clean {
        queue: String,

        /// Job state to clean: completed, failed, delayed or waiting
        #[arg(long, default_value = "completed")]
        status: String,

        /// Only remove jobs older than this many milliseconds
        #[arg(long, default_value_t = 0)]
        grace_ms: u64,

        /// Maximum number of jobs to remove
        #[arg(long, default_value_t = 1000)]
        limit: u64,
    },

    /// Delete every key of the queue
    Obliterate {
        queue: String,

        /// Proceed even while jobs are active
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum SchedulerCommand {
    /// List schedulers ordered by next run time
    List {
        queue: String,

        /// First index of the page
        #[arg(long, default_value_t = 0)]
        start: isize,

        /// Last index of the page (-1 = all)
        #[arg(long, default_value_t = -1)]
        end: isize,

        /// Sort descending instead of ascending
        #[arg(long)]
        desc: bool,
    },
}

#[derive(Subcommand)]
enum JobCommand {
    /// Print one job record
    Peek { queue: String, id: String },
}

#[derive(Subcommand)]
enum WorkerCommand {
    /// Show active jobs with their lock owners
    Stats { queue: String },
}

/// Run the CLI.
pub async fn run() -> eyre::Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);
    core_config::tracing::install_color_eyre();

    let cli = Cli::parse();

    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;

    match cli.command {
        Command::Queue(cmd) => run_queue(open_redis(&redis_config).await?, &cli.prefix, cmd).await,
        Command::Scheduler(cmd) => {
            run_scheduler(open_redis(&redis_config).await?, &cli.prefix, cmd).await
        }
        Command::Job(cmd) => run_job(open_redis(&redis_config).await?, &cli.prefix, cmd).await,
        Command::Worker(cmd) => {
            run_worker(open_redis(&redis_config).await?, &cli.prefix, cmd).await
        }
        Command::Monitor {
            queue,
            port,
            interval_ms,
        } => run_monitor(&redis_config.url, &cli.prefix, &queue, port, interval_ms).await,
    }
}

async fn open_redis(config: &RedisConfig) -> eyre::Result<database::redis::ConnectionManager> {
    database::redis::connect_with_retry(&config.url, None)
        .await
        .wrap_err("Failed to connect to Redis")
}

fn queue_handle(redis: database::redis::ConnectionManager, prefix: &str, name: &str) -> Queue {
    Queue::new(redis, QueueOptions::new(name).with_prefix(prefix))
}

async fn run_queue(
    redis: database::redis::ConnectionManager,
    prefix: &str,
    cmd: QueueCommand,
) -> eyre::Result<()> {
    match cmd {
        QueueCommand::List => {
            let names = discover_queues(redis.clone(), prefix).await?;
            if names.is_empty() {
                println!("No queues under prefix '{}'", prefix);
                return Ok(());
            }
            for name in names {
                let queue = queue_handle(redis.clone(), prefix, &name);
                let counts = queue.job_counts().await?;
                println!(
                    "{}: waiting={} delayed={} active={} completed={} failed={}{}",
                    name,
                    counts.waiting,
                    counts.delayed,
                    counts.active,
                    counts.completed,
                    counts.failed,
                    if counts.paused { " [paused]" } else { "" }
                );
            }
        }
        QueueCommand::Pause { queue } => {
            queue_handle(redis, prefix, &queue).pause().await?;
            println!("Paused queue '{}'", queue);
        }
        QueueCommand::Resume { queue } => {
            queue_handle(redis, prefix, &queue).resume().await?;
            println!("Resumed queue '{}'", queue);
        }
        QueueCommand::Drain {
            queue,
            include_active,
        } => {
            let handle = queue_handle(redis, prefix, &queue);
            let removed = if include_active {
                handle.drain_including_active().await?
            } else {
                handle.drain().await?
            };
            println!("Drained {} jobs from '{}'", removed, queue);
        }
        QueueCommand::Clean {
            queue,
            status,
            grace_ms,
            limit,
        } => {
            let state: JobState = status
                .parse()
                .wrap_err_with(|| format!("Unknown status '{}'", status))?;
            let removed = queue_handle(redis, prefix, &queue)
                .clean(grace_ms, limit, state)
                .await?;
            println!("Removed {} jobs: {:?}", removed.len(), removed);
        }
        QueueCommand::Obliterate { queue, force } => {
            let deleted = queue_handle(redis, prefix, &queue).obliterate(force).await?;
            println!("Obliterated '{}' ({} keys)", queue, deleted);
        }
    }
    Ok(())
}

async fn run_scheduler(
    redis: database::redis::ConnectionManager,
    prefix: &str,
    cmd: SchedulerCommand,
) -> eyre::Result<()> {
    match cmd {
        SchedulerCommand::List {
            queue,
            start,
            end,
            desc,
        } => {
            let handle = queue_handle(redis, prefix, &queue);
            let scheduler = JobScheduler::new(handle, SchedulerOptions::default());
            let records = scheduler.list(start, end, !desc).await?;

            if records.is_empty() {
                println!("No schedulers on '{}'", queue);
                return Ok(());
            }
            for record in records {
                let when = record
                    .spec
                    .pattern
                    .clone()
                    .unwrap_or_else(|| format!("every {}ms", record.spec.every_ms.unwrap_or(0)));
                println!(
                    "{}: {} next_run={} fires={}{}",
                    record.id,
                    when,
                    format_ms(record.next_run),
                    record.fires_so_far,
                    record
                        .spec
                        .limit
                        .map(|l| format!("/{}", l))
                        .unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

async fn run_job(
    redis: database::redis::ConnectionManager,
    prefix: &str,
    cmd: JobCommand,
) -> eyre::Result<()> {
    match cmd {
        JobCommand::Peek { queue, id } => {
            let handle = queue_handle(redis, prefix, &queue);
            match handle.job(&id).await? {
                None => println!("Job '{}' not found on '{}'", id, queue),
                Some(job) => {
                    let state = handle.job_state(&id).await?;
                    let view = json!({
                        "id": job.id,
                        "queue": job.queue,
                        "name": job.name,
                        "state": state.map(|s| s.as_str()),
                        "priority": job.priority,
                        "attempts_made": job.attempts_made,
                        "max_attempts": job.max_attempts,
                        "stalled_count": job.stalled_count,
                        "timestamp": format_ms(job.timestamp),
                        "processed_on": job.processed_on.map(format_ms),
                        "finished_on": job.finished_on.map(format_ms),
                        "last_error": job.last_error,
                        "return_value": job.return_value()?,
                        "payload": serde_json::from_str::<serde_json::Value>(&job.payload)?,
                        "parent": job.parent.map(|p| format!("{}/{}", p.queue, p.id)),
                    });
                    println!("{}", serde_json::to_string_pretty(&view)?);
                }
            }
        }
    }
    Ok(())
}

async fn run_worker(
    redis: database::redis::ConnectionManager,
    prefix: &str,
    cmd: WorkerCommand,
) -> eyre::Result<()> {
    match cmd {
        WorkerCommand::Stats { queue } => {
            let handle = queue_handle(redis.clone(), prefix, &queue);
            let counts = handle.job_counts().await?;
            println!(
                "{}: waiting={} delayed={} active={} completed={} failed={}{}",
                queue,
                counts.waiting,
                counts.delayed,
                counts.active,
                counts.completed,
                counts.failed,
                if counts.paused { " [paused]" } else { "" }
            );

            let mut conn = redis.clone();
            let active: Vec<(String, i64)> = redis::cmd("ZRANGE")
                .arg(&handle.keys().active)
                .arg(0)
                .arg(-1)
                .arg("WITHSCORES")
                .query_async(&mut conn)
                .await?;

            for (job_id, lock_expires_at) in active {
                let owner: Option<String> = redis::cmd("HGET")
                    .arg(handle.keys().job(&job_id))
                    .arg("lock_owner")
                    .query_async(&mut conn)
                    .await?;
                println!(
                    "  {} held by {} (lock expires {})",
                    job_id,
                    owner.unwrap_or_else(|| "<unknown>".to_string()),
                    format_ms(lock_expires_at)
                );
            }
        }
    }
    Ok(())
}

async fn run_monitor(
    redis_url: &str,
    prefix: &str,
    queue: &str,
    port: u16,
    interval_ms: u64,
) -> eyre::Result<()> {
    metrics::init_metrics();

    // One connector: the manager serves command traffic, the client gives
    // the pub/sub subscriber its own dedicated connection.
    let connector = RedisConnector::new(redis_url)
        .await
        .wrap_err("Failed to connect to Redis")?;
    let handle = queue_handle(connector.manager(), prefix, queue);
    let monitor = QueueMonitor::new(
        handle.clone(),
        MonitorOptions::new().with_metrics_interval_ms(interval_ms),
    );

    let events = EventSubscriber::connect(&connector.client(), handle.keys())
        .await
        .wrap_err("Failed to subscribe to queue events")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    // Health + metrics endpoints next to the monitor.
    let health_state = HealthState::new(
        handle.clone(),
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
    );
    let app = health_router(health_state);
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;
    info!(port = %port, "Health and metrics server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Health server failed");
        }
    });

    let mut snapshots = monitor.subscribe();
    tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let m = *snapshots.borrow();
            info!(
                waiting = m.waiting,
                delayed = m.delayed,
                active = m.active,
                completed = m.completed,
                failed = m.failed,
                throughput_per_sec = m.throughput_per_sec,
                "Queue snapshot"
            );
        }
    });

    monitor
        .run(shutdown_rx, Some(events))
        .await
        .wrap_err("Monitor failed")?;
    Ok(())
}

/// Queues are discovered by their `meta` hashes under the prefix.
async fn discover_queues(
    redis: database::redis::ConnectionManager,
    prefix: &str,
) -> eyre::Result<Vec<String>> {
    let mut conn = redis;
    let pattern = format!("{}:*:meta", prefix);
    let mut names = Vec::new();
    let mut cursor: u64 = 0;

    loop {
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(&pattern)
            .arg("COUNT")
            .arg(100)
            .query_async(&mut conn)
            .await?;

        for key in keys {
            if let Some(name) = key
                .strip_prefix(&format!("{}:", prefix))
                .and_then(|rest| rest.strip_suffix(":meta"))
            {
                names.push(name.to_string());
            }
        }

        cursor = next;
        if cursor == 0 {
            break;
        }
    }

    names.sort_unstable();
    names.dedup();
    Ok(names)
}

fn format_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> eyre::Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_structure_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_queue_clean() {
        let cli = Cli::parse_from([
            "queue-admin",
            "queue",
            "clean",
            "tournament",
            "--status",
            "failed",
            "--grace-ms",
            "60000",
            "--limit",
            "50",
        ]);
        match cli.command {
            Command::Queue(QueueCommand::Clean {
                queue,
                status,
                grace_ms,
                limit,
            }) => {
                assert_eq!(queue, "tournament");
                assert_eq!(status, "failed");
                assert_eq!(grace_ms, 60_000);
                assert_eq!(limit, 50);
            }
            _ => panic!("parsed into the wrong command"),
        }
    }

    #[test]
    fn test_parse_monitor_defaults() {
        let cli = Cli::parse_from(["queue-admin", "monitor", "live"]);
        match cli.command {
            Command::Monitor {
                queue,
                port,
                interval_ms,
            } => {
                assert_eq!(queue, "live");
                assert_eq!(port, 8082);
                assert_eq!(interval_ms, 5000);
            }
            _ => panic!("parsed into the wrong command"),
        }
    }

    #[test]
    fn test_prefix_is_global() {
        let cli = Cli::parse_from([
            "queue-admin",
            "queue",
            "pause",
            "live",
            "--prefix",
            "staging",
        ]);
        assert_eq!(cli.prefix, "staging");
    }
}
