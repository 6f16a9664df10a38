//! Option structs for queues, workers, the scheduler and the monitor.
//!
//! Everything has a builder-style `with_*` surface plus environment loading
//! through `core_config::FromEnv`, so deployments configure workers the same
//! way they configure the rest of the platform.

use crate::job::JobOptions;
use core_config::{ConfigError, FromEnv, env_parsed_or};

/// Default key prefix shared by every queue of the platform.
pub const DEFAULT_PREFIX: &str = "fpl";

/// Options for a queue handle.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Queue name (becomes part of every Redis key).
    pub name: String,

    /// Global key prefix.
    pub prefix: String,

    /// Defaults merged into every job added through this handle.
    pub default_job_options: JobOptions,
}

impl QueueOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: DEFAULT_PREFIX.to_string(),
            default_job_options: JobOptions::default(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_default_job_options(mut self, opts: JobOptions) -> Self {
        self.default_job_options = opts;
        self
    }
}

/// Options for a worker instance.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Maximum simultaneously executing jobs in this instance.
    pub concurrency: usize,

    /// Job lock TTL; the heartbeat extends the lock every third of this.
    pub lock_ttl_ms: u64,

    /// How often the stall scanner runs.
    pub stalled_interval_ms: u64,

    /// How many stalls a job survives before it fails with reason
    /// `stalled`. Default: 1, so the first recovery is free and the
    /// second is terminal.
    pub max_stalled_count: u32,

    /// Whether deployment glue should start the dispatch loop at
    /// construction time.
    pub autorun: bool,

    /// Default processing deadline; a per-job `timeout_ms` overrides it.
    pub job_timeout_ms: Option<u64>,

    /// Sleep between fetch attempts when the queue is empty (jittered).
    pub poll_interval_ms: u64,

    /// How long `close` waits for in-flight jobs before force-releasing
    /// their locks.
    pub shutdown_grace_ms: u64,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            lock_ttl_ms: 30_000,
            stalled_interval_ms: 30_000,
            max_stalled_count: 1,
            autorun: true,
            job_timeout_ms: None,
            poll_interval_ms: 500,
            shutdown_grace_ms: 30_000,
        }
    }
}

impl WorkerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_lock_ttl_ms(mut self, lock_ttl_ms: u64) -> Self {
        self.lock_ttl_ms = lock_ttl_ms;
        self
    }

    pub fn with_stalled_interval_ms(mut self, interval_ms: u64) -> Self {
        self.stalled_interval_ms = interval_ms;
        self
    }

    pub fn with_max_stalled_count(mut self, count: u32) -> Self {
        self.max_stalled_count = count;
        self
    }

    pub fn with_autorun(mut self, autorun: bool) -> Self {
        self.autorun = autorun;
        self
    }

    pub fn with_job_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.job_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.poll_interval_ms = interval_ms;
        self
    }

    pub fn with_shutdown_grace_ms(mut self, grace_ms: u64) -> Self {
        self.shutdown_grace_ms = grace_ms;
        self
    }
}

impl FromEnv for WorkerOptions {
    /// `WORKER_CONCURRENCY`, `WORKER_LOCK_TTL_MS`, `WORKER_STALLED_INTERVAL_MS`,
    /// `WORKER_MAX_STALLED_COUNT`, `WORKER_POLL_INTERVAL_MS`,
    /// `WORKER_SHUTDOWN_GRACE_MS`, `WORKER_JOB_TIMEOUT_MS` (optional).
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let job_timeout_ms = match std::env::var("WORKER_JOB_TIMEOUT_MS") {
            Ok(raw) => Some(raw.parse().map_err(|e| ConfigError::ParseError {
                key: "WORKER_JOB_TIMEOUT_MS".to_string(),
                details: format!("{}", e),
            })?),
            Err(_) => None,
        };

        Ok(Self {
            concurrency: env_parsed_or("WORKER_CONCURRENCY", defaults.concurrency)?.max(1),
            lock_ttl_ms: env_parsed_or("WORKER_LOCK_TTL_MS", defaults.lock_ttl_ms)?,
            stalled_interval_ms: env_parsed_or(
                "WORKER_STALLED_INTERVAL_MS",
                defaults.stalled_interval_ms,
            )?,
            max_stalled_count: env_parsed_or(
                "WORKER_MAX_STALLED_COUNT",
                defaults.max_stalled_count,
            )?,
            autorun: defaults.autorun,
            job_timeout_ms,
            poll_interval_ms: env_parsed_or("WORKER_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            shutdown_grace_ms: env_parsed_or(
                "WORKER_SHUTDOWN_GRACE_MS",
                defaults.shutdown_grace_ms,
            )?,
        })
    }
}

/// Options for the scheduler tick loop.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Tick period of the elected leader.
    pub tick_interval_ms: u64,

    /// Leader lock TTL; refreshed on every tick.
    pub leader_lock_ttl_ms: u64,

    /// Maximum instances emitted per scheduler per tick when fires were
    /// missed. 1 collapses a late backlog into a single emission.
    pub catchup_max: u32,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            leader_lock_ttl_ms: 30_000,
            catchup_max: 1,
        }
    }
}

impl SchedulerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tick_interval_ms(mut self, interval_ms: u64) -> Self {
        self.tick_interval_ms = interval_ms;
        self
    }

    pub fn with_leader_lock_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.leader_lock_ttl_ms = ttl_ms;
        self
    }

    pub fn with_catchup_max(mut self, catchup_max: u32) -> Self {
        self.catchup_max = catchup_max.max(1);
        self
    }
}

impl FromEnv for SchedulerOptions {
    /// `SCHEDULER_TICK_INTERVAL_MS`, `SCHEDULER_LEADER_LOCK_TTL_MS`,
    /// `SCHEDULER_CATCHUP_MAX`.
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            tick_interval_ms: env_parsed_or(
                "SCHEDULER_TICK_INTERVAL_MS",
                defaults.tick_interval_ms,
            )?,
            leader_lock_ttl_ms: env_parsed_or(
                "SCHEDULER_LEADER_LOCK_TTL_MS",
                defaults.leader_lock_ttl_ms,
            )?,
            catchup_max: env_parsed_or("SCHEDULER_CATCHUP_MAX", defaults.catchup_max)?.max(1),
        })
    }
}

/// Options for the queue monitor.
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// Counter polling period.
    pub metrics_interval_ms: u64,

    /// Rolling window length for throughput (samples).
    pub history_size: usize,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            metrics_interval_ms: 5000,
            history_size: 60,
        }
    }
}

impl MonitorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics_interval_ms(mut self, interval_ms: u64) -> Self {
        self.metrics_interval_ms = interval_ms;
        self
    }

    pub fn with_history_size(mut self, history_size: usize) -> Self {
        self.history_size = history_size.max(2);
        self
    }
}

impl FromEnv for MonitorOptions {
    /// `MONITOR_METRICS_INTERVAL_MS`, `MONITOR_HISTORY_SIZE`.
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            metrics_interval_ms: env_parsed_or(
                "MONITOR_METRICS_INTERVAL_MS",
                defaults.metrics_interval_ms,
            )?,
            history_size: env_parsed_or("MONITOR_HISTORY_SIZE", defaults.history_size)?.max(2),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{BackoffPolicy, RemovePolicy};

    #[test]
    fn test_queue_options_defaults() {
        let opts = QueueOptions::new("tournament");
        assert_eq!(opts.name, "tournament");
        assert_eq!(opts.prefix, DEFAULT_PREFIX);
        assert_eq!(opts.default_job_options.attempts, 1);
    }

    #[test]
    fn test_queue_options_builder() {
        let opts = QueueOptions::new("live")
            .with_prefix("staging")
            .with_default_job_options(
                JobOptions::new()
                    .with_attempts(3)
                    .with_backoff(BackoffPolicy::Fixed { delay_ms: 200 })
                    .with_remove_on_complete(RemovePolicy::Count(100)),
            );

        assert_eq!(opts.prefix, "staging");
        assert_eq!(opts.default_job_options.attempts, 3);
        assert_eq!(
            opts.default_job_options.remove_on_complete,
            RemovePolicy::Count(100)
        );
    }

    #[test]
    fn test_worker_options_defaults() {
        let opts = WorkerOptions::default();
        assert_eq!(opts.concurrency, 1);
        assert_eq!(opts.lock_ttl_ms, 30_000);
        assert_eq!(opts.max_stalled_count, 1);
        assert!(opts.autorun);
        assert!(opts.job_timeout_ms.is_none());
    }

    #[test]
    fn test_worker_options_builder() {
        let opts = WorkerOptions::new()
            .with_concurrency(0) // clamped to 1
            .with_lock_ttl_ms(5000)
            .with_stalled_interval_ms(2000)
            .with_max_stalled_count(3)
            .with_job_timeout_ms(60_000)
            .with_autorun(false);

        assert_eq!(opts.concurrency, 1);
        assert_eq!(opts.lock_ttl_ms, 5000);
        assert_eq!(opts.stalled_interval_ms, 2000);
        assert_eq!(opts.max_stalled_count, 3);
        assert_eq!(opts.job_timeout_ms, Some(60_000));
        assert!(!opts.autorun);
    }

    #[test]
    fn test_worker_options_from_env() {
        temp_env::with_vars(
            [
                ("WORKER_CONCURRENCY", Some("8")),
                ("WORKER_LOCK_TTL_MS", Some("10000")),
                ("WORKER_JOB_TIMEOUT_MS", Some("120000")),
            ],
            || {
                let opts = WorkerOptions::from_env().unwrap();
                assert_eq!(opts.concurrency, 8);
                assert_eq!(opts.lock_ttl_ms, 10_000);
                assert_eq!(opts.job_timeout_ms, Some(120_000));
                // Unset vars keep their defaults.
                assert_eq!(opts.max_stalled_count, 1);
            },
        );
    }

    #[test]
    fn test_worker_options_from_env_invalid() {
        temp_env::with_var("WORKER_CONCURRENCY", Some("many"), || {
            assert!(WorkerOptions::from_env().is_err());
        });
    }

    #[test]
    fn test_scheduler_options_defaults() {
        let opts = SchedulerOptions::default();
        assert_eq!(opts.tick_interval_ms, 1000);
        assert_eq!(opts.leader_lock_ttl_ms, 30_000);
        assert_eq!(opts.catchup_max, 1);
    }

    #[test]
    fn test_scheduler_options_catchup_clamped() {
        let opts = SchedulerOptions::new().with_catchup_max(0);
        assert_eq!(opts.catchup_max, 1);
    }

    #[test]
    fn test_monitor_options_defaults() {
        let opts = MonitorOptions::default();
        assert_eq!(opts.metrics_interval_ms, 5000);
        assert_eq!(opts.history_size, 60);
    }

    #[test]
    fn test_monitor_options_history_clamped() {
        let opts = MonitorOptions::new().with_history_size(1);
        assert_eq!(opts.history_size, 2);
    }
}
