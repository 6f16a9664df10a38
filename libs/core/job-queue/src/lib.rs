//! Job Queue - Redis-backed distributed job runtime
//!
//! The queue/worker/scheduler/flow machinery behind the platform's data
//! sync pipelines:
//! - Atomic job state transitions via server-side scripts
//! - Stall detection and recovery with per-job lock heartbeats
//! - Exponential-backoff retry with jitter
//! - Bounded concurrent dispatch per worker instance
//! - Recurring job schedulers (interval or cron) with leader election
//! - Parent/child flows with completion and failure propagation
//! - Lifecycle events over pub/sub, counters and Prometheus metrics
//!
//! # Architecture
//!
//! ```text
//! Queue / FlowProducer / JobScheduler        (produce side)
//!   ↓ (atomic Lua transitions)
//! Redis sorted sets + job hashes
//!   ↓ (fetch-next, lock + heartbeat)
//! Worker → ProcessorRegistry → Processor     (consume side)
//!   ↓ (complete / fail / retry)
//! events channel → QueueMonitor / EventSubscriber
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use job_queue::{
//!     JobPayload, ProcessorRegistry, Queue, QueueOptions, Worker, WorkerOptions,
//! };
//!
//! let redis = database::redis::connect(&redis_url).await?;
//! let queue = Queue::new(redis.clone(), QueueOptions::new("tournament"));
//!
//! // Produce
//! let payload = JobPayload::new("META", "bootstrap-sync", serde_json::json!({}));
//! queue.add(&payload, None).await?;
//!
//! // Consume
//! let registry = ProcessorRegistry::new()
//!     .register("bootstrap-sync", Arc::new(BootstrapSync::new(api)));
//! let worker = Worker::new(&queue, registry, WorkerOptions::new().with_concurrency(4));
//! worker.run(shutdown_rx).await?;
//! ```

mod config;
mod error;
mod events;
mod flow;
pub mod health;
mod job;
pub mod keys;
pub mod metrics;
mod monitor;
mod queue;
mod registry;
mod scheduler;
mod scripts;
mod store;
mod worker;

// Re-export all public types
pub use config::{
    DEFAULT_PREFIX, MonitorOptions, QueueOptions, SchedulerOptions, WorkerOptions,
};
pub use error::{ErrorCategory, ErrorKind, ErrorPayload, QueueError};
pub use events::{EventKind, EventSubscriber, QueueEvent};
pub use flow::{FlowDependencies, FlowJobStatus, FlowNode, FlowProducer};
pub use health::{HealthState, health_router};
pub use job::{
    BackoffPolicy, Job, JobOptions, JobPayload, JobState, ParentRef, RemovePolicy,
};
pub use keys::QueueKeys;
pub use monitor::{QueueMetrics, QueueMonitor};
pub use queue::Queue;
pub use registry::{Processor, ProcessorRegistry};
pub use scheduler::{JobScheduler, JobTemplate, SchedulerRecord, SchedulerSpec};
pub use store::{FailOutcome, JobCounts, JobStore, NewJob};
pub use worker::{Worker, WorkerState};

/// Result type alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;
