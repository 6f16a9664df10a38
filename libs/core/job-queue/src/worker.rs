//! The worker service: fetch → execute → complete/fail, with a heartbeat
//! per in-flight job, periodic stall recovery and graceful shutdown.
//!
//! One worker owns one queue and up to `concurrency` parallel processor
//! slots (a semaphore bounds them, a `JoinSet` tracks them). All state
//! transitions go through the store's atomic scripts; the only periodic
//! shared-state write during a job is the lock heartbeat.

use crate::config::WorkerOptions;
use crate::error::QueueError;
use crate::events::{EventKind, QueueEvent};
use crate::job::Job;
use crate::metrics::{self, AttemptOutcome};
use crate::queue::Queue;
use crate::registry::ProcessorRegistry;
use crate::store::{FailOutcome, JobStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, broadcast, watch};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Worker lifecycle: `Created → Running ⇄ Paused → Closing → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Running,
    Paused,
    Closing,
    Closed,
}

/// Long-running consumer for one queue.
pub struct Worker {
    store: Arc<JobStore>,
    registry: Arc<ProcessorRegistry>,
    opts: WorkerOptions,
    id: String,
    queue_name: String,
    state_tx: watch::Sender<WorkerState>,
    semaphore: Arc<Semaphore>,
    concurrency: AtomicUsize,
    in_flight: Arc<Mutex<HashMap<String, AbortHandle>>>,
    events_tx: broadcast::Sender<QueueEvent>,
}

impl Worker {
    pub fn new(queue: &Queue, registry: ProcessorRegistry, opts: WorkerOptions) -> Self {
        let (state_tx, _) = watch::channel(WorkerState::Created);
        let (events_tx, _) = broadcast::channel(256);
        let concurrency = opts.concurrency.max(1);

        Self {
            store: queue.store(),
            registry: Arc::new(registry),
            id: format!("worker-{}", Uuid::new_v4()),
            queue_name: queue.name().to_string(),
            state_tx,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency: AtomicUsize::new(concurrency),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            events_tx,
            opts,
        }
    }

    /// This worker's lock-owner identity.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> WorkerState {
        *self.state_tx.borrow()
    }

    /// Subscribe to this worker's local lifecycle events (`active`,
    /// `completed`, `failed`). One default consumer; fan-out is the
    /// caller's choice via further subscriptions.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events_tx.subscribe()
    }

    /// Same subscription as a `Stream`. Slow consumers skip the events
    /// they lagged behind on instead of blocking the worker.
    pub fn event_stream(&self) -> tokio_stream::wrappers::BroadcastStream<QueueEvent> {
        tokio_stream::wrappers::BroadcastStream::new(self.events_tx.subscribe())
    }

    /// Stop fetching. With `force`, in-flight processors are interrupted
    /// and their locks released so other workers pick the jobs up
    /// immediately; without it they run to completion.
    pub async fn pause(&self, force: bool) -> Result<(), QueueError> {
        self.state_tx.send_replace(WorkerState::Paused);
        if force {
            self.abort_in_flight();
            let released = self.store.release_locks(&self.id).await?;
            info!(worker = %self.id, released, "Force-paused worker, locks released");
        } else {
            info!(worker = %self.id, "Paused worker");
        }
        Ok(())
    }

    /// Resume fetching after a pause.
    pub fn resume(&self) {
        let state = *self.state_tx.borrow();
        if state == WorkerState::Paused {
            self.state_tx.send_replace(WorkerState::Running);
            info!(worker = %self.id, "Resumed worker");
        }
    }

    /// Adjust the number of parallel processor slots.
    pub fn set_concurrency(&self, concurrency: usize) {
        let target = concurrency.max(1);
        let current = self.concurrency.swap(target, Ordering::SeqCst);

        if target > current {
            self.semaphore.add_permits(target - current);
        } else if target < current {
            let semaphore = Arc::clone(&self.semaphore);
            let to_remove = current - target;
            tokio::spawn(async move {
                for _ in 0..to_remove {
                    match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit.forget(),
                        Err(_) => break,
                    }
                }
            });
        }
    }

    /// Ask the dispatch loop to shut down, wait until it has drained.
    ///
    /// In-flight jobs get `grace` to finish; whatever is still running
    /// afterwards is interrupted and returns to `waiting` via the released
    /// locks.
    pub async fn close(&self, grace: Duration) -> Result<(), QueueError> {
        self.state_tx.send_replace(WorkerState::Closing);

        let mut state_rx = self.state_tx.subscribe();
        let deadline = Instant::now() + grace + Duration::from_secs(5);
        loop {
            if *state_rx.borrow() == WorkerState::Closed {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(QueueError::Timeout(
                    "worker did not reach closed state in time".to_string(),
                ));
            }
            if state_rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    /// Spawn the dispatch loop onto the runtime. Deployment glue calls this
    /// at construction time when `opts.autorun` is set.
    pub fn spawn(
        self: Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<Result<(), QueueError>> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Run the dispatch loop until shutdown is signalled or `close` is
    /// called.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), QueueError> {
        info!(
            worker = %self.id,
            queue = %self.queue_name,
            concurrency = %self.concurrency.load(Ordering::SeqCst),
            lock_ttl_ms = %self.opts.lock_ttl_ms,
            stalled_interval_ms = %self.opts.stalled_interval_ms,
            processors = ?self.registry.job_names(),
            "Starting worker"
        );

        if self.state() == WorkerState::Created {
            self.state_tx.send_replace(WorkerState::Running);
        }

        let mut join_set: JoinSet<()> = JoinSet::new();
        let mut state_rx = self.state_tx.subscribe();
        let stalled_interval = Duration::from_millis(self.opts.stalled_interval_ms);
        // First stall pass runs immediately: this worker may be replacing
        // one that died with jobs locked.
        let mut last_stall_scan: Option<Instant> = None;
        let mut consecutive_errors: u32 = 0;
        const MAX_BACKOFF_SECS: u64 = 30;

        loop {
            // Reap finished slots.
            while join_set.try_join_next().is_some() {}

            if *shutdown.borrow() {
                info!(worker = %self.id, "Received shutdown signal, stopping worker");
                self.state_tx.send_replace(WorkerState::Closing);
            }

            let current_state = *state_rx.borrow_and_update();
            match current_state {
                WorkerState::Closing | WorkerState::Closed => break,
                WorkerState::Paused => {
                    tokio::select! {
                        _ = state_rx.changed() => {}
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(Duration::from_millis(self.opts.poll_interval_ms)) => {}
                    }
                    continue;
                }
                WorkerState::Created | WorkerState::Running => {}
            }

            // Maintenance: recover stalled jobs, promote due delayed jobs.
            let due_for_scan = last_stall_scan
                .map(|at| at.elapsed() >= stalled_interval)
                .unwrap_or(true);
            if due_for_scan {
                match self.store.check_stalled(self.opts.max_stalled_count).await {
                    Ok((requeued, failed)) => {
                        if requeued > 0 || failed > 0 {
                            warn!(worker = %self.id, requeued, failed, "Recovered stalled jobs");
                            metrics::observe_stalls(&self.queue_name, requeued, failed);
                        }
                    }
                    Err(e) => debug!(worker = %self.id, error = %e, "Stall scan failed"),
                }
                last_stall_scan = Some(Instant::now());
            }

            if let Err(e) = self.store.promote_delayed().await {
                debug!(worker = %self.id, error = %e, "Promoting delayed jobs failed");
            }

            // Fill free slots.
            let mut fetched = 0usize;
            let fetch_result: Result<(), QueueError> = loop {
                if self.semaphore.available_permits() == 0 {
                    break Ok(());
                }
                match self
                    .store
                    .fetch_next(&self.id, self.opts.lock_ttl_ms)
                    .await
                {
                    Ok(Some(job)) => {
                        fetched += 1;
                        self.spawn_job(&mut join_set, job);
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                }
            };

            match fetch_result {
                Ok(()) => {
                    if consecutive_errors > 0 {
                        info!(worker = %self.id, "Connection recovered after {} errors", consecutive_errors);
                        consecutive_errors = 0;
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if e.is_connection_error() {
                        let backoff_secs =
                            std::cmp::min(2u64.pow(consecutive_errors.min(5)), MAX_BACKOFF_SECS);
                        warn!(
                            worker = %self.id,
                            error = %e,
                            consecutive_errors = %consecutive_errors,
                            backoff_secs = %backoff_secs,
                            "Redis connection error, backing off"
                        );
                        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                    } else {
                        error!(worker = %self.id, error = %e, "Error fetching jobs");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    continue;
                }
            }

            if fetched == 0 {
                if join_set.is_empty() {
                    // Idle: poll again after a jittered sleep so idle workers
                    // across instances do not hammer Redis in lockstep.
                    let sleep_ms = jittered(self.opts.poll_interval_ms);
                    tokio::select! {
                        _ = state_rx.changed() => {}
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
                    }
                } else {
                    // Slots full or queue empty with work in flight: wake as
                    // soon as a slot frees so waiting jobs dispatch promptly.
                    tokio::select! {
                        _ = join_set.join_next() => {}
                        _ = state_rx.changed() => {}
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(Duration::from_millis(self.opts.poll_interval_ms)) => {}
                    }
                }
            }
        }

        self.drain(join_set).await;
        self.state_tx.send_replace(WorkerState::Closed);
        info!(worker = %self.id, "Worker stopped");
        Ok(())
    }

    /// Wait for in-flight jobs up to the shutdown grace, then interrupt the
    /// rest and hand their locks back.
    async fn drain(&self, mut join_set: JoinSet<()>) {
        let grace = Duration::from_millis(self.opts.shutdown_grace_ms);
        info!(
            worker = %self.id,
            in_flight = join_set.len(),
            grace_ms = %self.opts.shutdown_grace_ms,
            "Draining in-flight jobs"
        );

        let drained = tokio::time::timeout(grace, async {
            while join_set.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                worker = %self.id,
                remaining = join_set.len(),
                "Grace period elapsed, interrupting remaining jobs"
            );
            join_set.abort_all();
            while join_set.join_next().await.is_some() {}
        }

        match self.store.release_locks(&self.id).await {
            Ok(released) if released > 0 => {
                info!(worker = %self.id, released, "Released locks on shutdown");
            }
            Ok(_) => {}
            Err(e) => error!(worker = %self.id, error = %e, "Failed to release locks on shutdown"),
        }
    }

    fn abort_in_flight(&self) {
        let handles: Vec<(String, AbortHandle)> = {
            let mut in_flight = self.in_flight.lock().expect("in_flight lock poisoned");
            in_flight.drain().collect()
        };
        for (job_id, handle) in handles {
            debug!(worker = %self.id, job_id = %job_id, "Aborting in-flight job");
            handle.abort();
        }
    }

    fn spawn_job(&self, join_set: &mut JoinSet<()>, job: Job) {
        let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                // Slot raced away (set_concurrency shrink); the lock will
                // expire and the stall scanner returns the job to waiting.
                warn!(worker = %self.id, job_id = %job.id, "No free slot for fetched job");
                return;
            }
        };

        let store = Arc::clone(&self.store);
        let registry = Arc::clone(&self.registry);
        let events_tx = self.events_tx.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let worker_id = self.id.clone();
        let queue_name = self.queue_name.clone();
        let lock_ttl_ms = self.opts.lock_ttl_ms;
        let default_timeout_ms = self.opts.job_timeout_ms;
        let job_id = job.id.clone();

        let handle = join_set.spawn(async move {
            let _permit = permit;
            process_one(
                store,
                registry,
                events_tx,
                Arc::clone(&in_flight),
                worker_id,
                queue_name,
                lock_ttl_ms,
                default_timeout_ms,
                job,
            )
            .await;
        });

        let mut map = self.in_flight.lock().expect("in_flight lock poisoned");
        map.insert(job_id, handle);
        metrics::gauge_in_flight(&self.queue_name, map.len());
    }
}

/// Jitter a poll interval by up to ±25%.
fn jittered(interval_ms: u64) -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::BuildHasher;

    let spread = interval_ms / 4;
    if spread == 0 {
        return interval_ms.max(1);
    }
    let roll = RandomState::new().hash_one(std::time::SystemTime::now()) % (spread * 2 + 1);
    (interval_ms - spread + roll).max(1)
}

/// Execute one job: heartbeat, processor dispatch, ack or fail.
#[allow(clippy::too_many_arguments)]
async fn process_one(
    store: Arc<JobStore>,
    registry: Arc<ProcessorRegistry>,
    events_tx: broadcast::Sender<QueueEvent>,
    in_flight: Arc<Mutex<HashMap<String, AbortHandle>>>,
    worker_id: String,
    queue_name: String,
    lock_ttl_ms: u64,
    default_timeout_ms: Option<u64>,
    job: Job,
) {
    debug!(
        worker = %worker_id,
        job_id = %job.id,
        job_name = %job.name,
        attempt = %job.attempts_made,
        "Processing job"
    );

    let _ = events_tx.send(QueueEvent {
        event: EventKind::Active,
        job_id: job.id.clone(),
        name: job.name.clone(),
        timestamp: chrono::Utc::now().timestamp_millis(),
        data: None,
    });

    // Heartbeat: extend the lock every third of its TTL until the
    // processor returns. Losing the lock means the stall scanner already
    // took the job back; the heartbeat stops and the eventual ack fails
    // its owner check.
    let heartbeat = {
        let store = Arc::clone(&store);
        let worker_id = worker_id.clone();
        let job_id = job.id.clone();
        tokio::spawn(async move {
            let period = Duration::from_millis((lock_ttl_ms / 3).max(1));
            loop {
                tokio::time::sleep(period).await;
                match store.extend_lock(&job_id, &worker_id, lock_ttl_ms).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(job_id = %job_id, "Lock no longer held, stopping heartbeat");
                        break;
                    }
                    Err(e) => {
                        debug!(job_id = %job_id, error = %e, "Heartbeat extension failed");
                    }
                }
            }
        })
    };

    let started = Instant::now();
    let result = run_processor(&registry, &job, default_timeout_ms).await;
    heartbeat.abort();

    match result {
        Ok(value) => {
            match store.complete(&job.id, &worker_id, &value).await {
                Ok(()) => {
                    metrics::observe_attempt(
                        &queue_name,
                        AttemptOutcome::Completed,
                        started.elapsed(),
                    );
                    let _ = events_tx.send(QueueEvent {
                        event: EventKind::Completed,
                        job_id: job.id.clone(),
                        name: job.name.clone(),
                        timestamp: chrono::Utc::now().timestamp_millis(),
                        data: Some(value),
                    });
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "Failed to acknowledge job");
                }
            }
        }
        Err(e) => {
            let reason = e.to_string();
            warn!(
                job_id = %job.id,
                error = %reason,
                payload = ?e.payload(&queue_name, Some(&job.id)),
                "Job processing failed"
            );

            // The attempt number is this run's (incremented at fetch).
            let attempt = job.attempts_made.max(1);
            let delay_ms = job.backoff.delay_with_jitter(attempt);
            let retry_at = chrono::Utc::now().timestamp_millis() + delay_ms as i64;

            match store.fail(&job.id, &worker_id, &reason, retry_at).await {
                Ok(FailOutcome::RetryScheduled) => {
                    metrics::observe_attempt(
                        &queue_name,
                        AttemptOutcome::Retried,
                        started.elapsed(),
                    );
                    metrics::observe_retry(&queue_name);
                    info!(
                        job_id = %job.id,
                        next_attempt = attempt + 1,
                        delay_ms,
                        "Scheduled retry with backoff"
                    );
                }
                Ok(FailOutcome::Terminal) => {
                    metrics::observe_attempt(
                        &queue_name,
                        AttemptOutcome::Failed,
                        started.elapsed(),
                    );
                    warn!(job_id = %job.id, attempts = %job.attempts_made, "Job failed terminally");
                }
                Err(err) => {
                    error!(job_id = %job.id, error = %err, "Failed to record job failure");
                }
            }

            let _ = events_tx.send(QueueEvent {
                event: EventKind::Failed,
                job_id: job.id.clone(),
                name: job.name.clone(),
                timestamp: chrono::Utc::now().timestamp_millis(),
                data: Some(serde_json::Value::String(reason)),
            });
        }
    }

    let mut map = in_flight.lock().expect("in_flight lock poisoned");
    map.remove(&job.id);
    metrics::gauge_in_flight(&queue_name, map.len());
}

/// Dispatch to the registered processor, honoring the job deadline.
async fn run_processor(
    registry: &ProcessorRegistry,
    job: &Job,
    default_timeout_ms: Option<u64>,
) -> Result<serde_json::Value, QueueError> {
    let processor = registry.get(&job.name).ok_or_else(|| {
        QueueError::Processing(format!("unknown-job:{}", job.name))
    })?;

    let timeout_ms = job.timeout_ms.or(default_timeout_ms);
    match timeout_ms {
        Some(ms) => {
            match tokio::time::timeout(Duration::from_millis(ms), processor.process(job)).await {
                Ok(result) => result,
                Err(_) => Err(QueueError::Timeout(format!(
                    "timeout: job {} exceeded {}ms",
                    job.id, ms
                ))),
            }
        }
        None => processor.process(job).await,
    }
}
