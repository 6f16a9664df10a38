//! The queue service: the produce-side API handed to application code.
//!
//! Validates the payload envelope, merges default job options and routes
//! every mutation through the job store's atomic scripts.

use crate::config::QueueOptions;
use crate::error::QueueError;
use crate::job::{Job, JobOptions, JobPayload, JobState};
use crate::keys::QueueKeys;
use crate::store::{JobCounts, JobStore, NewJob};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// A handle to one named queue. Cheap to clone; clones share the store.
#[derive(Clone)]
pub struct Queue {
    store: Arc<JobStore>,
    opts: Arc<QueueOptions>,
}

impl Queue {
    pub fn new(redis: ConnectionManager, opts: QueueOptions) -> Self {
        let keys = QueueKeys::new(&opts.prefix, &opts.name);
        Self {
            store: Arc::new(JobStore::new(redis, keys)),
            opts: Arc::new(opts),
        }
    }

    pub fn name(&self) -> &str {
        &self.opts.name
    }

    pub fn keys(&self) -> &QueueKeys {
        self.store.keys()
    }

    pub fn store(&self) -> Arc<JobStore> {
        Arc::clone(&self.store)
    }

    pub(crate) fn options(&self) -> &QueueOptions {
        &self.opts
    }

    /// Validate and assemble one job for the store.
    fn prepare(
        &self,
        payload: &JobPayload,
        opts: Option<JobOptions>,
    ) -> Result<NewJob, QueueError> {
        payload.validate()?;
        let opts = effective_options(&self.opts.default_job_options, opts);
        let id = opts
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(NewJob {
            id,
            name: payload.name.clone(),
            payload_json: payload.to_json()?,
            opts,
        })
    }

    /// Add one job. Validates the envelope, then enqueues idempotently:
    /// a caller-supplied `job_id` that already exists leaves the stored
    /// record untouched and returns its id.
    pub async fn add(
        &self,
        payload: &JobPayload,
        opts: Option<JobOptions>,
    ) -> Result<String, QueueError> {
        let new_job = self.prepare(payload, opts)?;
        let (id, _created) = self.store.add_job(&new_job).await?;
        Ok(id)
    }

    /// Add a batch of jobs in one atomic script call. Every payload is
    /// validated before anything is written, and a bad parent reference
    /// aborts the whole batch. An empty batch is a no-op.
    pub async fn add_bulk(
        &self,
        jobs: Vec<(JobPayload, Option<JobOptions>)>,
    ) -> Result<Vec<String>, QueueError> {
        if jobs.is_empty() {
            return Ok(vec![]);
        }

        let new_jobs = jobs
            .iter()
            .map(|(payload, opts)| self.prepare(payload, opts.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        let results = self.store.add_jobs(&new_jobs).await?;
        let ids = results.into_iter().map(|(id, _created)| id).collect::<Vec<_>>();

        info!(queue = %self.opts.name, count = ids.len(), "Enqueued job batch");
        Ok(ids)
    }

    /// Remove one job. No-op (returns `false`) when the job is absent;
    /// refuses `active` jobs unless `force` is set.
    pub async fn remove_job(&self, job_id: &str, force: bool) -> Result<bool, QueueError> {
        self.store.remove_job(job_id, force).await
    }

    /// Remove every waiting and delayed job.
    pub async fn drain(&self) -> Result<u64, QueueError> {
        self.store.drain(false).await
    }

    /// Remove waiting, delayed and active jobs alike.
    pub async fn drain_including_active(&self) -> Result<u64, QueueError> {
        self.store.drain(true).await
    }

    /// Remove up to `limit` jobs in `status` that finished (or were
    /// enqueued) more than `grace_ms` ago. Returns the removed ids.
    pub async fn clean(
        &self,
        grace_ms: u64,
        limit: u64,
        status: JobState,
    ) -> Result<Vec<String>, QueueError> {
        self.store.clean(status, grace_ms, limit).await
    }

    /// Wipe the queue and every associated record. Refuses while jobs are
    /// active unless `force` is set.
    pub async fn obliterate(&self, force: bool) -> Result<u64, QueueError> {
        let deleted = self.store.obliterate(force).await?;
        info!(queue = %self.opts.name, deleted_keys = deleted, "Queue obliterated");
        Ok(deleted)
    }

    /// Stop dispatching. Jobs keep accumulating in `waiting`.
    pub async fn pause(&self) -> Result<(), QueueError> {
        self.store.pause().await?;
        info!(queue = %self.opts.name, "Queue paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), QueueError> {
        self.store.resume().await?;
        info!(queue = %self.opts.name, "Queue resumed");
        Ok(())
    }

    pub async fn is_paused(&self) -> Result<bool, QueueError> {
        self.store.is_paused().await
    }

    /// Snapshot of set sizes per state.
    pub async fn job_counts(&self) -> Result<JobCounts, QueueError> {
        self.store.counts().await
    }

    /// Read one job record.
    pub async fn job(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        self.store.job(job_id).await
    }

    /// Current state of one job (`paused` is derived from the queue flag).
    pub async fn job_state(&self, job_id: &str) -> Result<Option<JobState>, QueueError> {
        self.store.job_state(job_id).await
    }

    /// Publish a `progress` event for a job this queue owns.
    pub async fn progress(
        &self,
        job_id: &str,
        data: serde_json::Value,
    ) -> Result<(), QueueError> {
        self.store.publish_progress(job_id, data).await
    }
}

/// Merge caller options over the queue defaults. Callers that pass options
/// get exactly what they passed; omitting them inherits the queue defaults
/// (minus any default `job_id`, which would defeat idempotent ids).
fn effective_options(defaults: &JobOptions, opts: Option<JobOptions>) -> JobOptions {
    opts.unwrap_or_else(|| {
        let mut merged = defaults.clone();
        merged.job_id = None;
        merged
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::BackoffPolicy;

    fn queue_options() -> QueueOptions {
        QueueOptions::new("tournament").with_default_job_options(
            JobOptions::new()
                .with_attempts(3)
                .with_backoff(BackoffPolicy::Exponential { delay_ms: 500 }),
        )
    }

    #[test]
    fn test_effective_options_fall_back_to_defaults() {
        let defaults = JobOptions::new()
            .with_job_id("should-not-leak")
            .with_attempts(3)
            .with_backoff(BackoffPolicy::Exponential { delay_ms: 500 });

        let merged = effective_options(&defaults, None);
        assert_eq!(merged.attempts, 3);
        assert_eq!(merged.backoff, BackoffPolicy::Exponential { delay_ms: 500 });
        assert!(merged.job_id.is_none());

        let explicit = effective_options(&defaults, Some(JobOptions::new().with_job_id("x")));
        assert_eq!(explicit.job_id.as_deref(), Some("x"));
        assert_eq!(explicit.attempts, 1);
    }

    #[tokio::test]
    #[ignore] // Requires actual Redis
    async fn test_add_and_counts() {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let conn = database::redis::connect(&redis_url).await.unwrap();
        let queue = Queue::new(conn, queue_options());

        let payload = JobPayload::new("META", "bootstrap-sync", serde_json::json!({}));
        let id = queue.add(&payload, None).await.unwrap();
        assert!(!id.is_empty());

        let counts = queue.job_counts().await.unwrap();
        assert!(counts.waiting >= 1);

        queue.obliterate(true).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires actual Redis
    async fn test_add_bulk_empty_is_noop() {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let conn = database::redis::connect(&redis_url).await.unwrap();
        let queue = Queue::new(conn, queue_options());

        let ids = queue.add_bulk(vec![]).await.unwrap();
        assert!(ids.is_empty());
    }
}
