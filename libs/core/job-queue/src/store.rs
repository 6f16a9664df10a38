//! The job store: typed wrappers over the atomic transition scripts.
//!
//! One `JobStore` is scoped to one queue. All mutations run server-side
//! (see `scripts`); this module converts between Rust types and script
//! arguments/returns, and owns the handful of plain-command reads
//! (counts, record lookup, pause flag).

use crate::error::QueueError;
use crate::events::{EventKind, QueueEvent};
use crate::job::{Job, JobOptions, JobState};
use crate::keys::QueueKeys;
use crate::scripts::ScriptSet;
use chrono::Utc;
use redis::aio::ConnectionManager;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// How many delayed/stalled entries a single maintenance pass may touch.
const MAINTENANCE_BATCH: usize = 1000;

/// A job ready to be written: id assigned, payload serialized, options
/// merged with the queue defaults.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub name: String,
    pub payload_json: String,
    pub opts: JobOptions,
}

impl NewJob {
    /// The JSON entry the enqueue script consumes.
    fn entry(&self) -> serde_json::Value {
        let mut entry = serde_json::json!({
            "id": self.id,
            "name": self.name,
            "payload": self.payload_json,
            "priority": self.opts.priority,
            "lifo": if self.opts.lifo { 1 } else { 0 },
            "delay_ms": self.opts.delay_ms,
            "max_attempts": self.opts.attempts.max(1),
            "backoff_kind": self.opts.backoff.kind_str(),
            "backoff_delay_ms": self.opts.backoff.base_delay_ms(),
            "remove_on_complete": self.opts.remove_on_complete.as_str(),
            "remove_on_fail": self.opts.remove_on_fail.as_str(),
        });
        if let Some(timeout_ms) = self.opts.timeout_ms {
            entry["timeout_ms"] = serde_json::json!(timeout_ms);
        }
        if let Some(parent) = &self.opts.parent {
            entry["parent_queue"] = serde_json::json!(parent.queue);
            entry["parent_id"] = serde_json::json!(parent.id);
        }
        entry
    }
}

/// Outcome of the fail transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The job still has attempts left; a retry is sitting in `delayed`.
    RetryScheduled,
    /// The attempt budget is spent; the job is terminally failed.
    Terminal,
}

/// Snapshot of per-state set sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub paused: bool,
}

pub struct JobStore {
    redis: ConnectionManager,
    keys: QueueKeys,
    scripts: Arc<ScriptSet>,
}

impl JobStore {
    pub fn new(redis: ConnectionManager, keys: QueueKeys) -> Self {
        Self {
            redis,
            keys,
            scripts: Arc::new(ScriptSet::new()),
        }
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    pub fn redis(&self) -> ConnectionManager {
        self.redis.clone()
    }

    pub(crate) fn scripts(&self) -> Arc<ScriptSet> {
        Arc::clone(&self.scripts)
    }

    fn conn(&self) -> ConnectionManager {
        self.redis.clone()
    }

    pub(crate) fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Idempotent enqueue. Returns the job id and whether a new record was
    /// created (`false` means the id already existed).
    pub async fn add_job(&self, new_job: &NewJob) -> Result<(String, bool), QueueError> {
        let mut results = self.add_jobs(std::slice::from_ref(new_job)).await?;
        results
            .pop()
            .ok_or_else(|| QueueError::Script("add_job returned no result".to_string()))
    }

    /// Enqueue a batch atomically: the whole array goes through one script
    /// call, so either every write lands or (on a bad parent reference)
    /// none do, and nothing interleaves between them.
    pub async fn add_jobs(&self, new_jobs: &[NewJob]) -> Result<Vec<(String, bool)>, QueueError> {
        if new_jobs.is_empty() {
            return Ok(vec![]);
        }

        let entries: Vec<serde_json::Value> = new_jobs.iter().map(NewJob::entry).collect();
        let jobs_json = serde_json::to_string(&entries)?;

        let mut conn = self.conn();
        let results: Vec<(i64, String)> = self
            .scripts
            .add_job
            .key(&self.keys.meta)
            .key(&self.keys.waiting)
            .key(&self.keys.delayed)
            .arg(self.keys.base())
            .arg(self.keys.root())
            .arg(self.keys.queue_name())
            .arg(Self::now_ms())
            .arg(jobs_json)
            .invoke_async(&mut conn)
            .await?;

        // The script aborts on the first bad parent reference and reports
        // just that entry.
        if let Some((code, id)) = results.iter().find(|(code, _)| *code < 0) {
            let parent = new_jobs
                .iter()
                .find(|new_job| new_job.id == *id)
                .and_then(|new_job| new_job.opts.parent.as_ref())
                .map(|p| format!("{}/{}", p.queue, p.id))
                .unwrap_or_default();
            return Err(match code {
                -2 => QueueError::Flow(format!("parent {} does not exist", parent)),
                -3 => QueueError::Flow(format!(
                    "parent {} is no longer waiting for children",
                    parent
                )),
                other => QueueError::Script(format!(
                    "add_job returned unexpected code {}",
                    other
                )),
            });
        }

        debug!(
            queue = %self.keys.queue_name(),
            count = results.len(),
            "Enqueued jobs"
        );
        Ok(results
            .into_iter()
            .map(|(code, id)| (id, code == 1))
            .collect())
    }

    /// Move every due delayed job into `waiting`. Returns how many moved.
    pub async fn promote_delayed(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn();
        let promoted: i64 = self
            .scripts
            .promote_delayed
            .key(&self.keys.delayed)
            .key(&self.keys.waiting)
            .arg(self.keys.base())
            .arg(Self::now_ms())
            .arg(MAINTENANCE_BATCH)
            .invoke_async(&mut conn)
            .await?;
        Ok(promoted.max(0) as u64)
    }

    /// Atomically pop the head of `waiting` into `active` under a lock owned
    /// by `worker_id`. Returns `None` when the queue is paused or empty.
    pub async fn fetch_next(
        &self,
        worker_id: &str,
        lock_ttl_ms: u64,
    ) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn();
        let reply: Option<Vec<String>> = self
            .scripts
            .fetch_next
            .key(&self.keys.meta)
            .key(&self.keys.waiting)
            .key(&self.keys.active)
            .key(&self.keys.events)
            .arg(self.keys.base())
            .arg(Self::now_ms())
            .arg(worker_id)
            .arg(lock_ttl_ms)
            .invoke_async(&mut conn)
            .await?;

        match reply {
            None => Ok(None),
            Some(flat) => {
                let map: HashMap<String, String> = flat
                    .chunks_exact(2)
                    .map(|pair| (pair[0].clone(), pair[1].clone()))
                    .collect();
                let job = Job::from_hash(self.keys.queue_name(), &map)?;
                Ok(Some(job))
            }
        }
    }

    /// Acknowledge a job with its return value.
    pub async fn complete(
        &self,
        job_id: &str,
        worker_id: &str,
        return_value: &serde_json::Value,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn();
        let value_json = serde_json::to_string(return_value)?;
        let code: i64 = self
            .scripts
            .complete_job
            .key(&self.keys.active)
            .key(&self.keys.completed)
            .key(&self.keys.events)
            .arg(self.keys.base())
            .arg(self.keys.root())
            .arg(job_id)
            .arg(worker_id)
            .arg(Self::now_ms())
            .arg(value_json)
            .invoke_async(&mut conn)
            .await?;

        match code {
            1 => Ok(()),
            0 => Err(QueueError::Processing(format!(
                "lock for job {} is no longer held",
                job_id
            ))),
            _ => Err(QueueError::Processing(format!(
                "job {} no longer exists",
                job_id
            ))),
        }
    }

    /// Record a failure. `retry_at_ms` is used when the job still has
    /// attempts left; the store decides retry vs terminal.
    pub async fn fail(
        &self,
        job_id: &str,
        worker_id: &str,
        error_message: &str,
        retry_at_ms: i64,
    ) -> Result<FailOutcome, QueueError> {
        let mut conn = self.conn();
        let code: i64 = self
            .scripts
            .fail_job
            .key(&self.keys.active)
            .key(&self.keys.delayed)
            .key(&self.keys.failed)
            .key(&self.keys.events)
            .arg(self.keys.base())
            .arg(self.keys.root())
            .arg(job_id)
            .arg(worker_id)
            .arg(Self::now_ms())
            .arg(error_message)
            .arg(retry_at_ms)
            .invoke_async(&mut conn)
            .await?;

        match code {
            1 => Ok(FailOutcome::RetryScheduled),
            2 => Ok(FailOutcome::Terminal),
            0 => Err(QueueError::Processing(format!(
                "lock for job {} is no longer held",
                job_id
            ))),
            _ => Err(QueueError::Processing(format!(
                "job {} no longer exists",
                job_id
            ))),
        }
    }

    /// Heartbeat: push the lock expiry forward. Returns `false` when the
    /// lock has been lost (the stall scanner took the job back).
    pub async fn extend_lock(
        &self,
        job_id: &str,
        worker_id: &str,
        lock_ttl_ms: u64,
    ) -> Result<bool, QueueError> {
        let mut conn = self.conn();
        let extended: i64 = self
            .scripts
            .extend_lock
            .key(&self.keys.active)
            .arg(self.keys.base())
            .arg(job_id)
            .arg(worker_id)
            .arg(Self::now_ms() + lock_ttl_ms as i64)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    /// Scan `active` for expired locks. Returns `(requeued, failed)`.
    pub async fn check_stalled(&self, max_stalled_count: u32) -> Result<(u64, u64), QueueError> {
        let mut conn = self.conn();
        let (requeued, failed): (i64, i64) = self
            .scripts
            .stall_check
            .key(&self.keys.active)
            .key(&self.keys.waiting)
            .key(&self.keys.failed)
            .key(&self.keys.events)
            .arg(self.keys.base())
            .arg(self.keys.root())
            .arg(Self::now_ms())
            .arg(max_stalled_count)
            .arg(MAINTENANCE_BATCH)
            .invoke_async(&mut conn)
            .await?;
        Ok((requeued.max(0) as u64, failed.max(0) as u64))
    }

    /// Force-release every active job held by `worker_id` (shutdown path).
    pub async fn release_locks(&self, worker_id: &str) -> Result<u64, QueueError> {
        let mut conn = self.conn();
        let released: i64 = self
            .scripts
            .release_locks
            .key(&self.keys.active)
            .key(&self.keys.waiting)
            .arg(self.keys.base())
            .arg(worker_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(released.max(0) as u64)
    }

    /// Remove one job. `Ok(false)` when the job does not exist (no-op).
    /// Refuses to remove an `active` job unless `force` is set.
    pub async fn remove_job(&self, job_id: &str, force: bool) -> Result<bool, QueueError> {
        let mut conn = self.conn();
        let code: i64 = self
            .scripts
            .remove_job
            .key(&self.keys.waiting)
            .key(&self.keys.delayed)
            .key(&self.keys.active)
            .key(&self.keys.completed)
            .key(&self.keys.failed)
            .arg(self.keys.base())
            .arg(job_id)
            .arg(if force { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;

        match code {
            1 => Ok(true),
            0 => Ok(false),
            _ => Err(QueueError::AddJob(format!(
                "job {} is active; pass force to remove it",
                job_id
            ))),
        }
    }

    /// Remove every waiting and delayed job; `include_active` extends the
    /// sweep to running jobs.
    pub async fn drain(&self, include_active: bool) -> Result<u64, QueueError> {
        let mut conn = self.conn();
        let removed: i64 = self
            .scripts
            .drain
            .key(&self.keys.waiting)
            .key(&self.keys.delayed)
            .key(&self.keys.active)
            .arg(self.keys.base())
            .arg(if include_active { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;
        Ok(removed.max(0) as u64)
    }

    /// Remove up to `limit` jobs in `status` older than `grace_ms`.
    /// Returns the removed ids.
    pub async fn clean(
        &self,
        status: JobState,
        grace_ms: u64,
        limit: u64,
    ) -> Result<Vec<String>, QueueError> {
        let set_key = match status {
            JobState::Completed => &self.keys.completed,
            JobState::Failed => &self.keys.failed,
            JobState::Delayed => &self.keys.delayed,
            JobState::Waiting => &self.keys.waiting,
            other => {
                return Err(QueueError::InvalidJobData(format!(
                    "cannot clean jobs in state '{}'",
                    other
                )));
            }
        };

        let mut conn = self.conn();
        let removed: Vec<String> = self
            .scripts
            .clean_jobs
            .key(set_key)
            .arg(self.keys.base())
            .arg(status.as_str())
            .arg(Self::now_ms() - grace_ms as i64)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed)
    }

    /// Delete every key of the queue. Refuses while jobs are active unless
    /// forced. Returns the number of deleted keys.
    pub async fn obliterate(&self, force: bool) -> Result<u64, QueueError> {
        let mut conn = self.conn();
        let deleted: i64 = self
            .scripts
            .obliterate
            .key(&self.keys.active)
            .arg(self.keys.base())
            .arg(if force { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;

        if deleted < 0 {
            return Err(QueueError::AddJob(
                "cannot obliterate a queue with active jobs; pass force".to_string(),
            ));
        }
        Ok(deleted as u64)
    }

    /// Set the queue-level paused flag. Fetch-next consults it; jobs keep
    /// landing in `waiting` while paused.
    pub async fn pause(&self) -> Result<(), QueueError> {
        let mut conn = self.conn();
        let _: () = redis::cmd("HSET")
            .arg(&self.keys.meta)
            .arg("paused")
            .arg("1")
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), QueueError> {
        let mut conn = self.conn();
        let _: () = redis::cmd("HDEL")
            .arg(&self.keys.meta)
            .arg("paused")
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn is_paused(&self) -> Result<bool, QueueError> {
        let mut conn = self.conn();
        let paused: Option<String> = redis::cmd("HGET")
            .arg(&self.keys.meta)
            .arg("paused")
            .query_async(&mut conn)
            .await?;
        Ok(paused.as_deref() == Some("1"))
    }

    /// Snapshot of set sizes per state plus the paused flag.
    pub async fn counts(&self) -> Result<JobCounts, QueueError> {
        let mut conn = self.conn();
        let (waiting, delayed, active, completed, failed, paused): (
            u64,
            u64,
            u64,
            u64,
            u64,
            Option<String>,
        ) = redis::pipe()
            .cmd("ZCARD")
            .arg(&self.keys.waiting)
            .cmd("ZCARD")
            .arg(&self.keys.delayed)
            .cmd("ZCARD")
            .arg(&self.keys.active)
            .cmd("ZCARD")
            .arg(&self.keys.completed)
            .cmd("ZCARD")
            .arg(&self.keys.failed)
            .cmd("HGET")
            .arg(&self.keys.meta)
            .arg("paused")
            .query_async(&mut conn)
            .await?;

        Ok(JobCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
            paused: paused.as_deref() == Some("1"),
        })
    }

    /// Read one full job record.
    pub async fn job(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn();
        let map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.job(job_id))
            .query_async(&mut conn)
            .await?;

        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(Job::from_hash(self.keys.queue_name(), &map)?))
    }

    /// Current state of one job. A `waiting` job on a paused queue reports
    /// as `paused`; the flag is queue-level, there is no paused set.
    pub async fn job_state(&self, job_id: &str) -> Result<Option<JobState>, QueueError> {
        let mut conn = self.conn();
        let (state, paused): (Option<String>, Option<String>) = redis::pipe()
            .cmd("HGET")
            .arg(self.keys.job(job_id))
            .arg("state")
            .cmd("HGET")
            .arg(&self.keys.meta)
            .arg("paused")
            .query_async(&mut conn)
            .await?;

        match state {
            None => Ok(None),
            Some(raw) => {
                let state: JobState = raw.parse()?;
                if state == JobState::Waiting && paused.as_deref() == Some("1") {
                    Ok(Some(JobState::Paused))
                } else {
                    Ok(Some(state))
                }
            }
        }
    }

    /// Publish a `progress` event for a job.
    pub async fn publish_progress(
        &self,
        job_id: &str,
        data: serde_json::Value,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn();
        let name: Option<String> = redis::cmd("HGET")
            .arg(self.keys.job(job_id))
            .arg("name")
            .query_async(&mut conn)
            .await?;
        let name = name.ok_or_else(|| {
            QueueError::InvalidJobData(format!("job {} does not exist", job_id))
        })?;

        let event = QueueEvent {
            event: EventKind::Progress,
            job_id: job_id.to_string(),
            name,
            timestamp: Self::now_ms(),
            data: Some(data),
        };
        let payload = serde_json::to_string(&event)?;
        let _: () = redis::cmd("PUBLISH")
            .arg(&self.keys.events)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::BackoffPolicy;

    #[test]
    fn test_new_job_entry_shape() {
        let new_job = NewJob {
            id: "j-1".to_string(),
            name: "event-live-sync".to_string(),
            payload_json: "{\"type\":\"LIVE\"}".to_string(),
            opts: JobOptions::new()
                .with_priority(2)
                .with_attempts(4)
                .with_backoff(BackoffPolicy::Fixed { delay_ms: 250 })
                .with_timeout_ms(9000)
                .with_parent("tournament", "p-1"),
        };

        let entry = new_job.entry();
        assert_eq!(entry["id"], "j-1");
        assert_eq!(entry["priority"], 2);
        assert_eq!(entry["lifo"], 0);
        assert_eq!(entry["max_attempts"], 4);
        assert_eq!(entry["backoff_kind"], "fixed");
        assert_eq!(entry["backoff_delay_ms"], 250);
        assert_eq!(entry["timeout_ms"], 9000);
        assert_eq!(entry["parent_queue"], "tournament");
        assert_eq!(entry["parent_id"], "p-1");
    }

    #[test]
    fn test_new_job_entry_omits_optional_fields() {
        let new_job = NewJob {
            id: "j-2".to_string(),
            name: "meta".to_string(),
            payload_json: "{}".to_string(),
            opts: JobOptions::default(),
        };

        let entry = new_job.entry();
        assert!(entry.get("timeout_ms").is_none());
        assert!(entry.get("parent_queue").is_none());
        assert!(entry.get("parent_id").is_none());
    }

    #[test]
    fn test_job_counts_serialize() {
        let counts = JobCounts {
            waiting: 3,
            delayed: 1,
            active: 2,
            completed: 10,
            failed: 0,
            paused: false,
        };
        let json = serde_json::to_value(counts).unwrap();
        assert_eq!(json["waiting"], 3);
        assert_eq!(json["completed"], 10);
        assert_eq!(json["paused"], false);
    }

    #[test]
    fn test_fail_outcome_eq() {
        assert_eq!(FailOutcome::RetryScheduled, FailOutcome::RetryScheduled);
        assert_ne!(FailOutcome::RetryScheduled, FailOutcome::Terminal);
    }
}
