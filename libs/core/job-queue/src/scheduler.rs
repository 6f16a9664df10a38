//! The scheduler service: recurring job templates, materialized into the
//! queue at their fire times by a single elected ticker.
//!
//! Records live in `sched:{id}` hashes, indexed by next run time in the
//! `schedulers` sorted set. A short-TTL leader lock keeps at most one
//! ticker per queue across replicas; emitted jobs carry the id
//! `{schedulerId}:{fires_so_far}` so re-fires are idempotent.

use crate::config::SchedulerOptions;
use crate::error::QueueError;
use crate::job::{JobOptions, JobPayload};
use crate::queue::Queue;
use crate::scripts::ScriptSet;
use chrono::{TimeZone, Utc};
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// When a scheduler fires: a fixed interval or a cron pattern (cron syntax
/// with seconds, e.g. `0 */5 * * * *`). Exactly one of the two is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSpec {
    pub pattern: Option<String>,
    pub every_ms: Option<u64>,
    /// Stop (and delete the record) after this many fires.
    pub limit: Option<u64>,
}

impl SchedulerSpec {
    pub fn every(every_ms: u64) -> Self {
        Self {
            pattern: None,
            every_ms: Some(every_ms),
            limit: None,
        }
    }

    pub fn cron(pattern: impl Into<String>) -> Self {
        Self {
            pattern: Some(pattern.into()),
            every_ms: None,
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        match (&self.pattern, self.every_ms) {
            (Some(_), Some(_)) => Err(QueueError::InvalidJobData(
                "scheduler spec sets both 'pattern' and 'every'".to_string(),
            )),
            (None, None) => Err(QueueError::InvalidJobData(
                "scheduler spec sets neither 'pattern' nor 'every'".to_string(),
            )),
            (None, Some(0)) => Err(QueueError::InvalidJobData(
                "scheduler 'every' must be positive".to_string(),
            )),
            (Some(pattern), None) => {
                Schedule::from_str(pattern).map_err(|e| {
                    QueueError::InvalidJobData(format!("bad cron pattern '{}': {}", pattern, e))
                })?;
                Ok(())
            }
            (None, Some(_)) => Ok(()),
        }
    }
}

/// The job template a scheduler materializes on each fire. The envelope
/// timestamp is stamped at fire time.
#[derive(Debug, Clone)]
pub struct JobTemplate {
    pub kind: String,
    pub name: String,
    pub data: serde_json::Value,
    pub opts: JobOptions,
}

impl JobTemplate {
    pub fn new(
        kind: impl Into<String>,
        name: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            data,
            opts: JobOptions::default(),
        }
    }

    pub fn with_opts(mut self, opts: JobOptions) -> Self {
        self.opts = opts;
        self
    }
}

/// One scheduler record as stored in Redis.
#[derive(Debug, Clone)]
pub struct SchedulerRecord {
    pub id: String,
    pub spec: SchedulerSpec,
    pub template: JobTemplate,
    /// Next fire, ms since epoch.
    pub next_run: i64,
    pub last_run: Option<i64>,
    pub fires_so_far: u64,
}

impl SchedulerRecord {
    fn hash_fields(&self) -> Result<Vec<(String, String)>, QueueError> {
        Ok(vec![
            ("id".to_string(), self.id.clone()),
            (
                "pattern".to_string(),
                self.spec.pattern.clone().unwrap_or_default(),
            ),
            (
                "every_ms".to_string(),
                self.spec.every_ms.map(|v| v.to_string()).unwrap_or_default(),
            ),
            (
                "limit".to_string(),
                self.spec.limit.map(|v| v.to_string()).unwrap_or_default(),
            ),
            ("template_kind".to_string(), self.template.kind.clone()),
            ("template_name".to_string(), self.template.name.clone()),
            (
                "template_data".to_string(),
                serde_json::to_string(&self.template.data)?,
            ),
            (
                "template_opts".to_string(),
                serde_json::to_string(&self.template.opts)?,
            ),
            ("next_run".to_string(), self.next_run.to_string()),
            (
                "last_run".to_string(),
                self.last_run.map(|v| v.to_string()).unwrap_or_default(),
            ),
            ("fires_so_far".to_string(), self.fires_so_far.to_string()),
        ])
    }

    fn from_hash(map: &HashMap<String, String>) -> Result<Self, QueueError> {
        let get = |field: &str| -> Option<&str> {
            map.get(field).map(|s| s.as_str()).filter(|s| !s.is_empty())
        };
        let id = get("id")
            .ok_or_else(|| {
                QueueError::InvalidJobData("scheduler hash missing 'id'".to_string())
            })?
            .to_string();

        let spec = SchedulerSpec {
            pattern: get("pattern").map(|s| s.to_string()),
            every_ms: get("every_ms").and_then(|s| s.parse().ok()),
            limit: get("limit").and_then(|s| s.parse().ok()),
        };

        let template = JobTemplate {
            kind: get("template_kind").unwrap_or_default().to_string(),
            name: get("template_name").unwrap_or_default().to_string(),
            data: get("template_data")
                .map(serde_json::from_str)
                .transpose()?
                .unwrap_or(serde_json::Value::Null),
            opts: get("template_opts")
                .map(serde_json::from_str)
                .transpose()?
                .unwrap_or_default(),
        };

        Ok(Self {
            id,
            spec,
            template,
            next_run: get("next_run").and_then(|s| s.parse().ok()).unwrap_or(0),
            last_run: get("last_run").and_then(|s| s.parse().ok()),
            fires_so_far: get("fires_so_far").and_then(|s| s.parse().ok()).unwrap_or(0),
        })
    }
}

/// First fire time for a fresh record.
pub(crate) fn initial_next_run(spec: &SchedulerSpec, now_ms: i64) -> Result<i64, QueueError> {
    match (spec.every_ms, &spec.pattern) {
        (Some(every), _) => {
            let every = every as i64;
            Ok((now_ms / every + 1) * every)
        }
        (None, Some(pattern)) => next_cron_after(pattern, now_ms),
        (None, None) => Err(QueueError::InvalidJobData(
            "scheduler spec sets neither 'pattern' nor 'every'".to_string(),
        )),
    }
}

/// Fire time strictly after `from_ms`.
pub(crate) fn next_run_after(spec: &SchedulerSpec, from_ms: i64) -> Result<i64, QueueError> {
    match (spec.every_ms, &spec.pattern) {
        (Some(every), _) => Ok(from_ms + every as i64),
        (None, Some(pattern)) => next_cron_after(pattern, from_ms),
        (None, None) => Err(QueueError::InvalidJobData(
            "scheduler spec sets neither 'pattern' nor 'every'".to_string(),
        )),
    }
}

fn next_cron_after(pattern: &str, after_ms: i64) -> Result<i64, QueueError> {
    let schedule = Schedule::from_str(pattern).map_err(|e| {
        QueueError::InvalidJobData(format!("bad cron pattern '{}': {}", pattern, e))
    })?;
    let after = Utc
        .timestamp_millis_opt(after_ms)
        .single()
        .ok_or_else(|| QueueError::InvalidJobData(format!("bad timestamp {}", after_ms)))?;
    schedule
        .after(&after)
        .next()
        .map(|dt| dt.timestamp_millis())
        .ok_or_else(|| {
            QueueError::InvalidJobData(format!("cron pattern '{}' has no future fire", pattern))
        })
}

/// The scheduler service for one queue.
pub struct JobScheduler {
    queue: Queue,
    opts: SchedulerOptions,
    scripts: Arc<ScriptSet>,
    leader_token: String,
}

impl JobScheduler {
    pub fn new(queue: Queue, opts: SchedulerOptions) -> Self {
        let scripts = queue.store().scripts();
        Self {
            queue,
            opts,
            scripts,
            leader_token: format!("ticker-{}", Uuid::new_v4()),
        }
    }

    fn conn(&self) -> redis::aio::ConnectionManager {
        self.queue.store().redis()
    }

    /// Create or replace a scheduler record.
    pub async fn upsert(
        &self,
        scheduler_id: &str,
        spec: SchedulerSpec,
        template: JobTemplate,
    ) -> Result<SchedulerRecord, QueueError> {
        spec.validate()?;
        if template.name.trim().is_empty() || template.kind.trim().is_empty() {
            return Err(QueueError::InvalidJobData(
                "scheduler template needs non-empty 'type' and 'name'".to_string(),
            ));
        }

        let now = Utc::now().timestamp_millis();
        let record = SchedulerRecord {
            id: scheduler_id.to_string(),
            next_run: initial_next_run(&spec, now)?,
            last_run: None,
            fires_so_far: 0,
            spec,
            template,
        };

        self.write_record(&record).await?;
        info!(
            queue = %self.queue.name(),
            scheduler = %record.id,
            next_run = record.next_run,
            "Upserted scheduler"
        );
        Ok(record)
    }

    async fn write_record(&self, record: &SchedulerRecord) -> Result<(), QueueError> {
        let keys = self.queue.keys();
        let sched_key = keys.scheduler(&record.id);
        let fields = record.hash_fields()?;

        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("DEL").arg(&sched_key).ignore();
        let mut hset = pipe.cmd("HSET");
        hset.arg(&sched_key);
        for (field, value) in &fields {
            hset.arg(field).arg(value);
        }
        hset.ignore();
        pipe.cmd("ZADD")
            .arg(&keys.schedulers)
            .arg(record.next_run)
            .arg(&record.id)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// Delete a scheduler. Returns whether it existed.
    pub async fn remove(&self, scheduler_id: &str) -> Result<bool, QueueError> {
        let keys = self.queue.keys();
        let mut conn = self.conn();
        let (deleted, _): (i64, i64) = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(keys.scheduler(scheduler_id))
            .cmd("ZREM")
            .arg(&keys.schedulers)
            .arg(scheduler_id)
            .query_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    /// Read one scheduler record.
    pub async fn get(&self, scheduler_id: &str) -> Result<Option<SchedulerRecord>, QueueError> {
        let mut conn = self.conn();
        let map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.queue.keys().scheduler(scheduler_id))
            .query_async(&mut conn)
            .await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(SchedulerRecord::from_hash(&map)?))
    }

    /// Page through schedulers ordered by next run time.
    pub async fn list(
        &self,
        start: isize,
        end: isize,
        asc: bool,
    ) -> Result<Vec<SchedulerRecord>, QueueError> {
        let keys = self.queue.keys();
        let mut conn = self.conn();

        let ids: Vec<String> = if asc {
            redis::cmd("ZRANGE")
                .arg(&keys.schedulers)
                .arg(start)
                .arg(end)
                .query_async(&mut conn)
                .await?
        } else {
            redis::cmd("ZRANGE")
                .arg(&keys.schedulers)
                .arg(start)
                .arg(end)
                .arg("REV")
                .query_async(&mut conn)
                .await?
        };

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get(&id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Run the tick loop until shutdown. Only the elected leader emits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), QueueError> {
        info!(
            queue = %self.queue.name(),
            tick_interval_ms = %self.opts.tick_interval_ms,
            leader_lock_ttl_ms = %self.opts.leader_lock_ttl_ms,
            "Starting scheduler ticker"
        );

        let tick = Duration::from_millis(self.opts.tick_interval_ms);
        let mut is_leader = false;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.ensure_leadership(is_leader).await {
                Ok(leader) => {
                    if leader && !is_leader {
                        info!(queue = %self.queue.name(), token = %self.leader_token, "Acquired scheduler leadership");
                    }
                    is_leader = leader;
                }
                Err(e) => {
                    warn!(queue = %self.queue.name(), error = %e, "Leadership check failed");
                    is_leader = false;
                }
            }

            if is_leader {
                if let Err(e) = self.tick().await {
                    error!(queue = %self.queue.name(), error = %e, "Scheduler tick failed");
                }
            }

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(tick) => {}
            }
        }

        if is_leader {
            let _ = self.release_leadership().await;
        }
        info!(queue = %self.queue.name(), "Scheduler ticker stopped");
        Ok(())
    }

    /// Refresh the lock when held; try to take it when not. A failed
    /// refresh means another instance won the lock: surface `LeaderLost`
    /// semantics by logging and falling back to follower mode.
    async fn ensure_leadership(&self, was_leader: bool) -> Result<bool, QueueError> {
        let keys = self.queue.keys();
        let mut conn = self.conn();

        if was_leader {
            let refreshed: i64 = self
                .scripts
                .refresh_leader
                .key(&keys.leader)
                .arg(&self.leader_token)
                .arg(self.opts.leader_lock_ttl_ms)
                .invoke_async(&mut conn)
                .await?;
            if refreshed == 1 {
                return Ok(true);
            }
            let lost = QueueError::LeaderLost(format!(
                "queue {} ticker lock taken by another instance",
                self.queue.name()
            ));
            warn!(queue = %self.queue.name(), error = %lost, "Stopped ticking");
            return Ok(false);
        }

        let acquired: Option<String> = redis::cmd("SET")
            .arg(&keys.leader)
            .arg(&self.leader_token)
            .arg("NX")
            .arg("PX")
            .arg(self.opts.leader_lock_ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(acquired.is_some())
    }

    async fn release_leadership(&self) -> Result<(), QueueError> {
        // Best-effort: only delete the lock if we still own it.
        let keys = self.queue.keys();
        let mut conn = self.conn();
        let current: Option<String> = redis::cmd("GET")
            .arg(&keys.leader)
            .query_async(&mut conn)
            .await?;
        if current.as_deref() == Some(self.leader_token.as_str()) {
            let _: () = redis::cmd("DEL")
                .arg(&keys.leader)
                .query_async(&mut conn)
                .await?;
        }
        Ok(())
    }

    /// One leader pass: emit every due scheduler.
    async fn tick(&self) -> Result<(), QueueError> {
        let now = Utc::now().timestamp_millis();
        let keys = self.queue.keys();
        let mut conn = self.conn();

        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&keys.schedulers)
            .arg("-inf")
            .arg(now)
            .query_async(&mut conn)
            .await?;

        for scheduler_id in due {
            match self.fire(&scheduler_id, now).await {
                Ok(()) => {}
                Err(e) => {
                    error!(
                        queue = %self.queue.name(),
                        scheduler = %scheduler_id,
                        error = %e,
                        "Failed to fire scheduler"
                    );
                }
            }
        }
        Ok(())
    }

    /// Emit one due scheduler: up to `catchup_max` instances, any further
    /// missed instants collapse into the emissions already made.
    async fn fire(&self, scheduler_id: &str, now: i64) -> Result<(), QueueError> {
        let Some(mut record) = self.get(scheduler_id).await? else {
            // Index entry without a record: drop it.
            let mut conn = self.conn();
            let _: () = redis::cmd("ZREM")
                .arg(&self.queue.keys().schedulers)
                .arg(scheduler_id)
                .query_async(&mut conn)
                .await?;
            return Ok(());
        };

        let mut fires = 0u32;
        while record.next_run <= now && fires < self.opts.catchup_max {
            let job_id = format!("{}:{}", record.id, record.fires_so_far);
            let payload = JobPayload {
                kind: record.template.kind.clone(),
                name: record.template.name.clone(),
                timestamp: Utc::now(),
                data: record.template.data.clone(),
            };
            let mut opts = record.template.opts.clone();
            opts.job_id = Some(job_id.clone());

            self.queue.add(&payload, Some(opts)).await?;
            debug!(
                queue = %self.queue.name(),
                scheduler = %record.id,
                job_id = %job_id,
                "Scheduler fired"
            );

            record.last_run = Some(record.next_run);
            record.fires_so_far += 1;
            fires += 1;

            if let Some(limit) = record.spec.limit {
                if record.fires_so_far >= limit {
                    info!(
                        queue = %self.queue.name(),
                        scheduler = %record.id,
                        fires = record.fires_so_far,
                        "Scheduler reached its limit, removing"
                    );
                    self.remove(&record.id).await?;
                    return Ok(());
                }
            }

            record.next_run = next_run_after(&record.spec, record.next_run)?;
        }

        // Collapse whatever backlog remains into the emissions above.
        while record.next_run <= now {
            record.next_run = next_run_after(&record.spec, record.next_run)?;
        }

        self.write_record(&record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_spec_validation() {
        assert!(SchedulerSpec::every(1000).validate().is_ok());
        assert!(SchedulerSpec::cron("0 */5 * * * *").validate().is_ok());

        let both = SchedulerSpec {
            pattern: Some("0 * * * * *".to_string()),
            every_ms: Some(1000),
            limit: None,
        };
        assert!(both.validate().is_err());

        let neither = SchedulerSpec {
            pattern: None,
            every_ms: None,
            limit: None,
        };
        assert!(neither.validate().is_err());

        assert!(SchedulerSpec::every(0).validate().is_err());
        assert!(SchedulerSpec::cron("not a pattern").validate().is_err());
    }

    #[test]
    fn test_initial_next_run_every_aligns_to_interval() {
        let spec = SchedulerSpec::every(1000);
        // 12.3s → next boundary is 13s.
        assert_eq!(initial_next_run(&spec, 12_300).unwrap(), 13_000);
        // Exactly on a boundary still schedules the next one.
        assert_eq!(initial_next_run(&spec, 13_000).unwrap(), 14_000);
    }

    #[test]
    fn test_next_run_after_every() {
        let spec = SchedulerSpec::every(2500);
        assert_eq!(next_run_after(&spec, 10_000).unwrap(), 12_500);
    }

    #[test]
    fn test_cron_next_run_is_strictly_after() {
        // Top of every hour.
        let spec = SchedulerSpec::cron("0 0 * * * *");
        // 2024-01-01T00:00:00Z in ms.
        let midnight = 1_704_067_200_000i64;
        let next = next_run_after(&spec, midnight).unwrap();
        assert_eq!(next, midnight + 3_600_000);

        let initial = initial_next_run(&spec, midnight + 1).unwrap();
        assert_eq!(initial, midnight + 3_600_000);
    }

    #[test]
    fn test_catchup_collapse_math() {
        // A ticker that slept 10 intervals: advancing past `now` lands on
        // the first future boundary without emitting each missed instant.
        let spec = SchedulerSpec::every(1000);
        let mut next = 5_000i64;
        let now = 15_300i64;
        while next <= now {
            next = next_run_after(&spec, next).unwrap();
        }
        assert_eq!(next, 16_000);
    }

    #[test]
    fn test_record_hash_round_trip() {
        let record = SchedulerRecord {
            id: "live-sync".to_string(),
            spec: SchedulerSpec::every(60_000).with_limit(10),
            template: JobTemplate::new("LIVE", "event-live-sync", json!({"event": 7}))
                .with_opts(JobOptions::new().with_attempts(3)),
            next_run: 1_700_000_060_000,
            last_run: Some(1_700_000_000_000),
            fires_so_far: 4,
        };

        let fields = record.hash_fields().unwrap();
        let map: HashMap<String, String> = fields.into_iter().collect();
        let back = SchedulerRecord::from_hash(&map).unwrap();

        assert_eq!(back.id, "live-sync");
        assert_eq!(back.spec, record.spec);
        assert_eq!(back.template.name, "event-live-sync");
        assert_eq!(back.template.data, json!({"event": 7}));
        assert_eq!(back.template.opts.attempts, 3);
        assert_eq!(back.next_run, record.next_run);
        assert_eq!(back.last_run, record.last_run);
        assert_eq!(back.fires_so_far, 4);
    }

    #[test]
    fn test_fire_ids_are_idempotent() {
        // The emitted job id is derived from the fire counter, so a re-run
        // of the same fire produces the same id.
        let id = format!("{}:{}", "live-sync", 4u64);
        assert_eq!(id, "live-sync:4");
    }
}
