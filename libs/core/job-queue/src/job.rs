//! Job records, options and the payload envelope.
//!
//! A job is a hash in Redis; this module owns the field layout and the
//! struct ⇄ hash codecs, plus the backoff math the worker uses to schedule
//! retries.

use crate::error::QueueError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Hash field names for `job:{id}` records. The Lua scripts read and write
/// the same names; keep the two sides in sync.
pub(crate) mod fields {
    pub const ID: &str = "id";
    pub const NAME: &str = "name";
    pub const PAYLOAD: &str = "payload";
    pub const PRIORITY: &str = "priority";
    pub const LIFO: &str = "lifo";
    pub const DELAY_MS: &str = "delay_ms";
    pub const MAX_ATTEMPTS: &str = "max_attempts";
    pub const BACKOFF_KIND: &str = "backoff_kind";
    pub const BACKOFF_DELAY_MS: &str = "backoff_delay_ms";
    pub const REMOVE_ON_COMPLETE: &str = "remove_on_complete";
    pub const REMOVE_ON_FAIL: &str = "remove_on_fail";
    pub const TIMEOUT_MS: &str = "timeout_ms";
    pub const TIMESTAMP: &str = "timestamp";
    pub const STATE: &str = "state";
    pub const ATTEMPTS_MADE: &str = "attempts_made";
    pub const STALLED_COUNT: &str = "stalled_count";
    pub const LAST_ERROR: &str = "last_error";
    pub const RETURN_VALUE: &str = "return_value";
    pub const PROCESSED_ON: &str = "processed_on";
    pub const FINISHED_ON: &str = "finished_on";
    pub const LOCK_OWNER: &str = "lock_owner";
    pub const LOCK_EXPIRES_AT: &str = "lock_expires_at";
    pub const PARENT_QUEUE: &str = "parent_queue";
    pub const PARENT_ID: &str = "parent_id";
}

/// The job state machine. A job is in exactly one state at any instant;
/// all transitions happen server-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
    Paused,
    WaitingChildren,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::WaitingChildren => "waiting-children",
        }
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "delayed" => Ok(Self::Delayed),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            "waiting-children" => Ok(Self::WaitingChildren),
            other => Err(QueueError::InvalidJobData(format!(
                "unknown job state '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackoffPolicy {
    /// Constant delay between attempts.
    Fixed { delay_ms: u64 },
    /// `delay * 2^(attempt-1)` between attempts.
    Exponential { delay_ms: u64 },
}

impl BackoffPolicy {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Fixed { .. } => "fixed",
            Self::Exponential { .. } => "exponential",
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        match self {
            Self::Fixed { delay_ms } | Self::Exponential { delay_ms } => *delay_ms,
        }
    }

    pub(crate) fn from_parts(kind: &str, delay_ms: u64) -> Result<Self, QueueError> {
        match kind {
            "fixed" => Ok(Self::Fixed { delay_ms }),
            "exponential" => Ok(Self::Exponential { delay_ms }),
            other => Err(QueueError::InvalidJobData(format!(
                "unknown backoff type '{}'",
                other
            ))),
        }
    }

    /// Raw delay for a 1-based attempt number, before jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        match self {
            Self::Fixed { delay_ms } => *delay_ms,
            Self::Exponential { delay_ms } => {
                let shift = attempt.saturating_sub(1).min(32);
                delay_ms.saturating_mul(1u64 << shift)
            }
        }
    }

    /// Delay for an attempt with ±20% jitter applied, to spread retries of
    /// jobs that failed together.
    pub fn delay_with_jitter(&self, attempt: u32) -> u64 {
        apply_jitter(self.delay_for_attempt(attempt))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Exponential { delay_ms: 1000 }
    }
}

/// Apply ±20% jitter to a delay.
fn apply_jitter(delay_ms: u64) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::time::SystemTime;

    // Simple pseudo-random based on current time
    let mut hasher = DefaultHasher::new();
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    let hash = hasher.finish();

    let jitter_range = delay_ms / 5;
    if jitter_range == 0 {
        return delay_ms;
    }

    // Map hash to [-jitter_range, +jitter_range]
    let random_offset = (hash % (jitter_range * 2 + 1)) as i64 - jitter_range as i64;

    if random_offset < 0 {
        delay_ms.saturating_sub((-random_offset) as u64)
    } else {
        delay_ms.saturating_add(random_offset as u64)
    }
}

/// What to do with a finished job record.
///
/// Serializes as its wire string (`keep`, `remove`, `count:N`) so scheduler
/// templates can carry it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovePolicy {
    /// Keep the record (default).
    Keep,
    /// Delete the record as soon as the job finishes.
    Remove,
    /// Keep only the newest N finished records.
    Count(u64),
}

impl RemovePolicy {
    pub fn as_str(&self) -> String {
        match self {
            Self::Keep => "keep".to_string(),
            Self::Remove => "remove".to_string(),
            Self::Count(n) => format!("count:{}", n),
        }
    }
}

impl Default for RemovePolicy {
    fn default() -> Self {
        Self::Keep
    }
}

impl FromStr for RemovePolicy {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep" => Ok(Self::Keep),
            "remove" => Ok(Self::Remove),
            other => {
                if let Some(n) = other.strip_prefix("count:") {
                    let n = n.parse().map_err(|_| {
                        QueueError::InvalidJobData(format!("bad remove policy '{}'", other))
                    })?;
                    Ok(Self::Count(n))
                } else {
                    Err(QueueError::InvalidJobData(format!(
                        "bad remove policy '{}'",
                        other
                    )))
                }
            }
        }
    }
}

impl Serialize for RemovePolicy {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_str())
    }
}

impl<'de> Deserialize<'de> for RemovePolicy {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Reference to a parent job, possibly in another queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    pub queue: String,
    pub id: String,
}

/// Per-job options. Defaults come from the queue's `default_job_options`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// Stable id; repeated adds with the same id are idempotent.
    pub job_id: Option<String>,
    /// Lower dequeues first.
    pub priority: i64,
    /// Reverse FIFO order within the priority band.
    pub lifo: bool,
    /// Milliseconds to hold the job in `delayed` before it may run.
    pub delay_ms: u64,
    /// Maximum attempts (≥ 1).
    pub attempts: u32,
    pub backoff: BackoffPolicy,
    pub remove_on_complete: RemovePolicy,
    pub remove_on_fail: RemovePolicy,
    /// Per-job processing deadline; overrides the worker default.
    pub timeout_ms: Option<u64>,
    /// Gate this job behind an existing parent.
    pub parent: Option<ParentRef>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            job_id: None,
            priority: 0,
            lifo: false,
            delay_ms: 0,
            attempts: 1,
            backoff: BackoffPolicy::default(),
            remove_on_complete: RemovePolicy::Keep,
            remove_on_fail: RemovePolicy::Keep,
            timeout_ms: None,
            parent: None,
        }
    }
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_lifo(mut self, lifo: bool) -> Self {
        self.lifo = lifo;
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_remove_on_complete(mut self, policy: RemovePolicy) -> Self {
        self.remove_on_complete = policy;
        self
    }

    pub fn with_remove_on_fail(mut self, policy: RemovePolicy) -> Self {
        self.remove_on_fail = policy;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_parent(mut self, queue: impl Into<String>, id: impl Into<String>) -> Self {
        self.parent = Some(ParentRef {
            queue: queue.into(),
            id: id.into(),
        });
        self
    }
}

/// The payload envelope every producer must supply. The runtime treats
/// `data` as opaque; `name` is the job class the worker dispatches on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl JobPayload {
    pub fn new(
        kind: impl Into<String>,
        name: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            timestamp: Utc::now(),
            data,
        }
    }

    /// Enforce the minimal envelope: non-empty `type` and `name`.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.kind.trim().is_empty() {
            return Err(QueueError::InvalidJobData(
                "payload 'type' must be a non-empty string".to_string(),
            ));
        }
        if self.name.trim().is_empty() {
            return Err(QueueError::InvalidJobData(
                "payload 'name' must be a non-empty string".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, QueueError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A full job record as read back from Redis.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub name: String,
    /// Raw payload JSON, byte-identical to what the producer enqueued.
    pub payload: String,
    pub priority: i64,
    pub lifo: bool,
    pub delay_ms: u64,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub remove_on_complete: RemovePolicy,
    pub remove_on_fail: RemovePolicy,
    pub timeout_ms: Option<u64>,
    pub parent: Option<ParentRef>,
    pub state: JobState,
    pub attempts_made: u32,
    pub stalled_count: u32,
    pub last_error: Option<String>,
    pub return_value: Option<String>,
    /// Enqueue time, ms since epoch.
    pub timestamp: i64,
    pub processed_on: Option<i64>,
    pub finished_on: Option<i64>,
    pub lock_owner: Option<String>,
    pub lock_expires_at: Option<i64>,
}

impl Job {
    /// Parse the payload envelope.
    pub fn payload(&self) -> Result<JobPayload, QueueError> {
        let payload: JobPayload = serde_json::from_str(&self.payload)?;
        Ok(payload)
    }

    /// Parse the stored return value, if any.
    pub fn return_value(&self) -> Result<Option<serde_json::Value>, QueueError> {
        match self.return_value.as_deref() {
            None | Some("") => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
        }
    }

    /// Decode a job from its Redis hash.
    pub(crate) fn from_hash(
        queue: &str,
        map: &HashMap<String, String>,
    ) -> Result<Self, QueueError> {
        let get = |field: &str| -> Option<&str> { map.get(field).map(|s| s.as_str()) };
        let require = |field: &str| -> Result<&str, QueueError> {
            get(field).ok_or_else(|| {
                QueueError::InvalidJobData(format!("job hash missing field '{}'", field))
            })
        };
        let parse_i64 = |field: &str| -> i64 {
            get(field).and_then(|v| v.parse().ok()).unwrap_or_default()
        };
        let parse_opt_i64 = |field: &str| -> Option<i64> {
            get(field).filter(|v| !v.is_empty()).and_then(|v| v.parse().ok())
        };

        let backoff = BackoffPolicy::from_parts(
            get(fields::BACKOFF_KIND).unwrap_or("exponential"),
            parse_i64(fields::BACKOFF_DELAY_MS).max(0) as u64,
        )?;

        Ok(Self {
            id: require(fields::ID)?.to_string(),
            queue: queue.to_string(),
            name: require(fields::NAME)?.to_string(),
            payload: require(fields::PAYLOAD)?.to_string(),
            priority: parse_i64(fields::PRIORITY),
            lifo: get(fields::LIFO) == Some("1"),
            delay_ms: parse_i64(fields::DELAY_MS).max(0) as u64,
            max_attempts: parse_i64(fields::MAX_ATTEMPTS).max(1) as u32,
            backoff,
            remove_on_complete: get(fields::REMOVE_ON_COMPLETE)
                .unwrap_or("keep")
                .parse()?,
            remove_on_fail: get(fields::REMOVE_ON_FAIL).unwrap_or("keep").parse()?,
            timeout_ms: parse_opt_i64(fields::TIMEOUT_MS).map(|v| v.max(0) as u64),
            parent: match (get(fields::PARENT_QUEUE), get(fields::PARENT_ID)) {
                (Some(q), Some(id)) if !q.is_empty() && !id.is_empty() => Some(ParentRef {
                    queue: q.to_string(),
                    id: id.to_string(),
                }),
                _ => None,
            },
            state: require(fields::STATE)?.parse()?,
            attempts_made: parse_i64(fields::ATTEMPTS_MADE).max(0) as u32,
            stalled_count: parse_i64(fields::STALLED_COUNT).max(0) as u32,
            last_error: get(fields::LAST_ERROR)
                .filter(|v| !v.is_empty())
                .map(|v| v.to_string()),
            return_value: get(fields::RETURN_VALUE)
                .filter(|v| !v.is_empty())
                .map(|v| v.to_string()),
            timestamp: parse_i64(fields::TIMESTAMP),
            processed_on: parse_opt_i64(fields::PROCESSED_ON),
            finished_on: parse_opt_i64(fields::FINISHED_ON),
            lock_owner: get(fields::LOCK_OWNER)
                .filter(|v| !v.is_empty())
                .map(|v| v.to_string()),
            lock_expires_at: parse_opt_i64(fields::LOCK_EXPIRES_AT),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_state_round_trip() {
        for state in [
            JobState::Waiting,
            JobState::Delayed,
            JobState::Active,
            JobState::Completed,
            JobState::Failed,
            JobState::Paused,
            JobState::WaitingChildren,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert_eq!(JobState::WaitingChildren.as_str(), "waiting-children");
        assert!("bogus".parse::<JobState>().is_err());
    }

    #[test]
    fn test_backoff_fixed() {
        let backoff = BackoffPolicy::Fixed { delay_ms: 500 };
        assert_eq!(backoff.delay_for_attempt(1), 500);
        assert_eq!(backoff.delay_for_attempt(5), 500);
    }

    #[test]
    fn test_backoff_exponential() {
        let backoff = BackoffPolicy::Exponential { delay_ms: 100 };
        assert_eq!(backoff.delay_for_attempt(1), 100);
        assert_eq!(backoff.delay_for_attempt(2), 200);
        assert_eq!(backoff.delay_for_attempt(3), 400);
        assert_eq!(backoff.delay_for_attempt(4), 800);
    }

    #[test]
    fn test_backoff_exponential_saturates() {
        let backoff = BackoffPolicy::Exponential { delay_ms: u64::MAX / 2 };
        // Must not overflow for large attempt numbers.
        let delay = backoff.delay_for_attempt(40);
        assert_eq!(delay, u64::MAX);
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let backoff = BackoffPolicy::Fixed { delay_ms: 1000 };
        for _ in 0..20 {
            let delay = backoff.delay_with_jitter(1);
            assert!((800..=1200).contains(&delay), "jitter out of bounds: {}", delay);
        }
    }

    #[test]
    fn test_remove_policy_round_trip() {
        assert_eq!("keep".parse::<RemovePolicy>().unwrap(), RemovePolicy::Keep);
        assert_eq!(
            "remove".parse::<RemovePolicy>().unwrap(),
            RemovePolicy::Remove
        );
        assert_eq!(
            "count:25".parse::<RemovePolicy>().unwrap(),
            RemovePolicy::Count(25)
        );
        assert_eq!(RemovePolicy::Count(25).as_str(), "count:25");
        assert!("count:x".parse::<RemovePolicy>().is_err());
    }

    #[test]
    fn test_payload_validation() {
        let good = JobPayload::new("META", "bootstrap-sync", json!({"season": "2025/26"}));
        assert!(good.validate().is_ok());

        let missing_type = JobPayload::new("", "bootstrap-sync", json!({}));
        assert!(matches!(
            missing_type.validate(),
            Err(QueueError::InvalidJobData(_))
        ));

        let missing_name = JobPayload::new("META", "  ", json!({}));
        assert!(missing_name.validate().is_err());
    }

    #[test]
    fn test_payload_serde_uses_type_tag() {
        let payload = JobPayload::new("META", "bootstrap-sync", json!({"k": 1}));
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], "META");
        assert_eq!(value["name"], "bootstrap-sync");
        assert!(value.get("timestamp").is_some());
    }

    #[test]
    fn test_job_options_builder() {
        let opts = JobOptions::new()
            .with_job_id("job-1")
            .with_priority(2)
            .with_lifo(true)
            .with_delay_ms(1500)
            .with_attempts(0) // clamped to 1
            .with_backoff(BackoffPolicy::Fixed { delay_ms: 250 })
            .with_parent("tournament", "parent-1");

        assert_eq!(opts.job_id.as_deref(), Some("job-1"));
        assert_eq!(opts.priority, 2);
        assert!(opts.lifo);
        assert_eq!(opts.delay_ms, 1500);
        assert_eq!(opts.attempts, 1);
        assert_eq!(opts.backoff, BackoffPolicy::Fixed { delay_ms: 250 });
        assert_eq!(opts.parent.as_ref().unwrap().id, "parent-1");
    }

    #[test]
    fn test_hash_round_trip() {
        // The same field layout the enqueue script writes.
        let payload = JobPayload::new("LIVE", "event-live-sync", json!({"event": 12}));
        let map: HashMap<String, String> = [
            (fields::ID, "j-1".to_string()),
            (fields::NAME, "event-live-sync".to_string()),
            (fields::PAYLOAD, payload.to_json().unwrap()),
            (fields::PRIORITY, "3".to_string()),
            (fields::LIFO, "0".to_string()),
            (fields::DELAY_MS, "0".to_string()),
            (fields::MAX_ATTEMPTS, "5".to_string()),
            (fields::BACKOFF_KIND, "exponential".to_string()),
            (fields::BACKOFF_DELAY_MS, "1000".to_string()),
            (fields::REMOVE_ON_COMPLETE, "keep".to_string()),
            (fields::REMOVE_ON_FAIL, "keep".to_string()),
            (fields::TIMEOUT_MS, "10000".to_string()),
            (fields::TIMESTAMP, "1700000000000".to_string()),
            (fields::ATTEMPTS_MADE, "0".to_string()),
            (fields::STALLED_COUNT, "0".to_string()),
            (fields::PARENT_QUEUE, "tournament".to_string()),
            (fields::PARENT_ID, "p-9".to_string()),
            (fields::STATE, "waiting".to_string()),
            ("seq", "42".to_string()),
        ]
        .into_iter()
        .map(|(field, value)| (field.to_string(), value))
        .collect();

        let job = Job::from_hash("live", &map).unwrap();
        assert_eq!(job.id, "j-1");
        assert_eq!(job.queue, "live");
        assert_eq!(job.name, "event-live-sync");
        assert_eq!(job.priority, 3);
        assert_eq!(job.max_attempts, 5);
        assert_eq!(job.timeout_ms, Some(10_000));
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.parent.as_ref().unwrap().queue, "tournament");

        // The payload survives byte-identically.
        let decoded = job.payload().unwrap();
        assert_eq!(decoded.data, json!({"event": 12}));
    }

    #[test]
    fn test_hash_missing_required_field() {
        let map: HashMap<String, String> =
            [(fields::ID.to_string(), "j-1".to_string())].into_iter().collect();
        assert!(matches!(
            Job::from_hash("live", &map),
            Err(QueueError::InvalidJobData(_))
        ));
    }
}
