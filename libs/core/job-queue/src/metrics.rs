//! Prometheus metrics for the queue runtime.
//!
//! The surface is deliberately small and derives its label values from the
//! crate's own enums so cardinality is bounded by construction:
//!
//! - `queue_job_attempts_total{queue, outcome}` with the attempt's
//!   duration in `queue_job_attempt_duration_seconds{queue}`
//! - `queue_job_retries_total{queue}`
//! - `queue_jobs_stalled_total{queue, action}` from the stall scanner
//! - `queue_depth{queue, state}` fed by the monitor from a counts snapshot
//! - `queue_in_flight_jobs{queue}` and `queue_throughput_per_sec{queue}`
//! - `queue_events_total{queue, event}` from the pub/sub channel
//!
//! Recording without an installed exporter is a no-op, so library code can
//! call these unconditionally.

use crate::events::EventKind;
use crate::job::JobState;
use crate::store::JobCounts;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names, shared with dashboards and alerts.
pub mod names {
    pub const ATTEMPTS: &str = "queue_job_attempts_total";
    pub const ATTEMPT_DURATION: &str = "queue_job_attempt_duration_seconds";
    pub const RETRIES: &str = "queue_job_retries_total";
    pub const STALLED: &str = "queue_jobs_stalled_total";
    pub const DEPTH: &str = "queue_depth";
    pub const IN_FLIGHT: &str = "queue_in_flight_jobs";
    pub const THROUGHPUT: &str = "queue_throughput_per_sec";
    pub const EVENTS: &str = "queue_events_total";
}

/// How one processing attempt ended, from the worker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Acknowledged with a return value.
    Completed,
    /// Failed with attempts left; a retry is scheduled.
    Retried,
    /// Failed terminally.
    Failed,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Retried => "retried",
            Self::Failed => "failed",
        }
    }
}

/// Install the Prometheus recorder once at startup. The returned handle
/// renders the scrape payload for the `/metrics` endpoint.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("Failed to install Prometheus recorder")
        })
        .clone()
}

/// The handle backing `/metrics`, if `init_metrics` has run.
pub fn prometheus_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

/// One finished processing attempt: outcome counter plus duration sample.
pub fn observe_attempt(queue: &str, outcome: AttemptOutcome, duration: Duration) {
    counter!(
        names::ATTEMPTS,
        "queue" => queue.to_string(),
        "outcome" => outcome.as_str().to_string()
    )
    .increment(1);
    histogram!(
        names::ATTEMPT_DURATION,
        "queue" => queue.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A retry was scheduled by the fail path.
pub fn observe_retry(queue: &str) {
    counter!(
        names::RETRIES,
        "queue" => queue.to_string()
    )
    .increment(1);
}

/// One stall-scanner pass: how many jobs went back to waiting and how many
/// were failed terminally.
pub fn observe_stalls(queue: &str, requeued: u64, failed: u64) {
    counter!(
        names::STALLED,
        "queue" => queue.to_string(),
        "action" => "requeued"
    )
    .increment(requeued);
    counter!(
        names::STALLED,
        "queue" => queue.to_string(),
        "action" => "failed"
    )
    .increment(failed);
}

/// Depth gauges for every dispatchable state, from one counts snapshot.
pub fn gauge_depths(queue: &str, counts: &JobCounts) {
    let depths = [
        (JobState::Waiting, counts.waiting),
        (JobState::Delayed, counts.delayed),
        (JobState::Active, counts.active),
        (JobState::Completed, counts.completed),
        (JobState::Failed, counts.failed),
    ];
    for (state, depth) in depths {
        gauge!(
            names::DEPTH,
            "queue" => queue.to_string(),
            "state" => state.as_str()
        )
        .set(depth as f64);
    }
}

/// Jobs currently executing in this worker instance.
pub fn gauge_in_flight(queue: &str, count: usize) {
    gauge!(
        names::IN_FLIGHT,
        "queue" => queue.to_string()
    )
    .set(count as f64);
}

/// Completion rate over the monitor's rolling window.
pub fn gauge_throughput(queue: &str, per_sec: f64) {
    gauge!(
        names::THROUGHPUT,
        "queue" => queue.to_string()
    )
    .set(per_sec);
}

/// A lifecycle event observed on the queue's pub/sub channel.
pub fn observe_event(queue: &str, kind: EventKind) {
    counter!(
        names::EVENTS,
        "queue" => queue.to_string(),
        "event" => kind.as_str()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_outcome_labels() {
        assert_eq!(AttemptOutcome::Completed.as_str(), "completed");
        assert_eq!(AttemptOutcome::Retried.as_str(), "retried");
        assert_eq!(AttemptOutcome::Failed.as_str(), "failed");
    }

    #[test]
    fn test_recording_without_exporter_is_noop() {
        // No recorder installed here: every call must be safe.
        observe_attempt("live", AttemptOutcome::Completed, Duration::from_millis(12));
        observe_retry("live");
        observe_stalls("live", 2, 0);
        gauge_depths("live", &JobCounts::default());
        gauge_in_flight("live", 3);
        gauge_throughput("live", 1.5);
        observe_event("live", EventKind::Completed);
    }
}
