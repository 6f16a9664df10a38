//! Redis key layout for a queue.
//!
//! Every key used by the runtime lives under `{prefix}:{queue}:`. The fixed
//! per-queue keys are precomputed here; per-record keys (`job:{id}`,
//! `sched:{id}`, `flow:{id}:*`) are derived on demand. The Lua scripts build
//! the same derived keys from the base prefix, so this module is the single
//! Rust-side source of truth for the layout.

/// Sequence space per priority band: scores in the `waiting` sorted set are
/// `priority * 2^32 + seq` (seq negated for LIFO). Scores are Redis doubles,
/// so the encoding is exact for priorities below 2^20.
pub const SEQ_SPACE: i64 = 1 << 32;

/// Compute the `waiting` sorted-set score for a job.
///
/// Lower scores dequeue first: lower priority values win, and within a
/// priority band FIFO order follows the enqueue sequence (reversed when
/// `lifo` is set).
pub fn waiting_score(priority: i64, seq: i64, lifo: bool) -> f64 {
    let seq_component = if lifo { -seq } else { seq };
    (priority * SEQ_SPACE + seq_component) as f64
}

/// Precomputed key names for one queue.
#[derive(Debug, Clone)]
pub struct QueueKeys {
    prefix: String,
    queue: String,
    /// `meta` hash: `paused` flag and the monotonic `seq` counter.
    pub meta: String,
    /// `waiting` sorted set, scored by `(priority, seq)`.
    pub waiting: String,
    /// `delayed` sorted set, scored by fire time (ms).
    pub delayed: String,
    /// `active` sorted set, scored by lock expiry (ms) for stall scans.
    pub active: String,
    /// `completed` sorted set, scored by finish time (ms).
    pub completed: String,
    /// `failed` sorted set, scored by finish time (ms).
    pub failed: String,
    /// `schedulers` index sorted set, scored by next run (ms).
    pub schedulers: String,
    /// Pub/sub channel for lifecycle events.
    pub events: String,
    /// Scheduler leader lock key.
    pub leader: String,
}

impl QueueKeys {
    pub fn new(prefix: impl Into<String>, queue: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let queue = queue.into();
        let base = format!("{}:{}:", prefix, queue);

        Self {
            meta: format!("{}meta", base),
            waiting: format!("{}waiting", base),
            delayed: format!("{}delayed", base),
            active: format!("{}active", base),
            completed: format!("{}completed", base),
            failed: format!("{}failed", base),
            schedulers: format!("{}schedulers", base),
            events: format!("{}events", base),
            leader: format!("{}sched-leader", base),
            prefix,
            queue,
        }
    }

    /// The queue name this key set belongs to.
    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// The global key prefix (shared by every queue of the deployment).
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `{prefix}:{queue}:`, the base handed to the Lua scripts.
    pub fn base(&self) -> String {
        format!("{}:{}:", self.prefix, self.queue)
    }

    /// `{prefix}:`, the root handed to scripts that cross queues (flows).
    pub fn root(&self) -> String {
        format!("{}:", self.prefix)
    }

    /// Hash holding one job record.
    pub fn job(&self, id: &str) -> String {
        format!("{}job:{}", self.base(), id)
    }

    /// Hash holding one scheduler record.
    pub fn scheduler(&self, id: &str) -> String {
        format!("{}sched:{}", self.base(), id)
    }

    /// Set of `queue/jobId` refs for a parent's direct children.
    pub fn flow_children(&self, id: &str) -> String {
        format!("{}flow:{}:children", self.base(), id)
    }

    /// Counter of children a parent is still waiting on.
    pub fn flow_pending(&self, id: &str) -> String {
        format!("{}flow:{}:pending", self.base(), id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = QueueKeys::new("fpl", "tournament");

        assert_eq!(keys.meta, "fpl:tournament:meta");
        assert_eq!(keys.waiting, "fpl:tournament:waiting");
        assert_eq!(keys.delayed, "fpl:tournament:delayed");
        assert_eq!(keys.active, "fpl:tournament:active");
        assert_eq!(keys.completed, "fpl:tournament:completed");
        assert_eq!(keys.failed, "fpl:tournament:failed");
        assert_eq!(keys.events, "fpl:tournament:events");
        assert_eq!(keys.job("abc"), "fpl:tournament:job:abc");
        assert_eq!(keys.scheduler("meta"), "fpl:tournament:sched:meta");
        assert_eq!(keys.flow_children("p1"), "fpl:tournament:flow:p1:children");
        assert_eq!(keys.flow_pending("p1"), "fpl:tournament:flow:p1:pending");
        assert_eq!(keys.base(), "fpl:tournament:");
        assert_eq!(keys.root(), "fpl:");
    }

    #[test]
    fn test_waiting_score_fifo_order() {
        // Same priority band: earlier seq dequeues first.
        assert!(waiting_score(0, 1, false) < waiting_score(0, 2, false));
        // Lower priority value always wins over higher, regardless of seq.
        assert!(waiting_score(0, 1_000_000, false) < waiting_score(1, 1, false));
    }

    #[test]
    fn test_waiting_score_lifo_order() {
        // LIFO within a band: later seq dequeues first.
        assert!(waiting_score(0, 2, true) < waiting_score(0, 1, true));
        // Priority bands still separate LIFO jobs.
        assert!(waiting_score(0, 1, true) < waiting_score(1, 99, true));
    }

    #[test]
    fn test_waiting_score_is_exact() {
        // Round-trips through f64 without losing the seq component.
        let score = waiting_score(5, 123_456, false);
        assert_eq!(score as i64, 5 * SEQ_SPACE + 123_456);
    }
}
