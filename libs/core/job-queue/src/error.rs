//! Error types for queue operations.
//!
//! This module provides:
//! - `QueueError` - The main error type for the runtime
//! - `ErrorKind` - Stable kind tags for structured reporting
//! - `ErrorCategory` - Transient/permanent classification for retry decisions

use serde::Serialize;
use thiserror::Error;

/// Errors that can occur in the queue runtime.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Redis connection or command error. Transient: the connection manager
    /// reconnects and callers retry with backoff.
    #[error("Redis error: {0}")]
    Connection(#[from] redis::RedisError),

    /// A server-side script rejected the call. Caller bug, never retried.
    #[error("Script error: {0}")]
    Script(String),

    /// Payload failed envelope validation or carried an unknown status.
    #[error("Invalid job data: {0}")]
    InvalidJobData(String),

    /// Enqueue rejected by policy.
    #[error("Enqueue rejected: {0}")]
    AddJob(String),

    /// The processor returned an error; feeds the fail/retry path.
    #[error("Processing error: {0}")]
    Processing(String),

    /// A job or fetch exceeded its deadline.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// A job was re-queued by the stall scanner too many times.
    #[error("Job {job_id} stalled {count} times")]
    Stalled { job_id: String, count: u32 },

    /// The scheduler lost its leader lock mid-tick.
    #[error("Scheduler leadership lost: {0}")]
    LeaderLost(String),

    /// Parent/child wiring inconsistency (missing parent, duplicate id).
    #[error("Flow error: {0}")]
    Flow(String),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    /// Stable kind tag for structured reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) => ErrorKind::Connection,
            Self::Script(_) => ErrorKind::Script,
            Self::InvalidJobData(_) => ErrorKind::InvalidJobData,
            Self::AddJob(_) => ErrorKind::AddJob,
            Self::Processing(_) => ErrorKind::Processing,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Stalled { .. } => ErrorKind::Stalled,
            Self::LeaderLost(_) => ErrorKind::LeaderLost,
            Self::Flow(_) => ErrorKind::Flow,
            Self::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Check if this is a connection-level error that might recover on retry.
    ///
    /// `READONLY` responses count: they mean we are talking to a replica
    /// after a failover and must reconnect.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Connection(e) => {
                let err_str = e.to_string().to_lowercase();
                err_str.contains("connection")
                    || err_str.contains("disconnected")
                    || err_str.contains("broken pipe")
                    || err_str.contains("reset by peer")
                    || err_str.contains("refused")
                    || err_str.contains("readonly")
                    || err_str.contains("eof")
                    || err_str.contains("io error")
            }
            _ => false,
        }
    }

    /// Check if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Connection(e) => {
                let err_str = e.to_string().to_lowercase();
                err_str.contains("timeout") || err_str.contains("timed out")
            }
            Self::Timeout(_) => true,
            _ => false,
        }
    }

    /// Categorize for retry decisions at the adapter layer.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection(_) | Self::Timeout(_) => ErrorCategory::Transient,
            // Processor errors are arbitrated by the job's attempt budget,
            // not by the adapter; everything else is a caller bug.
            Self::Processing(_) => ErrorCategory::Transient,
            Self::Script(_)
            | Self::InvalidJobData(_)
            | Self::AddJob(_)
            | Self::Stalled { .. }
            | Self::LeaderLost(_)
            | Self::Flow(_)
            | Self::Serialization(_) => ErrorCategory::Permanent,
        }
    }

    /// Structured payload for logs and the event channel.
    pub fn payload(&self, queue: &str, job_id: Option<&str>) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind().as_str(),
            queue: queue.to_string(),
            job_id: job_id.map(|s| s.to_string()),
            cause: self.to_string(),
        }
    }
}

/// Stable kind tags, one per taxonomy entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Script,
    InvalidJobData,
    AddJob,
    Processing,
    Timeout,
    Stalled,
    LeaderLost,
    Flow,
    Serialization,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Script => "script",
            Self::InvalidJobData => "invalid-job-data",
            Self::AddJob => "add-job",
            Self::Processing => "processing",
            Self::Timeout => "timeout",
            Self::Stalled => "stalled",
            Self::LeaderLost => "leader-lost",
            Self::Flow => "flow",
            Self::Serialization => "serialization",
        }
    }
}

/// Transient errors are worth retrying at the adapter layer; permanent ones
/// surface to the caller immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transient,
    Permanent,
}

impl ErrorCategory {
    pub fn should_retry(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Structured error report: `{kind, queue, jobId?, cause}`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub kind: &'static str,
    pub queue: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub cause: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = QueueError::Processing("boom".to_string());
        assert_eq!(err.to_string(), "Processing error: boom");

        let err = QueueError::Stalled {
            job_id: "j1".to_string(),
            count: 2,
        };
        assert_eq!(err.to_string(), "Job j1 stalled 2 times");
    }

    #[test]
    fn test_error_kind_tags() {
        assert_eq!(
            QueueError::InvalidJobData("missing type".into()).kind(),
            ErrorKind::InvalidJobData
        );
        assert_eq!(ErrorKind::InvalidJobData.as_str(), "invalid-job-data");
        assert_eq!(
            QueueError::LeaderLost("tick".into()).kind().as_str(),
            "leader-lost"
        );
    }

    #[test]
    fn test_category_transient() {
        assert_eq!(
            QueueError::Timeout("fetch".into()).category(),
            ErrorCategory::Transient
        );
        assert!(ErrorCategory::Transient.should_retry());
    }

    #[test]
    fn test_category_permanent() {
        assert_eq!(
            QueueError::InvalidJobData("bad".into()).category(),
            ErrorCategory::Permanent
        );
        assert_eq!(
            QueueError::Flow("cycle".into()).category(),
            ErrorCategory::Permanent
        );
        assert!(!ErrorCategory::Permanent.should_retry());
    }

    #[test]
    fn test_structured_payload() {
        let err = QueueError::Processing("boom".to_string());
        let payload = err.payload("tournament", Some("job-1"));

        assert_eq!(payload.kind, "processing");
        assert_eq!(payload.queue, "tournament");
        assert_eq!(payload.job_id.as_deref(), Some("job-1"));

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "processing");
        assert_eq!(json["queue"], "tournament");
    }

    #[test]
    fn test_is_timeout() {
        assert!(QueueError::Timeout("deadline".into()).is_timeout());
        assert!(!QueueError::Processing("deadline".into()).is_timeout());
    }
}
