use redis::aio::ConnectionManager;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::common::DatabaseError;

/// Probes answer within this window or report unhealthy.
const PING_DEADLINE: Duration = Duration::from_secs(2);

/// Check Redis health
///
/// Sends a `PING` and expects `PONG` within two seconds. Worker readiness
/// probes call this, so a hung connection must turn into a failed probe
/// rather than a hung endpoint.
pub async fn check_health(conn: &mut ConnectionManager) -> Result<(), DatabaseError> {
    debug!("Running Redis health check");

    let cmd = redis::cmd("PING");
    let ping = cmd.query_async::<String>(conn);
    let response = tokio::time::timeout(PING_DEADLINE, ping)
        .await
        .map_err(|_| {
            DatabaseError::HealthCheckFailed(format!(
                "Redis PING exceeded {}ms",
                PING_DEADLINE.as_millis()
            ))
        })?
        .map_err(|e| DatabaseError::HealthCheckFailed(format!("Redis health check failed: {}", e)))?;

    if response != "PONG" {
        return Err(DatabaseError::HealthCheckFailed(format!(
            "Redis PING returned unexpected response: {}",
            response
        )));
    }

    debug!("Redis health check passed");
    Ok(())
}

/// Health check result for detailed status reporting
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Whether Redis is healthy
    pub healthy: bool,

    /// Optional error message if unhealthy
    pub message: Option<String>,

    /// Response time in milliseconds
    pub response_time_ms: u64,
}

/// Check Redis health with response timing, for monitoring surfaces that
/// want more than pass/fail.
pub async fn check_health_detailed(conn: &mut ConnectionManager) -> HealthStatus {
    let start = Instant::now();
    let outcome = check_health(conn).await;
    let response_time_ms = start.elapsed().as_millis() as u64;

    match outcome {
        Ok(()) => HealthStatus {
            healthy: true,
            message: None,
            response_time_ms,
        },
        Err(e) => HealthStatus {
            healthy: false,
            message: Some(e.to_string()),
            response_time_ms,
        },
    }
}
