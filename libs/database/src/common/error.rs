/// Unified error type for connection management
///
/// This provides a consistent error interface for the Redis connector and any
/// future stores.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// Redis-specific errors
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Connection failed after retries
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Health check failed
    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Generic(String),
}

/// Result type alias for connection operations
pub type DatabaseResult<T> = Result<T, DatabaseError>;
