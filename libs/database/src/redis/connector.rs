use redis::Client;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use tracing::info;

use super::RedisConfig;
use crate::common::{RetryConfig, retry, retry_with_backoff};

/// Reconnect backoff used by the connection manager: 100ms doubling up to
/// a 5s cap. Long-running workers ride out Redis restarts this way.
const RECONNECT_FACTOR_MS: u64 = 100;
const RECONNECT_MAX_DELAY_MS: u32 = 5000;

fn manager_config() -> ConnectionManagerConfig {
    ConnectionManagerConfig::new()
        .set_exponent_base(2.0)
        .set_min_delay(std::time::Duration::from_millis(RECONNECT_FACTOR_MS))
        .set_max_delay(std::time::Duration::from_millis(RECONNECT_MAX_DELAY_MS as u64))
}

/// Connect to Redis and return a ConnectionManager
///
/// The manager transparently reconnects with bounded exponential backoff
/// when the connection drops, so queue and worker handles built on top of
/// it survive Redis restarts without restarting themselves. The initial
/// connection is verified with a PING before it is handed out.
///
/// # Example
/// ```ignore
/// use database::redis::connect;
/// use redis::AsyncCommands;
///
/// let mut conn = connect("redis://127.0.0.1:6379").await?;
/// conn.set::<_, _, ()>("key", "value").await?;
/// ```
pub async fn connect(url: &str) -> redis::RedisResult<ConnectionManager> {
    info!("Attempting to connect to Redis at {}", url);

    let client = Client::open(url)?;
    let manager = ConnectionManager::new_with_config(client, manager_config()).await?;

    let mut conn = manager.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;

    info!("Successfully connected to Redis");
    Ok(manager)
}

/// Connect using a RedisConfig
pub async fn connect_from_config(config: RedisConfig) -> redis::RedisResult<ConnectionManager> {
    connect(config.url()).await
}

/// Connect to Redis, retrying the initial connection on failure
///
/// The manager's own backoff only covers reconnects; this covers the case
/// where Redis is not up yet when the process starts.
///
/// # Example
/// ```ignore
/// use database::redis::connect_with_retry;
/// use database::common::RetryConfig;
///
/// // Default retry: 3 attempts, 100ms initial delay
/// let conn = connect_with_retry("redis://127.0.0.1:6379", None).await?;
///
/// // Custom retry: 5 attempts, 500ms initial delay
/// let config = RetryConfig::new()
///     .with_max_retries(5)
///     .with_initial_delay(500);
/// let conn = connect_with_retry("redis://127.0.0.1:6379", Some(config)).await?;
/// ```
pub async fn connect_with_retry(
    url: &str,
    retry_config: Option<RetryConfig>,
) -> redis::RedisResult<ConnectionManager> {
    match retry_config {
        Some(config) => retry_with_backoff(|| connect(url), config).await,
        None => retry(|| connect(url)).await,
    }
}

/// Connect from config with automatic retry on failure
pub async fn connect_from_config_with_retry(
    config: RedisConfig,
    retry_config: Option<RetryConfig>,
) -> redis::RedisResult<ConnectionManager> {
    connect_with_retry(config.url(), retry_config).await
}

/// Owns both the `Client` and a `ConnectionManager`
///
/// The manager serves command traffic; the client is kept for surfaces
/// that need a dedicated connection, such as pub/sub subscribers.
#[derive(Clone)]
pub struct RedisConnector {
    client: Client,
    manager: ConnectionManager,
}

impl RedisConnector {
    pub async fn new(url: &str) -> redis::RedisResult<Self> {
        let client = Client::open(url)?;
        let manager =
            ConnectionManager::new_with_config(client.clone(), manager_config()).await?;

        let mut conn = manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        Ok(Self { client, manager })
    }

    /// Get a cloned ConnectionManager
    pub fn manager(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Get a cloned Client (for pub/sub connections)
    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires actual Redis
    async fn test_connect() {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let result = connect(&redis_url).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    #[ignore] // Requires actual Redis
    async fn test_redis_connector() {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let connector = RedisConnector::new(&redis_url).await.unwrap();
        let _manager = connector.manager();
        let _client = connector.client();
    }
}
