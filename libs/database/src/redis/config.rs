#[cfg(feature = "config")]
use core_config::{ConfigError, FromEnv};

/// Redis configuration
///
/// Connection settings for the Redis instance that stores queues, jobs,
/// schedulers and flows. Construct manually or load from the environment
/// (with the `config` feature).
///
/// # Example
///
/// ```ignore
/// use database::redis::RedisConfig;
///
/// let config = RedisConfig::new("redis://127.0.0.1:6379").with_database(1);
/// let conn = database::redis::connect(config.url()).await?;
/// ```
#[derive(Clone, Debug)]
pub struct RedisConfig {
    /// Redis connection URL (required)
    pub url: String,

    /// Optional database number (0-15 for default Redis)
    pub database: Option<u8>,

    /// Optional username for Redis ACL
    pub username: Option<String>,

    /// Optional password for authentication
    pub password: Option<String>,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            database: None,
            username: None,
            password: None,
        }
    }

    pub fn with_database(mut self, database: u8) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_auth(
        mut self,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self::new("redis://127.0.0.1:6379")
    }
}

/// Load RedisConfig from environment variables
///
/// - `REDIS_URL` or `REDIS_HOST` (required) - connection string
/// - `REDIS_DATABASE` (optional) - database number (0-15)
/// - `REDIS_USERNAME` (optional) - username for Redis ACL
/// - `REDIS_PASSWORD` (optional) - password for authentication
#[cfg(feature = "config")]
impl FromEnv for RedisConfig {
    fn from_env() -> Result<Self, ConfigError> {
        // REDIS_URL wins; REDIS_HOST is accepted for older deploy manifests.
        let url = std::env::var("REDIS_URL")
            .or_else(|_| std::env::var("REDIS_HOST"))
            .map_err(|_| ConfigError::MissingEnvVar("REDIS_URL or REDIS_HOST".to_string()))?;

        let database = match std::env::var("REDIS_DATABASE") {
            Ok(raw) => Some(raw.parse().map_err(|e| ConfigError::ParseError {
                key: "REDIS_DATABASE".to_string(),
                details: format!("{}", e),
            })?),
            Err(_) => None,
        };

        Ok(Self {
            url,
            database,
            username: std::env::var("REDIS_USERNAME").ok(),
            password: std::env::var("REDIS_PASSWORD").ok(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_construction() {
        let config = RedisConfig::new("redis://localhost:6379")
            .with_database(2)
            .with_auth(Some("svc".to_string()), Some("hunter2".to_string()));

        assert_eq!(config.url(), "redis://localhost:6379");
        assert_eq!(config.database, Some(2));
        assert_eq!(config.username.as_deref(), Some("svc"));
        assert_eq!(config.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn test_default_points_at_localhost() {
        assert_eq!(RedisConfig::default().url, "redis://127.0.0.1:6379");
    }

    #[cfg(feature = "config")]
    #[test]
    fn test_from_env_prefers_redis_url() {
        temp_env::with_vars(
            [
                ("REDIS_URL", Some("redis://primary:6379")),
                ("REDIS_HOST", Some("redis://legacy:6379")),
            ],
            || {
                let config = RedisConfig::from_env().unwrap();
                assert_eq!(config.url, "redis://primary:6379");
            },
        );
    }

    #[cfg(feature = "config")]
    #[test]
    fn test_from_env_falls_back_to_redis_host() {
        temp_env::with_vars(
            [
                ("REDIS_URL", None::<&str>),
                ("REDIS_HOST", Some("redis://legacy:6379")),
            ],
            || {
                let config = RedisConfig::from_env().unwrap();
                assert_eq!(config.url, "redis://legacy:6379");
            },
        );
    }

    #[cfg(feature = "config")]
    #[test]
    fn test_from_env_missing_url_errors() {
        temp_env::with_vars(
            [("REDIS_URL", None::<&str>), ("REDIS_HOST", None::<&str>)],
            || {
                let err = RedisConfig::from_env().unwrap_err();
                assert!(err.to_string().contains("REDIS"));
            },
        );
    }

    #[cfg(feature = "config")]
    #[test]
    fn test_from_env_rejects_bad_database() {
        temp_env::with_vars(
            [
                ("REDIS_URL", Some("redis://localhost:6379")),
                ("REDIS_DATABASE", Some("sixteen")),
            ],
            || {
                let err = RedisConfig::from_env().unwrap_err();
                assert!(err.to_string().contains("REDIS_DATABASE"));
            },
        );
    }
}
