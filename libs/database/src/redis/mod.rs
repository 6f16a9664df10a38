//! Redis connector and utilities
//!
//! Provides connection management for the single Redis deployment backing
//! the job runtime.

mod config;
mod connector;
mod health;

pub use config::RedisConfig;
pub use connector::{
    RedisConnector, connect, connect_from_config, connect_from_config_with_retry,
    connect_with_retry,
};
pub use health::{HealthStatus, check_health, check_health_detailed};

// Re-export redis types for convenience
pub use redis::aio::ConnectionManager;
pub use redis::{AsyncCommands, Client, RedisResult};
