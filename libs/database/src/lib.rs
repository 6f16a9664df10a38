//! Database library providing the Redis connector used by the job runtime
//!
//! The queue, worker, scheduler and flow services all share a single Redis
//! deployment; this crate owns connection management for it.
//!
//! # Features
//!
//! - `redis` (default) - Redis support
//! - `config` - Configuration support with `core_config::FromEnv`
//! - `all` - All features
//!
//! # Example
//!
//! ```ignore
//! use database::redis;
//! use redis::AsyncCommands;
//!
//! let mut conn = redis::connect("redis://127.0.0.1:6379").await?;
//! conn.set::<_, _, ()>("key", "value").await?;
//! ```

// Always available modules
pub mod common;

// Database-specific modules (conditional based on features)
#[cfg(feature = "redis")]
pub mod redis;

// Re-exports for convenience
pub use common::{DatabaseError, DatabaseResult};
