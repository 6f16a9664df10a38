//! Processor trait and the name → processor registry.
//!
//! The worker looks a job's processor up by the job name at fetch time;
//! names nobody registered fail with reason `unknown-job` and follow the
//! normal fail path.

use crate::error::QueueError;
use crate::job::Job;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// A job processor. The runtime never looks inside the payload; processors
/// decode what they need and return an opaque value that is stored on the
/// job and published with the `completed` event.
///
/// # Example
///
/// ```rust,ignore
/// struct BootstrapSync {
///     api: Arc<FplApi>,
/// }
///
/// #[async_trait]
/// impl Processor for BootstrapSync {
///     async fn process(&self, job: &Job) -> Result<serde_json::Value, QueueError> {
///         let payload = job.payload()?;
///         let synced = self.api.sync_bootstrap(&payload.data).await?;
///         Ok(serde_json::json!({ "synced": synced }))
///     }
///
///     fn name(&self) -> &'static str {
///         "bootstrap-sync"
///     }
/// }
/// ```
#[async_trait]
pub trait Processor: Send + Sync {
    /// Process one job. The returned value becomes the job's return value.
    async fn process(&self, job: &Job) -> Result<serde_json::Value, QueueError>;

    /// Processor name for logging.
    fn name(&self) -> &'static str;
}

/// Maps job names to processors.
#[derive(Default)]
pub struct ProcessorRegistry {
    handlers: HashMap<String, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor for a job name. The last registration for a
    /// name wins.
    pub fn register(
        mut self,
        job_name: impl Into<String>,
        processor: Arc<dyn Processor>,
    ) -> Self {
        self.handlers.insert(job_name.into(), processor);
        self
    }

    pub fn get(&self, job_name: &str) -> Option<Arc<dyn Processor>> {
        self.handlers.get(job_name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Registered job names, for startup logging.
    pub fn job_names(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoProcessor;

    #[async_trait]
    impl Processor for EchoProcessor {
        async fn process(&self, job: &Job) -> Result<serde_json::Value, QueueError> {
            Ok(json!({ "echo": job.name }))
        }

        fn name(&self) -> &'static str {
            "echo"
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ProcessorRegistry::new()
            .register("bootstrap-sync", Arc::new(EchoProcessor))
            .register("event-live-sync", Arc::new(EchoProcessor));

        assert_eq!(registry.len(), 2);
        assert!(!registry.is_empty());
        assert!(registry.get("bootstrap-sync").is_some());
        assert!(registry.get("unknown").is_none());

        let mut names = registry.job_names();
        names.sort_unstable();
        assert_eq!(names, vec!["bootstrap-sync", "event-live-sync"]);
    }

    #[test]
    fn test_last_registration_wins() {
        let registry = ProcessorRegistry::new()
            .register("job", Arc::new(EchoProcessor))
            .register("job", Arc::new(EchoProcessor));
        assert_eq!(registry.len(), 1);
    }
}
