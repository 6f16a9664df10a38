use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy for connection attempts
///
/// Worker processes come up before (or while) Redis does in most
/// deployments, so startup connections retry with exponential backoff and
/// jitter instead of failing fast.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds
    pub initial_delay_ms: u64,

    /// Ceiling for the backoff delay in milliseconds
    pub max_delay_ms: u64,

    /// Backoff growth factor per attempt (2.0 doubles the delay)
    pub backoff_multiplier: f64,

    /// Spread retries of simultaneously-started replicas apart
    pub use_jitter: bool,
}

impl RetryConfig {
    /// 3 retries, 100ms initial delay, 5s cap, doubling, jittered.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay_ms: u64) -> Self {
        self.initial_delay_ms = delay_ms;
        self
    }

    pub fn with_max_delay(mut self, delay_ms: u64) -> Self {
        self.max_delay_ms = delay_ms;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Delay before retry number `attempt` (1-based), before jitter.
    fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        ((self.initial_delay_ms as f64) * factor).min(self.max_delay_ms as f64) as u64
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

/// Run `operation` until it succeeds or the retry budget is spent.
///
/// # Example
/// ```ignore
/// use database::common::retry::{retry_with_backoff, RetryConfig};
///
/// let conn = retry_with_backoff(
///     || database::redis::connect(&redis_url),
///     RetryConfig::new().with_max_retries(5),
/// ).await?;
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(mut operation: F, config: RetryConfig) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!("Operation succeeded after {} retries", attempt);
                }
                return Ok(result);
            }
            Err(e) if attempt >= config.max_retries => {
                warn!(
                    "Operation failed after {} attempts: {}",
                    attempt + 1,
                    e
                );
                return Err(e);
            }
            Err(e) => {
                attempt += 1;
                let mut delay = config.delay_for_attempt(attempt);
                if config.use_jitter {
                    delay = apply_jitter(delay);
                }
                debug!(
                    "Operation failed (attempt {}/{}): {}. Retrying in {}ms...",
                    attempt, config.max_retries, e, delay
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
    }
}

/// Pull the delay down to somewhere in [50%, 100%] of its nominal value.
fn apply_jitter(delay_ms: u64) -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::BuildHasher;

    let roll = RandomState::new().hash_one(std::time::SystemTime::now()) % 51;
    delay_ms * (50 + roll) / 100
}

/// Retry with the default policy.
pub async fn retry<F, Fut, T, E>(operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff(operation, RetryConfig::default()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counted<T: Clone + Send + 'static>(
        counter: &Arc<AtomicU32>,
        results: impl Fn(u32) -> Result<T, String> + Clone,
    ) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = Result<T, String>> + Send>> {
        let counter = counter.clone();
        move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            let result = results(attempt);
            Box::pin(async move { result })
        }
    }

    #[tokio::test]
    async fn test_first_attempt_success_does_not_sleep() {
        let counter = Arc::new(AtomicU32::new(0));
        let result = retry(counted(&counter, |_| Ok("up"))).await;

        assert_eq!(result.unwrap(), "up");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let counter = Arc::new(AtomicU32::new(0));
        let config = RetryConfig::new().with_initial_delay(10).without_jitter();

        let result = retry_with_backoff(
            counted(&counter, |attempt| {
                if attempt < 2 {
                    Err(format!("refused ({})", attempt))
                } else {
                    Ok("up")
                }
            }),
            config,
        )
        .await;

        assert_eq!(result.unwrap(), "up");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_returns_last_error() {
        let counter = Arc::new(AtomicU32::new(0));
        let config = RetryConfig::new()
            .with_max_retries(2)
            .with_initial_delay(10)
            .without_jitter();

        let result: Result<(), _> =
            retry_with_backoff(counted(&counter, |_| Err("down".to_string())), config).await;

        assert_eq!(result.unwrap_err(), "down");
        // 1 initial + 2 retries
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_delay_growth_and_cap() {
        let config = RetryConfig::new()
            .with_initial_delay(100)
            .with_max_delay(500)
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(1), 100);
        assert_eq!(config.delay_for_attempt(2), 200);
        assert_eq!(config.delay_for_attempt(3), 400);
        // Capped from here on.
        assert_eq!(config.delay_for_attempt(4), 500);
        assert_eq!(config.delay_for_attempt(10), 500);
    }

    #[test]
    fn test_jitter_stays_in_half_open_band() {
        for _ in 0..20 {
            let jittered = apply_jitter(1000);
            assert!((500..=1000).contains(&jittered));
        }
    }

    #[test]
    fn test_builder() {
        let config = RetryConfig::new()
            .with_max_retries(5)
            .with_initial_delay(200)
            .with_max_delay(10_000)
            .with_backoff_multiplier(3.0)
            .without_jitter();

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.initial_delay_ms, 200);
        assert_eq!(config.max_delay_ms, 10_000);
        assert_eq!(config.backoff_multiplier, 3.0);
        assert!(!config.use_jitter);
    }
}
