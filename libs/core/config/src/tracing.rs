use crate::Environment;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Initialize tracing with environment-aware configuration
///
/// - **Production** (`APP_ENV=production`):
///   - JSON format (for log aggregation tools like ELK, Datadog, CloudWatch)
///   - Hides module targets for cleaner logs
///
/// - **Development** (default):
///   - Pretty-printed format (human-readable)
///   - Shows module targets for debugging
///
/// Environment variables:
/// - `APP_ENV`: Set to "production" for JSON logs (default: "development")
/// - `RUST_LOG`: Override log levels (e.g., "debug", "job_queue=trace")
///
/// This function is infallible - if tracing is already initialized, it silently continues.
pub fn init_tracing(environment: &Environment) {
    let is_production = environment.is_production();

    // RUST_LOG wins; otherwise use the per-environment defaults.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(is_production));

    let result = if is_production {
        // Production: JSON format for log aggregation
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false) // Hide module paths in production
            .try_init()
    } else {
        // Development: Pretty format for readability
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true) // Show module paths for debugging
            .pretty()
            .try_init()
    };

    // Handle initialization result
    match result {
        Ok(_) => {
            info!("Tracing initialized. Environment: {:?}", environment);
        }
        Err(_) => {
            // Tracing already initialized, which is fine (common in tests)
            debug!("Tracing already initialized, skipping re-initialization");
        }
    }
}

/// Default log filter per environment. Production stays at info and mutes
/// redis command noise; development turns the queue runtime up to debug.
fn default_filter(is_production: bool) -> EnvFilter {
    if is_production {
        EnvFilter::new("info,redis=warn")
    } else {
        EnvFilter::new("debug,job_queue=debug,redis=info")
    }
}

/// Install the color-eyre panic and error report handlers.
///
/// Safe to call more than once; later calls are no-ops.
pub fn install_color_eyre() {
    if color_eyre::install().is_err() {
        debug!("color-eyre already installed, skipping re-initialization");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_development() {
        let env = Environment::Development;
        // Should not panic
        init_tracing(&env);
    }

    #[test]
    fn test_init_tracing_production() {
        let env = Environment::Production;
        // Should not panic
        init_tracing(&env);
    }

    #[test]
    fn test_init_tracing_multiple_calls() {
        // Should not panic when called multiple times
        let env = Environment::Development;
        init_tracing(&env);
        init_tracing(&env);
    }

    #[test]
    fn test_init_tracing_with_rust_log_env() {
        temp_env::with_var("RUST_LOG", Some("trace"), || {
            let env = Environment::Development;
            // Should not panic
            init_tracing(&env);
        });
    }

    #[test]
    fn test_install_color_eyre_is_idempotent() {
        install_color_eyre();
        install_color_eyre();
    }
}
