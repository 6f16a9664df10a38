pub mod tracing;

use std::env;
use thiserror::Error;

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable '{0}' is required but not set")]
    MissingEnvVar(String),

    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },
}

/// Application environment (dev = local Redis, prod = full deployment)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Environment {
    Development, // Local dev (pretty logs, verbose)
    Production,  // Deployed workers (JSON logs)
}

impl Environment {
    pub fn from_env() -> Self {
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        if app_env.eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// Trait for configuration that can be loaded from environment variables
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Helper to load an environment variable with a default value
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Helper to load an environment variable or return an error
pub fn env_required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Helper to load and parse an environment variable, falling back to a default
/// when the variable is unset. A set-but-unparseable value is an error.
pub fn env_parsed_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|e: T::Err| ConfigError::ParseError {
            key: key.to_string(),
            details: format!("{}", e),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_defaults_to_development() {
        temp_env::with_var_unset("APP_ENV", || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Development);
            assert!(env.is_development());
            assert!(!env.is_production());
        });
    }

    #[test]
    fn test_environment_production() {
        temp_env::with_var("APP_ENV", Some("production"), || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Production);
            assert!(env.is_production());
            assert!(!env.is_development());
        });
    }

    #[test]
    fn test_environment_production_case_insensitive() {
        temp_env::with_var("APP_ENV", Some("PRODUCTION"), || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Production);
        });

        temp_env::with_var("APP_ENV", Some("Production"), || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Production);
        });
    }

    #[test]
    fn test_environment_unknown_defaults_to_development() {
        temp_env::with_var("APP_ENV", Some("staging"), || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Development);
        });
    }

    #[test]
    fn test_env_or_default_with_value() {
        temp_env::with_var("TEST_VAR", Some("test_value"), || {
            let result = env_or_default("TEST_VAR", "default");
            assert_eq!(result, "test_value");
        });
    }

    #[test]
    fn test_env_or_default_without_value() {
        temp_env::with_var_unset("MISSING_VAR", || {
            let result = env_or_default("MISSING_VAR", "default_value");
            assert_eq!(result, "default_value");
        });
    }

    #[test]
    fn test_env_required_success() {
        temp_env::with_var("REQUIRED_VAR", Some("required_value"), || {
            let result = env_required("REQUIRED_VAR");
            assert!(result.is_ok());
            assert_eq!(result.unwrap(), "required_value");
        });
    }

    #[test]
    fn test_env_required_missing() {
        temp_env::with_var_unset("MISSING_REQUIRED", || {
            let result = env_required("MISSING_REQUIRED");
            assert!(result.is_err());
            let err = result.unwrap_err();
            assert!(err.to_string().contains("MISSING_REQUIRED"));
            assert!(err.to_string().contains("required"));
        });
    }

    #[test]
    fn test_env_parsed_or_unset_uses_default() {
        temp_env::with_var_unset("WORKER_CONCURRENCY", || {
            let result: Result<usize, _> = env_parsed_or("WORKER_CONCURRENCY", 4);
            assert_eq!(result.unwrap(), 4);
        });
    }

    #[test]
    fn test_env_parsed_or_set_value() {
        temp_env::with_var("WORKER_CONCURRENCY", Some("16"), || {
            let result: Result<usize, _> = env_parsed_or("WORKER_CONCURRENCY", 4);
            assert_eq!(result.unwrap(), 16);
        });
    }

    #[test]
    fn test_env_parsed_or_invalid_value() {
        temp_env::with_var("WORKER_CONCURRENCY", Some("lots"), || {
            let result: Result<usize, _> = env_parsed_or("WORKER_CONCURRENCY", 4);
            assert!(result.is_err());
            assert!(result
                .unwrap_err()
                .to_string()
                .contains("WORKER_CONCURRENCY"));
        });
    }
}
