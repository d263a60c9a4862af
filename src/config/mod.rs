//! Engine configuration module
//!
//! This module provides type-safe configuration loading from environment
//! variables using the `config` and `dotenvy` crates. Configuration is
//! loaded with the `PGCOURIER` prefix and nested values use double
//! underscores as separators.
//!
//! # Example
//!
//! ```no_run
//! use pgcourier::config::PubSubConfig;
//!
//! let config = PubSubConfig::load().expect("Failed to load configuration");
//! config.validate().expect("Invalid configuration");
//! ```

mod database;
mod error;

pub use database::DatabaseConfig;
pub use error::{ConfigError, ValidationError};

use serde::Deserialize;

/// Root engine configuration
///
/// Load using [`PubSubConfig::load()`] which reads from environment
/// variables, or build one by hand when embedding the engine.
#[derive(Debug, Clone, Deserialize)]
pub struct PubSubConfig {
    /// Database configuration (PostgreSQL connection)
    pub database: DatabaseConfig,

    /// Per-trigger listener cap for the leak early-warning guard
    #[serde(default = "default_max_listeners")]
    pub max_listeners: usize,
}

impl PubSubConfig {
    /// Load configuration from environment variables
    ///
    /// This function:
    /// 1. Loads `.env` file if present (for development)
    /// 2. Reads environment variables with the `PGCOURIER` prefix
    /// 3. Uses `__` (double underscore) to separate nested values
    /// 4. Deserializes into typed configuration structs
    ///
    /// # Environment Variable Format
    ///
    /// - `PGCOURIER__DATABASE__URL=...` -> `database.url = ...`
    /// - `PGCOURIER__MAX_LISTENERS=30` -> `max_listeners = 30`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required environment variables are missing
    /// or values cannot be parsed into expected types.
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if present (development)
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .prefix("PGCOURIER")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Validate all configuration values
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` if any configuration value is invalid.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.database.validate()?;
        if self.max_listeners == 0 {
            return Err(ValidationError::InvalidMaxListeners);
        }
        Ok(())
    }
}

fn default_max_listeners() -> usize {
    15
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to ensure tests don't run in parallel (env vars are global)
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn set_minimal_env() {
        env::set_var(
            "PGCOURIER__DATABASE__URL",
            "postgresql://test@localhost/test",
        );
    }

    fn clear_env() {
        env::remove_var("PGCOURIER__DATABASE__URL");
        env::remove_var("PGCOURIER__MAX_LISTENERS");
    }

    #[test]
    fn test_load_from_environment() {
        let _guard = ENV_MUTEX.lock().unwrap();
        set_minimal_env();
        let result = PubSubConfig::load();
        clear_env();

        assert!(result.is_ok(), "Failed to load config: {:?}", result.err());
        let config = result.unwrap();
        assert_eq!(config.database.url, "postgresql://test@localhost/test");
        assert_eq!(config.max_listeners, 15);
    }

    #[test]
    fn test_validate_full_config() {
        let _guard = ENV_MUTEX.lock().unwrap();
        set_minimal_env();
        let result = PubSubConfig::load();
        clear_env();

        assert!(result.is_ok());
        let config = result.unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_custom_max_listeners() {
        let _guard = ENV_MUTEX.lock().unwrap();
        set_minimal_env();
        env::set_var("PGCOURIER__MAX_LISTENERS", "30");
        let result = PubSubConfig::load();
        clear_env();

        let config = result.unwrap();
        assert_eq!(config.max_listeners, 30);
    }

    #[test]
    fn test_zero_max_listeners_rejected() {
        let config = PubSubConfig {
            database: DatabaseConfig {
                url: "postgresql://test@localhost/test".to_string(),
                ..Default::default()
            },
            max_listeners: 0,
        };
        assert!(config.validate().is_err());
    }
}
