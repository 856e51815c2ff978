//! ICE broker configuration.
//!
//! Loaded from environment variables with sensible defaults. Sensitive
//! fields are redacted in Debug output.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;

/// Default TCP bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:1673";

/// Default directory (Redis) URL.
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Default reaper period in seconds.
pub const DEFAULT_REAPER_PERIOD_SECONDS: u64 = 60;

/// ICE broker configuration.
#[derive(Clone)]
pub struct Config {
    /// TCP bind address (default: "0.0.0.0:1673").
    pub bind_address: String,

    /// Directory connection URL. May embed credentials, so it is
    /// protected by `SecretString` to prevent accidental logging.
    pub redis_url: SecretString,

    /// Period of the client reaper, in seconds.
    pub reaper_period_seconds: u64,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("redis_url", &"[REDACTED]")
            .field("reaper_period_seconds", &self.reaper_period_seconds)
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    #[must_use]
    pub fn from_vars(vars: &HashMap<String, String>) -> Self {
        let bind_address = vars
            .get("ICE_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let redis_url = SecretString::from(
            vars.get("REDIS_URL")
                .cloned()
                .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
        );

        let reaper_period_seconds = vars
            .get("ICE_REAPER_PERIOD_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_REAPER_PERIOD_SECONDS);

        Config {
            bind_address,
            redis_url,
            reaper_period_seconds,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    #[test]
    fn test_defaults() {
        let config = Config::from_vars(&HashMap::new());
        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.redis_url.expose_secret(), DEFAULT_REDIS_URL);
        assert_eq!(config.reaper_period_seconds, DEFAULT_REAPER_PERIOD_SECONDS);
    }

    #[test]
    fn test_custom_values() {
        let vars = HashMap::from([
            ("ICE_BIND_ADDRESS".to_string(), "127.0.0.1:11673".to_string()),
            ("REDIS_URL".to_string(), "redis://db:6379".to_string()),
            ("ICE_REAPER_PERIOD_SECONDS".to_string(), "5".to_string()),
        ]);
        let config = Config::from_vars(&vars);
        assert_eq!(config.bind_address, "127.0.0.1:11673");
        assert_eq!(config.redis_url.expose_secret(), "redis://db:6379");
        assert_eq!(config.reaper_period_seconds, 5);
    }

    #[test]
    fn test_debug_redacts_the_directory_url() {
        let vars = HashMap::from([(
            "REDIS_URL".to_string(),
            "redis://:hunter2@db:6379".to_string(),
        )]);
        let config = Config::from_vars(&vars);

        let debug_output = format!("{config:?}");
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("redis://"));
        assert!(!debug_output.contains("hunter2"));
    }
}
