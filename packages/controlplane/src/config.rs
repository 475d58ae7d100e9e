use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Single token accepted in the admin scope.
    pub admin_api_key: String,
    /// Tokens accepted in the agent scope.
    pub agent_api_keys: Vec<String>,
    /// Filesystem path of the store; ":memory:" means ephemeral.
    pub db_path: String,
    /// How long a claimed task may sit untouched before it is requeued.
    pub task_lease: Duration,
    /// Whether to mount the OpenAPI document.
    pub enable_swagger: bool,
    pub port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let admin_api_key = env::var("ADMIN_API_KEY").context("ADMIN_API_KEY must be set")?;

        let agent_api_keys = env::var("AGENT_API_KEYS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect();

        let lease_seconds: u64 = env::var("TASK_LEASE_SECONDS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .context("TASK_LEASE_SECONDS must be a valid number")?;

        Ok(Self {
            admin_api_key,
            agent_api_keys,
            db_path: env::var("DB_PATH").unwrap_or_else(|_| "data/controlplane.db".to_string()),
            task_lease: Duration::from_secs(lease_seconds),
            enable_swagger: env::var("ENABLE_SWAGGER")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            admin_api_key: "admin-key".into(),
            agent_api_keys: vec!["agent-key".into()],
            db_path: ":memory:".into(),
            task_lease: Duration::from_secs(300),
            enable_swagger: false,
            port: 8080,
        }
    }

    #[test]
    fn defaults_are_sensible() {
        let config = base();
        assert_eq!(config.task_lease, Duration::from_secs(300));
        assert_eq!(config.port, 8080);
    }
}
