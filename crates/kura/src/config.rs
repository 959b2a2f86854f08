//! World configuration, from code, a serialized file or the environment.

use kura_core::{Result, RetryPolicy, WorldError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_BACKEND: &str = "KURA_BACKEND";
pub const ENV_SQLITE_PATH: &str = "KURA_SQLITE_PATH";
pub const ENV_STREAM_POLL_MS: &str = "KURA_STREAM_POLL_MS";
pub const ENV_QUEUE_URL: &str = "KURA_QUEUE_URL";
pub const ENV_QUEUE_MAX_ATTEMPTS: &str = "KURA_QUEUE_MAX_ATTEMPTS";

const DEFAULT_SQLITE_PATH: &str = "kura.db";

fn default_poll_interval_ms() -> u64 {
    100
}

/// Which backend holds storage and streams.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    #[default]
    Memory,
    Sqlite {
        path: PathBuf,
        /// How often blocked stream readers re-check the database.
        #[serde(default = "default_poll_interval_ms")]
        poll_interval_ms: u64,
    },
}

/// Queue delivery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Base URL for HTTP delivery.
    pub base_url: Option<String>,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            max_attempts: 5,
            initial_backoff_ms: 250,
            max_backoff_ms: 30_000,
            multiplier: 2,
        }
    }
}

impl QueueConfig {
    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        RetryPolicy::exponential_backoff(
            self.max_attempts,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            self.multiplier,
        )
    }
}

/// Everything needed to build a [`World`](crate::World).
///
/// # Examples
///
/// ```
/// use kura::{BackendConfig, WorldConfig};
///
/// let config = WorldConfig::sqlite("/var/lib/kura/world.db");
/// assert!(matches!(config.backend, BackendConfig::Sqlite { .. }));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    pub backend: BackendConfig,
    pub queue: QueueConfig,
}

impl WorldConfig {
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendConfig::Sqlite {
                path: path.into(),
                poll_interval_ms: default_poll_interval_ms(),
            },
            queue: QueueConfig::default(),
        }
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Reads `KURA_*` variables; unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let backend = match lookup(ENV_BACKEND).as_deref().map(str::trim) {
            None | Some("") | Some("memory") => BackendConfig::Memory,
            Some("sqlite") => BackendConfig::Sqlite {
                path: lookup(ENV_SQLITE_PATH)
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SQLITE_PATH)),
                poll_interval_ms: parse_var(&lookup, ENV_STREAM_POLL_MS)?
                    .unwrap_or_else(default_poll_interval_ms),
            },
            Some(other) => {
                return Err(WorldError::Configuration(format!(
                    "{ENV_BACKEND}={other:?} is not a backend (expected memory or sqlite)"
                )))
            }
        };

        let mut queue = QueueConfig {
            base_url: lookup(ENV_QUEUE_URL).filter(|url| !url.trim().is_empty()),
            ..QueueConfig::default()
        };
        if let Some(max_attempts) = parse_var(&lookup, ENV_QUEUE_MAX_ATTEMPTS)? {
            queue.max_attempts = max_attempts;
        }

        let config = Self { backend, queue };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let BackendConfig::Sqlite {
            poll_interval_ms, ..
        } = &self.backend
        {
            if *poll_interval_ms == 0 {
                return Err(WorldError::Configuration(
                    "poll_interval_ms must be at least 1".to_string(),
                ));
            }
        }
        self.queue.retry_policy().map(|_| ())
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            WorldError::Configuration(format!("{key}={raw:?} is not a valid number"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_empty_environment_is_memory() {
        let config = WorldConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, WorldConfig::memory());
    }

    #[test]
    fn test_sqlite_from_environment() {
        let config = WorldConfig::from_lookup(lookup(&[
            ("KURA_BACKEND", "sqlite"),
            ("KURA_SQLITE_PATH", "/tmp/world.db"),
            ("KURA_STREAM_POLL_MS", "25"),
            ("KURA_QUEUE_URL", "http://localhost:3000"),
            ("KURA_QUEUE_MAX_ATTEMPTS", "3"),
        ]))
        .unwrap();
        assert_eq!(
            config.backend,
            BackendConfig::Sqlite {
                path: PathBuf::from("/tmp/world.db"),
                poll_interval_ms: 25,
            }
        );
        assert_eq!(config.queue.base_url.as_deref(), Some("http://localhost:3000"));
        assert_eq!(config.queue.retry_policy().unwrap().max_attempts(), 3);
    }

    #[test]
    fn test_invalid_values_are_configuration_errors() {
        for vars in [
            vec![("KURA_BACKEND", "postgres")],
            vec![("KURA_QUEUE_MAX_ATTEMPTS", "many")],
            vec![("KURA_QUEUE_MAX_ATTEMPTS", "0")],
            vec![("KURA_BACKEND", "sqlite"), ("KURA_STREAM_POLL_MS", "0")],
        ] {
            let result = WorldConfig::from_lookup(lookup(&vars));
            assert!(
                matches!(result, Err(WorldError::Configuration(_))),
                "{vars:?} gave {result:?}"
            );
        }
    }
}
