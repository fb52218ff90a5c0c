//! Environment-driven configuration.
//!
//! `Settings::from_env()` loads an optional `.env` file and then reads the
//! process environment. Every value except `DATABASE_URL` has a default.

use std::time::Duration;

use newsflow_events::{ConnectionSettings, RetryPolicy};

use crate::jobs::ConsumerSettings;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub url: String,
    pub connection_name: String,
    pub queue: String,
    pub group: String,
    pub consumer: String,
    pub max_connect_attempts: u32,
    pub connect_base_delay: Duration,
}

impl BrokerSettings {
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            queue: self.queue.clone(),
            retry: RetryPolicy::linear(self.max_connect_attempts, self.connect_base_delay),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub prefetch: usize,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub restart_delay: Duration,
}

impl WorkerSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::linear(self.max_attempts, self.retry_base_delay)
    }

    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            prefetch: self.prefetch,
            restart_delay: self.restart_delay,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchSettings {
    pub url: String,
    pub index: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub worker: WorkerSettings,
    pub database_url: String,
    pub search: SearchSettings,
    pub api_bind_addr: String,
    pub app_env: String,
}

impl Settings {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is normal outside local development.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);

        let broker = BrokerSettings {
            url: env.string("BROKER_URL", "redis://127.0.0.1:6379"),
            connection_name: env.string("BROKER_CONNECTION_NAME", "newsflow"),
            queue: env.string("QUEUE_NAME", "news.index"),
            group: env.string("CONSUMER_GROUP", "newsflow.indexer"),
            consumer: env.string("CONSUMER_NAME", "worker-1"),
            max_connect_attempts: env.at_least_one("BROKER_MAX_CONNECT_ATTEMPTS", 5)?,
            connect_base_delay: env.millis("BROKER_CONNECT_BASE_DELAY_MS", 2000)?,
        };

        let worker = WorkerSettings {
            prefetch: env.at_least_one("WORKER_PREFETCH", 1)? as usize,
            max_attempts: env.at_least_one("WORKER_MAX_ATTEMPTS", 3)?,
            retry_base_delay: env.millis("WORKER_RETRY_BASE_DELAY_MS", 2000)?,
            restart_delay: env.millis("WORKER_RESTART_DELAY_MS", 1000)?,
        };

        let database_url = env
            .get("DATABASE_URL")
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        Ok(Self {
            broker,
            worker,
            database_url,
            search: SearchSettings {
                url: env.string("SEARCH_URL", "http://127.0.0.1:9200"),
                index: env.string("SEARCH_INDEX", "news"),
            },
            api_bind_addr: env.string("API_BIND_ADDR", "0.0.0.0:3000"),
            app_env: env.string("APP_ENV", "development"),
        })
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-blank value for `key`.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn number(&self, key: &'static str, default: u64) -> Result<u64, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse::<u64>().map_err(|e| ConfigError::Invalid {
                key,
                value: raw,
                reason: e.to_string(),
            }),
        }
    }

    fn millis(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.number(key, default).map(Duration::from_millis)
    }

    fn at_least_one(&self, key: &'static str, default: u32) -> Result<u32, ConfigError> {
        let value = self.number(key, u64::from(default))?;
        match u32::try_from(value) {
            Ok(v) if v >= 1 => Ok(v),
            _ => Err(ConfigError::Invalid {
                key,
                value: value.to_string(),
                reason: "must be between 1 and 4294967295".to_string(),
            }),
        }
    }
}
