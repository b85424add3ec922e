//! Process configuration from environment variables.
//!
//! A `.env` file in the working directory is loaded first if present; real
//! environment variables take precedence over it.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `DATABASE_URL` | required |
//! | `REDIS_URL` | `redis://127.0.0.1:6379` |
//! | `TOKEN_SYMMETRIC_KEY` | required for sessions, at least 32 characters |
//! | `ACCESS_TOKEN_DURATION_SECS` | `900` |
//! | `REFRESH_TOKEN_DURATION_SECS` | `86400` |
//! | `ENVIRONMENT` | `development` |
//! | `LOG_LEVEL` | `info` |
//! | `DB_MAX_CONNECTIONS` | `10` |
//! | `TX_TIMEOUT_MS` | unset (no deadline) |
//! | `WORKER_CONCURRENCY` | `10` |
//! | `QUEUE_NAMESPACE` | `ledgerline` |
//! | `VERIFY_EMAIL_BASE_URL` | `http://localhost:8080` |
//! | `EMAIL_SENDER_NAME` | `Ledgerline` |
//! | `EMAIL_SENDER_ADDRESS` | `no-reply@ledgerline.local` |

use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use ledgerline_auth::JwtMaker;

use crate::store::{Coordinator, Store};
use crate::users::SessionService;

const MIN_TOKEN_KEY_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

#[derive(Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub database_url: String,
    pub redis_url: String,
    /// Only the session surface needs this; the worker runs without it.
    pub token_symmetric_key: Option<String>,
    pub access_token_duration: Duration,
    pub refresh_token_duration: Duration,
    pub environment: String,
    pub log_level: String,
    pub db_max_connections: u32,
    /// Deadline for one `run_atomic` unit of work.
    pub tx_timeout: Option<Duration>,
    pub worker_concurrency: usize,
    pub queue_namespace: String,
    pub verify_email_base_url: String,
    pub email_sender_name: String,
    pub email_sender_address: String,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("redis_url", &self.redis_url)
            .field("access_token_duration", &self.access_token_duration)
            .field("refresh_token_duration", &self.refresh_token_duration)
            .field("environment", &self.environment)
            .field("log_level", &self.log_level)
            .field("db_max_connections", &self.db_max_connections)
            .field("tx_timeout", &self.tx_timeout)
            .field("worker_concurrency", &self.worker_concurrency)
            .field("queue_namespace", &self.queue_namespace)
            .field("verify_email_base_url", &self.verify_email_base_url)
            .finish_non_exhaustive()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let token_symmetric_key = vars.get("TOKEN_SYMMETRIC_KEY");
        if token_symmetric_key
            .as_ref()
            .is_some_and(|key| key.len() < MIN_TOKEN_KEY_LEN)
        {
            return Err(ConfigError::InvalidValue {
                key: "TOKEN_SYMMETRIC_KEY".into(),
                message: format!("must be at least {MIN_TOKEN_KEY_LEN} characters"),
            });
        }

        let db_max_connections: u32 = vars.parsed("DB_MAX_CONNECTIONS", 10)?;
        if db_max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DB_MAX_CONNECTIONS".into(),
                message: "must be positive".into(),
            });
        }

        Ok(Self {
            database_url: vars.required("DATABASE_URL")?,
            redis_url: vars.or("REDIS_URL", "redis://127.0.0.1:6379"),
            token_symmetric_key,
            access_token_duration: Duration::from_secs(
                vars.parsed("ACCESS_TOKEN_DURATION_SECS", 900)?,
            ),
            refresh_token_duration: Duration::from_secs(
                vars.parsed("REFRESH_TOKEN_DURATION_SECS", 86_400)?,
            ),
            environment: vars.or("ENVIRONMENT", "development"),
            log_level: vars.or("LOG_LEVEL", "info"),
            db_max_connections,
            tx_timeout: vars
                .optional_parsed::<u64>("TX_TIMEOUT_MS")?
                .map(Duration::from_millis),
            worker_concurrency: vars.parsed("WORKER_CONCURRENCY", 10)?,
            queue_namespace: vars.or("QUEUE_NAMESPACE", "ledgerline"),
            verify_email_base_url: vars.or("VERIFY_EMAIL_BASE_URL", "http://localhost:8080"),
            email_sender_name: vars.or("EMAIL_SENDER_NAME", "Ledgerline"),
            email_sender_address: vars.or("EMAIL_SENDER_ADDRESS", "no-reply@ledgerline.local"),
        })
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Coordinator over `store` with `TX_TIMEOUT_MS` applied.
    pub fn coordinator<S: Store>(&self, store: S) -> Coordinator<S> {
        let coordinator = Coordinator::new(store);
        match self.tx_timeout {
            Some(deadline) => coordinator.with_deadline(deadline),
            None => coordinator,
        }
    }

    /// Login and token renewal over `store`. Needs `TOKEN_SYMMETRIC_KEY`.
    pub fn session_service<S: Store>(&self, store: S) -> Result<SessionService<S>, ConfigError> {
        let key = self
            .token_symmetric_key
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("TOKEN_SYMMETRIC_KEY".into()))?;
        let maker = JwtMaker::new(key).map_err(|e| ConfigError::InvalidValue {
            key: "TOKEN_SYMMETRIC_KEY".into(),
            message: e.to_string(),
        })?;

        Ok(SessionService::new(
            store,
            Arc::new(maker),
            chrono_duration("ACCESS_TOKEN_DURATION_SECS", self.access_token_duration)?,
            chrono_duration("REFRESH_TOKEN_DURATION_SECS", self.refresh_token_duration)?,
        ))
    }
}

fn chrono_duration(key: &str, duration: Duration) -> Result<chrono::Duration, ConfigError> {
    chrono::Duration::from_std(duration).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.trim().is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn optional_parsed<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()
    }

    fn parsed<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.optional_parsed(key)?.unwrap_or(default))
    }
}
