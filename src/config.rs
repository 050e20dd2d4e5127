use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::pipeline::PipelineOptions;
use crate::portal::Credentials;

const DEFAULT_DATABASE_URL: &str = "carwash.sqlite";
const DEFAULT_PORTAL_BASE_URL: &str = "https://www.mycryptopay.com";
const DEFAULT_SESSION_STATE_PATH: &str = "data/portal_session.json";

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub portal_base_url: String,
    pub session_state_path: PathBuf,
    pub fetch_timeout: Duration,
    pub fetch_max_retries: u32,
    pub fetch_retry_backoff: Duration,
    pub fetch_max_pages: Option<u32>,
    username: Option<String>,
    password: Option<String>,
}

impl Settings {
    /// Read settings from the process environment (after `.env` is loaded).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Ok(Self {
            database_url: get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            portal_base_url: get("PORTAL_BASE_URL").unwrap_or_else(|| DEFAULT_PORTAL_BASE_URL.to_string()),
            session_state_path: get("SESSION_STATE_PATH")
                .unwrap_or_else(|| DEFAULT_SESSION_STATE_PATH.to_string())
                .into(),
            fetch_timeout: Duration::from_secs(number(&get, "FETCH_TIMEOUT_SECS")?.unwrap_or(30)),
            fetch_max_retries: number(&get, "FETCH_MAX_RETRIES")?.unwrap_or(3),
            fetch_retry_backoff: Duration::from_millis(number(&get, "FETCH_RETRY_BACKOFF_MS")?.unwrap_or(2000)),
            fetch_max_pages: number(&get, "FETCH_MAX_PAGES")?,
            username: get("PORTAL_USERNAME"),
            password: get("PORTAL_PASSWORD"),
        })
    }

    /// Portal login; only required by stages that may log in.
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let username = self
            .username
            .clone()
            .ok_or(ConfigError::MissingField { field: "PORTAL_USERNAME" })?;
        let password = self
            .password
            .clone()
            .ok_or(ConfigError::MissingField { field: "PORTAL_PASSWORD" })?;
        Ok(Credentials { username, password })
    }

    pub fn pipeline_options(&self, incremental: bool, force_login: bool) -> PipelineOptions {
        PipelineOptions {
            call_timeout: self.fetch_timeout,
            max_retries: self.fetch_max_retries,
            retry_backoff: self.fetch_retry_backoff,
            incremental,
            force_login,
            max_pages: self.fetch_max_pages,
        }
    }
}

fn number<T, G>(get: &G, field: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(field) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|e: T::Err| ConfigError::InvalidValue {
            field,
            reason: format!("{raw:?}: {e}"),
        }),
    }
}
