//! Process configuration, read once from the environment at start-up.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::{SurveyDedup, WeatherSnapshots};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_SCHEDULER_CONFIG_PATH: &str = "/config/jobs.json";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value '{value}' for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode=disable",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("name", &self.name)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub weather_api_url: String,
    pub weather_api_key: String,
    pub port: u16,
    pub archive_tls_verify: bool,
    pub archive_timeout: Duration,
    pub weather_timeout: Duration,
    pub survey_dedup: SurveyDedup,
    pub weather_snapshots: WeatherSnapshots,
    pub scheduler_config_path: PathBuf,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(&lookup);
        Ok(Self {
            database: DatabaseConfig {
                host: env.required("DB_HOST")?,
                port: env.required_parsed("DB_PORT")?,
                user: env.required("DB_USER")?,
                password: env.required("DB_PASSWORD")?,
                name: env.required("DB_NAME")?,
                max_connections: env.parsed_or("DB_MAX_CONNECTIONS", 5)?,
            },
            weather_api_url: env.required("API_URL")?,
            weather_api_key: env.required("API_KEY")?,
            port: env.parsed_or("PORT", DEFAULT_PORT)?,
            archive_tls_verify: env.flag_or("ARCHIVE_TLS_VERIFY", false)?,
            archive_timeout: Duration::from_secs(env.parsed_or("ARCHIVE_HTTP_TIMEOUT_SECS", 600)?),
            weather_timeout: Duration::from_secs(env.parsed_or("WEATHER_HTTP_TIMEOUT_SECS", 20)?),
            survey_dedup: env.parsed_or("SURVEY_DEDUP", SurveyDedup::default())?,
            weather_snapshots: env.parsed_or("WEATHER_SNAPSHOTS", WeatherSnapshots::default())?,
            scheduler_config_path: scheduler_config_path(&lookup),
        })
    }
}

/// Job file location; the scheduler needs nothing else from the environment.
pub fn scheduler_config_path<F>(lookup: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    lookup("SCHEDULER_CONFIG_PATH")
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SCHEDULER_CONFIG_PATH))
}

struct Lookup<'a, F>(&'a F);

impl<F> Lookup<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.get(name).ok_or(ConfigError::Missing(name))
    }

    fn required_parsed<T>(&self, name: &'static str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self.required(name)?;
        parse(name, raw)
    }

    fn parsed_or<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(name) {
            Some(raw) => parse(name, raw),
            None => Ok(default),
        }
    }

    fn flag_or(&self, name: &'static str, default: bool) -> Result<bool, ConfigError> {
        let Some(raw) = self.get(name) else {
            return Ok(default);
        };
        match raw.trim() {
            "1" | "true" | "TRUE" | "True" | "yes" => Ok(true),
            "0" | "false" | "FALSE" | "False" | "no" => Ok(false),
            _ => Err(ConfigError::Invalid {
                name,
                value: raw,
                reason: "expected a boolean".into(),
            }),
        }
    }
}

fn parse<T>(name: &'static str, raw: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
        name,
        reason: err.to_string(),
        value: raw,
    })
}
