//! Ingestion runs: survey reconciliation, weather snapshots, write policies and
//! the scheduled job runner.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use agri_adapters::{OpenWeatherClient, SchemaError, WeatherApiConfig};
use agri_core::{AgriculturalUnit, AgriculturalUnitSurvey, Record, Weather};
use agri_storage::{
    connect_pool, ArchiveFetcher, ArchiveFetcherConfig, FetchError, PgStore, RecordStore,
    StoreError,
};
use anyhow::Context;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

pub mod config;
pub mod reconcile;
pub mod scheduler;
pub mod weather;

pub use config::{AppConfig, ConfigError, DatabaseConfig};
pub use reconcile::{reconcile, ReconcileOutcome, SurveyIngestSummary, SurveyIngestion};
pub use scheduler::{build_scheduler, load_jobs, run_job, ScheduledJob};
pub use weather::{WeatherIngestSummary, WeatherIngestion};

pub const CRATE_NAME: &str = "agri-sync";

/// How survey reconciliation detects surveys it has already seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SurveyDedup {
    /// Only surveys loaded from the store count. Two rows with the same
    /// `(IDNum, Year)` in one extract both become new surveys.
    #[default]
    ExistingOnly,
    /// Surveys queued earlier in the same run count as well.
    WithinRun,
}

/// What a weather run does with a unit's previous snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WeatherSnapshots {
    /// Every run writes a new snapshot row per unit.
    #[default]
    Append,
    /// The newest snapshot of each unit is overwritten in place.
    LatestPerUnit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {setting} '{value}', expected one of: {expected}")]
pub struct UnknownSetting {
    pub setting: &'static str,
    pub value: String,
    pub expected: &'static str,
}

impl FromStr for SurveyDedup {
    type Err = UnknownSetting;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "existing-only" => Ok(Self::ExistingOnly),
            "within-run" => Ok(Self::WithinRun),
            _ => Err(UnknownSetting {
                setting: "survey dedup mode",
                value: value.to_string(),
                expected: "existing-only, within-run",
            }),
        }
    }
}

impl FromStr for WeatherSnapshots {
    type Err = UnknownSetting;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "append" => Ok(Self::Append),
            "latest-per-unit" => Ok(Self::LatestPerUnit),
            _ => Err(UnknownSetting {
                setting: "weather snapshot mode",
                value: value.to_string(),
                expected: "append, latest-per-unit",
            }),
        }
    }
}

/// Failure policy for a sequence of upserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WritePolicy {
    /// Stop at the first failed write and fail the run. Earlier writes stay.
    AbortOnFirstError,
    /// Log the failure, count it and move on to the next record.
    ContinueOnError,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteTally {
    pub written: usize,
    pub failed: usize,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to fetch csv survey: {0}")]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("failed to load {kind}: {source}")]
    Load {
        kind: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("failed to write {kind} {key}: {source}")]
    Write {
        kind: &'static str,
        key: String,
        #[source]
        source: StoreError,
    },
}

impl IngestError {
    pub(crate) fn load(kind: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| Self::Load { kind, source }
    }
}

/// Upserts `records` in order under `policy`. `describe` names a record in
/// logs and errors by its business key.
pub async fn persist_all<R, S, D>(
    store: &S,
    records: &[R],
    kind: &'static str,
    policy: WritePolicy,
    describe: D,
) -> Result<WriteTally, IngestError>
where
    R: Record,
    S: RecordStore<R> + ?Sized,
    D: Fn(&R) -> String,
{
    let mut tally = WriteTally::default();
    for record in records {
        match store.insert_or_update(record).await {
            Ok(()) => tally.written += 1,
            Err(source) => match policy {
                WritePolicy::AbortOnFirstError => {
                    return Err(IngestError::Write {
                        kind,
                        key: describe(record),
                        source,
                    });
                }
                WritePolicy::ContinueOnError => {
                    warn!(kind, key = %describe(record), error = %source, "write failed; continuing");
                    tally.failed += 1;
                }
            },
        }
    }
    Ok(tally)
}

/// The live service graph: PostgreSQL stores, archive fetcher and weather client.
#[derive(Clone)]
pub struct Services {
    pub surveys: Arc<SurveyIngestion>,
    pub weather: Arc<WeatherIngestion>,
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

impl Services {
    pub async fn connect(config: &AppConfig) -> anyhow::Result<Self> {
        let pool = connect_pool(&config.database.url(), config.database.max_connections)
            .await
            .with_context(|| {
                format!(
                    "connecting to postgres at {}:{}/{}",
                    config.database.host, config.database.port, config.database.name
                )
            })?;
        info!(host = %config.database.host, db = %config.database.name, "database pool ready");

        let units: Arc<dyn RecordStore<AgriculturalUnit>> = Arc::new(PgStore::new(pool.clone()));
        let surveys: Arc<dyn RecordStore<AgriculturalUnitSurvey>> =
            Arc::new(PgStore::new(pool.clone()));
        let snapshots: Arc<dyn RecordStore<Weather>> = Arc::new(PgStore::new(pool));

        let fetcher = ArchiveFetcher::new(ArchiveFetcherConfig {
            timeout: config.archive_timeout,
            verify_tls: config.archive_tls_verify,
            ..Default::default()
        })?;
        if !fetcher.verifies_tls() {
            warn!("archive downloads skip TLS certificate verification");
        }

        let weather_api = OpenWeatherClient::new(WeatherApiConfig {
            base_url: config.weather_api_url.clone(),
            api_key: config.weather_api_key.clone(),
            timeout: config.weather_timeout,
        })?;

        let survey_ingestion = SurveyIngestion::new(Arc::new(fetcher), units.clone(), surveys)
            .with_dedup(config.survey_dedup);
        let weather_ingestion = WeatherIngestion::new(Arc::new(weather_api), units, snapshots)
            .with_snapshots(config.weather_snapshots);

        Ok(Self {
            surveys: Arc::new(survey_ingestion),
            weather: Arc::new(weather_ingestion),
        })
    }
}

pub(crate) fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
