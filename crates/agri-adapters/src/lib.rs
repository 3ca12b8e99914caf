//! Adapters for external data shapes: survey extract layout and the weather API.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use agri_core::{
    Coordinate, SurveyKey, SurveyPayload, SurveyValue, WeatherConditions, ID_NUM_COLUMN,
    YEAR_COLUMN,
};
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "agri-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("survey table is empty: no header row")]
    MissingHeader,
    #[error("CSV header missing required column: {0}")]
    MissingColumn(&'static str),
}

/// A data row whose key cells do not parse as integers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {column} '{value}'")]
pub struct RowKeyError {
    pub column: &'static str,
    pub value: String,
}

/// Header-derived view over a survey extract.
#[derive(Debug, Clone)]
pub struct SurveyTableLayout {
    columns: HashMap<String, usize>,
    id_num_index: usize,
    year_index: usize,
}

impl SurveyTableLayout {
    /// Indexes the header. A repeated column name resolves to its last position.
    pub fn from_header(header: &[String]) -> Result<Self, SchemaError> {
        let columns: HashMap<String, usize> = header
            .iter()
            .enumerate()
            .map(|(index, name)| (name.clone(), index))
            .collect();

        let id_num_index = *columns
            .get(ID_NUM_COLUMN)
            .ok_or(SchemaError::MissingColumn(ID_NUM_COLUMN))?;
        let year_index = *columns
            .get(YEAR_COLUMN)
            .ok_or(SchemaError::MissingColumn(YEAR_COLUMN))?;

        Ok(Self {
            columns,
            id_num_index,
            year_index,
        })
    }

    /// Splits a full table into its layout and data rows.
    pub fn split(rows: &[Vec<String>]) -> Result<(Self, &[Vec<String>]), SchemaError> {
        let (header, data) = rows.split_first().ok_or(SchemaError::MissingHeader)?;
        Ok((Self::from_header(header)?, data))
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn key(&self, row: &[String]) -> Result<SurveyKey, RowKeyError> {
        let id_num = parse_cell(row, self.id_num_index, ID_NUM_COLUMN)?;
        let year = parse_cell(row, self.year_index, YEAR_COLUMN)?;
        Ok(SurveyKey { id_num, year })
    }

    /// Every named column mapped to its coerced cell.
    pub fn payload(&self, row: &[String]) -> SurveyPayload {
        self.columns
            .iter()
            .filter_map(|(name, &index)| {
                row.get(index)
                    .map(|cell| (name.clone(), SurveyValue::coerce(cell)))
            })
            .collect()
    }
}

fn parse_cell<T: std::str::FromStr>(
    row: &[String],
    index: usize,
    column: &'static str,
) -> Result<T, RowKeyError> {
    let raw = row.get(index).map(String::as_str).unwrap_or_default();
    raw.parse().map_err(|_| RowKeyError {
        column,
        value: raw.to_string(),
    })
}

#[derive(Debug, Error)]
pub enum WeatherApiError {
    #[error("weather api request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("weather api returned unexpected status {status}")]
    Status { status: u16 },
    #[error("weather api response could not be decoded: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Capability: current conditions at a coordinate.
#[async_trait]
pub trait WeatherApi: Send + Sync {
    async fn current_conditions(
        &self,
        coordinate: Coordinate,
    ) -> Result<WeatherConditions, WeatherApiError>;
}

#[derive(Debug, Clone)]
pub struct WeatherApiConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

/// OpenWeatherMap "current weather" client.
#[derive(Debug, Clone)]
pub struct OpenWeatherClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CurrentResponse {
    main: MainSection,
    wind: WindSection,
    clouds: CloudsSection,
    weather: Vec<WeatherSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MainSection {
    temp: f64,
    humidity: i32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WindSection {
    speed: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CloudsSection {
    all: i32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WeatherSection {
    main: String,
    description: String,
}

impl From<CurrentResponse> for WeatherConditions {
    fn from(response: CurrentResponse) -> Self {
        let (category, description) = response
            .weather
            .into_iter()
            .next()
            .map(|w| (w.main, w.description))
            .unwrap_or_default();
        Self {
            temperature: response.main.temp,
            humidity: response.main.humidity,
            wind_speed: response.wind.speed,
            clouds: response.clouds.all,
            category,
            description,
        }
    }
}

/// Decodes a current-weather body. Absent sections read as zero / empty.
pub fn parse_current_conditions(body: &[u8]) -> Result<WeatherConditions, WeatherApiError> {
    let response: CurrentResponse =
        serde_json::from_slice(body).map_err(WeatherApiError::Decode)?;
    Ok(response.into())
}

impl OpenWeatherClient {
    pub fn new(config: WeatherApiConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building weather api http client")?;
        Ok(Self {
            client,
            base_url: config.base_url,
            api_key: config.api_key,
        })
    }
}

#[async_trait]
impl WeatherApi for OpenWeatherClient {
    async fn current_conditions(
        &self,
        coordinate: Coordinate,
    ) -> Result<WeatherConditions, WeatherApiError> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("lat", format!("{:.6}", coordinate.latitude)),
                ("lon", format!("{:.6}", coordinate.longitude)),
                ("appid", self.api_key.clone()),
                ("units", "metric".to_string()),
            ])
            .send()
            .await
            .map_err(WeatherApiError::Request)?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(WeatherApiError::Status {
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(WeatherApiError::Request)?;
        debug!(bytes = body.len(), "weather api response received");
        parse_current_conditions(&body)
    }
}

/// Answers lookups from a fixed script, in call order. `None` entries answer
/// with a 503; an exhausted script answers 404.
#[derive(Debug, Default)]
pub struct ScriptedWeatherApi {
    script: Mutex<VecDeque<Option<WeatherConditions>>>,
    calls: Mutex<Vec<Coordinate>>,
}

impl ScriptedWeatherApi {
    pub fn new(script: impl IntoIterator<Item = Option<WeatherConditions>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub async fn calls(&self) -> Vec<Coordinate> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl WeatherApi for ScriptedWeatherApi {
    async fn current_conditions(
        &self,
        coordinate: Coordinate,
    ) -> Result<WeatherConditions, WeatherApiError> {
        self.calls.lock().await.push(coordinate);
        match self.script.lock().await.pop_front() {
            Some(Some(conditions)) => Ok(conditions),
            Some(None) => Err(WeatherApiError::Status { status: 503 }),
            None => Err(WeatherApiError::Status { status: 404 }),
        }
    }
}
