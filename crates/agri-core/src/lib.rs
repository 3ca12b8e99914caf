//! Core domain model for agricultural survey and weather ingestion.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod geo;

pub use geo::{BoundingBox, Coordinate, CoordinateGenerator};

pub const CRATE_NAME: &str = "agri-core";

/// Column holding the external unit identifier in survey extracts.
pub const ID_NUM_COLUMN: &str = "IDNUM";
/// Column holding the survey year in survey extracts.
pub const YEAR_COLUMN: &str = "MILEX";
/// Farm-type column used by the survey inclusion filter.
pub const FARM_TYPE_COLUMN: &str = "OTEFDD";
/// Only surveys with this farm-type code are ingested.
pub const INGESTED_FARM_TYPE: f64 = 1500.0;

/// Identity shared by every persisted record: stores upsert on this id.
pub trait Record: Clone + Send + Sync + 'static {
    fn id(&self) -> Uuid;
}

/// A farm observed in at least one survey extract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgriculturalUnit {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    pub id_num: i64,
    pub latitude: f64,
    pub longitude: f64,
}

impl AgriculturalUnit {
    pub fn create(id_num: i64, coordinate: Coordinate) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            archived_at: None,
            id_num,
            latitude: coordinate.latitude,
            longitude: coordinate.longitude,
        }
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

impl Record for AgriculturalUnit {
    fn id(&self) -> Uuid {
        self.id
    }
}

/// Natural key of a survey: one survey per unit and year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SurveyKey {
    pub id_num: i64,
    pub year: i64,
}

impl fmt::Display for SurveyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.id_num, self.year)
    }
}

/// A best-effort typed survey cell.
///
/// Serialized untagged, so a payload stores as a plain JSON object
/// (`{"OTEFDD": 1500.0, "BIO": true, "REGION": "Bretagne"}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SurveyValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl SurveyValue {
    /// Number first, then boolean, else the raw text.
    pub fn coerce(raw: &str) -> Self {
        if let Ok(number) = raw.parse::<f64>() {
            // NaN and infinities have no JSON form; keep their spelling.
            if number.is_finite() {
                return Self::Number(number);
            }
        }
        if let Some(flag) = parse_flag(raw) {
            return Self::Bool(flag);
        }
        Self::Text(raw.to_string())
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// Column name to typed cell. Keys are unique; iteration is alphabetical.
pub type SurveyPayload = BTreeMap<String, SurveyValue>;

/// One unit's survey answers for one year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgriculturalUnitSurvey {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    pub id_num: i64,
    pub year: i64,
    pub data: SurveyPayload,
}

impl AgriculturalUnitSurvey {
    pub fn create(key: SurveyKey, data: SurveyPayload) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            archived_at: None,
            id_num: key.id_num,
            year: key.year,
            data,
        }
    }

    pub fn key(&self) -> SurveyKey {
        SurveyKey {
            id_num: self.id_num,
            year: self.year,
        }
    }

    /// Inclusion filter for ingestion: the farm-type cell must be the number 1500.
    pub fn is_ingested_farm_type(data: &SurveyPayload) -> bool {
        data.get(FARM_TYPE_COLUMN)
            .and_then(SurveyValue::as_number)
            .is_some_and(|code| code == INGESTED_FARM_TYPE)
    }
}

impl Record for AgriculturalUnitSurvey {
    fn id(&self) -> Uuid {
        self.id
    }
}

/// Current conditions as reported by the weather API for one coordinate.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WeatherConditions {
    pub temperature: f64,
    pub humidity: i32,
    pub wind_speed: f64,
    pub clouds: i32,
    pub category: String,
    pub description: String,
}

/// Weather observed at a unit's coordinate during one ingestion run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Weather {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    pub latitude: f64,
    pub longitude: f64,
    pub temperature: f64,
    pub humidity: i32,
    pub wind_speed: f64,
    pub clouds: i32,
    pub weather_main: String,
    pub weather_desc: String,
    pub agricultural_unit_id: Uuid,
}

impl Weather {
    pub fn create(
        agricultural_unit_id: Uuid,
        coordinate: Coordinate,
        conditions: WeatherConditions,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            archived_at: None,
            latitude: coordinate.latitude,
            longitude: coordinate.longitude,
            temperature: conditions.temperature,
            humidity: conditions.humidity,
            wind_speed: conditions.wind_speed,
            clouds: conditions.clouds,
            weather_main: conditions.category,
            weather_desc: conditions.description,
            agricultural_unit_id,
        }
    }

    pub fn conditions(&self) -> WeatherConditions {
        WeatherConditions {
            temperature: self.temperature,
            humidity: self.humidity,
            wind_speed: self.wind_speed,
            clouds: self.clouds,
            category: self.weather_main.clone(),
            description: self.weather_desc.clone(),
        }
    }
}

impl Record for Weather {
    fn id(&self) -> Uuid {
        self.id
    }
}
