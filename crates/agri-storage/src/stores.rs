//! Record stores: the `SelectAll` / `InsertOrUpdate` capability, an in-memory
//! implementation and PostgreSQL-backed ones.
//!
//! Every store upserts on the record's own generated `id`. Business keys
//! (`id_num`, `(id_num, year)`) are not constrained here, so a record recreated
//! with a fresh id is stored alongside the old one rather than replacing it.

use std::marker::PhantomData;

use agri_core::{AgriculturalUnit, AgriculturalUnitSurvey, Record, SurveyPayload, Weather};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage query failed: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("{kind} {id} could not be mapped to or from its stored row: {reason}")]
    Codec {
        kind: &'static str,
        id: Uuid,
        reason: String,
    },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait RecordStore<R: Record>: Send + Sync {
    async fn select_all(&self) -> Result<Vec<R>, StoreError>;

    /// Insert if the id is absent, else overwrite every non-key column.
    async fn insert_or_update(&self, record: &R) -> Result<(), StoreError>;
}

pub async fn connect_pool(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(database_url)
        .await?;
    Ok(pool)
}

#[derive(Debug)]
struct MemoryState<R> {
    records: Vec<R>,
    writes: usize,
    fail_writes_after: Option<usize>,
    fail_reads: bool,
}

/// Insertion-ordered store for tests and dry runs, with simple fault injection.
#[derive(Debug)]
pub struct MemoryStore<R> {
    state: Mutex<MemoryState<R>>,
}

impl<R: Record> Default for MemoryStore<R> {
    fn default() -> Self {
        Self::with_records(Vec::new())
    }
}

impl<R: Record> MemoryStore<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<R>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                records,
                writes: 0,
                fail_writes_after: None,
                fail_reads: false,
            }),
        }
    }

    /// Accept `n` successful writes, then fail every later one.
    pub fn fail_writes_after(mut self, n: usize) -> Self {
        self.state.get_mut().fail_writes_after = Some(n);
        self
    }

    pub fn fail_reads(mut self) -> Self {
        self.state.get_mut().fail_reads = true;
        self
    }

    pub async fn records(&self) -> Vec<R> {
        self.state.lock().await.records.clone()
    }

    /// Successful writes so far.
    pub async fn write_count(&self) -> usize {
        self.state.lock().await.writes
    }
}

#[async_trait]
impl<R: Record> RecordStore<R> for MemoryStore<R> {
    async fn select_all(&self) -> Result<Vec<R>, StoreError> {
        let state = self.state.lock().await;
        if state.fail_reads {
            return Err(StoreError::Unavailable("reads disabled".into()));
        }
        Ok(state.records.clone())
    }

    async fn insert_or_update(&self, record: &R) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.fail_writes_after.is_some_and(|limit| state.writes >= limit) {
            return Err(StoreError::Unavailable(format!(
                "write rejected after {} writes",
                state.writes
            )));
        }
        let existing = state.records.iter().position(|r| r.id() == record.id());
        match existing {
            Some(index) => state.records[index] = record.clone(),
            None => state.records.push(record.clone()),
        }
        state.writes += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct UnitRow {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
    pub id_num: i64,
    pub latitude: f64,
    pub longitude: f64,
}

impl From<&AgriculturalUnit> for UnitRow {
    fn from(unit: &AgriculturalUnit) -> Self {
        Self {
            id: unit.id,
            created_at: unit.created_at,
            updated_at: unit.updated_at,
            archived_at: unit.archived_at,
            id_num: unit.id_num,
            latitude: unit.latitude,
            longitude: unit.longitude,
        }
    }
}

impl From<UnitRow> for AgriculturalUnit {
    fn from(row: UnitRow) -> Self {
        Self {
            id: row.id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            archived_at: row.archived_at,
            id_num: row.id_num,
            latitude: row.latitude,
            longitude: row.longitude,
        }
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SurveyRow {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
    pub id_num: i64,
    pub year: i64,
    pub data: Option<serde_json::Value>,
}

impl TryFrom<&AgriculturalUnitSurvey> for SurveyRow {
    type Error = StoreError;

    fn try_from(survey: &AgriculturalUnitSurvey) -> Result<Self, Self::Error> {
        let data = serde_json::to_value(&survey.data).map_err(|err| StoreError::Codec {
            kind: "survey",
            id: survey.id,
            reason: err.to_string(),
        })?;
        Ok(Self {
            id: survey.id,
            created_at: survey.created_at,
            updated_at: survey.updated_at,
            archived_at: survey.archived_at,
            id_num: survey.id_num,
            year: survey.year,
            data: Some(data),
        })
    }
}

impl TryFrom<SurveyRow> for AgriculturalUnitSurvey {
    type Error = StoreError;

    fn try_from(row: SurveyRow) -> Result<Self, Self::Error> {
        let data = match row.data {
            Some(value) => {
                serde_json::from_value::<SurveyPayload>(value).map_err(|err| StoreError::Codec {
                    kind: "survey",
                    id: row.id,
                    reason: err.to_string(),
                })?
            }
            None => SurveyPayload::new(),
        };
        Ok(Self {
            id: row.id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            archived_at: row.archived_at,
            id_num: row.id_num,
            year: row.year,
            data,
        })
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct WeatherRow {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
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

impl From<&Weather> for WeatherRow {
    fn from(weather: &Weather) -> Self {
        Self {
            id: weather.id,
            created_at: weather.created_at,
            updated_at: weather.updated_at,
            archived_at: weather.archived_at,
            latitude: weather.latitude,
            longitude: weather.longitude,
            temperature: weather.temperature,
            humidity: weather.humidity,
            wind_speed: weather.wind_speed,
            clouds: weather.clouds,
            weather_main: weather.weather_main.clone(),
            weather_desc: weather.weather_desc.clone(),
            agricultural_unit_id: weather.agricultural_unit_id,
        }
    }
}

impl From<WeatherRow> for Weather {
    fn from(row: WeatherRow) -> Self {
        Self {
            id: row.id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            archived_at: row.archived_at,
            latitude: row.latitude,
            longitude: row.longitude,
            temperature: row.temperature,
            humidity: row.humidity,
            wind_speed: row.wind_speed,
            clouds: row.clouds,
            weather_main: row.weather_main,
            weather_desc: row.weather_desc,
            agricultural_unit_id: row.agricultural_unit_id,
        }
    }
}

/// PostgreSQL store over a pool; `R` fixes which table it serves.
#[derive(Debug, Clone)]
pub struct PgStore<R> {
    pool: PgPool,
    _record: PhantomData<fn() -> R>,
}

impl<R> PgStore<R> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _record: PhantomData,
        }
    }
}

pub type PgUnitStore = PgStore<AgriculturalUnit>;
pub type PgSurveyStore = PgStore<AgriculturalUnitSurvey>;
pub type PgWeatherStore = PgStore<Weather>;

#[async_trait]
impl RecordStore<AgriculturalUnit> for PgStore<AgriculturalUnit> {
    async fn select_all(&self) -> Result<Vec<AgriculturalUnit>, StoreError> {
        let rows = sqlx::query_as::<_, UnitRow>(
            r#"
            SELECT id, created_at, updated_at, archived_at, id_num, latitude, longitude
              FROM agricultural_units
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(AgriculturalUnit::from).collect())
    }

    async fn insert_or_update(&self, unit: &AgriculturalUnit) -> Result<(), StoreError> {
        let row = UnitRow::from(unit);
        sqlx::query(
            r#"
            INSERT INTO agricultural_units
                   (id, created_at, updated_at, archived_at, id_num, latitude, longitude)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                   updated_at = EXCLUDED.updated_at,
                   archived_at = EXCLUDED.archived_at,
                   id_num = EXCLUDED.id_num,
                   latitude = EXCLUDED.latitude,
                   longitude = EXCLUDED.longitude
            "#,
        )
        .bind(row.id)
        .bind(row.created_at)
        .bind(row.updated_at)
        .bind(row.archived_at)
        .bind(row.id_num)
        .bind(row.latitude)
        .bind(row.longitude)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore<AgriculturalUnitSurvey> for PgStore<AgriculturalUnitSurvey> {
    async fn select_all(&self) -> Result<Vec<AgriculturalUnitSurvey>, StoreError> {
        let rows = sqlx::query_as::<_, SurveyRow>(
            r#"
            SELECT id, created_at, updated_at, archived_at, id_num, year::BIGINT AS year, data
              FROM agricultural_unit_surveys
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AgriculturalUnitSurvey::try_from).collect()
    }

    async fn insert_or_update(&self, survey: &AgriculturalUnitSurvey) -> Result<(), StoreError> {
        let row = SurveyRow::try_from(survey)?;
        sqlx::query(
            r#"
            INSERT INTO agricultural_unit_surveys
                   (id, created_at, updated_at, archived_at, id_num, year, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                   updated_at = EXCLUDED.updated_at,
                   archived_at = EXCLUDED.archived_at,
                   id_num = EXCLUDED.id_num,
                   year = EXCLUDED.year,
                   data = EXCLUDED.data
            "#,
        )
        .bind(row.id)
        .bind(row.created_at)
        .bind(row.updated_at)
        .bind(row.archived_at)
        .bind(row.id_num)
        .bind(row.year)
        .bind(row.data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore<Weather> for PgStore<Weather> {
    async fn select_all(&self) -> Result<Vec<Weather>, StoreError> {
        let rows = sqlx::query_as::<_, WeatherRow>(
            r#"
            SELECT id, created_at, updated_at, archived_at, latitude, longitude,
                   temperature, humidity, wind_speed, clouds, weather_main,
                   weather_desc, agricultural_unit_id
              FROM weather
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Weather::from).collect())
    }

    async fn insert_or_update(&self, weather: &Weather) -> Result<(), StoreError> {
        let row = WeatherRow::from(weather);
        sqlx::query(
            r#"
            INSERT INTO weather
                   (id, created_at, updated_at, archived_at, latitude, longitude,
                    temperature, humidity, wind_speed, clouds, weather_main,
                    weather_desc, agricultural_unit_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                   updated_at = EXCLUDED.updated_at,
                   archived_at = EXCLUDED.archived_at,
                   latitude = EXCLUDED.latitude,
                   longitude = EXCLUDED.longitude,
                   temperature = EXCLUDED.temperature,
                   humidity = EXCLUDED.humidity,
                   wind_speed = EXCLUDED.wind_speed,
                   clouds = EXCLUDED.clouds,
                   weather_main = EXCLUDED.weather_main,
                   weather_desc = EXCLUDED.weather_desc,
                   agricultural_unit_id = EXCLUDED.agricultural_unit_id
            "#,
        )
        .bind(row.id)
        .bind(row.created_at)
        .bind(row.updated_at)
        .bind(row.archived_at)
        .bind(row.latitude)
        .bind(row.longitude)
        .bind(row.temperature)
        .bind(row.humidity)
        .bind(row.wind_speed)
        .bind(row.clouds)
        .bind(row.weather_main)
        .bind(row.weather_desc)
        .bind(row.agricultural_unit_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agri_core::{Coordinate, SurveyKey, SurveyValue, WeatherConditions};
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 11, hour, 0, 0).single().unwrap()
    }

    fn unit(id_num: i64) -> AgriculturalUnit {
        AgriculturalUnit::create(id_num, Coordinate { latitude: 45.76, longitude: 4.85 })
    }

    #[test]
    fn unit_row_round_trip_keeps_absent_archive_time() {
        let original = unit(42);
        let row = UnitRow::from(&original);
        assert_eq!(row.archived_at, None);
        assert_eq!(AgriculturalUnit::from(row), original);
    }

    #[test]
    fn unit_row_round_trip_keeps_archive_time() {
        let mut original = unit(7);
        original.created_at = ts(1);
        original.updated_at = ts(2);
        original.archived_at = Some(ts(3));
        assert_eq!(AgriculturalUnit::from(UnitRow::from(&original)), original);
    }

    #[test]
    fn survey_row_round_trip_preserves_typed_payload() {
        let mut data = SurveyPayload::new();
        data.insert("OTEFDD".into(), SurveyValue::Number(1500.0));
        data.insert("SAU".into(), SurveyValue::Number(87.25));
        data.insert("BIO".into(), SurveyValue::Bool(false));
        data.insert("REGION".into(), SurveyValue::Text("Occitanie".into()));
        let mut original = AgriculturalUnitSurvey::create(SurveyKey { id_num: 42, year: 2023 }, data);
        original.archived_at = Some(ts(4));

        let row = SurveyRow::try_from(&original).expect("encode");
        assert_eq!(
            row.data.as_ref().and_then(|d| d.get("OTEFDD")).cloned(),
            Some(serde_json::json!(1500.0))
        );
        let back = AgriculturalUnitSurvey::try_from(row).expect("decode");
        assert_eq!(back, original);
    }

    #[test]
    fn survey_row_with_null_payload_decodes_empty() {
        let row = SurveyRow {
            id: Uuid::new_v4(),
            created_at: ts(1),
            updated_at: ts(1),
            archived_at: None,
            id_num: 1,
            year: 2022,
            data: None,
        };
        let survey = AgriculturalUnitSurvey::try_from(row).expect("decode");
        assert!(survey.data.is_empty());
    }

    #[test]
    fn survey_row_with_nested_payload_is_a_codec_error() {
        let row = SurveyRow {
            id: Uuid::new_v4(),
            created_at: ts(1),
            updated_at: ts(1),
            archived_at: None,
            id_num: 1,
            year: 2022,
            data: Some(serde_json::json!({"OTEFDD": {"nested": 1}})),
        };
        let err = AgriculturalUnitSurvey::try_from(row).unwrap_err();
        assert!(matches!(err, StoreError::Codec { kind: "survey", .. }));
    }

    #[test]
    fn weather_row_round_trip() {
        let original = Weather::create(
            Uuid::new_v4(),
            Coordinate { latitude: -12.5, longitude: 130.25 },
            WeatherConditions {
                temperature: 31.4,
                humidity: 70,
                wind_speed: 2.25,
                clouds: 0,
                category: "Clear".into(),
                description: "clear sky".into(),
            },
        );
        assert_eq!(Weather::from(WeatherRow::from(&original)), original);
    }

    #[tokio::test]
    async fn memory_store_upserts_on_id() {
        let store = MemoryStore::new();
        let mut first = unit(42);
        store.insert_or_update(&first).await.expect("insert");
        first.latitude = 10.0;
        store.insert_or_update(&first).await.expect("update");

        let records = store.select_all().await.expect("select");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].latitude, 10.0);
        assert_eq!(store.write_count().await, 2);
    }

    #[tokio::test]
    async fn memory_store_keeps_business_key_duplicates_with_distinct_ids() {
        let store = MemoryStore::new();
        let key = SurveyKey { id_num: 42, year: 2023 };
        store
            .insert_or_update(&AgriculturalUnitSurvey::create(key, SurveyPayload::new()))
            .await
            .expect("first");
        store
            .insert_or_update(&AgriculturalUnitSurvey::create(key, SurveyPayload::new()))
            .await
            .expect("second");

        let records = store.select_all().await.expect("select");
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|s| s.key() == key));
    }

    #[tokio::test]
    async fn memory_store_fault_injection() {
        let store = MemoryStore::new().fail_writes_after(1);
        store.insert_or_update(&unit(1)).await.expect("first write allowed");
        let err = store.insert_or_update(&unit(2)).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.records().await.len(), 1);

        let unreadable = MemoryStore::<AgriculturalUnit>::new().fail_reads();
        assert!(unreadable.select_all().await.is_err());
    }
}
