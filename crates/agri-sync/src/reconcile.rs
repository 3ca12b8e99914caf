//! Survey reconciliation: compare a freshly fetched extract against the stored
//! units and surveys, and write what is new.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use agri_adapters::{SchemaError, SurveyTableLayout};
use agri_core::{AgriculturalUnit, AgriculturalUnitSurvey, CoordinateGenerator, SurveyKey};
use agri_storage::{ArchiveProvenance, RecordStore, TableSource};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{elapsed_ms, persist_all, IngestError, SurveyDedup, WritePolicy};

/// New records computed from one extract, in row order.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub new_units: Vec<AgriculturalUnit>,
    pub new_surveys: Vec<AgriculturalUnitSurvey>,
    pub rows_read: usize,
    pub rows_skipped: usize,
    pub surveys_filtered: usize,
}

/// Computes the units and surveys a table adds to the existing sets.
///
/// Row 0 is the header. A row whose identifier or year is not an integer is
/// skipped. A unit is created the first time an unknown identifier is seen,
/// even when that row's survey is then filtered out by farm type.
pub fn reconcile<R: Rng>(
    existing_units: &[AgriculturalUnit],
    existing_surveys: &[AgriculturalUnitSurvey],
    rows: &[Vec<String>],
    coordinates: &mut CoordinateGenerator<R>,
    dedup: SurveyDedup,
) -> Result<ReconcileOutcome, SchemaError> {
    let known_units: HashMap<i64, &AgriculturalUnit> =
        existing_units.iter().map(|u| (u.id_num, u)).collect();
    let mut known_surveys: HashSet<SurveyKey> =
        existing_surveys.iter().map(AgriculturalUnitSurvey::key).collect();

    let (layout, data) = SurveyTableLayout::split(rows)?;
    let mut outcome = ReconcileOutcome {
        rows_read: data.len(),
        ..Default::default()
    };
    let mut seen_ids: HashSet<i64> = HashSet::new();

    for (index, row) in data.iter().enumerate() {
        let line = index + 1;
        let key = match layout.key(row) {
            Ok(key) => key,
            Err(err) => {
                warn!(row = line, column = err.column, value = %err.value, "skipping row with invalid key");
                outcome.rows_skipped += 1;
                continue;
            }
        };

        if seen_ids.insert(key.id_num) && !known_units.contains_key(&key.id_num) {
            outcome
                .new_units
                .push(AgriculturalUnit::create(key.id_num, coordinates.generate_global()));
        }

        if known_surveys.contains(&key) {
            continue;
        }

        let payload = layout.payload(row);
        if !AgriculturalUnitSurvey::is_ingested_farm_type(&payload) {
            debug!(row = line, survey = %key, "survey filtered out by farm type");
            outcome.surveys_filtered += 1;
            continue;
        }

        if dedup == SurveyDedup::WithinRun {
            known_surveys.insert(key);
        }
        outcome.new_surveys.push(AgriculturalUnitSurvey::create(key, payload));
    }

    Ok(outcome)
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveSummary {
    pub url: String,
    pub member: String,
    pub sha256: String,
    pub bytes: u64,
}

impl From<ArchiveProvenance> for ArchiveSummary {
    fn from(p: ArchiveProvenance) -> Self {
        Self {
            url: p.url,
            member: p.member_name,
            sha256: p.sha256,
            bytes: p.byte_size,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SurveyIngestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub archive: ArchiveSummary,
    pub rows_read: usize,
    pub rows_skipped: usize,
    pub surveys_filtered: usize,
    pub new_units: usize,
    pub new_surveys: usize,
}

/// Survey ingestion service: loads state, fetches the extract, reconciles and
/// persists units then surveys, aborting on the first failed write.
pub struct SurveyIngestion {
    source: Arc<dyn TableSource>,
    units: Arc<dyn RecordStore<AgriculturalUnit>>,
    surveys: Arc<dyn RecordStore<AgriculturalUnitSurvey>>,
    coordinates: Mutex<CoordinateGenerator>,
    dedup: SurveyDedup,
}

impl SurveyIngestion {
    pub fn new(
        source: Arc<dyn TableSource>,
        units: Arc<dyn RecordStore<AgriculturalUnit>>,
        surveys: Arc<dyn RecordStore<AgriculturalUnitSurvey>>,
    ) -> Self {
        Self {
            source,
            units,
            surveys,
            coordinates: Mutex::new(CoordinateGenerator::seeded_from_clock()),
            dedup: SurveyDedup::default(),
        }
    }

    pub fn with_dedup(mut self, dedup: SurveyDedup) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn with_coordinates(mut self, coordinates: CoordinateGenerator) -> Self {
        self.coordinates = Mutex::new(coordinates);
        self
    }

    pub fn dedup(&self) -> SurveyDedup {
        self.dedup
    }

    pub async fn run(
        &self,
        zip_url: &str,
        csv_file_name: &str,
    ) -> Result<SurveyIngestSummary, IngestError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("survey_ingest", %run_id, zip_url, csv_file_name);
        self.run_inner(run_id, zip_url, csv_file_name)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        zip_url: &str,
        csv_file_name: &str,
    ) -> Result<SurveyIngestSummary, IngestError> {
        let started_at = Utc::now();
        let clock = Instant::now();

        let existing_units = self
            .units
            .select_all()
            .await
            .map_err(IngestError::load("agricultural units"))?;
        let existing_surveys = self
            .surveys
            .select_all()
            .await
            .map_err(IngestError::load("agricultural unit surveys"))?;
        info!(
            units = existing_units.len(),
            surveys = existing_surveys.len(),
            "loaded existing records"
        );

        let table = self
            .source
            .fetch_delimited_table(zip_url, csv_file_name)
            .await?;

        let outcome = {
            let mut coordinates = self.coordinates.lock().await;
            reconcile(
                &existing_units,
                &existing_surveys,
                &table.rows,
                &mut *coordinates,
                self.dedup,
            )?
        };

        persist_all(
            self.units.as_ref(),
            &outcome.new_units,
            "agricultural unit",
            WritePolicy::AbortOnFirstError,
            |u| u.id_num.to_string(),
        )
        .await?;
        persist_all(
            self.surveys.as_ref(),
            &outcome.new_surveys,
            "agricultural unit survey",
            WritePolicy::AbortOnFirstError,
            |s| s.key().to_string(),
        )
        .await?;

        let summary = SurveyIngestSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            duration_ms: elapsed_ms(clock.elapsed()),
            archive: table.provenance.into(),
            rows_read: outcome.rows_read,
            rows_skipped: outcome.rows_skipped,
            surveys_filtered: outcome.surveys_filtered,
            new_units: outcome.new_units.len(),
            new_surveys: outcome.new_surveys.len(),
        };
        info!(
            rows = summary.rows_read,
            skipped = summary.rows_skipped,
            filtered = summary.surveys_filtered,
            new_units = summary.new_units,
            new_surveys = summary.new_surveys,
            sha256 = %summary.archive.sha256,
            "survey ingestion complete"
        );
        Ok(summary)
    }
}
