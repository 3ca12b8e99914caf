//! Weather ingestion: one snapshot per known unit per run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use agri_adapters::WeatherApi;
use agri_core::{AgriculturalUnit, Weather};
use agri_storage::RecordStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{elapsed_ms, persist_all, IngestError, WeatherSnapshots, WritePolicy};

#[derive(Debug, Clone, Serialize)]
pub struct WeatherIngestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub units: usize,
    pub fetched: usize,
    pub fetch_failures: usize,
    pub written: usize,
    pub write_failures: usize,
}

/// Fetches current conditions for every unit and upserts the snapshots.
/// Only the initial unit listing can fail the run.
pub struct WeatherIngestion {
    api: Arc<dyn WeatherApi>,
    units: Arc<dyn RecordStore<AgriculturalUnit>>,
    snapshots: Arc<dyn RecordStore<Weather>>,
    mode: WeatherSnapshots,
}

impl WeatherIngestion {
    pub fn new(
        api: Arc<dyn WeatherApi>,
        units: Arc<dyn RecordStore<AgriculturalUnit>>,
        snapshots: Arc<dyn RecordStore<Weather>>,
    ) -> Self {
        Self {
            api,
            units,
            snapshots,
            mode: WeatherSnapshots::default(),
        }
    }

    pub fn with_snapshots(mut self, mode: WeatherSnapshots) -> Self {
        self.mode = mode;
        self
    }

    pub fn snapshots_mode(&self) -> WeatherSnapshots {
        self.mode
    }

    pub async fn run(&self) -> Result<WeatherIngestSummary, IngestError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("weather_ingest", %run_id, mode = ?self.mode);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<WeatherIngestSummary, IngestError> {
        let started_at = Utc::now();
        let clock = Instant::now();

        let units = self
            .units
            .select_all()
            .await
            .map_err(IngestError::load("agricultural units"))?;

        let latest = match self.mode {
            WeatherSnapshots::Append => HashMap::new(),
            WeatherSnapshots::LatestPerUnit => match self.snapshots.select_all().await {
                Ok(existing) => latest_per_unit(existing),
                Err(error) => {
                    warn!(%error, "could not load existing snapshots; appending this run");
                    HashMap::new()
                }
            },
        };

        let mut snapshots = Vec::with_capacity(units.len());
        let mut fetch_failures = 0usize;
        for unit in &units {
            match self.api.current_conditions(unit.coordinate()).await {
                Ok(conditions) => {
                    let mut snapshot = Weather::create(unit.id, unit.coordinate(), conditions);
                    if let Some(previous) = latest.get(&unit.id) {
                        snapshot.id = previous.id;
                        snapshot.created_at = previous.created_at;
                    }
                    snapshots.push(snapshot);
                }
                Err(error) => {
                    warn!(unit_id = %unit.id, id_num = unit.id_num, %error, "weather lookup failed; skipping unit");
                    fetch_failures += 1;
                }
            }
        }

        let tally = persist_all(
            self.snapshots.as_ref(),
            &snapshots,
            "weather snapshot",
            WritePolicy::ContinueOnError,
            |w| format!("for unit {}", w.agricultural_unit_id),
        )
        .await?;

        let summary = WeatherIngestSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            duration_ms: elapsed_ms(clock.elapsed()),
            units: units.len(),
            fetched: snapshots.len(),
            fetch_failures,
            written: tally.written,
            write_failures: tally.failed,
        };
        info!(
            units = summary.units,
            fetched = summary.fetched,
            fetch_failures = summary.fetch_failures,
            written = summary.written,
            write_failures = summary.write_failures,
            "weather ingestion complete"
        );
        Ok(summary)
    }
}

fn latest_per_unit(existing: Vec<Weather>) -> HashMap<Uuid, Weather> {
    let mut latest: HashMap<Uuid, Weather> = HashMap::new();
    for snapshot in existing {
        let newer = latest
            .get(&snapshot.agricultural_unit_id)
            .map_or(true, |current| snapshot.created_at > current.created_at);
        if newer {
            latest.insert(snapshot.agricultural_unit_id, snapshot);
        }
    }
    latest
}
