use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agri_adapters::{OpenWeatherClient, WeatherApiConfig};
use agri_core::{
    AgriculturalUnit, AgriculturalUnitSurvey, CoordinateGenerator, SurveyKey, SurveyValue, Weather,
};
use agri_storage::{ArchiveFetcher, ArchiveFetcherConfig, MemoryStore};
use agri_sync::{IngestError, SurveyDedup, SurveyIngestion, WeatherIngestion};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use zip::write::SimpleFileOptions;

fn fixture(rel: &str) -> Vec<u8> {
    let path: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(rel);
    std::fs::read(&path).unwrap_or_else(|err| panic!("reading {}: {err}", path.display()))
}

fn rica_archive() -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file("RICA_2023/rica_sample.csv", SimpleFileOptions::default())
        .expect("zip entry");
    writer
        .write_all(&fixture("agreste/rica_sample.csv"))
        .expect("zip body");
    writer.finish().expect("zip finish").into_inner()
}

async fn serve_upstreams() -> String {
    let archive = rica_archive();
    let weather = fixture("openweather/current_lyon.json");
    let app = Router::new()
        .route("/rica.zip", get(move || async move { archive.clone() }))
        .route(
            "/missing.zip",
            get(|| async { (StatusCode::NOT_FOUND, "gone") }),
        )
        .route("/weather", get(move || async move { weather.clone() }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move { axum::serve(listener, app).await });
    format!("http://{addr}")
}

fn fetcher() -> Arc<ArchiveFetcher> {
    Arc::new(
        ArchiveFetcher::new(ArchiveFetcherConfig {
            timeout: Duration::from_secs(10),
            ..Default::default()
        })
        .expect("fetcher"),
    )
}

#[tokio::test]
async fn archive_to_stores_then_weather_for_each_unit() {
    let base = serve_upstreams().await;
    let units = Arc::new(MemoryStore::<AgriculturalUnit>::new());
    let surveys = Arc::new(MemoryStore::<AgriculturalUnitSurvey>::new());
    let snapshots = Arc::new(MemoryStore::<Weather>::new());

    let ingestion = SurveyIngestion::new(fetcher(), units.clone(), surveys.clone())
        .with_coordinates(CoordinateGenerator::seeded(2023));
    let summary = ingestion
        .run(&format!("{base}/rica.zip"), "RICA_SAMPLE.CSV")
        .await
        .expect("survey ingestion");

    assert_eq!(summary.rows_read, 6);
    assert_eq!(summary.rows_skipped, 2);
    assert_eq!(summary.surveys_filtered, 1);
    assert_eq!(summary.new_units, 3);
    assert_eq!(summary.new_surveys, 3);
    assert_eq!(summary.archive.member, "RICA_2023/rica_sample.csv");
    assert_eq!(summary.archive.sha256.len(), 64);

    let mut ids: Vec<i64> = units.records().await.iter().map(|u| u.id_num).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1001, 1002, 1004]);

    let stored = surveys.records().await;
    let keys: Vec<SurveyKey> = stored.iter().map(AgriculturalUnitSurvey::key).collect();
    assert_eq!(
        keys,
        vec![
            SurveyKey { id_num: 1001, year: 2023 },
            SurveyKey { id_num: 1001, year: 2022 },
            SurveyKey { id_num: 1004, year: 2023 },
        ]
    );
    assert_eq!(stored[0].data["REGION"], SurveyValue::Text("Bretagne".into()));

    let rerun = ingestion
        .run(&format!("{base}/rica.zip"), "rica_sample.csv")
        .await
        .expect("second survey ingestion");
    assert_eq!(rerun.new_units, 0);
    assert_eq!(rerun.new_surveys, 0);

    let api = OpenWeatherClient::new(WeatherApiConfig {
        base_url: format!("{base}/weather"),
        api_key: "test".into(),
        timeout: Duration::from_secs(5),
    })
    .expect("weather client");
    let weather = WeatherIngestion::new(Arc::new(api), units.clone(), snapshots.clone());
    let summary = weather.run().await.expect("weather ingestion");

    assert_eq!(summary.units, 3);
    assert_eq!(summary.written, 3);
    let stored = snapshots.records().await;
    assert!(stored.iter().all(|w| w.weather_main == "Clouds" && w.humidity == 55));
}

#[tokio::test]
async fn within_run_dedup_applies_to_the_archive_path_too() {
    let base = serve_upstreams().await;
    let surveys = Arc::new(MemoryStore::<AgriculturalUnitSurvey>::new());
    let ingestion = SurveyIngestion::new(
        fetcher(),
        Arc::new(MemoryStore::<AgriculturalUnit>::new()),
        surveys.clone(),
    )
    .with_dedup(SurveyDedup::WithinRun);

    let summary = ingestion
        .run(&format!("{base}/rica.zip"), "rica_sample.csv")
        .await
        .expect("survey ingestion");
    assert_eq!(summary.new_surveys, 3);
}

#[tokio::test]
async fn download_failure_writes_nothing() {
    let base = serve_upstreams().await;
    let units = Arc::new(MemoryStore::<AgriculturalUnit>::new());
    let ingestion = SurveyIngestion::new(
        fetcher(),
        units.clone(),
        Arc::new(MemoryStore::<AgriculturalUnitSurvey>::new()),
    );

    let err = ingestion
        .run(&format!("{base}/missing.zip"), "rica_sample.csv")
        .await
        .unwrap_err();
    match err {
        IngestError::Fetch(fetch) => assert!(fetch.is_download()),
        other => panic!("unexpected error: {other}"),
    }

    let err = ingestion
        .run(&format!("{base}/rica.zip"), "other.csv")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("other.csv"));
    assert_eq!(units.write_count().await, 0);
}
