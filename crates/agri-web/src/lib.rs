//! HTTP trigger surface for the ingestion runs.

use std::net::SocketAddr;
use std::sync::Arc;

use agri_sync::{IngestError, Services, SurveyIngestion, WeatherIngestion};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub const CRATE_NAME: &str = "agri-web";

#[derive(Clone)]
pub struct AppState {
    pub surveys: Arc<SurveyIngestion>,
    pub weather: Arc<WeatherIngestion>,
}

impl From<Services> for AppState {
    fn from(services: Services) -> Self {
        Self {
            surveys: services.surveys,
            weather: services.weather,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IngestSurveysRequest {
    #[serde(default)]
    zip_url: String,
    #[serde(default)]
    csv_file_name: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route(
            "/ingest/surveys",
            post(ingest_surveys_handler).fallback(method_not_allowed),
        )
        .route(
            "/ingest/weather",
            post(ingest_weather_handler).fallback(method_not_allowed),
        )
        .route("/health", get(|| async { "OK" }))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Serves until ctrl-c.
pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "trigger surface listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn ingest_surveys_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: IngestSurveysRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("Error reading JSON request body: {err}"),
            )
                .into_response()
        }
    };
    if request.zip_url.trim().is_empty() || request.csv_file_name.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            "Fields 'zipUrl' and 'csvFileName' are required.",
        )
            .into_response();
    }

    info!(zip_url = %request.zip_url, csv_file_name = %request.csv_file_name, "survey ingestion requested");
    match state
        .surveys
        .run(&request.zip_url, &request.csv_file_name)
        .await
    {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => ingestion_failed(err),
    }
}

async fn ingest_weather_handler(State(state): State<Arc<AppState>>) -> Response {
    info!("weather ingestion requested");
    match state.weather.run().await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => ingestion_failed(err),
    }
}

async fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        "Method not allowed. Only POST method is supported.",
    )
        .into_response()
}

fn ingestion_failed(err: IngestError) -> Response {
    error!(error = %err, "ingestion failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Error processing ingestion: {err}"),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use agri_adapters::ScriptedWeatherApi;
    use agri_core::{AgriculturalUnit, AgriculturalUnitSurvey, Coordinate, Weather, WeatherConditions};
    use agri_storage::{MemoryStore, StaticTableSource};
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct Fixture {
        units: Arc<MemoryStore<AgriculturalUnit>>,
        surveys: Arc<MemoryStore<AgriculturalUnitSurvey>>,
        snapshots: Arc<MemoryStore<Weather>>,
    }

    impl Fixture {
        fn new(units: MemoryStore<AgriculturalUnit>) -> Self {
            Self {
                units: Arc::new(units),
                surveys: Arc::new(MemoryStore::new()),
                snapshots: Arc::new(MemoryStore::new()),
            }
        }

        fn app(&self, source: StaticTableSource, api: ScriptedWeatherApi) -> Router {
            app(AppState {
                surveys: Arc::new(SurveyIngestion::new(
                    Arc::new(source),
                    self.units.clone(),
                    self.surveys.clone(),
                )),
                weather: Arc::new(WeatherIngestion::new(
                    Arc::new(api),
                    self.units.clone(),
                    self.snapshots.clone(),
                )),
            })
        }
    }

    fn csv_source() -> StaticTableSource {
        StaticTableSource::from_text("IDNUM;MILEX;OTEFDD\n42;2023;1500\n").expect("csv")
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn text(resp: Response) -> String {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn survey_trigger_runs_ingestion_and_returns_summary() {
        let fixture = Fixture::new(MemoryStore::new());
        let resp = fixture
            .app(csv_source(), ScriptedWeatherApi::default())
            .oneshot(post_json(
                "/ingest/surveys",
                r#"{"zipUrl": "https://example.org/rica.zip", "csvFileName": "rica.csv"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let summary: serde_json::Value = serde_json::from_str(&text(resp).await).unwrap();
        assert_eq!(summary["new_units"], 1);
        assert_eq!(summary["new_surveys"], 1);
        assert_eq!(summary["archive"]["url"], "https://example.org/rica.zip");
        assert_eq!(fixture.surveys.records().await.len(), 1);
    }

    #[tokio::test]
    async fn survey_trigger_rejects_bad_input() {
        let fixture = Fixture::new(MemoryStore::new());
        let app = fixture.app(csv_source(), ScriptedWeatherApi::default());

        let resp = app
            .clone()
            .oneshot(post_json("/ingest/surveys", "zipUrl=x"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(text(resp).await.starts_with("Error reading JSON request body"));

        let resp = app
            .oneshot(post_json("/ingest/surveys", r#"{"zipUrl": "https://example.org/rica.zip"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(text(resp).await, "Fields 'zipUrl' and 'csvFileName' are required.");
        assert_eq!(fixture.units.write_count().await, 0);
    }

    #[tokio::test]
    async fn survey_failure_is_a_500_with_the_error_text() {
        let fixture = Fixture::new(MemoryStore::new());
        let resp = fixture
            .app(StaticTableSource::missing_member(), ScriptedWeatherApi::default())
            .oneshot(post_json(
                "/ingest/surveys",
                r#"{"zipUrl": "https://example.org/rica.zip", "csvFileName": "absent.csv"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = text(resp).await;
        assert!(body.starts_with("Error processing ingestion: "));
        assert!(body.contains("absent.csv"));
    }

    #[tokio::test]
    async fn weather_trigger_accepts_bare_post() {
        let unit = AgriculturalUnit::create(7, Coordinate { latitude: 48.85, longitude: 2.35 });
        let fixture = Fixture::new(MemoryStore::with_records(vec![unit]));
        let api = ScriptedWeatherApi::new([Some(WeatherConditions::default())]);
        let resp = fixture
            .app(csv_source(), api)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ingest/weather")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let summary: serde_json::Value = serde_json::from_str(&text(resp).await).unwrap();
        assert_eq!(summary["written"], 1);
        assert_eq!(fixture.snapshots.records().await.len(), 1);
    }

    #[tokio::test]
    async fn weather_listing_failure_is_a_500() {
        let fixture = Fixture::new(MemoryStore::new().fail_reads());
        let resp = fixture
            .app(csv_source(), ScriptedWeatherApi::default())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ingest/weather")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn other_methods_are_rejected_and_health_answers() {
        let fixture = Fixture::new(MemoryStore::new());
        let app = fixture.app(csv_source(), ScriptedWeatherApi::default());

        for uri in ["/ingest/surveys", "/ingest/weather"] {
            let resp = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        }

        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(text(resp).await, "OK");
    }
}
