//! JSON API over the ingestion pipeline and business store.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bizsync_storage::StoreError;
use bizsync_sync::{IngestPipeline, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestPipeline>,
}

impl AppState {
    pub fn new(pipeline: IngestPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct SearchParams {
    term: Option<String>,
    location: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ListParams {
    limit: Option<u32>,
    offset: Option<u32>,
    search: Option<String>,
}

#[derive(Serialize)]
struct Success<T> {
    success: bool,
    #[serde(flatten)]
    body: T,
}

fn success<T: Serialize>(body: T) -> Json<Success<T>> {
    Json(Success {
        success: true,
        body,
    })
}

/// Error response carrying a machine-readable kind.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn not_found(message: String) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: "not_found",
            message,
        }
    }

    fn from_kind(kind: &'static str, message: String) -> Self {
        let status = match kind {
            "validation" => StatusCode::BAD_REQUEST,
            "constraint" => StatusCode::CONFLICT,
            "upstream" => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            kind,
            message,
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        Self::from_kind(err.kind(), err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::from_kind(err.kind().as_str(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(kind = self.kind, message = %self.message, "request failed");
        }
        let body = json!({
            "error": true,
            "kind": self.kind,
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/search", get(search_handler))
        .route("/businesses", get(list_handler))
        .route("/businesses/{external_id}", get(business_handler))
        .route("/duplicates", get(duplicates_handler))
        .route("/duplicates/clean", post(clean_duplicates_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let schema_version = state.pipeline.store().schema_version().await?;
    Ok(success(json!({ "status": "ok", "schema_version": schema_version })).into_response())
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Result<Response, ApiError> {
    let result = state
        .pipeline
        .search_and_ingest(
            params.term.as_deref().unwrap_or_default(),
            params.location.as_deref().unwrap_or_default(),
            params.limit,
            params.offset,
        )
        .await?;
    Ok(success(result).into_response())
}

async fn list_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Response, ApiError> {
    let page = state
        .pipeline
        .list_businesses(params.limit, params.offset, params.search.as_deref())
        .await?;
    Ok(success(page).into_response())
}

async fn business_handler(
    State(state): State<Arc<AppState>>,
    Path(external_id): Path<String>,
) -> Result<Response, ApiError> {
    match state.pipeline.store().get(&external_id).await? {
        Some(business) => Ok(success(json!({ "business": business })).into_response()),
        None => Err(ApiError::not_found(format!(
            "no business with external id {external_id:?}"
        ))),
    }
}

async fn duplicates_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let report = state.pipeline.store().detect_duplicates().await?;
    Ok(success(json!({ "report": report })).into_response())
}

async fn clean_duplicates_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let store = state.pipeline.store();
    let removed = store.reconcile_duplicates().await?;
    let report = store.detect_duplicates().await?;
    info!(removed, "duplicate rows removed");
    Ok(success(json!({ "removed": removed, "report": report })).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use bizsync_sync::{build_fixture_pipeline, build_pipeline, AppConfig};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::path::PathBuf;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    fn config(dir: &TempDir) -> AppConfig {
        AppConfig {
            database_url: format!("sqlite://{}", dir.path().join("businesses.db").display()),
            ..AppConfig::default()
        }
    }

    async fn fixture_app(dir: &TempDir) -> Router {
        let fixture = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/yelp/sample_search.json");
        let pipeline = build_fixture_pipeline(config(dir), fixture)
            .await
            .expect("pipeline");
        app(AppState::new(pipeline))
    }

    async fn send(app: &Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let status = resp.status();
        let body = resp.into_body().collect().await.expect("body").to_bytes();
        (status, serde_json::from_slice(&body).expect("json body"))
    }

    #[tokio::test]
    async fn health_reports_schema_version() {
        let dir = tempdir().expect("tempdir");
        let app = fixture_app(&dir).await;
        let (status, body) = send(&app, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["schema_version"], bizsync_storage::SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn search_ingests_and_listing_reads_back() {
        let dir = tempdir().expect("tempdir");
        let app = fixture_app(&dir).await;

        let (status, body) = send(&app, "GET", "/search?term=coffee&location=Paris&limit=3").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["report"]["inserted"], 3);
        assert_eq!(body["pagination"]["limit"], 3);
        assert_eq!(body["pagination"]["has_next"], true);

        let (status, body) = send(&app, "GET", "/businesses?search=main").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pagination"]["total"], 2);
        assert_eq!(body["search_term"], "main");

        let (status, body) = send(&app, "GET", "/businesses/cafe-luna-paris").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["business"]["name"], "Cafe Luna");
        assert_eq!(body["business"]["ingest_count"], 1);
    }

    #[tokio::test]
    async fn blank_search_parameters_are_a_validation_error() {
        let dir = tempdir().expect("tempdir");
        let app = fixture_app(&dir).await;
        let (status, body) = send(&app, "GET", "/search?term=&location=Paris").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], true);
        assert_eq!(body["kind"], "validation");
    }

    #[tokio::test]
    async fn unconfigured_provider_maps_to_bad_gateway() {
        let dir = tempdir().expect("tempdir");
        let pipeline = build_pipeline(config(&dir)).await.expect("pipeline");
        let app = app(AppState::new(pipeline));
        let (status, body) = send(&app, "GET", "/search?term=coffee&location=Paris").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["kind"], "upstream");
    }

    #[tokio::test]
    async fn unknown_business_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let app = fixture_app(&dir).await;
        let (status, body) = send(&app, "GET", "/businesses/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");
    }

    #[tokio::test]
    async fn duplicate_endpoints_report_and_clean() {
        let dir = tempdir().expect("tempdir");
        let app = fixture_app(&dir).await;
        send(&app, "GET", "/search?term=coffee&location=Paris").await;

        let (status, body) = send(&app, "GET", "/duplicates").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["report"]["total_rows"], 4);
        assert_eq!(body["report"]["integrity_ok"], true);
        assert_eq!(body["report"]["identity_constraint_installed"], true);

        let (status, body) = send(&app, "POST", "/duplicates/clean").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed"], 0);
    }
}
