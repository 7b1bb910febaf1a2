//! JSON endpoints over the ingestion job controller.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use gamefeed_core::has_http_scheme;
use gamefeed_ingest::{JobController, StageError, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "gamefeed-web";

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<JobController>,
}

impl AppState {
    pub fn new(controller: Arc<JobController>) -> Self {
        Self { controller }
    }
}

#[derive(Debug, Serialize)]
struct StartResponse {
    started: bool,
}

#[derive(Debug, Deserialize)]
struct UrlRequest {
    url: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/jobs/start", post(start_handler))
        .route("/jobs/status", get(status_handler))
        .route("/jobs/last-run", get(last_run_handler))
        .route("/records/preview", post(preview_handler))
        .route("/records/from-url", post(create_from_url_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("GAMEFEED_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn start_handler(State(state): State<Arc<AppState>>) -> Json<StartResponse> {
    let started = state.controller.start();
    if !started {
        info!("start rejected, a run is already in progress");
    }
    Json(StartResponse { started })
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.controller.stats()).into_response()
}

async fn last_run_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.controller.last_run() {
        Some(report) => Json(report).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "no run has finished yet"),
    }
}

async fn preview_handler(State(state): State<Arc<AppState>>, Json(req): Json<UrlRequest>) -> Response {
    let url = req.url.trim();
    if !has_http_scheme(url) {
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, "url must start with http:// or https://");
    }

    match state.controller.pipeline().synthesis().preview(url).await {
        Ok(Some(candidate)) => Json(candidate).into_response(),
        Ok(None) => error_response(StatusCode::UNPROCESSABLE_ENTITY, NOTHING_SYNTHESIZED),
        Err(err) => stage_failure(url, err),
    }
}

/// Synthesizes and persists a record for one URL, outside any job run.
async fn create_from_url_handler(State(state): State<Arc<AppState>>, Json(req): Json<UrlRequest>) -> Response {
    let url = req.url.trim();
    if !has_http_scheme(url) {
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, "url must start with http:// or https://");
    }

    let pipeline = state.controller.pipeline();
    match pipeline.dedup().exists_by_url(url).await {
        Ok(true) => return error_response(StatusCode::CONFLICT, ALREADY_STORED),
        Ok(false) => {}
        Err(err) => {
            warn!(url, error = %err, "dedup lookup failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
        }
    }

    let created = pipeline
        .synthesis()
        .synthesize(url, |record| {
            info!(record_id = record.id, url = %record.url, "record created from url");
        })
        .await;
    match created {
        Ok(Some(record)) => (StatusCode::CREATED, Json(record)).into_response(),
        Ok(None) => error_response(StatusCode::UNPROCESSABLE_ENTITY, NOTHING_SYNTHESIZED),
        Err(StageError::Store(StoreError::DuplicateUrl(_))) => error_response(StatusCode::CONFLICT, ALREADY_STORED),
        Err(err) => stage_failure(url, err),
    }
}

const NOTHING_SYNTHESIZED: &str = "no record could be synthesized for this url";
const ALREADY_STORED: &str = "a record with this url already exists";

fn stage_failure(url: &str, err: StageError) -> Response {
    warn!(url, error = %err, "synthesis request failed");
    let status = match err {
        StageError::Timeout { .. } | StageError::Collaborator(_) => StatusCode::BAD_GATEWAY,
        StageError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
