//! HTTP API for driving and observing search sessions.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/jobs` | All tracked jobs, oldest first |
//! | `POST` | `/jobs/{id}/cancel` | Request cooperative cancellation |
//! | `GET`  | `/jobs/stream` | Job snapshots over SSE |
//! | `POST` | `/search` | Start a search session as a background job |
//!
//! # Error Contract
//!
//! Error responses carry a machine-readable code and a message:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "variants must not be empty" } }
//! ```
//!
//! Codes: `bad_request` (400), `not_found` (404), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser dashboards
//! can poll `/jobs` and subscribe to `/jobs/stream` directly.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use crate::config::Config;
use crate::db;
use crate::embedder::create_embedder;
use crate::engine::{SearchEngine, SearchRequest};
use crate::jobs::{JobTrackingService, SqliteJobStore};
use crate::models::{DateWindow, SearchMode};
use crate::progress::NoProgress;
use crate::sessions::SqliteSessionStore;
use crate::source::HttpTweetSource;
use crate::store::SqliteTweetStore;

type ServerEngine = SearchEngine<HttpTweetSource, SqliteTweetStore, SqliteSessionStore>;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    engine: Arc<ServerEngine>,
    jobs: Arc<JobTrackingService>,
}

/// Starts the HTTP server on the configured bind address. Runs until the
/// process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;

    let source = HttpTweetSource::new(&config.source)?;
    let records = SqliteTweetStore::new(pool.clone());
    let sessions = SqliteSessionStore::new(pool.clone());
    let embedder = create_embedder(&config.embedding)?;

    let engine = Arc::new(SearchEngine::new(
        source,
        records,
        sessions,
        embedder,
        config.engine.clone(),
        config.source.page_size,
    ));

    let jobs = JobTrackingService::new(Arc::new(SqliteJobStore::new(pool)));
    jobs.initialize().await?;

    let state = AppState { engine, jobs };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/jobs", get(handle_list_jobs))
        .route("/jobs/{id}/cancel", post(handle_cancel_job))
        .route("/jobs/stream", get(handle_job_stream))
        .route("/search", post(handle_search))
        .layer(cors)
        .with_state(state);

    println!("server listening on http://{}", config.server.bind);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /jobs ============

async fn handle_list_jobs(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "jobs": state.jobs.get_all_jobs() }))
}

// ============ POST /jobs/{id}/cancel ============

#[derive(Serialize)]
struct CancelResponse {
    cancelled: bool,
}

/// Requests cancellation of a running job. `cancelled: false` means the
/// job exists but is no longer running.
async fn handle_cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, AppError> {
    if state.jobs.get_job(&id).is_none() {
        return Err(not_found(format!("no job with id: {}", id)));
    }
    let cancelled = state.jobs.cancel_job(&id).await;
    Ok(Json(CancelResponse { cancelled }))
}

// ============ GET /jobs/stream ============

/// Streams job-list snapshots as SSE. The first event is the current
/// snapshot; later events fire whenever any job changes.
async fn handle_job_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.jobs.subscribe();
    let initial = state.jobs.get_all_jobs();

    let first = tokio_stream::once(snapshot_event(&initial));
    let updates = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(jobs) => Some(snapshot_event(&jobs)),
        // A lagged receiver just waits for the next snapshot.
        Err(BroadcastStreamRecvError::Lagged(_)) => None,
    });

    Sse::new(first.chain(updates)).keep_alive(KeepAlive::default())
}

fn snapshot_event(jobs: &[crate::jobs::Job]) -> Result<Event, Infallible> {
    let event = Event::default()
        .event("jobs")
        .json_data(jobs)
        .unwrap_or_else(|_| Event::default().event("jobs").data("[]"));
    Ok(event)
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchBody {
    variants: Vec<String>,
    name: Option<String>,
    #[serde(default = "default_max_tweets")]
    max_tweets: u64,
    mode: Option<String>,
    since: Option<String>,
    until: Option<String>,
    #[serde(default)]
    embed: bool,
}

fn default_max_tweets() -> u64 {
    100
}

#[derive(Serialize)]
struct SearchAccepted {
    job_id: String,
}

/// Starts a search session in the background and returns the job id.
/// Progress and completion are observable via `/jobs` and `/jobs/stream`.
async fn handle_search(
    State(state): State<AppState>,
    Json(body): Json<SearchBody>,
) -> Result<(StatusCode, Json<SearchAccepted>), AppError> {
    if body.variants.iter().all(|v| v.trim().is_empty()) {
        return Err(bad_request("variants must not be empty"));
    }
    if body.max_tweets == 0 {
        return Err(bad_request("max_tweets must be greater than zero"));
    }

    let mode = match &body.mode {
        Some(m) => m
            .parse::<SearchMode>()
            .map_err(|e| bad_request(e.to_string()))?,
        None => SearchMode::Latest,
    };
    let dates = DateWindow {
        since: parse_date(body.since.as_deref())?,
        until: parse_date(body.until.as_deref())?,
    };

    let request = SearchRequest {
        variants: body
            .variants
            .iter()
            .filter(|v| !v.trim().is_empty())
            .map(|v| v.trim().to_string())
            .collect(),
        topic_name: body.name.clone(),
        max_tweets: body.max_tweets,
        mode,
        dates,
        embed: body.embed,
    };

    let metadata = serde_json::json!({
        "variants": request.variants,
        "max_tweets": request.max_tweets,
    });
    let ctx = state.jobs.create_job("search", Some(metadata)).await;
    let job_id = ctx.id().to_string();

    let engine = state.engine.clone();
    let jobs = state.jobs.clone();
    tokio::spawn(async move {
        let result = engine
            .start_search(request, Some(&ctx), &NoProgress)
            .await;
        match result {
            Ok(outcome) => {
                jobs.complete_job(ctx.id(), true, None).await;
                tracing::info!(
                    job = ctx.id(),
                    session = outcome.session_id,
                    collected = outcome.stats.collected,
                    "search job finished"
                );
            }
            Err(e) => {
                error!(job = ctx.id(), error = %e, "search job failed");
                jobs.complete_job(ctx.id(), false, Some(e.to_string())).await;
            }
        }
    });

    Ok((StatusCode::ACCEPTED, Json(SearchAccepted { job_id })))
}

fn parse_date(value: Option<&str>) -> Result<Option<NaiveDate>, AppError> {
    match value {
        None => Ok(None),
        Some(v) => NaiveDate::parse_from_str(v, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| bad_request(format!("invalid date '{}', expected YYYY-MM-DD", v))),
    }
}
