//! HTTP front end of the event logging path
//!
//! - `GET /win`, `/impression`, `/click`, `/conversion` with the event fields
//!   and options as query parameters
//! - `GET /health`
//! - `GET /metrics` (Prometheus text format)

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use rtb_common::{Decision, EventContext, EventOptions};
use serde::Serialize;
use tracing::error;

use crate::{DispatchError, EventDispatcher};

/// Query parameters that describe the event rather than options
const EVENT_FIELDS: [&str; 6] = [
    "bid_id",
    "campaign_id",
    "creative_id",
    "exchange_id",
    "timestamp_bucket",
    "win_price",
];

/// Width of the default timestamp bucket, in seconds
const BUCKET_SECS: i64 = 60;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<EventDispatcher>,
    /// Present when a Prometheus recorder is installed
    pub prometheus: Option<PrometheusHandle>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct WinResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    pool: PoolResponse,
}

#[derive(Serialize)]
struct PoolResponse {
    name: String,
    max_count: usize,
    created: usize,
    available: usize,
    checked_out: usize,
}

enum ApiError {
    BadRequest(String),
    Dispatch(DispatchError),
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        ApiError::Dispatch(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Dispatch(e @ DispatchError::InvalidOption(_)) => (StatusCode::BAD_REQUEST, e.to_string()),
            ApiError::Dispatch(e @ DispatchError::NoWorkerAvailable(_))
            | ApiError::Dispatch(e @ DispatchError::ShuttingDown) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
            ApiError::Dispatch(e) => {
                error!(error = %e, "Event dispatch failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

/// Create the router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/win", get(win_handler))
        .route("/impression", get(impression_handler))
        .route("/click", get(click_handler))
        .route("/conversion", get(conversion_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn win_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let (context, options) = parse_event(&params)?;
    let win_price: f64 = required(&params, "win_price")?;
    let decision = state.dispatcher.log_win(context, win_price, options).await?;
    Ok(decision_response(decision))
}

async fn impression_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let (context, options) = parse_event(&params)?;
    let decision = state.dispatcher.log_impression(context, options).await?;
    Ok(decision_response(decision))
}

async fn click_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let (context, options) = parse_event(&params)?;
    let decision = state.dispatcher.log_click(context, options).await?;
    Ok(decision_response(decision))
}

/// Always succeeds, whatever the parameters.
async fn conversion_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> StatusCode {
    if let Ok((context, options)) = parse_event(&params) {
        state.dispatcher.log_conversion(&context, &options);
    }
    StatusCode::NO_CONTENT
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.dispatcher.pool_stats();
    Json(HealthResponse {
        status: "UP",
        version: env!("CARGO_PKG_VERSION"),
        pool: PoolResponse {
            name: stats.name,
            max_count: stats.max_count,
            created: stats.created,
            available: stats.available,
            checked_out: stats.checked_out,
        },
    })
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

fn decision_response(decision: Decision) -> Response {
    match decision {
        Decision::Successful => Json(WinResponse { status: "successful" }).into_response(),
        Decision::Html(markup) => Html(markup).into_response(),
        Decision::AssetPath(path) => (StatusCode::OK, path).into_response(),
        Decision::Redirect(url) => (StatusCode::FOUND, [(header::LOCATION, url)]).into_response(),
        Decision::NoContent => StatusCode::NO_CONTENT.into_response(),
    }
}

fn parse_event(params: &HashMap<String, String>) -> Result<(EventContext, EventOptions), ApiError> {
    let timestamp_bucket = match params.get("timestamp_bucket") {
        Some(_) => required(params, "timestamp_bucket")?,
        None => current_bucket(),
    };

    let context = EventContext {
        bid_id: required(params, "bid_id")?,
        campaign_id: required(params, "campaign_id")?,
        creative_id: required(params, "creative_id")?,
        timestamp_bucket,
        exchange_id: required(params, "exchange_id")?,
    };

    let options = EventOptions::from_pairs(
        params
            .iter()
            .filter(|(key, _)| !EVENT_FIELDS.contains(&key.as_str()))
            .map(|(key, value)| (key.as_str(), value.as_str())),
    )
    .map_err(DispatchError::from)?;

    Ok((context, options))
}

fn required<T: std::str::FromStr>(params: &HashMap<String, String>, key: &str) -> Result<T, ApiError> {
    let raw = params
        .get(key)
        .ok_or_else(|| ApiError::BadRequest(format!("missing query parameter: {}", key)))?;
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid value for {}: {}", key, raw)))
}

fn current_bucket() -> i64 {
    let now = chrono::Utc::now().timestamp();
    now - now.rem_euclid(BUCKET_SECS)
}
