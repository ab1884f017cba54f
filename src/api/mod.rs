//! HTTP read API for the beacon.
//! Pulses by position and time, skip-list audit paths, certificates,
//! scheduler events and the live websocket feed.

pub mod events;
pub mod websocket;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::skiplist::SkipLayers;
use crate::storage::{PulseStore, StorageError};
use crate::types::{parse_timestamp, ByteHash, CertificateRecord, Pulse};
use events::EventLog;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<PulseStore>,
    pub events: EventLog,
}

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self { success: true, data: Some(data), error: None }
    }
}

impl ApiResponse<()> {
    pub fn err(msg: impl Into<String>) -> Self {
        Self { success: false, data: None, error: Some(msg.into()) }
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) | ApiError::Storage(StorageError::PulseNotFound { .. }) => {
                StatusCode::NOT_FOUND
            }
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Storage(e) => {
                error!("API storage failure: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ApiResponse::<()>::err(self.to_string()))).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn found<T: Serialize>(value: Option<T>, what: impl FnOnce() -> String) -> ApiResult<T> {
    value
        .map(|v| Json(ApiResponse::ok(v)))
        .ok_or_else(|| ApiError::NotFound(what()))
}

fn timestamp_param(raw: &str) -> Result<chrono::DateTime<chrono::Utc>, ApiError> {
    parse_timestamp(raw).map_err(|e| ApiError::BadRequest(format!("invalid timestamp {}: {}", raw, e)))
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Pulses
        .route("/pulse/last", get(get_last_pulse))
        .route("/pulse/time/next/:ts", get(get_pulse_after))
        .route("/pulse/time/previous/:ts", get(get_pulse_before))
        .route("/pulse/time/:ts", get(get_pulse_at))
        .route("/chain/:chain/pulse/last", get(get_last_pulse_in_chain))
        .route("/chain/:chain/pulse/:pulse", get(get_pulse))
        // Audit paths
        .route("/chain/:chain/skiplist/:from/:to", get(get_skiplist))
        .route("/skiplist/time/:from/:to", get(get_skiplist_by_time))
        // Certificates
        .route("/certificate/:id", get(get_certificate))
        // Activity
        .route("/events", get(get_events))
        .route("/ws", get(websocket::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("Beacon node is alive"))
}

async fn get_last_pulse(State(state): State<AppState>) -> ApiResult<Pulse> {
    found(state.store.latest()?, || "No pulses yet".into())
}

async fn get_pulse_at(State(state): State<AppState>, Path(ts): Path<String>) -> ApiResult<Pulse> {
    let ts = timestamp_param(&ts)?;
    found(state.store.at(&ts)?, || "No pulse at or before that time".into())
}

async fn get_pulse_after(State(state): State<AppState>, Path(ts): Path<String>) -> ApiResult<Pulse> {
    let ts = timestamp_param(&ts)?;
    found(state.store.after(&ts)?, || "No pulse after that time".into())
}

async fn get_pulse_before(State(state): State<AppState>, Path(ts): Path<String>) -> ApiResult<Pulse> {
    let ts = timestamp_param(&ts)?;
    found(state.store.before(&ts)?, || "No pulse before that time".into())
}

async fn get_pulse(
    State(state): State<AppState>,
    Path((chain, pulse)): Path<(u64, u64)>,
) -> ApiResult<Pulse> {
    found(state.store.get(chain, pulse)?, || {
        format!("Pulse {} of chain {} not found", pulse, chain)
    })
}

async fn get_last_pulse_in_chain(
    State(state): State<AppState>,
    Path(chain): Path<u64>,
) -> ApiResult<Pulse> {
    found(state.store.latest_in_chain(chain)?, || format!("Chain {} not found", chain))
}

/// Pulses along the audit path from `from` to `to`, both included.
fn skiplist_segment(store: &PulseStore, chain: u64, from: u64, to: u64) -> Result<Vec<Pulse>, ApiError> {
    if from > to {
        return Err(ApiError::BadRequest(format!("Skip list start {} is after end {}", from, to)));
    }
    let dst = store
        .get(chain, to)?
        .ok_or_else(|| ApiError::NotFound(format!("Pulse {} of chain {} not found", to, chain)))?;
    if from == to {
        return Ok(vec![dst]);
    }

    let layers = SkipLayers::new(dst.skip_list_layer_size, dst.skip_list_num_layers)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let path = layers
        .path(from, to)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(store.pulses_in_chain(chain, &path)?)
}

async fn get_skiplist(
    State(state): State<AppState>,
    Path((chain, from, to)): Path<(u64, u64, u64)>,
) -> ApiResult<Vec<Pulse>> {
    Ok(Json(ApiResponse::ok(skiplist_segment(&state.store, chain, from, to)?)))
}

async fn get_skiplist_by_time(
    State(state): State<AppState>,
    Path((from, to)): Path<(String, String)>,
) -> ApiResult<Vec<Pulse>> {
    let from_ts = timestamp_param(&from)?;
    let to_ts = timestamp_param(&to)?;
    let src = state
        .store
        .at(&from_ts)?
        .ok_or_else(|| ApiError::NotFound(format!("No pulse at or before {}", from)))?;
    let dst = state
        .store
        .at(&to_ts)?
        .ok_or_else(|| ApiError::NotFound(format!("No pulse at or before {}", to)))?;
    if src.chain_index != dst.chain_index {
        return Err(ApiError::BadRequest(format!(
            "Skip list ends lie on chains {} and {}",
            src.chain_index, dst.chain_index
        )));
    }
    Ok(Json(ApiResponse::ok(skiplist_segment(
        &state.store,
        src.chain_index,
        src.pulse_index,
        dst.pulse_index,
    )?)))
}

async fn get_certificate(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<CertificateRecord> {
    let id = ByteHash::from_hex(&id)
        .map_err(|e| ApiError::BadRequest(format!("invalid certificate id: {}", e)))?;
    found(state.store.certificate(&id)?, || "Certificate not found".into())
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    since: Option<u64>,
    limit: Option<usize>,
}

async fn get_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let events = match query.since {
        Some(since) => state.events.since(since).await,
        None => state.events.latest(query.limit.unwrap_or(50)).await,
    };
    Json(ApiResponse::ok(events))
}

/// Start the API server
pub async fn start_server(state: AppState, addr: &str) -> anyhow::Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("🌐 API server listening on {}", addr);
    axum::serve(listener, router).await?;

    Ok(())
}
