//! HTTP surface for a hosted fetch layer.

use crate::cache::CacheScope;
use crate::error::Result;
use crate::fetcher::ResilientFetcher;
use crate::metrics::MetricsService;
use crate::observability::request_id_middleware;
use crate::scheduler::Priority;
use crate::sources::SourceFetcher;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub fetcher: ResilientFetcher,
    pub sources: Arc<dyn SourceFetcher>,
    /// Prometheus exporter; `/metrics` answers 404 without one
    pub metrics: Option<MetricsService>,
}

impl AppState {
    pub fn new(fetcher: ResilientFetcher, sources: Arc<dyn SourceFetcher>) -> Self {
        Self {
            fetcher,
            sources,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsService) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/fetch/:key", get(fetch))
        .route("/circuits", get(list_circuits))
        .route("/circuits/:endpoint", get(get_circuit))
        .route("/circuits/:endpoint/open", post(open_circuit))
        .route("/circuits/:endpoint/close", post(close_circuit))
        .route("/circuits/:endpoint/reset", post(reset_circuit))
        .route("/stats", get(stats))
        .route("/stats/:endpoint", get(source_stats))
        .route("/metrics", get(prometheus_metrics))
        .route("/cache/stats", get(cache_stats))
        .route("/cache", delete(clear_cache))
        .route("/cache/:key", delete(invalidate_key))
        .route("/connectivity/restored", post(connectivity_restored))
        .with_state(state)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct FetchParams {
    /// Comma-separated source ids in fallback order
    sources: Option<String>,
    #[serde(default)]
    priority: Priority,
}

async fn fetch(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<FetchParams>,
) -> Result<Response> {
    let sources: Vec<String> = params
        .sources
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    debug!(key = %key, priority = %params.priority, sources = ?sources, "Fetch requested");
    let payload = state
        .fetcher
        .fetch(&key, params.priority, &sources, state.sources.clone())
        .await?;

    Ok(Json(payload).into_response())
}

async fn list_circuits(State(state): State<AppState>) -> Response {
    Json(state.fetcher.circuits().await).into_response()
}

async fn get_circuit(State(state): State<AppState>, Path(endpoint): Path<String>) -> Response {
    Json(state.fetcher.circuit_snapshot(&endpoint).await).into_response()
}

async fn open_circuit(State(state): State<AppState>, Path(endpoint): Path<String>) -> Response {
    info!(endpoint = %endpoint, "Admin forced circuit open");
    state.fetcher.force_open(&endpoint).await;
    Json(state.fetcher.circuit_snapshot(&endpoint).await).into_response()
}

async fn close_circuit(State(state): State<AppState>, Path(endpoint): Path<String>) -> Response {
    info!(endpoint = %endpoint, "Admin forced circuit closed");
    state.fetcher.force_close(&endpoint).await;
    Json(state.fetcher.circuit_snapshot(&endpoint).await).into_response()
}

async fn reset_circuit(State(state): State<AppState>, Path(endpoint): Path<String>) -> Response {
    info!(endpoint = %endpoint, "Admin reset circuit");
    state.fetcher.reset(&endpoint).await;
    Json(state.fetcher.circuit_snapshot(&endpoint).await).into_response()
}

async fn stats(State(state): State<AppState>) -> Response {
    Json(json!({
        "requests": state.fetcher.metrics(),
        "scheduler": state.fetcher.scheduler_stats(),
    }))
    .into_response()
}

async fn source_stats(State(state): State<AppState>, Path(endpoint): Path<String>) -> Response {
    match state.fetcher.source_stats(&endpoint) {
        Some(stats) => Json(stats).into_response(),
        None => not_found(format!("No statistics recorded for source '{}'", endpoint)),
    }
}

async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(metrics) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            metrics.render(),
        )
            .into_response(),
        None => not_found("Metrics exporter not installed".to_string()),
    }
}

async fn cache_stats(State(state): State<AppState>) -> Response {
    Json(state.fetcher.cache_stats()).into_response()
}

#[derive(Debug, Deserialize)]
struct ClearParams {
    pattern: Option<String>,
}

async fn clear_cache(
    State(state): State<AppState>,
    Query(params): Query<ClearParams>,
) -> Result<Response> {
    let scope = match params.pattern {
        Some(pattern) => CacheScope::Pattern(pattern),
        None => CacheScope::All,
    };
    let removed = state.fetcher.clear_cache(&scope)?;
    Ok(Json(json!({ "removed": removed })).into_response())
}

async fn invalidate_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response> {
    let removed = state.fetcher.clear_cache(&CacheScope::Key(key))?;
    Ok(Json(json!({ "removed": removed })).into_response())
}

async fn connectivity_restored(State(state): State<AppState>) -> Result<Response> {
    let report = state
        .fetcher
        .on_connectivity_restored(state.sources.clone())
        .await?;
    Ok(Json(report).into_response())
}

fn not_found(message: String) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": message, "status": 404 })),
    )
        .into_response()
}
