//! HTTP API for the ingest service
//!
//! - `GET /api/websocket/webcam` - producer WebSocket (binary JPEG frames in, alerts out)
//! - `GET /api/stream?streamId=webcam` - MJPEG live preview
//! - `GET /api/alerts` - recent alert history
//! - `GET /api/alerts/ws` - alert subscriber WebSocket
//! - `GET /api/alerts/events` - alert SSE stream
//! - `GET /api/status` - pipeline status
//! - `GET /hls/*` - HLS playlist and segments
//! - `GET /health`, `GET /metrics`

pub mod alerts;
pub mod events;
pub mod preview;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::ingest::handle_producer;
use crate::metrics::MetricsSnapshot;
use crate::session::{IngestPipeline, PipelineStatus};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// The ingest pipeline
    pub pipeline: Arc<IngestPipeline>,
    /// Service configuration
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(pipeline: Arc<IngestPipeline>, config: Arc<Config>) -> Self {
        Self { pipeline, config }
    }
}

/// Error body returned by API handlers
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Build the HTTP API router
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let hls_dir = state.config.transcode.output_dir.clone();

    Router::new()
        // Producer ingress
        .route("/api/websocket/webcam", get(producer_ws))
        // Live preview
        .route("/api/stream", get(preview::stream_preview))
        // Alerts
        .route("/api/alerts", get(alerts::list_alerts))
        .route("/api/alerts/ws", get(alerts::alerts_ws))
        .route("/api/alerts/events", get(events::alerts_events))
        // Status, health and metrics
        .route("/api/status", get(status_handler))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        // HLS output
        .nest_service("/hls", ServeDir::new(hls_dir))
        // Middleware
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Producer WebSocket upgrade
async fn producer_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let idle_timeout = Duration::from_secs(state.config.server.idle_timeout_seconds.max(1));
    ws.on_upgrade(move |socket| handle_producer(socket, state.pipeline, idle_timeout))
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

async fn status_handler(State(state): State<AppState>) -> Json<PipelineStatus> {
    Json(state.pipeline.status())
}

/// Metrics endpoint
async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.pipeline.metrics().snapshot())
}
