// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Read-only market data surface: no control plane, no auth. Router
// construction (CORS layer, `Router::new().route(...).with_state(...)`)
// follows the teacher's original `api/rest.rs`.
// =============================================================================

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::instrument;

use crate::api::AppContext;

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/dashboard_data", get(dashboard_data))
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .layer(cors)
        .with_state(ctx)
}

/// One `ChartFrame` JSON object per line, one line per opportunity with a
/// non-empty cross-exchange join. Each frame is loaded and flushed as soon
/// as it's ready, so the response body never buffers more than one frame
/// in memory regardless of opportunity count.
#[instrument(skip(ctx))]
async fn dashboard_data(State(ctx): State<AppContext>) -> Response {
    let opportunities = ctx.opportunities.current();
    let root = std::path::PathBuf::from(&ctx.config.data_lake_path);

    let stream = crate::historical::dashboard_ndjson_stream(root, ctx.config.clone(), opportunities);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn health() -> StatusCode {
    StatusCode::OK
}

#[derive(Serialize)]
struct ExchangeStatusEntry {
    status: String,
    #[serde(rename = "lastQuoteAgeMs")]
    last_quote_age_ms: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    exchanges: std::collections::HashMap<String, ExchangeStatusEntry>,
    persistence_queue_depth: usize,
    realtime_queue_depth: usize,
    persistence_dropped: u64,
    realtime_dropped: u64,
    parquet_queue_depth: usize,
}

async fn status(State(ctx): State<AppContext>) -> Json<StatusResponse> {
    let now = chrono::Utc::now();
    let exchanges = ctx
        .orchestrator
        .health_snapshot()
        .into_iter()
        .map(|(exchange, health)| {
            let age_ms = health.last_quote_time.map(|t| (now - t).num_milliseconds());
            (
                exchange.as_str().to_string(),
                ExchangeStatusEntry {
                    status: health.status.to_string(),
                    last_quote_age_ms: age_ms,
                },
            )
        })
        .collect();

    Json(StatusResponse {
        exchanges,
        persistence_queue_depth: ctx.orchestrator.persistence_tx.queue_depth(),
        realtime_queue_depth: ctx.orchestrator.realtime_tx.queue_depth(),
        persistence_dropped: ctx.orchestrator.persistence_tx.dropped_count(),
        realtime_dropped: ctx.orchestrator.realtime_tx.dropped_count(),
        parquet_queue_depth: ctx.writer.queue_depth(),
    })
}
