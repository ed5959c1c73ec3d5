//! Reporting HTTP API.
//!
//! Three read-only endpoints over the statistics collector. The public
//! stats endpoint is open; the recent-connections and server-info
//! endpoints require the configured API key when one is set.

use axum::{
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::stats::StatsCollector;

const DEFAULT_RECENT_LIMIT: i64 = 50;
const MAX_RECENT_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct ApiState {
    collector: Arc<StatsCollector>,
    api_key: Option<String>,
}

pub fn create_router(
    collector: Arc<StatsCollector>,
    api_key: Option<String>,
    cors_origins: &[String],
) -> Router {
    let state = ApiState { collector, api_key };

    Router::new()
        .route("/api/stats/public", get(public_stats))
        .route("/api/stats/recent", get(recent_connections))
        .route("/api/info", get(server_info))
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

/// Serve the router until the shutdown token fires.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Reporting API listening");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::new().allow_origin(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Skipping invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new().allow_origin(parsed)
}

fn authorized(state: &ApiState, headers: &HeaderMap) -> bool {
    match &state.api_key {
        None => true,
        Some(key) => headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok())
            .map(|value| value == key)
            .unwrap_or(false),
    }
}

async fn public_stats(State(state): State<ApiState>) -> Response {
    match state.collector.public_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => {
            warn!(error = %err, "Failed to compose public stats");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    limit: Option<i64>,
}

async fn recent_connections(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<RecentQuery>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let limit = query
        .limit
        .unwrap_or(DEFAULT_RECENT_LIMIT)
        .clamp(1, MAX_RECENT_LIMIT);

    match state.collector.store().recent_connections(limit).await {
        Ok(records) => Json(records).into_response(),
        Err(err) => {
            warn!(error = %err, "Failed to load recent connections");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn server_info(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let database_size_bytes = match state.collector.store().database_size_bytes().await {
        Ok(size) => size,
        Err(err) => {
            warn!(error = %err, "Failed to read database size");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let totals = match state.collector.store().server_totals().await {
        Ok(totals) => totals,
        Err(err) => {
            warn!(error = %err, "Failed to load server totals");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    Json(serde_json::json!({
        "start_time": totals.start_time,
        "total_connections": totals.total_connections,
        "active_connections": state.collector.active_connections(),
        "total_bytes_in": totals.total_bytes_in,
        "total_bytes_out": totals.total_bytes_out,
        "database_size_bytes": database_size_bytes,
        "updated_at": totals.updated_at,
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::StatsStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn collector() -> Arc<StatsCollector> {
        let store = StatsStore::connect("sqlite::memory:", 1).await.unwrap();
        store.init(chrono::Utc::now().timestamp()).await.unwrap();
        StatsCollector::new(store, None, 0)
    }

    #[tokio::test]
    async fn public_stats_is_open() {
        let router = create_router(collector().await, Some("secret".to_string()), &[]);
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/stats/public")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn recent_requires_api_key_when_configured() {
        let router = create_router(collector().await, Some("secret".to_string()), &[]);

        let denied = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/stats/recent")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let allowed = router
            .oneshot(
                Request::builder()
                    .uri("/api/stats/recent?limit=10")
                    .header("x-api-key", "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn info_reports_database_size() {
        let router = create_router(collector().await, None, &[]);
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/info")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value["database_size_bytes"].as_i64().unwrap() > 0);
    }
}
