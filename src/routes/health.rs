use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::services::rate_limit::RateLimiterStats;
use crate::services::stats::DispatchStats;
use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
    pub dispatch: DispatchHealth,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchHealth {
    pub rate_limiter: RateLimiterStats,
    pub in_flight_sends: usize,
    pub max_concurrent_sends: usize,
    pub background_tasks: usize,
    pub stats: DispatchStats,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let worker = state.coordinator.worker();
    let response = HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        dispatch: DispatchHealth {
            rate_limiter: worker.bucket().snapshot(),
            in_flight_sends: worker.executor().in_flight(),
            max_concurrent_sends: worker.executor().max_concurrent(),
            background_tasks: state.coordinator.background_tasks(),
            stats: state.stats.snapshot(),
        },
    };

    (StatusCode::OK, Json(response))
}
