use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};

use crate::error::{AppError, AppResult};
use crate::services::dispatch::DispatchResult;
use crate::services::format::NotificationEvent;
use crate::services::signature;
use crate::AppState;

pub const TIMESTAMP_HEADER: &str = "x-dispatch-timestamp";
pub const SIGNATURE_HEADER: &str = "x-dispatch-signature";

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", post(trigger_dispatch))
}

fn extract_headers(headers: &HeaderMap) -> AppResult<(String, String)> {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or(AppError::Unauthorized)
    };
    Ok((get(TIMESTAMP_HEADER)?, get(SIGNATURE_HEADER)?))
}

/// Fan a "new message" event out to the recipient's devices. Answers 200 with
/// every outcome when delivery finishes in time, 202 otherwise.
async fn trigger_dispatch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<(StatusCode, Json<DispatchResult>)> {
    if let Some(secret) = state.config.trigger.signing_secret.as_deref() {
        let (timestamp, sig) = extract_headers(&headers)?;
        signature::verify_signature(secret, &timestamp, &body, &sig)?;
    }

    let event: NotificationEvent = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("Invalid payload: {}", e)))?;
    event.validate()?;

    tracing::info!(
        "Dispatch requested: recipient={} chat={} type={} target={:?}",
        event.recipient_id,
        event.chat_id,
        event.message_type,
        event.target_device_id
    );

    let result = state.coordinator.dispatch(&event).await?;
    let status = match result {
        DispatchResult::Delivering { .. } => StatusCode::ACCEPTED,
        DispatchResult::Completed { .. } => StatusCode::OK,
    };

    Ok((status, Json(result)))
}
