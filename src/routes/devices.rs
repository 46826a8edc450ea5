use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};

use crate::db::{Device, DeviceRepository, RegisterDevice};
use crate::error::{AppError, AppResult};
use crate::AppState;

/// Device registration endpoints, nested under `/api/recipients`.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/:recipient_id/devices", get(list_devices))
        .route(
            "/:recipient_id/devices/:device_id",
            put(register_device).delete(delete_device),
        )
}

async fn list_devices(
    State(state): State<Arc<AppState>>,
    Path(recipient_id): Path<String>,
) -> AppResult<Json<Vec<Device>>> {
    let devices = DeviceRepository::list_for_recipient(&state.db, &recipient_id).await?;

    if devices.is_empty() && !DeviceRepository::recipient_exists(&state.db, &recipient_id).await? {
        return Err(AppError::NotFound(format!("Recipient {} not found", recipient_id)));
    }

    Ok(Json(devices))
}

/// Create or refresh a device registration. The recipient is created on its
/// first registration.
async fn register_device(
    State(state): State<Arc<AppState>>,
    Path((recipient_id, device_id)): Path<(String, String)>,
    Json(mut body): Json<RegisterDevice>,
) -> AppResult<Json<Device>> {
    if recipient_id.trim().is_empty() || device_id.trim().is_empty() {
        return Err(AppError::Validation(
            "recipientId and deviceId must not be blank".to_string(),
        ));
    }
    if body.display_name.chars().count() > 200 {
        return Err(AppError::Validation(
            "displayName must be at most 200 characters".to_string(),
        ));
    }

    body.provider_user_id = body
        .provider_user_id
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    let device = DeviceRepository::upsert(&state.db, &recipient_id, &device_id, body).await?;
    tracing::info!(
        "Registered device {} for recipient {} (routable: {})",
        device.device_id,
        device.recipient_id,
        device.provider_user_id.is_some()
    );

    Ok(Json(device))
}

async fn delete_device(
    State(state): State<Arc<AppState>>,
    Path((recipient_id, device_id)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    if DeviceRepository::delete(&state.db, &recipient_id, &device_id).await? {
        tracing::info!("Deleted device {} of recipient {}", device_id, recipient_id);
    }
    Ok(StatusCode::NO_CONTENT)
}
