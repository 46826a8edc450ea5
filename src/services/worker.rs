use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{timeout, Instant};

use crate::db::Device;
use crate::services::executor::BoundedExecutor;
use crate::services::provider::{NotificationPayload, NotificationProvider, ProviderError};
use crate::services::rate_limit::TokenBucket;
use crate::services::registry::DeviceRegistry;
use crate::services::retry::{ErrorClass, RetryPolicy};

/// Why a single device send did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// The device has no provider routing handle; nothing was sent.
    MissingRoute,
    Permanent,
    /// Still failing after every retry.
    Retryable,
    /// The send task panicked.
    Internal,
    /// Shutdown stopped the send.
    Cancelled,
}

impl From<ErrorClass> for ErrorKind {
    fn from(class: ErrorClass) -> Self {
        match class {
            ErrorClass::TargetGone | ErrorClass::Permanent => ErrorKind::Permanent,
            ErrorClass::Retryable => ErrorKind::Retryable,
        }
    }
}

/// Result of delivering to one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceOutcome {
    pub device_id: String,
    pub display_name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub auto_cleaned: bool,
    pub attempts: u32,
    pub duration_ms: u64,
}

impl DeviceOutcome {
    /// A failed outcome for a device whose send never reported back on its own
    /// (panic, cancellation).
    pub fn aborted(device: &Device, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            device_id: device.device_id.clone(),
            display_name: device.display_name.clone(),
            success: false,
            provider_message_id: None,
            error_kind: Some(kind),
            error_message: Some(message.into()),
            auto_cleaned: false,
            attempts: 0,
            duration_ms: 0,
        }
    }
}

/// Sends one notification to one device under the shared rate and
/// concurrency limits.
#[derive(Clone)]
pub struct DeviceSendWorker {
    executor: BoundedExecutor,
    bucket: Arc<TokenBucket>,
    retry: RetryPolicy,
    provider: Arc<dyn NotificationProvider>,
    registry: Arc<dyn DeviceRegistry>,
    provider_timeout: Duration,
}

impl DeviceSendWorker {
    pub fn new(
        executor: BoundedExecutor,
        bucket: Arc<TokenBucket>,
        retry: RetryPolicy,
        provider: Arc<dyn NotificationProvider>,
        registry: Arc<dyn DeviceRegistry>,
        provider_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            bucket,
            retry,
            provider,
            registry,
            provider_timeout,
        }
    }

    pub fn executor(&self) -> &BoundedExecutor {
        &self.executor
    }

    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    pub fn registry(&self) -> &Arc<dyn DeviceRegistry> {
        &self.registry
    }

    /// Deliver `payload` to `device`. Every failure is reported in the
    /// returned outcome; this never errors.
    pub async fn send(&self, device: &Device, payload: &NotificationPayload) -> DeviceOutcome {
        let started = Instant::now();

        let Some(route) = device.provider_user_id.as_deref().filter(|r| !r.is_empty()) else {
            tracing::warn!(
                "Device {} of recipient {} has no provider routing handle, skipping",
                device.device_id,
                device.recipient_id
            );
            return DeviceOutcome::aborted(
                device,
                ErrorKind::MissingRoute,
                "device has no provider routing handle",
            );
        };

        let bucket = &self.bucket;
        let provider = &self.provider;
        let limit = self.provider_timeout;

        let result = self
            .executor
            .run(self.retry.execute(move || async move {
                bucket.acquire().await;
                match timeout(limit, provider.send_push(route, payload)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::timeout(limit.as_millis() as u64)),
                }
            }))
            .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        let mut outcome = DeviceOutcome {
            duration_ms,
            ..DeviceOutcome::aborted(device, ErrorKind::Cancelled, "")
        };

        match result {
            Err(closed) => {
                tracing::debug!("Send to device {} cancelled: {}", device.device_id, closed);
                outcome.error_message = Some(closed.to_string());
            }
            Ok(Ok((receipt, attempts))) => {
                tracing::debug!(
                    "Delivered to device {} in {} attempt(s): message_id={}",
                    device.device_id,
                    attempts,
                    receipt.message_id
                );
                outcome.success = true;
                outcome.provider_message_id = Some(receipt.message_id);
                outcome.error_kind = None;
                outcome.error_message = None;
                outcome.attempts = attempts;
            }
            Ok(Err(failure)) => {
                tracing::warn!(
                    "Delivery to device {} of recipient {} failed: {}",
                    device.device_id,
                    device.recipient_id,
                    failure
                );
                outcome.error_kind = Some(failure.class.into());
                outcome.error_message = Some(failure.source.message.clone());
                outcome.attempts = failure.attempts;

                if failure.class == ErrorClass::TargetGone {
                    self.clean_up(device).await;
                    outcome.auto_cleaned = true;
                }
            }
        }

        outcome
    }

    /// Best-effort removal of a device the provider no longer knows.
    async fn clean_up(&self, device: &Device) {
        match self
            .registry
            .delete_device(&device.recipient_id, &device.device_id)
            .await
        {
            Ok(()) => tracing::info!(
                "Removed dead device {} of recipient {}",
                device.device_id,
                device.recipient_id
            ),
            Err(e) => tracing::warn!(
                "Failed to remove dead device {} of recipient {}: {}",
                device.device_id,
                device.recipient_id,
                e
            ),
        }
    }
}
