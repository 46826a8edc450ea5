use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::PushConfig;
use crate::error::{AppError, AppResult};
use crate::services::provider::{NotificationPayload, NotificationProvider, ProviderError, PushReceipt};

/// Push provider speaking the FCM HTTP v1 `messages:send` API.
#[derive(Clone)]
pub struct FcmProvider {
    client: reqwest::Client,
    base_url: String,
    project_id: String,
    access_token: String,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    message: Message<'a>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    token: &'a str,
    notification: Notification<'a>,
    data: &'a BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct Notification<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorStatus,
}

#[derive(Debug, Deserialize)]
struct ErrorStatus {
    code: Option<u16>,
    message: Option<String>,
    status: Option<String>,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorDetail {
    error_code: Option<String>,
    #[serde(default)]
    field_violations: Vec<FieldViolation>,
}

#[derive(Debug, Deserialize)]
struct FieldViolation {
    field: Option<String>,
}

/// Code reported for a malformed registration token.
const INVALID_TOKEN_CODE: &str = "INVALID_REGISTRATION";

impl FcmProvider {
    pub fn new(config: &PushConfig) -> AppResult<Self> {
        // The per-call timeout is enforced by the send worker; this one only
        // guards against a wedged connection.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.provider_timeout_ms.saturating_mul(2).max(1)))
            .build()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            project_id: config.project_id.clone(),
            access_token: config.access_token.clone(),
        })
    }

    fn send_url(&self) -> String {
        format!("{}/v1/projects/{}/messages:send", self.base_url, self.project_id)
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    /// Turn a non-success response body into a classified error. The
    /// structured `errorCode` detail wins over the coarse `status` string.
    /// FCM rejects a malformed token as `INVALID_ARGUMENT`; when the token is
    /// the offending field that is reported as an invalid registration.
    fn parse_error(http_status: u16, body: &str) -> ProviderError {
        match serde_json::from_str::<ErrorEnvelope>(body) {
            Ok(envelope) => {
                let err = envelope.error;
                let mut code = err
                    .details
                    .iter()
                    .find_map(|d| d.error_code.clone())
                    .or(err.status);
                if code.as_deref() == Some("INVALID_ARGUMENT")
                    && Self::blames_token(&err.details, err.message.as_deref())
                {
                    code = Some(INVALID_TOKEN_CODE.to_string());
                }
                ProviderError {
                    status: Some(err.code.unwrap_or(http_status)),
                    code,
                    message: err.message.unwrap_or_else(|| body.to_string()),
                }
            }
            Err(_) => ProviderError::new(Some(http_status), None, body.to_string()),
        }
    }

    fn blames_token(details: &[ErrorDetail], message: Option<&str>) -> bool {
        let field_is_token = details
            .iter()
            .flat_map(|d| &d.field_violations)
            .any(|v| v.field.as_deref() == Some("message.token"));
        field_is_token
            || message.is_some_and(|m| m.to_lowercase().contains("registration token"))
    }

    fn transport_error(e: reqwest::Error) -> ProviderError {
        let code = if e.is_timeout() { "TIMEOUT" } else { "UNAVAILABLE" };
        ProviderError::new(None, Some(code), format!("Failed to send push: {}", e))
    }
}

#[async_trait]
impl NotificationProvider for FcmProvider {
    async fn send_push(
        &self,
        provider_user_id: &str,
        payload: &NotificationPayload,
    ) -> Result<PushReceipt, ProviderError> {
        let request = SendRequest {
            message: Message {
                token: provider_user_id,
                notification: Notification {
                    title: &payload.title,
                    body: &payload.body,
                },
                data: &payload.data,
            },
        };

        let response = self
            .client
            .post(self.send_url())
            .header("Authorization", self.auth_header())
            .json(&request)
            .send()
            .await
            .map_err(Self::transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(Self::parse_error(status.as_u16(), &error_text));
        }

        let body: SendResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::new(Some(status.as_u16()), None, format!("Failed to parse send response: {}", e)))?;

        tracing::debug!("Push accepted by provider: message_id={}", body.name);
        Ok(PushReceipt { message_id: body.name })
    }
}
