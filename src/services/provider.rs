use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What actually goes to the push provider. Built once per event and shared by
/// every device send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    /// String-only by construction: the provider rejects non-string data values.
    pub data: BTreeMap<String, String>,
}

/// Provider acknowledgment for one accepted push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReceipt {
    pub message_id: String,
}

/// A failed provider call, carrying whatever classification hints the provider
/// gave: an HTTP-style status and/or a symbolic reason code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("provider error{}: {message}", hint_suffix(.status, .code))]
pub struct ProviderError {
    pub status: Option<u16>,
    pub code: Option<String>,
    pub message: String,
}

impl ProviderError {
    pub fn new(status: Option<u16>, code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn timeout(after_ms: u64) -> Self {
        Self::new(
            None,
            Some("TIMEOUT"),
            format!("provider call timed out after {}ms", after_ms),
        )
    }
}

fn hint_suffix(status: &Option<u16>, code: &Option<String>) -> String {
    match (status, code) {
        (Some(status), Some(code)) => format!(" ({} {})", status, code),
        (Some(status), None) => format!(" ({})", status),
        (None, Some(code)) => format!(" ({})", code),
        (None, None) => String::new(),
    }
}

/// The push-delivery API.
#[async_trait]
pub trait NotificationProvider: Send + Sync + 'static {
    async fn send_push(
        &self,
        provider_user_id: &str,
        payload: &NotificationPayload,
    ) -> Result<PushReceipt, ProviderError>;
}
