use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::services::provider::NotificationPayload;

/// Inbound "new message" trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub recipient_id: String,
    pub sender_id: Option<String>,
    pub chat_id: String,
    pub message_id: Option<String>,
    #[serde(rename = "type", default = "default_message_type")]
    pub message_type: String,
    #[serde(default)]
    pub text: String,
    /// Deliver to this device only.
    pub target_device_id: Option<String>,
}

fn default_message_type() -> String {
    "text".to_string()
}

impl NotificationEvent {
    pub fn validate(&self) -> AppResult<()> {
        if self.recipient_id.trim().is_empty() {
            return Err(AppError::Validation("recipientId must not be empty".to_string()));
        }
        if self.chat_id.trim().is_empty() {
            return Err(AppError::Validation("chatId must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Kinds of message the formatter knows how to title.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Voice,
    File,
}

impl MessageKind {
    /// Unknown types are treated as text.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "image" | "photo" => MessageKind::Image,
            "video" => MessageKind::Video,
            "audio" | "voice" => MessageKind::Voice,
            "file" | "document" => MessageKind::File,
            _ => MessageKind::Text,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            MessageKind::Text => "New message",
            MessageKind::Image => "New photo",
            MessageKind::Video => "New video",
            MessageKind::Voice => "New voice message",
            MessageKind::File => "New file",
        }
    }

    /// Body used when a media message carries no caption.
    fn placeholder(&self) -> &'static str {
        match self {
            MessageKind::Text => "",
            MessageKind::Image => "📷 Photo",
            MessageKind::Video => "🎬 Video",
            MessageKind::Voice => "🎤 Voice message",
            MessageKind::File => "📎 File",
        }
    }
}

/// Cut `text` to at most `max_chars` characters, ending in "…" when shortened.
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars == 0 {
        return String::new();
    }

    let kept: String = text.chars().take(max_chars - 1).collect();
    let mut out = kept.trim_end().to_string();
    out.push('…');
    out
}

/// Build the provider payload for `event`. Computed once per dispatch.
pub fn build_payload(event: &NotificationEvent, max_text_length: usize) -> NotificationPayload {
    let kind = MessageKind::parse(&event.message_type);

    let text = event.text.trim();
    let body = if text.is_empty() {
        kind.placeholder().to_string()
    } else {
        truncate_text(text, max_text_length)
    };

    let mut data = BTreeMap::new();
    data.insert("chatId".to_string(), event.chat_id.clone());
    data.insert("type".to_string(), event.message_type.clone());
    data.insert("recipientId".to_string(), event.recipient_id.clone());
    if let Some(id) = &event.message_id {
        data.insert("messageId".to_string(), id.clone());
    }
    if let Some(id) = &event.sender_id {
        data.insert("senderId".to_string(), id.clone());
    }

    NotificationPayload {
        title: kind.title().to_string(),
        body,
        data,
    }
}
