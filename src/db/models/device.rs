use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A registered push destination (one app install) belonging to a recipient.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Stable identifier, unique per recipient.
    pub device_id: String,

    /// Owning recipient (references `recipients.id`).
    pub recipient_id: String,

    /// Opaque routing handle handed to the push provider. `None` when the
    /// client registered without a usable token.
    pub provider_user_id: Option<String>,

    pub display_name: String,

    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Data required to register (or refresh) a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDevice {
    pub provider_user_id: Option<String>,
    #[serde(default)]
    pub display_name: String,
}
