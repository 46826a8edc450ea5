use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{AppError, AppResult};

type HmacSha256 = Hmac<Sha256>;

/// Largest accepted distance between a signed timestamp and now.
const MAX_SKEW_MINUTES: i64 = 10;

fn mac_for(secret: &str, timestamp: &str, body: &[u8]) -> AppResult<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AppError::Internal(anyhow::anyhow!("Failed to create HMAC")))?;
    mac.update(timestamp.as_bytes());
    mac.update(body);
    Ok(mac)
}

/// `sha256=<hex>` signature of `timestamp ‖ body`.
pub fn sign(secret: &str, timestamp: &str, body: &[u8]) -> AppResult<String> {
    let mac = mac_for(secret, timestamp, body)?;
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Check a dispatch trigger signature and the freshness of its RFC 3339
/// timestamp.
pub fn verify_signature(secret: &str, timestamp: &str, body: &[u8], signature: &str) -> AppResult<()> {
    let expected_sig = match signature.strip_prefix("sha256=") {
        Some(hex_sig) => hex::decode(hex_sig)
            .map_err(|_| AppError::BadRequest("Invalid signature format".to_string()))?,
        None => return Err(AppError::BadRequest("Invalid signature format".to_string())),
    };

    mac_for(secret, timestamp, body)?
        .verify_slice(&expected_sig)
        .map_err(|_| AppError::Unauthorized)?;

    let sent_at = chrono::DateTime::parse_from_rfc3339(timestamp)
        .map_err(|_| AppError::BadRequest("Invalid signature timestamp".to_string()))?;
    let diff = chrono::Utc::now().signed_duration_since(sent_at);
    if diff.num_minutes().abs() > MAX_SKEW_MINUTES {
        return Err(AppError::BadRequest("Message too old".to_string()));
    }

    Ok(())
}
