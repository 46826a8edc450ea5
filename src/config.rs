use std::env;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub push: PushConfig,
    pub dispatch: DispatchConfig,
    pub trigger: TriggerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    /// Project that owns the push credentials (used to build the send URL).
    pub project_id: String,
    /// Bearer token presented to the push API. Obtaining and refreshing it is
    /// left to the deployment (e.g. a sidecar writing the env var).
    pub access_token: String,
    pub api_base_url: String,
    /// Hard ceiling for a single provider call, independent of the
    /// early-response threshold.
    pub provider_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Token bucket capacity and refill rate for outbound provider calls.
    pub rate_limit_per_second: u32,
    /// Maximum provider calls in flight across all dispatches.
    pub max_concurrent_sends: usize,
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub initial_retry_delay_ms: u64,
    /// Cap for exponential backoff.
    pub max_retry_delay_ms: u64,
    /// Upper bound of uniform jitter added to every backoff (0 disables it).
    pub retry_jitter_ms: u64,
    /// How long a dispatch waits for every device before acknowledging early.
    pub early_response_threshold_ms: u64,
    /// Notification body length limit, in characters.
    pub max_text_length: usize,
    /// How long shutdown waits for background sends before cancelling them.
    pub shutdown_grace_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerConfig {
    /// When set, `/api/dispatch` requests must carry a valid HMAC signature.
    pub signing_secret: Option<String>,
    /// Allowed requests per second (per IP) for the dispatch trigger.
    pub per_second: u32,
    /// Burst size for the dispatch trigger.
    pub burst: u32,
}

impl DispatchConfig {
    pub fn early_response_threshold(&self) -> Duration {
        Duration::from_millis(self.early_response_threshold_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/devices.db".to_string()),
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            push: PushConfig {
                project_id: env::var("PUSH_PROJECT_ID")
                    .map_err(|_| ConfigError::MissingEnv("PUSH_PROJECT_ID".to_string()))?,
                access_token: env::var("PUSH_ACCESS_TOKEN")
                    .map_err(|_| ConfigError::MissingEnv("PUSH_ACCESS_TOKEN".to_string()))?,
                api_base_url: env::var("PUSH_API_BASE_URL")
                    .unwrap_or_else(|_| "https://fcm.googleapis.com".to_string()),
                provider_timeout_ms: parse_or("PUSH_PROVIDER_TIMEOUT_MS", 10_000u64)?,
            },
            dispatch: DispatchConfig {
                rate_limit_per_second: parse_or("DISPATCH_RATE_LIMIT_PER_SECOND", 500u32)?.max(1),
                max_concurrent_sends: parse_or("DISPATCH_MAX_CONCURRENT_SENDS", 50usize)?.max(1),
                max_retries: parse_or("DISPATCH_MAX_RETRIES", 3u32)?,
                initial_retry_delay_ms: parse_or("DISPATCH_INITIAL_RETRY_DELAY_MS", 200u64)?,
                max_retry_delay_ms: parse_or("DISPATCH_MAX_RETRY_DELAY_MS", 10_000u64)?,
                retry_jitter_ms: parse_or("DISPATCH_RETRY_JITTER_MS", 0u64)?,
                early_response_threshold_ms: parse_or(
                    "DISPATCH_EARLY_RESPONSE_THRESHOLD_MS",
                    1_500u64,
                )?,
                max_text_length: parse_or("DISPATCH_MAX_TEXT_LENGTH", 100usize)?,
                shutdown_grace_seconds: parse_or("DISPATCH_SHUTDOWN_GRACE_SECONDS", 15u64)?,
            },
            trigger: TriggerConfig {
                signing_secret: env::var("TRIGGER_SIGNING_SECRET")
                    .ok()
                    .filter(|s| !s.is_empty()),
                per_second: env::var("RATE_LIMIT_TRIGGER_PER_SECOND")
                    .unwrap_or_else(|_| "50".to_string())
                    .parse()
                    .unwrap_or(50),
                burst: env::var("RATE_LIMIT_TRIGGER_BURST")
                    .unwrap_or_else(|_| "200".to_string())
                    .parse()
                    .unwrap_or(200),
            },
        })
    }
}

/// Read `key`, falling back to `default` when unset. A set but unparsable
/// value is an error.
fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            rate_limit_per_second: 500,
            max_concurrent_sends: 50,
            max_retries: 3,
            initial_retry_delay_ms: 200,
            max_retry_delay_ms: 10_000,
            retry_jitter_ms: 0,
            early_response_threshold_ms: 1_500,
            max_text_length: 100,
            shutdown_grace_seconds: 15,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: "sqlite://data/devices.db".to_string(),
                max_connections: 5,
            },
            push: PushConfig {
                project_id: String::new(),
                access_token: String::new(),
                api_base_url: "https://fcm.googleapis.com".to_string(),
                provider_timeout_ms: 10_000,
            },
            dispatch: DispatchConfig::default(),
            trigger: TriggerConfig {
                signing_secret: None,
                per_second: 50,
                burst: 200,
            },
        }
    }
}
