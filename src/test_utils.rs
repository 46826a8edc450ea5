//! Shared fakes for unit tests: in-memory database, scripted provider and
//! registry, and an observer that records every outcome.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db::Device;
use crate::error::RegistryError;
use crate::services::dispatch::DispatchCoordinator;
use crate::services::executor::BoundedExecutor;
use crate::services::provider::{NotificationPayload, NotificationProvider, ProviderError, PushReceipt};
use crate::services::rate_limit::TokenBucket;
use crate::services::registry::{DeviceRegistry, SqliteDeviceRegistry};
use crate::services::retry::RetryPolicy;
use crate::services::stats::{OutcomeObserver, StatsObserver};
use crate::services::worker::{DeviceOutcome, DeviceSendWorker};
use crate::AppState;

/// Single-connection in-memory SQLite with migrations applied. The pool never
/// recycles its connection, so the database lives as long as the pool.
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

/// Application state over an in-memory database, delivering through
/// `provider` with the limits in `config.dispatch`.
pub async fn test_state(provider: Arc<FakeProvider>, config: Config) -> Arc<AppState> {
    let pool = memory_pool().await;
    let stats = Arc::new(StatsObserver::new());
    let dispatch = &config.dispatch;

    let worker = DeviceSendWorker::new(
        BoundedExecutor::new(dispatch.max_concurrent_sends),
        Arc::new(TokenBucket::per_second(dispatch.rate_limit_per_second)),
        RetryPolicy::from_config(dispatch),
        provider,
        Arc::new(SqliteDeviceRegistry::new(pool.clone())),
        Duration::from_millis(config.push.provider_timeout_ms),
    );
    let coordinator = Arc::new(DispatchCoordinator::new(
        worker,
        stats.clone(),
        dispatch.early_response_threshold(),
        dispatch.max_text_length,
    ));

    Arc::new(AppState {
        db: pool,
        config,
        coordinator,
        stats,
    })
}

pub fn device(recipient_id: &str, device_id: &str, provider_user_id: Option<&str>) -> Device {
    let now = chrono::Utc::now().naive_utc();
    Device {
        device_id: device_id.to_string(),
        recipient_id: recipient_id.to_string(),
        provider_user_id: provider_user_id.map(str::to_string),
        display_name: format!("{} device", device_id),
        created_at: now,
        updated_at: now,
    }
}

pub fn payload() -> NotificationPayload {
    NotificationPayload {
        title: "New message".to_string(),
        body: "hello".to_string(),
        data: [("chatId".to_string(), "c1".to_string())].into_iter().collect(),
    }
}

/// Provider whose answers are scripted per routing handle. Unscripted calls
/// succeed after `delay`.
#[derive(Default)]
pub struct FakeProvider {
    delay: Duration,
    scripted: Mutex<HashMap<String, VecDeque<ProviderError>>>,
    always: HashMap<String, ProviderError>,
    panics: HashSet<String>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the next `errors.len()` calls for `token`, in order.
    pub fn failing(self, token: &str, errors: Vec<ProviderError>) -> Self {
        self.scripted
            .lock()
            .unwrap()
            .insert(token.to_string(), errors.into());
        self
    }

    pub fn always_failing(mut self, token: &str, error: ProviderError) -> Self {
        self.always.insert(token.to_string(), error);
        self
    }

    pub fn panicking(mut self, token: &str) -> Self {
        self.panics.insert(token.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Most calls ever in progress at the same moment.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationProvider for FakeProvider {
    async fn send_push(
        &self,
        provider_user_id: &str,
        _payload: &NotificationPayload,
    ) -> Result<PushReceipt, ProviderError> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(provider_user_id.to_string());
            calls.len()
        };
        if self.panics.contains(provider_user_id) {
            panic!("provider blew up for {}", provider_user_id);
        }

        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(provider_user_id)
            .and_then(VecDeque::pop_front);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(err) = scripted.or_else(|| self.always.get(provider_user_id).cloned()) {
            return Err(err);
        }
        Ok(PushReceipt {
            message_id: format!("msg-{}-{}", provider_user_id, n),
        })
    }
}

/// In-memory registry recording every delete it receives.
#[derive(Default)]
pub struct FakeRegistry {
    recipients: Mutex<HashMap<String, HashMap<String, Device>>>,
    deletes: Mutex<Vec<(String, String)>>,
    unreachable: AtomicBool,
    fail_deletes: AtomicBool,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(self, recipient_id: &str, devices: Vec<Device>) -> Self {
        self.recipients.lock().unwrap().insert(
            recipient_id.to_string(),
            devices
                .into_iter()
                .map(|d| (d.device_id.clone(), d))
                .collect(),
        );
        self
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn deletes(&self) -> Vec<(String, String)> {
        self.deletes.lock().unwrap().clone()
    }

    pub fn has_device(&self, recipient_id: &str, device_id: &str) -> bool {
        self.recipients
            .lock()
            .unwrap()
            .get(recipient_id)
            .is_some_and(|devices| devices.contains_key(device_id))
    }
}

#[async_trait]
impl DeviceRegistry for FakeRegistry {
    async fn get_devices(&self, recipient_id: &str) -> Result<HashMap<String, Device>, RegistryError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable("registry offline".to_string()));
        }
        self.recipients
            .lock()
            .unwrap()
            .get(recipient_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(recipient_id.to_string()))
    }

    async fn delete_device(&self, recipient_id: &str, device_id: &str) -> Result<(), RegistryError> {
        self.deletes
            .lock()
            .unwrap()
            .push((recipient_id.to_string(), device_id.to_string()));
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable("delete rejected".to_string()));
        }
        if let Some(devices) = self.recipients.lock().unwrap().get_mut(recipient_id) {
            devices.remove(device_id);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    outcomes: Mutex<Vec<DeviceOutcome>>,
    early_returns: Mutex<u32>,
}

impl RecordingObserver {
    pub fn outcomes(&self) -> Vec<DeviceOutcome> {
        self.outcomes.lock().unwrap().clone()
    }

    pub fn early_returns(&self) -> u32 {
        *self.early_returns.lock().unwrap()
    }
}

impl OutcomeObserver for RecordingObserver {
    fn on_outcome(&self, _recipient_id: &str, outcome: &DeviceOutcome) {
        self.outcomes.lock().unwrap().push(outcome.clone());
    }

    fn on_early_return(&self, _recipient_id: &str, _device_count: usize) {
        *self.early_returns.lock().unwrap() += 1;
    }
}
