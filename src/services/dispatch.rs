//! Fan-out of one notification event to every device of its recipient.
//!
//! The coordinator spawns one send task per device plus an aggregate task that
//! collects their outcomes, then races the aggregate against the early-response
//! threshold. Losing the race does not cancel anything: the aggregate keeps
//! running in the background and hands each late outcome to the observer. Only
//! [`DispatchCoordinator::shutdown`] stops in-flight sends.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::db::Device;
use crate::error::DispatchError;
use crate::services::format::{build_payload, NotificationEvent};
use crate::services::stats::OutcomeObserver;
use crate::services::worker::{DeviceOutcome, DeviceSendWorker, ErrorKind};

/// What a dispatch invocation answers with. Exactly one per call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum DispatchResult {
    /// The threshold passed first; sends continue in the background.
    #[serde(rename_all = "camelCase")]
    Delivering { device_count: usize },
    #[serde(rename_all = "camelCase")]
    Completed {
        total: usize,
        succeeded: usize,
        failed: usize,
        outcomes: Vec<DeviceOutcome>,
    },
}

impl DispatchResult {
    fn completed(outcomes: Vec<DeviceOutcome>) -> Self {
        let succeeded = outcomes.iter().filter(|o| o.success).count();
        DispatchResult::Completed {
            total: outcomes.len(),
            succeeded,
            failed: outcomes.len() - succeeded,
            outcomes,
        }
    }
}

/// Lifecycle of a single dispatch invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Resolving,
    FanningOut,
    EarlyReturned,
    Completed,
}

impl DispatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchState::Resolving => "resolving",
            DispatchState::FanningOut => "fanning_out",
            DispatchState::EarlyReturned => "early_returned",
            DispatchState::Completed => "completed",
        }
    }
}

pub struct DispatchCoordinator {
    worker: DeviceSendWorker,
    observer: Arc<dyn OutcomeObserver>,
    early_response_threshold: Duration,
    max_text_length: usize,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl DispatchCoordinator {
    pub fn new(
        worker: DeviceSendWorker,
        observer: Arc<dyn OutcomeObserver>,
        early_response_threshold: Duration,
        max_text_length: usize,
    ) -> Self {
        Self {
            worker,
            observer,
            early_response_threshold,
            max_text_length,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn worker(&self) -> &DeviceSendWorker {
        &self.worker
    }

    /// Number of send and aggregate tasks still running, early-returned ones
    /// included.
    pub fn background_tasks(&self) -> usize {
        self.tracker.len()
    }

    fn transition(dispatch_id: Uuid, recipient_id: &str, state: DispatchState) {
        tracing::debug!(
            "Dispatch {} for recipient {} -> {}",
            dispatch_id,
            recipient_id,
            state.as_str()
        );
    }

    /// Deliver `event` to its recipient's devices.
    pub async fn dispatch(&self, event: &NotificationEvent) -> Result<DispatchResult, DispatchError> {
        let recipient_id = event.recipient_id.as_str();
        let dispatch_id = Uuid::new_v4();
        Self::transition(dispatch_id, recipient_id, DispatchState::Resolving);

        let mut devices = self.worker.registry().get_devices(recipient_id).await?;
        let targets: Vec<Device> = match event.target_device_id.as_deref() {
            Some(target) => devices.remove(target).into_iter().collect(),
            None => {
                let mut all: Vec<Device> = devices.into_values().collect();
                all.sort_by(|a, b| a.device_id.cmp(&b.device_id));
                all
            }
        };

        if targets.is_empty() {
            tracing::info!("Recipient {} has no matching devices, nothing to send", recipient_id);
            Self::transition(dispatch_id, recipient_id, DispatchState::Completed);
            return Ok(DispatchResult::completed(Vec::new()));
        }

        let device_count = targets.len();
        let payload = Arc::new(build_payload(event, self.max_text_length));
        Self::transition(dispatch_id, recipient_id, DispatchState::FanningOut);
        tracing::info!(
            "Dispatch {}: sending to {} device(s) of recipient {}",
            dispatch_id,
            device_count,
            recipient_id
        );

        let sends: Vec<_> = targets
            .into_iter()
            .map(|device| {
                let worker = self.worker.clone();
                let payload = payload.clone();
                let cancel = self.shutdown.clone();
                let task_device = device.clone();
                let handle = self.tracker.spawn(async move {
                    tokio::select! {
                        outcome = worker.send(&task_device, &payload) => outcome,
                        _ = cancel.cancelled() => DeviceOutcome::aborted(
                            &task_device,
                            ErrorKind::Cancelled,
                            "send cancelled by shutdown",
                        ),
                    }
                });
                (device, handle)
            })
            .collect();

        let observer = self.observer.clone();
        let owner = recipient_id.to_string();
        let mut aggregate = self.tracker.spawn(async move {
            let mut slots: Vec<Option<DeviceOutcome>> = vec![None; sends.len()];
            let mut pending: FuturesUnordered<_> = sends
                .into_iter()
                .enumerate()
                .map(|(slot, (device, handle))| async move { (slot, device, handle.await) })
                .collect();

            while let Some((slot, device, joined)) = pending.next().await {
                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(e) if e.is_panic() => {
                        tracing::error!("Send task for device {} panicked", device.device_id);
                        DeviceOutcome::aborted(&device, ErrorKind::Internal, "send task panicked")
                    }
                    Err(e) => DeviceOutcome::aborted(&device, ErrorKind::Cancelled, e.to_string()),
                };
                observer.on_outcome(&owner, &outcome);
                slots[slot] = Some(outcome);
            }
            slots.into_iter().flatten().collect::<Vec<_>>()
        });

        tokio::select! {
            biased;
            joined = &mut aggregate => {
                let outcomes = joined.map_err(|e| DispatchError::Aggregation(e.to_string()))?;
                Self::transition(dispatch_id, recipient_id, DispatchState::Completed);
                Ok(DispatchResult::completed(outcomes))
            }
            _ = sleep(self.early_response_threshold) => {
                Self::transition(dispatch_id, recipient_id, DispatchState::EarlyReturned);
                self.observer.on_early_return(recipient_id, device_count);
                Ok(DispatchResult::Delivering { device_count })
            }
        }
    }

    /// Wait up to `grace` for background sends, then cancel what is left and
    /// wait for it to unwind.
    pub async fn shutdown(&self, grace: Duration) {
        self.tracker.close();
        tracing::info!(
            "Waiting up to {:?} for {} background dispatch task(s)",
            grace,
            self.tracker.len()
        );

        if timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                "Grace period elapsed, cancelling {} background dispatch task(s)",
                self.tracker.len()
            );
            self.shutdown.cancel();
            self.worker.executor().close();
            self.tracker.wait().await;
        }
        tracing::info!("Dispatch coordinator stopped");
    }
}
