use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::services::worker::DeviceOutcome;

/// Receives every device outcome, including those produced after a dispatch
/// already answered early.
pub trait OutcomeObserver: Send + Sync + 'static {
    fn on_outcome(&self, recipient_id: &str, outcome: &DeviceOutcome);

    fn on_early_return(&self, _recipient_id: &str, _device_count: usize) {}
}

/// Logs outcomes and keeps process-wide delivery counters.
#[derive(Debug, Default)]
pub struct StatsObserver {
    delivered: AtomicU64,
    failed: AtomicU64,
    auto_cleaned: AtomicU64,
    early_returns: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchStats {
    pub delivered: u64,
    pub failed: u64,
    pub auto_cleaned: u64,
    pub early_returns: u64,
}

impl StatsObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            auto_cleaned: self.auto_cleaned.load(Ordering::Relaxed),
            early_returns: self.early_returns.load(Ordering::Relaxed),
        }
    }
}

impl OutcomeObserver for StatsObserver {
    fn on_outcome(&self, recipient_id: &str, outcome: &DeviceOutcome) {
        if outcome.success {
            self.delivered.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                "Push delivered: recipient={} device={} attempts={} duration_ms={}",
                recipient_id,
                outcome.device_id,
                outcome.attempts,
                outcome.duration_ms
            );
            return;
        }

        self.failed.fetch_add(1, Ordering::Relaxed);
        if outcome.auto_cleaned {
            self.auto_cleaned.fetch_add(1, Ordering::Relaxed);
        }
        tracing::warn!(
            "Push failed: recipient={} device={} kind={:?} auto_cleaned={} error={}",
            recipient_id,
            outcome.device_id,
            outcome.error_kind,
            outcome.auto_cleaned,
            outcome.error_message.as_deref().unwrap_or("")
        );
    }

    fn on_early_return(&self, recipient_id: &str, device_count: usize) {
        self.early_returns.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "Dispatch for recipient {} answered early, {} device(s) still delivering",
            recipient_id,
            device_count
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::worker::ErrorKind;

    fn outcome(success: bool, auto_cleaned: bool) -> DeviceOutcome {
        DeviceOutcome {
            device_id: "phone".to_string(),
            display_name: "Phone".to_string(),
            success,
            provider_message_id: success.then(|| "m1".to_string()),
            error_kind: (!success).then_some(ErrorKind::Permanent),
            error_message: None,
            auto_cleaned,
            attempts: 1,
            duration_ms: 3,
        }
    }

    #[test]
    fn counters_track_each_outcome() {
        let stats = StatsObserver::new();
        stats.on_outcome("alice", &outcome(true, false));
        stats.on_outcome("alice", &outcome(true, false));
        stats.on_outcome("alice", &outcome(false, true));
        stats.on_outcome("alice", &outcome(false, false));
        stats.on_early_return("alice", 4);

        assert_eq!(
            stats.snapshot(),
            DispatchStats {
                delivered: 2,
                failed: 2,
                auto_cleaned: 1,
                early_returns: 1,
            }
        );
    }
}
