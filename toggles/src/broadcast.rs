use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 128;

/// The fixed payload every transport for this bus carries. `enabled` is
/// `None` when an override was deleted; receivers refetch rather than apply
/// the payload, so it is advisory either way.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FlagChange {
    pub flag_key: String,
    pub enabled: Option<bool>,
    /// Unix milliseconds.
    pub timestamp: i64,
}

impl FlagChange {
    pub fn now(flag_key: &str, enabled: Option<bool>) -> Self {
        Self {
            flag_key: flag_key.to_string(),
            enabled,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Best-effort fan-out to live sessions. No replay: a session that was
/// disconnected converges through its periodic refresh instead.
#[derive(Clone)]
pub struct FlagBroadcast {
    tx: broadcast::Sender<FlagChange>,
}

impl FlagBroadcast {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Never blocks and never fails the caller.
    pub fn publish(&self, change: FlagChange) {
        counter!("flags_broadcast_published_total").increment(1);
        if self.tx.send(change).is_err() {
            // No live subscriber, nothing to notify
            tracing::debug!("flag change broadcast had no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlagChange> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for FlagBroadcast {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}
