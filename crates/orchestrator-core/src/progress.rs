//! A typed progress event bus, fanned out per user.
//!
//! A wrapped `tokio::sync::broadcast` sender per user rather than one global
//! channel: every user gets their own channel so one user's volume of events
//! never starves another's subscriber, and a subscriber that never connects
//! simply never receives anything — delivery is best-effort.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    JobStatus {
        job_id: Uuid,
        status: String,
        at: DateTime<Utc>,
    },
    JobProgress {
        job_id: Uuid,
        progress: u8,
    },
    RateLimit {
        marketplace: String,
        retry_after_ms: i64,
    },
    Delaying {
        job_id: Uuid,
        marketplace: String,
        delay_ms: i64,
    },
    SmartSchedule {
        job_id: Uuid,
        scheduled_for: DateTime<Utc>,
        reasoning: String,
    },
    BatchStarted {
        batch_id: Uuid,
        total: u32,
    },
    BatchCompleted {
        batch_id: Uuid,
        succeeded: u32,
        failed: u32,
    },
    AutomationTriggered {
        rule_id: Uuid,
        marketplace: String,
    },
    AutomationFailed {
        rule_id: Uuid,
        reason: String,
    },
    Custom {
        kind: String,
        payload: Value,
    },
}

/// A per-user fan-out bus. Cheap to clone (wraps an `Arc`): the worker loop
/// holds one shared instance and every processor emits through it.
#[derive(Clone, Default)]
pub struct ProgressBus {
    channels: Arc<DashMap<Uuid, broadcast::Sender<ProgressEvent>>>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a user's event stream. Each subscriber gets its own
    /// receiver with FIFO delivery order; a slow subscriber that falls
    /// behind the channel capacity drops its oldest unread events rather
    /// than blocking the emitter (`tokio::sync::broadcast`'s lagging
    /// behavior).
    pub fn subscribe(&self, user_id: Uuid) -> broadcast::Receiver<ProgressEvent> {
        self.channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Emit an event to a user's subscribers. A no-op if nobody is
    /// subscribed — delivery is best-effort, not store-and-forward.
    pub fn emit(&self, user_id: Uuid, event: ProgressEvent) {
        if let Some(sender) = self.channels.get(&user_id) {
            let _ = sender.send(event);
        }
    }

    /// Drop the channel for a user with no active subscribers, to bound
    /// memory for users who connected once and never again.
    pub fn prune(&self, user_id: Uuid) {
        if let Some(sender) = self.channels.get(&user_id) {
            if sender.receiver_count() == 0 {
                drop(sender);
                self.channels.remove(&user_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_events_in_order() {
        let bus = ProgressBus::new();
        let user_id = Uuid::new_v4();
        let mut receiver = bus.subscribe(user_id);

        let job_id = Uuid::new_v4();
        bus.emit(
            user_id,
            ProgressEvent::JobProgress { job_id, progress: 10 },
        );
        bus.emit(
            user_id,
            ProgressEvent::JobProgress { job_id, progress: 50 },
        );

        let first = receiver.recv().await.unwrap();
        let second = receiver.recv().await.unwrap();
        assert!(matches!(first, ProgressEvent::JobProgress { progress: 10, .. }));
        assert!(matches!(second, ProgressEvent::JobProgress { progress: 50, .. }));
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = ProgressBus::new();
        bus.emit(
            Uuid::new_v4(),
            ProgressEvent::RateLimit {
                marketplace: "ebay".to_string(),
                retry_after_ms: 1000,
            },
        );
    }

    #[tokio::test]
    async fn prune_removes_channel_with_no_subscribers() {
        let bus = ProgressBus::new();
        let user_id = Uuid::new_v4();
        {
            let _receiver = bus.subscribe(user_id);
        }
        bus.prune(user_id);
        assert!(bus.channels.get(&user_id).is_none());
    }
}
