//! Volume Event Bus
//!
//! Every state-changing operation publishes a [`VolumeEvent`]. Observers
//! (capacity publisher, metrics) each hold their own subscription and drain
//! it independently. A producer that must not report success before the
//! capacity republish has happened attaches a [`CompletionSignal`] and waits
//! on it with a bounded timeout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, warn};

/// Default bound on how long a producer waits for completion
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_BUS_CAPACITY: usize = 256;

// =============================================================================
// Trigger
// =============================================================================

/// Why an event was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    DiskAdded,
    DiskRemoved,
    VolumeCreated,
    VolumeDeleted,
    VolumeResized,
    VolumeCloned,
    SnapshotCreated,
    SnapshotDeleted,
    SnapshotRestored,
    PartitionChanged,
    ConfigChanged,
    Reconciled,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::DiskAdded => "disk_added",
            Trigger::DiskRemoved => "disk_removed",
            Trigger::VolumeCreated => "volume_created",
            Trigger::VolumeDeleted => "volume_deleted",
            Trigger::VolumeResized => "volume_resized",
            Trigger::VolumeCloned => "volume_cloned",
            Trigger::SnapshotCreated => "snapshot_created",
            Trigger::SnapshotDeleted => "snapshot_deleted",
            Trigger::SnapshotRestored => "snapshot_restored",
            Trigger::PartitionChanged => "partition_changed",
            Trigger::ConfigChanged => "config_changed",
            Trigger::Reconciled => "reconciled",
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Volume Event
// =============================================================================

/// One-shot acknowledgement a consumer fires after handling an event
#[derive(Debug, Clone, Default)]
pub struct CompletionSignal(Arc<Notify>);

impl CompletionSignal {
    /// Mark the event handled; a later waiter still observes it
    pub fn complete(&self) {
        self.0.notify_one();
    }

    /// Wait for completion up to `timeout`; true if completed in time
    pub async fn wait(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.0.notified()).await.is_ok()
    }
}

/// A transient change notification
#[derive(Debug, Clone)]
pub struct VolumeEvent {
    pub trigger: Trigger,
    /// Volume, disk or group the change concerns
    pub subject: String,
    pub timestamp: DateTime<Utc>,
    pub done: Option<CompletionSignal>,
}

impl VolumeEvent {
    pub fn new(trigger: Trigger, subject: impl Into<String>) -> Self {
        Self {
            trigger,
            subject: subject.into(),
            timestamp: Utc::now(),
            done: None,
        }
    }

    /// Fire the completion signal, if any
    pub fn complete(&self) {
        if let Some(done) = &self.done {
            done.complete();
        }
    }
}

// =============================================================================
// Event Bus
// =============================================================================

/// Buffered fan-out channel of volume events
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<VolumeEvent>,
    wait_timeout: Duration,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Self::with_timeout(DEFAULT_EVENT_TIMEOUT)
    }

    /// Bus whose producers wait at most `wait_timeout` for completion
    pub fn with_timeout(wait_timeout: Duration) -> Arc<Self> {
        let (tx, _) = broadcast::channel(DEFAULT_BUS_CAPACITY);
        Arc::new(Self { tx, wait_timeout })
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<VolumeEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Fire and forget
    pub fn publish(&self, trigger: Trigger, subject: impl Into<String>) {
        let event = VolumeEvent::new(trigger, subject);
        debug!(trigger = %event.trigger, subject = %event.subject, "Publishing event");
        if self.tx.send(event).is_err() {
            debug!(%trigger, "No event subscribers");
        }
    }

    /// Publish and wait until a consumer completes the event
    ///
    /// Returns false when nobody completed it within the timeout; the
    /// mutation itself has already succeeded, so callers only log this.
    pub async fn publish_and_wait(&self, trigger: Trigger, subject: impl Into<String>) -> bool {
        let signal = CompletionSignal::default();
        let mut event = VolumeEvent::new(trigger, subject);
        event.done = Some(signal.clone());
        let subject = event.subject.clone();

        if self.tx.send(event).is_err() {
            debug!(%trigger, "No event subscribers, not waiting");
            return false;
        }

        let completed = signal.wait(self.wait_timeout).await;
        if !completed {
            warn!(
                %trigger,
                subject = %subject,
                timeout_ms = self.wait_timeout.as_millis() as u64,
                "Capacity republish not confirmed in time"
            );
        }
        completed
    }
}
