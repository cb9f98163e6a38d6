//! Bounded, topic-keyed event queues bridging the engine to an observer.
//!
//! The observer (an on-device UI) may not be running at all, or may close
//! and reopen at any time. Producers never block: each topic is an
//! independent FIFO with a fixed bound that drops its oldest entry when
//! full, except overwrite-only topics where a new entry replaces the
//! pending one. Delivery order is guaranteed within a topic only.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Maximum queued entries per topic.
pub const TOPIC_CAPACITY: usize = 50;

/// Event topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Install/remove lifecycle steps.
    OperationEvent,
    /// Transfer progress; overwrite-only (only the latest matters).
    UploadProgress,
    /// A pairing code awaiting display to the user.
    PairingCode,
    /// Pairing completed.
    PairingSuccess,
    /// Pairing locked out after repeated failures.
    PairingLocked,
    /// A hub authenticated.
    HubConnected,
    /// The hub connection closed.
    HubDisconnected,
    /// Storage or internal failure the observer must see.
    ServerError,
}

impl Topic {
    /// Overwrite-only topics replace their pending entry instead of
    /// queueing, so a slow consumer never accumulates stale progress.
    #[must_use]
    pub fn is_overwrite(self) -> bool {
        matches!(self, Topic::UploadProgress)
    }
}

/// One queued event.
#[derive(Debug, Clone, Serialize)]
pub struct EventEntry {
    /// Topic the entry was published on.
    pub topic: Topic,
    /// Enqueue time, unix milliseconds.
    pub timestamp_ms: u64,
    /// Opaque JSON payload.
    pub payload: serde_json::Value,
}

/// A user-meaningful install/remove lifecycle step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationEvent {
    /// Operation kind.
    #[serde(rename = "type")]
    pub kind: OperationKind,
    /// Lifecycle status.
    pub status: OperationStatus,
    /// Game name the operation concerns.
    pub name: String,
    /// Progress percentage, 0-100.
    pub progress: u8,
    /// Human-readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Final artifact path, present on completed installs for the action
    /// layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Game installation via upload session.
    Install,
    /// Game removal.
    Remove,
}

/// Operation lifecycle statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Operation began.
    Started,
    /// Operation completed successfully.
    Completed,
    /// Operation failed or was cancelled.
    Error,
}

/// The set of per-topic bounded queues.
///
/// Cheap to share: clone-free access through `&EventQueue` behind an `Arc`.
pub struct EventQueue {
    queues: Mutex<HashMap<Topic, VecDeque<EventEntry>>>,
}

impl EventQueue {
    /// Create an empty queue set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Publish a payload on a topic. Never blocks and never fails; when a
    /// topic is at capacity the oldest entry is dropped.
    pub fn publish(&self, topic: Topic, payload: serde_json::Value) {
        let entry = EventEntry {
            topic,
            timestamp_ms: unix_millis(),
            payload,
        };

        let mut queues = self.queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let queue = queues.entry(topic).or_default();

        if topic.is_overwrite() {
            queue.clear();
        } else if queue.len() >= TOPIC_CAPACITY {
            queue.pop_front();
            tracing::debug!(?topic, "event queue full, dropped oldest entry");
        }
        queue.push_back(entry);
    }

    /// Publish an operation lifecycle event.
    pub fn publish_operation(&self, event: &OperationEvent) {
        match serde_json::to_value(event) {
            Ok(value) => self.publish(Topic::OperationEvent, value),
            Err(e) => tracing::error!("failed to serialize operation event: {e}"),
        }
    }

    /// Pop the oldest entry on a topic, if any. Observers poll until empty
    /// to drain backlog after being away.
    #[must_use]
    pub fn poll(&self, topic: Topic) -> Option<EventEntry> {
        let mut queues = self.queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        queues.get_mut(&topic)?.pop_front()
    }

    /// Number of pending entries on a topic.
    #[must_use]
    pub fn pending(&self, topic: Topic) -> usize {
        let queues = self.queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        queues.get(&topic).map_or(0, VecDeque::len)
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
