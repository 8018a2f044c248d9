//! Event bus: single-producer, many-consumer broadcast of status snapshots
//! and lifecycle events. Each subscriber gets its own bounded channel
//! buffer; a slow subscriber drops events rather than backpressuring the
//! producer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 512;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxyEvent {
    /// A coarse status snapshot, e.g. for the SSE `/events` feed.
    Status {
        phase: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    ServerConnected { server: String },
    ServerDisconnected { server: String, reason: String },
    ServerQuarantined { server: String },
    ServerUnquarantined { server: String },
    ToolsUpdated { server: String, tool_count: usize },
    CallCompleted { tool: String, success: bool, duration_ms: u64 },
}

/// Owns the broadcast sender; cloned cheaply and shared across components
/// that need to publish (supervisor, router, catalogue).
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProxyEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publishes an event to every current subscriber. If a subscriber's
    /// buffer is full, `broadcast::Sender::send` simply drops the oldest
    /// entry for that receiver on its next read — publication never blocks
    /// and never fails the caller.
    pub fn publish(&self, event: ProxyEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
