use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use crate::models::QueueItemStatus;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueEventKind {
    Accepted,
    Rejected,
    Cancelled,
    Expired,
    Started,
    Closed,
}

impl QueueEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueEventKind::Accepted => "queue_item.accepted",
            QueueEventKind::Rejected => "queue_item.rejected",
            QueueEventKind::Cancelled => "queue_item.cancelled",
            QueueEventKind::Expired => "queue_item.expired",
            QueueEventKind::Started => "queue_item.started",
            QueueEventKind::Closed => "queue_item.closed",
        }
    }
}

impl fmt::Display for QueueEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Domain event emitted on every committed transition, for the realtime
/// transport to fan out to connected clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    pub queue_item_id: Uuid,
    pub kind: QueueEventKind,
    pub status: QueueItemStatus,
    pub occurred_at: DateTime<Utc>,
}

impl QueueEvent {
    pub fn new(
        queue_item_id: Uuid,
        kind: QueueEventKind,
        status: QueueItemStatus,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            queue_item_id,
            kind,
            status,
            occurred_at,
        }
    }
}

/// Fire-and-forget event delivery; at-least-once, never awaited on the
/// transition path.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: QueueEvent);
}

/// Logs events; the default sink when no transport is attached.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: QueueEvent) {
        info!(
            "{} item={} status={} at={}",
            event.kind, event.queue_item_id, event.status, event.occurred_at
        );
    }
}

/// Fans events out over a tokio broadcast channel so websocket sessions can
/// subscribe. Lagging or absent receivers never block a transition.
pub struct BroadcastEventSink {
    tx: broadcast::Sender<QueueEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: QueueEvent) {
        // Send fails only when nobody is subscribed, which is fine.
        let _ = self.tx.send(event);
    }
}
