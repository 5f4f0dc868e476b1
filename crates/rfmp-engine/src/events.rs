//! Event stream surfaced to external subscribers (the REST/WebSocket layer).

use serde::Serialize;
use tokio::sync::broadcast;

use rfmp_shared::types::MessageId;
use rfmp_store::StoredMessage;

use crate::counters::CounterSnapshot;

/// Buffered events per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "payload")]
pub enum MessageEvent {
    /// A message was accepted into the store (ingest or local send).
    NewMessage(StoredMessage),
    /// A node was heard on air.
    NodeSeen { callsign: String },
    /// Connection state or counters changed.
    StatusChange {
        connected: bool,
        queue_depth: u64,
        counters: CounterSnapshot,
    },
    /// A queued frame was dropped after exhausting its retries. The
    /// originating message, if any, remains in the store.
    TxPermanentFailure { msg_id: Option<MessageId> },
}

/// Fan-out handle over a tokio broadcast channel. Subscribers are
/// independent; a lagging subscriber loses old events, never blocks the
/// engine.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MessageEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MessageEvent> {
        self.tx.subscribe()
    }

    /// Publish, ignoring the no-subscribers case.
    pub fn publish(&self, event: MessageEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
