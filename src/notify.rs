use serde::Serialize;
use tokio::sync::broadcast;

use crate::journal::QueryRecord;

/// Event pushed to console subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct QueryEvent {
    pub kind: &'static str,
    pub payload: serde_json::Value,
}

impl QueryEvent {
    pub fn query(record: &QueryRecord) -> Self {
        Self {
            kind: "query",
            payload: serde_json::to_value(record).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Fan-out of query events. `publish` never blocks; a subscriber that falls
/// behind the channel capacity is lagged out by the broadcast channel instead
/// of back-pressuring the dispatcher.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<QueryEvent>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    #[allow(dead_code)]
    pub fn subscribe(&self) -> broadcast::Receiver<QueryEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: QueryEvent) {
        // send only fails with zero subscribers, which is fine
        let _ = self.tx.send(event);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(256)
    }
}
