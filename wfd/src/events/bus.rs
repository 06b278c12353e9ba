//! Central pub/sub event bus. Grounded directly on `td/src/events/bus.rs`'s
//! `EventBus`/`EventEmitter` pair over a `tokio::sync::broadcast` channel.

use tokio::sync::broadcast;
use tracing::debug;

use super::types::WorkflowEvent;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

pub struct EventBus {
    tx: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Fire-and-forget: dropped if there are no subscribers.
    pub fn emit(&self, event: WorkflowEvent) {
        debug!(name = %event.name(), "event emitted");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::types::{TaskEventKind, WorkflowEventKind};

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let bus = EventBus::with_default_capacity();
        let mut rx = bus.subscribe();
        bus.emit(WorkflowEvent::Workflow { kind: WorkflowEventKind::Startup, message: None });
        let received = rx.recv().await.unwrap();
        assert_eq!(received.name(), "startup");
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::with_default_capacity();
        bus.emit(WorkflowEvent::Task {
            kind: TaskEventKind::Succeeded,
            proxy_id: "a/1".to_string(),
            cycle: "1".to_string(),
            submit_number: 1,
            try_number: 1,
            runner_name: None,
            runner_id: None,
            message: None,
        });
    }
}
