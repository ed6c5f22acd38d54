use tokio::sync::broadcast;
use uuid::Uuid;

use crate::index::manager::RebuildProgress;
use crate::types::MemorySource;

/// Typed engine events, broadcast on a best-effort channel.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    MemoryAdded {
        id: Uuid,
        source: MemorySource,
    },
    MemoryUpdated {
        id: Uuid,
    },
    MemoryDeleted {
        ids: Vec<Uuid>,
    },
    RetrievalCompleted {
        query: String,
        backends: usize,
        results: usize,
        elapsed_ms: u64,
    },
    ExtractionCompleted {
        memories: usize,
        entities: usize,
        relations: usize,
    },
    RebuildProgress(RebuildProgress),
    /// Degraded-operation notices (rate-limit pauses, backend fallbacks).
    Warning {
        message: String,
    },
}

/// Non-blocking fan-out of engine events. Listeners that lag or disappear
/// never affect the hot path; send errors are swallowed.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_without_listeners_is_silent() {
        let bus = EventBus::default();
        bus.emit(EngineEvent::Warning {
            message: "no one listening".into(),
        });
    }

    #[tokio::test]
    async fn subscriber_receives_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let id = Uuid::new_v4();
        bus.emit(EngineEvent::MemoryAdded {
            id,
            source: MemorySource::Memory,
        });
        match rx.recv().await.unwrap() {
            EngineEvent::MemoryAdded { id: got, .. } => assert_eq!(got, id),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
