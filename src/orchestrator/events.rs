//! Session event bus
//!
//! Bounded broadcast channel carrying lifecycle events between the session
//! workers and any interested observers. Slow subscribers lag and lose old
//! events rather than blocking a worker.

use tokio::sync::broadcast;

use crate::models::ExitReason;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SessionStarted { session_id: String },
    SessionReady { session_id: String },
    SessionStopped {
        session_id: String,
        reason: ExitReason,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::SessionStarted { session_id }
            | SessionEvent::SessionReady { session_id }
            | SessionEvent::SessionStopped { session_id, .. } => session_id,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_CAPACITY);
        EventBus { tx }
    }

    pub fn publish(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(SessionEvent::SessionStarted {
            session_id: "s1".to_string(),
        });
        bus.publish(SessionEvent::SessionReady {
            session_id: "s1".to_string(),
        });
        bus.publish(SessionEvent::SessionStopped {
            session_id: "s1".to_string(),
            reason: ExitReason::Clean,
        });

        assert_eq!(
            rx.recv().await.unwrap().session_id(),
            "s1"
        );
        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::SessionReady { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::SessionStopped {
                reason: ExitReason::Clean,
                ..
            }
        ));
    }
}
