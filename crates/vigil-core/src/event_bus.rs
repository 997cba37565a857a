use tokio::sync::broadcast;

use vigil_types::WatchdogEvent;

/// Broadcast fan-out of watchdog events. Publishing never fails; an
/// absent audience just drops the event.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WatchdogEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchdogEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: WatchdogEvent) {
        let _ = self.tx.send(event);
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
    use chrono::Utc;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(WatchdogEvent::HeartbeatReceived {
            unit_id: "task-1".to_string(),
            timestamp: Utc::now(),
        });

        match rx.recv().await.unwrap() {
            WatchdogEvent::HeartbeatReceived { unit_id, .. } => assert_eq!(unit_id, "task-1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(WatchdogEvent::ScanCompleted {
            scanned: 0,
            transitions: 0,
            timestamp: Utc::now(),
        });
    }
}
