use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use vigil_core::storage::{append_jsonl, read_jsonl_tail, EVENTS_LOG};
use vigil_core::{
    AlertManager, AuditSink, EventBus, HeartbeatStore, RecoveryOrchestrator, SessionHealthStore,
    TracingAuditSink, WatchdogConfigStore, WatchdogEngine,
};

mod http;

pub use http::serve;

/// Upper bound for the in-memory event ring and the `?limit` query.
pub const EVENT_RING_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<WatchdogEngine>,
    pub alerts: Arc<AlertManager>,
    pub recovery: Arc<RecoveryOrchestrator>,
    pub config: WatchdogConfigStore,
    pub event_bus: EventBus,
    pub audit: Arc<dyn AuditSink>,
    pub events_path: PathBuf,
    events: Arc<RwLock<Vec<Value>>>,
}

impl AppState {
    /// Last `limit` events, newest first.
    pub async fn recent_events(&self, limit: usize) -> Vec<Value> {
        let limit = limit.clamp(1, EVENT_RING_CAPACITY);
        let ring = self.events.read().await;
        ring.iter().rev().take(limit).cloned().collect()
    }

    pub async fn push_event(&self, value: Value) {
        let mut ring = self.events.write().await;
        ring.push(value);
        let overflow = ring.len().saturating_sub(EVENT_RING_CAPACITY);
        if overflow > 0 {
            ring.drain(..overflow);
        }
    }

    /// Reload the tail of the event log into the ring. Called once at
    /// startup so `GET /events` has history from before this process.
    pub async fn seed_recent_events(&self) {
        match read_jsonl_tail(&self.events_path, EVENT_RING_CAPACITY) {
            Ok(tail) => {
                let mut ring = self.events.write().await;
                *ring = tail;
            }
            Err(err) => {
                tracing::warn!(error = %err, "could not seed event ring from log");
            }
        }
    }
}

/// Wire up every store and the engine over one state directory.
pub async fn build_state(
    state_dir: &Path,
    cli_overrides: Option<Value>,
) -> anyhow::Result<AppState> {
    let config = WatchdogConfigStore::new(state_dir, cli_overrides).await?;
    let event_bus = EventBus::new();
    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
    let heartbeats = Arc::new(HeartbeatStore::new(state_dir).await?);
    let alerts = Arc::new(AlertManager::new(state_dir).await?);
    let engine = Arc::new(
        WatchdogEngine::new(
            state_dir,
            config.clone(),
            heartbeats,
            alerts.clone(),
            event_bus.clone(),
            audit.clone(),
        )
        .await?,
    );
    let sessions = Arc::new(SessionHealthStore::new(state_dir).await?);
    let recovery = Arc::new(RecoveryOrchestrator::new(
        sessions,
        event_bus.clone(),
        audit.clone(),
    ));
    let state = AppState {
        engine,
        alerts,
        recovery,
        config,
        event_bus,
        audit,
        events_path: state_dir.join(EVENTS_LOG),
        events: Arc::new(RwLock::new(Vec::new())),
    };
    state.seed_recent_events().await;
    Ok(state)
}

/// Mirror bus events into the append-only event log and the in-memory
/// ring that backs `GET /events`.
pub async fn run_event_indexer(state: AppState) {
    let mut rx = state.event_bus.subscribe();
    loop {
        match rx.recv().await {
            Ok(event) => {
                let value = match serde_json::to_value(&event) {
                    Ok(value) => value,
                    Err(err) => {
                        tracing::warn!(error = %err, "unserializable watchdog event");
                        continue;
                    }
                };
                if let Err(err) = append_jsonl(&state.events_path, &value) {
                    tracing::warn!(error = %err, "event log append failed");
                }
                state.push_event(value).await;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event indexer lagged behind the bus");
                continue;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;
    use vigil_types::WatchdogEvent;

    fn tmp_state_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("vigil-server-{name}-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn ring_keeps_newest_events_first() {
        let dir = tmp_state_dir("ring");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let state = build_state(&dir, None).await.unwrap();

        for i in 0..(EVENT_RING_CAPACITY + 10) {
            state.push_event(json!({"seq": i})).await;
        }
        let recent = state.recent_events(5).await;
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0]["seq"], json!(EVENT_RING_CAPACITY + 9));
        assert_eq!(recent[4]["seq"], json!(EVENT_RING_CAPACITY + 5));

        let _ = tokio::fs::remove_dir_all(dir).await;
    }

    #[tokio::test]
    async fn indexer_appends_to_log_and_ring() {
        let dir = tmp_state_dir("indexer");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let state = build_state(&dir, None).await.unwrap();
        let indexer = tokio::spawn(run_event_indexer(state.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        state.event_bus.publish(WatchdogEvent::HeartbeatReceived {
            unit_id: "task-1".to_string(),
            timestamp: chrono::Utc::now(),
        });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let recent = state.recent_events(10).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0]["type"], json!("heartbeat_received"));

        // A fresh state over the same dir sees the logged event.
        let reloaded = build_state(&dir, None).await.unwrap();
        assert_eq!(reloaded.recent_events(10).await.len(), 1);

        indexer.abort();
        let _ = tokio::fs::remove_dir_all(dir).await;
    }
}
