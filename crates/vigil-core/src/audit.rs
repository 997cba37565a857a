// Audit Sink
// Collaborator seam for out-of-band notification of significant events.
// Delivery (pager, chat, ticketing) belongs to the implementor; the
// default sink forwards to the structured process log.

use tracing::Level;

use vigil_observability::{emit_event, short_hash, ObservabilityEvent, ProcessKind};
use vigil_types::{HealthState, WatchdogEvent};

#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    /// Unique name for logging and diagnostics.
    fn name(&self) -> &str;

    async fn notify(&self, event: &WatchdogEvent);
}

pub struct TracingAuditSink;

#[async_trait::async_trait]
impl AuditSink for TracingAuditSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn notify(&self, event: &WatchdogEvent) {
        match event {
            WatchdogEvent::HealthChanged {
                unit_id,
                from,
                to,
                elapsed_ms,
                missed_count,
                ..
            } => {
                let level = if *to == HealthState::Failed {
                    Level::ERROR
                } else {
                    Level::WARN
                };
                let detail = format!(
                    "{} -> {} elapsed={}ms missed={}",
                    from.as_str(),
                    to.as_str(),
                    elapsed_ms,
                    missed_count
                );
                emit_event(
                    level,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        unit_id: Some(unit_id),
                        status: Some(to.as_str()),
                        detail: Some(&detail),
                        ..ObservabilityEvent::new("unit.health_changed", "watchdog")
                    },
                );
            }
            WatchdogEvent::AlertRaised {
                alert_id,
                unit_id,
                alert_type,
                ..
            } => {
                emit_event(
                    Level::WARN,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        unit_id: Some(unit_id),
                        alert_id: Some(alert_id),
                        status: Some(alert_type.as_str()),
                        ..ObservabilityEvent::new("alert.raised", "alerts")
                    },
                );
            }
            WatchdogEvent::AlertAcknowledged { alert_id, .. } => {
                emit_event(
                    Level::INFO,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        alert_id: Some(alert_id),
                        ..ObservabilityEvent::new("alert.acknowledged", "alerts")
                    },
                );
            }
            WatchdogEvent::RetryScheduled {
                unit_id,
                retry_count,
                retry_delay_ms,
                ..
            } => {
                let detail = format!("attempt {} delay={}ms", retry_count, retry_delay_ms);
                emit_event(
                    Level::WARN,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        unit_id: Some(unit_id),
                        detail: Some(&detail),
                        ..ObservabilityEvent::new("unit.retry_scheduled", "watchdog")
                    },
                );
            }
            WatchdogEvent::RetryExhausted {
                unit_id,
                retry_count,
                ..
            } => {
                let detail = format!("gave up after {} attempts", retry_count);
                emit_event(
                    Level::ERROR,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        unit_id: Some(unit_id),
                        error_code: Some("RETRY_EXHAUSTED"),
                        detail: Some(&detail),
                        ..ObservabilityEvent::new("unit.retry_exhausted", "watchdog")
                    },
                );
            }
            WatchdogEvent::SessionCorruptionDetected {
                session_key,
                tool_mismatch_count,
                ..
            } => {
                let hashed = short_hash(session_key);
                let detail = format!("tool_mismatch_count={}", tool_mismatch_count);
                emit_event(
                    Level::ERROR,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        session_key: Some(&hashed),
                        error_code: Some("SESSION_CORRUPTED"),
                        detail: Some(&detail),
                        ..ObservabilityEvent::new("session.corruption_detected", "recovery")
                    },
                );
            }
            WatchdogEvent::UnitRegistered { unit_id, .. } => {
                emit_event(
                    Level::INFO,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        unit_id: Some(unit_id),
                        ..ObservabilityEvent::new("unit.registered", "watchdog")
                    },
                );
            }
            WatchdogEvent::UnitEvicted { unit_id, .. } => {
                emit_event(
                    Level::INFO,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        unit_id: Some(unit_id),
                        ..ObservabilityEvent::new("unit.evicted", "watchdog")
                    },
                );
            }
            WatchdogEvent::HeartbeatReceived { .. } | WatchdogEvent::ScanCompleted { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn tracing_sink_accepts_every_event_shape() {
        let sink = TracingAuditSink;
        assert_eq!(sink.name(), "tracing");

        sink.notify(&WatchdogEvent::HealthChanged {
            unit_id: "task-1".to_string(),
            from: HealthState::Stale,
            to: HealthState::Failed,
            elapsed_ms: 700_000,
            missed_count: 23,
            timestamp: Utc::now(),
        })
        .await;

        sink.notify(&WatchdogEvent::SessionCorruptionDetected {
            session_key: "sess-9".to_string(),
            tool_mismatch_count: 3,
            timestamp: Utc::now(),
        })
        .await;
    }
}
