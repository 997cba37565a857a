// Recovery Orchestrator
// Session health lifecycle and the advisory recovery plan

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::sync::RwLock;

use crate::audit::AuditSink;
use crate::error::{Result, WatchdogError};
use crate::event_bus::EventBus;
use crate::storage::{load_json_or_default, save_json, SESSION_HEALTH_FILE};
use crate::validator::analyze_error_message;
use vigil_types::{
    RecoveryStep, SessionHealthAction, SessionHealthRecord, SessionStatus, WatchdogEvent,
};

/// Corruption reports required before a session is declared corrupted.
const CORRUPTION_REPORT_LIMIT: u32 = 3;

// ============================================================================
// Session Health Store
// ============================================================================

pub struct SessionHealthStore {
    base: PathBuf,
    records: RwLock<HashMap<String, SessionHealthRecord>>,
}

impl SessionHealthStore {
    pub async fn new(base: impl AsRef<Path>) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        let records = load_json_or_default(&base.join(SESSION_HEALTH_FILE)).await?;
        Ok(Self {
            base,
            records: RwLock::new(records),
        })
    }

    pub async fn get(&self, session_key: &str) -> Option<SessionHealthRecord> {
        self.records.read().await.get(session_key).cloned()
    }

    pub async fn get_or_create(
        &self,
        session_key: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionHealthRecord> {
        let (record, created) = {
            let mut records = self.records.write().await;
            match records.get(session_key) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let record = records
                        .entry(session_key.to_string())
                        .or_insert_with(|| SessionHealthRecord::new(session_key, now))
                        .clone();
                    (record, true)
                }
            }
        };
        if created {
            self.flush().await?;
        }
        Ok(record)
    }

    /// Read-modify-write under one write guard, so concurrent reports
    /// for the same session never lose updates.
    pub async fn update<F>(
        &self,
        session_key: &str,
        now: DateTime<Utc>,
        mutate: F,
    ) -> Result<SessionHealthRecord>
    where
        F: FnOnce(&mut SessionHealthRecord),
    {
        let record = {
            let mut records = self.records.write().await;
            let record = records
                .entry(session_key.to_string())
                .or_insert_with(|| SessionHealthRecord::new(session_key, now));
            mutate(record);
            record.clone()
        };
        self.flush().await?;
        Ok(record)
    }

    /// Most recently active first.
    pub async fn list(&self) -> Vec<SessionHealthRecord> {
        let mut records: Vec<SessionHealthRecord> =
            self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        records
    }

    /// Records are never evicted implicitly; this is the only removal path.
    pub async fn delete(&self, session_key: &str) -> Result<bool> {
        let removed = self.records.write().await.remove(session_key).is_some();
        if removed {
            self.flush().await?;
        }
        Ok(removed)
    }

    async fn flush(&self) -> Result<()> {
        let snapshot = self.records.read().await.clone();
        save_json(&self.base.join(SESSION_HEALTH_FILE), &snapshot).await
    }
}

// ============================================================================
// Recovery Orchestrator
// ============================================================================

pub struct RecoveryOrchestrator {
    store: Arc<SessionHealthStore>,
    bus: EventBus,
    audit: Arc<dyn AuditSink>,
}

impl RecoveryOrchestrator {
    pub fn new(store: Arc<SessionHealthStore>, bus: EventBus, audit: Arc<dyn AuditSink>) -> Self {
        Self { store, bus, audit }
    }

    /// Dispatch one session-health action.
    pub async fn apply(
        &self,
        session_key: &str,
        action: SessionHealthAction,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<SessionHealthRecord> {
        match action {
            SessionHealthAction::ReportError => {
                let Some(error) = error else {
                    return Err(WatchdogError::InvalidInput(
                        "report_error requires an error message".to_string(),
                    ));
                };
                self.report_error(session_key, error, now).await
            }
            SessionHealthAction::Clear => self.clear(session_key, now).await,
            SessionHealthAction::Heartbeat => self.heartbeat(session_key, now).await,
        }
    }

    /// Record an error against a session. Errors matching a corruption
    /// signature escalate the session; other errors only count.
    pub async fn report_error(
        &self,
        session_key: &str,
        error_text: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionHealthRecord> {
        let analysis = analyze_error_message(error_text);
        let record = self
            .store
            .update(session_key, now, |record| {
                record.error_count += 1;
                record.last_error = Some(error_text.to_string());
                record.last_activity_at = now;
                if analysis.is_corruption {
                    record.tool_mismatch_count += 1;
                    if record.tool_mismatch_count >= CORRUPTION_REPORT_LIMIT {
                        record.status = SessionStatus::Corrupted;
                        record.recommendations = corrupted_recommendations();
                    } else {
                        record.status = SessionStatus::Warning;
                        record.recommendations = warning_recommendations();
                    }
                }
            })
            .await?;

        if record.status == SessionStatus::Corrupted {
            let event = WatchdogEvent::SessionCorruptionDetected {
                session_key: session_key.to_string(),
                tool_mismatch_count: record.tool_mismatch_count,
                timestamp: now,
            };
            self.bus.publish(event.clone());
            self.audit.notify(&event).await;
        }

        Ok(record)
    }

    /// Reset the session to a clean slate from any state.
    pub async fn clear(
        &self,
        session_key: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionHealthRecord> {
        self.store
            .update(session_key, now, |record| {
                record.status = SessionStatus::Healthy;
                record.error_count = 0;
                record.tool_mismatch_count = 0;
                record.last_error = None;
                record.recommendations.clear();
                record.last_activity_at = now;
            })
            .await
    }

    /// Refresh activity. The status only returns to healthy when no
    /// errors are outstanding.
    pub async fn heartbeat(
        &self,
        session_key: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionHealthRecord> {
        self.store
            .update(session_key, now, |record| {
                record.last_activity_at = now;
                if record.error_count == 0 {
                    record.status = SessionStatus::Healthy;
                }
            })
            .await
    }

    /// Read path for callers: a session that was never reported yields a
    /// well-formed record with `unknown` status, never an error, and is
    /// not persisted by the read.
    pub async fn get_or_unknown(
        &self,
        session_key: &str,
        now: DateTime<Utc>,
    ) -> SessionHealthRecord {
        match self.store.get(session_key).await {
            Some(record) => record,
            None => {
                let mut record = SessionHealthRecord::new(session_key, now);
                record.status = SessionStatus::Unknown;
                record
            }
        }
    }

    pub async fn list(&self) -> Vec<SessionHealthRecord> {
        self.store.list().await
    }

    pub async fn delete(&self, session_key: &str) -> Result<bool> {
        self.store.delete(session_key).await
    }
}

fn corrupted_recommendations() -> Vec<String> {
    vec![
        "Pause the agent before touching session history".to_string(),
        "Clear the session history to remove mismatched tool calls".to_string(),
        "Verify session health after the agent resumes".to_string(),
    ]
}

fn warning_recommendations() -> Vec<String> {
    vec![
        "Monitor the session for repeated tool mismatches".to_string(),
        "Validate the tool-call history before the next turn".to_string(),
    ]
}

/// The fixed, ordered recovery plan. Advisory only: each step is
/// executed by the agent-control and session-storage collaborators,
/// never by the watchdog itself.
pub fn recovery_steps() -> Vec<RecoveryStep> {
    vec![
        RecoveryStep {
            order: 1,
            action: "pause_agent".to_string(),
            description: "Pause the agent executing against this session".to_string(),
            optional: false,
        },
        RecoveryStep {
            order: 2,
            action: "export_context".to_string(),
            description: "Export the conversation context for later review".to_string(),
            optional: true,
        },
        RecoveryStep {
            order: 3,
            action: "clear_session".to_string(),
            description: "Clear the session's tool-call history".to_string(),
            optional: false,
        },
        RecoveryStep {
            order: 4,
            action: "resume_agent".to_string(),
            description: "Resume the agent with a clean history".to_string(),
            optional: false,
        },
        RecoveryStep {
            order: 5,
            action: "verify_health".to_string(),
            description: "Verify the session reports healthy after resuming".to_string(),
            optional: false,
        },
    ]
}

// ============================================================================
// Tests
// ============================================================================
