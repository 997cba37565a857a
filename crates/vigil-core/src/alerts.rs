// Alert Manager
// Creation, deduplication, and acknowledgement of watchdog alerts

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::sync::RwLock;

use crate::error::{Result, WatchdogError};
use crate::storage::{load_json_or_default, save_json, ALERTS_FILE};
use vigil_types::{AlertType, HealthTransition, WatchdogAlert, WatchdogThresholdConfig};

pub struct AlertManager {
    base: PathBuf,
    alerts: RwLock<Vec<WatchdogAlert>>,
}

impl AlertManager {
    pub async fn new(base: impl AsRef<Path>) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        let alerts = load_json_or_default(&base.join(ALERTS_FILE)).await?;
        Ok(Self {
            base,
            alerts: RwLock::new(alerts),
        })
    }

    /// Raise the alert matching a state transition, subject to the
    /// per-state alert switches. Returns the created alert, or `None`
    /// when suppressed or deduplicated.
    pub async fn on_transition(
        &self,
        transition: &HealthTransition,
        thresholds: &WatchdogThresholdConfig,
    ) -> Result<Option<WatchdogAlert>> {
        let Some(alert_type) = AlertType::for_state(transition.to) else {
            return Ok(None);
        };
        let enabled = match alert_type {
            AlertType::Warning => thresholds.alert_on_warning,
            AlertType::Stale => thresholds.alert_on_stale,
            AlertType::Failed => thresholds.alert_on_failure,
            AlertType::RetryExhausted => true,
        };
        if !enabled {
            return Ok(None);
        }
        let message = format!(
            "unit {} went {} -> {} after {} ms without a heartbeat ({} intervals missed)",
            transition.unit_id,
            transition.from.as_str(),
            transition.to.as_str(),
            transition.elapsed_ms,
            transition.missed_count
        );
        self.raise(&transition.unit_id, alert_type, message).await
    }

    /// Create an alert unless an unacknowledged one of the same type
    /// already exists for the unit. Acknowledged alerts never suppress;
    /// a repeat of the condition after acknowledgement is a new alert.
    pub async fn raise(
        &self,
        unit_id: &str,
        alert_type: AlertType,
        message: String,
    ) -> Result<Option<WatchdogAlert>> {
        let created = {
            let mut alerts = self.alerts.write().await;
            let duplicate = alerts
                .iter()
                .any(|a| a.unit_id == unit_id && a.alert_type == alert_type && !a.acknowledged);
            if duplicate {
                None
            } else {
                let alert = WatchdogAlert::new(unit_id, alert_type, message);
                alerts.push(alert.clone());
                Some(alert)
            }
        };
        if created.is_some() {
            self.flush().await?;
        }
        Ok(created)
    }

    /// Idempotent: acknowledging twice changes nothing and returns the
    /// unchanged record.
    pub async fn acknowledge(&self, alert_id: &str) -> Result<WatchdogAlert> {
        let (alert, changed) = {
            let mut alerts = self.alerts.write().await;
            let Some(alert) = alerts.iter_mut().find(|a| a.id == alert_id) else {
                return Err(WatchdogError::UnknownAlert(alert_id.to_string()));
            };
            let changed = !alert.acknowledged;
            alert.acknowledged = true;
            (alert.clone(), changed)
        };
        if changed {
            self.flush().await?;
        }
        Ok(alert)
    }

    /// Newest first, optionally filtered by unit and acknowledgement.
    pub async fn list(
        &self,
        unit_id: Option<&str>,
        acknowledged: Option<bool>,
    ) -> Vec<WatchdogAlert> {
        let mut alerts: Vec<WatchdogAlert> = self
            .alerts
            .read()
            .await
            .iter()
            .filter(|a| unit_id.map(|u| a.unit_id == u).unwrap_or(true))
            .filter(|a| acknowledged.map(|ack| a.acknowledged == ack).unwrap_or(true))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        alerts
    }

    async fn flush(&self) -> Result<()> {
        let snapshot = self.alerts.read().await.clone();
        save_json(&self.base.join(ALERTS_FILE), &snapshot).await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;
    use vigil_types::HealthState;

    fn transition(unit_id: &str, from: HealthState, to: HealthState) -> HealthTransition {
        HealthTransition {
            unit_id: unit_id.to_string(),
            from,
            to,
            elapsed_ms: 200_000,
            missed_count: 6,
        }
    }

    #[tokio::test]
    async fn repeated_transition_keeps_one_unacknowledged_alert() {
        let temp = tempdir().unwrap();
        let manager = AlertManager::new(temp.path()).await.unwrap();
        let thresholds = WatchdogThresholdConfig::default();

        let t = transition("task-1", HealthState::Healthy, HealthState::Warning);
        assert!(manager.on_transition(&t, &thresholds).await.unwrap().is_some());
        assert!(manager.on_transition(&t, &thresholds).await.unwrap().is_none());

        let open = manager.list(Some("task-1"), Some(false)).await;
        assert_eq!(open.len(), 1);
    }

    #[tokio::test]
    async fn higher_severity_is_not_deduplicated() {
        let temp = tempdir().unwrap();
        let manager = AlertManager::new(temp.path()).await.unwrap();
        let thresholds = WatchdogThresholdConfig::default();

        let warn = transition("task-1", HealthState::Healthy, HealthState::Warning);
        let stale = transition("task-1", HealthState::Warning, HealthState::Stale);
        assert!(manager.on_transition(&warn, &thresholds).await.unwrap().is_some());
        assert!(manager.on_transition(&stale, &thresholds).await.unwrap().is_some());

        assert_eq!(manager.list(Some("task-1"), Some(false)).await.len(), 2);
    }

    #[tokio::test]
    async fn acknowledge_is_idempotent() {
        let temp = tempdir().unwrap();
        let manager = AlertManager::new(temp.path()).await.unwrap();
        let thresholds = WatchdogThresholdConfig::default();

        let t = transition("task-1", HealthState::Warning, HealthState::Stale);
        let alert = manager
            .on_transition(&t, &thresholds)
            .await
            .unwrap()
            .unwrap();

        let first = manager.acknowledge(&alert.id).await.unwrap();
        let second = manager.acknowledge(&alert.id).await.unwrap();
        assert!(first.acknowledged && second.acknowledged);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(manager.list(None, None).await.len(), 1);
    }

    #[tokio::test]
    async fn acknowledged_alert_no_longer_suppresses() {
        let temp = tempdir().unwrap();
        let manager = AlertManager::new(temp.path()).await.unwrap();
        let thresholds = WatchdogThresholdConfig::default();

        let t = transition("task-1", HealthState::Healthy, HealthState::Warning);
        let alert = manager
            .on_transition(&t, &thresholds)
            .await
            .unwrap()
            .unwrap();
        manager.acknowledge(&alert.id).await.unwrap();

        assert!(manager.on_transition(&t, &thresholds).await.unwrap().is_some());
        assert_eq!(manager.list(Some("task-1"), None).await.len(), 2);
    }

    #[tokio::test]
    async fn alert_switches_gate_by_state() {
        let temp = tempdir().unwrap();
        let manager = AlertManager::new(temp.path()).await.unwrap();
        let thresholds = WatchdogThresholdConfig {
            alert_on_warning: false,
            ..WatchdogThresholdConfig::default()
        };

        let warn = transition("task-1", HealthState::Healthy, HealthState::Warning);
        let failed = transition("task-1", HealthState::Stale, HealthState::Failed);
        assert!(manager.on_transition(&warn, &thresholds).await.unwrap().is_none());
        assert!(manager.on_transition(&failed, &thresholds).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unknown_alert_id_is_an_error() {
        let temp = tempdir().unwrap();
        let manager = AlertManager::new(temp.path()).await.unwrap();

        let err = manager.acknowledge("missing").await.unwrap_err();
        assert!(matches!(err, WatchdogError::UnknownAlert(_)));
    }

    #[tokio::test]
    async fn list_sorts_newest_first_from_loaded_snapshot() {
        let temp = tempdir().unwrap();

        let older = WatchdogAlert {
            id: "a-old".to_string(),
            unit_id: "task-1".to_string(),
            alert_type: AlertType::Warning,
            message: "old".to_string(),
            acknowledged: true,
            created_at: chrono::Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        };
        let newer = WatchdogAlert {
            id: "a-new".to_string(),
            unit_id: "task-1".to_string(),
            alert_type: AlertType::Stale,
            message: "new".to_string(),
            acknowledged: false,
            created_at: chrono::Utc.timestamp_opt(1_700_000_900, 0).unwrap(),
        };
        let snapshot = vec![older, newer];
        std::fs::write(
            temp.path().join(ALERTS_FILE),
            serde_json::to_string_pretty(&snapshot).unwrap(),
        )
        .unwrap();

        let manager = AlertManager::new(temp.path()).await.unwrap();
        let listed = manager.list(None, None).await;
        assert_eq!(listed[0].id, "a-new");
        assert_eq!(listed[1].id, "a-old");

        let open = manager.list(None, Some(false)).await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "a-new");
    }

    #[tokio::test]
    async fn alerts_survive_reload() {
        let temp = tempdir().unwrap();
        {
            let manager = AlertManager::new(temp.path()).await.unwrap();
            manager
                .raise("task-1", AlertType::RetryExhausted, "out of retries".to_string())
                .await
                .unwrap();
        }
        let manager = AlertManager::new(temp.path()).await.unwrap();
        let listed = manager.list(Some("task-1"), None).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].alert_type, AlertType::RetryExhausted);
    }
}
