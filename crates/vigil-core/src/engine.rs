//! Health classification and the scan loop.
//!
//! The engine owns the unit registry and the current health state of
//! every monitored unit. A scan is one pass over the registry: compute
//! how long each unit has gone without a heartbeat, classify that gap
//! against the unit's resolved thresholds, and fan out any transition
//! to the alert manager, the event bus, and the audit sink.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use vigil_types::{
    AlertType, HealthState, HealthSummary, HealthTransition, MonitoredUnit, UnitHealth,
    WatchdogEvent, WatchdogThresholdConfig,
};

use crate::alerts::AlertManager;
use crate::audit::AuditSink;
use crate::config::WatchdogConfigStore;
use crate::error::{Result, WatchdogError};
use crate::event_bus::EventBus;
use crate::heartbeat::{HeartbeatStore, MissedUpdate};
use crate::storage::{load_json_or_default, save_json, UNITS_FILE};
use crate::thresholds::resolve_thresholds;

// ============================================================================
// Classification
// ============================================================================

/// Classify a heartbeat gap against a set of thresholds.
///
/// Returns the health state together with the number of whole heartbeat
/// intervals that fit into the gap. Threshold comparisons are inclusive,
/// so a gap sitting exactly on a boundary takes the more severe state.
/// `failed` additionally requires the missed-interval count to reach
/// `missed_heartbeat_limit`; a long gap with a generous interval stays
/// `stale` until both conditions hold.
pub fn classify_elapsed(
    elapsed_ms: u64,
    thresholds: &WatchdogThresholdConfig,
) -> (HealthState, u32) {
    let interval = thresholds.heartbeat_interval_ms.max(1);
    let missed = u32::try_from(elapsed_ms / interval).unwrap_or(u32::MAX);
    let state = if missed >= thresholds.missed_heartbeat_limit
        && elapsed_ms >= thresholds.failure_threshold_ms
    {
        HealthState::Failed
    } else if elapsed_ms >= thresholds.stale_threshold_ms {
        HealthState::Stale
    } else if elapsed_ms >= thresholds.warning_threshold_ms {
        HealthState::Warning
    } else {
        HealthState::Healthy
    };
    (state, missed)
}

// ============================================================================
// Engine
// ============================================================================

/// Result of one scan pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Units examined (eligible or not).
    pub scanned: usize,
    /// Units whose health state changed this pass.
    pub transitions: usize,
}

pub struct WatchdogEngine {
    base: PathBuf,
    units: RwLock<HashMap<String, MonitoredUnit>>,
    /// Current classification per unit. Rebuilt as `healthy` on startup;
    /// the first scan re-derives the real states from the heartbeat log.
    states: RwLock<HashMap<String, HealthState>>,
    config: WatchdogConfigStore,
    heartbeats: Arc<HeartbeatStore>,
    alerts: Arc<AlertManager>,
    bus: EventBus,
    audit: Arc<dyn AuditSink>,
    /// Held for the duration of a scan so ticks never overlap. A tick
    /// that finds the lock taken skips instead of queueing.
    scan_lock: Mutex<()>,
}

impl WatchdogEngine {
    pub async fn new(
        base: impl AsRef<Path>,
        config: WatchdogConfigStore,
        heartbeats: Arc<HeartbeatStore>,
        alerts: Arc<AlertManager>,
        bus: EventBus,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        let units: HashMap<String, MonitoredUnit> =
            load_json_or_default(&base.join(UNITS_FILE)).await?;
        let states = units
            .keys()
            .map(|id| (id.clone(), HealthState::Healthy))
            .collect();
        Ok(Self {
            base,
            units: RwLock::new(units),
            states: RwLock::new(states),
            config,
            heartbeats,
            alerts,
            bus,
            audit,
            scan_lock: Mutex::new(()),
        })
    }

    /// Register a unit for monitoring, anchoring its heartbeat window at
    /// `now`. Re-registering an existing unit updates its metadata and
    /// leaves the heartbeat history and health state untouched.
    pub async fn register(&self, unit: MonitoredUnit, now: DateTime<Utc>) -> Result<MonitoredUnit> {
        if unit.unit_id.trim().is_empty() {
            return Err(WatchdogError::InvalidInput("unit_id is required".into()));
        }
        {
            let mut units = self.units.write().await;
            units.insert(unit.unit_id.clone(), unit.clone());
        }
        self.states
            .write()
            .await
            .entry(unit.unit_id.clone())
            .or_insert(HealthState::Healthy);
        self.heartbeats.get_or_create(&unit.unit_id, now).await?;
        self.flush_units().await?;
        let event = WatchdogEvent::UnitRegistered {
            unit_id: unit.unit_id.clone(),
            kind: unit.kind,
            timestamp: now,
        };
        self.audit.notify(&event).await;
        self.bus.publish(event);
        Ok(unit)
    }

    pub async fn list_units(&self) -> Vec<MonitoredUnit> {
        let mut units: Vec<MonitoredUnit> = self.units.read().await.values().cloned().collect();
        units.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));
        units
    }

    /// Stop monitoring a unit and drop its heartbeat history.
    pub async fn evict(&self, unit_id: &str, now: DateTime<Utc>) -> Result<()> {
        let removed = self.units.write().await.remove(unit_id);
        if removed.is_none() {
            return Err(WatchdogError::UnknownUnit(unit_id.to_string()));
        }
        self.states.write().await.remove(unit_id);
        self.heartbeats.evict(unit_id).await?;
        self.flush_units().await?;
        let event = WatchdogEvent::UnitEvicted {
            unit_id: unit_id.to_string(),
            timestamp: now,
        };
        self.audit.notify(&event).await;
        self.bus.publish(event);
        Ok(())
    }

    /// Record a heartbeat. The missed counter resets immediately and any
    /// non-terminal state drops back to `healthy` without waiting for the
    /// next scan. A unit that exhausted its retries stays `failed`; only
    /// eviction or a fresh registration brings it back.
    pub async fn heartbeat(&self, unit_id: &str, now: DateTime<Utc>) -> Result<()> {
        if !self.units.read().await.contains_key(unit_id) {
            return Err(WatchdogError::UnknownUnit(unit_id.to_string()));
        }
        self.heartbeats.record_heartbeat(unit_id, now).await?;
        {
            let mut states = self.states.write().await;
            let state = states.entry(unit_id.to_string()).or_insert(HealthState::Healthy);
            if *state != HealthState::Failed {
                *state = HealthState::Healthy;
            }
        }
        let event = WatchdogEvent::HeartbeatReceived {
            unit_id: unit_id.to_string(),
            timestamp: now,
        };
        self.audit.notify(&event).await;
        self.bus.publish(event);
        Ok(())
    }

    /// Health of a single unit as of the last scan, with the elapsed time
    /// recomputed against `now`.
    pub async fn unit_health(&self, unit_id: &str, now: DateTime<Utc>) -> Result<UnitHealth> {
        if !self.units.read().await.contains_key(unit_id) {
            return Err(WatchdogError::UnknownUnit(unit_id.to_string()));
        }
        let state = self
            .states
            .read()
            .await
            .get(unit_id)
            .copied()
            .unwrap_or(HealthState::Healthy);
        let record = self.heartbeats.get(unit_id).await;
        let elapsed_ms = self
            .heartbeats
            .time_since_heartbeat(unit_id, now)
            .await
            .unwrap_or(0);
        Ok(UnitHealth {
            unit_id: unit_id.to_string(),
            state,
            elapsed_ms,
            missed_count: record.as_ref().map(|r| r.missed_count).unwrap_or(0),
            retry_count: record.as_ref().map(|r| r.retry_count).unwrap_or(0),
        })
    }

    pub async fn summary(&self) -> HealthSummary {
        let states = self.states.read().await;
        let mut summary = HealthSummary {
            total: states.len(),
            ..HealthSummary::default()
        };
        for state in states.values() {
            match state {
                HealthState::Healthy => summary.healthy += 1,
                HealthState::Warning => summary.warning += 1,
                HealthState::Stale => summary.stale += 1,
                HealthState::Failed => summary.failed += 1,
            }
        }
        summary
    }

    /// One scan pass over the registry.
    ///
    /// States only move toward higher severity here; recovery happens
    /// through heartbeats or the retry policy. A unit whose thresholds
    /// fail to resolve is skipped with a warning so the rest of the
    /// registry still gets scanned. A heartbeat that lands mid-pass
    /// outranks the pass's own reading for that unit.
    pub async fn scan(&self, now: DateTime<Utc>) -> ScanOutcome {
        let Ok(_guard) = self.scan_lock.try_lock() else {
            tracing::debug!("previous scan still running, skipping this tick");
            return ScanOutcome { scanned: 0, transitions: 0 };
        };
        let config = self.config.snapshot().await;
        let units: Vec<MonitoredUnit> = self.units.read().await.values().cloned().collect();
        let mut transitions = 0usize;
        let mut missed_updates: Vec<MissedUpdate> = Vec::new();

        for unit in &units {
            let thresholds = match resolve_thresholds(&config, unit) {
                Ok(thresholds) => thresholds,
                Err(err) => {
                    tracing::warn!(
                        unit_id = %unit.unit_id,
                        error = %err,
                        "skipping unit with unresolvable thresholds"
                    );
                    continue;
                }
            };
            let Some((elapsed_ms, seen_heartbeat_at)) = self
                .heartbeats
                .elapsed_with_anchor(&unit.unit_id, now)
                .await
            else {
                tracing::debug!(unit_id = %unit.unit_id, "no heartbeat timeline yet");
                continue;
            };
            let (candidate, missed) = classify_elapsed(elapsed_ms, &thresholds);
            missed_updates.push(MissedUpdate {
                unit_id: unit.unit_id.clone(),
                missed,
                seen_heartbeat_at,
            });

            let current = self
                .states
                .read()
                .await
                .get(&unit.unit_id)
                .copied()
                .unwrap_or(HealthState::Healthy);
            if candidate <= current {
                continue;
            }
            {
                // Commit only while the anchor is unchanged. A heartbeat
                // or eviction landing after the elapsed read makes this
                // classification stale, and the reset it carries wins.
                let mut states = self.states.write().await;
                let Some(fresh) = self.heartbeats.get(&unit.unit_id).await else {
                    continue;
                };
                if fresh.last_heartbeat_at != seen_heartbeat_at {
                    tracing::debug!(
                        unit_id = %unit.unit_id,
                        "heartbeat landed mid-scan, dropping stale classification"
                    );
                    continue;
                }
                states.insert(unit.unit_id.clone(), candidate);
            }
            transitions += 1;

            let transition = HealthTransition {
                unit_id: unit.unit_id.clone(),
                from: current,
                to: candidate,
                elapsed_ms,
                missed_count: missed,
            };
            let event = WatchdogEvent::HealthChanged {
                unit_id: transition.unit_id.clone(),
                from: transition.from,
                to: transition.to,
                elapsed_ms: transition.elapsed_ms,
                missed_count: transition.missed_count,
                timestamp: now,
            };
            self.audit.notify(&event).await;
            self.bus.publish(event);

            match self.alerts.on_transition(&transition, &thresholds).await {
                Ok(Some(alert)) => {
                    self.publish_alert_raised(&alert.id, &alert.unit_id, alert.alert_type, now)
                        .await
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(
                        unit_id = %unit.unit_id,
                        error = %err,
                        "failed to persist alert for transition"
                    );
                }
            }

            if candidate == HealthState::Failed {
                match self.handle_failure(&unit.unit_id, &thresholds, now).await {
                    // A granted retry already reset the heartbeat window;
                    // drop this unit's pending missed-count update so the
                    // batch write below does not undo the reset.
                    Ok(true) => {
                        missed_updates.pop();
                    }
                    Ok(false) => {}
                    Err(err) => {
                        tracing::warn!(
                            unit_id = %unit.unit_id,
                            error = %err,
                            "retry bookkeeping failed"
                        );
                    }
                }
            }
        }

        if let Err(err) = self.heartbeats.apply_missed_counts(&missed_updates).await {
            tracing::warn!(error = %err, "failed to persist missed counts, will retry next scan");
        }
        let outcome = ScanOutcome { scanned: units.len(), transitions };
        let event = WatchdogEvent::ScanCompleted {
            scanned: outcome.scanned,
            transitions: outcome.transitions,
            timestamp: now,
        };
        self.audit.notify(&event).await;
        self.bus.publish(event);
        outcome
    }

    /// Apply the retry policy to a unit that just classified as failed.
    ///
    /// While the retry budget lasts, the unit is reset to `healthy` with
    /// a fresh heartbeat window; the restart itself is advisory and left
    /// to the orchestrating side. The attempt that crosses the budget is
    /// still counted, announced once, and leaves the unit terminally
    /// `failed`. Returns whether a retry was granted.
    async fn handle_failure(
        &self,
        unit_id: &str,
        thresholds: &WatchdogThresholdConfig,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let record = self.heartbeats.get_or_create(unit_id, now).await?;
        if record.retry_count < thresholds.max_retries {
            let updated = self.heartbeats.grant_retry(unit_id, now).await?;
            self.states
                .write()
                .await
                .insert(unit_id.to_string(), HealthState::Healthy);
            let event = WatchdogEvent::RetryScheduled {
                unit_id: unit_id.to_string(),
                retry_count: updated.retry_count,
                retry_delay_ms: thresholds.retry_delay_ms,
                timestamp: now,
            };
            self.audit.notify(&event).await;
            self.bus.publish(event);
            return Ok(true);
        }
        if record.retry_count == thresholds.max_retries {
            let updated = self.heartbeats.increment_retry(unit_id).await?;
            let event = WatchdogEvent::RetryExhausted {
                unit_id: unit_id.to_string(),
                retry_count: updated.retry_count,
                timestamp: now,
            };
            self.audit.notify(&event).await;
            self.bus.publish(event);
            let message = format!(
                "unit {} stayed failed after {} attempts, giving up",
                unit_id, updated.retry_count
            );
            match self.alerts.raise(unit_id, AlertType::RetryExhausted, message).await {
                Ok(Some(alert)) => {
                    self.publish_alert_raised(&alert.id, &alert.unit_id, alert.alert_type, now)
                        .await
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(unit_id, error = %err, "failed to persist retry_exhausted alert");
                }
            }
        }
        // Beyond the budget the unit already announced exhaustion in an
        // earlier pass; it stays failed without further events.
        Ok(false)
    }

    async fn publish_alert_raised(
        &self,
        alert_id: &str,
        unit_id: &str,
        alert_type: AlertType,
        now: DateTime<Utc>,
    ) {
        let event = WatchdogEvent::AlertRaised {
            alert_id: alert_id.to_string(),
            unit_id: unit_id.to_string(),
            alert_type,
            timestamp: now,
        };
        self.audit.notify(&event).await;
        self.bus.publish(event);
    }

    async fn flush_units(&self) -> Result<()> {
        let snapshot = self.units.read().await.clone();
        save_json(&self.base.join(UNITS_FILE), &snapshot).await
    }
}

// ============================================================================
// Tests
// ============================================================================
