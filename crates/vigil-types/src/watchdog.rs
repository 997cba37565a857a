// Watchdog Types
// Core type definitions for liveness monitoring and alerting

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Monitored Units
// ============================================================================

/// Kind of work unit under liveness monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    /// A long-running task execution
    Task,
    /// A conversational session
    Session,
}

/// A work unit registered for monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredUnit {
    /// Unique unit identifier
    pub unit_id: String,
    /// Task or session
    pub kind: UnitKind,
    /// Priority band used for threshold lookup (e.g. "critical", "normal")
    #[serde(default = "default_priority")]
    pub priority: String,
    /// Unit type used for threshold lookup, more specific than priority
    #[serde(default = "default_unit_type")]
    pub unit_type: String,
    /// Agent or worker currently responsible, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
}

fn default_priority() -> String {
    "normal".to_string()
}

fn default_unit_type() -> String {
    "default".to_string()
}

impl MonitoredUnit {
    pub fn new(unit_id: impl Into<String>, kind: UnitKind) -> Self {
        Self {
            unit_id: unit_id.into(),
            kind,
            priority: default_priority(),
            unit_type: default_unit_type(),
            assignee: None,
        }
    }
}

/// Per-unit liveness bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    /// Last heartbeat received, if any
    pub last_heartbeat_at: Option<chrono::DateTime<chrono::Utc>>,
    /// When monitoring began; elapsed falls back to this before the first beat
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Consecutive heartbeat intervals missed, reset on every beat
    pub missed_count: u32,
    /// Failure retry attempts consumed so far
    pub retry_count: u32,
}

impl HeartbeatRecord {
    pub fn new(started_at: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            last_heartbeat_at: None,
            started_at: Some(started_at),
            missed_count: 0,
            retry_count: 0,
        }
    }
}

// ============================================================================
// Health States
// ============================================================================

/// Liveness classification, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Recent heartbeat within the warning threshold
    Healthy,
    /// Heartbeat overdue past the warning threshold
    Warning,
    /// Heartbeat overdue past the stale threshold
    Stale,
    /// Heartbeat overdue past the failure threshold and missed limit
    Failed,
}

impl HealthState {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Warning => "warning",
            HealthState::Stale => "stale",
            HealthState::Failed => "failed",
        }
    }
}

/// Point-in-time health of one unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitHealth {
    pub unit_id: String,
    pub state: HealthState,
    pub elapsed_ms: u64,
    pub missed_count: u32,
    pub retry_count: u32,
}

/// Aggregate counts by state across all monitored units
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub warning: usize,
    pub stale: usize,
    pub failed: usize,
}

/// A single upward state transition produced by a scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthTransition {
    pub unit_id: String,
    pub from: HealthState,
    pub to: HealthState,
    pub elapsed_ms: u64,
    pub missed_count: u32,
}

// ============================================================================
// Threshold Configuration
// ============================================================================

/// Timing thresholds and retry policy for a class of units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchdogThresholdConfig {
    /// Elapsed ms before a unit is flagged warning
    #[serde(default = "default_warning_threshold_ms")]
    pub warning_threshold_ms: u64,
    /// Elapsed ms before a unit is flagged stale
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: u64,
    /// Elapsed ms before a unit may be flagged failed
    #[serde(default = "default_failure_threshold_ms")]
    pub failure_threshold_ms: u64,
    /// Expected cadence of heartbeats
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Missed intervals required (together with the failure threshold) to fail
    #[serde(default = "default_missed_heartbeat_limit")]
    pub missed_heartbeat_limit: u32,
    /// Additional attempts granted after the first failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Advisory delay before a retried unit should be resumed
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_alert_flag")]
    pub alert_on_warning: bool,
    #[serde(default = "default_alert_flag")]
    pub alert_on_stale: bool,
    #[serde(default = "default_alert_flag")]
    pub alert_on_failure: bool,
}

fn default_warning_threshold_ms() -> u64 {
    120_000
}

fn default_stale_threshold_ms() -> u64 {
    300_000
}

fn default_failure_threshold_ms() -> u64 {
    600_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_missed_heartbeat_limit() -> u32 {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    60_000
}

fn default_alert_flag() -> bool {
    true
}

impl Default for WatchdogThresholdConfig {
    fn default() -> Self {
        Self {
            warning_threshold_ms: default_warning_threshold_ms(),
            stale_threshold_ms: default_stale_threshold_ms(),
            failure_threshold_ms: default_failure_threshold_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            missed_heartbeat_limit: default_missed_heartbeat_limit(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            alert_on_warning: default_alert_flag(),
            alert_on_stale: default_alert_flag(),
            alert_on_failure: default_alert_flag(),
        }
    }
}

/// Full watchdog configuration: scan settings plus threshold tables.
/// Lookup precedence is type-specific, then priority-specific, then global.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default)]
    pub global: WatchdogThresholdConfig,
    /// Overrides keyed by unit priority
    #[serde(default)]
    pub per_priority: HashMap<String, WatchdogThresholdConfig>,
    /// Overrides keyed by unit type
    #[serde(default)]
    pub per_type: HashMap<String, WatchdogThresholdConfig>,
    /// Cadence of the background scan loop
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    #[serde(default = "default_scan_enabled")]
    pub scan_enabled: bool,
}

fn default_scan_interval_ms() -> u64 {
    30_000
}

fn default_scan_enabled() -> bool {
    true
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            global: WatchdogThresholdConfig::default(),
            per_priority: HashMap::new(),
            per_type: HashMap::new(),
            scan_interval_ms: default_scan_interval_ms(),
            scan_enabled: default_scan_enabled(),
        }
    }
}

// ============================================================================
// Alerts
// ============================================================================

/// What an alert is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Warning,
    Stale,
    Failed,
    RetryExhausted,
}

impl AlertType {
    /// Alert type raised when a unit enters `state`, if any.
    pub fn for_state(state: HealthState) -> Option<Self> {
        match state {
            HealthState::Healthy => None,
            HealthState::Warning => Some(AlertType::Warning),
            HealthState::Stale => Some(AlertType::Stale),
            HealthState::Failed => Some(AlertType::Failed),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AlertType::Warning => "warning",
            AlertType::Stale => "stale",
            AlertType::Failed => "failed",
            AlertType::RetryExhausted => "retry_exhausted",
        }
    }
}

/// An alert record raised for a unit transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogAlert {
    /// Unique alert identifier
    pub id: String,
    pub unit_id: String,
    pub alert_type: AlertType,
    /// Human-readable description of what was observed
    pub message: String,
    #[serde(default)]
    pub acknowledged: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl WatchdogAlert {
    pub fn new(unit_id: impl Into<String>, alert_type: AlertType, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            unit_id: unit_id.into(),
            alert_type,
            message: message.into(),
            acknowledged: false,
            created_at: chrono::Utc::now(),
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Event types for the broadcast bus and the append-only log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchdogEvent {
    UnitRegistered {
        unit_id: String,
        kind: UnitKind,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    UnitEvicted {
        unit_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    HeartbeatReceived {
        unit_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    HealthChanged {
        unit_id: String,
        from: HealthState,
        to: HealthState,
        elapsed_ms: u64,
        missed_count: u32,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    AlertRaised {
        alert_id: String,
        unit_id: String,
        alert_type: AlertType,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    AlertAcknowledged {
        alert_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    RetryScheduled {
        unit_id: String,
        retry_count: u32,
        retry_delay_ms: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    RetryExhausted {
        unit_id: String,
        retry_count: u32,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    ScanCompleted {
        scanned: usize,
        transitions: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    SessionCorruptionDetected {
        session_key: String,
        tool_mismatch_count: u32,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}
