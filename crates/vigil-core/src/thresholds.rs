// Threshold Resolver
// Maps a unit's type and priority to the applicable timing configuration

use crate::error::{Result, WatchdogError};
use vigil_types::{MonitoredUnit, WatchdogConfig, WatchdogThresholdConfig};

/// Resolve the thresholds for one unit. Precedence is type-specific,
/// then priority-specific, then global. A matched entry that fails
/// validation is an error so the caller can skip just that unit; an
/// unusable global entry falls back to the built-in defaults so the
/// scan loop never stalls on configuration.
pub fn resolve_thresholds(
    config: &WatchdogConfig,
    unit: &MonitoredUnit,
) -> Result<WatchdogThresholdConfig> {
    if let Some(cfg) = config.per_type.get(&unit.unit_type) {
        validate_thresholds(cfg)
            .map_err(|e| WatchdogError::Config(format!("per_type[{}]: {}", unit.unit_type, e)))?;
        return Ok(cfg.clone());
    }
    if let Some(cfg) = config.per_priority.get(&unit.priority) {
        validate_thresholds(cfg)
            .map_err(|e| WatchdogError::Config(format!("per_priority[{}]: {}", unit.priority, e)))?;
        return Ok(cfg.clone());
    }
    if validate_thresholds(&config.global).is_ok() {
        Ok(config.global.clone())
    } else {
        Ok(WatchdogThresholdConfig::default())
    }
}

/// Thresholds must be strictly increasing and the counters usable.
pub fn validate_thresholds(cfg: &WatchdogThresholdConfig) -> std::result::Result<(), String> {
    if cfg.warning_threshold_ms >= cfg.stale_threshold_ms {
        return Err(format!(
            "warning_threshold_ms {} must be below stale_threshold_ms {}",
            cfg.warning_threshold_ms, cfg.stale_threshold_ms
        ));
    }
    if cfg.stale_threshold_ms >= cfg.failure_threshold_ms {
        return Err(format!(
            "stale_threshold_ms {} must be below failure_threshold_ms {}",
            cfg.stale_threshold_ms, cfg.failure_threshold_ms
        ));
    }
    if cfg.heartbeat_interval_ms == 0 {
        return Err("heartbeat_interval_ms must be positive".to_string());
    }
    if cfg.missed_heartbeat_limit == 0 {
        return Err("missed_heartbeat_limit must be at least 1".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_types::UnitKind;

    fn thresholds(warning: u64, stale: u64, failure: u64) -> WatchdogThresholdConfig {
        WatchdogThresholdConfig {
            warning_threshold_ms: warning,
            stale_threshold_ms: stale,
            failure_threshold_ms: failure,
            ..WatchdogThresholdConfig::default()
        }
    }

    #[test]
    fn type_entry_wins_over_priority_and_global() {
        let mut config = WatchdogConfig::default();
        config
            .per_priority
            .insert("critical".to_string(), thresholds(10, 20, 30));
        config
            .per_type
            .insert("build".to_string(), thresholds(1, 2, 3));

        let mut unit = MonitoredUnit::new("u1", UnitKind::Task);
        unit.priority = "critical".to_string();
        unit.unit_type = "build".to_string();

        let resolved = resolve_thresholds(&config, &unit).unwrap();
        assert_eq!(resolved.warning_threshold_ms, 1);
    }

    #[test]
    fn priority_entry_wins_over_global() {
        let mut config = WatchdogConfig::default();
        config
            .per_priority
            .insert("critical".to_string(), thresholds(10, 20, 30));

        let mut unit = MonitoredUnit::new("u1", UnitKind::Task);
        unit.priority = "critical".to_string();

        let resolved = resolve_thresholds(&config, &unit).unwrap();
        assert_eq!(resolved.failure_threshold_ms, 30);
    }

    #[test]
    fn unmatched_unit_gets_global() {
        let config = WatchdogConfig::default();
        let unit = MonitoredUnit::new("u1", UnitKind::Session);

        let resolved = resolve_thresholds(&config, &unit).unwrap();
        assert_eq!(resolved, config.global);
    }

    #[test]
    fn invalid_matched_entry_is_an_error() {
        let mut config = WatchdogConfig::default();
        config
            .per_type
            .insert("build".to_string(), thresholds(50, 50, 60));

        let mut unit = MonitoredUnit::new("u1", UnitKind::Task);
        unit.unit_type = "build".to_string();

        let err = resolve_thresholds(&config, &unit).unwrap_err();
        assert!(matches!(err, WatchdogError::Config(_)));
    }

    #[test]
    fn broken_global_falls_back_to_defaults() {
        let mut config = WatchdogConfig::default();
        config.global.missed_heartbeat_limit = 0;

        let unit = MonitoredUnit::new("u1", UnitKind::Task);
        let resolved = resolve_thresholds(&config, &unit).unwrap();
        assert_eq!(resolved, WatchdogThresholdConfig::default());
    }

    #[test]
    fn validation_rejects_non_increasing_thresholds() {
        assert!(validate_thresholds(&thresholds(100, 100, 300)).is_err());
        assert!(validate_thresholds(&thresholds(100, 200, 200)).is_err());
        assert!(validate_thresholds(&thresholds(100, 200, 300)).is_ok());
    }
}
