// Heartbeat Store
// Last-seen bookkeeping per monitored unit

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::storage::{load_json_or_default, save_json, HEARTBEATS_FILE};
use vigil_types::HeartbeatRecord;

/// Missed-counter writeback queued by a scan. `seen_heartbeat_at` is
/// the anchor the scan classified against; a record whose anchor moved
/// since then rejects the update.
#[derive(Debug, Clone)]
pub struct MissedUpdate {
    pub unit_id: String,
    pub missed: u32,
    pub seen_heartbeat_at: Option<DateTime<Utc>>,
}

pub struct HeartbeatStore {
    base: PathBuf,
    records: RwLock<HashMap<String, HeartbeatRecord>>,
}

impl HeartbeatStore {
    pub async fn new(base: impl AsRef<Path>) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        let records = load_json_or_default(&base.join(HEARTBEATS_FILE)).await?;
        Ok(Self {
            base,
            records: RwLock::new(records),
        })
    }

    pub async fn get(&self, unit_id: &str) -> Option<HeartbeatRecord> {
        self.records.read().await.get(unit_id).cloned()
    }

    /// Fetch the record for a unit, creating one anchored at `now` when
    /// the unit has never been seen.
    pub async fn get_or_create(&self, unit_id: &str, now: DateTime<Utc>) -> Result<HeartbeatRecord> {
        let created;
        let record = {
            let mut records = self.records.write().await;
            match records.get(unit_id) {
                Some(existing) => {
                    created = false;
                    existing.clone()
                }
                None => {
                    created = true;
                    records
                        .entry(unit_id.to_string())
                        .or_insert_with(|| HeartbeatRecord::new(now))
                        .clone()
                }
            }
        };
        if created {
            self.flush().await?;
        }
        Ok(record)
    }

    /// A heartbeat always clears the missed counter.
    pub async fn record_heartbeat(
        &self,
        unit_id: &str,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatRecord> {
        let record = {
            let mut records = self.records.write().await;
            let record = records
                .entry(unit_id.to_string())
                .or_insert_with(|| HeartbeatRecord::new(now));
            record.last_heartbeat_at = Some(now);
            record.missed_count = 0;
            record.clone()
        };
        self.flush().await?;
        Ok(record)
    }

    /// Elapsed ms since the last heartbeat, falling back to the start of
    /// monitoring when no heartbeat was ever received. `None` means the
    /// unit has no usable timeline yet, which is normal data.
    pub async fn time_since_heartbeat(&self, unit_id: &str, now: DateTime<Utc>) -> Option<u64> {
        self.elapsed_with_anchor(unit_id, now)
            .await
            .map(|(elapsed, _)| elapsed)
    }

    /// Elapsed ms plus the heartbeat anchor it was computed from, for
    /// callers that must detect a heartbeat landing after the read.
    pub async fn elapsed_with_anchor(
        &self,
        unit_id: &str,
        now: DateTime<Utc>,
    ) -> Option<(u64, Option<DateTime<Utc>>)> {
        let records = self.records.read().await;
        let record = records.get(unit_id)?;
        let anchor = record.last_heartbeat_at.or(record.started_at)?;
        let elapsed = (now - anchor).num_milliseconds().max(0) as u64;
        Some((elapsed, record.last_heartbeat_at))
    }

    /// Persist scan-derived missed counters in one pass. An update whose
    /// `seen_heartbeat_at` no longer matches the record is dropped: a
    /// heartbeat arrived after the scan read it, and its reset wins.
    pub async fn apply_missed_counts(&self, updates: &[MissedUpdate]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut changed = false;
        {
            let mut records = self.records.write().await;
            for update in updates {
                if let Some(record) = records.get_mut(&update.unit_id) {
                    if record.last_heartbeat_at != update.seen_heartbeat_at {
                        continue;
                    }
                    if record.missed_count != update.missed {
                        record.missed_count = update.missed;
                        changed = true;
                    }
                }
            }
        }
        if changed {
            self.flush().await?;
        }
        Ok(())
    }

    /// Grant one retry attempt: bump the counter and restart the
    /// heartbeat window at `now`.
    pub async fn grant_retry(&self, unit_id: &str, now: DateTime<Utc>) -> Result<HeartbeatRecord> {
        let record = {
            let mut records = self.records.write().await;
            let record = records
                .entry(unit_id.to_string())
                .or_insert_with(|| HeartbeatRecord::new(now));
            record.retry_count += 1;
            record.missed_count = 0;
            record.last_heartbeat_at = Some(now);
            record.clone()
        };
        self.flush().await?;
        Ok(record)
    }

    /// Count a failed attempt without granting a retry; the heartbeat
    /// window keeps aging so the unit stays classifiable as failed.
    pub async fn increment_retry(&self, unit_id: &str) -> Result<HeartbeatRecord> {
        let record = {
            let mut records = self.records.write().await;
            let Some(record) = records.get_mut(unit_id) else {
                return Err(crate::error::WatchdogError::UnknownUnit(unit_id.to_string()));
            };
            record.retry_count += 1;
            record.clone()
        };
        self.flush().await?;
        Ok(record)
    }

    pub async fn evict(&self, unit_id: &str) -> Result<bool> {
        let removed = self.records.write().await.remove(unit_id).is_some();
        if removed {
            self.flush().await?;
        }
        Ok(removed)
    }

    async fn flush(&self) -> Result<()> {
        let snapshot = self.records.read().await.clone();
        save_json(&self.base.join(HEARTBEATS_FILE), &snapshot).await
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

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn update(unit_id: &str, missed: u32, seen: Option<DateTime<Utc>>) -> MissedUpdate {
        MissedUpdate {
            unit_id: unit_id.to_string(),
            missed,
            seen_heartbeat_at: seen,
        }
    }

    #[tokio::test]
    async fn get_or_create_anchors_started_at() {
        let temp = tempdir().unwrap();
        let store = HeartbeatStore::new(temp.path()).await.unwrap();

        let record = store.get_or_create("task-1", at(0)).await.unwrap();
        assert_eq!(record.started_at, Some(at(0)));
        assert_eq!(record.last_heartbeat_at, None);
        assert_eq!(record.missed_count, 0);
    }

    #[tokio::test]
    async fn heartbeat_resets_missed_count() {
        let temp = tempdir().unwrap();
        let store = HeartbeatStore::new(temp.path()).await.unwrap();

        store.get_or_create("task-1", at(0)).await.unwrap();
        store
            .apply_missed_counts(&[update("task-1", 4, None)])
            .await
            .unwrap();
        assert_eq!(store.get("task-1").await.unwrap().missed_count, 4);

        let record = store.record_heartbeat("task-1", at(120)).await.unwrap();
        assert_eq!(record.missed_count, 0);
        assert_eq!(record.last_heartbeat_at, Some(at(120)));
    }

    #[tokio::test]
    async fn stale_missed_update_is_dropped() {
        let temp = tempdir().unwrap();
        let store = HeartbeatStore::new(temp.path()).await.unwrap();

        store.get_or_create("task-1", at(0)).await.unwrap();
        let (_, seen) = store.elapsed_with_anchor("task-1", at(90)).await.unwrap();
        assert_eq!(seen, None);

        // A heartbeat lands after the observation; the queued counter
        // must not undo its reset.
        store.record_heartbeat("task-1", at(95)).await.unwrap();
        store
            .apply_missed_counts(&[update("task-1", 7, seen)])
            .await
            .unwrap();
        assert_eq!(store.get("task-1").await.unwrap().missed_count, 0);

        // With a matching anchor the counter applies.
        store
            .apply_missed_counts(&[update("task-1", 7, Some(at(95)))])
            .await
            .unwrap();
        assert_eq!(store.get("task-1").await.unwrap().missed_count, 7);
    }

    #[tokio::test]
    async fn elapsed_falls_back_to_started_at() {
        let temp = tempdir().unwrap();
        let store = HeartbeatStore::new(temp.path()).await.unwrap();

        store.get_or_create("task-1", at(0)).await.unwrap();
        assert_eq!(store.time_since_heartbeat("task-1", at(90)).await, Some(90_000));

        store.record_heartbeat("task-1", at(100)).await.unwrap();
        assert_eq!(store.time_since_heartbeat("task-1", at(130)).await, Some(30_000));
    }

    #[tokio::test]
    async fn unknown_unit_has_no_elapsed() {
        let temp = tempdir().unwrap();
        let store = HeartbeatStore::new(temp.path()).await.unwrap();
        assert_eq!(store.time_since_heartbeat("ghost", at(10)).await, None);
    }

    #[tokio::test]
    async fn grant_retry_restarts_window() {
        let temp = tempdir().unwrap();
        let store = HeartbeatStore::new(temp.path()).await.unwrap();

        store.get_or_create("task-1", at(0)).await.unwrap();
        let record = store.grant_retry("task-1", at(700)).await.unwrap();
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.missed_count, 0);
        assert_eq!(store.time_since_heartbeat("task-1", at(701)).await, Some(1_000));
    }

    #[tokio::test]
    async fn increment_retry_keeps_window_aging() {
        let temp = tempdir().unwrap();
        let store = HeartbeatStore::new(temp.path()).await.unwrap();

        store.record_heartbeat("task-1", at(10)).await.unwrap();
        let record = store.increment_retry("task-1").await.unwrap();
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.last_heartbeat_at, Some(at(10)));
        assert!(store.increment_retry("ghost").await.is_err());
    }

    #[tokio::test]
    async fn records_survive_reload() {
        let temp = tempdir().unwrap();
        {
            let store = HeartbeatStore::new(temp.path()).await.unwrap();
            store.record_heartbeat("task-1", at(5)).await.unwrap();
        }
        let store = HeartbeatStore::new(temp.path()).await.unwrap();
        let record = store.get("task-1").await.unwrap();
        assert_eq!(record.last_heartbeat_at, Some(at(5)));
    }

    #[tokio::test]
    async fn evict_removes_record() {
        let temp = tempdir().unwrap();
        let store = HeartbeatStore::new(temp.path()).await.unwrap();

        store.get_or_create("task-1", at(0)).await.unwrap();
        assert!(store.evict("task-1").await.unwrap());
        assert!(!store.evict("task-1").await.unwrap());
        assert!(store.get("task-1").await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_heartbeats_never_collide_on_flush() {
        let temp = tempdir().unwrap();
        let store = std::sync::Arc::new(HeartbeatStore::new(temp.path()).await.unwrap());

        let mut workers = Vec::new();
        for worker in 0..16i64 {
            let store = store.clone();
            workers.push(tokio::spawn(async move {
                for round in 0..50i64 {
                    let unit_id = format!("task-{}-{}", worker, round);
                    store
                        .record_heartbeat(&unit_id, at(round))
                        .await
                        .expect("heartbeat for a valid unit must persist");
                }
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }

        assert_eq!(store.get("task-0-0").await.unwrap().missed_count, 0);
        assert_eq!(
            store.get("task-15-49").await.unwrap().last_heartbeat_at,
            Some(at(49))
        );
    }
}
