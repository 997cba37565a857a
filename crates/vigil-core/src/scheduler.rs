//! Periodic scan driver.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::WatchdogConfigStore;
use crate::engine::WatchdogEngine;

/// Floor for the scan interval; a pathological config value must not
/// turn the scheduler into a busy loop.
const MIN_SCAN_INTERVAL_MS: u64 = 250;

/// Background task that runs [`WatchdogEngine::scan`] on a fixed cadence.
///
/// The config snapshot is re-read on every tick, so `scan_interval_ms`
/// and `scan_enabled` changes take effect on the next tick without a
/// restart. Ticks that land while a scan is still running are skipped,
/// never queued.
pub struct ScanScheduler {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScanScheduler {
    pub fn spawn(engine: Arc<WatchdogEngine>, config: WatchdogConfigStore) -> Self {
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut interval_ms = 0u64;
            let mut ticker = tokio::time::interval(Duration::from_millis(MIN_SCAN_INTERVAL_MS));
            loop {
                let wanted = config
                    .snapshot()
                    .await
                    .scan_interval_ms
                    .max(MIN_SCAN_INTERVAL_MS);
                if wanted != interval_ms {
                    interval_ms = wanted;
                    ticker = tokio::time::interval(Duration::from_millis(interval_ms));
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    tracing::debug!(scan_interval_ms = interval_ms, "scan cadence set");
                }
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !config.snapshot().await.scan_enabled {
                    continue;
                }
                let outcome = engine.scan(Utc::now()).await;
                if outcome.transitions > 0 {
                    tracing::info!(
                        scanned = outcome.scanned,
                        transitions = outcome.transitions,
                        "scan recorded health transitions"
                    );
                }
            }
            tracing::debug!("scan scheduler stopped");
        });
        Self { cancel, handle }
    }

    /// Stop the loop and wait for the in-flight tick, if any, to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

// ============================================================================
// Tests
// ============================================================================
