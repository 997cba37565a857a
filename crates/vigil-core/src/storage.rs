// Vigil Storage Helpers
// State-dir layout and JSON persistence shared by the stores

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;

use crate::error::Result;

pub const UNITS_FILE: &str = "units.json";
pub const HEARTBEATS_FILE: &str = "heartbeats.json";
pub const ALERTS_FILE: &str = "alerts.json";
pub const SESSION_HEALTH_FILE: &str = "session_health.json";
pub const CONFIG_FILE: &str = "watchdog.json";
pub const EVENTS_LOG: &str = "events.log";

/// Resolve the state directory: explicit flag, then VIGIL_STATE_DIR,
/// then the platform data dir, then a local fallback.
pub fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("VIGIL_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::data_dir()
        .map(|p| p.join("vigil"))
        .unwrap_or_else(|| PathBuf::from(".vigil"))
}

/// Suffix sequence for temp files; see [`atomic_write`].
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Atomic write using temp file and rename. The temp name is unique per
/// write, so concurrent flushes of the same path never share a temp
/// file and every rename finds the file it wrote.
pub async fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let temp_path = path.with_extension(format!("tmp.{}.{}", std::process::id(), seq));
    fs::write(&temp_path, content).await?;
    fs::rename(&temp_path, path).await?;
    Ok(())
}

pub async fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value)?;
    atomic_write(path, &payload).await
}

/// Load a JSON snapshot, falling back to the default when the file is
/// missing. A snapshot that fails to parse is discarded with a warning
/// rather than blocking startup.
pub async fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = fs::read_to_string(path).await?;
    match serde_json::from_str(&raw) {
        Ok(value) => Ok(value),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "discarding unreadable state snapshot");
            Ok(T::default())
        }
    }
}

/// Append one event to the JSONL log
pub fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(value)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

/// Read the last `limit` parseable lines of a JSONL log
pub fn read_jsonl_tail(path: &Path, limit: usize) -> Result<Vec<serde_json::Value>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if let Ok(value) = serde_json::from_str(&line) {
            entries.push(value);
        }
    }
    if entries.len() > limit {
        entries.drain(..entries.len() - limit);
    }
    Ok(entries)
}

// ============================================================================
// Tests
// ============================================================================
