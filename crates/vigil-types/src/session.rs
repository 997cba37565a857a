// Session Health Types
// Integrity verdicts, corruption analysis, and the recovery plan

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Healthy,
    Warning,
    Corrupted,
    Unknown,
}

/// Tracked health of one conversational session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHealthRecord {
    pub session_key: String,
    pub status: SessionStatus,
    /// Total errors reported against this session
    pub error_count: u32,
    pub last_error: Option<String>,
    /// Errors classified as tool-history corruption
    pub tool_mismatch_count: u32,
    /// Ordered remediation hints for the caller
    pub recommendations: Vec<String>,
    pub last_activity_at: chrono::DateTime<chrono::Utc>,
}

impl SessionHealthRecord {
    pub fn new(session_key: impl Into<String>, now: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            session_key: session_key.into(),
            status: SessionStatus::Healthy,
            error_count: 0,
            last_error: None,
            tool_mismatch_count: 0,
            recommendations: Vec::new(),
            last_activity_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionHealthAction {
    ReportError,
    Clear,
    Heartbeat,
}

/// A tool invocation as it appears in conversation history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A tool result as it appears in conversation history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultRef {
    pub tool_use_id: String,
}

/// Call/result ids that occupy the same position but disagree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MismatchPair {
    pub call_id: String,
    pub result_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Ok,
    Warn,
    ClearSession,
}

/// Outcome of validating a batch of tool calls against results.
/// Ephemeral; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub mismatches: Vec<MismatchPair>,
    pub orphaned_calls: Vec<String>,
    pub orphaned_results: Vec<String>,
    pub recommendation: Recommendation,
}

/// Result of matching raw error text against known corruption signatures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorruptionAnalysis {
    pub is_corruption: bool,
    pub error_type: Option<String>,
    pub confidence: f64,
    pub details: Option<String>,
}

impl CorruptionAnalysis {
    pub fn none() -> Self {
        Self {
            is_corruption: false,
            error_type: None,
            confidence: 0.0,
            details: None,
        }
    }
}

/// One step of the advisory recovery plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryStep {
    pub order: u32,
    pub action: String,
    pub description: String,
    #[serde(default)]
    pub optional: bool,
}
