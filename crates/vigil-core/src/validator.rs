// Session Integrity Validator
// Stateless checks over tool-call/tool-result history and raw error text

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use vigil_types::{
    CorruptionAnalysis, MismatchPair, Recommendation, ToolCallRef, ToolResultRef,
    ValidationVerdict,
};

const DETAIL_EXCERPT_CHARS: usize = 240;

/// Validate a batch of tool calls against their results.
///
/// A call without a result is only a warning (it may still be pending).
/// A result without a call is an error: results must always reference a
/// real call. Positional disagreement between the two lists is recorded
/// as mismatch pairs even when every id is individually known; one or
/// two mismatches are tolerated as noise, three or more read as a
/// desynchronized history.
pub fn validate_tool_pairs(calls: &[ToolCallRef], results: &[ToolResultRef]) -> ValidationVerdict {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut mismatches = Vec::new();
    let mut orphaned_calls = Vec::new();
    let mut orphaned_results = Vec::new();

    let call_ids: HashSet<&str> = calls.iter().map(|c| c.id.as_str()).collect();
    let result_ids: HashSet<&str> = results.iter().map(|r| r.tool_use_id.as_str()).collect();

    for call in calls {
        if !result_ids.contains(call.id.as_str()) {
            orphaned_calls.push(call.id.clone());
            warnings.push(format!(
                "tool call {} has no matching result yet",
                call.id
            ));
        }
    }

    for result in results {
        if !call_ids.contains(result.tool_use_id.as_str()) {
            orphaned_results.push(result.tool_use_id.clone());
            errors.push(format!(
                "tool result {} references no known call",
                result.tool_use_id
            ));
        }
    }

    for i in 0..calls.len().min(results.len()) {
        if calls[i].id != results[i].tool_use_id {
            mismatches.push(MismatchPair {
                call_id: calls[i].id.clone(),
                result_id: results[i].tool_use_id.clone(),
            });
        }
    }

    let recommendation = if !errors.is_empty() || mismatches.len() > 2 {
        Recommendation::ClearSession
    } else if !warnings.is_empty() || !mismatches.is_empty() {
        Recommendation::Warn
    } else {
        Recommendation::Ok
    };

    ValidationVerdict {
        valid: errors.is_empty(),
        errors,
        warnings,
        mismatches,
        orphaned_calls,
        orphaned_results,
        recommendation,
    }
}

pub struct CorruptionSignature {
    pub pattern: Regex,
    pub error_type: &'static str,
    pub confidence: f64,
}

static SIGNATURES: OnceLock<Vec<CorruptionSignature>> = OnceLock::new();

/// Known corruption signatures, most specific first. Matching walks this
/// list in order and stops at the first hit, so classification never
/// depends on map iteration order.
pub fn corruption_signatures() -> &'static [CorruptionSignature] {
    SIGNATURES.get_or_init(|| {
        vec![
            signature(
                r"(?is)tool_use.{0,120}without.{0,120}tool_result",
                "orphaned_tool_call",
                0.95,
            ),
            signature(
                r"(?is)unexpected\s+tool_use_id",
                "orphaned_tool_result",
                0.95,
            ),
            signature(
                r"(?is)tool_result.{0,120}(corresponding|preceding|matching).{0,120}tool_use",
                "orphaned_tool_result",
                0.9,
            ),
            signature(
                r"messages\.\d+\.content\.\d+\.tool_use",
                "malformed_tool_block",
                0.8,
            ),
            signature(
                r"(?is)invalid_request_error.{0,200}(tool_use|tool_result)",
                "tool_history_rejected",
                0.75,
            ),
            signature(
                r"(?is)(conversation|history).{0,80}(corrupt|desync|out of sync)",
                "history_desync",
                0.7,
            ),
        ]
    })
}

fn signature(pattern: &str, error_type: &'static str, confidence: f64) -> CorruptionSignature {
    CorruptionSignature {
        pattern: Regex::new(pattern).expect("valid corruption signature pattern"),
        error_type,
        confidence,
    }
}

/// Classify raw error text against the signature list, first match wins.
pub fn analyze_error_message(error_message: &str) -> CorruptionAnalysis {
    let text = error_message.trim();
    if text.is_empty() {
        return CorruptionAnalysis::none();
    }
    for sig in corruption_signatures() {
        if sig.pattern.is_match(text) {
            return CorruptionAnalysis {
                is_corruption: true,
                error_type: Some(sig.error_type.to_string()),
                confidence: sig.confidence,
                details: Some(excerpt(text, DETAIL_EXCERPT_CHARS)),
            };
        }
    }
    CorruptionAnalysis::none()
}

fn excerpt(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let mut out: String = input.chars().take(max_chars).collect();
    out.push_str("...<truncated>");
    out
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str) -> ToolCallRef {
        ToolCallRef {
            id: id.to_string(),
            name: None,
        }
    }

    fn result(id: &str) -> ToolResultRef {
        ToolResultRef {
            tool_use_id: id.to_string(),
        }
    }

    #[test]
    fn empty_batch_is_valid() {
        let verdict = validate_tool_pairs(&[], &[]);
        assert!(verdict.valid);
        assert_eq!(verdict.recommendation, Recommendation::Ok);
        assert!(verdict.errors.is_empty());
        assert!(verdict.warnings.is_empty());
    }

    #[test]
    fn matched_pair_is_valid() {
        let verdict = validate_tool_pairs(&[call("a")], &[result("a")]);
        assert!(verdict.valid);
        assert!(verdict.mismatches.is_empty());
        assert_eq!(verdict.recommendation, Recommendation::Ok);
    }

    #[test]
    fn unknown_result_invalidates_and_clears() {
        let verdict = validate_tool_pairs(&[call("a"), call("b")], &[result("x")]);
        assert!(!verdict.valid);
        assert_eq!(verdict.orphaned_results, vec!["x".to_string()]);
        assert_eq!(verdict.recommendation, Recommendation::ClearSession);
    }

    #[test]
    fn pending_call_only_warns() {
        let verdict = validate_tool_pairs(&[call("a"), call("b")], &[result("a")]);
        assert!(verdict.valid);
        assert_eq!(verdict.orphaned_calls, vec!["b".to_string()]);
        assert_eq!(verdict.recommendation, Recommendation::Warn);
    }

    #[test]
    fn two_mismatches_warn_three_clear() {
        // Reversed order, all ids known on both sides.
        let calls = [call("a"), call("b"), call("c")];
        let results = [result("c"), result("b"), result("a")];
        let verdict = validate_tool_pairs(&calls, &results);
        assert!(verdict.valid);
        assert_eq!(verdict.mismatches.len(), 2);
        assert_eq!(verdict.recommendation, Recommendation::Warn);

        let calls = [call("a"), call("b"), call("c"), call("d")];
        let results = [result("d"), result("c"), result("b"), result("a")];
        let verdict = validate_tool_pairs(&calls, &results);
        assert!(verdict.valid);
        assert_eq!(verdict.mismatches.len(), 4);
        assert_eq!(verdict.recommendation, Recommendation::ClearSession);
    }

    #[test]
    fn mismatch_records_both_ids() {
        let verdict = validate_tool_pairs(&[call("a"), call("b")], &[result("b"), result("a")]);
        assert_eq!(
            verdict.mismatches[0],
            MismatchPair {
                call_id: "a".to_string(),
                result_id: "b".to_string(),
            }
        );
    }

    #[test]
    fn analyze_detects_orphaned_tool_call() {
        let analysis = analyze_error_message(
            "Request contains tool_use ids without corresponding tool_result blocks: toolu_123",
        );
        assert!(analysis.is_corruption);
        assert_eq!(analysis.error_type.as_deref(), Some("orphaned_tool_call"));
        assert_eq!(analysis.confidence, 0.95);
    }

    #[test]
    fn analyze_detects_unexpected_result_id() {
        let analysis =
            analyze_error_message("invalid_request_error: unexpected tool_use_id in tool_result");
        // First match wins even though later signatures also apply.
        assert_eq!(analysis.error_type.as_deref(), Some("orphaned_tool_result"));
        assert_eq!(analysis.confidence, 0.95);
    }

    #[test]
    fn analyze_detects_malformed_block_path() {
        let analysis = analyze_error_message(
            "messages.3.content.0.tool_use.id: Input should be a valid string",
        );
        assert_eq!(analysis.error_type.as_deref(), Some("malformed_tool_block"));
    }

    #[test]
    fn analyze_detects_history_desync() {
        let analysis = analyze_error_message("conversation state is out of sync with the backend");
        assert_eq!(analysis.error_type.as_deref(), Some("history_desync"));
        assert_eq!(analysis.confidence, 0.7);
    }

    #[test]
    fn analyze_passes_unrelated_errors() {
        let analysis = analyze_error_message("connection reset by peer");
        assert!(!analysis.is_corruption);
        assert_eq!(analysis.confidence, 0.0);
        assert!(analysis.error_type.is_none());
    }

    #[test]
    fn analyze_ignores_blank_text() {
        let analysis = analyze_error_message("   ");
        assert!(!analysis.is_corruption);
    }

    #[test]
    fn signature_order_is_most_specific_first() {
        let confidences: Vec<f64> = corruption_signatures().iter().map(|s| s.confidence).collect();
        let mut sorted = confidences.clone();
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap());
        assert_eq!(confidences, sorted);
    }

    #[test]
    fn excerpt_truncates_long_details() {
        let long = "x".repeat(500);
        let text = format!("unexpected tool_use_id {}", long);
        let analysis = analyze_error_message(&text);
        let details = analysis.details.unwrap();
        assert!(details.ends_with("...<truncated>"));
        assert!(details.chars().count() < text.chars().count());
    }
}
