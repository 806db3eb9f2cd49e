//! The Approval Gate: builds a file bundle, invokes an approval provider, and parses
//! its three-way decision.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::model::{ApprovalResult, Decision};

/// Per-file truncation threshold (50KB), matching `MAX_FILE_CONTENT_SIZE`.
pub const MAX_FILE_CONTENT_SIZE: usize = 50_000;
/// Aggregate bundle truncation threshold (200KB), matching `MAX_TOTAL_CONTENT_SIZE`.
pub const MAX_TOTAL_CONTENT_SIZE: usize = 200_000;

static DECISION_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)DECISION:\s*(APPROVED|REJECTED)").unwrap());
static FEEDBACK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)FEEDBACK:\s*(.+?)(?:SUGGESTED_CONTENT:|$)").unwrap());
static SUGGESTED_CONTENT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)SUGGESTED_CONTENT:\s*(.+)$").unwrap());

/// Truncates `content` to `MAX_FILE_CONTENT_SIZE` chars, appending a tail marker so the
/// approver sees truncation was applied. Never affects the hash eventually stored,
/// since hashing always reads the untruncated on-disk file.
pub fn truncate_content(content: &str) -> String {
    if content.chars().count() <= MAX_FILE_CONTENT_SIZE {
        return content.to_string();
    }
    let truncated: String = content.chars().take(MAX_FILE_CONTENT_SIZE).collect();
    format!("{truncated}\n\n[...truncated from {} chars]", content.chars().count())
}

/// Builds the approver-facing file bundle, truncating individual files at
/// `MAX_FILE_CONTENT_SIZE` and skipping entries once the running aggregate exceeds
/// `MAX_TOTAL_CONTENT_SIZE`.
pub fn build_file_bundle(files: &HashMap<String, String>) -> HashMap<String, String> {
    let mut bundle = HashMap::with_capacity(files.len());
    let mut total = 0usize;

    let mut paths: Vec<&String> = files.keys().collect();
    paths.sort();

    for path in paths {
        let content = &files[path];
        let truncated = truncate_content(content);
        total += truncated.len();
        if total > MAX_TOTAL_CONTENT_SIZE {
            bundle.insert(path.clone(), "[Skipped - total size limit reached]".to_string());
            continue;
        }
        bundle.insert(path.clone(), truncated);
    }

    bundle
}

/// Parses a raw approval-provider response into a three-way decision.
///
/// - Looks for a `DECISION: APPROVED|REJECTED` line (case-insensitive).
/// - Falls back to a fuzzy keyword scan: "approved" present and "rejected" absent ->
///   approved; "rejected" present -> rejected; otherwise defaults to REJECTED.
/// - Extracts `FEEDBACK: ...` up to `SUGGESTED_CONTENT:` or end-of-response; a literal
///   "none" (case-insensitive) is treated as no feedback.
/// - A REJECTED decision with no extracted feedback falls back to the first 500
///   characters of the raw response, or the standard message if the response is empty.
/// - `SUGGESTED_CONTENT: ...` is extracted only when `allow_rewrite` is true.
pub fn parse_decision(response: &str, allow_rewrite: bool) -> ApprovalResult {
    let decision = match DECISION_LINE.captures(response) {
        Some(caps) if caps[1].eq_ignore_ascii_case("APPROVED") => Decision::Approved,
        Some(_) => Decision::Rejected,
        None => {
            let lower = response.to_lowercase();
            let has_approved = lower.contains("approved");
            let has_rejected = lower.contains("rejected");
            if has_approved && !has_rejected {
                Decision::Approved
            } else if has_rejected {
                Decision::Rejected
            } else {
                Decision::Rejected
            }
        }
    };

    let mut feedback = FEEDBACK_BLOCK.captures(response).map(|caps| caps[1].trim().to_string());
    if feedback.as_deref().is_some_and(|f| f.eq_ignore_ascii_case("none")) {
        feedback = None;
    }

    if decision == Decision::Rejected && feedback.is_none() {
        let trimmed = response.trim();
        feedback = Some(if trimmed.is_empty() {
            "Empty or invalid response from AI provider".to_string()
        } else {
            response.chars().take(500).collect()
        });
    }

    let suggested_content = if allow_rewrite {
        SUGGESTED_CONTENT_BLOCK.captures(response).map(|caps| caps[1].trim().to_string())
    } else {
        None
    };

    ApprovalResult::new(decision, feedback, suggested_content)
}

/// The provider returned no response at all (manual-mode misuse) or a result with no
/// response text (a write-only provider); both are treated as an immediate rejection.
pub fn rejection_for_missing_response(had_result: bool) -> ApprovalResult {
    let message = if had_result {
        "Provider returned no response text for approval evaluation"
    } else {
        "Provider returned no response"
    };
    ApprovalResult::new(Decision::Rejected, Some(message.to_string()), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_content_passes_through_short_text() {
        assert_eq!(truncate_content("short"), "short");
    }

    #[test]
    fn truncate_content_marks_truncation_with_original_length() {
        let long = "a".repeat(MAX_FILE_CONTENT_SIZE + 10);
        let truncated = truncate_content(&long);
        assert!(truncated.ends_with(&format!("[...truncated from {} chars]", long.len())));
        assert!(truncated.len() < long.len() + 40);
    }

    #[test]
    fn build_file_bundle_skips_once_aggregate_exceeds_limit() {
        let mut files = HashMap::new();
        files.insert("a.txt".to_string(), "x".repeat(MAX_TOTAL_CONTENT_SIZE));
        files.insert("b.txt".to_string(), "y".repeat(10));
        let bundle = build_file_bundle(&files);
        assert_eq!(bundle["b.txt"], "[Skipped - total size limit reached]");
    }

    #[test]
    fn parse_decision_reads_explicit_decision_line() {
        let result = parse_decision("DECISION: APPROVED\nFEEDBACK: none", false);
        assert_eq!(result.decision, Decision::Approved);
        assert!(result.feedback.is_none());
    }

    #[test]
    fn parse_decision_is_case_insensitive() {
        let result = parse_decision("decision: rejected\nfeedback: needs work", false);
        assert_eq!(result.decision, Decision::Rejected);
        assert_eq!(result.feedback.as_deref(), Some("needs work"));
    }

    #[test]
    fn parse_decision_falls_back_to_fuzzy_keywords() {
        let result = parse_decision("Looks good, approved overall.", false);
        assert_eq!(result.decision, Decision::Approved);
    }

    #[test]
    fn parse_decision_fuzzy_rejected_wins_over_approved_keyword_absent() {
        let result = parse_decision("This is rejected due to missing tests.", false);
        assert_eq!(result.decision, Decision::Rejected);
    }

    #[test]
    fn parse_decision_defaults_to_rejected_when_ambiguous() {
        let result = parse_decision("I have no idea what to say.", false);
        assert_eq!(result.decision, Decision::Rejected);
        assert!(result.feedback.is_some());
    }

    #[test]
    fn rejected_with_no_feedback_falls_back_to_response_prefix() {
        let response = "REJECTED, ".to_string() + &"x".repeat(600);
        let result = parse_decision(&response, false);
        assert_eq!(result.decision, Decision::Rejected);
        assert_eq!(result.feedback.as_ref().unwrap().chars().count(), 500);
    }

    #[test]
    fn rejected_with_empty_response_uses_standard_message() {
        let result = parse_decision("   ", false);
        assert_eq!(result.feedback.as_deref(), Some("Empty or invalid response from AI provider"));
    }

    #[test]
    fn suggested_content_extracted_only_when_allow_rewrite() {
        let response = "DECISION: REJECTED\nFEEDBACK: bad\nSUGGESTED_CONTENT: better code here";
        let without_rewrite = parse_decision(response, false);
        assert!(without_rewrite.suggested_content.is_none());

        let with_rewrite = parse_decision(response, true);
        assert_eq!(with_rewrite.suggested_content.as_deref(), Some("better code here"));
    }

    #[test]
    fn feedback_stops_before_suggested_content_marker() {
        let response = "DECISION: REJECTED\nFEEDBACK: needs fixing\nSUGGESTED_CONTENT: rewritten";
        let result = parse_decision(response, true);
        assert_eq!(result.feedback.as_deref(), Some("needs fixing"));
        assert_eq!(result.suggested_content.as_deref(), Some("rewritten"));
    }

    #[test]
    fn literal_none_feedback_is_treated_as_absent() {
        let result = parse_decision("DECISION: APPROVED\nFEEDBACK: None", false);
        assert!(result.feedback.is_none());
    }

    #[test]
    fn missing_response_rejections_have_distinct_messages() {
        let no_result = rejection_for_missing_response(false);
        assert_eq!(no_result.feedback.as_deref(), Some("Provider returned no response"));

        let no_text = rejection_for_missing_response(true);
        assert_eq!(
            no_text.feedback.as_deref(),
            Some("Provider returned no response text for approval evaluation")
        );
    }
}
