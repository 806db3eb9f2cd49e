//! `EchoProfile`: the minimal reference `Profile` implementation.
//!
//! Prompt bodies are short, deterministic descriptions of what's being asked for at each
//! phase; response parsing for GENERATE/REVISE follows the `### <path>\n<content>`
//! bundle convention visible throughout this crate's own approval-prompt format
//! (`provider.rs::AiWrappedApprovalProvider::build_prompt`), so a hand-written or
//! AI-produced response needs only one convention to learn.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::collaborators::{Profile, ProcessingResult, WritePlan, WritePlanEntry};
use crate::model::Phase;

/// Matches a `### <path>` heading introducing one file's content in a GENERATE/REVISE
/// response bundle.
static FILE_HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^###\s+(.+?)\s*$").unwrap());

pub struct EchoProfile;

impl EchoProfile {
    fn context_summary(context: &HashMap<String, serde_json::Value>) -> String {
        if context.is_empty() {
            return "(no context fields)".to_string();
        }
        let mut keys: Vec<&String> = context.keys().collect();
        keys.sort();
        keys.iter()
            .map(|k| format!("{k}={}", context[*k]))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl Profile for EchoProfile {
    fn key(&self) -> &str {
        "echo"
    }

    fn generate_prompt(
        &self,
        phase: Phase,
        iteration: u32,
        context: &HashMap<String, serde_json::Value>,
        feedback: Option<&str>,
    ) -> anyhow::Result<String> {
        let summary = Self::context_summary(context);
        let body = match phase {
            Phase::Plan => format!(
                "## Plan\n\nDraft a plan for: {summary}\n\nRespond with the plan as plain text."
            ),
            Phase::Generate => format!(
                "## Generate (iteration {iteration})\n\nUsing the approved plan at {{{{PLAN}}}} and the standards at \
                 {{{{STANDARDS}}}}, produce the code for: {summary}\n\n\
                 Respond with one `### <relative/path>` heading per file, followed by its full contents."
            ),
            Phase::Review => format!(
                "## Review (iteration {iteration})\n\nReview the code written for: {summary}\n\n\
                 Respond with a `VERDICT: PASS` or `VERDICT: FAIL` line, plus any remarks."
            ),
            Phase::Revise => format!(
                "## Revise (iteration {iteration})\n\nAddress the following review feedback for: {summary}\n\n\
                 Respond with one `### <relative/path>` heading per changed or added file, followed by its full contents."
            ),
            Phase::Init | Phase::Complete | Phase::Cancelled | Phase::Error => {
                anyhow::bail!("echo profile has no prompt for phase {phase}")
            }
        };

        Ok(match feedback {
            Some(f) if !f.is_empty() => format!("{body}\n\n## Feedback from the previous attempt\n\n{f}"),
            _ => body,
        })
    }

    fn process_response(
        &self,
        phase: Phase,
        _iteration: u32,
        response_text: &str,
        _session_dir: &Path,
    ) -> anyhow::Result<ProcessingResult> {
        match phase {
            Phase::Generate | Phase::Revise => Ok(ProcessingResult::ok(parse_file_bundle(response_text))),
            Phase::Plan | Phase::Review => Ok(ProcessingResult::ok(WritePlan::new())),
            Phase::Init | Phase::Complete | Phase::Cancelled | Phase::Error => {
                Ok(ProcessingResult::failed(format!("no response processor for phase {phase}")))
            }
        }
    }

    fn default_standards_provider(&self) -> &str {
        "null"
    }
}

/// Splits a `### path` / body response into a `WritePlan`. A response with no headings
/// at all yields an empty plan rather than an error — an empty GENERATE response is a
/// legitimate (if unusual) "no files" answer, and the Artifact Service treats an empty
/// write plan as a no-op.
fn parse_file_bundle(response_text: &str) -> WritePlan {
    let headings: Vec<(usize, usize, String)> = FILE_HEADING
        .captures_iter(response_text)
        .map(|caps| {
            let m = caps.get(0).unwrap();
            (m.start(), m.end(), caps[1].trim().to_string())
        })
        .collect();

    let mut plan = WritePlan::new();
    for (idx, (_, body_start, path)) in headings.iter().enumerate() {
        let body_end = headings.get(idx + 1).map(|(start, _, _)| *start).unwrap_or(response_text.len());
        let content = response_text[*body_start..body_end].trim_start_matches('\n').trim_end().to_string();
        plan.push(WritePlanEntry { relative_path: path.clone(), content });
    }
    plan
}
