//! The persisted workflow snapshot and its constituent value types.
//!
//! Every type here is pure data: no I/O, no provider calls. `WorkflowState` is the
//! single source of truth the rest of the engine reads and mutates; the filesystem is a
//! projection of it, never the other way around.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A major workflow state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    Init,
    Plan,
    Generate,
    Review,
    Revise,
    Complete,
    Cancelled,
    Error,
}

impl Phase {
    /// Terminal phases never accept another transition other than inspection.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Cancelled | Phase::Error)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Init => "INIT",
            Phase::Plan => "PLAN",
            Phase::Generate => "GENERATE",
            Phase::Review => "REVIEW",
            Phase::Revise => "REVISE",
            Phase::Complete => "COMPLETE",
            Phase::Cancelled => "CANCELLED",
            Phase::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Stage within a non-terminal phase: a prompt awaiting a response, or a response
/// awaiting approval. Terminal phases and INIT use `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Stage {
    Prompt,
    Response,
    None,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Prompt => "PROMPT",
            Stage::Response => "RESPONSE",
            Stage::None => "-",
        };
        f.write_str(s)
    }
}

/// Workflow-level status, orthogonal to phase/stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    InProgress,
    Success,
    Failed,
    Error,
    Cancelled,
}

/// A command issued to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Init,
    Approve,
    Reject,
    Retry,
    Cancel,
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Command::Init => "init",
            Command::Approve => "approve",
            Command::Reject => "reject",
            Command::Retry => "retry",
            Command::Cancel => "cancel",
        };
        f.write_str(s)
    }
}

/// One entry in the append-only phase history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub phase: Phase,
    pub status: Status,
    pub timestamp: DateTime<Utc>,
}

/// A content-addressed record of a file written into a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Session-root-relative path, forward-slash separated.
    pub path: String,
    pub phase: Phase,
    pub iteration: u32,
    /// `None` until the approval that covers this artifact has run.
    pub sha256: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The persisted snapshot: one per session, the sole unit the Session Store
/// reads and writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub session_id: String,
    pub profile: String,

    pub phase: Phase,
    pub stage: Stage,
    pub status: Status,
    pub current_iteration: u32,

    /// Role -> provider key (e.g. "planner" -> "manual").
    pub providers: HashMap<String, String>,
    pub standards_provider: String,

    /// Free-form profile-specific context, validated at init time against the
    /// profile's own schema.
    pub context: HashMap<String, serde_json::Value>,

    pub pending_approval: bool,
    pub plan_approved: bool,
    pub review_approved: bool,
    pub plan_hash: Option<String>,
    pub review_hash: Option<String>,
    pub prompt_hashes: HashMap<String, String>,

    /// Retry budget consumed so far, scoped per (phase, stage). Two stages never
    /// share a counter (see SPEC_FULL.md §4.4 / §9).
    #[serde(default)]
    pub retry_counts: HashMap<String, u32>,
    pub approval_feedback: Option<String>,
    pub suggested_content: Option<String>,
    pub standards_hash: String,

    pub artifacts: Vec<Artifact>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub phase_history: Vec<PhaseTransition>,
    pub last_error: Option<String>,

    /// Transient, human-readable progress notes for the current command only.
    /// Never persisted.
    #[serde(skip)]
    pub messages: Vec<String>,
}

/// Key used to scope a retry-budget counter to a single (phase, stage) pair.
pub fn retry_key(phase: Phase, stage: Stage) -> String {
    format!("{phase}.{stage}")
}

impl WorkflowState {
    pub fn new(session_id: String, profile: String, providers: HashMap<String, String>) -> Self {
        let now = Utc::now();
        WorkflowState {
            session_id,
            profile,
            phase: Phase::Init,
            stage: Stage::None,
            status: Status::InProgress,
            current_iteration: 1,
            providers,
            standards_provider: String::new(),
            context: HashMap::new(),
            pending_approval: false,
            plan_approved: false,
            review_approved: false,
            plan_hash: None,
            review_hash: None,
            prompt_hashes: HashMap::new(),
            retry_counts: HashMap::new(),
            approval_feedback: None,
            suggested_content: None,
            standards_hash: "0".repeat(64),
            artifacts: Vec::new(),
            created_at: now,
            updated_at: now,
            phase_history: vec![PhaseTransition {
                phase: Phase::Init,
                status: Status::InProgress,
                timestamp: now,
            }],
            last_error: None,
            messages: Vec::new(),
        }
    }

    pub fn retry_count(&self, phase: Phase, stage: Stage) -> u32 {
        self.retry_counts.get(&retry_key(phase, stage)).copied().unwrap_or(0)
    }

    pub fn increment_retry(&mut self, phase: Phase, stage: Stage) {
        *self.retry_counts.entry(retry_key(phase, stage)).or_insert(0) += 1;
    }

    pub fn clear_retry(&mut self, phase: Phase, stage: Stage) {
        self.retry_counts.remove(&retry_key(phase, stage));
    }

    pub fn record_transition(&mut self, phase: Phase, status: Status) {
        self.phase_history.push(PhaseTransition {
            phase,
            status,
            timestamp: Utc::now(),
        });
    }
}

/// Resolved, non-persisted per-stage configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageConfig {
    pub ai_provider: Option<String>,
    pub approval_provider: String,
    pub max_retries: u32,
    pub allow_rewrite: bool,
    pub approver_config: HashMap<String, String>,
}

impl Default for StageConfig {
    fn default() -> Self {
        StageConfig {
            ai_provider: None,
            approval_provider: "manual".to_string(),
            max_retries: 0,
            allow_rewrite: false,
            approver_config: HashMap::new(),
        }
    }
}

/// The pure output of a Transition Table lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionResult {
    pub next_phase: Phase,
    pub next_stage: Stage,
    pub action: Action,
    pub status_override: Option<Status>,
}

/// The post-transition side effect the orchestrator executes after a successful
/// table lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    GeneratePrompt,
    InvokeAiProvider,
    HashPlanAndGeneratePrompt,
    ExtractCodeAndGeneratePrompt,
    HashReviewAndBranch,
    ExtractRevisedCodeAndGeneratePrompt,
    None,
}

/// The three-way verdict of an approval evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approved,
    Rejected,
    Pending,
}

/// The ephemeral result of running the approval gate once.
#[derive(Debug, Clone)]
pub struct ApprovalResult {
    pub decision: Decision,
    pub feedback: Option<String>,
    pub suggested_content: Option<String>,
}

impl ApprovalResult {
    /// Constructs a result, enforcing the invariant that a rejection always carries
    /// non-empty feedback (falling back to a standard message).
    pub fn new(decision: Decision, feedback: Option<String>, suggested_content: Option<String>) -> Self {
        let feedback = match decision {
            Decision::Rejected => Some(match feedback {
                Some(f) if !f.trim().is_empty() => f,
                _ => "Empty or invalid response from AI provider".to_string(),
            }),
            _ => feedback,
        };
        ApprovalResult { decision, feedback, suggested_content }
    }

    pub fn approved() -> Self {
        ApprovalResult { decision: Decision::Approved, feedback: None, suggested_content: None }
    }

    pub fn pending() -> Self {
        ApprovalResult { decision: Decision::Pending, feedback: None, suggested_content: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_has_iteration_one_and_init_history() {
        let state = WorkflowState::new("abc".into(), "echo".into(), HashMap::new());
        assert_eq!(state.current_iteration, 1);
        assert_eq!(state.phase_history.len(), 1);
        assert_eq!(state.phase_history[0].phase, Phase::Init);
    }

    #[test]
    fn retry_counts_are_scoped_per_phase_and_stage() {
        let mut state = WorkflowState::new("abc".into(), "echo".into(), HashMap::new());
        state.increment_retry(Phase::Plan, Stage::Response);
        state.increment_retry(Phase::Plan, Stage::Response);
        state.increment_retry(Phase::Plan, Stage::Prompt);
        assert_eq!(state.retry_count(Phase::Plan, Stage::Response), 2);
        assert_eq!(state.retry_count(Phase::Plan, Stage::Prompt), 1);
        assert_eq!(state.retry_count(Phase::Generate, Stage::Response), 0);
    }

    #[test]
    fn rejection_with_empty_feedback_is_coerced() {
        let result = ApprovalResult::new(Decision::Rejected, Some("  ".to_string()), None);
        assert_eq!(result.feedback.unwrap(), "Empty or invalid response from AI provider");
    }

    #[test]
    fn rejection_keeps_non_empty_feedback() {
        let result = ApprovalResult::new(Decision::Rejected, Some("needs more tests".to_string()), None);
        assert_eq!(result.feedback.unwrap(), "needs more tests");
    }

    #[test]
    fn terminal_phases_are_identified() {
        assert!(Phase::Complete.is_terminal());
        assert!(Phase::Cancelled.is_terminal());
        assert!(Phase::Error.is_terminal());
        assert!(!Phase::Plan.is_terminal());
    }
}
