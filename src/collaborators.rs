//! External collaborator contracts: `Profile`, `AiProvider`, `StandardsProvider`,
//! `EventObserver`. These are the seams the explicit factories construct against;
//! concrete built-ins live in `profile.rs`, `provider.rs`, `standards.rs`.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::model::{Phase, Stage};

/// A single `(relative_path, content)` entry the engine writes into the session.
/// Paths are validated by the Path Validator before any write reaches disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePlanEntry {
    pub relative_path: String,
    pub content: String,
}

pub type WritePlan = Vec<WritePlanEntry>;

/// The outcome discriminant of a profile's response processor, carried alongside
/// `error_message` per the documented `{status, write_plan?, metadata?, error_message?}`
/// Processing Result contract. The engine itself never branches on `status` — a
/// present `error_message` is what the Orchestrator treats as failure — but a profile
/// implementation is expected to set it consistently with `error_message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessingStatus {
    #[default]
    Ok,
    Failed,
}

/// The result of a profile's response processor.
#[derive(Debug, Clone, Default)]
pub struct ProcessingResult {
    pub status: ProcessingStatus,
    pub write_plan: Option<WritePlan>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub error_message: Option<String>,
}

impl ProcessingResult {
    pub fn ok(write_plan: WritePlan) -> Self {
        ProcessingResult {
            status: ProcessingStatus::Ok,
            write_plan: Some(write_plan),
            metadata: HashMap::new(),
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        ProcessingResult {
            status: ProcessingStatus::Failed,
            write_plan: None,
            metadata: HashMap::new(),
            error_message: Some(message.into()),
        }
    }
}

/// A domain-specific prompt generator / response parser.
///
/// The engine never parses response content itself; every byte of extraction is
/// profile-owned. A profile is polymorphic over plan/generate/review/revise, each with
/// a prompt generator and a response processor.
pub trait Profile: Send + Sync {
    /// Stable key used in `WorkflowState::profile` and the profile factory registry.
    fn key(&self) -> &str;

    /// Generates the body of the PROMPT file for `(phase, iteration)` from the
    /// session's free-form context bag plus any injected feedback (retry path).
    fn generate_prompt(
        &self,
        phase: Phase,
        iteration: u32,
        context: &HashMap<String, serde_json::Value>,
        feedback: Option<&str>,
    ) -> anyhow::Result<String>;

    /// Parses a RESPONSE file's content for `(phase, iteration)` into a processing
    /// result. Only GENERATE and REVISE responses produce a non-empty write plan;
    /// PLAN and REVIEW responses are consumed as plain text by the Artifact Service
    /// directly and this typically returns an empty write plan.
    fn process_response(
        &self,
        phase: Phase,
        iteration: u32,
        response_text: &str,
        session_dir: &Path,
    ) -> anyhow::Result<ProcessingResult>;

    /// Whether this profile can produce an alternate PROMPT body when a PROMPT-stage
    /// gate rejects the prompt itself. Most
    /// profiles do not support this; the default is `false`.
    fn can_regenerate_prompts(&self) -> bool {
        false
    }

    /// The standards provider key to use when a session's init doesn't specify one.
    fn default_standards_provider(&self) -> &str {
        "null"
    }

    /// Validates the free-form context bag at init time. Returns a human-readable
    /// error on failure; profiles with no schema accept anything.
    fn validate_context(&self, _context: &HashMap<String, serde_json::Value>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Filesystem ability a provider declares, governing whether the engine waits
/// for a manually placed response file or writes one itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemAbility {
    LocalWrite,
    LocalRead,
    WriteOnly,
    None,
}

#[derive(Debug, Clone)]
pub struct ProviderMetadata {
    pub key: String,
    pub filesystem_ability: FilesystemAbility,
}

/// An AI response backend. `generate` returning `None` signals manual mode: the
/// engine writes the prompt file and waits for a user-placed response file.
pub trait AiProvider: Send + Sync {
    fn metadata(&self) -> ProviderMetadata;

    /// Preflight check invoked by the `validate` CLI command.
    fn validate(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn generate(
        &self,
        prompt: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> anyhow::Result<Option<String>>;
}

/// Produces the standards bundle materialized once at session init.
pub trait StandardsProvider: Send + Sync {
    fn key(&self) -> &str;
    fn bundle(&self, session_dir: &Path) -> anyhow::Result<String>;
}

/// Everything the Approval Gate knows about the current evaluation.
#[derive(Debug, Clone)]
pub struct ApprovalContext {
    pub session_id: String,
    pub iteration: u32,
    pub allow_rewrite: bool,
    pub criteria_file: Option<std::path::PathBuf>,
    pub plan_file: Option<std::path::PathBuf>,
    pub review_file: Option<std::path::PathBuf>,
    pub session_dir: std::path::PathBuf,
    pub approver_config: HashMap<String, String>,
    /// The file bundle the approver judges: path -> content.
    pub files: HashMap<String, String>,
}

/// An approval decision backend. Built-ins: `skip` (always APPROVED),
/// `manual` (always PENDING). Any other key resolves to an AI-wrapped provider around
/// an `AiProvider`.
pub trait ApprovalProvider: Send + Sync {
    fn key(&self) -> &str;
    fn evaluate(&self, ctx: &ApprovalContext) -> anyhow::Result<crate::model::ApprovalResult>;
}

/// An event dispatched by the Event Emitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub session_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub phase: Phase,
    pub stage: Stage,
    pub iteration: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    PhaseEntered,
    ApprovalGranted,
    ApprovalRequired,
    WorkflowCompleted,
    WorkflowFailed,
}

/// Receives dispatched events. Implementations must not let panics or errors escape
/// into the emitter — the emitter isolates each observer with a catch boundary anyway,
/// but observers are still expected to be best-effort.
pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &Event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_result_ok_carries_write_plan() {
        let plan = vec![WritePlanEntry {
            relative_path: "Order.java".to_string(),
            content: "class Order {}".to_string(),
        }];
        let result = ProcessingResult::ok(plan.clone());
        assert_eq!(result.status, ProcessingStatus::Ok);
        assert_eq!(result.write_plan, Some(plan));
        assert!(result.error_message.is_none());
    }

    #[test]
    fn processing_result_failed_has_no_write_plan() {
        let result = ProcessingResult::failed("bad format");
        assert_eq!(result.status, ProcessingStatus::Failed);
        assert!(result.write_plan.is_none());
        assert_eq!(result.error_message.as_deref(), Some("bad format"));
    }
}
