//! The pure (phase, stage, command) -> Transition Result lookup table.
//!
//! This module has no dependency on services — it is pure data plus pure functions,
//! the innermost layer of the flattened dependency graph (SPEC_FULL.md §9).

use crate::model::{Action, Command, Phase, Stage, Status, TransitionResult};

/// Looks up the transition for a command issued at the given (phase, stage).
///
/// Returns `None` when the combination is not in the table, i.e. the command is
/// illegal there — the caller (the Orchestrator) turns that into
/// `EngineError::InvalidCommand`.
///
/// The REVIEW/RESPONSE + approve branch is the only data-dependent entry; its actual
/// next phase depends on the parsed review verdict and is resolved by
/// [`review_response_transition`] rather than this table, since a verdict is not known
/// until the response has been read.
pub fn lookup(phase: Phase, stage: Stage, command: Command) -> Option<TransitionResult> {
    use Action::*;
    use Command::*;
    use Phase::*;
    use Stage::*;

    if command == Cancel && !phase.is_terminal() {
        return Some(TransitionResult {
            next_phase: Cancelled,
            next_stage: None,
            action: Action::None,
            status_override: Some(Status::Cancelled),
        });
    }

    // reject / retry never change (phase, stage): they are handled entirely by the
    // approval gate retry loop and only require that the combination is legal, i.e.
    // that a RESPONSE stage with `pending_approval` is active. The orchestrator
    // enforces `pending_approval` itself; here we only gate on stage shape.
    if (command == Reject || command == Retry) && stage == Response && !phase.is_terminal() {
        return Some(TransitionResult {
            next_phase: phase,
            next_stage: stage,
            action: Action::None,
            status_override: None,
        });
    }

    match (phase, stage, command) {
        (Init, None, Init) => Some(TransitionResult {
            next_phase: Plan,
            next_stage: Prompt,
            action: GeneratePrompt,
            status_override: None,
        }),
        (Plan, Prompt, Approve) => Some(TransitionResult {
            next_phase: Plan,
            next_stage: Response,
            action: InvokeAiProvider,
            status_override: None,
        }),
        (Plan, Response, Approve) => Some(TransitionResult {
            next_phase: Generate,
            next_stage: Prompt,
            action: HashPlanAndGeneratePrompt,
            status_override: None,
        }),
        (Generate, Prompt, Approve) => Some(TransitionResult {
            next_phase: Generate,
            next_stage: Response,
            action: InvokeAiProvider,
            status_override: None,
        }),
        (Generate, Response, Approve) => Some(TransitionResult {
            next_phase: Review,
            next_stage: Prompt,
            action: ExtractCodeAndGeneratePrompt,
            status_override: None,
        }),
        (Review, Prompt, Approve) => Some(TransitionResult {
            next_phase: Review,
            next_stage: Response,
            action: InvokeAiProvider,
            status_override: None,
        }),
        // REVIEW/RESPONSE + approve: branch resolved by review_response_transition.
        (Review, Response, Approve) => Some(TransitionResult {
            next_phase: Complete,
            next_stage: None,
            action: HashReviewAndBranch,
            status_override: Some(Status::Success),
        }),
        (Revise, Prompt, Approve) => Some(TransitionResult {
            next_phase: Revise,
            next_stage: Response,
            action: InvokeAiProvider,
            status_override: None,
        }),
        (Revise, Response, Approve) => Some(TransitionResult {
            next_phase: Review,
            next_stage: Prompt,
            action: ExtractRevisedCodeAndGeneratePrompt,
            status_override: None,
        }),
        _ => None,
    }
}

/// The verdict embedded in a review response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
}

static VERDICT_LINE: std::sync::LazyLock<regex::Regex> =
    std::sync::LazyLock::new(|| regex::Regex::new(r"(?i)VERDICT:\s*(PASS|FAIL)").unwrap());

/// Parses a `VERDICT: PASS|FAIL` line from review response text, defaulting to
/// `Fail` when no recognizable verdict is present (the same safe-default philosophy
/// as the approval gate's REJECTED default — see SPEC_FULL.md §4.1).
pub fn parse_verdict(text: &str) -> Verdict {
    match VERDICT_LINE.captures(text) {
        Some(caps) if caps[1].eq_ignore_ascii_case("PASS") => Verdict::Pass,
        _ => Verdict::Fail,
    }
}

/// Resolves the data-dependent REVIEW/RESPONSE + approve branch once the verdict is
/// known. A `Pass` ends the workflow; a `Fail` opens a new revision iteration.
pub fn review_response_transition(verdict: Verdict) -> TransitionResult {
    match verdict {
        Verdict::Pass => TransitionResult {
            next_phase: Phase::Complete,
            next_stage: Stage::None,
            action: Action::HashReviewAndBranch,
            status_override: Some(Status::Success),
        },
        Verdict::Fail => TransitionResult {
            next_phase: Phase::Revise,
            next_stage: Stage::Prompt,
            action: Action::HashReviewAndBranch,
            status_override: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_transitions_to_plan_prompt() {
        let t = lookup(Phase::Init, Stage::None, Command::Init).unwrap();
        assert_eq!(t.next_phase, Phase::Plan);
        assert_eq!(t.next_stage, Stage::Prompt);
    }

    #[test]
    fn cancel_is_legal_from_any_non_terminal_phase() {
        for phase in [Phase::Plan, Phase::Generate, Phase::Review, Phase::Revise] {
            let t = lookup(phase, Stage::Prompt, Command::Cancel).unwrap();
            assert_eq!(t.next_phase, Phase::Cancelled);
            assert_eq!(t.status_override, Some(Status::Cancelled));
        }
    }

    #[test]
    fn cancel_is_illegal_from_terminal_phases() {
        assert!(lookup(Phase::Complete, Stage::None, Command::Cancel).is_none());
        assert!(lookup(Phase::Cancelled, Stage::None, Command::Cancel).is_none());
    }

    #[test]
    fn unknown_combination_is_none() {
        assert!(lookup(Phase::Complete, Stage::None, Command::Approve).is_none());
        assert!(lookup(Phase::Plan, Stage::Response, Command::Init).is_none());
    }

    #[test]
    fn reject_and_retry_do_not_change_phase_or_stage() {
        let t = lookup(Phase::Plan, Stage::Response, Command::Reject).unwrap();
        assert_eq!(t.next_phase, Phase::Plan);
        assert_eq!(t.next_stage, Stage::Response);

        let t = lookup(Phase::Generate, Stage::Response, Command::Retry).unwrap();
        assert_eq!(t.next_phase, Phase::Generate);
        assert_eq!(t.next_stage, Stage::Response);
    }

    #[test]
    fn verdict_parses_pass_case_insensitive() {
        assert_eq!(parse_verdict("some text\nVERDICT: pass\nmore"), Verdict::Pass);
        assert_eq!(parse_verdict("VERDICT: PASS"), Verdict::Pass);
    }

    #[test]
    fn verdict_parses_fail() {
        assert_eq!(parse_verdict("VERDICT: FAIL"), Verdict::Fail);
    }

    #[test]
    fn verdict_defaults_to_fail_when_absent() {
        assert_eq!(parse_verdict("no verdict line here"), Verdict::Fail);
    }

    #[test]
    fn review_response_transition_branches_on_verdict() {
        let pass = review_response_transition(Verdict::Pass);
        assert_eq!(pass.next_phase, Phase::Complete);
        assert_eq!(pass.status_override, Some(Status::Success));

        let fail = review_response_transition(Verdict::Fail);
        assert_eq!(fail.next_phase, Phase::Revise);
        assert_eq!(fail.next_stage, Stage::Prompt);
        assert_eq!(fail.status_override, None);
    }
}
