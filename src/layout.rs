//! Fixed session-relative paths.
//!
//! The engine, not profiles, owns these paths, so any external tool can locate a
//! session's inputs and outputs without parsing `session.json`.

use std::path::PathBuf;

use crate::model::Phase;

/// Filename stem used for the prompt/response pair of a given phase.
///
/// `Init`, `Complete`, `Cancelled`, and `Error` have no stage files of their own.
fn phase_stem(phase: Phase) -> Option<&'static str> {
    match phase {
        Phase::Plan => Some("planning"),
        Phase::Generate => Some("generation"),
        Phase::Review => Some("review"),
        Phase::Revise => Some("revision"),
        Phase::Init | Phase::Complete | Phase::Cancelled | Phase::Error => None,
    }
}

/// `<session_root>/iteration-<n>`.
pub fn iteration_dir(session_root: &std::path::Path, iteration: u32) -> PathBuf {
    session_root.join(format!("iteration-{iteration}"))
}

/// `<session_root>/iteration-<n>/code`.
pub fn code_dir(session_root: &std::path::Path, iteration: u32) -> PathBuf {
    iteration_dir(session_root, iteration).join("code")
}

/// `<session_root>/iteration-<n>/<phase>-prompt.md`.
pub fn prompt_file(session_root: &std::path::Path, iteration: u32, phase: Phase) -> Option<PathBuf> {
    phase_stem(phase).map(|stem| iteration_dir(session_root, iteration).join(format!("{stem}-prompt.md")))
}

/// `<session_root>/iteration-<n>/<phase>-response.md`.
pub fn response_file(session_root: &std::path::Path, iteration: u32, phase: Phase) -> Option<PathBuf> {
    phase_stem(phase).map(|stem| iteration_dir(session_root, iteration).join(format!("{stem}-response.md")))
}

/// Session-root-relative form of [`prompt_file`], forward-slash separated, suitable for
/// `prompt_hashes` keys and for the `{{STANDARDS}}`-style "tell the AI where to look"
/// strings the Prompt Assembler emits.
pub fn prompt_relpath(iteration: u32, phase: Phase) -> Option<String> {
    phase_stem(phase).map(|stem| format!("iteration-{iteration}/{stem}-prompt.md"))
}

/// Session-root-relative form of [`response_file`].
pub fn response_relpath(iteration: u32, phase: Phase) -> Option<String> {
    phase_stem(phase).map(|stem| format!("iteration-{iteration}/{stem}-response.md"))
}

/// `<session_root>/plan.md`, written once the PLAN/RESPONSE approval runs.
pub fn plan_file(session_root: &std::path::Path) -> PathBuf {
    session_root.join("plan.md")
}

/// `<session_root>/standards-bundle.md`, materialized once at init and never rewritten.
pub fn standards_bundle_file(session_root: &std::path::Path) -> PathBuf {
    session_root.join("standards-bundle.md")
}

/// `<session_root>/session.json`, the canonical snapshot.
pub fn session_json_file(session_root: &std::path::Path) -> PathBuf {
    session_root.join("session.json")
}
