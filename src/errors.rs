//! Typed error hierarchy for the workflow engine.
//!
//! One top-level enum, `EngineError`, covers the error taxonomy. `anyhow` remains
//! the workhorse `Result` type for internal plumbing (file I/O, path canonicalization);
//! the orchestrator converts `anyhow` failures at its public boundary rather than
//! letting them escape directly.

use thiserror::Error;

use crate::model::{Command, Phase, Stage};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("command '{command}' is not valid at phase {phase}, stage {stage}")]
    InvalidCommand {
        command: Command,
        phase: Phase,
        stage: Stage,
    },

    #[error("missing required artifact '{relpath}' (expected at {path})")]
    MissingArtifact { relpath: String, path: std::path::PathBuf },

    #[error("path validation failed for '{path}': {reason}")]
    PathValidation { path: String, reason: String },

    #[error("provider '{provider}' failed: {message}")]
    ProviderError { provider: String, message: String },

    #[error("approval rejected: {feedback}")]
    Rejection { feedback: String },

    #[error("session data is invalid: {0}")]
    InvalidSessionData(String),

    #[error("workflow is in terminal phase {phase}; command '{command}' is not accepted")]
    Terminal { phase: Phase, command: Command },

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// `true` for errors that leave the workflow in a recoverable `IN_PROGRESS` state
    /// rather than propagating as a hard failure to the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::MissingArtifact { .. }
                | EngineError::ProviderError { .. }
                | EngineError::Rejection { .. }
        )
    }
}
