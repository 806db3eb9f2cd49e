//! Materializes approved content to disk and tracks it as content-addressed artifacts:
//! legacy-prefix stripping, canonical `iteration-N/code/` prefix application,
//! refuse-overwrite semantics, and copy-forward of unchanged files across iterations.

use std::path::Path;

use sha2::{Digest, Sha256};
use std::sync::LazyLock;

use crate::collaborators::WritePlan;
use crate::errors::EngineError;
use crate::layout::{code_dir, plan_file};
use crate::model::{Artifact, Phase};
use crate::path_validator;

/// Matches a legacy `iteration-N/` or `iteration-N/code/` prefix a profile might still
/// emit, so it can be stripped before the canonical prefix is reapplied.
static LEGACY_PREFIX: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^iteration-\d+(?:/code)?/").unwrap());

fn strip_legacy_prefix(relpath: &str) -> &str {
    match LEGACY_PREFIX.find(relpath) {
        Some(m) => &relpath[m.end()..],
        None => relpath,
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Reads and hashes `iteration-1/planning-response.md`, copying it to session-root
/// `plan.md`.
pub fn approve_plan_response(session_dir: &Path, response_path: &Path) -> Result<String, EngineError> {
    let content = std::fs::read(response_path).map_err(|_| EngineError::MissingArtifact {
        relpath: response_path.display().to_string(),
        path: response_path.to_path_buf(),
    })?;
    let hash = sha256_hex(&content);

    let destination = plan_file(session_dir);
    path_validator::validate_before_write(session_dir, &destination)?;
    std::fs::write(&destination, &content)
        .map_err(|e| EngineError::Other(anyhow::anyhow!(e).context("failed to write plan.md")))?;

    Ok(hash)
}

/// Reads and hashes `iteration-N/review-response.md`. The verdict itself is parsed
/// separately by `transition::parse_verdict`.
pub fn hash_review_response(response_path: &Path) -> Result<String, EngineError> {
    let content = std::fs::read(response_path).map_err(|_| EngineError::MissingArtifact {
        relpath: response_path.display().to_string(),
        path: response_path.to_path_buf(),
    })?;
    Ok(sha256_hex(&content))
}

/// Writes every entry of a generation/revision write plan into `iteration-N/code/`,
/// refusing to overwrite an existing file and validating every path. Returns one
/// `Artifact` per entry written, with `sha256 = None` until `hash_pending_code_artifacts`
/// hashes it.
pub fn write_code_artifacts(
    session_dir: &Path,
    phase: Phase,
    iteration: u32,
    plan: &WritePlan,
) -> Result<Vec<Artifact>, EngineError> {
    let mut artifacts = Vec::with_capacity(plan.len());

    for entry in plan {
        let canonical_relpath = format!("iteration-{iteration}/code/{}", strip_legacy_prefix(&entry.relative_path));
        let absolute = path_validator::validate(session_dir, &canonical_relpath)?;
        path_validator::validate_before_write(session_dir, &absolute)?;

        if absolute.exists() {
            return Err(EngineError::Other(anyhow::anyhow!(
                "refusing to overwrite existing artifact at {}",
                absolute.display()
            )));
        }

        if let Some(parent) = absolute.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Other(anyhow::anyhow!(e).context("failed to create code directory")))?;
        }
        std::fs::write(&absolute, &entry.content)
            .map_err(|e| EngineError::Other(anyhow::anyhow!(e).context("failed to write artifact")))?;

        artifacts.push(Artifact {
            path: canonical_relpath,
            phase,
            iteration,
            sha256: None,
            created_at: chrono::Utc::now(),
        });
    }

    Ok(artifacts)
}

/// Copies every file present in `iteration-(N-1)/code/` but absent from
/// `iteration-N/code/` into the new iteration, preserving relative paths. Only called
/// when `current_iteration > 1`.
pub fn copy_forward_missing_files(
    session_dir: &Path,
    phase: Phase,
    current_iteration: u32,
) -> Result<Vec<Artifact>, EngineError> {
    if current_iteration <= 1 {
        return Ok(Vec::new());
    }

    let previous_dir = code_dir(session_dir, current_iteration - 1);
    if !previous_dir.exists() {
        return Ok(Vec::new());
    }
    let new_dir = code_dir(session_dir, current_iteration);

    let mut copied = Vec::new();
    for entry in walkdir::WalkDir::new(&previous_dir) {
        let entry = entry.map_err(|e| EngineError::Other(anyhow::anyhow!(e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(&previous_dir)
            .expect("walkdir entries are always under previous_dir");
        let destination = new_dir.join(relative);
        if destination.exists() {
            continue;
        }

        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Other(anyhow::anyhow!(e).context("failed to create code directory")))?;
        }
        std::fs::copy(entry.path(), &destination)
            .map_err(|e| EngineError::Other(anyhow::anyhow!(e).context("failed to copy forward artifact")))?;

        let relpath = format!(
            "iteration-{current_iteration}/code/{}",
            relative.to_string_lossy().replace('\\', "/")
        );
        copied.push(Artifact {
            path: relpath,
            phase,
            iteration: current_iteration,
            sha256: None,
            created_at: chrono::Utc::now(),
        });
    }

    Ok(copied)
}

/// Hashes every artifact of `iteration` whose `sha256` is still `None` and whose file
/// exists on disk, then discovers any file on disk under `iteration-N/code/` not yet
/// tracked in `artifacts` and appends a freshly hashed record for it. Unlocks
/// advancement to REVIEW: updates an existing artifact's hash by relpath if found,
/// else appends a new one.
pub fn hash_pending_code_artifacts(
    session_dir: &Path,
    artifacts: &mut Vec<Artifact>,
    phase: Phase,
    iteration: u32,
) -> Result<(), EngineError> {
    for artifact in artifacts.iter_mut() {
        if artifact.iteration != iteration || artifact.sha256.is_some() {
            continue;
        }
        let absolute = session_dir.join(&artifact.path);
        if !absolute.exists() {
            continue;
        }
        let content = std::fs::read(&absolute)
            .map_err(|e| EngineError::Other(anyhow::anyhow!(e).context("failed to read artifact for hashing")))?;
        artifact.sha256 = Some(sha256_hex(&content));
    }

    let dir = code_dir(session_dir, iteration);
    if !dir.exists() {
        return Ok(());
    }
    let tracked: std::collections::HashSet<&str> =
        artifacts.iter().map(|a| a.path.as_str()).collect();

    for entry in walkdir::WalkDir::new(&dir) {
        let entry = entry.map_err(|e| EngineError::Other(anyhow::anyhow!(e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(session_dir)
            .expect("walkdir entries are always under session_dir")
            .to_string_lossy()
            .replace('\\', "/");
        if tracked.contains(relative.as_str()) {
            continue;
        }
        let content = std::fs::read(entry.path())
            .map_err(|e| EngineError::Other(anyhow::anyhow!(e).context("failed to read untracked artifact for hashing")))?;
        artifacts.push(Artifact {
            path: relative,
            phase,
            iteration,
            sha256: Some(sha256_hex(&content)),
            created_at: chrono::Utc::now(),
        });
    }

    Ok(())
}
