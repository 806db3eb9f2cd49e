//! Confines all session-relative writes to the session root.

use std::path::{Component, Path, PathBuf};

use crate::errors::EngineError;

/// Filenames the engine owns and that no profile-emitted write plan may overwrite.
pub const PROTECTED_FILENAMES: &[&str] = &["session.json", "standards-bundle.md"];

/// Validates a profile- or user-supplied relative path against `session_root` and
/// returns the resolved absolute path.
///
/// Rejects (per §4.7): `..` components, absolute paths (leading `/` or a Windows
/// drive-letter prefix regardless of host OS, since profile authors may target either),
/// paths resolving outside the session root, and writes to a protected filename.
pub fn validate(session_root: &Path, relpath: &str) -> Result<PathBuf, EngineError> {
    let normalized = normalize(relpath);

    if looks_absolute(&normalized) {
        return Err(EngineError::PathValidation {
            path: relpath.to_string(),
            reason: "absolute paths are not permitted".to_string(),
        });
    }

    let candidate = PathBuf::from(&normalized);
    for component in candidate.components() {
        match component {
            Component::ParentDir => {
                return Err(EngineError::PathValidation {
                    path: relpath.to_string(),
                    reason: "path traversal ('..') is not permitted".to_string(),
                });
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(EngineError::PathValidation {
                    path: relpath.to_string(),
                    reason: "absolute paths are not permitted".to_string(),
                });
            }
            _ => {}
        }
    }

    if let Some(filename) = candidate.file_name().and_then(|f| f.to_str()) {
        if PROTECTED_FILENAMES.contains(&filename) {
            return Err(EngineError::PathValidation {
                path: relpath.to_string(),
                reason: format!("'{filename}' is a protected filename"),
            });
        }
    }

    let joined = session_root.join(&candidate);
    let resolved = lexically_resolve(&joined);
    let resolved_root = lexically_resolve(session_root);

    if !resolved.starts_with(&resolved_root) {
        return Err(EngineError::PathValidation {
            path: relpath.to_string(),
            reason: "resolved path escapes the session root".to_string(),
        });
    }

    Ok(resolved)
}

/// Re-validates an already-resolved absolute path immediately before opening it for
/// write (defense-in-depth, §4.7).
pub fn validate_before_write(session_root: &Path, absolute: &Path) -> Result<(), EngineError> {
    let resolved = lexically_resolve(absolute);
    let resolved_root = lexically_resolve(session_root);
    if !resolved.starts_with(&resolved_root) {
        return Err(EngineError::PathValidation {
            path: absolute.display().to_string(),
            reason: "resolved path escapes the session root".to_string(),
        });
    }
    Ok(())
}

/// Replaces backslashes with forward slashes and collapses repeated separators, so
/// paths are compared the same way regardless of host OS.
fn normalize(relpath: &str) -> String {
    let forward = relpath.replace('\\', "/");
    let mut out = String::with_capacity(forward.len());
    let mut last_was_slash = false;
    for ch in forward.chars() {
        if ch == '/' {
            if last_was_slash {
                continue;
            }
            last_was_slash = true;
        } else {
            last_was_slash = false;
        }
        out.push(ch);
    }
    out
}

fn looks_absolute(normalized: &str) -> bool {
    if normalized.starts_with('/') {
        return true;
    }
    // Windows drive-letter prefix, e.g. "C:/foo" - rejected on every host OS since a
    // profile targeting this engine must stay relative no matter what wrote the path.
    let bytes = normalized.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Resolves `.`/`..` components lexically without touching the filesystem (the target
/// path may not exist yet, unlike `Path::canonicalize`).
fn lexically_resolve(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
