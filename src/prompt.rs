//! The Prompt Assembler (§2, §4.6 design note): substitutes engine-owned variables into
//! a profile-generated prompt body and appends provider-ability-dependent output
//! instructions. Grounded directly on
//! `original_source/aiwf/application/prompt_assembler.py::PromptAssembler`.

use std::path::Path;

use crate::collaborators::FilesystemAbility;

/// `{{STANDARDS}}` and `{{PLAN}}` resolve to session-relative paths, not absolute ones,
/// so the text is stable regardless of where the session directory happens to live on
/// a given machine (`_get_engine_variables` in the original).
fn engine_variables(session_id: &str) -> [(&'static str, String); 2] {
    [
        ("{{STANDARDS}}", format!(".aiwf/sessions/{session_id}/standards-bundle.md")),
        ("{{PLAN}}", format!(".aiwf/sessions/{session_id}/plan.md")),
    ]
}

fn substitute_engine_variables(content: &str, session_id: &str) -> String {
    let mut result = content.to_string();
    for (variable, value) in engine_variables(session_id) {
        result = result.replace(variable, &value);
    }
    result
}

/// Builds the `## Output Destination` instructions appended to every prompt that
/// expects a response file, branching on the acting AI provider's filesystem ability
/// (`_build_output_instructions` in the original).
fn output_instructions(
    fs_ability: FilesystemAbility,
    session_dir: &Path,
    response_relpath: Option<&str>,
) -> String {
    let Some(response_relpath) = response_relpath else {
        return String::new();
    };
    let response_filename = Path::new(response_relpath)
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| response_relpath.to_string());

    match fs_ability {
        FilesystemAbility::LocalWrite => {
            let absolute = session_dir.join(response_relpath);
            format!(
                "## Output Destination\n\nDo not display the file contents to the screen.\nSave your response to `{}`",
                absolute.display()
            )
        }
        FilesystemAbility::LocalRead => {
            format!("## Output Destination\n\nName your output file `{response_filename}`")
        }
        FilesystemAbility::WriteOnly => {
            format!("## Output Destination\n\nCreate a downloadable file named `{response_filename}`")
        }
        FilesystemAbility::None => String::new(),
    }
}

/// Assembles the final prompt body written to disk: engine-variable substitution, then
/// an appended output-instructions block separated by a `---` rule (`assemble` in the
/// original).
pub fn assemble(
    profile_prompt: &str,
    session_id: &str,
    session_dir: &Path,
    fs_ability: FilesystemAbility,
    response_relpath: Option<&str>,
) -> String {
    let substituted = substitute_engine_variables(profile_prompt, session_id);
    let instructions = output_instructions(fs_ability, session_dir, response_relpath);
    if instructions.is_empty() {
        substituted
    } else {
        format!("{substituted}\n\n---\n\n{instructions}")
    }
}
