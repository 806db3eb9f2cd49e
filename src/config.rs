//! Layered configuration (`.aiwf/engine.toml`), modeled on the teacher's `ForgeConfig`
//! (`forge_config.rs`): a TOML file with `[defaults]` and per-phase/per-stage override
//! sections, loaded via `toml` + `serde`, with a couple of leaf settings overridable by
//! environment variable. Produces an immutable `EngineConfig` at startup; the engine is
//! runnable with zero configuration (SPEC_FULL.md Ambient Stack / Configuration).
//!
//! spec.md §6 describes the configuration format as "a YAML-encoded tree"; this engine
//! is TOML-only, following the teacher's `ForgeConfig` rather than the original's
//! `yaml`-loading `config_loader.py`. See `DESIGN.md`'s dependency-drop notes for why
//! `serde_yaml` didn't carry over.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::StageConfig;

/// Per-stage configuration as it appears on disk: either a bare approver-key string
/// (shorthand) or a fully structured table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StageConfigEntry {
    Shorthand(String),
    Full(StageConfigToml),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageConfigToml {
    #[serde(default)]
    pub ai_provider: Option<String>,
    #[serde(default)]
    pub approval_provider: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub allow_rewrite: Option<bool>,
    #[serde(default)]
    pub approver_config: HashMap<String, String>,
}

impl StageConfigEntry {
    /// Normalizes both on-disk shapes to a `StageConfigToml`, treating a bare string as
    /// an `approval_provider` override with everything else left unset.
    fn into_toml(self) -> StageConfigToml {
        match self {
            StageConfigEntry::Shorthand(key) => StageConfigToml {
                approval_provider: Some(key),
                ..Default::default()
            },
            StageConfigEntry::Full(table) => table,
        }
    }

    /// Layers `self` onto `base`, with every explicitly-set field in `self` winning,
    /// including setting back to the documented default.
    fn apply(self, base: &mut StageConfig) {
        let table = self.into_toml();
        if let Some(v) = table.ai_provider {
            base.ai_provider = Some(v);
        }
        if let Some(v) = table.approval_provider {
            base.approval_provider = v;
        }
        if let Some(v) = table.max_retries {
            base.max_retries = v;
        }
        if let Some(v) = table.allow_rewrite {
            base.allow_rewrite = v;
        }
        for (k, v) in table.approver_config {
            base.approver_config.insert(k, v);
        }
    }
}

/// Optional `prompt`/`response` overrides nested under a phase's config table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseConfigToml {
    #[serde(flatten)]
    pub phase_level: StageConfigToml,
    #[serde(default)]
    pub prompt: Option<StageConfigEntry>,
    #[serde(default)]
    pub response: Option<StageConfigEntry>,
}

/// The `[workflow]` table: `defaults` plus one optional sub-table per phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowConfigToml {
    #[serde(default)]
    pub defaults: StageConfigToml,
    #[serde(default)]
    pub plan: Option<PhaseConfigToml>,
    #[serde(default)]
    pub generate: Option<PhaseConfigToml>,
    #[serde(default)]
    pub review: Option<PhaseConfigToml>,
    #[serde(default)]
    pub revise: Option<PhaseConfigToml>,
}

impl WorkflowConfigToml {
    fn phase_table(&self, phase: crate::model::Phase) -> Option<&PhaseConfigToml> {
        use crate::model::Phase;
        match phase {
            Phase::Plan => self.plan.as_ref(),
            Phase::Generate => self.generate.as_ref(),
            Phase::Review => self.review.as_ref(),
            Phase::Revise => self.revise.as_ref(),
            Phase::Init | Phase::Complete | Phase::Cancelled | Phase::Error => None,
        }
    }

    /// Cascades `defaults -> phase-level -> stage-level` for the given (phase, stage),
    /// generalizing the teacher's one-level `ForgeConfig::phase_settings` cascade to
    /// two levels.
    pub fn resolve(&self, phase: crate::model::Phase, stage: crate::model::Stage) -> StageConfig {
        use crate::model::Stage;

        let mut resolved = StageConfig::default();
        StageConfigEntry::Full(self.defaults.clone()).apply(&mut resolved);

        if phase.is_terminal() {
            return resolved;
        }

        let Some(phase_table) = self.phase_table(phase) else {
            return resolved;
        };

        StageConfigEntry::Full(phase_table.phase_level.clone()).apply(&mut resolved);

        let stage_entry = match stage {
            Stage::Prompt => phase_table.prompt.clone(),
            Stage::Response => phase_table.response.clone(),
            Stage::None => None,
        };
        if let Some(entry) = stage_entry {
            entry.apply(&mut resolved);
        }

        resolved
    }
}

/// Top-level `.aiwf/engine.toml` structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfigToml {
    #[serde(default)]
    pub workflow: WorkflowConfigToml,
    /// Root directory holding all session subdirectories. Relative paths are resolved
    /// against the directory containing `engine.toml`.
    #[serde(default)]
    pub sessions_root: Option<PathBuf>,
    /// Standards provider key used when a session doesn't specify one at init.
    #[serde(default = "default_standards_provider")]
    pub default_standards_provider: String,
}

fn default_standards_provider() -> String {
    "null".to_string()
}

impl EngineConfigToml {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse engine.toml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Returns the default configuration when no file is present at `path`
    /// (mirrors `ForgeToml::load_or_default`'s tolerant fallback).
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

/// The resolved, immutable configuration object produced once at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sessions_root: PathBuf,
    pub default_standards_provider: String,
    workflow: WorkflowConfigToml,
}

const SESSIONS_ROOT_ENV: &str = "AIWF_SESSIONS_ROOT";

impl EngineConfig {
    /// Loads `<project_dir>/.aiwf/engine.toml`, falling back to defaults when absent,
    /// then applies the `AIWF_SESSIONS_ROOT` environment override (mirroring the
    /// teacher's `CLAUDE_CMD`/`SKIP_PERMISSIONS` env-overrides-file pattern).
    pub fn load(project_dir: &Path) -> Result<Self> {
        let aiwf_dir = project_dir.join(".aiwf");
        let config_path = aiwf_dir.join("engine.toml");
        let toml = EngineConfigToml::load_or_default(&config_path)?;

        let sessions_root = std::env::var(SESSIONS_ROOT_ENV)
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                toml.sessions_root
                    .clone()
                    .map(|p| if p.is_absolute() { p } else { aiwf_dir.join(p) })
            })
            .unwrap_or_else(|| aiwf_dir.join("sessions"));

        Ok(EngineConfig {
            sessions_root,
            default_standards_provider: toml.default_standards_provider.clone(),
            workflow: toml.workflow,
        })
    }

    /// Zero-configuration defaults rooted at `sessions_root` (used by tests and by
    /// callers that don't need a project directory at all).
    pub fn with_sessions_root(sessions_root: PathBuf) -> Self {
        EngineConfig {
            sessions_root,
            default_standards_provider: default_standards_provider(),
            workflow: WorkflowConfigToml::default(),
        }
    }

    pub fn resolve_stage_config(&self, phase: crate::model::Phase, stage: crate::model::Stage) -> StageConfig {
        self.workflow.resolve(phase, stage)
    }
}
