//! Built-in `StandardsProvider` implementations, materialized once at session
//! init into `standards-bundle.md`. Grounded on
//! `original_source/aiwf/application/workflow_orchestrator.py` (resolves a
//! `StandardsProviderFactory` key — CLI override, else the profile's default, else the
//! config's `default_standards_provider`) and `original_source/aiwf/application/config_loader.py`
//! (`"scoped-layer-fs"` as the built-in default key); a null provider plus a file-backed
//! one is this crate's minimal stand-in for that registry, anything richer being
//! profile-specific and out of scope here.

use std::path::Path;

use crate::collaborators::StandardsProvider;

/// Produces an empty bundle. The default when a session doesn't configure one.
pub struct NullStandardsProvider;

impl StandardsProvider for NullStandardsProvider {
    fn key(&self) -> &str {
        "null"
    }

    fn bundle(&self, _session_dir: &Path) -> anyhow::Result<String> {
        Ok(String::new())
    }
}

/// Reads a configured file from disk and uses its contents verbatim as the bundle.
pub struct FileStandardsProvider {
    source_path: std::path::PathBuf,
}

impl FileStandardsProvider {
    pub fn new(source_path: std::path::PathBuf) -> Self {
        FileStandardsProvider { source_path }
    }
}

impl StandardsProvider for FileStandardsProvider {
    fn key(&self) -> &str {
        "file"
    }

    fn bundle(&self, _session_dir: &Path) -> anyhow::Result<String> {
        std::fs::read_to_string(&self.source_path)
            .map_err(|e| anyhow::anyhow!(e).context(format!("failed to read standards file {}", self.source_path.display())))
    }
}
