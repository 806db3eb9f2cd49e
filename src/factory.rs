//! Explicit dependency-injection factories (§9 "Global mutable registries → explicit
//! factories"): each collaborator family (profiles, AI providers, approval providers,
//! standards providers) is a map from a stable key to a constructor closure, injected
//! into the Orchestrator at construction. Grounded on
//! `original_source/aiwf/domain/providers/provider_factory.py` and
//! `domain/providers/approval_factory.py`, both dict-keyed-by-string `_registry`s with
//! `register`/`create` classmethods; `application/workflow_orchestrator.py` imports an
//! analogous `ProfileFactory` from `domain.profiles.profile_factory`, a module the
//! filtered pack doesn't include, so the profile registry here follows the same
//! `register`/`create` shape as the two factories that are present. Here the registry is
//! an explicit, per-instance value instead of the originals' process-wide mutable state,
//! so tests can substitute their own without touching global state.

use std::collections::HashMap;
use std::sync::Arc;

use crate::collaborators::{AiProvider, ApprovalProvider, Profile, StandardsProvider};
use crate::errors::EngineError;
use crate::profile::EchoProfile;
use crate::provider::{ManualApprovalProvider, ManualProvider, SkipApprovalProvider};
use crate::standards::NullStandardsProvider;

type ProfileCtor = Arc<dyn Fn() -> Box<dyn Profile> + Send + Sync>;
type AiProviderCtor = Arc<dyn Fn() -> Box<dyn AiProvider> + Send + Sync>;
type ApprovalProviderCtor = Arc<dyn Fn() -> Box<dyn ApprovalProvider> + Send + Sync>;
type StandardsProviderCtor = Arc<dyn Fn() -> Box<dyn StandardsProvider> + Send + Sync>;

/// The engine's collaborator registry. `Default` wires up the built-ins named in
/// SPEC_FULL.md §1 (`echo`, `manual`, `skip`, `null`); callers register additional keys
/// for their own profiles/providers before constructing the Orchestrator.
#[derive(Clone)]
pub struct Factories {
    profiles: HashMap<String, ProfileCtor>,
    ai_providers: HashMap<String, AiProviderCtor>,
    approval_providers: HashMap<String, ApprovalProviderCtor>,
    standards_providers: HashMap<String, StandardsProviderCtor>,
}

impl Default for Factories {
    fn default() -> Self {
        let mut factories = Factories {
            profiles: HashMap::new(),
            ai_providers: HashMap::new(),
            approval_providers: HashMap::new(),
            standards_providers: HashMap::new(),
        };
        factories.register_profile("echo", || Box::new(EchoProfile));
        factories.register_ai_provider("manual", || Box::new(ManualProvider));
        factories.register_approval_provider("skip", || Box::new(SkipApprovalProvider));
        factories.register_approval_provider("manual", || Box::new(ManualApprovalProvider));
        factories.register_standards_provider("null", || Box::new(NullStandardsProvider));
        factories
    }
}

impl Factories {
    pub fn new() -> Self {
        Factories {
            profiles: HashMap::new(),
            ai_providers: HashMap::new(),
            approval_providers: HashMap::new(),
            standards_providers: HashMap::new(),
        }
    }

    pub fn register_profile(&mut self, key: impl Into<String>, ctor: impl Fn() -> Box<dyn Profile> + Send + Sync + 'static) {
        self.profiles.insert(key.into(), Arc::new(ctor));
    }

    pub fn register_ai_provider(
        &mut self,
        key: impl Into<String>,
        ctor: impl Fn() -> Box<dyn AiProvider> + Send + Sync + 'static,
    ) {
        self.ai_providers.insert(key.into(), Arc::new(ctor));
    }

    pub fn register_approval_provider(
        &mut self,
        key: impl Into<String>,
        ctor: impl Fn() -> Box<dyn ApprovalProvider> + Send + Sync + 'static,
    ) {
        self.approval_providers.insert(key.into(), Arc::new(ctor));
    }

    pub fn register_standards_provider(
        &mut self,
        key: impl Into<String>,
        ctor: impl Fn() -> Box<dyn StandardsProvider> + Send + Sync + 'static,
    ) {
        self.standards_providers.insert(key.into(), Arc::new(ctor));
    }

    pub fn profile(&self, key: &str) -> Result<Box<dyn Profile>, EngineError> {
        self.profiles
            .get(key)
            .map(|ctor| ctor())
            .ok_or_else(|| unknown_key("profile", key))
    }

    pub fn ai_provider(&self, key: &str) -> Result<Box<dyn AiProvider>, EngineError> {
        self.ai_providers
            .get(key)
            .map(|ctor| ctor())
            .ok_or_else(|| unknown_key("ai provider", key))
    }

    pub fn approval_provider(&self, key: &str) -> Result<Box<dyn ApprovalProvider>, EngineError> {
        self.approval_providers
            .get(key)
            .map(|ctor| ctor())
            .ok_or_else(|| unknown_key("approval provider", key))
    }

    pub fn standards_provider(&self, key: &str) -> Result<Box<dyn StandardsProvider>, EngineError> {
        self.standards_providers
            .get(key)
            .map(|ctor| ctor())
            .ok_or_else(|| unknown_key("standards provider", key))
    }

    /// Every registered key, sorted, for the `validate` CLI command's "all" mode.
    pub fn ai_provider_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.ai_providers.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn standards_provider_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.standards_providers.keys().cloned().collect();
        keys.sort();
        keys
    }
}

fn unknown_key(kind: &str, key: &str) -> EngineError {
    EngineError::ProviderError {
        provider: key.to_string(),
        message: format!("no {kind} is registered under key '{key}'"),
    }
}
