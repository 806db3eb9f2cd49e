//! Built-in `AiProvider` and `ApprovalProvider` implementations.
//!
//! `ManualProvider` is the filesystem hand-off AI provider the distilled spec names
//! explicitly. The approval providers are grounded in
//! `original_source/aiwf/domain/providers/ai_approval_provider.py::AIApprovalProvider`,
//! which wraps an arbitrary `ResponseProvider` (our `AiProvider`) to produce approval
//! decisions from its raw text via `approval::parse_decision`.

use std::collections::HashMap;

use crate::approval::{build_file_bundle, parse_decision, rejection_for_missing_response};
use crate::collaborators::{
    AiProvider, ApprovalContext, ApprovalProvider, FilesystemAbility, ProviderMetadata,
};
use crate::model::ApprovalResult;

/// Manual hand-off: `generate` always returns `None`, signalling that the engine
/// should write the prompt file and wait for a user to place the response file.
pub struct ManualProvider;

impl AiProvider for ManualProvider {
    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            key: "manual".to_string(),
            filesystem_ability: FilesystemAbility::None,
        }
    }

    fn generate(
        &self,
        _prompt: &str,
        _context: &HashMap<String, serde_json::Value>,
    ) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

/// Always approves, skipping human or AI evaluation entirely.
pub struct SkipApprovalProvider;

impl ApprovalProvider for SkipApprovalProvider {
    fn key(&self) -> &str {
        "skip"
    }

    fn evaluate(&self, _ctx: &ApprovalContext) -> anyhow::Result<ApprovalResult> {
        Ok(ApprovalResult::approved())
    }
}

/// Always returns PENDING: the user's next explicit `approve`/`reject` command is
/// itself the decision.
pub struct ManualApprovalProvider;

impl ApprovalProvider for ManualApprovalProvider {
    fn key(&self) -> &str {
        "manual"
    }

    fn evaluate(&self, _ctx: &ApprovalContext) -> anyhow::Result<ApprovalResult> {
        Ok(ApprovalResult::pending())
    }
}

/// Wraps an `AiProvider`, builds an approval prompt from the file bundle, and parses
/// the three-way decision from the raw response text.
pub struct AiWrappedApprovalProvider {
    key: String,
    provider: Box<dyn AiProvider>,
}

impl AiWrappedApprovalProvider {
    pub fn new(key: impl Into<String>, provider: Box<dyn AiProvider>) -> Self {
        AiWrappedApprovalProvider { key: key.into(), provider }
    }

    fn build_prompt(&self, ctx: &ApprovalContext) -> String {
        let bundle = build_file_bundle(&ctx.files);
        let rewrite_instruction = if ctx.allow_rewrite {
            "- You may suggest a rewrite if needed\n"
        } else {
            ""
        };
        let suggested_format = if ctx.allow_rewrite {
            "SUGGESTED_CONTENT: [Your rewritten content if suggesting changes]\n"
        } else {
            ""
        };

        let mut paths: Vec<&String> = bundle.keys().collect();
        paths.sort();
        let mut content = String::new();
        for path in paths {
            content.push_str(&format!("### {path}\n{}\n\n", bundle[path]));
        }
        if content.is_empty() {
            content.push_str("[No files]\n");
        }

        format!(
            "Evaluate the following content for approval.\n\n\
             ## Content\n{content}\n\
             **CRITICAL: You MUST respond with exactly the word \"APPROVED\" or \"REJECTED\" on the DECISION line.**\n\n\
             ## Response Format (REQUIRED)\n\
             DECISION: APPROVED\nor\nDECISION: REJECTED\n{rewrite_instruction}\
             FEEDBACK: [Your feedback if rejected, or \"None\" if approved]\n{suggested_format}"
        )
    }
}

impl ApprovalProvider for AiWrappedApprovalProvider {
    fn key(&self) -> &str {
        &self.key
    }

    fn evaluate(&self, ctx: &ApprovalContext) -> anyhow::Result<ApprovalResult> {
        let prompt = self.build_prompt(ctx);
        let approver_context: HashMap<String, serde_json::Value> = ctx
            .approver_config
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();

        let response = match self.provider.generate(&prompt, &approver_context)? {
            Some(text) if !text.trim().is_empty() => text,
            Some(_empty) => return Ok(rejection_for_missing_response(true)),
            None => return Ok(rejection_for_missing_response(false)),
        };

        Ok(parse_decision(&response, ctx.allow_rewrite))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_provider_always_returns_none() {
        let provider = ManualProvider;
        let result = provider.generate("prompt", &HashMap::new()).unwrap();
        assert!(result.is_none());
    }

    fn sample_ctx(files: HashMap<String, String>, allow_rewrite: bool) -> ApprovalContext {
        ApprovalContext {
            session_id: "abc".to_string(),
            iteration: 1,
            allow_rewrite,
            criteria_file: None,
            plan_file: None,
            review_file: None,
            session_dir: std::path::PathBuf::from("/tmp/abc"),
            approver_config: HashMap::new(),
            files,
        }
    }

    #[test]
    fn skip_provider_always_approves() {
        let provider = SkipApprovalProvider;
        let result = provider.evaluate(&sample_ctx(HashMap::new(), false)).unwrap();
        assert_eq!(result.decision, crate::model::Decision::Approved);
    }

    #[test]
    fn manual_approval_provider_always_pending() {
        let provider = ManualApprovalProvider;
        let result = provider.evaluate(&sample_ctx(HashMap::new(), false)).unwrap();
        assert_eq!(result.decision, crate::model::Decision::Pending);
    }

    struct StubAiProvider(Option<String>);
    impl AiProvider for StubAiProvider {
        fn metadata(&self) -> ProviderMetadata {
            ProviderMetadata { key: "stub".to_string(), filesystem_ability: FilesystemAbility::None }
        }
        fn generate(
            &self,
            _prompt: &str,
            _context: &HashMap<String, serde_json::Value>,
        ) -> anyhow::Result<Option<String>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn ai_wrapped_provider_parses_underlying_response() {
        let provider = AiWrappedApprovalProvider::new(
            "stub",
            Box::new(StubAiProvider(Some("DECISION: APPROVED\nFEEDBACK: none".to_string()))),
        );
        let result = provider.evaluate(&sample_ctx(HashMap::new(), false)).unwrap();
        assert_eq!(result.decision, crate::model::Decision::Approved);
    }

    #[test]
    fn ai_wrapped_provider_rejects_when_underlying_provider_returns_none() {
        let provider = AiWrappedApprovalProvider::new("stub", Box::new(StubAiProvider(None)));
        let result = provider.evaluate(&sample_ctx(HashMap::new(), false)).unwrap();
        assert_eq!(result.decision, crate::model::Decision::Rejected);
        assert_eq!(result.feedback.as_deref(), Some("Provider returned no response"));
    }

    #[test]
    fn ai_wrapped_provider_rejects_when_response_text_is_empty() {
        let provider = AiWrappedApprovalProvider::new("stub", Box::new(StubAiProvider(Some("   ".to_string()))));
        let result = provider.evaluate(&sample_ctx(HashMap::new(), false)).unwrap();
        assert_eq!(result.decision, crate::model::Decision::Rejected);
        assert_eq!(
            result.feedback.as_deref(),
            Some("Provider returned no response text for approval evaluation")
        );
    }
}
