//! Per-provider authenticators and the registry that maps stable
//! provider keys onto them.

pub mod antigravity;
pub mod apikey;
pub mod claude;
pub mod codex;
pub mod common;
pub mod gemini;
pub mod kiro;
pub mod qwen;
pub mod traits;

use std::collections::BTreeMap;
use std::sync::Arc;

pub use traits::{Authenticator, LoginOptions};

/// Every provider key this broker understands, in registry order.
pub const PROVIDER_KEYS: &[&str] = &[
    "antigravity",
    "claude",
    "codex",
    "gemini",
    "kiro",
    "minimax",
    "qwen",
    "vertex",
    "zhipu",
];

/// Build the full authenticator registry. Registered once at process
/// start; the manager dispatches by provider key.
pub fn build_registry() -> BTreeMap<&'static str, Arc<dyn Authenticator>> {
    let mut registry: BTreeMap<&'static str, Arc<dyn Authenticator>> = BTreeMap::new();

    let antigravity = Arc::new(antigravity::AntigravityAuthenticator::new());
    let claude = Arc::new(claude::ClaudeAuthenticator::new());
    let codex = Arc::new(codex::CodexAuthenticator::new());
    let gemini = Arc::new(gemini::GeminiAuthenticator::new());
    let kiro = Arc::new(kiro::KiroAuthenticator::new());
    let qwen = Arc::new(qwen::QwenAuthenticator::new());

    registry.insert("antigravity", antigravity);
    registry.insert("claude", claude);
    registry.insert("codex", codex);
    registry.insert("gemini", gemini);
    registry.insert("kiro", kiro);
    registry.insert("qwen", qwen);
    registry.insert("minimax", Arc::new(apikey::ApiKeyAuthenticator::new("minimax")));
    registry.insert("zhipu", Arc::new(apikey::ApiKeyAuthenticator::new("zhipu")));
    registry.insert("vertex", Arc::new(apikey::ApiKeyAuthenticator::new("vertex")));

    registry
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_covers_every_provider_key() {
        let registry = build_registry();
        for key in PROVIDER_KEYS {
            let authenticator = registry
                .get(key)
                .unwrap_or_else(|| panic!("provider `{key}` missing from registry"));
            assert_eq!(&authenticator.provider(), key);
        }
        assert_eq!(registry.len(), PROVIDER_KEYS.len());
    }

    #[test]
    fn refresh_leads_match_provider_tiers() {
        use std::time::Duration;
        let registry = build_registry();

        for key in ["claude", "codex", "gemini", "qwen"] {
            assert_eq!(
                registry[key].refresh_lead(),
                Some(Duration::from_secs(300)),
                "{key} should pre-refresh five minutes ahead"
            );
        }
        assert_eq!(
            registry["kiro"].refresh_lead(),
            Some(Duration::from_secs(86_400))
        );
        for key in ["antigravity", "minimax", "zhipu", "vertex"] {
            assert!(
                registry[key].refresh_lead().is_none(),
                "{key} should never be refreshed"
            );
        }
    }
}
