use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::auth::Auth;
use crate::callback::PromptFn;
use crate::config::Config;
use crate::error::{AuthError, Result};

/// Options threaded into every interactive login.
#[derive(Clone, Default)]
pub struct LoginOptions {
    /// Skip opening a browser; print the URL and rely on the manual
    /// paste path instead (SSH tunnels, containers).
    pub no_browser: bool,
    /// Caller-supplied hints (`api_key`, `auth_method`, `project_id`,
    /// `label`, ...). Providers read what they understand.
    pub metadata: BTreeMap<String, String>,
    /// Interactive question callback. Also powers the manual-paste
    /// fallback. `None` means fully non-interactive.
    pub prompt: Option<PromptFn>,
}

impl LoginOptions {
    /// A caller-supplied hint, when present and non-empty.
    pub fn hint(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Ask the user a question. Fails when no prompt is wired in.
    pub fn ask(&self, question: &str) -> Result<String> {
        let prompt = self
            .prompt
            .as_ref()
            .ok_or_else(|| AuthError::InvalidInput(format!("`{question}` requires a prompt")))?;
        Ok(prompt(question)?.trim().to_string())
    }
}

impl std::fmt::Debug for LoginOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginOptions")
            .field("no_browser", &self.no_browser)
            .field("metadata", &self.metadata.keys().collect::<Vec<_>>())
            .field("prompt", &self.prompt.is_some())
            .finish()
    }
}

/// The polymorphic per-provider contract.
///
/// Every provider implements `login`; `refresh` and `import` are
/// capabilities: the defaults declare them unsupported/absent, and the
/// manager surfaces that as a typed error rather than guessing.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Stable provider key (`claude`, `codex`, `kiro`, ...).
    fn provider(&self) -> &'static str;

    /// How long before expiry the manager should pre-refresh. `None`
    /// means the credential is never refreshed (bearer API keys).
    fn refresh_lead(&self) -> Option<Duration>;

    /// Interactive acquisition.
    async fn login(&self, config: &Config, opts: &LoginOptions) -> Result<Auth>;

    /// Non-interactive renewal.
    async fn refresh(&self, _config: &Config, _auth: &Auth) -> Result<Auth> {
        Err(AuthError::RefreshUnsupported {
            provider: self.provider().to_string(),
        })
    }

    /// Read credentials from a peer CLI's on-disk store, when this
    /// provider has one. `Ok(None)` means nothing was found.
    async fn import(&self, _config: &Config) -> Result<Option<Auth>> {
        Ok(None)
    }
}
