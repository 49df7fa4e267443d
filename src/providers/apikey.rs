//! Bearer-API-key providers (minimax, zhipu, vertex).
//!
//! No OAuth here: the key comes from the caller's metadata or an
//! interactive prompt, and the record is never refreshed. One
//! authenticator type covers all three providers, the same way an
//! OpenAI-compatible wrapper covers a family of chat backends.

use async_trait::async_trait;
use std::time::Duration;

use super::traits::{Authenticator, LoginOptions};
use crate::auth::{Auth, keys, sanitize_identity, unix_millis_now};
use crate::config::Config;
use crate::error::{AuthError, Result};

/// Extra hints copied into metadata when the caller supplies them
/// (vertex wants a project and region; the others ignore them).
const PASSTHROUGH_HINTS: &[&str] = &[keys::PROJECT_ID, keys::REGION, keys::PREFERRED_ENDPOINT];

pub struct ApiKeyAuthenticator {
    provider: &'static str,
}

impl ApiKeyAuthenticator {
    pub fn new(provider: &'static str) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Authenticator for ApiKeyAuthenticator {
    fn provider(&self) -> &'static str {
        self.provider
    }

    /// Bearer keys do not expire on a schedule; never refreshed.
    fn refresh_lead(&self) -> Option<Duration> {
        None
    }

    async fn login(&self, _config: &Config, opts: &LoginOptions) -> Result<Auth> {
        let api_key = match opts.hint(keys::API_KEY) {
            Some(api_key) => api_key.to_string(),
            None => opts.ask(&format!("{} API key", self.provider))?,
        };
        if api_key.is_empty() {
            return Err(AuthError::InvalidInput("API key must not be empty".into()));
        }

        // An empty answer falls through to the timestamped default.
        let label = opts
            .hint("label")
            .map(str::to_string)
            .or_else(|| {
                opts.ask("Label for this key (optional)")
                    .ok()
                    .filter(|answer| !answer.is_empty())
            })
            .unwrap_or_else(|| format!("{}-{}", self.provider, unix_millis_now()));

        let mut auth = Auth::new(
            self.provider,
            format!("{}-{}", self.provider, sanitize_identity(&label)),
        );
        auth.set_meta(keys::API_KEY, api_key.clone());
        for hint in PASSTHROUGH_HINTS {
            if let Some(value) = opts.hint(hint) {
                auth.set_meta(hint, value.to_string());
            }
        }
        auth.attributes.insert(keys::API_KEY.into(), api_key);
        auth.attributes.insert("source".into(), "manual".into());
        auth.label = label;
        Ok(auth)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
