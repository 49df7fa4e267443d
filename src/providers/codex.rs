//! OpenAI Codex (ChatGPT OAuth) authentication flow.
//!
//! OAuth 2.0 Authorization Code + PKCE with a localhost callback. The
//! `id_token` JWT carries the account email and the ChatGPT account id;
//! both are recorded because the proxy needs the account id when
//! talking to the Codex backend.

use async_trait::async_trait;
use std::time::Duration;

use super::common::{
    apply_token_response, http_client, open_url_in_browser, post_token_form,
    print_manual_login_instructions, url_encode,
};
use super::traits::{Authenticator, LoginOptions};
use crate::auth::{Auth, keys};
use crate::callback::CallbackServer;
use crate::config::Config;
use crate::error::{AuthError, Result};
use crate::pkce::{PkcePair, generate_state, split_jwt};
use crate::store::record_id;

// ── Constants ───────────────────────────────────────────────────────

/// OAuth authorization URL (ChatGPT account OAuth).
const AUTH_URL: &str = "https://auth.openai.com/oauth/authorize";
/// OAuth token exchange URL.
const TOKEN_URL: &str = "https://auth.openai.com/oauth/token";
/// OAuth client id for Codex CLI logins.
const CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";
/// Localhost callback port.
const CALLBACK_PORT: u16 = 1455;
/// Localhost callback path (matches the Codex CLI registration).
const CALLBACK_PATH: &str = "/auth/callback";
/// OAuth scopes requested.
const SCOPE: &str = "openid profile email offline_access";
/// Refresh this long before expiry.
const REFRESH_LEAD: Duration = Duration::from_secs(5 * 60);

pub struct CodexAuthenticator {
    token_url: String,
}

impl CodexAuthenticator {
    pub fn new() -> Self {
        Self {
            token_url: TOKEN_URL.to_string(),
        }
    }

    /// Point the token exchange somewhere else (tests, relays).
    pub fn with_token_url(token_url: impl Into<String>) -> Self {
        Self {
            token_url: token_url.into(),
        }
    }
}

#[async_trait]
impl Authenticator for CodexAuthenticator {
    fn provider(&self) -> &'static str {
        "codex"
    }

    fn refresh_lead(&self) -> Option<Duration> {
        Some(REFRESH_LEAD)
    }

    async fn login(&self, config: &Config, opts: &LoginOptions) -> Result<Auth> {
        let pkce = PkcePair::generate();
        let state = generate_state();

        let mut server = CallbackServer::bind(CALLBACK_PORT, CALLBACK_PATH).await?;
        let redirect_uri = server.redirect_uri();

        let auth_url = format!(
            "{AUTH_URL}?\
            response_type=code\
            &client_id={CLIENT_ID}\
            &redirect_uri={redirect}\
            &scope={scope}\
            &state={state}\
            &code_challenge={challenge}\
            &code_challenge_method=S256\
            &id_token_add_organizations=true\
            &codex_cli_simplified_flow=true",
            redirect = url_encode(&redirect_uri),
            scope = url_encode(SCOPE),
            challenge = pkce.challenge,
        );

        print_manual_login_instructions("OpenAI Codex", &auth_url, &redirect_uri);
        if !opts.no_browser {
            open_url_in_browser(&auth_url);
        }

        let waited = server
            .wait(
                config.callback_timeout(),
                config.paste_grace(),
                opts.prompt.clone(),
            )
            .await;
        server.shutdown().await;
        let callback = waited?;

        if callback.state.as_deref() != Some(state.as_str()) {
            return Err(AuthError::StateMismatch);
        }
        let (code, _) = callback.into_code_and_state()?;

        let client = http_client(config.http_timeout());
        let tokens = post_token_form(
            &client,
            &self.token_url,
            &[
                ("grant_type", "authorization_code"),
                ("code", &code),
                ("redirect_uri", &redirect_uri),
                ("client_id", CLIENT_ID),
                ("code_verifier", &pkce.verifier),
            ],
        )
        .await?;

        let mut auth = Auth::new("codex", "codex");
        apply_token_response(&mut auth, &tokens);

        // The id_token claims label the record and carry the account id.
        let mut email = None;
        if let Some(id_token) = &tokens.id_token {
            if let Ok(parts) = split_jwt(id_token) {
                email = parts.claims.email().map(str::to_string);
                if let Some(account_id) = parts.claims.chatgpt_account_id() {
                    auth.set_meta(keys::ACCOUNT_ID, account_id.to_string());
                }
            }
        }

        auth.id = record_id("codex", email.as_deref());
        if let Some(email) = &email {
            auth.set_meta(keys::EMAIL, email.clone());
            auth.attributes.insert(keys::EMAIL.into(), email.clone());
        }
        auth.attributes.insert("source".into(), "oauth".into());
        auth.label = email.unwrap_or_else(|| "codex".to_string());
        Ok(auth)
    }

    async fn refresh(&self, config: &Config, auth: &Auth) -> Result<Auth> {
        let refresh_token = auth
            .refresh_token()
            .ok_or_else(|| AuthError::InvalidInput("no refresh_token stored".into()))?
            .to_string();

        let client = http_client(config.http_timeout());
        let tokens = post_token_form(
            &client,
            &self.token_url,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", &refresh_token),
                ("client_id", CLIENT_ID),
                ("scope", "openid profile email"),
            ],
        )
        .await?;

        let mut updated = auth.clone();
        apply_token_response(&mut updated, &tokens);
        Ok(updated)
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fake_id_token(email: &str, account_id: &str) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256"}"#);
        let payload = URL_SAFE_NO_PAD.encode(
            serde_json::json!({
                "email": email,
                "https://api.openai.com/auth": {"chatgpt_account_id": account_id},
            })
            .to_string(),
        );
        format!("{header}.{payload}.sig")
    }

    #[test]
    fn provider_key_and_lead() {
        let authenticator = CodexAuthenticator::new();
        assert_eq!(authenticator.provider(), "codex");
        assert_eq!(authenticator.refresh_lead(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn id_token_claims_parse() {
        let token = fake_id_token("dev@example.com", "acct-42");
        let parts = split_jwt(&token).unwrap();
        assert_eq!(parts.claims.email(), Some("dev@example.com"));
        assert_eq!(parts.claims.chatgpt_account_id(), Some("acct-42"));
    }

    #[tokio::test]
    async fn refresh_sends_form_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=R1"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"access_token":"A2","refresh_token":"R2","expires_in":600}"#,
                "application/json",
            ))
            .mount(&server)
            .await;

        let authenticator =
            CodexAuthenticator::with_token_url(format!("{}/oauth/token", server.uri()));
        let mut auth = Auth::new("codex", "codex-dev_example_com");
        auth.set_meta(keys::REFRESH_TOKEN, "R1");

        let updated = authenticator
            .refresh(&Config::default(), &auth)
            .await
            .unwrap();
        assert_eq!(updated.access_token(), Some("A2"));
        assert_eq!(updated.refresh_token(), Some("R2"));
        assert!(updated.meta_str(keys::EXPIRED).unwrap().is_some());
    }
}
