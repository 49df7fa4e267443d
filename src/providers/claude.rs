//! Anthropic Claude OAuth authentication flow.
//!
//! OAuth 2.0 Authorization Code + PKCE against the claude.ai
//! authorization page, exchanging on the Anthropic console token
//! endpoint. The token request is JSON (not form-encoded) and echoes
//! the `state` back, which the endpoint requires.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::common::{
    http_client, open_url_in_browser, print_manual_login_instructions, url_encode,
};
use super::traits::{Authenticator, LoginOptions};
use crate::auth::{Auth, keys};
use crate::callback::CallbackServer;
use crate::config::Config;
use crate::error::{AuthError, Result};
use crate::pkce::{PkcePair, generate_state};
use crate::store::record_id;

// ── Constants ───────────────────────────────────────────────────────

/// Claude OAuth authorization URL.
const AUTH_URL: &str = "https://claude.ai/oauth/authorize";
/// Anthropic console token exchange URL.
const TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
/// Public OAuth client id for CLI logins.
const CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
/// Localhost callback port.
const CALLBACK_PORT: u16 = 1455;
/// Localhost callback path.
const CALLBACK_PATH: &str = "/oauth-callback";
/// OAuth scopes requested.
const SCOPE: &str = "org:create_api_key user:profile user:inference";
/// Refresh this long before expiry.
const REFRESH_LEAD: Duration = Duration::from_secs(5 * 60);

/// Token endpoint response; carries the account block used for labels.
#[derive(Debug, Deserialize)]
struct ClaudeTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    account: Option<ClaudeAccount>,
}

#[derive(Debug, Deserialize)]
struct ClaudeAccount {
    #[serde(default)]
    email_address: Option<String>,
}

pub struct ClaudeAuthenticator {
    token_url: String,
}

impl ClaudeAuthenticator {
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

    async fn exchange_code(
        &self,
        client: &reqwest::Client,
        code: &str,
        state: &str,
        verifier: &str,
        redirect_uri: &str,
    ) -> Result<ClaudeTokenResponse> {
        let response = client
            .post(&self.token_url)
            .json(&serde_json::json!({
                "grant_type": "authorization_code",
                "code": code,
                "state": state,
                "client_id": CLIENT_ID,
                "redirect_uri": redirect_uri,
                "code_verifier": verifier,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenExchangeFailed {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl Authenticator for ClaudeAuthenticator {
    fn provider(&self) -> &'static str {
        "claude"
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
            code=true\
            &response_type=code\
            &client_id={CLIENT_ID}\
            &redirect_uri={redirect}\
            &scope={scope}\
            &state={state}\
            &code_challenge={challenge}\
            &code_challenge_method=S256",
            redirect = url_encode(&redirect_uri),
            scope = url_encode(SCOPE),
            challenge = pkce.challenge,
        );

        print_manual_login_instructions("Claude", &auth_url, &redirect_uri);
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

        // State mismatch is fatal and never ignored.
        if callback.state.as_deref() != Some(state.as_str()) {
            return Err(AuthError::StateMismatch);
        }
        let (code, _) = callback.into_code_and_state()?;

        let client = http_client(config.http_timeout());
        let tokens = self
            .exchange_code(&client, &code, &state, &pkce.verifier, &redirect_uri)
            .await?;

        let email = tokens
            .account
            .as_ref()
            .and_then(|account| account.email_address.clone());

        let mut auth = Auth::new("claude", record_id("claude", email.as_deref()));
        auth.set_meta(keys::ACCESS_TOKEN, tokens.access_token);
        if let Some(refresh_token) = tokens.refresh_token {
            auth.set_meta(keys::REFRESH_TOKEN, refresh_token);
        }
        if let Some(expires_in) = tokens.expires_in {
            auth.set_meta(keys::EXPIRES_IN, expires_in);
            auth.set_meta(keys::EXPIRED, super::common::expiry_rfc3339_in(expires_in));
        }
        if let Some(email) = &email {
            auth.set_meta(keys::EMAIL, email.clone());
            auth.attributes.insert(keys::EMAIL.into(), email.clone());
        }
        auth.attributes.insert("source".into(), "oauth".into());
        auth.label = email.unwrap_or_else(|| "claude".to_string());
        Ok(auth)
    }

    async fn refresh(&self, config: &Config, auth: &Auth) -> Result<Auth> {
        let refresh_token = auth
            .refresh_token()
            .ok_or_else(|| AuthError::InvalidInput("no refresh_token stored".into()))?
            .to_string();

        let client = http_client(config.http_timeout());
        let response = client
            .post(&self.token_url)
            .json(&serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
                "client_id": CLIENT_ID,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenExchangeFailed {
                status: status.as_u16(),
                body,
            });
        }
        let tokens: super::common::TokenResponse = response.json().await?;

        let mut updated = auth.clone();
        super::common::apply_token_response(&mut updated, &tokens);
        Ok(updated)
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn provider_key_and_lead() {
        let authenticator = ClaudeAuthenticator::new();
        assert_eq!(authenticator.provider(), "claude");
        assert_eq!(authenticator.refresh_lead(), Some(Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn refresh_posts_json_grant_and_keeps_old_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/oauth/token"))
            .and(body_partial_json(serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": "R1",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"access_token":"A2","expires_in":3600}"#,
                "application/json",
            ))
            .mount(&server)
            .await;

        let authenticator =
            ClaudeAuthenticator::with_token_url(format!("{}/v1/oauth/token", server.uri()));
        let mut auth = Auth::new("claude", "claude-dev_example_com");
        auth.set_meta(keys::ACCESS_TOKEN, "A1");
        auth.set_meta(keys::REFRESH_TOKEN, "R1");

        let updated = authenticator
            .refresh(&Config::default(), &auth)
            .await
            .unwrap();
        assert_eq!(updated.access_token(), Some("A2"));
        // Response omitted refresh_token: the old one is retained.
        assert_eq!(updated.refresh_token(), Some("R1"));
    }

    #[tokio::test]
    async fn refresh_without_stored_token_fails() {
        let authenticator = ClaudeAuthenticator::new();
        let auth = Auth::new("claude", "claude-x");
        assert!(
            authenticator
                .refresh(&Config::default(), &auth)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn refresh_surfaces_endpoint_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/oauth/token"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad refresh token"))
            .mount(&server)
            .await;

        let authenticator =
            ClaudeAuthenticator::with_token_url(format!("{}/v1/oauth/token", server.uri()));
        let mut auth = Auth::new("claude", "claude-x");
        auth.set_meta(keys::REFRESH_TOKEN, "stale");

        let err = authenticator
            .refresh(&Config::default(), &auth)
            .await
            .expect_err("401 must fail");
        assert!(matches!(
            err,
            AuthError::TokenExchangeFailed { status: 401, .. }
        ));
    }
}
