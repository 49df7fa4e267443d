//! Google Gemini (legacy Google OAuth) authentication flow.
//!
//! Authorization Code + PKCE against a Google account, producing
//! credentials compatible with the Gemini CLI format. An existing
//! `~/.gemini/oauth_creds.json` can also be imported wholesale instead
//! of running the browser flow.

use async_trait::async_trait;
use std::time::Duration;

use super::common::{
    GOOGLE_AUTH_URL, GOOGLE_TOKEN_URL, apply_token_response, auth_from_peer_creds,
    fetch_google_email, google_client_id, google_client_secret, http_client, open_url_in_browser,
    post_token_form, print_manual_login_instructions, url_encode,
};
use super::traits::{Authenticator, LoginOptions};
use crate::auth::{Auth, keys};
use crate::callback::CallbackServer;
use crate::config::Config;
use crate::error::{AuthError, Result};
use crate::import::gemini::load_gemini_cli_credentials;
use crate::import::peer_creds::IMPORT_EXPIRY_LEEWAY;
use crate::pkce::{PkcePair, generate_state};
use crate::store::record_id;

// ── Constants ───────────────────────────────────────────────────────

/// Localhost callback port.
const CALLBACK_PORT: u16 = 8085;
/// Localhost callback path (Google's conventional one).
const CALLBACK_PATH: &str = "/oauth2callback";
/// OAuth scopes for Gemini access.
const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/cloud-platform",
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/userinfo.profile",
];
/// Refresh this long before expiry.
const REFRESH_LEAD: Duration = Duration::from_secs(5 * 60);

pub struct GeminiAuthenticator {
    token_url: String,
}

impl GeminiAuthenticator {
    pub fn new() -> Self {
        Self {
            token_url: GOOGLE_TOKEN_URL.to_string(),
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
impl Authenticator for GeminiAuthenticator {
    fn provider(&self) -> &'static str {
        "gemini"
    }

    fn refresh_lead(&self) -> Option<Duration> {
        Some(REFRESH_LEAD)
    }

    async fn login(&self, config: &Config, opts: &LoginOptions) -> Result<Auth> {
        let pkce = PkcePair::generate();
        let state = generate_state();
        let client_id = google_client_id();
        let client_secret = google_client_secret();
        let scopes = SCOPES.join(" ");

        let mut server = CallbackServer::bind(CALLBACK_PORT, CALLBACK_PATH).await?;
        let redirect_uri = server.redirect_uri();

        let auth_url = format!(
            "{GOOGLE_AUTH_URL}?\
            response_type=code\
            &client_id={client_id}\
            &redirect_uri={redirect}\
            &scope={scope}\
            &state={state}\
            &code_challenge={challenge}\
            &code_challenge_method=S256\
            &access_type=offline\
            &prompt=select_account",
            client_id = url_encode(&client_id),
            redirect = url_encode(&redirect_uri),
            scope = url_encode(&scopes),
            challenge = pkce.challenge,
        );

        print_manual_login_instructions("Google Gemini", &auth_url, &redirect_uri);
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
                ("client_id", &client_id),
                ("client_secret", &client_secret),
                ("code", &code),
                ("redirect_uri", &redirect_uri),
                ("code_verifier", &pkce.verifier),
            ],
        )
        .await?;

        let mut auth = Auth::new("gemini", "gemini");
        apply_token_response(&mut auth, &tokens);

        let email = match auth.access_token() {
            Some(access_token) => fetch_google_email(&client, access_token).await,
            None => None,
        };
        auth.id = record_id("gemini", email.as_deref());
        if let Some(email) = &email {
            auth.set_meta(keys::EMAIL, email.clone());
            auth.attributes.insert(keys::EMAIL.into(), email.clone());
        }
        if let Some(project_id) = opts.hint(keys::PROJECT_ID) {
            auth.set_meta(keys::PROJECT_ID, project_id.to_string());
        }
        auth.attributes.insert("source".into(), "oauth".into());
        auth.label = email.unwrap_or_else(|| "gemini".to_string());
        Ok(auth)
    }

    async fn refresh(&self, config: &Config, auth: &Auth) -> Result<Auth> {
        let refresh_token = auth
            .refresh_token()
            .ok_or_else(|| AuthError::InvalidInput("no refresh_token stored".into()))?
            .to_string();
        let client_id = google_client_id();
        let client_secret = google_client_secret();

        let client = http_client(config.http_timeout());
        let tokens = post_token_form(
            &client,
            &self.token_url,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", &refresh_token),
                ("client_id", &client_id),
                ("client_secret", &client_secret),
            ],
        )
        .await?;

        let mut updated = auth.clone();
        apply_token_response(&mut updated, &tokens);
        Ok(updated)
    }

    async fn import(&self, _config: &Config) -> Result<Option<Auth>> {
        let Some((creds, path)) = load_gemini_cli_credentials()? else {
            return Ok(None);
        };
        if creds.is_expired(IMPORT_EXPIRY_LEEWAY) {
            tracing::warn!("imported Gemini CLI token is already expired; refresh will run on first use");
        }
        let auth = auth_from_peer_creds("gemini", &creds, &path, "gemini-cli")?;
        Ok(Some(auth))
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::PeerOAuthCreds;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn provider_key_and_lead() {
        let authenticator = GeminiAuthenticator::new();
        assert_eq!(authenticator.provider(), "gemini");
        assert_eq!(authenticator.refresh_lead(), Some(Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn refresh_sends_confidential_client_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("client_secret="))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"access_token":"A2","expires_in":3599}"#,
                "application/json",
            ))
            .mount(&server)
            .await;

        let authenticator = GeminiAuthenticator::with_token_url(format!("{}/token", server.uri()));
        let mut auth = Auth::new("gemini", "gemini-dev_example_com");
        auth.set_meta(keys::REFRESH_TOKEN, "R1");

        let updated = authenticator
            .refresh(&Config::default(), &auth)
            .await
            .unwrap();
        assert_eq!(updated.access_token(), Some("A2"));
        assert_eq!(updated.refresh_token(), Some("R1"));
    }

    #[test]
    fn peer_creds_adopt_into_auth() {
        let creds = PeerOAuthCreds::parse(
            r#"{"token":{"access_token":"A","refresh_token":"R","expiry":"2099-01-01T00:00:00Z"},"email":"dev@example.com","project_id":"proj-1"}"#,
        )
        .unwrap();
        let auth = auth_from_peer_creds(
            "gemini",
            &creds,
            std::path::Path::new("/home/dev/.gemini/oauth_creds.json"),
            "gemini-cli",
        )
        .unwrap();
        assert_eq!(auth.id, "gemini-dev_example_com");
        assert_eq!(auth.access_token(), Some("A"));
        assert_eq!(auth.meta_str(keys::PROJECT_ID).unwrap(), Some("proj-1"));
        assert_eq!(auth.attributes.get("source").map(String::as_str), Some("gemini-cli"));
        assert_eq!(auth.label, "dev@example.com");
    }

    #[test]
    fn peer_creds_without_access_token_are_rejected() {
        let creds = PeerOAuthCreds::parse(r#"{"refresh_token":"R"}"#).unwrap();
        assert!(
            auth_from_peer_creds(
                "gemini",
                &creds,
                std::path::Path::new("/x/oauth_creds.json"),
                "gemini-cli",
            )
            .is_err()
        );
    }
}
