//! Google Antigravity (Cloud Code Assist) authentication flow.
//!
//! Authorization Code + PKCE against a Google account, followed by a
//! `loadCodeAssist` call that discovers the Cloud Code project and tier
//! for the account. There is no refresh path for these records; the
//! proxy re-runs the login when the token goes stale.

use async_trait::async_trait;
use serde_json::Value;
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
use crate::import::antigravity::load_antigravity_credentials;
use crate::import::peer_creds::IMPORT_EXPIRY_LEEWAY;
use crate::pkce::{PkcePair, generate_state};
use crate::store::record_id;

// ── Constants ───────────────────────────────────────────────────────

/// Localhost callback port for Antigravity OAuth.
const CALLBACK_PORT: u16 = 51121;
/// Localhost callback path.
const CALLBACK_PATH: &str = "/oauth-callback";

/// OAuth scopes for Cloud Code Assist access.
const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/cloud-platform",
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/userinfo.profile",
    "https://www.googleapis.com/auth/cclog",
    "https://www.googleapis.com/auth/experimentsandconfigs",
];

/// Cloud Code Assist API endpoint.
const CLOUDCODE_PA_ENDPOINT: &str = "https://cloudcode-pa.googleapis.com";
/// Project/tier discovery path.
const LOAD_CODE_ASSIST_PATH: &str = "/v1internal:loadCodeAssist";

/// Headers the Cloud Code endpoint expects from IDE-family clients.
const USER_AGENT: &str = "google-api-nodejs-client/9.15.1";
const API_CLIENT: &str = "google-cloud-sdk vscode_cloudshelleditor/0.1";
const CLIENT_METADATA: &str =
    r#"{"ideType":"IDE_UNSPECIFIED","platform":"PLATFORM_UNSPECIFIED","pluginType":"GEMINI"}"#;

/// Project and tier discovered for an account.
#[derive(Debug, Clone, Default)]
struct CodeAssistInfo {
    project_id: Option<String>,
    tier_id: Option<String>,
}

pub struct AntigravityAuthenticator {
    token_url: String,
    cloudcode_endpoint: String,
}

impl AntigravityAuthenticator {
    pub fn new() -> Self {
        Self {
            token_url: GOOGLE_TOKEN_URL.to_string(),
            cloudcode_endpoint: CLOUDCODE_PA_ENDPOINT.to_string(),
        }
    }

    /// Point the endpoints somewhere else (tests, relays).
    pub fn with_endpoints(
        token_url: impl Into<String>,
        cloudcode_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            token_url: token_url.into(),
            cloudcode_endpoint: cloudcode_endpoint.into(),
        }
    }

    /// Discover the Cloud Code project and tier for an access token.
    /// Enrichment only; failures degrade to an empty result.
    async fn load_code_assist(&self, client: &reqwest::Client, access_token: &str) -> CodeAssistInfo {
        let url = format!("{}{LOAD_CODE_ASSIST_PATH}", self.cloudcode_endpoint);
        let response = client
            .post(&url)
            .bearer_auth(access_token)
            .header("User-Agent", USER_AGENT)
            .header("X-Goog-Api-Client", API_CLIENT)
            .header("Client-Metadata", CLIENT_METADATA)
            .json(&serde_json::json!({
                "metadata": {
                    "ideType": "IDE_UNSPECIFIED",
                    "platform": "PLATFORM_UNSPECIFIED",
                    "pluginType": "GEMINI",
                },
            }))
            .send()
            .await;

        let body: Value = match response {
            Ok(response) if response.status().is_success() => {
                match response.json().await {
                    Ok(body) => body,
                    Err(err) => {
                        tracing::debug!("loadCodeAssist body unreadable: {err}");
                        return CodeAssistInfo::default();
                    }
                }
            }
            Ok(response) => {
                tracing::debug!("loadCodeAssist failed: {}", response.status());
                return CodeAssistInfo::default();
            }
            Err(err) => {
                tracing::debug!("loadCodeAssist request failed: {err}");
                return CodeAssistInfo::default();
            }
        };

        parse_code_assist(&body)
    }
}

/// The project field is either a bare string or an object with an id;
/// the tier comes from `currentTier` or the default entry of
/// `allowedTiers`.
fn parse_code_assist(body: &Value) -> CodeAssistInfo {
    let project_id = match body.get("cloudaicompanionProject") {
        Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
        Some(Value::Object(obj)) => obj
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    };

    let tier_id = body
        .get("currentTier")
        .and_then(|tier| tier.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            body.get("allowedTiers")?
                .as_array()?
                .iter()
                .find(|tier| {
                    tier.get("isDefault")
                        .and_then(Value::as_bool)
                        .unwrap_or(false)
                })?
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
        });

    CodeAssistInfo {
        project_id,
        tier_id,
    }
}

#[async_trait]
impl Authenticator for AntigravityAuthenticator {
    fn provider(&self) -> &'static str {
        "antigravity"
    }

    /// No refresh path: records go stale and are re-acquired.
    fn refresh_lead(&self) -> Option<Duration> {
        None
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
            &prompt=consent",
            client_id = url_encode(&client_id),
            redirect = url_encode(&redirect_uri),
            scope = url_encode(&scopes),
            challenge = pkce.challenge,
        );

        print_manual_login_instructions("Google Antigravity", &auth_url, &redirect_uri);
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

        let mut auth = Auth::new("antigravity", "antigravity");
        apply_token_response(&mut auth, &tokens);

        let mut email = None;
        if let Some(access_token) = auth.access_token().map(str::to_string) {
            email = fetch_google_email(&client, &access_token).await;
            let assist = self.load_code_assist(&client, &access_token).await;
            if let Some(project_id) = assist.project_id {
                auth.set_meta(keys::PROJECT_ID, project_id);
            }
            if let Some(tier_id) = assist.tier_id {
                auth.set_meta(keys::TIER_ID, tier_id);
            }
        }
        if let Some(project_id) = opts.hint(keys::PROJECT_ID) {
            // An explicit hint outranks discovery.
            auth.set_meta(keys::PROJECT_ID, project_id.to_string());
        }

        auth.id = record_id("antigravity", email.as_deref());
        if let Some(email) = &email {
            auth.set_meta(keys::EMAIL, email.clone());
            auth.attributes.insert(keys::EMAIL.into(), email.clone());
        }
        auth.attributes.insert("source".into(), "oauth".into());
        auth.label = email.unwrap_or_else(|| "antigravity".to_string());
        Ok(auth)
    }

    async fn import(&self, _config: &Config) -> Result<Option<Auth>> {
        let Some((creds, path, source)) = load_antigravity_credentials()? else {
            return Ok(None);
        };
        if creds.is_expired(IMPORT_EXPIRY_LEEWAY) {
            tracing::warn!("imported Antigravity token is already expired; refresh will run on first use");
        }
        let auth = auth_from_peer_creds("antigravity", &creds, &path, source.as_str())?;
        Ok(Some(auth))
    }
}

// ── Tests ───────────────────────────────────────────────────────────
