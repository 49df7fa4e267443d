//! Kiro authentication flows.
//!
//! Kiro accounts come in two shapes: anonymous AWS Builder ID logins
//! (RFC 8628 device grant against AWS SSO OIDC) and Google-account
//! logins (Authorization Code + PKCE with a public client). The stored
//! `auth_method` field decides which refresh sub-protocol applies; the
//! Builder ID path keeps its OIDC client registration and region so the
//! refresh can hit the right regional endpoint. Existing Amazon Q CLI
//! logins can be imported from its SQLite store instead.

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

use super::common::{
    DeviceAuthorization, GOOGLE_AUTH_URL, GOOGLE_TOKEN_URL, TokenResponse, adjust_poll_interval,
    apply_token_response, fetch_google_email, google_client_id, http_client, open_url_in_browser,
    post_token_form, print_manual_login_instructions, url_encode,
};
use super::traits::{Authenticator, LoginOptions};
use crate::auth::{Auth, keys};
use crate::callback::CallbackServer;
use crate::config::Config;
use crate::error::{AuthError, Result};
use crate::import::amazonq::{
    AmazonQCredentials, CommandRunner, SystemCommandRunner, read_amazon_q_credentials,
};
use crate::pkce::{PkcePair, generate_state};
use crate::store::record_id;

// ── Constants ───────────────────────────────────────────────────────

/// Default AWS SSO OIDC region.
const DEFAULT_REGION: &str = "us-east-1";
/// Default Builder ID start URL.
const DEFAULT_START_URL: &str = "https://view.awsapps.com/start";
/// RFC 8628 grant type string.
const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";
/// Client name presented at OIDC registration.
const CLIENT_NAME: &str = "authbroker";

/// Canonical auth-method marker for Builder ID records.
pub const AUTH_METHOD_BUILDER_ID: &str = "builder_id";
/// Auth-method marker for Google-account records.
pub const AUTH_METHOD_GOOGLE: &str = "google";

/// Localhost callback port for the Google variant.
const CALLBACK_PORT: u16 = 8086;
/// Localhost callback path for the Google variant.
const CALLBACK_PATH: &str = "/oauth2callback";
/// Scopes for the Google variant.
const GOOGLE_SCOPES: &str = "openid email profile";

/// Kiro tokens live long; refresh a day ahead.
const REFRESH_LEAD: Duration = Duration::from_secs(24 * 60 * 60);

// ── Wire shapes (AWS SSO OIDC is camelCase) ─────────────────────────

#[derive(Debug, Deserialize)]
struct RegisterClientResponse {
    #[serde(alias = "clientId")]
    client_id: String,
    #[serde(alias = "clientSecret")]
    client_secret: String,
}

#[derive(Debug, Deserialize)]
struct SsoTokenResponse {
    #[serde(alias = "accessToken")]
    access_token: String,
    #[serde(default, alias = "refreshToken")]
    refresh_token: Option<String>,
    #[serde(default, alias = "expiresIn")]
    expires_in: Option<i64>,
}

impl SsoTokenResponse {
    fn into_common(self) -> TokenResponse {
        TokenResponse {
            access_token: Some(self.access_token),
            refresh_token: self.refresh_token,
            id_token: None,
            expires_in: self.expires_in,
            resource_url: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SsoErrorBody {
    #[serde(default)]
    error: Option<String>,
}

pub struct KiroAuthenticator {
    sso_base_override: Option<String>,
    google_token_url: String,
    runner: Arc<dyn CommandRunner>,
}

impl KiroAuthenticator {
    pub fn new() -> Self {
        Self {
            sso_base_override: None,
            google_token_url: GOOGLE_TOKEN_URL.to_string(),
            runner: Arc::new(SystemCommandRunner),
        }
    }

    /// Pin the SSO OIDC base and Google token URL (tests, relays).
    pub fn with_endpoints(
        sso_base: impl Into<String>,
        google_token_url: impl Into<String>,
    ) -> Self {
        Self {
            sso_base_override: Some(sso_base.into()),
            google_token_url: google_token_url.into(),
            runner: Arc::new(SystemCommandRunner),
        }
    }

    /// Swap the command runner used for the Amazon Q WSL bridge.
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Region-aware SSO OIDC endpoint base.
    fn sso_base(&self, region: &str) -> String {
        self.sso_base_override
            .clone()
            .unwrap_or_else(|| format!("https://oidc.{region}.amazonaws.com"))
    }

    // ── Builder ID (device grant) ───────────────────────────────────

    async fn login_builder_id(&self, config: &Config, opts: &LoginOptions) -> Result<Auth> {
        let region = opts
            .hint(keys::REGION)
            .unwrap_or(DEFAULT_REGION)
            .to_string();
        let start_url = opts
            .hint(keys::START_URL)
            .unwrap_or(DEFAULT_START_URL)
            .to_string();
        let base = self.sso_base(&region);
        let client = http_client(config.http_timeout());

        let registration: RegisterClientResponse = post_sso_json(
            &client,
            &format!("{base}/client/register"),
            &serde_json::json!({
                "clientName": CLIENT_NAME,
                "clientType": "public",
                "scopes": ["sso:account:access"],
            }),
        )
        .await?;

        let device: DeviceAuthorization = post_sso_json(
            &client,
            &format!("{base}/device_authorization"),
            &serde_json::json!({
                "clientId": registration.client_id,
                "clientSecret": registration.client_secret,
                "startUrl": start_url,
            }),
        )
        .await?;

        device.print_instructions("Kiro (AWS Builder ID)");
        if !opts.no_browser {
            if let Some(url) = &device.verification_uri_complete {
                open_url_in_browser(url);
            }
        }

        let tokens = self
            .poll_device_token(&client, &base, &registration, &device)
            .await?;

        let mut auth = Auth::new("kiro", record_id("kiro", Some("builder-id")));
        apply_token_response(&mut auth, &tokens.into_common());
        auth.set_meta(keys::AUTH_METHOD, AUTH_METHOD_BUILDER_ID);
        auth.set_meta(keys::CLIENT_ID, registration.client_id);
        auth.set_meta(keys::CLIENT_SECRET, registration.client_secret);
        auth.set_meta(keys::REGION, region);
        auth.set_meta(keys::START_URL, start_url);
        auth.attributes.insert("source".into(), "device-grant".into());
        auth.label = "builder-id".to_string();
        Ok(auth)
    }

    /// Strictly sequential poll loop: at most one request in flight,
    /// `slow_down` grows the interval for the remainder of the flow.
    async fn poll_device_token(
        &self,
        client: &reqwest::Client,
        base: &str,
        registration: &RegisterClientResponse,
        device: &DeviceAuthorization,
    ) -> Result<SsoTokenResponse> {
        let mut interval = device.poll_interval();
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(device.expires_in.max(0) as u64);

        loop {
            tokio::time::sleep(interval).await;
            if tokio::time::Instant::now() >= deadline {
                return Err(AuthError::Timeout);
            }
            let attempt: Result<SsoTokenResponse> = post_sso_json(
                client,
                &format!("{base}/token"),
                &serde_json::json!({
                    "clientId": registration.client_id,
                    "clientSecret": registration.client_secret,
                    "deviceCode": device.device_code,
                    "grantType": DEVICE_GRANT_TYPE,
                }),
            )
            .await;
            match attempt {
                Ok(tokens) => return Ok(tokens),
                Err(err) => {
                    if !adjust_poll_interval(&err, &mut interval) {
                        return Err(err);
                    }
                }
            }
        }
    }

    // ── Google variant (auth code + PKCE, public client) ────────────

    async fn login_google(&self, config: &Config, opts: &LoginOptions) -> Result<Auth> {
        let pkce = PkcePair::generate();
        let state = generate_state();
        let client_id = google_client_id();

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
            scope = url_encode(GOOGLE_SCOPES),
            challenge = pkce.challenge,
        );

        print_manual_login_instructions("Kiro (Google)", &auth_url, &redirect_uri);
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
        // Public client: no client_secret on the exchange.
        let tokens = post_token_form(
            &client,
            &self.google_token_url,
            &[
                ("grant_type", "authorization_code"),
                ("client_id", &client_id),
                ("code", &code),
                ("redirect_uri", &redirect_uri),
                ("code_verifier", &pkce.verifier),
            ],
        )
        .await?;

        let mut auth = Auth::new("kiro", "kiro");
        apply_token_response(&mut auth, &tokens);
        auth.set_meta(keys::AUTH_METHOD, AUTH_METHOD_GOOGLE);

        let mut email = match auth.access_token() {
            Some(access_token) => fetch_google_email(&client, access_token).await,
            None => None,
        };
        if email.is_none() {
            if let Ok(answer) = opts.ask("Account email (for labeling)") {
                if !answer.is_empty() {
                    email = Some(answer);
                }
            }
        }
        let email = email.ok_or(AuthError::EmailRequired)?;

        auth.id = record_id("kiro", Some(&email));
        auth.set_meta(keys::EMAIL, email.clone());
        auth.attributes.insert(keys::EMAIL.into(), email.clone());
        auth.attributes.insert("source".into(), "oauth".into());
        auth.label = email;
        Ok(auth)
    }
}

/// POST a JSON body to an SSO OIDC endpoint, mapping RFC 8628 error
/// codes to their typed forms.
async fn post_sso_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    body: &serde_json::Value,
) -> Result<T> {
    let response = client
        .post(url)
        .header("Accept", "application/json")
        .json(body)
        .send()
        .await?;

    let status = response.status();
    let raw = response.text().await.unwrap_or_default();
    if !status.is_success() {
        if let Ok(parsed) = serde_json::from_str::<SsoErrorBody>(&raw) {
            match parsed.error.as_deref() {
                Some("authorization_pending") => return Err(AuthError::AuthorizationPending),
                Some("slow_down") => return Err(AuthError::SlowDown),
                Some("expired_token") => return Err(AuthError::ExpiredToken),
                _ => {}
            }
        }
        return Err(AuthError::TokenExchangeFailed {
            status: status.as_u16(),
            body: raw,
        });
    }
    serde_json::from_str(&raw).map_err(|_| AuthError::TokenExchangeFailed {
        status: status.as_u16(),
        body: raw,
    })
}

/// Adapt an Amazon Q CLI login into a kiro Builder-ID record.
fn auth_from_amazon_q(creds: &AmazonQCredentials) -> Auth {
    let mut auth = Auth::new("kiro", record_id("kiro", Some("builder-id")));
    auth.set_meta(keys::ACCESS_TOKEN, creds.token.access_token.clone());
    if let Some(refresh_token) = &creds.token.refresh_token {
        auth.set_meta(keys::REFRESH_TOKEN, refresh_token.clone());
    }
    if let Some(expires_at) = &creds.token.expires_at {
        auth.set_meta(keys::EXPIRED, expires_at.clone());
    }
    auth.set_meta(keys::AUTH_METHOD, AUTH_METHOD_BUILDER_ID);

    let mut region = creds.token.region.clone();
    if let Some(registration) = &creds.registration {
        auth.set_meta(keys::CLIENT_ID, registration.client_id.clone());
        if let Some(client_secret) = &registration.client_secret {
            auth.set_meta(keys::CLIENT_SECRET, client_secret.clone());
        }
        region = region.or_else(|| registration.region.clone());
    }
    auth.set_meta(
        keys::REGION,
        region.unwrap_or_else(|| DEFAULT_REGION.to_string()),
    );
    if let Some(start_url) = &creds.token.start_url {
        auth.set_meta(keys::START_URL, start_url.clone());
    }

    auth.attributes.insert("source".into(), "amazon-q".into());
    auth.attributes
        .insert("path".into(), creds.source_path.clone());
    auth.label = "amazon-q".to_string();
    auth
}

#[async_trait]
impl Authenticator for KiroAuthenticator {
    fn provider(&self) -> &'static str {
        "kiro"
    }

    fn refresh_lead(&self) -> Option<Duration> {
        Some(REFRESH_LEAD)
    }

    async fn login(&self, config: &Config, opts: &LoginOptions) -> Result<Auth> {
        match opts.hint(keys::AUTH_METHOD) {
            None | Some(AUTH_METHOD_BUILDER_ID) | Some("builder-id") => {
                self.login_builder_id(config, opts).await
            }
            Some(AUTH_METHOD_GOOGLE) => self.login_google(config, opts).await,
            Some(other) => Err(AuthError::InvalidInput(format!(
                "unknown kiro auth method `{other}`"
            ))),
        }
    }

    async fn refresh(&self, config: &Config, auth: &Auth) -> Result<Auth> {
        let refresh_token = auth
            .refresh_token()
            .ok_or_else(|| AuthError::InvalidInput("no refresh_token stored".into()))?
            .to_string();
        let client = http_client(config.http_timeout());

        // `builder-id` is a read-only legacy alias for `builder_id`.
        let method = auth.meta_str(keys::AUTH_METHOD)?.unwrap_or("");
        match method {
            AUTH_METHOD_BUILDER_ID | "builder-id" => {
                let region = auth
                    .meta_str(keys::REGION)?
                    .unwrap_or(DEFAULT_REGION)
                    .to_string();
                let client_id = auth.meta_str(keys::CLIENT_ID)?.ok_or_else(|| {
                    AuthError::InvalidInput("builder_id record has no client_id".into())
                })?;
                let client_secret = auth.meta_str(keys::CLIENT_SECRET)?.unwrap_or("");
                let base = self.sso_base(&region);

                let tokens: SsoTokenResponse = post_sso_json(
                    &client,
                    &format!("{base}/token"),
                    &serde_json::json!({
                        "clientId": client_id,
                        "clientSecret": client_secret,
                        "grantType": "refresh_token",
                        "refreshToken": refresh_token,
                    }),
                )
                .await?;

                let mut updated = auth.clone();
                apply_token_response(&mut updated, &tokens.into_common());
                updated.set_meta(keys::AUTH_METHOD, AUTH_METHOD_BUILDER_ID);
                Ok(updated)
            }
            AUTH_METHOD_GOOGLE => {
                let client_id = google_client_id();
                // Public client: client_id only, no secret.
                let tokens = post_token_form(
                    &client,
                    &self.google_token_url,
                    &[
                        ("grant_type", "refresh_token"),
                        ("refresh_token", &refresh_token),
                        ("client_id", &client_id),
                    ],
                )
                .await?;

                let mut updated = auth.clone();
                apply_token_response(&mut updated, &tokens);
                Ok(updated)
            }
            other => Err(AuthError::InvalidInput(format!(
                "kiro record has unknown auth method `{other}`"
            ))),
        }
    }

    async fn import(&self, _config: &Config) -> Result<Option<Auth>> {
        let Some(creds) = read_amazon_q_credentials(self.runner.as_ref())? else {
            return Ok(None);
        };
        if creds.token.is_expired() {
            tracing::warn!("imported Amazon Q token is already expired; refresh will run on first use");
        }
        Ok(Some(auth_from_amazon_q(&creds)))
    }
}

// ── Tests ───────────────────────────────────────────────────────────
