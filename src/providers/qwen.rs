//! Qwen device-grant authentication flow.
//!
//! RFC 8628 device authorization against the Qwen public client, with a
//! PKCE verifier bound to the device code. The token response may name
//! the account's API host in `resource_url`; it is recorded as the
//! preferred endpoint for the proxy to use.

use async_trait::async_trait;
use std::time::Duration;

use super::common::{
    DeviceAuthorization, adjust_poll_interval, apply_token_response, http_client,
    open_url_in_browser, post_token_form,
};
use super::traits::{Authenticator, LoginOptions};
use crate::auth::{Auth, keys, unix_millis_now};
use crate::config::Config;
use crate::error::{AuthError, Result};
use crate::pkce::PkcePair;
use crate::store::record_id;

// ── Constants ───────────────────────────────────────────────────────

/// Device authorization endpoint.
const DEVICE_CODE_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/device/code";
/// Token endpoint (device grant + refresh).
const TOKEN_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/token";
/// Qwen public client id.
const CLIENT_ID: &str = "f0304373b74a44d2b584a3fb70ca9e56";
/// OAuth scopes requested.
const SCOPE: &str = "openid profile email model.completion";
/// RFC 8628 grant type string.
const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";
/// Refresh this long before expiry.
const REFRESH_LEAD: Duration = Duration::from_secs(5 * 60);

pub struct QwenAuthenticator {
    device_code_url: String,
    token_url: String,
}

impl QwenAuthenticator {
    pub fn new() -> Self {
        Self {
            device_code_url: DEVICE_CODE_URL.to_string(),
            token_url: TOKEN_URL.to_string(),
        }
    }

    /// Point the endpoints somewhere else (tests, relays).
    pub fn with_endpoints(
        device_code_url: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Self {
        Self {
            device_code_url: device_code_url.into(),
            token_url: token_url.into(),
        }
    }

    async fn start_device_authorization(
        &self,
        client: &reqwest::Client,
        challenge: &str,
    ) -> Result<DeviceAuthorization> {
        let response = client
            .post(&self.device_code_url)
            .header("Accept", "application/json")
            .form(&[
                ("client_id", CLIENT_ID),
                ("scope", SCOPE),
                ("code_challenge", challenge),
                ("code_challenge_method", "S256"),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(AuthError::TokenExchangeFailed {
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(|_| AuthError::TokenExchangeFailed {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Authenticator for QwenAuthenticator {
    fn provider(&self) -> &'static str {
        "qwen"
    }

    fn refresh_lead(&self) -> Option<Duration> {
        Some(REFRESH_LEAD)
    }

    async fn login(&self, config: &Config, opts: &LoginOptions) -> Result<Auth> {
        let pkce = PkcePair::generate();
        let client = http_client(config.http_timeout());

        let device = self
            .start_device_authorization(&client, &pkce.challenge)
            .await?;
        device.print_instructions("Qwen");
        if !opts.no_browser {
            if let Some(url) = &device.verification_uri_complete {
                open_url_in_browser(url);
            }
        }

        let mut interval = device.poll_interval();
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(device.expires_in.max(0) as u64);

        let tokens = loop {
            tokio::time::sleep(interval).await;
            if tokio::time::Instant::now() >= deadline {
                return Err(AuthError::Timeout);
            }
            let attempt = post_token_form(
                &client,
                &self.token_url,
                &[
                    ("grant_type", DEVICE_GRANT_TYPE),
                    ("client_id", CLIENT_ID),
                    ("device_code", &device.device_code),
                    ("code_verifier", &pkce.verifier),
                ],
            )
            .await;
            match attempt {
                Ok(tokens) => break tokens,
                Err(err) => {
                    if !adjust_poll_interval(&err, &mut interval) {
                        return Err(err);
                    }
                }
            }
        };

        let label = opts
            .hint("label")
            .map(str::to_string)
            .unwrap_or_else(|| format!("qwen-{}", unix_millis_now()));

        let mut auth = Auth::new("qwen", record_id("qwen", None));
        apply_token_response(&mut auth, &tokens);
        auth.set_meta(keys::TIMESTAMP, unix_millis_now());
        auth.attributes.insert("source".into(), "device-grant".into());
        auth.label = label;
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
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn provider_key_and_lead() {
        let authenticator = QwenAuthenticator::new();
        assert_eq!(authenticator.provider(), "qwen");
        assert_eq!(authenticator.refresh_lead(), Some(Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn device_flow_records_preferred_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/device/code"))
            .and(body_string_contains("code_challenge_method=S256"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"device_code":"dc-1","user_code":"QWEN-1","verification_uri":"https://chat.qwen.ai/activate","verification_uri_complete":"https://chat.qwen.ai/activate?code=QWEN-1","expires_in":600,"interval":0}"#,
                "application/json",
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_raw(
                r#"{"error":"authorization_pending"}"#,
                "application/json",
            ))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("code_verifier="))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"access_token":"at-1","refresh_token":"rt-1","expires_in":21600,"resource_url":"portal.qwen.ai"}"#,
                "application/json",
            ))
            .mount(&server)
            .await;

        let authenticator = QwenAuthenticator::with_endpoints(
            format!("{}/device/code", server.uri()),
            format!("{}/token", server.uri()),
        );
        let opts = LoginOptions {
            no_browser: true,
            ..Default::default()
        };
        let auth = authenticator
            .login(&Config::default(), &opts)
            .await
            .unwrap();

        assert_eq!(auth.id, "qwen");
        assert_eq!(auth.access_token(), Some("at-1"));
        assert_eq!(
            auth.meta_str(keys::PREFERRED_ENDPOINT).unwrap(),
            Some("portal.qwen.ai")
        );
        assert!(auth.meta_i64(keys::TIMESTAMP).unwrap().is_some());
    }

    #[tokio::test]
    async fn refresh_sends_public_client_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"access_token":"at-2","expires_in":21600}"#,
                "application/json",
            ))
            .mount(&server)
            .await;

        let authenticator = QwenAuthenticator::with_endpoints(
            "http://unused.invalid",
            format!("{}/token", server.uri()),
        );
        let mut auth = Auth::new("qwen", "qwen");
        auth.set_meta(keys::REFRESH_TOKEN, "rt-1");

        let updated = authenticator
            .refresh(&Config::default(), &auth)
            .await
            .unwrap();
        assert_eq!(updated.access_token(), Some("at-2"));
        assert_eq!(updated.refresh_token(), Some("rt-1"));
    }
}
