//! Typed error taxonomy for the credential broker.
//!
//! Library code returns [`AuthError`]; the CLI layer wraps these in
//! `anyhow` for human-readable one-line reporting. RFC 8628 polling
//! states (`AuthorizationPending`, `SlowDown`) exist so the device-grant
//! loop can branch on them; they are handled locally and never surface
//! to callers.

use std::path::PathBuf;

/// Convenience alias used throughout the broker core.
pub type Result<T> = std::result::Result<T, AuthError>;

/// Everything that can go wrong while acquiring, storing, or refreshing
/// a credential.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Loopback bind failed (port already in use or not permitted).
    #[error("failed to bind 127.0.0.1:{port} for the OAuth callback")]
    PortUnavailable {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Callback or device-poll deadline exceeded.
    #[error("timed out waiting for authorization")]
    Timeout,

    /// CSRF check failed on the redirect.
    #[error("OAuth state mismatch: possible CSRF attack")]
    StateMismatch,

    /// The redirect carried neither `code` nor `error`.
    #[error("OAuth callback carried no authorization code")]
    MissingCode,

    /// The provider redirected back with an explicit error.
    #[error("authorization was denied: {0}")]
    AuthorizationDenied(String),

    /// Non-2xx or malformed body from a token endpoint.
    #[error("token endpoint rejected the request ({status}): {body}")]
    TokenExchangeFailed { status: u16, body: String },

    /// RFC 8628: user has not yet approved the device code. Poll again.
    #[error("authorization pending")]
    AuthorizationPending,

    /// RFC 8628: provider asked us to back off. Poll again, slower.
    #[error("polling too fast; provider requested slow down")]
    SlowDown,

    /// RFC 8628: the device code expired before the user approved it.
    #[error("device code expired before authorization completed")]
    ExpiredToken,

    /// The provider has no non-interactive renewal path.
    #[error("provider `{provider}` does not support token refresh")]
    RefreshUnsupported { provider: String },

    /// No stored credential with that id.
    #[error("no stored credential with id `{id}`")]
    NotFound { id: String },

    /// A stored credential file exists but cannot be understood.
    #[error("corrupt credential file {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    /// An interactive importer needed a label and could not infer one.
    #[error("an account email or label is required")]
    EmailRequired,

    /// A token does not have exactly three dot-separated segments.
    #[error("token is not a three-part JWT")]
    MalformedJwt,

    /// A JWT segment decoded but its payload is not valid JSON.
    #[error("JWT payload is not valid JSON")]
    MalformedPayload,

    /// No authenticator registered under that provider key.
    #[error("unknown provider `{0}`")]
    UnknownProvider(String),

    /// A metadata field exists but carries an unexpected JSON type.
    #[error("metadata field `{field}` has unexpected type (expected {expected})")]
    MetadataType {
        field: String,
        expected: &'static str,
    },

    /// A user-supplied value (pasted URL, id, path) that cannot be used.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl AuthError {
    /// Whether this error is an RFC 8628 "keep polling" state.
    pub fn is_polling_state(&self) -> bool {
        matches!(self, Self::AuthorizationPending | Self::SlowDown)
    }

    /// Whether a refresh attempt hitting this error is worth retrying.
    ///
    /// Unsupported providers and store-level misses will not get better
    /// on a second try; transient HTTP and endpoint failures might.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::RefreshUnsupported { .. }
                | Self::NotFound { .. }
                | Self::Corrupt { .. }
                | Self::UnknownProvider(_)
        )
    }
}
