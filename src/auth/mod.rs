//! The canonical `Auth` record and its expiry/scheduling logic.
//!
//! An `Auth` is born in a login flow (or an importer), persisted
//! immediately, mutated only through refresh, and destroyed only by
//! explicit removal. Provider-specific fields live in an open metadata
//! map that serializes flattened at the top level of the token file, so
//! the on-disk shape stays interchangeable with the peer CLIs these
//! records are imported from.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AuthError, Result};

/// Well-known metadata keys. Providers write these; the store and
/// manager read them back for expiry derivation and refresh dispatch.
pub mod keys {
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const REFRESH_TOKEN: &str = "refresh_token";
    pub const ID_TOKEN: &str = "id_token";
    /// RFC3339 expiry. First in the derivation precedence.
    pub const EXPIRED: &str = "expired";
    /// RFC3339 expiry (peer-CLI spelling). Second in precedence.
    pub const EXPIRES_AT: &str = "expires_at";
    /// Millisecond-epoch expiry (Google CLI spelling). Third.
    pub const EXPIRY_DATE: &str = "expiry_date";
    /// Lifetime in seconds, anchored at [`TIMESTAMP`]. Last.
    pub const EXPIRES_IN: &str = "expires_in";
    /// Millisecond-epoch anchor for [`EXPIRES_IN`].
    pub const TIMESTAMP: &str = "timestamp";
    pub const EMAIL: &str = "email";
    pub const PROJECT_ID: &str = "project_id";
    pub const TIER_ID: &str = "tier_id";
    pub const CLIENT_ID: &str = "client_id";
    pub const CLIENT_SECRET: &str = "client_secret";
    pub const ACCOUNT_ID: &str = "account_id";
    pub const REGION: &str = "region";
    pub const START_URL: &str = "start_url";
    pub const PREFERRED_ENDPOINT: &str = "preferred_endpoint";
    pub const LAST_REFRESH: &str = "last_refresh";
    pub const AUTH_METHOD: &str = "auth_method";
    pub const API_KEY: &str = "api_key";
}

/// Lifecycle state of a stored credential.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    #[default]
    Active,
    Disabled,
    Error,
}

impl std::fmt::Display for AuthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Disabled => write!(f, "disabled"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// What we know about a credential's expiry after walking its metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExpiryState {
    /// No expiry metadata at all (bearer API keys). Never refreshed.
    #[default]
    Unknown,
    /// Expiry metadata exists but could not be parsed. Treated as
    /// already expired.
    Invalid,
    /// Parsed expiry instant.
    At(DateTime<Utc>),
}

/// Canonical persisted credential record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
    /// Unique id within the store; equals the filename leaf sans `.json`.
    pub id: String,
    /// Stable provider key (`claude`, `codex`, `kiro`, ...).
    #[serde(rename = "type")]
    pub provider: String,
    /// Relative path within the store.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_name: String,
    /// Human display label, usually an email or alias.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
    #[serde(default)]
    pub status: AuthStatus,
    /// Flat string view used for querying (`email`, `source`, `path`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refreshed_at: Option<DateTime<Utc>>,
    /// Open provider-specific field map, flattened into the top level
    /// of the token file.
    #[serde(flatten)]
    pub metadata: BTreeMap<String, Value>,
    /// Derived on load; never serialized.
    #[serde(skip)]
    pub expiry: ExpiryState,
    /// `token_expires_at - refresh_lead(provider)`; never serialized.
    #[serde(skip)]
    pub next_refresh_after: Option<DateTime<Utc>>,
}

impl Auth {
    /// Fresh record for a provider. Timestamps are stamped by the store
    /// on first save.
    pub fn new(provider: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            file_name: String::new(),
            label: String::new(),
            status: AuthStatus::Active,
            attributes: BTreeMap::new(),
            created_at: None,
            updated_at: None,
            last_refreshed_at: None,
            metadata: BTreeMap::new(),
            expiry: ExpiryState::Unknown,
            next_refresh_after: None,
        }
    }

    // ── Typed metadata accessors ────────────────────────────────────

    /// String-typed metadata field. `Ok(None)` when absent, typed error
    /// when present with the wrong JSON type.
    pub fn meta_str(&self, key: &str) -> Result<Option<&str>> {
        match self.metadata.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(AuthError::MetadataType {
                field: key.to_string(),
                expected: "string",
            }),
        }
    }

    /// Integer-typed metadata field; numeric strings are accepted since
    /// several peer CLIs serialize numbers as strings.
    pub fn meta_i64(&self, key: &str) -> Result<Option<i64>> {
        match self.metadata.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => {
                n.as_i64().map(Some).ok_or_else(|| AuthError::MetadataType {
                    field: key.to_string(),
                    expected: "integer",
                })
            }
            Some(Value::String(s)) => {
                s.trim()
                    .parse::<i64>()
                    .map(Some)
                    .map_err(|_| AuthError::MetadataType {
                        field: key.to_string(),
                        expected: "integer",
                    })
            }
            Some(_) => Err(AuthError::MetadataType {
                field: key.to_string(),
                expected: "integer",
            }),
        }
    }

    /// Set a metadata field.
    pub fn set_meta(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    /// The access token, when present and a string.
    pub fn access_token(&self) -> Option<&str> {
        self.meta_str(keys::ACCESS_TOKEN).ok().flatten()
    }

    /// The refresh token, when present and a string.
    pub fn refresh_token(&self) -> Option<&str> {
        self.meta_str(keys::REFRESH_TOKEN).ok().flatten()
    }

    /// Email from attributes first (the query view), metadata second.
    pub fn email(&self) -> Option<&str> {
        self.attributes
            .get(keys::EMAIL)
            .map(String::as_str)
            .or_else(|| self.meta_str(keys::EMAIL).ok().flatten())
    }

    // ── Expiry & scheduling ─────────────────────────────────────────

    /// Re-derive `expiry` from metadata and recompute
    /// `next_refresh_after` for the given provider lead.
    pub fn recompute_schedule(&mut self, refresh_lead: Option<Duration>) {
        self.expiry = derive_expiry(&self.metadata);
        self.next_refresh_after = match (self.expiry, refresh_lead) {
            (ExpiryState::At(at), Some(lead)) => {
                Some(at - chrono::Duration::seconds(lead.as_secs() as i64))
            }
            _ => None,
        };
    }

    /// Parsed expiry instant, when known.
    pub fn token_expires_at(&self) -> Option<DateTime<Utc>> {
        match self.expiry {
            ExpiryState::At(at) => Some(at),
            _ => None,
        }
    }

    /// True when the token is past (or has unparseable) expiry.
    pub fn is_expired(&self) -> bool {
        match self.expiry {
            ExpiryState::Unknown => false,
            ExpiryState::Invalid => true,
            ExpiryState::At(at) => at <= Utc::now(),
        }
    }

    /// True when the token is within `threshold` of expiry (inclusive)
    /// or its expiry metadata failed to parse.
    pub fn needs_refresh(&self, threshold: Duration) -> bool {
        match self.expiry {
            ExpiryState::Unknown => false,
            ExpiryState::Invalid => true,
            ExpiryState::At(at) => {
                Utc::now() + chrono::Duration::seconds(threshold.as_secs() as i64) >= at
            }
        }
    }
}

/// Walk metadata in precedence order and derive the expiry state:
/// `expired` (RFC3339) → `expires_at` (RFC3339) → `expiry_date`
/// (ms epoch) → `expires_in` (seconds from `timestamp`).
pub fn derive_expiry(metadata: &BTreeMap<String, Value>) -> ExpiryState {
    for key in [keys::EXPIRED, keys::EXPIRES_AT] {
        if let Some(value) = metadata.get(key) {
            return match value.as_str() {
                Some(raw) => parse_rfc3339(raw),
                None => ExpiryState::Invalid,
            };
        }
    }

    if let Some(value) = metadata.get(keys::EXPIRY_DATE) {
        return match value_as_i64(value) {
            Some(ms) => millis_to_expiry(ms),
            None => ExpiryState::Invalid,
        };
    }

    if let Some(value) = metadata.get(keys::EXPIRES_IN) {
        let Some(secs) = value_as_i64(value) else {
            return ExpiryState::Invalid;
        };
        // Without an anchor the lifetime is meaningless.
        let Some(anchor_ms) = metadata.get(keys::TIMESTAMP).and_then(value_as_i64) else {
            return ExpiryState::Unknown;
        };
        return millis_to_expiry(anchor_ms.saturating_add(secs.saturating_mul(1000)));
    }

    ExpiryState::Unknown
}

fn parse_rfc3339(raw: &str) -> ExpiryState {
    match DateTime::parse_from_rfc3339(raw.trim()) {
        Ok(at) => ExpiryState::At(at.with_timezone(&Utc)),
        Err(_) => ExpiryState::Invalid,
    }
}

fn millis_to_expiry(ms: i64) -> ExpiryState {
    match Utc.timestamp_millis_opt(ms).single() {
        Some(at) => ExpiryState::At(at),
        None => ExpiryState::Invalid,
    }
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Check whether an RFC3339 expiry string is in the past. Unparseable
/// input counts as expired.
pub fn is_expired(expiry: &str) -> bool {
    match DateTime::parse_from_rfc3339(expiry.trim()) {
        Ok(at) => at.with_timezone(&Utc) <= Utc::now(),
        Err(_) => true,
    }
}

/// Check whether an RFC3339 expiry string is within `threshold` of now
/// (boundary inclusive). Unparseable input counts as needing refresh.
pub fn needs_refresh(expiry: &str, threshold: Duration) -> bool {
    match DateTime::parse_from_rfc3339(expiry.trim()) {
        Ok(at) => {
            Utc::now() + chrono::Duration::seconds(threshold.as_secs() as i64)
                >= at.with_timezone(&Utc)
        }
        Err(_) => true,
    }
}

/// Sanitize an identity (email or alias) for use in ids and filenames:
/// `@` and `.` become `_`.
pub fn sanitize_identity(identity: &str) -> String {
    identity.replace(['@', '.'], "_")
}

/// Current instant as millisecond epoch, used for default labels.
pub fn unix_millis_now() -> i64 {
    Utc::now().timestamp_millis()
}

// ── Tests ───────────────────────────────────────────────────────────
