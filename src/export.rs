//! Redaction-aware export/import bundles.
//!
//! Export walks every record through a redaction pass before anything
//! is serialized, so tokens never escape through ad-hoc serialization
//! paths. Redaction is a predicate over keys plus a deep walker over
//! nested values, so provider-specific metadata shapes are covered
//! without enumeration. Import refuses accounts whose secrets were
//! redacted away and skips id collisions unless forced.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::{Auth, AuthStatus};
use crate::error::Result;
use crate::manager::AuthManager;

/// The literal that replaces redacted values.
pub const REDACTED: &str = "[REDACTED]";

/// Bundle format version.
const BUNDLE_VERSION: &str = "1.0";

/// Case-insensitive substrings that mark a key as sensitive.
const SENSITIVE_KEY_SUBSTRINGS: &[&str] = &[
    "access_token",
    "refresh_token",
    "token",
    "api_key",
    "secret",
    "password",
    "credential",
    "session",
    "cookie",
    "id_token",
    "bearer",
];

/// Whether a metadata/attribute key holds secret material.
pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    SENSITIVE_KEY_SUBSTRINGS
        .iter()
        .any(|needle| lower.contains(needle))
}

// ── Bundle shapes ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportBundle {
    pub version: String,
    pub exported_at: DateTime<Utc>,
    pub accounts: Vec<ExportedAccount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedAccount {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// What happened during a bundle import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped_existing: usize,
    pub skipped_redacted: usize,
}

// ── Export ──────────────────────────────────────────────────────────

/// Build an export bundle. Unless `include_tokens` is set, every
/// sensitive key (at any nesting depth) is replaced with
/// [`REDACTED`].
pub fn export_accounts(auths: &[Auth], include_tokens: bool) -> ExportBundle {
    let accounts = auths
        .iter()
        .map(|auth| {
            let metadata = if include_tokens {
                auth.metadata.clone()
            } else {
                redact_map(&auth.metadata)
            };
            let attributes = if include_tokens {
                auth.attributes.clone()
            } else {
                auth.attributes
                    .iter()
                    .map(|(key, value)| {
                        let value = if is_sensitive_key(key) {
                            REDACTED.to_string()
                        } else {
                            value.clone()
                        };
                        (key.clone(), value)
                    })
                    .collect()
            };
            ExportedAccount {
                id: auth.id.clone(),
                provider: auth.provider.clone(),
                label: auth.label.clone(),
                attributes,
                metadata,
                created_at: auth.created_at,
            }
        })
        .collect();

    ExportBundle {
        version: BUNDLE_VERSION.to_string(),
        exported_at: Utc::now(),
        accounts,
    }
}

fn redact_map(map: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    map.iter()
        .map(|(key, value)| (key.clone(), redact_value(key, value)))
        .collect()
}

/// Deep redaction walker: a sensitive key blanks its whole subtree;
/// containers under non-sensitive keys are walked for nested hits.
fn redact_value(key: &str, value: &Value) -> Value {
    if is_sensitive_key(key) {
        return Value::String(REDACTED.to_string());
    }
    match value {
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(nested_key, nested)| (nested_key.clone(), redact_value(nested_key, nested)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| redact_value(key, item)).collect())
        }
        other => other.clone(),
    }
}

// ── Import ──────────────────────────────────────────────────────────

/// Whether an account still carries redaction placeholders in any
/// sensitive position.
fn has_redacted_secrets(account: &ExportedAccount) -> bool {
    let metadata_hit = account
        .metadata
        .iter()
        .any(|(key, value)| value_has_redaction(key, value));
    let attribute_hit = account
        .attributes
        .iter()
        .any(|(key, value)| is_sensitive_key(key) && value == REDACTED);
    metadata_hit || attribute_hit
}

fn value_has_redaction(key: &str, value: &Value) -> bool {
    match value {
        Value::String(s) => is_sensitive_key(key) && s == REDACTED,
        Value::Object(fields) => fields
            .iter()
            .any(|(nested_key, nested)| value_has_redaction(nested_key, nested)),
        Value::Array(items) => items.iter().any(|item| value_has_redaction(key, item)),
        _ => false,
    }
}

/// Import a bundle. Accounts with redacted secrets are skipped with
/// reason "redacted tokens"; id collisions are skipped unless `force`.
pub fn import_bundle(
    manager: &AuthManager,
    bundle: &ExportBundle,
    force: bool,
) -> Result<ImportReport> {
    let mut report = ImportReport::default();

    for account in &bundle.accounts {
        if has_redacted_secrets(account) {
            tracing::warn!("skipping {}: redacted tokens", account.id);
            report.skipped_redacted += 1;
            continue;
        }
        if !force && manager.load(&account.id).is_ok() {
            tracing::warn!("skipping {}: id already exists", account.id);
            report.skipped_existing += 1;
            continue;
        }

        let mut auth = Auth::new(account.provider.clone(), account.id.clone());
        auth.label = account.label.clone();
        auth.status = AuthStatus::Active;
        auth.attributes = account.attributes.clone();
        auth.metadata = account.metadata.clone();
        auth.created_at = account.created_at;
        manager.save_auth(&mut auth)?;
        report.imported += 1;
    }

    Ok(report)
}

// ── Tests ───────────────────────────────────────────────────────────
