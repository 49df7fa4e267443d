//! Polymorphic peer-CLI credential file reader.
//!
//! Google-family CLIs persist `oauth_creds.json` in two shapes: a
//! nested `{"token": {...}, "email": ..., "project_id": ...}` form and
//! a flat form with the token fields at the top level. Accessors prefer
//! the nested form when both are present.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::error::{AuthError, Result};

/// Leeway applied when deciding whether an imported token is stale.
pub const IMPORT_EXPIRY_LEEWAY: Duration = Duration::from_secs(5 * 60);

/// A parsed peer credential file.
#[derive(Debug, Clone)]
pub struct PeerOAuthCreds {
    value: Value,
}

impl PeerOAuthCreds {
    pub fn parse(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        if !value.is_object() {
            return Err(AuthError::InvalidInput(
                "peer credential file is not a JSON object".into(),
            ));
        }
        Ok(Self { value })
    }

    /// The nested token object, when the file uses the nested shape.
    fn token_obj(&self) -> Option<&Value> {
        self.value.get("token").filter(|t| t.is_object())
    }

    /// Field lookup: nested token object first, then top level.
    fn field(&self, key: &str) -> Option<&Value> {
        if let Some(nested) = self.token_obj().and_then(|t| t.get(key)) {
            if !nested.is_null() {
                return Some(nested);
            }
        }
        self.value.get(key).filter(|v| !v.is_null())
    }

    fn field_str(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    pub fn access_token(&self) -> Option<&str> {
        self.field_str("access_token")
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.field_str("refresh_token")
    }

    pub fn id_token(&self) -> Option<&str> {
        self.field_str("id_token")
    }

    /// Email and project id live outside the nested token object, but
    /// the same nested-first rule is applied for uniformity.
    pub fn email(&self) -> Option<&str> {
        self.field_str("email")
    }

    pub fn project_id(&self) -> Option<&str> {
        self.field_str("project_id")
            .or_else(|| self.value.get("projectId").and_then(Value::as_str))
    }

    /// Expiry instant, walking `expiry` / `expires_at` (RFC3339) then
    /// `expiry_date` (ms epoch). `Err` marks present-but-unparseable.
    pub fn expires_at(&self) -> Result<Option<DateTime<Utc>>> {
        for key in ["expiry", "expires_at"] {
            if let Some(value) = self.field(key) {
                let raw = value.as_str().ok_or_else(|| bad_expiry(key))?;
                let parsed =
                    DateTime::parse_from_rfc3339(raw.trim()).map_err(|_| bad_expiry(key))?;
                return Ok(Some(parsed.with_timezone(&Utc)));
            }
        }
        if let Some(value) = self.field("expiry_date") {
            let ms = value
                .as_i64()
                .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
                .ok_or_else(|| bad_expiry("expiry_date"))?;
            return Utc
                .timestamp_millis_opt(ms)
                .single()
                .map(Some)
                .ok_or_else(|| bad_expiry("expiry_date"));
        }
        Ok(None)
    }

    /// Importer expiry policy: unparseable or missing expiry counts as
    /// expired; otherwise the token is stale when `now + leeway` has
    /// reached the expiry.
    pub fn is_expired(&self, leeway: Duration) -> bool {
        match self.expires_at() {
            Ok(Some(at)) => Utc::now() + chrono::Duration::seconds(leeway.as_secs() as i64) >= at,
            Ok(None) | Err(_) => true,
        }
    }

    /// Expiry re-encoded as RFC3339 for the canonical record.
    pub fn expiry_rfc3339(&self) -> Option<String> {
        self.expires_at().ok().flatten().map(|at| at.to_rfc3339())
    }
}

fn bad_expiry(key: &str) -> AuthError {
    AuthError::InvalidInput(format!("peer credential `{key}` is unparseable"))
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_token_wins_over_flat() {
        let creds = PeerOAuthCreds::parse(
            r#"{"token":{"access_token":"A"},"access_token":"B"}"#,
        )
        .unwrap();
        assert_eq!(creds.access_token(), Some("A"));
    }

    #[test]
    fn flat_form_still_reads() {
        let creds = PeerOAuthCreds::parse(
            r#"{"access_token":"B","refresh_token":"R","email":"dev@example.com"}"#,
        )
        .unwrap();
        assert_eq!(creds.access_token(), Some("B"));
        assert_eq!(creds.refresh_token(), Some("R"));
        assert_eq!(creds.email(), Some("dev@example.com"));
    }

    #[test]
    fn nested_null_falls_through_to_flat() {
        let creds = PeerOAuthCreds::parse(
            r#"{"token":{"access_token":null},"access_token":"B"}"#,
        )
        .unwrap();
        assert_eq!(creds.access_token(), Some("B"));
    }

    #[test]
    fn expiry_reads_rfc3339_and_millis() {
        let rfc = PeerOAuthCreds::parse(r#"{"expiry":"2099-01-01T00:00:00Z"}"#).unwrap();
        assert!(rfc.expires_at().unwrap().is_some());

        let ms = PeerOAuthCreds::parse(r#"{"expiry_date":1700000000000}"#).unwrap();
        assert!(ms.expires_at().unwrap().is_some());
    }

    #[test]
    fn unparseable_expiry_counts_as_expired() {
        let creds = PeerOAuthCreds::parse(r#"{"access_token":"A","expiry":"junk"}"#).unwrap();
        assert!(creds.expires_at().is_err());
        assert!(creds.is_expired(IMPORT_EXPIRY_LEEWAY));
    }

    #[test]
    fn leeway_is_applied() {
        let soon = (Utc::now() + chrono::Duration::minutes(3)).to_rfc3339();
        let creds =
            PeerOAuthCreds::parse(&format!(r#"{{"access_token":"A","expiry":"{soon}"}}"#)).unwrap();
        // Inside the 5-minute leeway window.
        assert!(creds.is_expired(IMPORT_EXPIRY_LEEWAY));

        let later = (Utc::now() + chrono::Duration::hours(2)).to_rfc3339();
        let creds =
            PeerOAuthCreds::parse(&format!(r#"{{"access_token":"A","expiry":"{later}"}}"#))
                .unwrap();
        assert!(!creds.is_expired(IMPORT_EXPIRY_LEEWAY));
    }

    #[test]
    fn missing_expiry_counts_as_expired() {
        let creds = PeerOAuthCreds::parse(r#"{"access_token":"A"}"#).unwrap();
        assert!(creds.is_expired(IMPORT_EXPIRY_LEEWAY));
    }

    #[test]
    fn non_object_file_is_rejected() {
        assert!(PeerOAuthCreds::parse("[1,2,3]").is_err());
    }
}
