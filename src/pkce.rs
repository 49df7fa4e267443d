//! PKCE, CSRF-state, and JWT primitives (RFC 7636 / RFC 7519).
//!
//! Everything here is plain byte-pushing: CSPRNG draws encoded as
//! base64url without padding, an S256 challenge, and a three-part JWT
//! splitter that decodes the payload without verifying the signature.
//! Signature verification is deliberately out of scope: these claims
//! only ever feed display labels and account ids, never authorization
//! decisions.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{AuthError, Result};

/// PKCE parameters for OAuth Authorization Code + PKCE flows.
#[derive(Debug, Clone)]
pub struct PkcePair {
    /// Random code verifier: 96 random bytes → 128 base64url chars.
    pub verifier: String,
    /// S256 challenge: base64url(SHA-256(verifier)), 43 chars.
    pub challenge: String,
}

impl PkcePair {
    /// Generate a fresh verifier/challenge pair.
    pub fn generate() -> Self {
        let verifier = generate_verifier();
        let challenge = challenge_from(&verifier);
        Self {
            verifier,
            challenge,
        }
    }
}

/// Draw a 128-character PKCE code verifier from the OS CSPRNG.
///
/// 96 random bytes encode to exactly 128 base64url characters, the
/// maximum length RFC 7636 permits.
pub fn generate_verifier() -> String {
    let mut bytes = [0u8; 96];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// S256 code challenge for a verifier: `base64url(SHA256(verifier))`.
pub fn challenge_from(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Random URL-safe state parameter for CSRF protection (32 bytes of
/// entropy, well above the 16-byte floor).
pub fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode base64url input, tolerating both padded and unpadded forms.
///
/// Non-URL-safe characters (`+`, `/`, whitespace) are rejected.
pub fn base64url_decode(input: &str) -> Result<Vec<u8>> {
    let trimmed = input.trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .map_err(|_| AuthError::MalformedPayload)
}

/// A JWT split into its three segments, with the payload decoded.
#[derive(Debug, Clone)]
pub struct JwtParts {
    /// Decoded header, when it parses as JSON. Headers from foreign
    /// tokens are occasionally junk; the claims are what matter.
    pub header: Option<serde_json::Value>,
    /// Decoded payload claims.
    pub claims: JwtClaims,
    /// Raw (still-encoded) signature segment.
    pub signature: String,
}

/// Decoded JWT payload with typed accessors for the claims the broker
/// actually reads. The signature is **not** verified.
#[derive(Debug, Clone)]
pub struct JwtClaims(serde_json::Value);

impl JwtClaims {
    /// The `email` claim, if present.
    pub fn email(&self) -> Option<&str> {
        self.0.get("email").and_then(|v| v.as_str())
    }

    /// The `sub` claim, if present.
    pub fn subject(&self) -> Option<&str> {
        self.0.get("sub").and_then(|v| v.as_str())
    }

    /// The ChatGPT account id buried under the `https://api.openai.com/auth`
    /// claim namespace, used by the Codex flow.
    pub fn chatgpt_account_id(&self) -> Option<&str> {
        self.0
            .get("https://api.openai.com/auth")
            .and_then(|auth| auth.get("chatgpt_account_id"))
            .and_then(|v| v.as_str())
    }

    /// Raw access to any other claim.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }
}

/// Split a JWT into header/payload/signature and decode the payload.
///
/// Fails with [`AuthError::MalformedJwt`] unless the token has exactly
/// three dot-separated segments, and [`AuthError::MalformedPayload`]
/// when the middle segment is not base64url-wrapped JSON.
pub fn split_jwt(token: &str) -> Result<JwtParts> {
    let segments: Vec<&str> = token.split('.').collect();
    let [header, payload, signature] = segments.as_slice() else {
        return Err(AuthError::MalformedJwt);
    };

    let payload_bytes = base64url_decode(payload)?;
    let claims: serde_json::Value =
        serde_json::from_slice(&payload_bytes).map_err(|_| AuthError::MalformedPayload)?;
    if !claims.is_object() {
        return Err(AuthError::MalformedPayload);
    }

    let header = base64url_decode(header)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok());

    Ok(JwtParts {
        header,
        claims: JwtClaims(claims),
        signature: (*signature).to_string(),
    })
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn is_base64url(s: &str) -> bool {
        s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    }

    #[test]
    fn verifier_is_128_urlsafe_chars() {
        let verifier = generate_verifier();
        assert_eq!(verifier.len(), 128);
        assert!(is_base64url(&verifier));
    }

    #[test]
    fn challenge_is_43_urlsafe_chars() {
        let challenge = challenge_from(&generate_verifier());
        assert_eq!(challenge.len(), 43);
        assert!(is_base64url(&challenge));
    }

    #[test]
    fn challenge_matches_sha256_of_verifier() {
        let verifier = "test-verifier-string-for-pkce-challenge-generation";
        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        assert_eq!(challenge_from(verifier), expected);
        assert_eq!(expected.len(), 43);
        assert!(!expected.contains('+'));
        assert!(!expected.contains('/'));
        assert!(!expected.contains('='));
    }

    #[test]
    fn verifiers_are_unique_across_100_draws() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            assert!(seen.insert(generate_verifier()));
        }
    }

    #[test]
    fn state_has_enough_entropy() {
        let state = generate_state();
        // 32 bytes → 43 base64url chars, well past the 16-byte floor.
        assert!(state.len() >= 22);
        assert!(is_base64url(&state));
        assert_ne!(generate_state(), state);
    }

    #[test]
    fn base64url_decode_accepts_padded_and_unpadded() {
        assert_eq!(base64url_decode("aGk").unwrap(), b"hi");
        assert_eq!(base64url_decode("aGk=").unwrap(), b"hi");
    }

    #[test]
    fn base64url_decode_rejects_standard_alphabet() {
        assert!(base64url_decode("a+b/c").is_err());
    }

    #[test]
    fn split_jwt_decodes_three_part_token() {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256"}"#);
        let payload =
            URL_SAFE_NO_PAD.encode(br#"{"email":"dev@example.com","sub":"user-1"}"#);
        let token = format!("{header}.{payload}.sig-bytes");

        let parts = split_jwt(&token).unwrap();
        assert_eq!(parts.claims.email(), Some("dev@example.com"));
        assert_eq!(parts.claims.subject(), Some("user-1"));
        assert_eq!(parts.signature, "sig-bytes");
        assert!(parts.header.is_some());
    }

    #[test]
    fn split_jwt_reads_chatgpt_account_id() {
        let payload = URL_SAFE_NO_PAD.encode(
            br#"{"https://api.openai.com/auth":{"chatgpt_account_id":"acct-7"}}"#,
        );
        let token = format!("h.{payload}.s");
        let parts = split_jwt(&token).unwrap();
        assert_eq!(parts.claims.chatgpt_account_id(), Some("acct-7"));
    }

    #[test]
    fn split_jwt_rejects_wrong_part_counts() {
        assert!(matches!(split_jwt("a.b"), Err(AuthError::MalformedJwt)));
        assert!(matches!(split_jwt("a.b.c.d"), Err(AuthError::MalformedJwt)));
    }

    #[test]
    fn split_jwt_rejects_non_json_payload() {
        let payload = URL_SAFE_NO_PAD.encode(b"not-json");
        let token = format!("header.{payload}.sig");
        assert!(matches!(
            split_jwt(&token),
            Err(AuthError::MalformedPayload)
        ));
    }
}
