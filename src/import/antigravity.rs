//! Antigravity IDE credential discovery.
//!
//! The IDE keeps `oauth_creds.json` in a platform-specific application
//! directory; when it is absent the Gemini CLI file is tried as a
//! fallback, since both speak the same Google token format.

use std::path::PathBuf;

use directories::UserDirs;

use super::gemini;
use super::peer_creds::PeerOAuthCreds;
use crate::error::Result;

/// Credentials file name (same as Gemini CLI's).
const CREDS_FILE: &str = "oauth_creds.json";

/// Where the credentials came from, for provenance attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AntigravitySource {
    Ide,
    GeminiFallback,
}

impl AntigravitySource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ide => "antigravity-ide",
            Self::GeminiFallback => "gemini-cli",
        }
    }
}

/// Candidate IDE credential paths for the current platform, most
/// specific first. The Gemini fallback is appended by the loader, not
/// listed here.
pub fn antigravity_creds_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    #[cfg(target_os = "macos")]
    {
        if let Some(dirs) = UserDirs::new() {
            candidates.push(
                dirs.home_dir()
                    .join("Library/Application Support/Antigravity")
                    .join(CREDS_FILE),
            );
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Some(app_data) = std::env::var_os("APPDATA") {
            candidates.push(PathBuf::from(app_data).join("Antigravity").join(CREDS_FILE));
        }
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    {
        if let Some(dirs) = UserDirs::new() {
            candidates.push(dirs.home_dir().join(".antigravity").join(CREDS_FILE));
        }
    }

    candidates
}

/// Load Antigravity credentials, falling back to the Gemini CLI file.
pub fn load_antigravity_credentials()
-> Result<Option<(PeerOAuthCreds, PathBuf, AntigravitySource)>> {
    for path in antigravity_creds_candidates() {
        if let Some((creds, path)) = gemini::load_from(path)? {
            return Ok(Some((creds, path, AntigravitySource::Ide)));
        }
    }
    if let Some((creds, path)) = gemini::load_gemini_cli_credentials()? {
        return Ok(Some((creds, path, AntigravitySource::GeminiFallback)));
    }
    Ok(None)
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_end_with_creds_file() {
        for path in antigravity_creds_candidates() {
            assert!(path.ends_with(CREDS_FILE));
        }
    }

    #[test]
    fn source_labels_are_stable() {
        assert_eq!(AntigravitySource::Ide.as_str(), "antigravity-ide");
        assert_eq!(AntigravitySource::GeminiFallback.as_str(), "gemini-cli");
    }
}
