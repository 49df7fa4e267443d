//! Gemini CLI credential discovery (`~/.gemini/oauth_creds.json`).

use std::path::PathBuf;

use directories::UserDirs;

use super::peer_creds::PeerOAuthCreds;
use crate::error::Result;

/// Gemini CLI credentials directory under the user's home.
const GEMINI_CLI_DIR: &str = ".gemini";
/// Credentials file name.
const CREDS_FILE: &str = "oauth_creds.json";

/// Path to the Gemini CLI credentials file. The layout is the same on
/// every platform; only the home directory differs.
pub fn gemini_cli_creds_path() -> Option<PathBuf> {
    let home = UserDirs::new()?.home_dir().to_path_buf();
    Some(home.join(GEMINI_CLI_DIR).join(CREDS_FILE))
}

/// Load Gemini CLI credentials when the file exists.
///
/// Returns the parsed credentials plus the path they came from, so the
/// caller can record provenance in `attributes`.
pub fn load_gemini_cli_credentials() -> Result<Option<(PeerOAuthCreds, PathBuf)>> {
    let Some(path) = gemini_cli_creds_path() else {
        return Ok(None);
    };
    load_from(path)
}

pub(crate) fn load_from(path: PathBuf) -> Result<Option<(PeerOAuthCreds, PathBuf)>> {
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let creds = PeerOAuthCreds::parse(&raw)?;
    Ok(Some((creds, path)))
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn creds_path_ends_with_expected_file() {
        if let Some(path) = gemini_cli_creds_path() {
            assert!(path.ends_with("oauth_creds.json"));
            assert!(path.to_string_lossy().contains(".gemini"));
        }
    }

    #[test]
    fn load_from_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let result = load_from(dir.path().join("oauth_creds.json")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn load_from_reads_nested_form() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("oauth_creds.json");
        std::fs::write(
            &path,
            r#"{"token":{"access_token":"A","refresh_token":"R"},"email":"dev@example.com"}"#,
        )
        .unwrap();
        let (creds, loaded_path) = load_from(path.clone()).unwrap().unwrap();
        assert_eq!(creds.access_token(), Some("A"));
        assert_eq!(creds.email(), Some("dev@example.com"));
        assert_eq!(loaded_path, path);
    }

    #[test]
    fn load_from_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("oauth_creds.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(load_from(path).is_err());
    }
}
