//! Amazon Q CLI credential discovery.
//!
//! Amazon Q keeps its SSO OIDC material in a SQLite database under
//! `~/.local/share/amazon-q/data.sqlite3`, keyed by well-known
//! constants. On Linux and macOS the database is read directly (read
//! only, 5s busy timeout). On Windows the CLI lives inside WSL, and
//! reading the file over the `\\wsl$` UNC path is unreliable, so the
//! value is fetched by running python3's sqlite3 inside the distro.
//! Command execution sits behind [`CommandRunner`] so tests can stub
//! the WSL plumbing.

use std::path::PathBuf;
use std::process::Output;
use std::time::Duration;

use chrono::{DateTime, Utc};
use directories::UserDirs;
use serde::Deserialize;

use crate::error::{AuthError, Result};

/// Key holding the SSO token JSON.
pub const TOKEN_KEY: &str = "codewhisperer:odic:token";
/// Key holding the OIDC client registration JSON.
pub const REGISTRATION_KEY: &str = "codewhisperer:odic:device-registration";

/// Busy timeout for the native SQLite read.
const DB_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Leeway applied when deciding whether an imported token is stale.
const EXPIRY_LEEWAY: Duration = Duration::from_secs(5 * 60);

// ── Command runner seam ─────────────────────────────────────────────

/// Executes external commands (the WSL bridge). Stubbed in tests.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> std::io::Result<Output>;
}

/// Real runner backed by `std::process::Command`.
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> std::io::Result<Output> {
        std::process::Command::new(program).args(args).output()
    }
}

// ── Credential shapes ───────────────────────────────────────────────

/// SSO token record stored by Amazon Q (camelCase on disk).
#[derive(Debug, Clone, Deserialize)]
pub struct AmazonQToken {
    #[serde(alias = "accessToken")]
    pub access_token: String,
    #[serde(default, alias = "refreshToken")]
    pub refresh_token: Option<String>,
    #[serde(default, alias = "expiresAt")]
    pub expires_at: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default, alias = "startUrl")]
    pub start_url: Option<String>,
}

impl AmazonQToken {
    /// Importer expiry policy: unparseable or missing expiry counts as
    /// expired; otherwise a 5-minute leeway applies.
    pub fn is_expired(&self) -> bool {
        let Some(raw) = self.expires_at.as_deref() else {
            return true;
        };
        match DateTime::parse_from_rfc3339(raw.trim()) {
            Ok(at) => {
                Utc::now() + chrono::Duration::seconds(EXPIRY_LEEWAY.as_secs() as i64)
                    >= at.with_timezone(&Utc)
            }
            Err(_) => true,
        }
    }
}

/// OIDC client registration stored alongside the token.
#[derive(Debug, Clone, Deserialize)]
pub struct AmazonQRegistration {
    #[serde(alias = "clientId")]
    pub client_id: String,
    #[serde(default, alias = "clientSecret")]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

/// Everything the kiro provider needs to adopt an Amazon Q login.
#[derive(Debug, Clone)]
pub struct AmazonQCredentials {
    pub token: AmazonQToken,
    pub registration: Option<AmazonQRegistration>,
    /// Where the database was found (native path or WSL description).
    pub source_path: String,
}

// ── Discovery ───────────────────────────────────────────────────────

/// Native database path (`~/.local/share/amazon-q/data.sqlite3`).
pub fn amazon_q_db_path() -> Option<PathBuf> {
    let home = UserDirs::new()?.home_dir().to_path_buf();
    Some(home.join(".local/share/amazon-q/data.sqlite3"))
}

/// Read Amazon Q credentials from wherever this platform keeps them.
pub fn read_amazon_q_credentials(runner: &dyn CommandRunner) -> Result<Option<AmazonQCredentials>> {
    if cfg!(target_os = "windows") {
        return read_credentials_via_wsl(runner);
    }
    let Some(db_path) = amazon_q_db_path() else {
        return Ok(None);
    };
    if !db_path.is_file() {
        return Ok(None);
    }

    let Some(token_raw) = read_value_native(&db_path, TOKEN_KEY)? else {
        return Ok(None);
    };
    let token: AmazonQToken = serde_json::from_str(&token_raw)?;
    let registration = match read_value_native(&db_path, REGISTRATION_KEY)? {
        Some(raw) => serde_json::from_str(&raw).ok(),
        None => None,
    };

    Ok(Some(AmazonQCredentials {
        token,
        registration,
        source_path: db_path.display().to_string(),
    }))
}

/// Read one value from the `auth_kv` table, read-only.
fn read_value_native(db_path: &std::path::Path, key: &str) -> Result<Option<String>> {
    use rusqlite::{Connection, OpenFlags, OptionalExtension};

    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|err| AuthError::Corrupt {
        path: db_path.to_path_buf(),
        reason: format!("cannot open amazon-q database: {err}"),
    })?;
    conn.busy_timeout(DB_BUSY_TIMEOUT)
        .map_err(|err| AuthError::Corrupt {
            path: db_path.to_path_buf(),
            reason: format!("cannot set busy timeout: {err}"),
        })?;

    conn.query_row(
        "SELECT value FROM auth_kv WHERE key = ?1",
        [key],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map_err(|err| AuthError::Corrupt {
        path: db_path.to_path_buf(),
        reason: format!("amazon-q database query failed: {err}"),
    })
}

// ── WSL bridge (Windows) ────────────────────────────────────────────

/// Decode `wsl.exe` output, which is UTF-16LE with CRLF line endings.
fn decode_wsl_output(bytes: &[u8]) -> String {
    if bytes.contains(&0) {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

/// Pick the distro to bridge into: the first `wsl -l -q` entry that is
/// not a docker/podman utility distro, after normalization.
pub fn pick_wsl_distro(raw_output: &[u8]) -> Option<String> {
    decode_wsl_output(raw_output)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .find(|line| {
            let lower = line.to_lowercase();
            !lower.starts_with("docker") && !lower.starts_with("podman")
        })
        .map(str::to_string)
}

fn read_credentials_via_wsl(runner: &dyn CommandRunner) -> Result<Option<AmazonQCredentials>> {
    let listing = match runner.run("wsl", &["-l", "-q"]) {
        Ok(output) if output.status.success() => output.stdout,
        _ => return Ok(None),
    };
    let Some(distro) = pick_wsl_distro(&listing) else {
        return Ok(None);
    };

    let whoami = runner.run("wsl", &["-d", &distro, "--", "whoami"])?;
    if !whoami.status.success() {
        return Ok(None);
    }
    let user = decode_wsl_output(&whoami.stdout).trim().to_string();
    if user.is_empty() {
        return Ok(None);
    }
    let db_path = format!("/home/{user}/.local/share/amazon-q/data.sqlite3");

    let Some(token_raw) = read_value_wsl(runner, &distro, &db_path, TOKEN_KEY)? else {
        return Ok(None);
    };
    let token: AmazonQToken = serde_json::from_str(&token_raw)?;
    let registration = match read_value_wsl(runner, &distro, &db_path, REGISTRATION_KEY)? {
        Some(raw) => serde_json::from_str(&raw).ok(),
        None => None,
    };

    Ok(Some(AmazonQCredentials {
        token,
        registration,
        source_path: format!("wsl:{distro}:{db_path}"),
    }))
}

/// Read one value through the Linux-side sqlite3, because reading the
/// database file over `\\wsl$\...` is unreliable.
fn read_value_wsl(
    runner: &dyn CommandRunner,
    distro: &str,
    db_path: &str,
    key: &str,
) -> Result<Option<String>> {
    let script = format!(
        "import sqlite3\n\
         conn = sqlite3.connect('file:{db_path}?mode=ro', uri=True)\n\
         row = conn.execute('SELECT value FROM auth_kv WHERE key = ?', ('{key}',)).fetchone()\n\
         print(row[0] if row else '')",
    );
    let output = runner.run("wsl", &["-d", distro, "python3", "-c", &script])?;
    if !output.status.success() {
        return Ok(None);
    }
    let value = decode_wsl_output(&output.stdout).trim().to_string();
    if value.is_empty() {
        return Ok(None);
    }
    Ok(Some(value))
}

// ── Tests ───────────────────────────────────────────────────────────
