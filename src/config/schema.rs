use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

// ── Top-level config ──────────────────────────────────────────────

/// Broker configuration, loaded from `~/.authbroker/config.toml`.
/// Every field is optional in the file; defaults keep a fresh install
/// working without any config at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Auth directory - computed from home, not serialized.
    #[serde(skip)]
    pub auth_dir: PathBuf,
    /// Path to config.toml - computed from home, not serialized.
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Override for the auth directory (absolute path).
    pub auth_dir_override: Option<String>,

    /// How long an interactive login waits for the OAuth redirect.
    #[serde(default = "default_callback_timeout_secs")]
    pub callback_timeout_secs: u64,

    /// Delay before the manual-paste prompt is offered.
    #[serde(default = "default_paste_grace_secs")]
    pub paste_grace_secs: u64,

    /// Bounded retry count for token refresh.
    #[serde(default = "default_refresh_retries")]
    pub refresh_retries: u32,

    /// Per-request HTTP timeout for auth endpoints.
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

fn default_callback_timeout_secs() -> u64 {
    300
}

fn default_paste_grace_secs() -> u64 {
    15
}

fn default_refresh_retries() -> u32 {
    3
}

fn default_http_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        let broker_dir = broker_dir();
        Self {
            auth_dir: broker_dir.join("auth"),
            config_path: broker_dir.join("config.toml"),
            auth_dir_override: None,
            callback_timeout_secs: default_callback_timeout_secs(),
            paste_grace_secs: default_paste_grace_secs(),
            refresh_retries: default_refresh_retries(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl Config {
    /// Load config from disk, falling back to defaults when the file is
    /// absent. A present-but-unreadable file is an error; a broken
    /// config must not be silently ignored.
    pub fn load() -> Result<Self> {
        let broker_dir = broker_dir();
        let config_path = broker_dir.join("config.toml");

        let mut config = if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read {}", config_path.display()))?;
            toml::from_str::<Config>(&raw)
                .with_context(|| format!("failed to parse {}", config_path.display()))?
        } else {
            Config::default()
        };

        config.config_path = config_path;
        config.auth_dir = match &config.auth_dir_override {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => broker_dir.join("auth"),
        };
        Ok(config)
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout_secs)
    }

    pub fn paste_grace(&self) -> Duration {
        Duration::from_secs(self.paste_grace_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// `~/.authbroker`, or the current directory as a last resort when the
/// home directory cannot be resolved.
fn broker_dir() -> PathBuf {
    UserDirs::new()
        .map(|dirs| dirs.home_dir().join(".authbroker"))
        .unwrap_or_else(|| PathBuf::from(".authbroker"))
}

// ── Tests ───────────────────────────────────────────────────────────
