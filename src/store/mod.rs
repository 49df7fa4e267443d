//! Durable one-file-per-auth JSON store.
//!
//! Token files are written atomically (temp file + rename, directory
//! fsync on unix) with owner-only permissions: 0600 files inside a 0700
//! directory. The store assumes single-process ownership of the auth
//! directory; there is no cross-process locking.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;

use crate::auth::{Auth, keys};
use crate::error::{AuthError, Result};

/// Abstract durable mapping from auth id to [`Auth`] record.
pub trait TokenStore: Send + Sync {
    /// Enumerate all auth records, sorted by id.
    fn list(&self) -> Result<Vec<Auth>>;
    /// Load one record. `NotFound` if absent, `Corrupt` on parse failure.
    fn load(&self, id: &str) -> Result<Auth>;
    /// Persist a record atomically, stamping `updated_at` (and
    /// `created_at` on first save). Returns the file path.
    fn save(&self, auth: &mut Auth) -> Result<PathBuf>;
    /// Remove a record. Succeeds if the file was already gone.
    fn delete(&self, id: &str) -> Result<()>;
}

/// Filesystem-backed token store rooted at an auth directory.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    base_dir: PathBuf,
}

impl FileTokenStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// The auth directory this store owns.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.base_dir.join(format!("{id}.json")))
    }

    fn ensure_base_dir(&self) -> Result<()> {
        if self.base_dir.is_dir() {
            return Ok(());
        }
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder.create(&self.base_dir)?;
        Ok(())
    }
}

impl TokenStore for FileTokenStore {
    fn list(&self) -> Result<Vec<Auth>> {
        if !self.base_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut auths = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load(id) {
                Ok(auth) => auths.push(auth),
                Err(err) => {
                    // One bad file must not hide the rest of the store.
                    tracing::warn!("skipping unreadable auth file {}: {err}", path.display());
                }
            }
        }
        auths.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(auths)
    }

    fn load(&self, id: &str) -> Result<Auth> {
        let path = self.path_for(id)?;
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(AuthError::NotFound { id: id.to_string() });
            }
            Err(err) => return Err(err.into()),
        };
        let mut auth: Auth = serde_json::from_str(&raw).map_err(|err| AuthError::Corrupt {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        if auth.id.is_empty() {
            auth.id = id.to_string();
        }
        auth.file_name = format!("{id}.json");
        normalize_kiro_record(&mut auth, &path)?;
        // Cache the derived expiry; the manager layers refresh leads on top.
        auth.recompute_schedule(None);
        Ok(auth)
    }

    fn save(&self, auth: &mut Auth) -> Result<PathBuf> {
        let path = self.path_for(&auth.id)?;
        self.ensure_base_dir()?;

        let now = Utc::now();
        auth.updated_at = Some(now);
        if auth.created_at.is_none() {
            auth.created_at = Some(now);
        }
        auth.file_name = format!("{}.json", auth.id);

        let mut body = serde_json::to_string_pretty(auth)?;
        body.push('\n');
        write_atomic(&self.base_dir, &path, body.as_bytes())?;
        Ok(path)
    }

    fn delete(&self, id: &str) -> Result<()> {
        let path = self.path_for(id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Ids become filename leaves; refuse anything that could escape the
/// auth directory.
fn validate_id(id: &str) -> Result<()> {
    if id.is_empty()
        || id == "."
        || id == ".."
        || id.contains('/')
        || id.contains('\\')
        || id.contains("..")
    {
        return Err(AuthError::InvalidInput(format!("invalid auth id `{id}`")));
    }
    Ok(())
}

/// Write-to-temp then rename, fsyncing the file and (on unix) the
/// containing directory so a crash never leaves a torn token file.
fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;

    let mut tmp = tempfile::Builder::new()
        .prefix(".auth-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))?;
    }
    tmp.persist(path).map_err(|err| AuthError::Io(err.error))?;
    #[cfg(unix)]
    {
        std::fs::File::open(dir)?.sync_all()?;
    }
    Ok(())
}

/// Two kiro token-storage schemas circulate; only the richer one (the
/// one carrying `auth_method`) is trusted. The impoverished
/// access/refresh/expiry-only shape is rejected rather than silently
/// accepted, and the legacy `builder-id` spelling is normalized.
fn normalize_kiro_record(auth: &mut Auth, path: &Path) -> Result<()> {
    if auth.provider != "kiro" {
        return Ok(());
    }
    match auth.metadata.get(keys::AUTH_METHOD).and_then(Value::as_str) {
        Some("builder-id") => {
            auth.metadata
                .insert(keys::AUTH_METHOD.to_string(), Value::from("builder_id"));
            Ok(())
        }
        Some(_) => Ok(()),
        None => Err(AuthError::Corrupt {
            path: path.to_path_buf(),
            reason: "kiro record without auth_method (unrecognized token storage schema)".into(),
        }),
    }
}

/// Build the conventional record id for a provider + optional identity:
/// `<provider>-<sanitized identity>`, or just `<provider>` when
/// anonymous.
pub fn record_id(provider: &str, identity: Option<&str>) -> String {
    match identity {
        Some(identity) if !identity.is_empty() => {
            format!("{provider}-{}", crate::auth::sanitize_identity(identity))
        }
        _ => provider.to_string(),
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthStatus;
    use tempfile::TempDir;

    fn sample_auth(id: &str) -> Auth {
        let mut auth = Auth::new("claude", id);
        auth.label = "dev@example.com".into();
        auth.set_meta(keys::ACCESS_TOKEN, "tok-123");
        auth.set_meta(keys::REFRESH_TOKEN, "ref-456");
        auth.set_meta(keys::EXPIRED, "2099-01-01T00:00:00Z");
        auth.attributes
            .insert("email".into(), "dev@example.com".into());
        auth
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = FileTokenStore::new(dir.path());
        let mut auth = sample_auth("claude-dev_example_com");
        let path = store.save(&mut auth).unwrap();
        assert!(path.ends_with("claude-dev_example_com.json"));

        let loaded = store.load("claude-dev_example_com").unwrap();
        assert_eq!(loaded.id, auth.id);
        assert_eq!(loaded.provider, "claude");
        assert_eq!(loaded.access_token(), Some("tok-123"));
        assert_eq!(loaded.label, "dev@example.com");
        assert_eq!(loaded.status, AuthStatus::Active);
        assert!(loaded.token_expires_at().is_some());
        assert_eq!(loaded.file_name, "claude-dev_example_com.json");
    }

    #[test]
    fn saved_file_is_pretty_json_with_trailing_newline() {
        let dir = TempDir::new().unwrap();
        let store = FileTokenStore::new(dir.path());
        let path = store.save(&mut sample_auth("claude-a")).unwrap();
        let raw = std::fs::read_to_string(path).unwrap();
        assert!(raw.ends_with('\n'));
        assert!(raw.contains("  \"type\": \"claude\""));
        assert!(raw.contains("\"access_token\": \"tok-123\""));
    }

    #[cfg(unix)]
    #[test]
    fn files_and_directory_have_restrictive_modes() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("auth");
        let store = FileTokenStore::new(&base);
        let path = store.save(&mut sample_auth("claude-a")).unwrap();

        let dir_mode = std::fs::metadata(&base).unwrap().permissions().mode() & 0o777;
        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
        assert_eq!(file_mode, 0o600);
    }

    #[test]
    fn load_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = FileTokenStore::new(dir.path());
        assert!(matches!(
            store.load("claude-nobody"),
            Err(AuthError::NotFound { .. })
        ));
    }

    #[test]
    fn load_unparseable_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = FileTokenStore::new(dir.path());
        std::fs::write(dir.path().join("claude-bad.json"), "{not json").unwrap();
        assert!(matches!(
            store.load("claude-bad"),
            Err(AuthError::Corrupt { .. })
        ));
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = FileTokenStore::new(dir.path());
        store.save(&mut sample_auth("claude-a")).unwrap();
        store.delete("claude-a").unwrap();
        store.delete("claude-a").unwrap();
        assert!(matches!(
            store.load("claude-a"),
            Err(AuthError::NotFound { .. })
        ));
    }

    #[test]
    fn list_is_sorted_and_skips_leftover_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = FileTokenStore::new(dir.path());
        store.save(&mut sample_auth("codex-b")).unwrap();
        store.save(&mut sample_auth("claude-a")).unwrap();
        // Simulate a crashed writer's leftover temp file.
        std::fs::write(dir.path().join(".auth-crashed.tmp"), "partial").unwrap();

        let listed = store.list().unwrap();
        let ids: Vec<&str> = listed.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["claude-a", "codex-b"]);
    }

    #[test]
    fn list_survives_one_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let store = FileTokenStore::new(dir.path());
        store.save(&mut sample_auth("claude-a")).unwrap();
        std::fs::write(dir.path().join("zz-bad.json"), "{").unwrap();
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn save_sets_created_and_updated_timestamps() {
        let dir = TempDir::new().unwrap();
        let store = FileTokenStore::new(dir.path());
        let mut auth = sample_auth("claude-a");
        assert!(auth.created_at.is_none());
        store.save(&mut auth).unwrap();
        assert!(auth.created_at.is_some());
        assert!(auth.updated_at.is_some());

        let created = auth.created_at;
        store.save(&mut auth).unwrap();
        assert_eq!(auth.created_at, created);
    }

    #[test]
    fn path_escaping_ids_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FileTokenStore::new(dir.path());
        for id in ["../evil", "a/b", "a\\b", "", ".."] {
            let mut auth = sample_auth("x");
            auth.id = id.to_string();
            assert!(store.save(&mut auth).is_err(), "id `{id}` should fail");
        }
    }

    #[test]
    fn kiro_without_auth_method_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FileTokenStore::new(dir.path());
        std::fs::write(
            dir.path().join("kiro-x.json"),
            r#"{"id":"kiro-x","type":"kiro","access_token":"a","refresh_token":"r","expired":"2099-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(matches!(
            store.load("kiro-x"),
            Err(AuthError::Corrupt { .. })
        ));
    }

    #[test]
    fn legacy_builder_id_spelling_is_normalized() {
        let dir = TempDir::new().unwrap();
        let store = FileTokenStore::new(dir.path());
        std::fs::write(
            dir.path().join("kiro-builder-id.json"),
            r#"{"id":"kiro-builder-id","type":"kiro","access_token":"a","auth_method":"builder-id"}"#,
        )
        .unwrap();
        let auth = store.load("kiro-builder-id").unwrap();
        assert_eq!(
            auth.meta_str(keys::AUTH_METHOD).unwrap(),
            Some("builder_id")
        );
    }

    #[test]
    fn record_id_formats() {
        assert_eq!(
            record_id("claude", Some("dev@example.com")),
            "claude-dev_example_com"
        );
        assert_eq!(record_id("antigravity", None), "antigravity");
    }
}
