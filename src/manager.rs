//! Central dispatch for login, refresh, and persistence.
//!
//! The manager owns the one [`FileTokenStore`] bound to the configured
//! auth directory plus the authenticator registry, and is the only
//! place that stitches the two together: every record that leaves a
//! login or refresh flow passes through here to get its schedule
//! computed and be saved atomically.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::Auth;
use crate::config::Config;
use crate::error::{AuthError, Result};
use crate::providers::{Authenticator, LoginOptions, build_registry};
use crate::store::{FileTokenStore, TokenStore};

pub struct AuthManager {
    config: Config,
    store: FileTokenStore,
    registry: BTreeMap<&'static str, Arc<dyn Authenticator>>,
}

impl AuthManager {
    /// Standard construction: store bound to the configured auth dir,
    /// full provider registry.
    pub fn new(config: Config) -> Self {
        let store = FileTokenStore::new(&config.auth_dir);
        Self {
            config,
            store,
            registry: build_registry(),
        }
    }

    /// Construction with explicit parts, for tests and embedders that
    /// need to swap endpoints or stores.
    pub fn with_parts(
        config: Config,
        store: FileTokenStore,
        registry: BTreeMap<&'static str, Arc<dyn Authenticator>>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
        }
    }

    pub fn store(&self) -> &FileTokenStore {
        &self.store
    }

    fn authenticator(&self, provider: &str) -> Result<&Arc<dyn Authenticator>> {
        self.registry
            .get(provider)
            .ok_or_else(|| AuthError::UnknownProvider(provider.to_string()))
    }

    /// The provider's refresh lead, when it has one.
    pub fn refresh_lead(&self, provider: &str) -> Option<Duration> {
        self.registry
            .get(provider)
            .and_then(|authenticator| authenticator.refresh_lead())
    }

    // ── Operations ──────────────────────────────────────────────────

    /// Interactive login: dispatch, compute the refresh schedule, save.
    pub async fn login(&self, provider: &str, opts: &LoginOptions) -> Result<(Auth, PathBuf)> {
        let authenticator = self.authenticator(provider)?;
        let mut auth = authenticator.login(&self.config, opts).await?;
        auth.recompute_schedule(authenticator.refresh_lead());
        let path = self.store.save(&mut auth)?;
        tracing::info!("saved {} credential as {}", provider, auth.id);
        Ok((auth, path))
    }

    /// Import from a peer CLI's store, when the provider supports it.
    pub async fn import(&self, provider: &str) -> Result<Option<(Auth, PathBuf)>> {
        let authenticator = self.authenticator(provider)?;
        let Some(mut auth) = authenticator.import(&self.config).await? else {
            return Ok(None);
        };
        auth.recompute_schedule(authenticator.refresh_lead());
        let path = self.store.save(&mut auth)?;
        tracing::info!("imported {} credential as {}", provider, auth.id);
        Ok(Some((auth, path)))
    }

    /// Persist a record built elsewhere (importers, migrations).
    pub fn save_auth(&self, auth: &mut Auth) -> Result<PathBuf> {
        auth.recompute_schedule(self.refresh_lead(&auth.provider));
        self.store.save(auth)
    }

    /// Refresh a record through its provider, with bounded retries and
    /// linear backoff, then persist the replacement atomically.
    ///
    /// Concurrent refreshes of the same id are the caller's bug; of
    /// different ids, fine.
    pub async fn refresh(&self, auth: &Auth) -> Result<Auth> {
        let authenticator = self.authenticator(&auth.provider)?;
        let attempts = self.config.refresh_retries.max(1);

        let mut last_error = None;
        for attempt in 1..=attempts {
            match authenticator.refresh(&self.config, auth).await {
                Ok(mut updated) => {
                    crate::providers::common::stamp_refresh(&mut updated);
                    updated.recompute_schedule(authenticator.refresh_lead());
                    self.store.save(&mut updated)?;
                    tracing::info!("refreshed {} ({})", updated.id, updated.provider);
                    return Ok(updated);
                }
                Err(err) if err.is_retryable() && attempt < attempts => {
                    tracing::warn!(
                        "refresh attempt {attempt}/{attempts} for {} failed: {err}",
                        auth.id
                    );
                    tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error.unwrap_or(AuthError::Timeout))
    }

    /// All stored records, with per-provider schedules applied.
    pub fn list(&self) -> Result<Vec<Auth>> {
        let mut auths = self.store.list()?;
        for auth in &mut auths {
            auth.recompute_schedule(self.refresh_lead(&auth.provider));
        }
        Ok(auths)
    }

    /// One stored record, with its schedule applied.
    pub fn load(&self, id: &str) -> Result<Auth> {
        let mut auth = self.store.load(id)?;
        auth.recompute_schedule(self.refresh_lead(&auth.provider));
        Ok(auth)
    }

    /// Remove one record.
    pub fn remove(&self, id: &str) -> Result<()> {
        self.store.delete(id)
    }

    /// Delete records that are expired and have no way back: no stored
    /// refresh token, or a provider that never refreshes. Returns the
    /// removed ids.
    pub fn cleanup(&self) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for auth in self.list()? {
            let unrefreshable =
                auth.refresh_token().is_none() || self.refresh_lead(&auth.provider).is_none();
            if auth.is_expired() && unrefreshable {
                self.store.delete(&auth.id)?;
                tracing::info!("cleaned up expired credential {}", auth.id);
                removed.push(auth.id);
            }
        }
        Ok(removed)
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::keys;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Stub provider whose refresh fails a configurable number of
    /// times before succeeding.
    struct FlakyProvider {
        failures_before_success: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Authenticator for FlakyProvider {
        fn provider(&self) -> &'static str {
            "flaky"
        }
        fn refresh_lead(&self) -> Option<Duration> {
            Some(Duration::from_secs(300))
        }
        async fn login(&self, _config: &Config, _opts: &LoginOptions) -> Result<Auth> {
            let mut auth = Auth::new("flaky", "flaky-user");
            auth.set_meta(keys::ACCESS_TOKEN, "login-token");
            auth.set_meta(keys::EXPIRED, "2099-01-01T00:00:00Z");
            Ok(auth)
        }
        async fn refresh(&self, _config: &Config, auth: &Auth) -> Result<Auth> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                return Err(AuthError::TokenExchangeFailed {
                    status: 503,
                    body: "upstream flaked".into(),
                });
            }
            let mut updated = auth.clone();
            updated.set_meta(keys::ACCESS_TOKEN, "refreshed-token");
            updated.set_meta(keys::EXPIRED, "2099-06-01T00:00:00Z");
            Ok(updated)
        }
    }

    fn manager_with_flaky(dir: &TempDir, failures: u32) -> AuthManager {
        let mut registry: BTreeMap<&'static str, Arc<dyn Authenticator>> = BTreeMap::new();
        registry.insert(
            "flaky",
            Arc::new(FlakyProvider {
                failures_before_success: failures,
                calls: AtomicU32::new(0),
            }),
        );
        AuthManager::with_parts(
            Config::default(),
            FileTokenStore::new(dir.path()),
            registry,
        )
    }

    #[tokio::test]
    async fn login_persists_and_schedules() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with_flaky(&dir, 0);
        let opts = LoginOptions::default();

        let (auth, path) = manager.login("flaky", &opts).await.unwrap();
        assert!(path.is_file());
        let next = auth.next_refresh_after.expect("schedule computed");
        let at = auth.token_expires_at().expect("expiry derived");
        assert_eq!(next + chrono::Duration::seconds(300), at);

        let loaded = manager.load("flaky-user").unwrap();
        assert_eq!(loaded.access_token(), Some("login-token"));
        assert!(loaded.next_refresh_after.is_some());
    }

    #[tokio::test]
    async fn unknown_provider_is_a_typed_error() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with_flaky(&dir, 0);
        let err = manager
            .login("nope", &LoginOptions::default())
            .await
            .expect_err("unknown provider must fail");
        assert!(matches!(err, AuthError::UnknownProvider(_)));
    }

    #[tokio::test]
    async fn refresh_retries_transient_failures_then_saves() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with_flaky(&dir, 1);
        let (auth, _) = manager.login("flaky", &LoginOptions::default()).await.unwrap();

        let refreshed = manager.refresh(&auth).await.unwrap();
        assert_eq!(refreshed.access_token(), Some("refreshed-token"));
        assert!(refreshed.last_refreshed_at.is_some());
        assert!(refreshed.meta_str(keys::LAST_REFRESH).unwrap().is_some());

        // The replacement is what the store now holds.
        let loaded = manager.load("flaky-user").unwrap();
        assert_eq!(loaded.access_token(), Some("refreshed-token"));
    }

    #[tokio::test]
    async fn refresh_surfaces_last_error_when_exhausted() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.refresh_retries = 2;
        let mut registry: BTreeMap<&'static str, Arc<dyn Authenticator>> = BTreeMap::new();
        registry.insert(
            "flaky",
            Arc::new(FlakyProvider {
                failures_before_success: 10,
                calls: AtomicU32::new(0),
            }),
        );
        let manager =
            AuthManager::with_parts(config, FileTokenStore::new(dir.path()), registry);

        let (auth, _) = manager.login("flaky", &LoginOptions::default()).await.unwrap();
        let err = manager
            .refresh(&auth)
            .await
            .expect_err("exhausted retries must fail");
        assert!(matches!(err, AuthError::TokenExchangeFailed { .. }));
    }

    #[tokio::test]
    async fn cleanup_removes_expired_unrefreshable_records() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with_flaky(&dir, 0);

        // Expired with no refresh token: swept.
        let mut dead = Auth::new("flaky", "flaky-dead");
        dead.set_meta(keys::ACCESS_TOKEN, "stale");
        dead.set_meta(keys::EXPIRED, "2000-01-01T00:00:00Z");
        manager.save_auth(&mut dead).unwrap();

        // Expired but refreshable: kept.
        let mut refreshable = Auth::new("flaky", "flaky-alive");
        refreshable.set_meta(keys::ACCESS_TOKEN, "stale");
        refreshable.set_meta(keys::REFRESH_TOKEN, "r");
        refreshable.set_meta(keys::EXPIRED, "2000-01-01T00:00:00Z");
        manager.save_auth(&mut refreshable).unwrap();

        let removed = manager.cleanup().unwrap();
        assert_eq!(removed, vec!["flaky-dead".to_string()]);
        assert!(manager.load("flaky-alive").is_ok());
        assert!(matches!(
            manager.load("flaky-dead"),
            Err(AuthError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn full_registry_resolves_all_real_providers() {
        let dir = TempDir::new().unwrap();
        let manager = AuthManager::with_parts(
            Config::default(),
            FileTokenStore::new(dir.path()),
            build_registry(),
        );
        for key in crate::providers::PROVIDER_KEYS {
            assert!(
                manager.authenticator(key).is_ok(),
                "provider `{key}` should resolve"
            );
        }
    }
}
