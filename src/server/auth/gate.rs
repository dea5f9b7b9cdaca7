//! Per-connection authentication policy.
//!
//! The gate answers the three questions russh asks during the handshake:
//!
//! - **begin auth**: decide whether this user needs credentials at all and,
//!   when key authentication is enabled, install the user's authorized keys.
//! - **password offered / valid**: delegate to the [`PasswordStore`].
//! - **public key acceptable**: compare against the installed keys. Signature
//!   verification is done by russh before it asks.
//!
//! Precedence is fixed: no-auth bypasses every check, then public-key, then
//! password.

use std::sync::Arc;

use russh::keys::PublicKey;
use tracing::{debug, warn};

use crate::server::config::ServerConfig;
use crate::server::error::Error;

/// Outcome of [`AuthenticationGate::begin_auth`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    /// The user is admitted without credentials.
    NoAuthRequired,
    /// The user must authenticate with one of the enabled methods.
    CredentialsRequired,
}

pub struct AuthenticationGate {
    config: Arc<ServerConfig>,
    username: Option<String>,
    authorized_keys: Vec<PublicKey>,
}

impl AuthenticationGate {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            config,
            username: None,
            authorized_keys: Vec::new(),
        }
    }

    /// Username passed to the most recent [`begin_auth`](Self::begin_auth).
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Keys installed for the current user.
    pub fn authorized_keys(&self) -> &[PublicKey] {
        &self.authorized_keys
    }

    /// Start authentication for `username`.
    ///
    /// With key authentication enabled the user's keys are fetched from the
    /// key store. A user unknown to the store simply gets no keys; other
    /// store failures are logged and treated the same way so the connection
    /// is not torn down.
    pub async fn begin_auth(&mut self, username: &str) -> AuthDecision {
        self.username = Some(username.to_string());
        self.authorized_keys.clear();

        if self.config.noauth_enabled() {
            debug!(user = username, "No authentication required");
            return AuthDecision::NoAuthRequired;
        }

        if self.config.keys_enabled()
            && let Some(store) = self.config.key_store()
        {
            match store.authorized_keys(username).await {
                Ok(keys) => {
                    debug!(
                        user = username,
                        store = store.name(),
                        "Installed {} authorized key(s)",
                        keys.len()
                    );
                    self.authorized_keys = keys;
                }
                Err(Error::UnknownUser(_)) | Err(Error::InvalidUsername(_)) => {
                    debug!(user = username, "User has no authorized keys");
                }
                Err(e) => {
                    warn!(user = username, store = store.name(), "Key lookup failed: {}", e);
                }
            }
        }

        AuthDecision::CredentialsRequired
    }

    /// Run [`begin_auth`](Self::begin_auth) unless it already ran for this user.
    pub async fn ensure_begun(&mut self, username: &str) -> AuthDecision {
        if self.username.as_deref() == Some(username) {
            if self.config.noauth_enabled() {
                return AuthDecision::NoAuthRequired;
            }
            return AuthDecision::CredentialsRequired;
        }
        self.begin_auth(username).await
    }

    pub fn password_auth_supported(&self) -> bool {
        self.config.passwords_enabled()
    }

    pub fn public_key_auth_supported(&self) -> bool {
        self.config.keys_enabled()
    }

    /// Check a password against the password store.
    ///
    /// Returns `false` when password authentication is disabled or no store
    /// is configured.
    pub async fn validate_password(&self, username: &str, password: &str) -> bool {
        if !self.password_auth_supported() {
            return false;
        }
        match self.config.password_store() {
            Some(store) => store.check_password(username, password).await,
            None => false,
        }
    }

    /// Check whether `key` is among the keys installed for `username`.
    ///
    /// Comments are ignored; only the key material is compared.
    pub fn validate_public_key(&self, username: &str, key: &PublicKey) -> bool {
        if !self.public_key_auth_supported() || self.username.as_deref() != Some(username) {
            return false;
        }
        self.authorized_keys
            .iter()
            .any(|installed| installed.key_data() == key.key_data())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use russh::keys::{Algorithm, PrivateKey};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::server::auth::{KeyStore, MemoryKeyStore, MemoryPasswordStore, PasswordStore};
    use crate::server::error::Result;

    fn random_public_key() -> PublicKey {
        PrivateKey::random(&mut rand_core::OsRng, Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .clone()
    }

    /// Password store that counts lookups.
    struct CountingPasswordStore {
        inner: MemoryPasswordStore,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PasswordStore for CountingPasswordStore {
        async fn check_password(&self, username: &str, password: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.check_password(username, password).await
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    struct FailingKeyStore;

    #[async_trait]
    impl KeyStore for FailingKeyStore {
        async fn authorized_keys(&self, _username: &str) -> Result<Vec<PublicKey>> {
            Err(Error::KeyStore("disk on fire".to_string()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn gate(config: ServerConfig) -> AuthenticationGate {
        AuthenticationGate::new(Arc::new(config))
    }

    mod noauth {
        use super::*;

        #[tokio::test]
        async fn test_any_username_accepted_without_lookup() {
            let store = Arc::new(CountingPasswordStore {
                inner: MemoryPasswordStore::new(),
                calls: AtomicUsize::new(0),
            });
            let mut gate = gate(
                ServerConfig::builder()
                    .port(0)
                    .noauth(true)
                    .keys(false)
                    .passwords(false)
                    .password_store(store.clone())
                    .build(),
            );

            assert_eq!(gate.begin_auth("anyone").await, AuthDecision::NoAuthRequired);
            assert_eq!(gate.begin_auth("someone_else").await, AuthDecision::NoAuthRequired);
            assert_eq!(store.calls.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn test_noauth_skips_key_store() {
            let key = random_public_key();
            let mut gate = gate(
                ServerConfig::builder()
                    .port(0)
                    .noauth(true)
                    .key_store(Arc::new(MemoryKeyStore::new().with_key("alice", key)))
                    .build(),
            );
            assert_eq!(gate.begin_auth("alice").await, AuthDecision::NoAuthRequired);
            assert!(gate.authorized_keys().is_empty());
        }
    }

    mod password {
        use super::*;

        fn password_only() -> AuthenticationGate {
            gate(
                ServerConfig::builder()
                    .port(0)
                    .noauth(false)
                    .keys(false)
                    .password_store(Arc::new(MemoryPasswordStore::new().with_user("foo", "bar")))
                    .build(),
            )
        }

        #[tokio::test]
        async fn test_correct_password_accepted() {
            let mut gate = password_only();
            assert_eq!(gate.begin_auth("foo").await, AuthDecision::CredentialsRequired);
            assert!(gate.password_auth_supported());
            assert!(gate.validate_password("foo", "bar").await);
        }

        #[tokio::test]
        async fn test_wrong_password_rejected() {
            let mut gate = password_only();
            gate.begin_auth("foo").await;
            assert!(!gate.validate_password("foo", "").await);
            assert!(!gate.validate_password("test", "bar").await);
        }

        #[tokio::test]
        async fn test_disabled_passwords_never_validate() {
            let gate = gate(
                ServerConfig::builder()
                    .port(0)
                    .noauth(false)
                    .password_store(Arc::new(MemoryPasswordStore::new().with_user("foo", "bar")))
                    .passwords(false)
                    .build(),
            );
            assert!(!gate.password_auth_supported());
            assert!(!gate.validate_password("foo", "bar").await);
        }

        #[tokio::test]
        async fn test_enabled_without_store_rejects() {
            let gate = gate(
                ServerConfig::builder()
                    .port(0)
                    .noauth(false)
                    .passwords(true)
                    .build(),
            );
            assert!(!gate.validate_password("foo", "bar").await);
        }
    }

    mod public_key {
        use super::*;

        #[tokio::test]
        async fn test_installed_key_accepted() {
            let key = random_public_key();
            let mut gate = gate(
                ServerConfig::builder()
                    .port(0)
                    .noauth(false)
                    .key_store(Arc::new(MemoryKeyStore::new().with_key("alice", key.clone())))
                    .build(),
            );
            assert_eq!(gate.begin_auth("alice").await, AuthDecision::CredentialsRequired);
            assert_eq!(gate.authorized_keys().len(), 1);
            assert!(gate.validate_public_key("alice", &key));
        }

        #[tokio::test]
        async fn test_other_key_rejected() {
            let mut gate = gate(
                ServerConfig::builder()
                    .port(0)
                    .noauth(false)
                    .key_store(Arc::new(
                        MemoryKeyStore::new().with_key("alice", random_public_key()),
                    ))
                    .build(),
            );
            gate.begin_auth("alice").await;
            assert!(!gate.validate_public_key("alice", &random_public_key()));
        }

        #[tokio::test]
        async fn test_key_bound_to_username() {
            let key = random_public_key();
            let mut gate = gate(
                ServerConfig::builder()
                    .port(0)
                    .noauth(false)
                    .key_store(Arc::new(MemoryKeyStore::new().with_key("alice", key.clone())))
                    .build(),
            );
            gate.begin_auth("alice").await;
            assert!(!gate.validate_public_key("mallory", &key));
        }

        #[tokio::test]
        async fn test_unknown_user_installs_no_keys() {
            let mut gate = gate(
                ServerConfig::builder()
                    .port(0)
                    .noauth(false)
                    .key_store(Arc::new(MemoryKeyStore::new()))
                    .build(),
            );
            assert_eq!(gate.begin_auth("ghost").await, AuthDecision::CredentialsRequired);
            assert!(gate.authorized_keys().is_empty());
        }

        #[tokio::test]
        async fn test_store_failure_does_not_abort() {
            let mut gate = gate(
                ServerConfig::builder()
                    .port(0)
                    .noauth(false)
                    .key_store(Arc::new(FailingKeyStore))
                    .build(),
            );
            assert_eq!(gate.begin_auth("alice").await, AuthDecision::CredentialsRequired);
            assert!(gate.authorized_keys().is_empty());
        }

        #[tokio::test]
        async fn test_ensure_begun_reloads_for_new_user() {
            let key = random_public_key();
            let mut gate = gate(
                ServerConfig::builder()
                    .port(0)
                    .noauth(false)
                    .key_store(Arc::new(MemoryKeyStore::new().with_key("bob", key.clone())))
                    .build(),
            );
            gate.begin_auth("alice").await;
            assert!(gate.authorized_keys().is_empty());

            gate.ensure_begun("bob").await;
            assert_eq!(gate.username(), Some("bob"));
            assert!(gate.validate_public_key("bob", &key));
        }
    }
}
