//! DashMap-backed in-memory credential stores.
//!
//! Useful for embedding and tests. Passwords are kept as given; callers that
//! need hashing should supply their own [`PasswordStore`].

use async_trait::async_trait;
use dashmap::DashMap;
use russh::keys::PublicKey;

use crate::server::error::{Error, Result};

use super::traits::{KeyStore, PasswordStore};

/// In-memory password store.
#[derive(Default)]
pub struct MemoryPasswordStore {
    passwords: DashMap<String, String>,
}

impl MemoryPasswordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a user.
    pub fn with_user(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.set_password(username, password);
        self
    }

    pub fn set_password(&self, username: impl Into<String>, password: impl Into<String>) {
        self.passwords.insert(username.into(), password.into());
    }

    /// Remove a user, returning `true` if it existed.
    pub fn remove_user(&self, username: &str) -> bool {
        self.passwords.remove(username).is_some()
    }

    pub fn has_user(&self, username: &str) -> bool {
        self.passwords.contains_key(username)
    }
}

#[async_trait]
impl PasswordStore for MemoryPasswordStore {
    async fn check_password(&self, username: &str, password: &str) -> bool {
        self.passwords
            .get(username)
            .map(|stored| constant_time_eq(stored.as_bytes(), password.as_bytes()))
            .unwrap_or(false)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// In-memory authorized key store.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: DashMap<String, Vec<PublicKey>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(self, username: impl Into<String>, key: PublicKey) -> Self {
        self.add_key(username, key);
        self
    }

    pub fn add_key(&self, username: impl Into<String>, key: PublicKey) {
        self.keys.entry(username.into()).or_default().push(key);
    }

    /// Remove every key of a user, returning how many were removed.
    pub fn remove_user(&self, username: &str) -> usize {
        self.keys
            .remove(username)
            .map(|(_, keys)| keys.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn authorized_keys(&self, username: &str) -> Result<Vec<PublicKey>> {
        self.keys
            .get(username)
            .map(|keys| keys.clone())
            .ok_or_else(|| Error::UnknownUser(username.to_string()))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::{Algorithm, PrivateKey};

    fn random_public_key() -> PublicKey {
        PrivateKey::random(&mut rand_core::OsRng, Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .clone()
    }

    mod password_store {
        use super::*;

        #[tokio::test]
        async fn test_correct_password() {
            let store = MemoryPasswordStore::new().with_user("foo", "bar");
            assert!(store.check_password("foo", "bar").await);
        }

        #[tokio::test]
        async fn test_wrong_password() {
            let store = MemoryPasswordStore::new().with_user("foo", "bar");
            assert!(!store.check_password("foo", "baz").await);
            assert!(!store.check_password("foo", "").await);
        }

        #[tokio::test]
        async fn test_unknown_user() {
            let store = MemoryPasswordStore::new();
            assert!(!store.check_password("nobody", "").await);
        }

        #[tokio::test]
        async fn test_check_does_not_mutate() {
            let store = MemoryPasswordStore::new().with_user("foo", "bar");
            let _ = store.check_password("foo", "wrong").await;
            let _ = store.check_password("ghost", "bar").await;
            assert!(store.has_user("foo"));
            assert!(!store.has_user("ghost"));
        }

        #[test]
        fn test_remove_user() {
            let store = MemoryPasswordStore::new().with_user("foo", "bar");
            assert!(store.remove_user("foo"));
            assert!(!store.remove_user("foo"));
        }

        #[test]
        fn test_constant_time_eq() {
            assert!(constant_time_eq(b"abc", b"abc"));
            assert!(!constant_time_eq(b"abc", b"abd"));
            assert!(!constant_time_eq(b"abc", b"ab"));
        }
    }

    mod key_store {
        use super::*;

        #[tokio::test]
        async fn test_unknown_user_is_error() {
            let store = MemoryKeyStore::new();
            let result = store.authorized_keys("nobody").await;
            assert_eq!(result.unwrap_err(), Error::UnknownUser("nobody".to_string()));
        }

        #[tokio::test]
        async fn test_keys_accumulate() {
            let store = MemoryKeyStore::new()
                .with_key("alice", random_public_key())
                .with_key("alice", random_public_key());
            assert_eq!(store.authorized_keys("alice").await.unwrap().len(), 2);
        }

        #[test]
        fn test_remove_user() {
            let store = MemoryKeyStore::new().with_key("alice", random_public_key());
            assert_eq!(store.remove_user("alice"), 1);
            assert_eq!(store.remove_user("alice"), 0);
        }
    }
}
