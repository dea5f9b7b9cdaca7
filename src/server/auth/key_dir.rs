//! Authorized-keys directory store.
//!
//! Each user owns one file named after the username inside the store
//! directory, in OpenSSH `authorized_keys` format: one key per line, blank
//! lines and `#` comments ignored. Files are read on every lookup so keys can
//! be added or revoked without restarting the server.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use russh::keys::PublicKey;
use tracing::warn;

use crate::server::error::{Error, Result};

use super::traits::KeyStore;

pub struct AuthorizedKeysDir {
    dir: PathBuf,
}

impl AuthorizedKeysDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn user_file(&self, username: &str) -> Result<PathBuf> {
        validate_username(username)?;
        Ok(self.dir.join(username))
    }
}

/// Usernames are restricted to ASCII letters, digits and `_`, and may not
/// start with a digit. This keeps them safe to use as file names.
pub fn validate_username(username: &str) -> Result<()> {
    let mut chars = username.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidUsername(username.to_string()))
    }
}

/// Parse `authorized_keys` content, skipping lines that do not decode.
pub fn parse_authorized_keys(content: &str, source: &Path) -> Vec<PublicKey> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match PublicKey::from_openssh(line) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(file = %source.display(), "Skipping unreadable public key: {}", e);
                None
            }
        })
        .collect()
}

#[async_trait]
impl KeyStore for AuthorizedKeysDir {
    async fn authorized_keys(&self, username: &str) -> Result<Vec<PublicKey>> {
        let path = self.user_file(username)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(parse_authorized_keys(&content, &path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::UnknownUser(username.to_string()))
            }
            Err(e) => Err(Error::KeyStore(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "authorized_keys_dir"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::{Algorithm, PrivateKey};

    fn openssh_line() -> (PublicKey, String) {
        let key = PrivateKey::random(&mut rand_core::OsRng, Algorithm::Ed25519).unwrap();
        let public = key.public_key().clone();
        let line = public.to_openssh().unwrap();
        (public, line)
    }

    mod usernames {
        use super::*;

        #[test]
        fn test_valid_usernames() {
            assert!(validate_username("alice").is_ok());
            assert!(validate_username("_svc").is_ok());
            assert!(validate_username("user_42").is_ok());
        }

        #[test]
        fn test_invalid_usernames() {
            assert!(validate_username("").is_err());
            assert!(validate_username("42user").is_err());
            assert!(validate_username("../etc").is_err());
            assert!(validate_username("a b").is_err());
            assert!(validate_username("bob.smith").is_err());
        }
    }

    mod parsing {
        use super::*;

        #[test]
        fn test_skips_comments_and_blank_lines() {
            let (public, line) = openssh_line();
            let content = format!("# comment\n\n{}\n   \n", line);
            let keys = parse_authorized_keys(&content, Path::new("test"));
            assert_eq!(keys.len(), 1);
            assert_eq!(keys[0].key_data(), public.key_data());
        }

        #[test]
        fn test_skips_garbage() {
            let (_, line) = openssh_line();
            let content = format!("ssh-ed25519 not-base64\n{}\n", line);
            let keys = parse_authorized_keys(&content, Path::new("test"));
            assert_eq!(keys.len(), 1);
        }
    }

    mod store {
        use super::*;

        #[tokio::test]
        async fn test_reads_user_file() {
            let dir = tempfile::tempdir().unwrap();
            let (public, line) = openssh_line();
            std::fs::write(dir.path().join("alice"), format!("{}\n", line)).unwrap();

            let store = AuthorizedKeysDir::new(dir.path());
            let keys = store.authorized_keys("alice").await.unwrap();
            assert_eq!(keys.len(), 1);
            assert_eq!(keys[0].key_data(), public.key_data());
        }

        #[tokio::test]
        async fn test_missing_file_is_unknown_user() {
            let dir = tempfile::tempdir().unwrap();
            let store = AuthorizedKeysDir::new(dir.path());
            assert_eq!(
                store.authorized_keys("bob").await.unwrap_err(),
                Error::UnknownUser("bob".to_string())
            );
        }

        #[tokio::test]
        async fn test_rejects_path_traversal() {
            let dir = tempfile::tempdir().unwrap();
            let store = AuthorizedKeysDir::new(dir.path());
            assert!(matches!(
                store.authorized_keys("../secret").await,
                Err(Error::InvalidUsername(_))
            ));
        }
    }
}
