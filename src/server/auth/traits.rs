//! Credential store traits.
//!
//! The server never stores credentials itself. Password checks and
//! authorized-key lookups are delegated to implementations of these traits,
//! injected through [`ServerConfig`](crate::server::ServerConfig).

use async_trait::async_trait;
use russh::keys::PublicKey;

use crate::server::error::Result;

/// Verifies username/password pairs.
///
/// Implementations must be thread-safe (`Send + Sync`); one store is shared by
/// every connection. How passwords are hashed is up to the implementation.
#[async_trait]
pub trait PasswordStore: Send + Sync {
    /// Returns `true` if `password` is valid for `username`.
    ///
    /// Unknown users must yield `false`, never an error. This call must not
    /// mutate the store.
    async fn check_password(&self, username: &str, password: &str) -> bool;

    /// Name used for logging.
    fn name(&self) -> &'static str;
}

/// Looks up the public keys a user may log in with.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Returns the authorized keys of `username`.
    ///
    /// # Errors
    ///
    /// * [`Error::UnknownUser`](crate::server::Error::UnknownUser) if the user has no entry.
    ///   The gate treats this as "no keys installed".
    /// * Any other error if the backing storage failed.
    async fn authorized_keys(&self, username: &str) -> Result<Vec<PublicKey>>;

    /// Name used for logging.
    fn name(&self) -> &'static str;
}
