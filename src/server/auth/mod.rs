//! Authentication for incoming SSH connections.
//!
//! Credentials live behind two traits so the server never owns them:
//!
//! - [`PasswordStore`]: username/password verification
//! - [`KeyStore`]: authorized public keys per user
//!
//! Two implementations of each are bundled: DashMap-backed memory stores
//! ([`MemoryPasswordStore`], [`MemoryKeyStore`]) and, for keys, a directory of
//! `authorized_keys` files ([`AuthorizedKeysDir`]).
//!
//! The [`AuthenticationGate`] applies the configured policy to one connection.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use ssh_cli_server::server::{ServerConfig, auth::{AuthorizedKeysDir, MemoryPasswordStore}};
//!
//! let config = ServerConfig::builder()
//!     .noauth(false)
//!     .password_store(Arc::new(MemoryPasswordStore::new().with_user("admin", "hunter2")))
//!     .key_store(Arc::new(AuthorizedKeysDir::new("/etc/cli-server/keys")))
//!     .build();
//! ```

mod gate;
mod key_dir;
mod memory;
mod traits;

pub use gate::{AuthDecision, AuthenticationGate};
pub use key_dir::{AuthorizedKeysDir, parse_authorized_keys, validate_username};
pub use memory::{MemoryKeyStore, MemoryPasswordStore};
pub use traits::{KeyStore, PasswordStore};
