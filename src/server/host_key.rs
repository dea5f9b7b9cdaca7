//! Server host key loading.
//!
//! The host key is the server's long-term identity. It is read from the
//! configured path; if the file is missing or cannot be decoded a fresh
//! Ed25519 key is generated and written back (owner read/write only) so the
//! next start presents the same identity.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use russh::keys::ssh_key::LineEnding;
use russh::keys::{self, Algorithm, PrivateKey};
use tracing::{info, warn};

use crate::server::error::{Error, Result};

pub struct HostKeyProvider {
    path: PathBuf,
}

impl HostKeyProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the host key, generating and persisting one if needed.
    ///
    /// Failure to persist a generated key is logged; the key is still used
    /// for this run.
    pub fn load_or_generate(&self) -> Result<PrivateKey> {
        if self.path.exists() {
            match keys::load_secret_key(&self.path, None) {
                Ok(key) => {
                    info!(path = %self.path.display(), "Loaded host key ({})", key.algorithm());
                    return Ok(key);
                }
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        "Host key unreadable, generating a new one: {}", e
                    );
                }
            }
        }

        let key = PrivateKey::random(&mut rand_core::OsRng, Algorithm::Ed25519)
            .map_err(|e| self.error(format!("failed to generate key: {e}")))?;

        match self.persist(&key) {
            Ok(()) => info!(path = %self.path.display(), "Generated new host key"),
            Err(e) => warn!(path = %self.path.display(), "Failed to save host key: {}", e),
        }

        Ok(key)
    }

    fn persist(&self, key: &PrivateKey) -> Result<()> {
        let encoded = key
            .to_openssh(LineEnding::LF)
            .map_err(|e| self.error(format!("failed to encode key: {e}")))?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&self.path)?;
        file.write_all(encoded.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    fn error(&self, reason: String) -> Error {
        Error::HostKey {
            path: self.path.display().to_string(),
            reason,
        }
    }
}
