//! Server configuration.
//!
//! [`ServerConfig`] is immutable once built. Every value is resolved with a
//! three-tier priority:
//!
//! 1. **Builder** - value set explicitly on [`ServerConfigBuilder`] (highest priority)
//! 2. **Environment Variable** - value read from the environment
//! 3. **Default** - built-in default (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `CLI_SERVER_PORT` | 8822 | Listen port |
//! | `CLI_SERVER_BIND` | 0.0.0.0 | Bind address |
//! | `CLI_SERVER_MAX_CONNECTIONS` | unlimited | Admission cap |
//! | `CLI_SERVER_HOST_KEY` | `~/.ssh_cli_server/server_host_key` | Host key file |
//! | `CLI_SERVER_NOAUTH` | true | Allow logins without authentication |
//! | `CLI_SERVER_START_TIMEOUT_MS` | 5000ms | Thread-mode start timeout |

use std::env;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::{MethodKind, MethodSet};

use super::auth::{KeyStore, PasswordStore};

/// Default listen port
pub(crate) const DEFAULT_PORT: u16 = 8822;

/// Default bind address (all IPv4 interfaces)
pub(crate) const DEFAULT_BIND_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// Default thread-mode start timeout in milliseconds
pub(crate) const DEFAULT_START_TIMEOUT_MS: u64 = 5000;

/// How long shutdown waits for connections and sessions to wind down
pub(crate) const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Directory under the user's home holding server state
pub(crate) const CONFIG_DIR_NAME: &str = ".ssh_cli_server";

/// File name of the host key inside [`CONFIG_DIR_NAME`]
pub(crate) const HOST_KEY_FILE_NAME: &str = "server_host_key";

pub(crate) const PORT_ENV_VAR: &str = "CLI_SERVER_PORT";
pub(crate) const BIND_ENV_VAR: &str = "CLI_SERVER_BIND";
pub(crate) const MAX_CONNECTIONS_ENV_VAR: &str = "CLI_SERVER_MAX_CONNECTIONS";
pub(crate) const HOST_KEY_ENV_VAR: &str = "CLI_SERVER_HOST_KEY";
pub(crate) const NOAUTH_ENV_VAR: &str = "CLI_SERVER_NOAUTH";
pub(crate) const START_TIMEOUT_ENV_VAR: &str = "CLI_SERVER_START_TIMEOUT_MS";

/// Resolve the listen port with priority: parameter -> env var -> default
pub(crate) fn resolve_port(port_param: Option<u16>) -> u16 {
    if let Some(port) = port_param {
        return port;
    }

    if let Ok(env_port) = env::var(PORT_ENV_VAR)
        && let Ok(port) = env_port.parse::<u16>()
    {
        return port;
    }

    DEFAULT_PORT
}

/// Resolve the bind address with priority: parameter -> env var -> default
pub(crate) fn resolve_bind_address(bind_param: Option<IpAddr>) -> IpAddr {
    if let Some(addr) = bind_param {
        return addr;
    }

    if let Ok(env_addr) = env::var(BIND_ENV_VAR)
        && let Ok(addr) = env_addr.parse::<IpAddr>()
    {
        return addr;
    }

    DEFAULT_BIND_ADDRESS
}

/// Resolve the admission cap with priority: parameter -> env var -> none
///
/// `Some(None)` is an explicit "no cap" and ignores the env var.
pub(crate) fn resolve_max_connections(max_param: Option<Option<usize>>) -> Option<usize> {
    if let Some(max) = max_param {
        return max;
    }

    env::var(MAX_CONNECTIONS_ENV_VAR)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
}

/// Resolve the host key path with priority: parameter -> env var -> home directory
pub(crate) fn resolve_host_key_path(path_param: Option<PathBuf>) -> PathBuf {
    if let Some(path) = path_param {
        return path;
    }

    if let Ok(env_path) = env::var(HOST_KEY_ENV_VAR)
        && !env_path.is_empty()
    {
        return PathBuf::from(env_path);
    }

    default_config_dir().join(HOST_KEY_FILE_NAME)
}

/// Resolve the no-auth flag with priority: parameter -> env var -> default (true)
pub(crate) fn resolve_noauth(noauth_param: Option<bool>) -> bool {
    if let Some(noauth) = noauth_param {
        return noauth;
    }

    if let Ok(env_noauth) = env::var(NOAUTH_ENV_VAR) {
        return parse_bool(&env_noauth).unwrap_or(true);
    }

    true
}

/// Resolve the thread-mode start timeout with priority: parameter -> env var -> default
pub(crate) fn resolve_start_timeout(timeout_param: Option<Duration>) -> Duration {
    if let Some(timeout) = timeout_param {
        return timeout;
    }

    if let Ok(env_timeout) = env::var(START_TIMEOUT_ENV_VAR)
        && let Ok(ms) = env_timeout.parse::<u64>()
    {
        return Duration::from_millis(ms);
    }

    Duration::from_millis(DEFAULT_START_TIMEOUT_MS)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
}

/// Immutable server configuration.
///
/// Authentication precedence is fixed: no-auth (if enabled) admits everyone,
/// otherwise public-key is tried if enabled, then password if enabled.
#[derive(Clone)]
pub struct ServerConfig {
    bind_address: IpAddr,
    port: u16,
    max_connections: Option<usize>,
    enable_noauth: bool,
    enable_passwords: bool,
    enable_keys: bool,
    password_store: Option<Arc<dyn PasswordStore>>,
    key_store: Option<Arc<dyn KeyStore>>,
    host_key_path: PathBuf,
    start_timeout: Duration,
    drain_timeout: Duration,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Configuration resolved entirely from the environment and defaults.
    pub fn from_env() -> Self {
        Self::builder().build()
    }

    pub fn bind_address(&self) -> IpAddr {
        self.bind_address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn max_connections(&self) -> Option<usize> {
        self.max_connections
    }

    pub fn noauth_enabled(&self) -> bool {
        self.enable_noauth
    }

    pub fn passwords_enabled(&self) -> bool {
        self.enable_passwords
    }

    pub fn keys_enabled(&self) -> bool {
        self.enable_keys
    }

    pub fn password_store(&self) -> Option<&Arc<dyn PasswordStore>> {
        self.password_store.as_ref()
    }

    pub fn key_store(&self) -> Option<&Arc<dyn KeyStore>> {
        self.key_store.as_ref()
    }

    pub fn host_key_path(&self) -> &PathBuf {
        &self.host_key_path
    }

    pub fn start_timeout(&self) -> Duration {
        self.start_timeout
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Authentication methods advertised to clients, in precedence order.
    pub(crate) fn auth_methods(&self) -> MethodSet {
        MethodSet::from(&self.auth_method_kinds()[..])
    }

    fn auth_method_kinds(&self) -> Vec<MethodKind> {
        let mut methods = Vec::with_capacity(3);
        if self.enable_noauth {
            methods.push(MethodKind::None);
        }
        if self.enable_keys {
            methods.push(MethodKind::PublicKey);
        }
        if self.enable_passwords {
            methods.push(MethodKind::Password);
        }
        methods
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_address", &self.bind_address)
            .field("port", &self.port)
            .field("max_connections", &self.max_connections)
            .field("enable_noauth", &self.enable_noauth)
            .field("enable_passwords", &self.enable_passwords)
            .field("enable_keys", &self.enable_keys)
            .field("password_store", &self.password_store.as_ref().map(|s| s.name()))
            .field("key_store", &self.key_store.as_ref().map(|s| s.name()))
            .field("host_key_path", &self.host_key_path)
            .field("start_timeout", &self.start_timeout)
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}

/// Builder for [`ServerConfig`].
///
/// Unset values fall back to the environment, then to defaults, when
/// [`build`](ServerConfigBuilder::build) is called.
#[derive(Default)]
pub struct ServerConfigBuilder {
    bind_address: Option<IpAddr>,
    port: Option<u16>,
    max_connections: Option<Option<usize>>,
    enable_noauth: Option<bool>,
    enable_passwords: Option<bool>,
    enable_keys: Option<bool>,
    password_store: Option<Arc<dyn PasswordStore>>,
    key_store: Option<Arc<dyn KeyStore>>,
    host_key_path: Option<PathBuf>,
    start_timeout: Option<Duration>,
    drain_timeout: Option<Duration>,
}

impl ServerConfigBuilder {
    pub fn bind_address(mut self, addr: IpAddr) -> Self {
        self.bind_address = Some(addr);
        self
    }

    /// Port to listen on. `0` asks the OS for a free port; see
    /// [`CliServer::local_addr`](crate::server::CliServer::local_addr).
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(Some(max));
        self
    }

    /// Admit any number of connections, regardless of the environment.
    pub fn unlimited_connections(mut self) -> Self {
        self.max_connections = Some(None);
        self
    }

    pub fn noauth(mut self, enabled: bool) -> Self {
        self.enable_noauth = Some(enabled);
        self
    }

    pub fn passwords(mut self, enabled: bool) -> Self {
        self.enable_passwords = Some(enabled);
        self
    }

    pub fn keys(mut self, enabled: bool) -> Self {
        self.enable_keys = Some(enabled);
        self
    }

    /// Set the password store. Password authentication is enabled unless
    /// [`passwords(false)`](Self::passwords) is set explicitly.
    pub fn password_store(mut self, store: Arc<dyn PasswordStore>) -> Self {
        self.password_store = Some(store);
        self
    }

    /// Set the key store. Public-key authentication is enabled unless
    /// [`keys(false)`](Self::keys) is set explicitly.
    pub fn key_store(mut self, store: Arc<dyn KeyStore>) -> Self {
        self.key_store = Some(store);
        self
    }

    pub fn host_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_key_path = Some(path.into());
        self
    }

    pub fn start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = Some(timeout);
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> ServerConfig {
        let enable_passwords = self
            .enable_passwords
            .unwrap_or(self.password_store.is_some());
        let enable_keys = self.enable_keys.unwrap_or(self.key_store.is_some());

        ServerConfig {
            bind_address: resolve_bind_address(self.bind_address),
            port: resolve_port(self.port),
            max_connections: resolve_max_connections(self.max_connections),
            enable_noauth: resolve_noauth(self.enable_noauth),
            enable_passwords,
            enable_keys,
            password_store: self.password_store,
            key_store: self.key_store,
            host_key_path: resolve_host_key_path(self.host_key_path),
            start_timeout: resolve_start_timeout(self.start_timeout),
            drain_timeout: self.drain_timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT),
        }
    }
}
