//! SSH server exposing an interactive command-line session.
//!
//! This module is organized into the following submodules:
//!
//! - `config`: Server configuration with environment variable fallbacks
//! - `error`: Error type and fault classification
//! - `auth`: Authentication gate and credential stores
//! - `host_key`: Host key loading and generation
//! - `registry`: Active connection tracking
//! - `handler`: Interactive handler shapes
//! - `session`: Per-channel session bridge and handler context
//! - `connection`: russh server handler for one connection
//! - `lifecycle`: Start, serve and close

pub mod auth;
pub mod config;
pub(crate) mod connection;
pub mod error;
pub mod handler;
pub mod host_key;
pub mod lifecycle;
pub mod registry;
pub mod session;

pub use config::{ServerConfig, ServerConfigBuilder};
pub use connection::ConnectionInfo;
pub use error::{Error, Result};
pub use handler::{CliHandler, Interact};
pub use lifecycle::{CliServer, ExceptionHandler, RunState, ServerControl};
pub use registry::{ConnectionId, ConnectionSnapshot};
pub use session::{SessionContext, SessionOutput, TerminalSize};
