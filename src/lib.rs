//! Interactive command-line sessions served over SSH.
//!
//! Build a [`CliServer`] from a [`CliHandler`] and a [`ServerConfig`], then
//! start it on a dedicated thread or on the current tokio runtime. Every
//! session channel a client opens runs the handler once.

pub mod server;

pub use server::{
    CliHandler, CliServer, ConnectionInfo, Error, Interact, Result, ServerConfig, SessionContext,
};
