//! Error type for the CLI server.
//!
//! Every fault the server can surface is a variant of [`Error`]. The type is
//! `Clone` because a single fault is replayed through several paths: the
//! pending start call, the exception handler and [`CliServer::wait_closed`].
//!
//! # Classification
//!
//! Errors fall into the following groups:
//!
//! 1. **Startup faults**: the listener could not be bound, the host key could
//!    not be loaded or generated, the runtime could not be built, or the
//!    server did not come up in time. Fatal to the run.
//!
//! 2. **Admission faults**: the connection cap was exceeded. Local to one
//!    channel-open request.
//!
//! 3. **Authentication faults**: unknown user, invalid username, key store
//!    failures. Answered with a rejection; russh applies its own retry policy.
//!
//! 4. **Session faults**: raised by an interactive handler, or cancellation of
//!    the handler. Logged by the session's completion observer.
//!
//! 5. **Teardown faults**: a connection could not be closed during shutdown.
//!    Reported once the shutdown completes.
//!
//! [`CliServer::wait_closed`]: crate::server::CliServer::wait_closed

use std::io;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// `run()` or a start method was called while a run is in progress.
    #[error("server already running")]
    AlreadyRunning,

    /// The listening socket could not be bound.
    #[error("failed to bind {address}: {reason}")]
    Bind { address: String, reason: String },

    /// The host key could not be read, generated or decoded.
    #[error("host key error ({path}): {reason}")]
    HostKey { path: String, reason: String },

    /// The background thread did not report readiness within the timeout.
    #[error("server did not start within {0:?}")]
    HungStart(std::time::Duration),

    /// The background runtime could not be created.
    #[error("failed to build server runtime: {0}")]
    Runtime(String),

    /// The run finished before it ever reached the running state.
    #[error("server exited before it was ready")]
    ExitedBeforeReady,

    /// A session channel was refused because the admission cap was reached.
    #[error("too many connections ({active} active, limit {limit})")]
    TooManyConnections { active: usize, limit: usize },

    /// The username is not known to the credential store.
    #[error("unknown user '{0}'")]
    UnknownUser(String),

    /// The username contains characters that are not allowed.
    #[error("invalid username '{0}'")]
    InvalidUsername(String),

    /// The key store failed to produce keys for a user.
    #[error("key store error: {0}")]
    KeyStore(String),

    /// The session was cancelled, either by a disconnect or by the server.
    #[error("session cancelled")]
    Cancelled,

    /// The remote user interrupted the current operation (Ctrl-C / SIGINT).
    #[error("interrupted")]
    Interrupted,

    /// The channel is no longer open.
    #[error("channel closed")]
    ChannelClosed,

    /// An interactive handler failed.
    #[error("session error: {0}")]
    Session(String),

    /// A connection could not be closed cleanly during shutdown.
    #[error("failed to close connection {connection}: {reason}")]
    Teardown { connection: String, reason: String },

    /// Error reported by the SSH transport.
    #[error("ssh transport error: {0}")]
    Transport(String),

    /// Any other I/O failure.
    #[error("i/o error: {0}")]
    Io(String),
}

impl Error {
    /// Wrap an arbitrary message as a session fault.
    pub fn session(message: impl Into<String>) -> Self {
        Error::Session(message.into())
    }

    /// Returns `true` if this fault prevents the server from starting.
    pub fn is_startup_fault(&self) -> bool {
        matches!(
            self,
            Error::Bind { .. }
                | Error::HostKey { .. }
                | Error::HungStart(_)
                | Error::Runtime(_)
                | Error::ExitedBeforeReady
        )
    }

    /// Returns `true` for the expected ways a session ends early.
    ///
    /// The session's completion observer logs these at debug level rather
    /// than as unhandled faults.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::ChannelClosed)
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod classification {
        use super::*;

        #[test]
        fn test_bind_is_startup_fault() {
            let err = Error::Bind {
                address: "0.0.0.0:22".to_string(),
                reason: "address in use".to_string(),
            };
            assert!(err.is_startup_fault());
        }

        #[test]
        fn test_host_key_is_startup_fault() {
            let err = Error::HostKey {
                path: "/tmp/key".to_string(),
                reason: "bad format".to_string(),
            };
            assert!(err.is_startup_fault());
        }

        #[test]
        fn test_hung_start_is_startup_fault() {
            assert!(Error::HungStart(std::time::Duration::from_secs(1)).is_startup_fault());
            assert!(Error::ExitedBeforeReady.is_startup_fault());
        }

        #[test]
        fn test_already_running_is_not_startup_fault() {
            assert!(!Error::AlreadyRunning.is_startup_fault());
        }

        #[test]
        fn test_admission_is_not_startup_fault() {
            let err = Error::TooManyConnections {
                active: 5,
                limit: 4,
            };
            assert!(!err.is_startup_fault());
        }

        #[test]
        fn test_cancellation() {
            assert!(Error::Cancelled.is_cancellation());
            assert!(Error::ChannelClosed.is_cancellation());
            assert!(!Error::session("boom").is_cancellation());
            assert!(!Error::Interrupted.is_cancellation());
        }
    }

    mod display {
        use super::*;

        #[test]
        fn test_too_many_connections_message() {
            let err = Error::TooManyConnections {
                active: 3,
                limit: 2,
            };
            assert_eq!(err.to_string(), "too many connections (3 active, limit 2)");
        }

        #[test]
        fn test_already_running_message() {
            assert_eq!(Error::AlreadyRunning.to_string(), "server already running");
        }

        #[test]
        fn test_io_conversion() {
            let io_err = io::Error::new(io::ErrorKind::AddrInUse, "address in use");
            let err: Error = io_err.into();
            assert!(matches!(err, Error::Io(ref m) if m.contains("address in use")));
        }

        #[test]
        fn test_error_is_clone() {
            let err = Error::session("handler failed");
            let copy = err.clone();
            assert_eq!(err, copy);
        }
    }
}
