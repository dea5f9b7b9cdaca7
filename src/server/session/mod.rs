//! Interactive sessions.
//!
//! - [`SessionBridge`]: per-channel state machine owning one handler invocation
//! - [`SessionContext`]: what the handler sees (input, output, terminal, signals)
//! - [`SessionOutput`] / [`SessionInput`]: the channel's data streams

mod bridge;
mod context;
mod io;
mod signals;

pub use bridge::{CANCEL_GRACE, SessionBridge, SessionState};
pub use context::SessionContext;
pub use io::{ChannelSink, ChannelWriter, SessionInput, SessionOutput};
pub use signals::{
    DEFAULT_COLUMNS, DEFAULT_ROWS, InterruptFlag, SignalCallback, SignalHandlers, TerminalSize,
};
