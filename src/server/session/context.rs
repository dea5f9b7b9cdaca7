//! The application session handed to an interactive handler.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::server::connection::ConnectionInfo;
use crate::server::error::{Error, Result};
use crate::server::lifecycle::ServerControl;

use super::io::{SessionInput, SessionOutput};
use super::signals::{InterruptFlag, SignalCallback, SignalHandlers, TerminalSize};

const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;
const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7f;
const ESCAPE: u8 = 0x1b;

/// Everything an interactive handler needs for one session.
pub struct SessionContext {
    connection: ConnectionInfo,
    output: Arc<SessionOutput>,
    input: SessionInput,
    terminal: watch::Receiver<TerminalSize>,
    term_type: Option<String>,
    interrupt: InterruptFlag,
    signals: Arc<SignalHandlers>,
    cancel: CancellationToken,
    server: ServerControl,
    skip_line_feed: bool,
}

pub(crate) struct SessionParts {
    pub connection: ConnectionInfo,
    pub output: Arc<SessionOutput>,
    pub input: SessionInput,
    pub terminal: watch::Receiver<TerminalSize>,
    pub term_type: Option<String>,
    pub interrupt: InterruptFlag,
    pub signals: Arc<SignalHandlers>,
    pub cancel: CancellationToken,
    pub server: ServerControl,
}

impl SessionContext {
    pub(crate) fn new(parts: SessionParts) -> Self {
        Self {
            connection: parts.connection,
            output: parts.output,
            input: parts.input,
            terminal: parts.terminal,
            term_type: parts.term_type,
            interrupt: parts.interrupt,
            signals: parts.signals,
            cancel: parts.cancel,
            server: parts.server,
            skip_line_feed: false,
        }
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.connection
    }

    pub fn username(&self) -> &str {
        self.connection.username()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_addr()
    }

    pub fn output(&self) -> &SessionOutput {
        &self.output
    }

    pub fn input(&mut self) -> &mut SessionInput {
        &mut self.input
    }

    /// Current terminal size.
    pub fn terminal_size(&self) -> TerminalSize {
        *self.terminal.borrow()
    }

    /// Wait for the client to resize its terminal.
    pub async fn resized(&mut self) -> Result<TerminalSize> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            changed = self.terminal.changed() => {
                changed.map_err(|_| Error::ChannelClosed)?;
                Ok(*self.terminal.borrow_and_update())
            }
        }
    }

    /// Terminal type from the pty request, e.g. `xterm-256color`.
    pub fn term_type(&self) -> Option<&str> {
        self.term_type.as_deref()
    }

    pub fn interrupt(&self) -> &InterruptFlag {
        &self.interrupt
    }

    /// Token cancelled when the session must end.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Replace the default interrupt behaviour (setting the interrupt flag).
    pub fn on_interrupt(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.signals
            .set_interrupt(Some(Arc::new(callback) as SignalCallback));
    }

    /// Replace the default break behaviour (cancelling the session).
    pub fn on_break(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.signals.set_break(Some(Arc::new(callback) as SignalCallback));
    }

    /// Restore the default interrupt and break behaviour.
    pub fn reset_signal_handlers(&self) {
        self.signals.set_interrupt(None);
        self.signals.set_break(None);
    }

    pub fn server(&self) -> &ServerControl {
        &self.server
    }

    /// Read one line with local echo and basic editing.
    ///
    /// Returns `Ok(None)` when the user sends Ctrl-D on an empty line.
    ///
    /// # Errors
    ///
    /// * [`Error::Interrupted`] on Ctrl-C; the interrupt flag is also set
    /// * [`Error::Cancelled`] / [`Error::ChannelClosed`] from the input queue
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let mut line: Vec<u8> = Vec::new();
        loop {
            let byte = self.input.read_byte().await?;

            if std::mem::take(&mut self.skip_line_feed) && byte == b'\n' {
                continue;
            }

            match byte {
                b'\r' | b'\n' => {
                    self.skip_line_feed = byte == b'\r';
                    self.output.write(b"\n").await;
                    return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
                }
                CTRL_C => {
                    self.interrupt.set();
                    self.output.write(b"^C\n").await;
                    return Err(Error::Interrupted);
                }
                CTRL_D => {
                    if line.is_empty() {
                        return Ok(None);
                    }
                }
                BACKSPACE | DELETE => {
                    if pop_char(&mut line) {
                        self.output.write(b"\x08 \x08").await;
                    }
                }
                ESCAPE => self.skip_escape_sequence().await?,
                byte if byte < 0x20 => {}
                byte => {
                    line.push(byte);
                    self.output.write(&[byte]).await;
                }
            }
        }
    }

    async fn skip_escape_sequence(&mut self) -> Result<()> {
        let next = self.input.read_byte().await?;
        if next != b'[' && next != b'O' {
            self.input.unread(&[next]);
            return Ok(());
        }
        loop {
            let byte = self.input.read_byte().await?;
            if (0x40..=0x7e).contains(&byte) {
                return Ok(());
            }
        }
    }
}

/// Remove the last UTF-8 character from `line`.
fn pop_char(line: &mut Vec<u8>) -> bool {
    let Some(mut last) = line.pop() else {
        return false;
    };
    while last & 0xc0 == 0x80 {
        match line.pop() {
            Some(byte) => last = byte,
            None => break,
        }
    }
    true
}
