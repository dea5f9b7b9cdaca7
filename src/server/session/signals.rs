//! Out-of-band session events: interrupts, breaks and terminal resizes.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

/// Terminal width used until the client sends a pty request.
pub const DEFAULT_COLUMNS: u32 = 79;
/// Terminal height used until the client sends a pty request.
pub const DEFAULT_ROWS: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub columns: u32,
    pub rows: u32,
}

impl TerminalSize {
    pub fn new(columns: u32, rows: u32) -> Self {
        Self { columns, rows }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::new(DEFAULT_COLUMNS, DEFAULT_ROWS)
    }
}

/// Set when the remote user interrupts (SIGINT or Ctrl-C).
///
/// Interrupts are advisory: the handler decides what to abandon. The flag
/// stays set until [`clear`](Self::clear) is called.
#[derive(Clone, Default)]
pub struct InterruptFlag {
    inner: Arc<InterruptInner>,
}

#[derive(Default)]
struct InterruptInner {
    set: AtomicBool,
    notify: Notify,
}

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.inner.set.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.inner.set.load(Ordering::Acquire)
    }

    /// Clear the flag, returning whether it was set.
    pub fn clear(&self) -> bool {
        self.inner.set.swap(false, Ordering::AcqRel)
    }

    /// Wait until the flag is set.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for InterruptFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InterruptFlag").field(&self.is_set()).finish()
    }
}

pub type SignalCallback = Arc<dyn Fn() + Send + Sync>;

/// Handler-installed overrides for interrupt and break.
///
/// Without an override an interrupt sets the [`InterruptFlag`] and a break
/// cancels the session.
#[derive(Default)]
pub struct SignalHandlers {
    interrupt: Mutex<Option<SignalCallback>>,
    on_break: Mutex<Option<SignalCallback>>,
}

impl SignalHandlers {
    pub fn set_interrupt(&self, callback: Option<SignalCallback>) {
        *self
            .interrupt
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = callback;
    }

    pub fn set_break(&self, callback: Option<SignalCallback>) {
        *self.on_break.lock().unwrap_or_else(PoisonError::into_inner) = callback;
    }

    pub(crate) fn interrupt(&self) -> Option<SignalCallback> {
        self.interrupt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn on_break(&self) -> Option<SignalCallback> {
        self.on_break
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
