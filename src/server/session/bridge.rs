//! Per-channel session bridge.
//!
//! A [`SessionBridge`] adapts one SSH session channel into the
//! [`SessionContext`] handed to an interactive handler and owns exactly one
//! handler invocation.
//!
//! # States
//!
//! ```text
//! Created --channel_established--> Bound --session_started--> Interacting
//!    |                               |                            |
//!    +------- connection_lost -------+---- handler returns -------+--> Closed
//! ```
//!
//! Closed is terminal. Whatever the exit path (handler return, handler fault,
//! remote disconnect, server shutdown, task abort) the channel and the input
//! queue are closed exactly once.
//!
//! Cancellation is cooperative. Once the session's token fires, output is
//! discarded and the handler gets [`CANCEL_GRACE`] to notice the token and
//! return; a handler still running after that is dropped.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

use crate::server::connection::ConnectionInfo;
use crate::server::error::{Error, Result};
use crate::server::handler::{CliHandler, Interact};
use crate::server::lifecycle::ServerControl;

use super::context::{SessionContext, SessionParts};
use super::io::{ChannelSink, SessionInput, SessionOutput};
use super::signals::{InterruptFlag, SignalHandlers, TerminalSize};

/// How long a cancelled handler may keep running to observe the cancellation
/// and return on its own before it is dropped.
pub const CANCEL_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Bound,
    Interacting,
    Closed,
}

/// Channel-side resources released when the session ends.
struct SessionResources {
    output: Arc<SessionOutput>,
    input: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    released: AtomicBool,
}

impl SessionResources {
    fn new(output: Arc<SessionOutput>, input: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            output,
            input: Mutex::new(Some(input)),
            released: AtomicBool::new(false),
        }
    }

    fn push_input(&self, data: &[u8]) {
        let input = self.input.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = input.as_ref() {
            let _ = tx.send(data.to_vec());
        }
    }

    fn close_input(&self) {
        self.input
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Close the input queue and stop output. Returns `false` if another
    /// path already did.
    fn begin_release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.close_input();
        self.output.mark_closed();
        true
    }

    async fn release(&self) {
        if self.begin_release() {
            self.output.close().await;
        }
    }

    /// Release from a synchronous context; the channel close runs as a task.
    fn release_detached(&self, tracker: Option<&TaskTracker>) {
        if !self.begin_release() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let output = Arc::clone(&self.output);
        let close = async move { output.close().await };
        match tracker {
            Some(tracker) => {
                tracker.spawn_on(close, &runtime);
            }
            None => {
                runtime.spawn(close);
            }
        }
    }
}

impl Drop for SessionResources {
    fn drop(&mut self) {
        self.release_detached(None);
    }
}

pub struct SessionBridge {
    connection: ConnectionInfo,
    handler: CliHandler,
    server: ServerControl,
    tracker: TaskTracker,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
    abort: CancellationToken,
    interrupt: InterruptFlag,
    signals: Arc<SignalHandlers>,
    terminal: watch::Sender<TerminalSize>,
    term_type: Mutex<Option<String>>,
    resources: OnceLock<Arc<SessionResources>>,
    pending_input: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    outcome: OnceLock<Result<()>>,
}

impl SessionBridge {
    /// Create a bridge in the `Created` state.
    ///
    /// `cancel` should be a child of the run's stop token so a server
    /// shutdown cancels the session. Once `abort` fires a cancelled handler
    /// is dropped without waiting out [`CANCEL_GRACE`]. Handler tasks are
    /// spawned on `tracker`.
    pub fn new(
        connection: ConnectionInfo,
        handler: CliHandler,
        server: ServerControl,
        tracker: TaskTracker,
        cancel: CancellationToken,
        abort: CancellationToken,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Created);
        let (terminal, _) = watch::channel(TerminalSize::default());
        Arc::new(Self {
            connection,
            handler,
            server,
            tracker,
            state,
            cancel,
            abort,
            interrupt: InterruptFlag::new(),
            signals: Arc::new(SignalHandlers::default()),
            terminal,
            term_type: Mutex::new(None),
            resources: OnceLock::new(),
            pending_input: Mutex::new(None),
            outcome: OnceLock::new(),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.connection
    }

    pub fn interrupt(&self) -> &InterruptFlag {
        &self.interrupt
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Outcome of the handler invocation, once the session has closed.
    pub fn outcome(&self) -> Option<&Result<()>> {
        self.outcome.get()
    }

    /// Wait until the session reaches `Closed`.
    pub async fn closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }

    /// Move from `Created` to `Bound`, attaching the channel's write side.
    ///
    /// Returns `false` if the bridge was not in `Created`.
    pub fn channel_established(&self, sink: Arc<dyn ChannelSink>) -> bool {
        let bound = self.transition(SessionState::Created, SessionState::Bound);
        if bound {
            let (tx, rx) = mpsc::unbounded_channel();
            let output = Arc::new(SessionOutput::new(sink));
            let _ = self
                .resources
                .set(Arc::new(SessionResources::new(output, tx)));
            *self
                .pending_input
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(rx);
            debug!(user = self.connection.username(), "Session channel bound");
        }
        bound
    }

    /// Shell requests are always granted.
    pub fn shell_requested(&self) -> bool {
        true
    }

    /// Record the terminal from a pty request.
    pub fn pty_requested(&self, term: &str, size: TerminalSize) {
        *self.term_type.lock().unwrap_or_else(PoisonError::into_inner) = Some(term.to_string());
        self.terminal.send_replace(size);
    }

    /// Move from `Bound` to `Interacting` and spawn the handler.
    ///
    /// The handler runs on the bridge's task tracker. When it finishes, for
    /// whatever reason, the channel is closed and the bridge moves to
    /// `Closed`.
    pub fn session_started(self: &Arc<Self>) -> Result<()> {
        if !self.transition(SessionState::Bound, SessionState::Interacting) {
            return Err(Error::session(format!(
                "cannot start session in state {:?}",
                self.state()
            )));
        }

        let Some(resources) = self.resources.get().cloned() else {
            return Err(Error::session("session has no channel"));
        };
        let Some(input) = self
            .pending_input
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Err(Error::session("session input already taken"));
        };

        let context = SessionContext::new(SessionParts {
            connection: self.connection.clone(),
            output: Arc::clone(&resources.output),
            input: SessionInput::new(input, self.cancel.clone()),
            terminal: self.terminal.subscribe(),
            term_type: self
                .term_type
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            interrupt: self.interrupt.clone(),
            signals: Arc::clone(&self.signals),
            cancel: self.cancel.clone(),
            server: self.server.clone(),
        });

        let handler = self.handler.resolve();
        let bridge = Arc::clone(self);
        debug!(user = self.connection.username(), "Starting interactive handler");
        self.tracker
            .spawn(async move { bridge.drive(handler, context, resources).await });
        Ok(())
    }

    async fn drive(
        &self,
        handler: Arc<dyn Interact>,
        context: SessionContext,
        resources: Arc<SessionResources>,
    ) {
        let interaction = AssertUnwindSafe(handler.interact(context)).catch_unwind();
        tokio::pin!(interaction);

        let outcome = tokio::select! {
            result = &mut interaction => flatten_panic(result),
            _ = self.cancel.cancelled() => {
                // The channel is going away; the handler may still run its own
                // cleanup, but nothing it writes reaches the client.
                resources.output.mark_closed();
                let finished = tokio::select! {
                    result = tokio::time::timeout(CANCEL_GRACE, &mut interaction) => result.ok(),
                    _ = self.abort.cancelled() => None,
                };
                match finished {
                    Some(result) => match flatten_panic(result) {
                        Ok(()) => Err(Error::Cancelled),
                        Err(e) if e.is_cancellation() || e == Error::Interrupted => {
                            Err(Error::Cancelled)
                        }
                        Err(e) => Err(e),
                    },
                    None => {
                        debug!(
                            user = self.connection.username(),
                            forced = self.abort.is_cancelled(),
                            "Handler still running after cancellation; dropping it"
                        );
                        Err(Error::Cancelled)
                    }
                }
            }
        };

        resources.release().await;
        let _ = self.outcome.set(outcome.clone());
        self.state.send_replace(SessionState::Closed);
        self.observe(&outcome);
    }

    fn observe(&self, outcome: &Result<()>) {
        let user = self.connection.username();
        let peer = self.connection.remote_addr();
        match outcome {
            Ok(()) => debug!(user, %peer, "Session ended"),
            Err(e) if e.is_cancellation() || *e == Error::Interrupted => {
                debug!(user, %peer, "Session ended early: {}", e)
            }
            Err(e) => error!(user, %peer, "Session handler failed: {}", e),
        }
    }

    /// Forward client bytes to the handler's input queue.
    pub fn data_received(&self, data: &[u8]) {
        if let Some(resources) = self.resources.get() {
            resources.push_input(data);
        }
    }

    /// The client will send no more data. Output stays open.
    pub fn eof_received(&self) {
        if let Some(resources) = self.resources.get() {
            resources.close_input();
        }
    }

    pub fn terminal_size_changed(&self, size: TerminalSize) {
        self.terminal.send_replace(size);
    }

    /// The connection or channel went away.
    ///
    /// Cancels a running handler; before the handler started, closes the
    /// bridge directly. No-op once `Closed`.
    pub fn connection_lost(&self) {
        let mut previous = SessionState::Closed;
        self.state.send_if_modified(|state| {
            previous = *state;
            match *state {
                SessionState::Created | SessionState::Bound => {
                    *state = SessionState::Closed;
                    true
                }
                SessionState::Interacting | SessionState::Closed => false,
            }
        });

        match previous {
            SessionState::Closed => {}
            SessionState::Interacting => {
                debug!(user = self.connection.username(), "Connection lost, cancelling session");
                self.cancel.cancel();
            }
            SessionState::Created | SessionState::Bound => {
                self.cancel.cancel();
                if let Some(resources) = self.resources.get() {
                    resources.release_detached(Some(&self.tracker));
                }
                let _ = self.outcome.set(Err(Error::Cancelled));
            }
        }
    }

    /// The client sent a break. Defaults to ending the session.
    pub fn break_received(&self) {
        match self.signals.on_break() {
            Some(callback) => callback(),
            None => self.connection_lost(),
        }
    }

    /// The client sent SIGINT. Defaults to setting the interrupt flag.
    pub fn interrupt_received(&self) {
        match self.signals.interrupt() {
            Some(callback) => callback(),
            None => self.interrupt.set(),
        }
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }
}

fn flatten_panic(result: std::result::Result<Result<()>, Box<dyn Any + Send>>) -> Result<()> {
    result.unwrap_or_else(|panic| {
        Err(Error::session(format!(
            "handler panicked: {}",
            panic_message(&*panic)
        )))
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::session::io::testing::RecordingSink;
    use std::sync::atomic::AtomicUsize;

    fn bridge(handler: CliHandler) -> (Arc<SessionBridge>, Arc<RecordingSink>, TaskTracker) {
        bridge_with_abort(handler, CancellationToken::new())
    }

    fn bridge_with_abort(
        handler: CliHandler,
        abort: CancellationToken,
    ) -> (Arc<SessionBridge>, Arc<RecordingSink>, TaskTracker) {
        let tracker = TaskTracker::new();
        let bridge = SessionBridge::new(
            ConnectionInfo::for_test("tester"),
            handler,
            ServerControl::detached(),
            tracker.clone(),
            CancellationToken::new(),
            abort,
        );
        let sink = Arc::new(RecordingSink::default());
        (bridge, sink, tracker)
    }

    async fn start(handler: CliHandler) -> (Arc<SessionBridge>, Arc<RecordingSink>, TaskTracker) {
        let (bridge, sink, tracker) = bridge(handler);
        assert!(bridge.channel_established(sink.clone()));
        assert!(bridge.shell_requested());
        bridge.session_started().unwrap();
        (bridge, sink, tracker)
    }

    async fn wait_closed(bridge: &SessionBridge) {
        tokio::time::timeout(Duration::from_secs(2), bridge.closed())
            .await
            .expect("session did not close");
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn test_states_in_order() {
            let (bridge, sink, _tracker) = bridge(CliHandler::function(|_ctx| async { Ok(()) }));
            assert_eq!(bridge.state(), SessionState::Created);
            assert!(bridge.channel_established(sink.clone()));
            assert_eq!(bridge.state(), SessionState::Bound);
            assert!(!bridge.channel_established(sink));
            bridge.session_started().unwrap();
            wait_closed(&bridge).await;
            assert_eq!(bridge.state(), SessionState::Closed);
        }

        #[tokio::test]
        async fn test_normal_exit_closes_channel_once() {
            let (bridge, sink, _tracker) = start(CliHandler::function(|ctx| async move {
                ctx.output().writeln("bye").await;
                Ok(())
            }))
            .await;
            wait_closed(&bridge).await;

            assert_eq!(sink.text(), "bye\r\n");
            assert_eq!(sink.close_count(), 1);
            assert_eq!(bridge.outcome(), Some(&Ok(())));

            bridge.connection_lost();
            assert_eq!(sink.close_count(), 1);
        }

        #[tokio::test]
        async fn test_start_requires_bound() {
            let (bridge, _sink, _tracker) = bridge(CliHandler::function(|_ctx| async { Ok(()) }));
            assert!(bridge.session_started().is_err());
        }

        #[tokio::test]
        async fn test_handler_fault_is_recorded() {
            let (bridge, sink, _tracker) = start(CliHandler::function(|_ctx| async {
                Err(Error::session("boom"))
            }))
            .await;
            wait_closed(&bridge).await;
            assert_eq!(bridge.outcome(), Some(&Err(Error::session("boom"))));
            assert_eq!(sink.close_count(), 1);
        }

        #[tokio::test]
        async fn test_handler_panic_still_tears_down() {
            let (bridge, sink, _tracker) = start(CliHandler::function(|_ctx| async {
                if true {
                    panic!("handler exploded");
                }
                Ok(())
            }))
            .await;
            wait_closed(&bridge).await;
            match bridge.outcome() {
                Some(Err(Error::Session(message))) => assert!(message.contains("handler exploded")),
                other => panic!("unexpected outcome {other:?}"),
            }
            assert_eq!(sink.close_count(), 1);
        }
    }

    mod cancellation {
        use super::*;

        #[tokio::test]
        async fn test_connection_lost_cancels_handler() {
            let (bridge, sink, _tracker) = start(CliHandler::function(|mut ctx| async move {
                ctx.input().read().await?;
                Ok::<(), Error>(())
            }))
            .await;

            bridge.connection_lost();
            wait_closed(&bridge).await;
            assert_eq!(bridge.outcome(), Some(&Err(Error::Cancelled)));
            assert_eq!(sink.close_count(), 1);

            bridge.connection_lost();
            assert_eq!(sink.close_count(), 1);
        }

        #[tokio::test]
        async fn test_connection_lost_drops_uncooperative_handler() {
            let (bridge, sink, _tracker) = start(CliHandler::function(|_ctx| async {
                std::future::pending::<()>().await;
                Ok(())
            }))
            .await;
            let cancelled_at = tokio::time::Instant::now();
            bridge.connection_lost();
            wait_closed(&bridge).await;
            assert!(cancelled_at.elapsed() >= CANCEL_GRACE);
            assert_eq!(bridge.outcome(), Some(&Err(Error::Cancelled)));
            assert_eq!(sink.close_count(), 1);
        }

        #[tokio::test]
        async fn test_abort_skips_grace_period() {
            let abort = CancellationToken::new();
            let (bridge, sink, _tracker) = bridge_with_abort(
                CliHandler::function(|_ctx| async {
                    std::future::pending::<()>().await;
                    Ok(())
                }),
                abort.clone(),
            );
            assert!(bridge.channel_established(sink.clone()));
            assert!(bridge.shell_requested());
            bridge.session_started().unwrap();

            abort.cancel();
            let cancelled_at = tokio::time::Instant::now();
            bridge.connection_lost();
            wait_closed(&bridge).await;
            assert!(cancelled_at.elapsed() < CANCEL_GRACE);
            assert_eq!(bridge.outcome(), Some(&Err(Error::Cancelled)));
            assert_eq!(sink.close_count(), 1);
        }

        #[tokio::test]
        async fn test_connection_lost_before_start() {
            let invoked = Arc::new(AtomicUsize::new(0));
            let counter = invoked.clone();
            let (bridge, sink, tracker) = bridge(CliHandler::function(move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            }));
            assert!(bridge.channel_established(sink.clone()));
            bridge.connection_lost();

            assert_eq!(bridge.state(), SessionState::Closed);
            assert!(bridge.session_started().is_err());

            tracker.close();
            tracker.wait().await;
            assert_eq!(invoked.load(Ordering::SeqCst), 0);
            assert_eq!(sink.close_count(), 1);
        }

        #[tokio::test]
        async fn test_handler_observes_cancellation() {
            let observed = Arc::new(AtomicBool::new(false));
            let flag = observed.clone();
            let (bridge, sink, _tracker) = start(CliHandler::function(move |ctx| {
                let flag = flag.clone();
                async move {
                    ctx.cancellation().cancelled().await;
                    flag.store(true, Ordering::SeqCst);
                    ctx.output().writeln("farewell").await;
                    Ok(())
                }
            }))
            .await;

            bridge.connection_lost();
            wait_closed(&bridge).await;
            assert!(observed.load(Ordering::SeqCst));
            assert_eq!(bridge.outcome(), Some(&Err(Error::Cancelled)));
            assert_eq!(sink.close_count(), 1);
        }

        #[tokio::test]
        async fn test_write_after_cancel_discarded() {
            let wrote = Arc::new(AtomicBool::new(false));
            let flag = wrote.clone();
            let (bridge, sink, _tracker) = start(CliHandler::function(move |ctx| {
                let flag = flag.clone();
                async move {
                    ctx.cancellation().cancelled().await;
                    ctx.output().write_str("too late").await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .await;
            bridge.connection_lost();
            wait_closed(&bridge).await;
            assert!(wrote.load(Ordering::SeqCst));
            assert_eq!(sink.text(), "");
        }

        #[tokio::test]
        async fn test_fault_during_cleanup_is_kept() {
            let (bridge, _sink, _tracker) = start(CliHandler::function(|ctx| async move {
                ctx.cancellation().cancelled().await;
                Err(Error::session("cleanup failed"))
            }))
            .await;
            bridge.connection_lost();
            wait_closed(&bridge).await;
            assert_eq!(bridge.outcome(), Some(&Err(Error::session("cleanup failed"))));
        }
    }

    mod signals {
        use super::*;

        #[tokio::test]
        async fn test_interrupt_sets_flag_without_cancelling() {
            let (bridge, _sink, _tracker) = start(CliHandler::function(|ctx| async move {
                ctx.interrupt().wait().await;
                ctx.output().write_str("interrupted").await;
                Ok(())
            }))
            .await;

            bridge.interrupt_received();
            wait_closed(&bridge).await;
            assert_eq!(bridge.outcome(), Some(&Ok(())));
        }

        #[tokio::test]
        async fn test_break_defaults_to_cancel() {
            let (bridge, _sink, _tracker) = start(CliHandler::function(|ctx| async move {
                ctx.cancellation().cancelled().await;
                Ok(())
            }))
            .await;
            bridge.break_received();
            wait_closed(&bridge).await;
            assert!(bridge.is_cancelled());
        }

        #[tokio::test]
        async fn test_break_override() {
            let (tx, rx) = tokio::sync::oneshot::channel::<()>();
            let tx = Arc::new(Mutex::new(Some(tx)));
            let (bridge, _sink, _tracker) = start(CliHandler::function(move |ctx| {
                let tx = tx.clone();
                async move {
                    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<()>();
                    ctx.on_break(move || {
                        let _ = seen_tx.send(());
                    });
                    if let Some(ready) = tx.lock().unwrap().take() {
                        let _ = ready.send(());
                    }
                    seen_rx.recv().await;
                    Ok(())
                }
            }))
            .await;

            rx.await.unwrap();
            bridge.break_received();
            wait_closed(&bridge).await;
            assert_eq!(bridge.outcome(), Some(&Ok(())));
        }
    }

    mod input {
        use super::*;

        #[tokio::test]
        async fn test_data_reaches_handler() {
            let (bridge, sink, _tracker) = start(CliHandler::function(|mut ctx| async move {
                let line = ctx.read_line().await?.unwrap_or_default();
                ctx.output().writeln(&format!("got {line}")).await;
                Ok::<(), Error>(())
            }))
            .await;

            bridge.data_received(b"ping\r");
            wait_closed(&bridge).await;
            assert_eq!(sink.text(), "ping\r\ngot ping\r\n");
        }

        #[tokio::test]
        async fn test_eof_ends_input_but_not_output() {
            let (bridge, sink, _tracker) = start(CliHandler::function(|mut ctx| async move {
                let result = ctx.input().read().await;
                if result == Err(Error::ChannelClosed) {
                    ctx.output().write_str("eof").await;
                }
                Ok(())
            }))
            .await;

            bridge.eof_received();
            wait_closed(&bridge).await;
            assert_eq!(sink.text(), "eof");
        }

        #[tokio::test]
        async fn test_pty_request_visible_to_handler() {
            let (bridge, sink, _tracker) = bridge(CliHandler::function(|ctx| async move {
                let size = ctx.terminal_size();
                let term = ctx.term_type().unwrap_or("none").to_string();
                ctx.output()
                    .write_str(&format!("{term} {}x{}", size.columns, size.rows))
                    .await;
                Ok(())
            }));
            assert!(bridge.channel_established(sink.clone()));
            bridge.pty_requested("vt100", TerminalSize::new(100, 30));
            bridge.session_started().unwrap();
            wait_closed(&bridge).await;
            assert_eq!(sink.text(), "vt100 100x30");
        }
    }
}
