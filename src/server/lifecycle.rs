//! Server lifecycle: start, serve, close.
//!
//! [`CliServer`] owns the listener and the registry of active connections.
//! It can be hosted two ways, both running the same [`CliServer::run`]:
//!
//! - **Thread mode** ([`CliServer::start_as_thread`]): a dedicated OS thread
//!   with its own current-thread tokio runtime. Start blocks until the
//!   listener is up, startup fails, or the start timeout elapses.
//! - **Task mode** ([`CliServer::start_as_task`]): a task on the caller's
//!   runtime. Start resolves once the listener is up or startup failed.
//!
//! # Run state
//!
//! ```text
//! Idle --> Starting --> Running --> Closing --> Closed
//!             |                                  ^  |
//!             +-------- startup failure ---------+  +--> Starting (restart)
//! ```
//!
//! The state cell is also the single-run guard: a run holds it from
//! `Starting` until it publishes `Closed`, so [`CliServer::wait_closed`] can
//! never observe `Closed` while a run still owns resources.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use russh::keys::PrivateKey;
use russh::server;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::server::config::ServerConfig;
use crate::server::connection::{RunContext, serve_connection};
use crate::server::error::{Error, Result};
use crate::server::handler::CliHandler;
use crate::server::host_key::HostKeyProvider;
use crate::server::registry::{ConnectionHandle, ConnectionRegistry, ConnectionSnapshot};

/// Name of the thread used by [`CliServer::start_as_thread`].
pub const SERVER_THREAD_NAME: &str = "ssh-cli-server";

/// How long a hung start waits for the half-started run to unwind.
const HUNG_START_GRACE: Duration = Duration::from_millis(500);

/// Delay after a failed `accept` before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Starting,
    Running,
    Closing,
    Closed,
}

/// Callback invoked with the fault that terminated a run.
pub type ExceptionHandler = Arc<dyn Fn(&Error) + Send + Sync>;

/// First fault of a run; later faults are logged only.
#[derive(Default)]
struct FaultSlot {
    fault: Mutex<Option<Error>>,
}

impl FaultSlot {
    fn lock(&self) -> MutexGuard<'_, Option<Error>> {
        self.fault.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `fault` unless one is already recorded. Returns whether it was.
    fn record(&self, fault: Error) -> bool {
        let mut slot = self.lock();
        if slot.is_some() {
            debug!("Additional fault after the first: {}", fault);
            return false;
        }
        *slot = Some(fault);
        true
    }

    fn get(&self) -> Option<Error> {
        self.lock().clone()
    }

    fn reset(&self) {
        self.lock().take();
    }
}

/// Readiness signal for a start call blocked on another thread.
#[derive(Clone, Default)]
struct StartupLatch {
    inner: Arc<(Mutex<Option<Result<()>>>, Condvar)>,
}

impl StartupLatch {
    /// Set the startup outcome. Only the first call has an effect.
    fn signal(&self, outcome: Result<()>) {
        let (lock, condvar) = &*self.inner;
        let mut slot = lock.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(outcome);
            condvar.notify_all();
        }
    }

    /// Wait up to `timeout` for the outcome; `None` on timeout.
    fn wait(&self, timeout: Duration) -> Option<Result<()>> {
        let (lock, condvar) = &*self.inner;
        let slot = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (slot, _) = condvar
            .wait_timeout_while(slot, timeout, |outcome| outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.clone()
    }
}

/// Cancellation tokens of one run.
#[derive(Clone, Default)]
struct StopTokens {
    stop: CancellationToken,
    abort: CancellationToken,
}

struct ServerInner {
    config: Arc<ServerConfig>,
    handler: CliHandler,
    state: watch::Sender<RunState>,
    running: AtomicBool,
    registry: Arc<ConnectionRegistry>,
    stop: Mutex<Option<StopTokens>>,
    fault: FaultSlot,
    exception_handler: Mutex<Option<ExceptionHandler>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: Mutex<Option<ThreadId>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ServerInner {
    fn request_stop(&self, force: bool) {
        if let Some(tokens) = locked(&self.stop).as_ref() {
            if force {
                tokens.abort.cancel();
            }
            tokens.stop.cancel();
        }
    }

    fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Move from `from` to `to`; `false` if the state was something else.
    fn transition(&self, from: RunState, to: RunState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Final steps of every run, in order: clear running, record and report
    /// the fault, publish `Closed` (releasing the guard).
    fn complete(&self, result: &Result<()>) {
        self.running.store(false, Ordering::Release);

        if let Err(e) = result {
            self.fault.record(e.clone());
        }
        if let Some(fault) = self.fault.get() {
            error!("CLI server run failed: {}", fault);
            let handler = locked(&self.exception_handler).clone();
            if let Some(handler) = handler {
                handler(&fault);
            }
        }

        self.state.send_replace(RunState::Closed);
        info!("CLI server stopped");
    }
}

/// Exclusive right to run; released by publishing `Closed`.
struct RunGuard {
    inner: Arc<ServerInner>,
    finished: bool,
}

impl RunGuard {
    fn tokens(&self) -> StopTokens {
        locked(&self.inner.stop).clone().unwrap_or_default()
    }

    fn finish(mut self, result: &Result<()>) {
        self.finished = true;
        self.inner.complete(result);
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.inner
                .complete(&Err(Error::Runtime("server run aborted".to_string())));
        }
    }
}

/// SSH server exposing an interactive CLI.
///
/// Cloning yields another handle on the same server.
///
/// # Example
///
/// ```ignore
/// let server = CliServer::new(CliHandler::per_session::<MyShell>(), ServerConfig::from_env());
/// server.start_as_task().await?;
/// // ...
/// server.close();
/// server.wait_closed().await?;
/// ```
#[derive(Clone)]
pub struct CliServer {
    inner: Arc<ServerInner>,
}

impl CliServer {
    pub fn new(handler: CliHandler, config: ServerConfig) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            inner: Arc::new(ServerInner {
                config: Arc::new(config),
                handler,
                state,
                running: AtomicBool::new(false),
                registry: Arc::new(ConnectionRegistry::new()),
                stop: Mutex::new(None),
                fault: FaultSlot::default(),
                exception_handler: Mutex::new(None),
                thread: Mutex::new(None),
                thread_id: Mutex::new(None),
                local_addr: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> RunState {
        self.inner.state()
    }

    /// `true` while the listener accepts connections.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Address the listener is bound to, once running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *locked(&self.inner.local_addr)
    }

    pub fn active_connections(&self) -> Vec<ConnectionSnapshot> {
        self.inner
            .registry
            .snapshot()
            .iter()
            .map(|connection| connection.snapshot())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Install the callback that receives the fault ending a run.
    pub fn set_exception_handler(&self, handler: impl Fn(&Error) + Send + Sync + 'static) {
        *locked(&self.inner.exception_handler) = Some(Arc::new(handler));
    }

    /// Weak control handle, as given to interactive handlers.
    pub fn control(&self) -> ServerControl {
        ServerControl {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn acquire(&self) -> Result<RunGuard> {
        let acquired = self.inner.state.send_if_modified(|state| match state {
            RunState::Idle | RunState::Closed => {
                *state = RunState::Starting;
                true
            }
            _ => false,
        });
        if !acquired {
            return Err(Error::AlreadyRunning);
        }

        self.inner.fault.reset();
        *locked(&self.inner.stop) = Some(StopTokens::default());
        *locked(&self.inner.local_addr) = None;
        Ok(RunGuard {
            inner: Arc::clone(&self.inner),
            finished: false,
        })
    }

    /// Serve in the foreground until [`close`](Self::close) is called.
    ///
    /// # Errors
    ///
    /// * [`Error::AlreadyRunning`] if another run is in progress
    /// * Any startup fault, or a teardown fault reported when the run ends
    pub async fn run(&self) -> Result<()> {
        let guard = self.acquire()?;
        self.run_with(guard, None).await
    }

    async fn run_with(&self, guard: RunGuard, latch: Option<StartupLatch>) -> Result<()> {
        let tokens = guard.tokens();
        let result = self.serve(&tokens, latch.as_ref()).await;

        if let Some(latch) = &latch {
            latch.signal(match &result {
                Err(e) => Err(e.clone()),
                Ok(()) => Err(Error::ExitedBeforeReady),
            });
        }
        guard.finish(&result);
        result
    }

    async fn serve(&self, tokens: &StopTokens, latch: Option<&StartupLatch>) -> Result<()> {
        let config = &self.inner.config;
        let host_key = HostKeyProvider::new(config.host_key_path()).load_or_generate()?;

        let address = SocketAddr::new(config.bind_address(), config.port());
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| Error::Bind {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;
        *locked(&self.inner.local_addr) = Some(local_addr);

        let run = Arc::new(RunContext {
            config: Arc::clone(config),
            russh_config: Arc::new(russh_config(config, host_key)),
            handler: self.inner.handler.clone(),
            registry: Arc::clone(&self.inner.registry),
            control: self.control(),
            sessions: TaskTracker::new(),
            stop: tokens.stop.clone(),
            abort: tokens.abort.clone(),
        });

        self.inner.running.store(true, Ordering::Release);
        self.inner.transition(RunState::Starting, RunState::Running);
        info!(address = %local_addr, "CLI server listening");
        if let Some(latch) = latch {
            latch.signal(Ok(()));
        }

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = tokens.stop.cancelled() => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        debug!(%peer, "Accepted connection");
                        let connection =
                            Arc::new(ConnectionHandle::new(peer, run.stop.child_token()));
                        let registration = run.registry.register(Arc::clone(&connection));
                        connections.spawn(serve_connection(
                            Arc::clone(&run),
                            connection,
                            registration,
                            socket,
                        ));
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        }

        self.shutdown(listener, connections, &run).await
    }

    /// Close connections, then the listener, then wait for everything to
    /// unwind. A forced close aborts the connection tasks instead of waiting.
    async fn shutdown(
        &self,
        listener: TcpListener,
        mut connections: JoinSet<()>,
        run: &RunContext,
    ) -> Result<()> {
        self.inner.transition(RunState::Running, RunState::Closing);
        info!("CLI server closing ({} connection(s))", run.registry.len());

        let teardown = run.registry.close_all().await;
        if let Err(e) = &teardown {
            warn!("Connection teardown failed: {}", e);
        }
        drop(listener);

        let drain = self.inner.config.drain_timeout();
        let unwound = tokio::select! {
            drained = tokio::time::timeout(drain, unwind(&mut connections, &run.sessions)) => {
                drained.is_ok()
            }
            _ = run.abort.cancelled() => false,
        };
        if !unwound {
            let forced = run.abort.is_cancelled();
            if forced {
                warn!("Forced close; aborting {} connection task(s)", connections.len());
            } else {
                warn!(
                    "Shutdown did not finish within {:?}; aborting {} connection task(s)",
                    drain,
                    connections.len()
                );
            }
            connections.abort_all();
            while connections.join_next().await.is_some() {}
            run.sessions.close();
            if forced {
                // Aborted sessions drop their handlers without a grace period.
                let _ = tokio::time::timeout(drain, run.sessions.wait()).await;
            }
        }

        teardown
    }

    /// Start on the caller's runtime.
    ///
    /// Resolves once the server accepts connections.
    ///
    /// # Errors
    ///
    /// * [`Error::AlreadyRunning`] if another run is in progress
    /// * The startup fault if the run failed before accepting connections
    pub async fn start_as_task(&self) -> Result<()> {
        let guard = self.acquire()?;
        let mut state = self.inner.state.subscribe();
        let server = self.clone();
        let task = tokio::spawn(async move { server.run_with(guard, None).await });

        let observed = match state.wait_for(|s| *s != RunState::Starting).await {
            Ok(observed) => *observed,
            Err(_) => RunState::Closed,
        };
        match observed {
            RunState::Running | RunState::Closing => Ok(()),
            RunState::Idle | RunState::Starting | RunState::Closed => match task.await {
                Ok(Ok(())) => Err(Error::ExitedBeforeReady),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(Error::Runtime(format!("server task failed: {e}"))),
            },
        }
    }

    /// Start on a dedicated thread with its own runtime.
    ///
    /// Blocks until the server accepts connections, fails, or the configured
    /// start timeout elapses.
    ///
    /// # Errors
    ///
    /// * [`Error::AlreadyRunning`] if another run is in progress
    /// * [`Error::HungStart`] on timeout; the half-started run is stopped
    /// * The startup fault if the run failed before accepting connections
    pub fn start_as_thread(&self) -> Result<()> {
        let guard = self.acquire()?;

        if let Some(previous) = locked(&self.inner.thread).take() {
            let _ = previous.join();
        }

        let latch = StartupLatch::default();
        let thread_latch = latch.clone();
        let server = self.clone();
        let spawned = thread::Builder::new()
            .name(SERVER_THREAD_NAME.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let err = Error::Runtime(e.to_string());
                        thread_latch.signal(Err(err.clone()));
                        guard.finish(&Err(err));
                        return;
                    }
                };
                let _ = runtime.block_on(server.run_with(guard, Some(thread_latch)));
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => return Err(Error::Runtime(format!("failed to spawn server thread: {e}"))),
        };
        *locked(&self.inner.thread_id) = Some(handle.thread().id());
        *locked(&self.inner.thread) = Some(handle);

        let timeout = self.inner.config.start_timeout();
        match latch.wait(timeout) {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => {
                self.join_thread();
                Err(e)
            }
            None => {
                let err = Error::HungStart(timeout);
                warn!("{}; stopping the half-started server", err);
                self.inner.fault.record(err.clone());
                self.inner.request_stop(false);
                if latch.wait(HUNG_START_GRACE).is_some() {
                    self.join_thread_if_finished();
                }
                Err(err)
            }
        }
    }

    /// Request shutdown.
    ///
    /// Every registered connection is closed, then the listener. In thread
    /// mode this blocks until the server thread has exited, unless called
    /// from that thread. In task mode it returns at once; await
    /// [`wait_closed`](Self::wait_closed) to observe completion.
    pub fn close(&self) {
        self.close_with(false);
    }

    /// Request shutdown, optionally forced.
    ///
    /// With `force` set, connection tasks are aborted at once and running
    /// handlers are dropped without waiting out
    /// [`CANCEL_GRACE`](crate::server::session::CANCEL_GRACE) or the
    /// drain timeout. Forcing also applies to a graceful close already in
    /// progress. Blocks like [`close`](Self::close) in thread mode.
    pub fn close_with(&self, force: bool) {
        self.inner.request_stop(force);
        if self.on_server_thread() {
            return;
        }
        self.join_thread();
    }

    /// Wait until the current run, if any, has fully unwound.
    ///
    /// Returns the fault that ended the run, if there was one.
    pub async fn wait_closed(&self) -> Result<()> {
        let mut state = self.inner.state.subscribe();
        let _ = state
            .wait_for(|s| matches!(s, RunState::Idle | RunState::Closed))
            .await;
        match self.inner.fault.get() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    fn on_server_thread(&self) -> bool {
        *locked(&self.inner.thread_id) == Some(thread::current().id())
    }

    fn join_thread(&self) {
        let handle = locked(&self.inner.thread).take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            error!("CLI server thread panicked");
        }
    }

    fn join_thread_if_finished(&self) {
        let finished = locked(&self.inner.thread)
            .as_ref()
            .is_some_and(|handle| handle.is_finished());
        if finished {
            self.join_thread();
        }
    }
}

impl fmt::Debug for CliServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CliServer")
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .field("connections", &self.connection_count())
            .finish()
    }
}

async fn unwind(connections: &mut JoinSet<()>, sessions: &TaskTracker) {
    while connections.join_next().await.is_some() {}
    sessions.close();
    sessions.wait().await;
}

fn russh_config(config: &ServerConfig, host_key: PrivateKey) -> server::Config {
    server::Config {
        methods: config.auth_methods(),
        keys: vec![host_key],
        auth_rejection_time: Duration::from_millis(250),
        auth_rejection_time_initial: Some(Duration::ZERO),
        ..Default::default()
    }
}

/// Weak handle on a server, given to interactive handlers.
///
/// It does not keep the server alive; once the server is dropped every call
/// is a no-op.
#[derive(Clone)]
pub struct ServerControl {
    inner: Weak<ServerInner>,
}

impl ServerControl {
    /// A control attached to no server.
    pub fn detached() -> Self {
        Self { inner: Weak::new() }
    }

    /// Ask the server to stop. Does not wait.
    pub fn shutdown(&self) {
        if let Some(inner) = self.inner.upgrade() {
            info!("Shutdown requested by session");
            inner.request_stop(false);
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.running.load(Ordering::Acquire))
    }

    pub fn connection_count(&self) -> usize {
        self.inner
            .upgrade()
            .map_or(0, |inner| inner.registry.len())
    }

    pub fn max_connections(&self) -> Option<usize> {
        self.inner
            .upgrade()
            .and_then(|inner| inner.config.max_connections())
    }
}

impl fmt::Debug for ServerControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerControl")
            .field("attached", &(self.inner.strong_count() > 0))
            .finish()
    }
}
