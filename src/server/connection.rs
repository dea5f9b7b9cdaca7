//! Per-connection SSH handler.
//!
//! One [`ConnectionHandler`] serves one accepted socket. It authenticates the
//! client through the [`AuthenticationGate`], applies the admission cap when a
//! session channel is opened, and routes channel events to that channel's
//! [`SessionBridge`].
//!
//! russh has no break request, so signals stand in for it: `HUP` is treated
//! as connection loss, `TERM` and `KILL` as a break, `INT` as an interrupt.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use russh::keys::PublicKey;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, Pty, Sig};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::server::auth::{AuthDecision, AuthenticationGate};
use crate::server::config::ServerConfig;
use crate::server::error::Error;
use crate::server::handler::CliHandler;
use crate::server::lifecycle::ServerControl;
use crate::server::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, Registration};
use crate::server::session::{ChannelWriter, SessionBridge, TerminalSize};

/// Immutable description of an authenticated connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    id: ConnectionId,
    remote_addr: SocketAddr,
    username: String,
}

impl ConnectionInfo {
    pub(crate) fn new(id: ConnectionId, remote_addr: SocketAddr, username: String) -> Self {
        Self {
            id,
            remote_addr,
            username,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test(username: &str) -> Self {
        Self::new(
            ConnectionId::new(),
            SocketAddr::from(([127, 0, 0, 1], 40022)),
            username.to_string(),
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_addr.port()
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

/// State shared by every connection of one run.
pub(crate) struct RunContext {
    pub config: Arc<ServerConfig>,
    pub russh_config: Arc<server::Config>,
    pub handler: CliHandler,
    pub registry: Arc<ConnectionRegistry>,
    pub control: ServerControl,
    pub sessions: TaskTracker,
    pub stop: CancellationToken,
    /// Fired by a forced close; sessions skip their cancellation grace.
    pub abort: CancellationToken,
}

pub(crate) struct ConnectionHandler {
    run: Arc<RunContext>,
    connection: Arc<ConnectionHandle>,
    gate: AuthenticationGate,
    username: Option<String>,
    sessions: HashMap<ChannelId, Arc<SessionBridge>>,
}

impl ConnectionHandler {
    pub(crate) fn new(run: Arc<RunContext>, connection: Arc<ConnectionHandle>) -> Self {
        let gate = AuthenticationGate::new(Arc::clone(&run.config));
        Self {
            run,
            connection,
            gate,
            username: None,
            sessions: HashMap::new(),
        }
    }

    fn accept(&mut self, user: &str, method: &'static str) -> Auth {
        info!(
            peer = %self.connection.peer(),
            user,
            connection_id = %self.connection.id(),
            method,
            "Client authenticated"
        );
        self.username = Some(user.to_string());
        self.connection.set_username(user);
        Auth::Accept
    }

    /// Rejection that keeps every configured method on offer, so the client
    /// may retry until russh's attempt limit is reached.
    fn reject(&self) -> Auth {
        Auth::Reject {
            proceed_with_methods: Some(self.run.config.auth_methods()),
            partial_success: false,
        }
    }

    fn check_public_key(&self, user: &str, key: &PublicKey) -> bool {
        self.gate.validate_public_key(user, key)
    }

    /// Admission check for a new session channel.
    ///
    /// This connection is already registered, so it counts towards the cap.
    fn admit(&self) -> Result<(), Error> {
        let Some(limit) = self.run.config.max_connections() else {
            return Ok(());
        };
        let active = self.run.registry.len();
        if active > limit {
            return Err(Error::TooManyConnections { active, limit });
        }
        Ok(())
    }

    fn bridge(&self, channel: ChannelId) -> Option<&Arc<SessionBridge>> {
        let bridge = self.sessions.get(&channel);
        if bridge.is_none() {
            debug!(connection_id = %self.connection.id(), channel = ?channel, "Event for unknown channel");
        }
        bridge
    }

    fn lose_all_sessions(&mut self) {
        for (_, bridge) in self.sessions.drain() {
            bridge.connection_lost();
        }
    }
}

impl server::Handler for ConnectionHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        match self.gate.begin_auth(user).await {
            AuthDecision::NoAuthRequired => Ok(self.accept(user, "none")),
            AuthDecision::CredentialsRequired => Ok(self.reject()),
        }
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if self.gate.ensure_begun(user).await == AuthDecision::NoAuthRequired {
            return Ok(self.accept(user, "none"));
        }
        if self.gate.validate_password(user, password).await {
            return Ok(self.accept(user, "password"));
        }
        debug!(peer = %self.connection.peer(), user, "Password rejected");
        Ok(self.reject())
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.gate.ensure_begun(user).await == AuthDecision::NoAuthRequired
            || self.check_public_key(user, public_key)
        {
            return Ok(Auth::Accept);
        }
        Ok(self.reject())
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.gate.ensure_begun(user).await == AuthDecision::NoAuthRequired {
            return Ok(self.accept(user, "none"));
        }
        if self.check_public_key(user, public_key) {
            return Ok(self.accept(user, "publickey"));
        }
        debug!(peer = %self.connection.peer(), user, "Public key rejected");
        Ok(self.reject())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let id = channel.id();
        if let Err(e) = self.admit() {
            warn!(
                peer = %self.connection.peer(),
                connection_id = %self.connection.id(),
                channel = ?id,
                "Rejecting session channel: {}", e
            );
            return Ok(false);
        }

        let username = self.username.clone().unwrap_or_default();
        let info = ConnectionInfo::new(self.connection.id(), self.connection.peer(), username);
        let bridge = SessionBridge::new(
            info,
            self.run.handler.clone(),
            self.run.control.clone(),
            self.run.sessions.clone(),
            self.connection.close_token().child_token(),
            self.run.abort.clone(),
        );

        let (_read_half, write_half) = channel.split();
        if !bridge.channel_established(Arc::new(ChannelWriter::new(write_half))) {
            return Ok(false);
        }
        debug!(connection_id = %self.connection.id(), channel = ?id, "Session channel opened");
        self.sessions.insert(id, bridge);
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        match self.bridge(channel) {
            Some(bridge) => {
                bridge.pty_requested(term, TerminalSize::new(col_width, row_height));
                session.channel_success(channel)?;
            }
            None => session.channel_failure(channel)?,
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(bridge) = self.bridge(channel).cloned() else {
            session.channel_failure(channel)?;
            return Ok(());
        };
        if !bridge.shell_requested() {
            session.channel_failure(channel)?;
            return Ok(());
        }
        session.channel_success(channel)?;
        if let Err(e) = bridge.session_started() {
            warn!(connection_id = %self.connection.id(), channel = ?channel, "Session not started: {}", e);
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(connection_id = %self.connection.id(), channel = ?channel, "Exec requests are not supported");
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(bridge) = self.bridge(channel) {
            bridge.data_received(data);
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(bridge) = self.bridge(channel) {
            bridge.terminal_size_changed(TerminalSize::new(col_width, row_height));
        }
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(bridge) = self.bridge(channel) else {
            return Ok(());
        };
        debug!(connection_id = %self.connection.id(), channel = ?channel, "Signal {:?}", signal);
        match signal {
            Sig::INT => bridge.interrupt_received(),
            Sig::HUP => bridge.connection_lost(),
            Sig::TERM | Sig::KILL => bridge.break_received(),
            _ => {}
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(bridge) = self.bridge(channel) {
            bridge.eof_received();
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(bridge) = self.sessions.remove(&channel) {
            debug!(connection_id = %self.connection.id(), channel = ?channel, "Channel closed by client");
            bridge.connection_lost();
        }
        Ok(())
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.lose_all_sessions();
    }
}

/// Drive one accepted socket until the connection ends or is closed.
///
/// `registration` keeps the connection in the registry; it is dropped, and
/// the connection deregistered, when this future completes or is aborted.
pub(crate) async fn serve_connection(
    run: Arc<RunContext>,
    connection: Arc<ConnectionHandle>,
    registration: Registration,
    socket: TcpStream,
) {
    let _registration = registration;
    let peer = connection.peer();
    let close = connection.close_token().clone();
    let handler = ConnectionHandler::new(Arc::clone(&run), Arc::clone(&connection));

    let running = tokio::select! {
        biased;
        _ = close.cancelled() => {
            debug!(%peer, connection_id = %connection.id(), "Closed before handshake");
            return;
        }
        started = server::run_stream(Arc::clone(&run.russh_config), socket, handler) => match started {
            Ok(running) => running,
            Err(e) => {
                debug!(%peer, "SSH handshake failed: {}", e);
                return;
            }
        }
    };

    connection.attach(running.handle());
    if close.is_cancelled() {
        // Shutdown raced the handshake; the registry may have missed this one
        if let Err(e) = connection.close().await {
            debug!(%peer, "Disconnect failed: {}", e);
        }
    }

    let ended = running.await;
    connection.mark_finished();
    match ended {
        Ok(()) => debug!(%peer, connection_id = %connection.id(), "Connection ended"),
        Err(e) => debug!(%peer, connection_id = %connection.id(), "Connection ended with error: {}", e),
    }
}
