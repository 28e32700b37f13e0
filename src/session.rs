//! WebSocket session controller.
//!
//! Owns the socket lifecycle: sequences "ensure connection, wait for
//! authentication, send", retries recoverable failures, pairs inbound
//! responses with their in-flight commands and demultiplexes binary events.

use crate::auth::LoxoneAuth;
use crate::command::{Command, ControlCommand, SecuredCommand, KEEP_ALIVE_COMMAND};
use crate::config::LoxoneEndpoint;
use crate::dispatch::EventDispatcher;
use crate::error::{LoxoneError, Result};
use crate::latch::Latch;
use crate::listener::{
    AuthListener, CommandResponseListener, LoxoneEventListener, LoxoneWebSocketListener,
};
use crate::message::{
    parse_response, read_text_events, read_value_events, LoxoneMessage, MessageHeader,
    MessageKind, ParsedResponse,
};
use crate::registry::CommandRegistry;
use crate::scheduler::{ScheduledTask, Scheduler};
use crate::transport::{
    tungstenite_factory, TransportFactory, TransportHooks, WebSocketTransport,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Pause between send retries
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Observable lifecycle of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Closing,
}

struct SessionSettings {
    auth_timeout_secs: AtomicU64,
    visu_timeout_secs: AtomicU64,
    retries: AtomicU32,
    auto_restart: AtomicBool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            auth_timeout_secs: AtomicU64::new(3),
            visu_timeout_secs: AtomicU64::new(3),
            retries: AtomicU32::new(5),
            auto_restart: AtomicBool::new(false),
        }
    }
}

/// The connection slot: transport plus the identity of the current
/// authentication gate. Writers replace both together; senders read.
#[derive(Default)]
struct ConnSlot {
    transport: Option<Arc<dyn WebSocketTransport>>,
    auth_latch: Option<Arc<Latch>>,
}

/// Client session over the Miniserver's WebSocket channel.
///
/// Cheap to clone handles are not provided; share the session behind an
/// `Arc` if multiple tasks send through it.
pub struct LoxoneWebSocket {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    weak_self: Weak<SessionInner>,
    endpoint: LoxoneEndpoint,
    auth: Arc<LoxoneAuth>,
    factory: TransportFactory,
    conn: tokio::sync::RwLock<ConnSlot>,
    visu_latch: tokio::sync::Mutex<Option<Arc<Latch>>>,
    registry: CommandRegistry,
    dispatcher: EventDispatcher,
    scheduler: Arc<Scheduler>,
    settings: SessionSettings,
    state: std::sync::Mutex<SessionState>,
    auto_restart_task: std::sync::Mutex<Option<ScheduledTask>>,
    forwarder: std::sync::Mutex<Option<tokio::task::AbortHandle>>,
}

impl LoxoneWebSocket {
    /// Create a session using the production transport. Must be called from
    /// within a tokio runtime.
    pub fn new(endpoint: LoxoneEndpoint, auth: Arc<LoxoneAuth>) -> Self {
        Self::with_transport_factory(endpoint, auth, tungstenite_factory())
    }

    /// Create a session with an injected transport factory. This is the test
    /// seam; production code uses [`LoxoneWebSocket::new`].
    pub fn with_transport_factory(
        endpoint: LoxoneEndpoint,
        auth: Arc<LoxoneAuth>,
        factory: TransportFactory,
    ) -> Self {
        let scheduler = Arc::new(Scheduler::new());
        let inner = Arc::new_cyclic(|weak| SessionInner {
            weak_self: weak.clone(),
            endpoint,
            auth: auth.clone(),
            factory,
            conn: tokio::sync::RwLock::new(ConnSlot::default()),
            visu_latch: tokio::sync::Mutex::new(None),
            registry: CommandRegistry::new(),
            dispatcher: EventDispatcher::new(),
            scheduler: scheduler.clone(),
            settings: SessionSettings::default(),
            state: std::sync::Mutex::new(SessionState::default()),
            auto_restart_task: std::sync::Mutex::new(None),
            forwarder: std::sync::Mutex::new(None),
        });

        // wire the auth engine: it sends through us, schedules through our
        // scheduler, answers as a response listener and gates our latches
        let (tx, rx) = mpsc::unbounded_channel();
        auth.set_command_sender(tx);
        auth.set_scheduler(scheduler);
        auth.register_listener(Arc::new(AuthGuard {
            session: Arc::downgrade(&inner),
        }));
        inner.dispatcher.register_command_listener(auth);

        let forwarder = tokio::spawn(forward_auth_commands(rx, Arc::downgrade(&inner)));
        *inner.forwarder.lock().unwrap() = Some(forwarder.abort_handle());

        Self { inner }
    }

    /// Send a command, establishing the connection and waiting for
    /// authentication first. Responses are delivered to registered
    /// command-response listeners.
    pub async fn send_command(&self, command: Command) -> Result<()> {
        if !command.is_ws_supported() {
            return Err(LoxoneError::invalid_input(
                "only websocket commands are supported",
            ));
        }
        let retries = self.inner.settings.retries.load(Ordering::Relaxed);
        self.inner.send_with_retry(command, retries).await
    }

    /// Send a secured command, additionally waiting for the visualisation
    /// handshake. The wrapped command is rebuilt on every retry because the
    /// visualisation hash may have rotated.
    pub async fn send_secure_command(&self, command: ControlCommand) -> Result<()> {
        let retries = self.inner.settings.retries.load(Ordering::Relaxed);
        self.inner.send_secure_with_retry(command, retries).await
    }

    /// Seconds to wait for the authentication handshake before giving up
    pub fn set_auth_timeout_seconds(&self, seconds: u64) {
        self.inner
            .settings
            .auth_timeout_secs
            .store(seconds, Ordering::Relaxed);
    }

    /// Seconds to wait for the visualisation handshake before giving up
    pub fn set_visu_timeout_seconds(&self, seconds: u64) {
        self.inner
            .settings
            .visu_timeout_secs
            .store(seconds, Ordering::Relaxed);
    }

    /// Number of send retries after recoverable failures
    pub fn set_retries(&self, retries: u32) {
        self.inner.settings.retries.store(retries, Ordering::Relaxed);
    }

    /// Reestablish the connection periodically after a remote close
    pub fn set_auto_restart(&self, auto_restart: bool) {
        self.inner
            .settings
            .auto_restart
            .store(auto_restart, Ordering::Relaxed);
    }

    pub fn register_command_listener(&self, listener: Arc<dyn CommandResponseListener>) {
        self.inner.dispatcher.register_command_listener(listener);
    }

    pub fn register_event_listener(&self, listener: Arc<dyn LoxoneEventListener>) {
        self.inner.dispatcher.register_event_listener(listener);
    }

    pub fn register_web_socket_listener(&self, listener: Arc<dyn LoxoneWebSocketListener>) {
        self.inner.dispatcher.register_web_socket_listener(listener);
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock().unwrap()
    }

    pub fn auth(&self) -> &Arc<LoxoneAuth> {
        &self.inner.auth
    }

    /// Shut down the scheduler and close the socket, waiting for the inbound
    /// pump to drain.
    pub async fn close(&self) -> Result<()> {
        self.inner.set_state(SessionState::Closing);
        self.inner.scheduler.shutdown_now();
        if let Some(forwarder) = self.inner.forwarder.lock().unwrap().take() {
            forwarder.abort();
        }
        let transport = self.inner.conn.read().await.transport.clone();
        if let Some(transport) = transport {
            transport.close().await?;
        }
        self.inner.set_state(SessionState::Disconnected);
        Ok(())
    }
}

impl SessionInner {
    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.auth_timeout_secs.load(Ordering::Relaxed))
    }

    fn visu_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.visu_timeout_secs.load(Ordering::Relaxed))
    }

    /// Establish or reuse a connection. Exactly one writer recreates the
    /// transport; losers fall through to the wait phase and block on the
    /// authentication gate like everybody else.
    async fn ensure_connection(&self) -> Result<()> {
        if !self.auth.is_initialized() {
            self.auth.init().await?;
        }

        let open = {
            let slot = self.conn.read().await;
            slot.transport.as_ref().map(|t| t.is_open()).unwrap_or(false)
        };

        if !open {
            trace!("(re)opening websocket connection");
            if let Ok(mut slot) = self.conn.try_write() {
                if slot.transport.as_ref().map(|t| t.is_open()).unwrap_or(false) {
                    return Ok(()); // raced with another writer
                }
                self.set_state(SessionState::Connecting);
                slot.auth_latch = Some(Arc::new(Latch::new()));
                let hooks: Weak<dyn TransportHooks> = self.weak_self.clone();
                let transport = (self.factory)(hooks, self.endpoint.web_socket_url()?);
                slot.transport = Some(transport.clone());
                if let Err(e) = transport.connect().await {
                    slot.transport = None;
                    self.set_state(SessionState::Disconnected);
                    return Err(e);
                }
            }
        } else if !self.auth.is_usable() {
            info!("authentication is not usable, starting the authentication");
            {
                let mut slot = self.conn.write().await;
                slot.auth_latch = Some(Arc::new(Latch::new()));
            }
            self.auth.start_authentication()?;
        }
        Ok(())
    }

    async fn send_with_retry(&self, command: Command, retries: u32) -> Result<()> {
        let mut retries_left = retries;
        loop {
            self.ensure_connection().await?;
            match self.try_send(&command).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    if retries_left == 0 {
                        info!("connection or authentication failed too many times, giving up");
                        return Err(LoxoneError::auth_timeout(
                            "unable to authenticate within timeout with retry",
                        ));
                    }
                    info!("connection or authentication failed, retrying");
                    retries_left -= 1;
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_secure_with_retry(&self, command: ControlCommand, retries: u32) -> Result<()> {
        let mut retries_left = retries;
        loop {
            self.ensure_connection().await?;
            match self.try_send_secure(&command).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    if retries_left == 0 {
                        info!("connection or authentication failed too many times, giving up");
                        return Err(LoxoneError::auth_timeout(
                            "unable to authenticate within timeout with retry",
                        ));
                    }
                    info!("connection or authentication failed, retrying");
                    retries_left -= 1;
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait for the authentication gate under the reader side of the
    /// connection slot, then write. A gate timeout closes the socket.
    async fn try_send(&self, command: &Command) -> Result<()> {
        let slot = self.conn.read().await;
        let transport = self.wait_for_auth(&slot, self.auth_timeout(), true).await?;
        self.send_internal(&transport, command).await
    }

    async fn try_send_secure(&self, command: &ControlCommand) -> Result<()> {
        let slot = self.conn.read().await;
        let transport = self.wait_for_auth(&slot, self.auth_timeout(), true).await?;

        let visu_latch = {
            let mut guard = self.visu_latch.lock().await;
            match guard.as_ref() {
                Some(latch) if !latch.is_complete() => latch.clone(),
                // absent or already spent: a fresh handshake re-derives the hash
                _ => {
                    let latch = Arc::new(Latch::new());
                    *guard = Some(latch.clone());
                    self.auth.start_visu_authentication()?;
                    latch
                }
            }
        };
        if !visu_latch.wait(self.visu_timeout()).await {
            // only the secure path failed, the socket stays up
            return Err(LoxoneError::connection(
                "unable to complete visualisation authentication within timeout",
            ));
        }

        let visu_hash = self.auth.visu_hash().ok_or_else(|| {
            LoxoneError::invalid_state("visualisation hash missing after completed handshake")
        })?;
        let secured = SecuredCommand::new(command.clone(), visu_hash);
        self.send_internal(&transport, &secured.command()).await
    }

    /// Resolve the gate in the given slot and wait for it. On timeout the
    /// socket is optionally closed and a recoverable failure returned.
    async fn wait_for_auth(
        &self,
        slot: &ConnSlot,
        timeout: Duration,
        close_on_timeout: bool,
    ) -> Result<Arc<dyn WebSocketTransport>> {
        let latch = slot
            .auth_latch
            .clone()
            .ok_or_else(|| LoxoneError::connection("no authentication cycle active"))?;
        let transport = slot
            .transport
            .clone()
            .ok_or_else(|| LoxoneError::connection("websocket is not connected"))?;

        if latch.wait(timeout).await {
            trace!("waiting for authentication has been successful");
            Ok(transport)
        } else {
            if close_on_timeout {
                if let Err(e) = transport.close().await {
                    warn!("closing websocket after authentication timeout failed: {e}");
                }
            }
            Err(LoxoneError::connection(
                "unable to authenticate within timeout",
            ))
        }
    }

    /// Enqueue, then write. Enqueueing first closes the race with responses
    /// arriving before the send call returns; a failed write retracts the
    /// entry again.
    async fn send_internal(
        &self,
        transport: &Arc<dyn WebSocketTransport>,
        command: &Command,
    ) -> Result<()> {
        debug!(command = command.command(), "sending websocket message");
        let enqueued = if command.command() == KEEP_ALIVE_COMMAND {
            false // answered by a binary keep-alive frame, not a text response
        } else {
            self.registry.submit(command)
        };
        if let Err(e) = transport.send(command.command()).await {
            if enqueued {
                self.registry.retract(command);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Response code taxonomy: only matching 200s reach the listener walk,
    /// everything else is logged and dropped. Auth failures surface to
    /// senders through gate timeouts.
    fn check_message(&self, command: &Command, message: &LoxoneMessage) -> bool {
        match message.code {
            200 => {
                if command.is(&message.control) {
                    true
                } else {
                    error!(
                        expected = command.should_contain(),
                        received = %message.control,
                        "response control does not answer the expected command"
                    );
                    false
                }
            }
            400 => {
                debug!("not authenticated yet, dropping response");
                false
            }
            401 => {
                debug!("not authenticated, bad credentials");
                false
            }
            404 => {
                debug!("device not found");
                false
            }
            420 => {
                debug!("not authenticated, authentication took too long");
                false
            }
            500 => {
                debug!("not authorised for secured action");
                false
            }
            other => {
                debug!(code = other, "unknown response code, dropping message");
                false
            }
        }
    }

    fn arm_auto_restart(&self) {
        if !self.settings.auto_restart.load(Ordering::Relaxed) {
            return;
        }
        let retries = self.settings.retries.load(Ordering::Relaxed) as u64;
        let rate = Duration::from_secs(
            (retries + 1) * self.settings.auth_timeout_secs.load(Ordering::Relaxed) + 1,
        );
        info!(seconds = rate.as_secs(), "scheduling automatic websocket restart");

        let weak = self.weak_self.clone();
        let task = self.scheduler.schedule_at_fixed_rate(rate, rate, move || {
            let weak = weak.clone();
            async move {
                if let Some(session) = weak.upgrade() {
                    if let Err(e) = session.ensure_connection().await {
                        warn!("automatic restart attempt failed: {e}");
                    }
                }
            }
        });
        *self.auto_restart_task.lock().unwrap() = Some(task);
    }
}

/// Drains the auth engine's outbound channel onto the current transport.
/// Auth traffic does not wait on the authentication gate.
async fn forward_auth_commands(
    mut rx: mpsc::UnboundedReceiver<Command>,
    session: Weak<SessionInner>,
) {
    while let Some(command) = rx.recv().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        let transport = session.conn.read().await.transport.clone();
        match transport {
            Some(transport) => {
                if let Err(e) = session.send_internal(&transport, &command).await {
                    warn!(
                        command = command.command(),
                        "failed to send authentication command: {e}"
                    );
                }
            }
            None => warn!(
                command = command.command(),
                "no connection for authentication command"
            ),
        }
    }
}

#[async_trait]
impl TransportHooks for SessionInner {
    async fn connection_opened(&self) {
        if let Some(task) = self.auto_restart_task.lock().unwrap().take() {
            debug!("connection reestablished, cancelling automatic restart");
            task.cancel();
        }
        self.set_state(SessionState::Authenticating);

        // authentication is driven off the transport's I/O task
        let weak = self.weak_self.clone();
        self.scheduler.execute(async move {
            if let Some(session) = weak.upgrade() {
                if let Err(e) = session.auth.start_authentication() {
                    error!("failed to start authentication: {e}");
                }
                session.dispatcher.notify_opened();
            }
        });
    }

    async fn process_message(&self, message: &str) {
        let Some(command) = self.registry.pop() else {
            error!("no command expected, dropping response");
            return;
        };
        match parse_response(message, command.category()) {
            Ok(ParsedResponse::Message(parsed)) => {
                if self.check_message(&command, &parsed) {
                    self.dispatcher
                        .process_command(&command, &ParsedResponse::Message(parsed))
                        .await;
                } else {
                    debug!(control = %parsed.control, code = parsed.code, "response dropped");
                }
            }
            Ok(raw) => self.dispatcher.process_command(&command, &raw).await,
            Err(e) => error!("can't parse response: {e}"),
        }
    }

    async fn process_events(&self, header: &MessageHeader, payload: &[u8]) {
        match header.kind {
            MessageKind::EventValue => match read_value_events(payload) {
                Ok(events) => {
                    trace!(count = events.len(), "incoming value events");
                    self.dispatcher.dispatch_value_events(&events);
                }
                Err(e) => warn!("dropping malformed value event table: {e}"),
            },
            MessageKind::EventText => match read_text_events(payload) {
                Ok(events) => {
                    trace!(count = events.len(), "incoming text events");
                    self.dispatcher.dispatch_text_events(&events);
                }
                Err(e) => warn!("dropping malformed text event table: {e}"),
            },
            kind => trace!(?kind, len = payload.len(), "incoming binary message discarded"),
        }
    }

    async fn connection_closed(&self, code: u16, remote: bool) {
        debug!(code, remote, "websocket connection closed");
        self.dispatcher.notify_closed(code, remote);
        if remote {
            self.arm_auto_restart();
        }
    }

    async fn ws_closed(&self) {
        self.registry.drain();
        self.auth.ws_closed();
        self.set_state(SessionState::Disconnected);
    }
}

/// Counts down the session's one-shot gates when the auth engine reports
/// completion. A completion with no active gate is a bug, not a network
/// condition.
struct AuthGuard {
    session: Weak<SessionInner>,
}

#[async_trait]
impl AuthListener for AuthGuard {
    async fn auth_completed(&self) -> Result<()> {
        let Some(session) = self.session.upgrade() else {
            return Ok(());
        };
        let latch = session.conn.read().await.auth_latch.clone();
        match latch {
            Some(latch) => {
                latch.count_down();
                session.set_state(SessionState::Ready);
                Ok(())
            }
            None => Err(LoxoneError::invalid_state("authentication not guarded")),
        }
    }

    async fn visu_auth_completed(&self) -> Result<()> {
        let Some(session) = self.session.upgrade() else {
            return Ok(());
        };
        let latch = session.visu_latch.lock().await.clone();
        match latch {
            Some(latch) => {
                latch.count_down();
                Ok(())
            }
            None => Err(LoxoneError::invalid_state(
                "visualisation authentication not guarded",
            )),
        }
    }
}
