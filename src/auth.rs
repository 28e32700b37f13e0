//! Token authentication engine.
//!
//! Drives the challenge/response handshake over the socket: key exchange,
//! user key retrieval, token acquisition, proactive refresh and the
//! secondary visualisation handshake gating secured commands. The engine
//! never owns the socket; outbound commands go through an injected sender
//! and timed work through the shared scheduler.

use crate::command::{Command, ResponseCategory};
use crate::config::LoxoneCredentials;
use crate::crypto::{
    self, credentials_hash, password_hash, token_hash, HashAlg, SessionKey,
};
use crate::error::{LoxoneError, Result};
use crate::http::HttpFetcher;
use crate::listener::{AuthListener, CommandResponseListener, ListenerState};
use crate::message::{ApiInfo, AuthKey, LoxoneMessage, ParsedResponse, PubKeyInfo, Token};
use crate::scheduler::{ScheduledTask, Scheduler};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rsa::RsaPublicKey;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outbound path injected by the session controller; auth traffic bypasses
/// the authentication gate senders wait on.
pub type CommandSender = mpsc::UnboundedSender<Command>;

/// Client identification sent with token requests
const CLIENT_INFO: &str = "loxone-ws";

/// Fraction of the token validity window after which a refresh is scheduled
const REFRESH_FRACTION: f64 = 0.8;

/// Authentication progress, each transition driven by a specific inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    Uninitialised,
    KeyExchanged,
    Challenged,
    TokenIssued,
    Refreshing,
    Failed,
}

/// Response the primary sequence is currently waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthStep {
    KeyExchange,
    UserKey,
    Token,
}

/// Response the visualisation handshake is currently waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisuStep {
    Salt,
    Confirmation,
}

struct UserKey {
    key: String,
    alg: HashAlg,
}

struct ActiveToken {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct AuthInner {
    state: AuthState,
    pending: Option<AuthStep>,
    visu_pending: Option<VisuStep>,
    api_info: Option<ApiInfo>,
    public_key: Option<RsaPublicKey>,
    user_key: Option<UserKey>,
    token: Option<ActiveToken>,
    visu_hash_candidate: Option<String>,
    visu_hash: Option<String>,
    refresh: Option<ScheduledTask>,
}

/// The authentication engine. One instance per session; it survives
/// reconnects but `ws_closed` resets it completely.
pub struct LoxoneAuth {
    weak_self: Weak<LoxoneAuth>,
    credentials: LoxoneCredentials,
    http: Arc<dyn HttpFetcher>,
    client_id: Uuid,
    sender: Mutex<Option<CommandSender>>,
    scheduler: Mutex<Option<Arc<Scheduler>>>,
    listeners: Mutex<Vec<Arc<dyn AuthListener>>>,
    inner: Mutex<AuthInner>,
}

impl LoxoneAuth {
    pub fn new(http: Arc<dyn HttpFetcher>, credentials: LoxoneCredentials) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            credentials,
            http,
            client_id: Uuid::new_v4(),
            sender: Mutex::new(None),
            scheduler: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            inner: Mutex::new(AuthInner::default()),
        })
    }

    /// Attach the outbound command path. Done once by the session controller.
    pub fn set_command_sender(&self, sender: CommandSender) {
        *self.sender.lock().unwrap() = Some(sender);
    }

    /// Attach the shared scheduler used for token refresh.
    pub fn set_scheduler(&self, scheduler: Arc<Scheduler>) {
        *self.scheduler.lock().unwrap() = Some(scheduler);
    }

    pub fn register_listener(&self, listener: Arc<dyn AuthListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn state(&self) -> AuthState {
        self.inner.lock().unwrap().state
    }

    /// Bootstrap material has been fetched
    pub fn is_initialized(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.api_info.is_some() && inner.public_key.is_some()
    }

    /// A token is issued and still valid
    pub fn is_usable(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        matches!(inner.state, AuthState::TokenIssued | AuthState::Refreshing)
            && inner
                .token
                .as_ref()
                .map(|t| t.expires_at > Utc::now())
                .unwrap_or(false)
    }

    /// Currently valid visualisation hash, if a handshake completed
    pub fn visu_hash(&self) -> Option<String> {
        self.inner.lock().unwrap().visu_hash.clone()
    }

    /// Fetch API info and the server's RSA public key over HTTP.
    pub async fn init(&self) -> Result<()> {
        let api_message = self.http.get(&Command::api_info()).await?;
        let api_info: ApiInfo = serde_json::from_value(api_message.value)?;
        info!(serial = %api_info.serial, version = %api_info.version, "miniserver identified");

        let key_message = self.http.get(&Command::public_key()).await?;
        let key_info: PubKeyInfo = serde_json::from_value(key_message.value)?;
        let public_key = crypto::public_key_from_parts(&key_info)?;

        let mut inner = self.inner.lock().unwrap();
        inner.api_info = Some(api_info);
        inner.public_key = Some(public_key);
        Ok(())
    }

    /// Kick off the token sequence. A no-op while a sequence is in flight or
    /// a valid token is held; restarts from `Failed`.
    pub fn start_authentication(&self) -> Result<()> {
        let command = {
            let mut inner = self.inner.lock().unwrap();
            if inner.pending.is_some() {
                debug!("authentication sequence already in flight");
                return Ok(());
            }
            if matches!(inner.state, AuthState::TokenIssued | AuthState::Refreshing)
                && inner
                    .token
                    .as_ref()
                    .map(|t| t.expires_at > Utc::now())
                    .unwrap_or(false)
            {
                debug!("token still valid, skipping authentication");
                return Ok(());
            }

            let public_key = inner.public_key.clone().ok_or_else(|| {
                LoxoneError::invalid_state("authentication engine is not initialised")
            })?;
            // the session key is only RSA-wrapped for the exchange, the
            // encrypted command channel itself is not spoken
            let payload = SessionKey::generate().exchange_payload(&public_key)?;
            inner.pending = Some(AuthStep::KeyExchange);
            Command::key_exchange(&payload)
        };
        self.send(command)
    }

    /// Kick off the visualisation handshake. A no-op while one is in flight.
    pub fn start_visu_authentication(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.visu_pending.is_some() {
                debug!("visualisation handshake already in flight");
                return Ok(());
            }
            inner.visu_pending = Some(VisuStep::Salt);
        }
        self.send(Command::get_visu_salt(&self.credentials.username))
    }

    /// Reset to the initial state; called when the socket closes.
    pub fn ws_closed(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(refresh) = inner.refresh.take() {
            refresh.cancel();
        }
        *inner = AuthInner::default();
        debug!("authentication engine reset");
    }

    fn send(&self, command: Command) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| LoxoneError::invalid_state("no command sender attached"))?;
        sender
            .send(command)
            .map_err(|_| LoxoneError::connection("command channel closed"))
    }

    fn fail(&self, error: LoxoneError) -> LoxoneError {
        let mut inner = self.inner.lock().unwrap();
        inner.state = AuthState::Failed;
        inner.pending = None;
        error
    }

    fn fail_visu(&self, error: LoxoneError) -> LoxoneError {
        let mut inner = self.inner.lock().unwrap();
        inner.visu_pending = None;
        inner.visu_hash_candidate = None;
        error
    }

    fn on_key_exchanged(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = AuthState::KeyExchanged;
            inner.pending = Some(AuthStep::UserKey);
        }
        debug!("session key exchanged, requesting user key");
        self.send(Command::get_key(&self.credentials.username))
    }

    fn on_user_key(&self, message: &LoxoneMessage) -> Result<()> {
        let command = (|| -> Result<Command> {
            let auth_key: AuthKey = serde_json::from_value(message.value.clone())?;
            let alg = HashAlg::parse(auth_key.hash_alg.as_deref())?;
            let pw_hash = password_hash(&self.credentials.password, &auth_key.salt, alg);
            let hash = credentials_hash(&auth_key.key, &self.credentials.username, &pw_hash, alg)?;

            let mut inner = self.inner.lock().unwrap();
            inner.user_key = Some(UserKey {
                key: auth_key.key,
                alg,
            });
            inner.state = AuthState::Challenged;
            inner.pending = Some(AuthStep::Token);
            Ok(Command::get_token(
                &hash,
                &self.credentials.username,
                &self.client_id,
                CLIENT_INFO,
            ))
        })()
        .map_err(|e| self.fail(e))?;

        debug!("user key received, requesting token");
        self.send(command)
    }

    async fn on_token(&self, message: &LoxoneMessage) -> Result<()> {
        let refresh_in = (|| -> Result<Duration> {
            let token: Token = serde_json::from_value(message.value.clone())?;
            let expires_at = token.expires_at();
            let refresh_in = Duration::from_secs(
                (token.seconds_to_expire().max(1) as f64 * REFRESH_FRACTION) as u64,
            );

            let mut inner = self.inner.lock().unwrap();
            inner.token = Some(ActiveToken {
                token: token.token,
                expires_at,
            });
            inner.state = AuthState::TokenIssued;
            inner.pending = None;
            Ok(refresh_in)
        })()
        .map_err(|e| self.fail(e))?;

        self.schedule_refresh(refresh_in);
        info!("authentication completed");
        self.notify(|listener| Box::pin(async move { listener.auth_completed().await }))
            .await
    }

    fn schedule_refresh(&self, delay: Duration) {
        let scheduler = self.scheduler.lock().unwrap().clone();
        let Some(scheduler) = scheduler else {
            warn!("no scheduler attached, token will not be refreshed");
            return;
        };
        debug!(seconds = delay.as_secs(), "scheduling token refresh");

        let weak = self.weak_self.clone();
        let task = scheduler.schedule_once(delay, async move {
            if let Some(auth) = weak.upgrade() {
                if let Err(e) = auth.refresh_token() {
                    warn!("token refresh failed: {e}");
                }
            }
        });
        self.inner.lock().unwrap().refresh = Some(task);
    }

    /// Re-authenticate in place with the held token.
    fn refresh_token(&self) -> Result<()> {
        let command = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != AuthState::TokenIssued {
                return Ok(());
            }
            let token = inner
                .token
                .as_ref()
                .ok_or_else(|| LoxoneError::invalid_state("refresh without a token"))?;
            let user_key = inner
                .user_key
                .as_ref()
                .ok_or_else(|| LoxoneError::invalid_state("refresh without a user key"))?;
            let hash = token_hash(&user_key.key, &token.token, user_key.alg)?;

            inner.state = AuthState::Refreshing;
            inner.pending = Some(AuthStep::Token);
            Command::auth_with_token(&hash, &self.credentials.username)
        };
        info!("refreshing session token");
        self.send(command)
    }

    fn on_visu_salt(&self, message: &LoxoneMessage) -> Result<()> {
        let command = (|| -> Result<Command> {
            let visu_key: AuthKey = serde_json::from_value(message.value.clone())?;
            let alg = HashAlg::parse(visu_key.hash_alg.as_deref())?;
            let pw_hash = password_hash(self.credentials.visu_password(), &visu_key.salt, alg);
            let hash = credentials_hash(&visu_key.key, &self.credentials.username, &pw_hash, alg)?;

            let mut inner = self.inner.lock().unwrap();
            inner.visu_hash_candidate = Some(hash.clone());
            inner.visu_pending = Some(VisuStep::Confirmation);
            Ok(Command::auth_with_visu_hash(
                &hash,
                &self.credentials.username,
            ))
        })()
        .map_err(|e| self.fail_visu(e))?;

        debug!("visualisation salt received, confirming hash");
        self.send(command)
    }

    async fn on_visu_confirmed(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.visu_hash = inner.visu_hash_candidate.take();
            inner.visu_pending = None;
        }
        info!("visualisation authentication completed");
        self.notify(|listener| Box::pin(async move { listener.visu_auth_completed().await }))
            .await
    }

    async fn notify<F>(&self, call: F) -> Result<()>
    where
        F: Fn(
            Arc<dyn AuthListener>,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>,
    {
        let listeners = self.listeners.lock().unwrap().clone();
        let mut result = Ok(());
        for listener in listeners {
            if let Err(e) = call(listener).await {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}

#[async_trait]
impl CommandResponseListener for LoxoneAuth {
    fn accepts(&self, category: ResponseCategory) -> bool {
        matches!(
            category,
            ResponseCategory::KeyExchange
                | ResponseCategory::AuthKey
                | ResponseCategory::Token
                | ResponseCategory::VisuSalt
                | ResponseCategory::VisuAuth
        )
    }

    async fn on_command(
        &self,
        command: &Command,
        response: &ParsedResponse,
    ) -> Result<ListenerState> {
        let ParsedResponse::Message(message) = response else {
            return Ok(ListenerState::Ignored);
        };
        match command.category() {
            ResponseCategory::KeyExchange => self.on_key_exchanged()?,
            ResponseCategory::AuthKey => self.on_user_key(message)?,
            ResponseCategory::Token => self.on_token(message).await?,
            ResponseCategory::VisuSalt => self.on_visu_salt(message)?,
            ResponseCategory::VisuAuth => self.on_visu_confirmed().await?,
            _ => return Ok(ListenerState::Ignored),
        }
        Ok(ListenerState::Consumed)
    }
}
