//! End-to-end session tests against a scripted miniserver.
//!
//! The HTTP bootstrap and the WebSocket transport are both replaced by mocks
//! driven from a shared simulator, so full authentication handshakes, retry
//! behaviour and event delivery run without any network.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use loxone_ws::command::Command;
use loxone_ws::config::{LoxoneCredentials, LoxoneEndpoint};
use loxone_ws::error::{LoxoneError, Result};
use loxone_ws::http::HttpFetcher;
use loxone_ws::listener::{CommandResponseListener, ListenerState, LoxoneEventListener};
use loxone_ws::message::{
    LoxoneMessage, MessageHeader, ParsedResponse, TextEvent, ValueEvent,
};
use loxone_ws::transport::{TransportFactory, TransportHooks, WebSocketTransport};
use loxone_ws::{ControlCommand, LoxoneAuth, LoxoneWebSocket, ResponseCategory, SessionState};
use rand::rngs::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

/// One RSA keypair for the whole test binary, key generation is slow.
fn server_keypair() -> &'static RsaPrivateKey {
    static KEYPAIR: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEYPAIR.get_or_init(|| RsaPrivateKey::new(&mut OsRng, 2048).expect("RSA key generation"))
}

const LOXONE_EPOCH_UNIX: i64 = 1_230_768_000;

fn fresh_valid_until() -> i64 {
    chrono::Utc::now().timestamp() - LOXONE_EPOCH_UNIX + 3600
}

/// Scripted miniserver shared between the mock HTTP fetcher and every mock
/// transport the factory creates.
struct ServerSim {
    /// Everything that reached the wire, across reconnects
    sent: Mutex<Vec<String>>,
    /// Remaining `gettoken` attempts to reject with 401
    token_failures: AtomicU32,
    /// Number of key exchanges seen, one per authentication cycle
    auth_cycles: AtomicU32,
    /// Number of visualisation salt requests seen
    visu_salt_requests: AtomicU32,
    /// The most recently constructed transport
    current: Mutex<Option<Arc<MockTransport>>>,
    /// Number of transports constructed by the factory
    transports_built: AtomicU32,
    /// When set, the server swallows commands instead of answering
    muted: AtomicBool,
}

impl ServerSim {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            token_failures: AtomicU32::new(0),
            auth_cycles: AtomicU32::new(0),
            visu_salt_requests: AtomicU32::new(0),
            current: Mutex::new(None),
            transports_built: AtomicU32::new(0),
            muted: AtomicBool::new(false),
        })
    }

    fn fail_next_tokens(&self, count: u32) {
        self.token_failures.store(count, Ordering::SeqCst);
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    fn current_transport(&self) -> Arc<MockTransport> {
        self.current.lock().unwrap().clone().expect("no transport built yet")
    }

    fn envelope(control: &str, code: u16, value: Value) -> String {
        json!({"LL": {"control": control, "value": value, "Code": code.to_string()}}).to_string()
    }

    /// Produce the response a miniserver would send for `cmd`, if any.
    fn respond(&self, cmd: &str) -> Option<String> {
        if cmd == "keepalive" || self.muted.load(Ordering::SeqCst) {
            return None;
        }
        let control = if cmd.starts_with("jdev/") {
            cmd[1..].to_string()
        } else {
            cmd.to_string()
        };

        if cmd.starts_with("jdev/sys/keyexchange/") {
            self.auth_cycles.fetch_add(1, Ordering::SeqCst);
            return Some(Self::envelope(&control, 200, json!("a2V5LWFjaw==")));
        }
        if cmd.starts_with("jdev/sys/getkey2/") {
            return Some(Self::envelope(
                &control,
                200,
                json!({"key": "4142434445464748", "salt": "2c42", "hashAlg": "SHA256"}),
            ));
        }
        if cmd.starts_with("jdev/sys/gettoken/") || cmd.starts_with("jdev/sys/authwithtoken/") {
            if self.token_failures.load(Ordering::SeqCst) > 0 {
                self.token_failures.fetch_sub(1, Ordering::SeqCst);
                return Some(Self::envelope(&control, 401, json!(null)));
            }
            return Some(Self::envelope(
                &control,
                200,
                json!({"token": "8E2AA590C1F3", "validUntil": fresh_valid_until()}),
            ));
        }
        if cmd.starts_with("jdev/sys/getvisusalt/") {
            self.visu_salt_requests.fetch_add(1, Ordering::SeqCst);
            return Some(Self::envelope(
                &control,
                200,
                json!({"key": "aabbccdd", "salt": "1f2e", "hashAlg": "SHA256"}),
            ));
        }
        if cmd.starts_with("jdev/sys/authwithvisuhash/") {
            return Some(Self::envelope(&control, 200, json!("ok")));
        }
        // any other command is acknowledged as-is
        Some(Self::envelope(&control, 200, json!(0)))
    }
}

/// In-process transport delivering the simulator's replies straight back
/// into the session's inbound hooks.
struct MockTransport {
    hooks: Mutex<Option<Weak<dyn TransportHooks>>>,
    sim: Arc<ServerSim>,
    open: AtomicBool,
}

impl MockTransport {
    fn new(hooks: Weak<dyn TransportHooks>, sim: Arc<ServerSim>) -> Self {
        Self {
            hooks: Mutex::new(Some(hooks)),
            sim,
            open: AtomicBool::new(false),
        }
    }

    fn hooks(&self) -> Option<Arc<dyn TransportHooks>> {
        self.hooks.lock().unwrap().clone().and_then(|weak| weak.upgrade())
    }

    /// Simulate the server closing the connection.
    async fn server_close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            if let Some(hooks) = self.hooks() {
                hooks.ws_closed().await;
                hooks.connection_closed(1001, true).await;
            }
        }
    }

    /// Push a binary header/payload frame pair into the session.
    async fn inject_binary(&self, header: &[u8], payload: &[u8]) {
        let header = MessageHeader::parse(header).expect("test frame header");
        if let Some(hooks) = self.hooks() {
            hooks.process_events(&header, payload).await;
        }
    }
}

#[async_trait]
impl WebSocketTransport for MockTransport {
    async fn connect(&self) -> Result<()> {
        self.open.store(true, Ordering::SeqCst);
        if let Some(hooks) = self.hooks() {
            hooks.connection_opened().await;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, text: &str) -> Result<()> {
        if !self.is_open() {
            return Err(LoxoneError::connection("mock socket closed"));
        }
        self.sim.sent.lock().unwrap().push(text.to_string());
        if let Some(reply) = self.sim.respond(text) {
            if let Some(hooks) = self.hooks() {
                hooks.process_message(&reply).await;
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            if let Some(hooks) = self.hooks() {
                hooks.ws_closed().await;
                hooks.connection_closed(1000, false).await;
            }
        }
        Ok(())
    }
}

struct MockHttp;

#[async_trait]
impl HttpFetcher for MockHttp {
    async fn get(&self, command: &Command) -> Result<LoxoneMessage> {
        let public = server_keypair().to_public_key();
        match command.category() {
            ResponseCategory::ApiInfo => Ok(LoxoneMessage::new(
                "dev/cfg/api",
                200,
                json!({"snr": "50:4F:94:10:B8:10", "version": "12.0.2.24"}),
            )),
            ResponseCategory::PublicKey => Ok(LoxoneMessage::new(
                "dev/sys/getPublicKey",
                200,
                json!({
                    "n": general_purpose::STANDARD.encode(public.n().to_bytes_be()),
                    "e": general_purpose::STANDARD.encode(public.e().to_bytes_be()),
                }),
            )),
            _ => Err(LoxoneError::connection("unexpected HTTP command")),
        }
    }
}

/// Collects command responses for one category.
struct CollectingListener {
    category: ResponseCategory,
    responses: Mutex<Vec<LoxoneMessage>>,
}

impl CollectingListener {
    fn new(category: ResponseCategory) -> Arc<Self> {
        Arc::new(Self {
            category,
            responses: Mutex::new(Vec::new()),
        })
    }

    fn controls(&self) -> Vec<String> {
        self.responses
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.control.clone())
            .collect()
    }
}

#[async_trait]
impl CommandResponseListener for CollectingListener {
    fn accepts(&self, category: ResponseCategory) -> bool {
        category == self.category
    }

    async fn on_command(
        &self,
        _command: &Command,
        response: &ParsedResponse,
    ) -> Result<ListenerState> {
        if let ParsedResponse::Message(message) = response {
            self.responses.lock().unwrap().push(message.clone());
        }
        Ok(ListenerState::Consumed)
    }
}

#[derive(Default)]
struct CollectingEvents {
    values: Mutex<Vec<ValueEvent>>,
    texts: Mutex<Vec<TextEvent>>,
}

impl LoxoneEventListener for CollectingEvents {
    fn on_value_event(&self, event: &ValueEvent) {
        self.values.lock().unwrap().push(event.clone());
    }
    fn on_text_event(&self, event: &TextEvent) {
        self.texts.lock().unwrap().push(event.clone());
    }
}

fn factory(sim: Arc<ServerSim>) -> TransportFactory {
    Arc::new(move |hooks, _url| {
        let transport = Arc::new(MockTransport::new(hooks, sim.clone()));
        sim.transports_built.fetch_add(1, Ordering::SeqCst);
        *sim.current.lock().unwrap() = Some(transport.clone());
        transport as _
    })
}

fn session_against(sim: &Arc<ServerSim>) -> LoxoneWebSocket {
    let auth = LoxoneAuth::new(Arc::new(MockHttp), LoxoneCredentials::new("admin", "secret"));
    let session = LoxoneWebSocket::with_transport_factory(
        LoxoneEndpoint::new("192.168.1.77", 80),
        auth,
        factory(sim.clone()),
    );
    // keep the failing scenarios fast
    session.set_auth_timeout_seconds(1);
    session.set_visu_timeout_seconds(1);
    session
}

#[tokio::test]
async fn test_simple_command_reaches_the_wire() {
    let sim = ServerSim::new();
    let session = session_against(&sim);
    let listener = CollectingListener::new(ResponseCategory::Status);
    session.register_command_listener(listener.clone());

    session.send_command(Command::status("testCmd")).await.unwrap();

    let sent = sim.sent();
    assert!(sent.contains(&"testCmd".to_string()), "sent: {sent:?}");
    assert_eq!(sim.auth_cycles.load(Ordering::SeqCst), 1);
    assert_eq!(listener.controls(), vec!["testCmd".to_string()]);
    assert_eq!(session.state(), SessionState::Ready);

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_bad_credentials_with_no_retries_surface_timeout() {
    let sim = ServerSim::new();
    sim.fail_next_tokens(u32::MAX);
    let session = session_against(&sim);
    session.set_retries(0);

    let result = session.send_command(Command::status("baf")).await;
    assert!(
        matches!(result, Err(LoxoneError::AuthTimeout(_))),
        "got: {result:?}"
    );
    assert!(!sim.sent().contains(&"baf".to_string()));

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_retry_succeeds_after_transient_auth_failures() {
    let sim = ServerSim::new();
    sim.fail_next_tokens(4);
    let session = session_against(&sim);
    session.set_retries(5);

    session.send_command(Command::status("baf")).await.unwrap();

    let sent = sim.sent();
    let baf_count = sent.iter().filter(|c| c.as_str() == "baf").count();
    assert_eq!(baf_count, 1, "exactly one attempt reaches the wire: {sent:?}");
    assert_eq!(sim.auth_cycles.load(Ordering::SeqCst), 5, "four failed cycles, one good");

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_server_restart_triggers_fresh_auth_cycle() {
    let sim = ServerSim::new();
    let session = session_against(&sim);

    session
        .send_command(Command::status("beforeRestart"))
        .await
        .unwrap();
    assert_eq!(sim.auth_cycles.load(Ordering::SeqCst), 1);

    sim.current_transport().server_close().await;
    assert_eq!(session.state(), SessionState::Disconnected);

    session
        .send_command(Command::status("afterRestart"))
        .await
        .unwrap();

    let sent = sim.sent();
    assert!(sent.contains(&"beforeRestart".to_string()));
    assert!(sent.contains(&"afterRestart".to_string()));
    assert_eq!(sim.auth_cycles.load(Ordering::SeqCst), 2, "restart re-authenticates");
    assert_eq!(sim.transports_built.load(Ordering::SeqCst), 2);

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_secure_command_is_wrapped_with_visu_hash() {
    let sim = ServerSim::new();
    let session = session_against(&sim);

    session
        .send_secure_command(ControlCommand::new("uuid", "Pulse"))
        .await
        .unwrap();

    let sent = sim.sent();
    let secured = sent
        .iter()
        .find(|c| c.starts_with("jdev/sps/ios/"))
        .expect("secured command on the wire");

    let rest = secured.strip_prefix("jdev/sps/ios/").unwrap();
    let (hash, tail) = rest.split_once('/').unwrap();
    assert_eq!(hash.len(), 64, "SHA256 visu hash: {hash}");
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(tail, "uuid/Pulse");
    assert_eq!(sim.visu_salt_requests.load(Ordering::SeqCst), 1);

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_each_secure_command_rotates_the_visu_handshake() {
    let sim = ServerSim::new();
    let session = session_against(&sim);

    session
        .send_secure_command(ControlCommand::new("uuid", "On"))
        .await
        .unwrap();
    session
        .send_secure_command(ControlCommand::new("uuid", "Off"))
        .await
        .unwrap();

    assert_eq!(
        sim.visu_salt_requests.load(Ordering::SeqCst),
        2,
        "a spent gate triggers a fresh handshake"
    );

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_binary_value_event_reaches_every_listener() {
    let sim = ServerSim::new();
    let session = session_against(&sim);
    let first = Arc::new(CollectingEvents::default());
    let second = Arc::new(CollectingEvents::default());
    session.register_event_listener(first.clone());
    session.register_event_listener(second.clone());

    // connect by sending something
    session.send_command(Command::status("testCmd")).await.unwrap();

    let uuid: loxone_ws::LoxoneUuid = "08bc3061-01d4-45a0-ffff373a22dcdfea".parse().unwrap();
    let event = ValueEvent::new(uuid, 23.5);
    let payload = event.to_bytes();
    let header = [0x03, 0x02, 0x00, 0x00, payload.len() as u8, 0x00, 0x00, 0x00];
    sim.current_transport().inject_binary(&header, &payload).await;

    for listener in [&first, &second] {
        let values = listener.values.lock().unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].uuid, uuid);
        assert_eq!(values[0].value, 23.5);
    }

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_binary_text_event_delivery() {
    let sim = ServerSim::new();
    let session = session_against(&sim);
    let events = Arc::new(CollectingEvents::default());
    session.register_event_listener(events.clone());

    session.send_command(Command::status("testCmd")).await.unwrap();

    let uuid: loxone_ws::LoxoneUuid = "08bc3061-01d4-45a0-ffff373a22dcdfea".parse().unwrap();
    let event = TextEvent::new(uuid, uuid, "open");
    let payload = event.to_bytes();
    let header = [0x03, 0x03, 0x00, 0x00, payload.len() as u8, 0x00, 0x00, 0x00];
    sim.current_transport().inject_binary(&header, &payload).await;

    let texts = events.texts.lock().unwrap();
    assert_eq!(texts.len(), 1);
    assert_eq!(texts[0].text, "open");
    drop(texts);

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_keep_alive_is_sent_but_never_correlated() {
    let sim = ServerSim::new();
    let session = session_against(&sim);
    let listener = CollectingListener::new(ResponseCategory::Status);
    session.register_command_listener(listener.clone());

    session.send_command(Command::keep_alive()).await.unwrap();
    // if keepalive had been enqueued, this response would correlate to it
    // and the listener would see a mismatched control
    session.send_command(Command::status("testCmd")).await.unwrap();

    assert_eq!(listener.controls(), vec!["testCmd".to_string()]);

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_auto_restart_reconnects_after_remote_close() {
    let sim = ServerSim::new();
    let session = session_against(&sim);
    session.set_retries(0);
    session.set_auto_restart(true);
    // restart rate: (retries + 1) * auth_timeout + 1 = 2 seconds

    session.send_command(Command::status("testCmd")).await.unwrap();
    sim.current_transport().server_close().await;

    let mut reconnected = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if sim.auth_cycles.load(Ordering::SeqCst) >= 2 {
            reconnected = true;
            break;
        }
    }
    assert!(reconnected, "auto-restart reconnected within the rate window");
    assert!(sim.transports_built.load(Ordering::SeqCst) >= 2);

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_mismatched_control_is_dropped() {
    let sim = ServerSim::new();
    let session = session_against(&sim);
    let listener = CollectingListener::new(ResponseCategory::Status);
    session.register_command_listener(listener.clone());

    // authenticate first
    session.send_command(Command::status("warmup")).await.unwrap();

    // leave "expected" in flight, then answer it with the wrong control
    sim.muted.store(true, Ordering::SeqCst);
    session.send_command(Command::status("expected")).await.unwrap();
    let transport = sim.current_transport();
    let hooks = transport.hooks().unwrap();
    hooks
        .process_message(&ServerSim::envelope("somethingElse", 200, json!(0)))
        .await;

    let controls = listener.controls();
    assert!(
        !controls.contains(&"somethingElse".to_string()),
        "mismatched response must not reach listeners: {controls:?}"
    );

    session.close().await.unwrap();
}
