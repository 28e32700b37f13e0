//! WebSocket transport seam and its tokio-tungstenite implementation.
//!
//! The session never touches the socket library directly; it builds
//! transports through an injected factory, which is also the seam the tests
//! use to substitute a scripted server.

use crate::error::{LoxoneError, Result};
use crate::message::{MessageHeader, MessageKind};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code reported when the socket dies without a close handshake
const ABNORMAL_CLOSE: u16 = 1006;

/// Callbacks from the transport's inbound pump into the session controller.
#[async_trait]
pub trait TransportHooks: Send + Sync {
    /// The socket finished its handshake and is writable.
    async fn connection_opened(&self);
    /// A text frame carrying a command response arrived.
    async fn process_message(&self, message: &str);
    /// A binary payload arrived, already paired with its header.
    async fn process_events(&self, header: &MessageHeader, payload: &[u8]);
    /// The socket closed; `remote` distinguishes who initiated.
    async fn connection_closed(&self, code: u16, remote: bool);
    /// Cleanup signal fired on every close before `connection_closed`.
    async fn ws_closed(&self);
}

/// Minimal contract the session needs from a socket.
#[async_trait]
pub trait WebSocketTransport: Send + Sync {
    async fn connect(&self) -> Result<()>;
    fn is_open(&self) -> bool;
    async fn send(&self, text: &str) -> Result<()>;
    /// Close and wait until the inbound pump has drained.
    async fn close(&self) -> Result<()>;
}

/// Builds a transport bound to a controller. A fresh transport is created on
/// every (re)connect.
pub type TransportFactory =
    Arc<dyn Fn(Weak<dyn TransportHooks>, Url) -> Arc<dyn WebSocketTransport> + Send + Sync>;

/// Factory for the production transport.
pub fn tungstenite_factory() -> TransportFactory {
    Arc::new(|hooks, url| Arc::new(TungsteniteTransport::new(hooks, url)) as _)
}

struct Shared {
    hooks: Weak<dyn TransportHooks>,
    open: AtomicBool,
    closing_locally: AtomicBool,
}

/// Production transport over tokio-tungstenite.
pub struct TungsteniteTransport {
    url: Url,
    shared: Arc<Shared>,
    sink: tokio::sync::Mutex<Option<SplitSink<WsStream, WsMessage>>>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TungsteniteTransport {
    pub fn new(hooks: Weak<dyn TransportHooks>, url: Url) -> Self {
        Self {
            url,
            shared: Arc::new(Shared {
                hooks,
                open: AtomicBool::new(false),
                closing_locally: AtomicBool::new(false),
            }),
            sink: tokio::sync::Mutex::new(None),
            reader: std::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl WebSocketTransport for TungsteniteTransport {
    async fn connect(&self) -> Result<()> {
        debug!(url = %self.url, "connecting websocket");
        let (stream, _response) = connect_async(self.url.as_str()).await?;
        let (sink, stream) = stream.split();

        *self.sink.lock().await = Some(sink);
        self.shared.open.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(read_loop(self.shared.clone(), stream));
        *self.reader.lock().unwrap() = Some(handle);

        if let Some(hooks) = self.shared.hooks.upgrade() {
            hooks.connection_opened().await;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    async fn send(&self, text: &str) -> Result<()> {
        let mut sink = self.sink.lock().await;
        match sink.as_mut() {
            Some(sink) => sink
                .send(WsMessage::Text(text.to_string()))
                .await
                .map_err(Into::into),
            None => Err(LoxoneError::connection("websocket is not connected")),
        }
    }

    async fn close(&self) -> Result<()> {
        self.shared.closing_locally.store(true, Ordering::SeqCst);
        if let Some(sink) = self.sink.lock().await.as_mut() {
            let _ = sink.send(WsMessage::Close(None)).await;
            let _ = sink.close().await;
        }
        let reader = self.reader.lock().unwrap().take();
        if let Some(handle) = reader {
            handle
                .await
                .map_err(|e| LoxoneError::WebSocket(format!("reader task failed: {e}")))?;
        }
        Ok(())
    }
}

/// Inbound pump. The server interleaves bare text frames (command responses)
/// with header/payload binary frame pairs; a header announcing a payload is
/// held until the next frame delivers it.
async fn read_loop(shared: Arc<Shared>, mut stream: SplitStream<WsStream>) {
    let mut pending: Option<MessageHeader> = None;
    let mut close_code = ABNORMAL_CLOSE;

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                pending.take();
                if let Some(hooks) = shared.hooks.upgrade() {
                    hooks.process_message(&text).await;
                }
            }
            Ok(WsMessage::Binary(data)) => {
                if let Some(header) = pending.take() {
                    if let Some(hooks) = shared.hooks.upgrade() {
                        hooks.process_events(&header, &data).await;
                    }
                } else {
                    match MessageHeader::parse(&data) {
                        Ok(header) if header.kind.has_payload() => pending = Some(header),
                        Ok(header) => {
                            trace!(kind = ?header.kind, "payload-less frame");
                            if header.kind != MessageKind::KeepAlive {
                                if let Some(hooks) = shared.hooks.upgrade() {
                                    hooks.process_events(&header, &[]).await;
                                }
                            }
                        }
                        Err(e) => warn!("dropping malformed frame header: {e}"),
                    }
                }
            }
            Ok(WsMessage::Close(frame)) => {
                close_code = frame.map(|f| u16::from(f.code)).unwrap_or(1000);
                break;
            }
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) | Ok(WsMessage::Frame(_)) => {}
            Err(e) => {
                warn!("websocket read failed: {e}");
                break;
            }
        }
    }

    shared.open.store(false, Ordering::SeqCst);
    let remote = !shared.closing_locally.load(Ordering::SeqCst);
    if let Some(hooks) = shared.hooks.upgrade() {
        hooks.ws_closed().await;
        hooks.connection_closed(close_code, remote).await;
    }
}
