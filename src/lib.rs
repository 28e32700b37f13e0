//! Async client core for the Loxone Miniserver WebSocket protocol.
//!
//! The Miniserver speaks a dual-channel WebSocket protocol: JSON command
//! responses as text frames and typed binary event frames, behind a
//! challenge/response token handshake with a secondary visualisation
//! credential for state-changing commands.
//!
//! This crate implements the session core:
//! - connection lifecycle with retries and optional auto-restart
//! - the token and visualisation authentication sequences
//! - positional request/response correlation over an in-flight FIFO
//! - the binary event demultiplexer (value and text events)
//!
//! HTTP bootstrap and the WebSocket transport sit behind traits
//! ([`http::HttpFetcher`], [`transport::WebSocketTransport`]) so they can be
//! substituted in tests. The structure file domain model and any UI layer
//! are out of scope.

pub mod auth;
pub mod command;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod latch;
pub mod listener;
pub mod message;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod transport;

pub use auth::{AuthState, LoxoneAuth};
pub use command::{Command, ControlCommand, ResponseCategory, SecuredCommand};
pub use config::{LoxoneCredentials, LoxoneEndpoint};
pub use error::{LoxoneError, Result};
pub use http::{HttpFetcher, ReqwestHttpFetcher};
pub use listener::{
    AuthListener, CommandResponseListener, ListenerState, LoxoneEventListener,
    LoxoneWebSocketListener,
};
pub use message::{
    LoxoneMessage, LoxoneUuid, MessageHeader, MessageKind, ParsedResponse, TextEvent, ValueEvent,
};
pub use session::{LoxoneWebSocket, SessionState};
pub use transport::{TransportFactory, TransportHooks, WebSocketTransport};
