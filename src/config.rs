//! Endpoint and credential configuration for the Miniserver session.

use crate::error::{LoxoneError, Result};
use url::Url;

/// Fixed WebSocket endpoint path expected by the Miniserver
const WS_PATH: &str = "/ws/rfc6455";

/// Network address of a Loxone Miniserver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoxoneEndpoint {
    /// Host name or IP address
    pub host: String,
    /// HTTP/WebSocket port
    pub port: u16,
    /// Use TLS (wss/https) instead of plain sockets
    pub use_tls: bool,
}

impl LoxoneEndpoint {
    /// Create a plain (non-TLS) endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            use_tls: false,
        }
    }

    /// Create a TLS endpoint
    pub fn with_tls(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            use_tls: true,
        }
    }

    /// WebSocket URL of the Miniserver's dual text/binary channel
    pub fn web_socket_url(&self) -> Result<Url> {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        Url::parse(&format!(
            "{}://{}:{}{}",
            scheme, self.host, self.port, WS_PATH
        ))
        .map_err(|e| LoxoneError::connection(format!("Invalid websocket URL: {e}")))
    }

    /// HTTP URL for a bootstrap command (API info, public key)
    pub fn http_url(&self, command: &str) -> Result<Url> {
        let scheme = if self.use_tls { "https" } else { "http" };
        Url::parse(&format!(
            "{}://{}:{}/{}",
            scheme, self.host, self.port, command
        ))
        .map_err(|e| LoxoneError::connection(format!("Invalid URL path {command}: {e}")))
    }
}

impl std::fmt::Display for LoxoneEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Credentials used by the authentication engine
#[derive(Debug, Clone)]
pub struct LoxoneCredentials {
    /// User name
    pub username: String,
    /// User password
    pub password: String,
    /// Visualisation password for secured commands, falls back to `password` when absent
    pub visu_password: Option<String>,
}

impl LoxoneCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            visu_password: None,
        }
    }

    pub fn with_visu_password(mut self, visu_password: impl Into<String>) -> Self {
        self.visu_password = Some(visu_password.into());
        self
    }

    /// Password used for the visualisation handshake
    pub fn visu_password(&self) -> &str {
        self.visu_password.as_deref().unwrap_or(&self.password)
    }
}
