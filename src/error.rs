//! Error types for the Loxone WebSocket session core.

use thiserror::Error;

/// Result type alias for Loxone operations
pub type Result<T> = std::result::Result<T, LoxoneError>;

/// Error types for Loxone session operations
#[derive(Error, Debug)]
pub enum LoxoneError {
    /// Connection errors (recoverable, drive the send retry loop)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication errors
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Authentication retries exhausted
    #[error("Authentication timed out: {0}")]
    AuthTimeout(String),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Malformed wire data (JSON or binary frames)
    #[error("Parsing error: {0}")]
    Parsing(String),

    /// Internal invariant violations, indicate a bug rather than a network condition
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid caller input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP client errors
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing errors
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket errors
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoxoneError {
    /// Create a connection error
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }

    /// Create an authentication error
    pub fn authentication<S: Into<String>>(msg: S) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create an authentication timeout error
    pub fn auth_timeout<S: Into<String>>(msg: S) -> Self {
        Self::AuthTimeout(msg.into())
    }

    /// Create a crypto error
    pub fn crypto<S: Into<String>>(msg: S) -> Self {
        Self::Crypto(msg.into())
    }

    /// Create a parsing error
    pub fn parsing<S: Into<String>>(msg: S) -> Self {
        Self::Parsing(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Check if the error is recoverable by retrying the send path
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LoxoneError::Connection(_) | LoxoneError::WebSocket(_) | LoxoneError::Http(_)
        )
    }

    /// Check if the error indicates an authentication issue
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            LoxoneError::Authentication(_) | LoxoneError::AuthTimeout(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for LoxoneError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        LoxoneError::WebSocket(err.to_string())
    }
}
