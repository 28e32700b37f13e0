//! Outbound commands and their response expectations.
//!
//! Every command statically declares the category of response it produces;
//! response listeners subscribe per category, so no runtime type tests are
//! involved in dispatch.

use uuid::Uuid;

/// Keep-alive probe, answered by a binary keep-alive frame instead of JSON
pub const KEEP_ALIVE_COMMAND: &str = "keepalive";

/// Prefix of secured (visualisation protected) commands
pub const SECURED_PREFIX: &str = "jdev/sps/ios";

/// Prefix of the encrypted command channel, which this session does not speak
pub const ENCRYPTED_PREFIX: &str = "dev/sys/enc";

/// Token permission requested for app-scoped (long lived) tokens
const TOKEN_PERMISSION: u8 = 4;

/// Category of response a command expects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCategory {
    /// No response at all, the command is never enqueued
    None,
    /// Plain envelope response with an uninterpreted value
    Status,
    /// API info from the HTTP bootstrap
    ApiInfo,
    /// RSA public key from the HTTP bootstrap
    PublicKey,
    /// Session key exchange acknowledgement
    KeyExchange,
    /// User key and salt (`getkey2`)
    AuthKey,
    /// Session token (`gettoken`, `authwithtoken`)
    Token,
    /// Visualisation salt (`getvisusalt`)
    VisuSalt,
    /// Visualisation hash acknowledgement (`authwithvisuhash`)
    VisuAuth,
    /// Control command acknowledgement
    Control,
    /// Structure file, served outside the `LL` envelope
    App,
}

impl ResponseCategory {
    /// Whether a response arrives at all
    pub fn expects_response(&self) -> bool {
        !matches!(self, ResponseCategory::None)
    }

    /// Whether the response uses the `LL` envelope
    pub fn expects_envelope(&self) -> bool {
        !matches!(self, ResponseCategory::None | ResponseCategory::App)
    }
}

/// An outbound request together with its response expectation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    command: String,
    category: ResponseCategory,
    should_contain: String,
    ws_supported: bool,
}

/// The server echoes `jdev/...` commands back as `dev/...` in the control field.
fn echoed_control(command: &str) -> String {
    if command.starts_with("jdev/") {
        command[1..].to_string()
    } else {
        command.to_string()
    }
}

impl Command {
    pub fn new(command: impl Into<String>, category: ResponseCategory, ws_supported: bool) -> Self {
        let command = command.into();
        let should_contain = echoed_control(&command);
        Self {
            command,
            category,
            should_contain,
            ws_supported,
        }
    }

    /// The wire text of the command
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn category(&self) -> ResponseCategory {
        self.category
    }

    /// Control-path fragment a matching response must contain
    pub fn should_contain(&self) -> &str {
        &self.should_contain
    }

    pub fn is_ws_supported(&self) -> bool {
        self.ws_supported
    }

    /// Whether the given response control field answers this command
    pub fn is(&self, control: &str) -> bool {
        control.contains(&self.should_contain)
    }

    /// Whether this command belongs to the unsupported encrypted channel
    pub fn is_encrypted(&self) -> bool {
        self.command.starts_with(ENCRYPTED_PREFIX)
            || self.command.strip_prefix('j').is_some_and(|c| c.starts_with(ENCRYPTED_PREFIX))
    }

    /// Keep-alive probe, sent but never enqueued
    pub fn keep_alive() -> Self {
        Self::new(KEEP_ALIVE_COMMAND, ResponseCategory::None, true)
    }

    /// A plain command answered by an envelope with an uninterpreted value
    pub fn status(command: impl Into<String>) -> Self {
        Self::new(command, ResponseCategory::Status, true)
    }

    /// Structure file request, answered outside the envelope
    pub fn app() -> Self {
        Self::new("data/LoxAPP3.json", ResponseCategory::App, true)
    }

    /// API info bootstrap request, HTTP only
    pub fn api_info() -> Self {
        Self::new("jdev/cfg/api", ResponseCategory::ApiInfo, false)
    }

    /// Public key bootstrap request, HTTP only
    pub fn public_key() -> Self {
        Self::new("jdev/sys/getPublicKey", ResponseCategory::PublicKey, false)
    }

    pub fn key_exchange(payload: &str) -> Self {
        Self::new(
            format!("jdev/sys/keyexchange/{payload}"),
            ResponseCategory::KeyExchange,
            true,
        )
    }

    pub fn get_key(user: &str) -> Self {
        Self::new(
            format!("jdev/sys/getkey2/{user}"),
            ResponseCategory::AuthKey,
            true,
        )
    }

    pub fn get_token(hash: &str, user: &str, client_id: &Uuid, client_info: &str) -> Self {
        Self::new(
            format!("jdev/sys/gettoken/{hash}/{user}/{TOKEN_PERMISSION}/{client_id}/{client_info}"),
            ResponseCategory::Token,
            true,
        )
    }

    pub fn auth_with_token(hash: &str, user: &str) -> Self {
        Self::new(
            format!("jdev/sys/authwithtoken/{hash}/{user}"),
            ResponseCategory::Token,
            true,
        )
    }

    pub fn get_visu_salt(user: &str) -> Self {
        Self::new(
            format!("jdev/sys/getvisusalt/{user}"),
            ResponseCategory::VisuSalt,
            true,
        )
    }

    pub fn auth_with_visu_hash(hash: &str, user: &str) -> Self {
        Self::new(
            format!("jdev/sys/authwithvisuhash/{hash}/{user}"),
            ResponseCategory::VisuAuth,
            true,
        )
    }
}

/// A state-changing command addressed to a control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCommand {
    uuid: String,
    operation: String,
}

impl ControlCommand {
    pub fn new(uuid: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            operation: operation.into(),
        }
    }

    /// The `{uuid}/{operation}` tail shared by plain and secured forms
    pub fn control_part(&self) -> String {
        format!("{}/{}", self.uuid, self.operation)
    }

    /// Plain (unsecured) wire command
    pub fn command(&self) -> Command {
        Command::new(
            format!("jdev/sps/io/{}", self.control_part()),
            ResponseCategory::Control,
            true,
        )
    }
}

/// A control command wrapped with a currently valid visualisation hash.
///
/// Rebuilt on every retry, the hash may have rotated in between.
#[derive(Debug, Clone)]
pub struct SecuredCommand {
    inner: ControlCommand,
    visu_hash: String,
}

impl SecuredCommand {
    pub fn new(inner: ControlCommand, visu_hash: impl Into<String>) -> Self {
        Self {
            inner,
            visu_hash: visu_hash.into(),
        }
    }

    pub fn command(&self) -> Command {
        Command::new(
            format!(
                "{}/{}/{}",
                SECURED_PREFIX,
                self.visu_hash,
                self.inner.control_part()
            ),
            ResponseCategory::Control,
            true,
        )
    }
}
