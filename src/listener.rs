//! Listener interfaces through which the session hands out inbound traffic.
//!
//! Listeners are registered before traffic starts; collections are
//! snapshotted on iteration, so late registration is tolerated.

use crate::command::{Command, ResponseCategory};
use crate::error::Result;
use crate::message::{ParsedResponse, TextEvent, ValueEvent};
use async_trait::async_trait;

/// Outcome of offering a command response to a listener.
///
/// Folding over a listener walk keeps the strongest outcome: `Consumed`
/// absorbs everything and stops the walk, `Accepted` dominates `Ignored`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ListenerState {
    Ignored,
    Accepted,
    Consumed,
}

impl ListenerState {
    pub fn fold(self, other: ListenerState) -> ListenerState {
        self.max(other)
    }
}

/// Receives command responses for the categories it subscribes to.
#[async_trait]
pub trait CommandResponseListener: Send + Sync {
    /// Response categories this listener wants to see
    fn accepts(&self, category: ResponseCategory) -> bool;

    /// Handle a response to `command`. Errors are logged by the dispatcher
    /// and never propagate into the transport.
    async fn on_command(&self, command: &Command, response: &ParsedResponse)
        -> Result<ListenerState>;
}

/// Receives parsed binary events. Default implementations ignore everything,
/// implementors override what they care about.
pub trait LoxoneEventListener: Send + Sync {
    fn on_value_event(&self, _event: &ValueEvent) {}
    fn on_text_event(&self, _event: &TextEvent) {}
}

/// Observes the socket lifecycle.
pub trait LoxoneWebSocketListener: Send + Sync {
    fn web_socket_opened(&self) {}
    fn web_socket_local_closed(&self, _code: u16) {}
    fn web_socket_remote_closed(&self, _code: u16) {}
}

/// Observes authentication milestones.
#[async_trait]
pub trait AuthListener: Send + Sync {
    async fn auth_completed(&self) -> Result<()>;
    async fn visu_auth_completed(&self) -> Result<()>;
}
