//! Routing of parsed responses and events to registered listeners.

use crate::command::Command;
use crate::listener::{
    CommandResponseListener, ListenerState, LoxoneEventListener, LoxoneWebSocketListener,
};
use crate::message::{ParsedResponse, TextEvent, ValueEvent};
use std::sync::{Arc, RwLock};
use tracing::{error, warn};

/// Holds the listener collections and walks them for every inbound message.
///
/// Collections are snapshotted per walk, so listeners registered mid-traffic
/// simply join the next walk.
#[derive(Default)]
pub struct EventDispatcher {
    command_listeners: RwLock<Vec<Arc<dyn CommandResponseListener>>>,
    event_listeners: RwLock<Vec<Arc<dyn LoxoneEventListener>>>,
    ws_listeners: RwLock<Vec<Arc<dyn LoxoneWebSocketListener>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_command_listener(&self, listener: Arc<dyn CommandResponseListener>) {
        self.command_listeners.write().unwrap().push(listener);
    }

    pub fn register_event_listener(&self, listener: Arc<dyn LoxoneEventListener>) {
        self.event_listeners.write().unwrap().push(listener);
    }

    pub fn register_web_socket_listener(&self, listener: Arc<dyn LoxoneWebSocketListener>) {
        self.ws_listeners.write().unwrap().push(listener);
    }

    /// Offer a response to the listeners subscribed to its category, in
    /// registration order, folding their outcomes and stopping once consumed.
    pub async fn process_command(&self, command: &Command, response: &ParsedResponse) {
        let listeners = self.command_listeners.read().unwrap().clone();

        let mut state = ListenerState::Ignored;
        for listener in listeners {
            if !listener.accepts(command.category()) {
                continue;
            }
            match listener.on_command(command, response).await {
                Ok(outcome) => state = state.fold(outcome),
                Err(e) => error!(command = command.command(), "command response listener failed: {e}"),
            }
            if state == ListenerState::Consumed {
                break;
            }
        }

        if state == ListenerState::Ignored {
            warn!(
                command = command.command(),
                "no listener registered, ignoring command response"
            );
        }

        if command.is_encrypted() {
            warn!("encrypted message receive is not supported");
        }
    }

    /// Deliver each event of a frame to every event listener, in order.
    pub fn dispatch_value_events(&self, events: &[ValueEvent]) {
        let listeners = self.event_listeners.read().unwrap().clone();
        for event in events {
            for listener in &listeners {
                listener.on_value_event(event);
            }
        }
    }

    pub fn dispatch_text_events(&self, events: &[TextEvent]) {
        let listeners = self.event_listeners.read().unwrap().clone();
        for event in events {
            for listener in &listeners {
                listener.on_text_event(event);
            }
        }
    }

    pub fn notify_opened(&self) {
        let listeners = self.ws_listeners.read().unwrap().clone();
        for listener in listeners {
            listener.web_socket_opened();
        }
    }

    pub fn notify_closed(&self, code: u16, remote: bool) {
        let listeners = self.ws_listeners.read().unwrap().clone();
        for listener in listeners {
            if remote {
                listener.web_socket_remote_closed(code);
            } else {
                listener.web_socket_local_closed(code);
            }
        }
    }
}
