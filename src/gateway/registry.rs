// ABOUTME: Registry of channel ports keyed by channel type.
// ABOUTME: Routes runtime events addressed by composite session id to the owning channel.

use std::collections::HashMap;
use std::sync::Arc;

use super::ChannelPort;
use parley_core::events::RuntimeEvent;
use parley_core::session::split_session_id;

/// Central registry for all active channel ports.
#[derive(Default)]
pub struct ChannelRegistry {
    ports: HashMap<String, Arc<dyn ChannelPort>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a port. A port with the same channel type is replaced.
    pub fn register(&mut self, port: Arc<dyn ChannelPort>) {
        let channel_type = port.channel_type().to_string();
        self.ports.insert(channel_type, port);
    }

    pub fn get(&self, channel_type: &str) -> Option<&Arc<dyn ChannelPort>> {
        self.ports.get(channel_type)
    }

    pub fn channel_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.ports.keys().cloned().collect();
        types.sort();
        types
    }

    /// Deliver `event` to the channel owning `session_id` (`channel:chatId`).
    /// Unknown channels and malformed ids are dropped.
    pub async fn emit_runtime_event(&self, session_id: &str, event: &RuntimeEvent) -> bool {
        let Some((channel_type, chat_id)) = split_session_id(session_id) else {
            tracing::debug!(session_id = %session_id, "Runtime event for unaddressable session");
            return false;
        };
        match self.ports.get(channel_type) {
            Some(port) => port.send_runtime_event(chat_id, event).await,
            None => false,
        }
    }

    /// Deliver `event` to the session it names. Events without a session id
    /// have nowhere to go.
    pub async fn publish(&self, event: &RuntimeEvent) -> bool {
        match event.session_id.as_deref() {
            Some(session_id) => self.emit_runtime_event(session_id, event).await,
            None => {
                tracing::debug!(event_type = %event.event_type, "Runtime event without a session");
                false
            }
        }
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.channel_types())
            .finish()
    }
}
