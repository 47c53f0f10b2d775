// ABOUTME: Inbound message types and the sink channels hand them to for the agent pipeline.
// ABOUTME: MessageBus fans inbound messages out over a broadcast channel without ever blocking.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// An image attachment that passed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundAttachment {
    pub mime_type: String,
    pub name: String,
    /// Standard base64, as received
    pub data_base64: String,
}

/// A message entering the agent pipeline from any channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    /// Unique event ID
    pub id: String,
    pub role: String,
    pub content: String,
    pub channel_type: String,
    /// Conversation key within the channel
    pub chat_id: String,
    /// Composite `channelType:chatId`
    pub session_id: String,
    /// Authenticated principal that sent the message
    pub sender_id: String,
    pub timestamp: DateTime<Utc>,
    /// Absent when the message carried no attachments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<InboundAttachment>>,
}

/// Consumer of inbound messages. Implementations must not block the caller.
pub trait InboundSink: Send + Sync {
    fn submit(&self, message: InboundMessage);
}

/// Broadcast bus between channel adapters and the agent pipeline.
#[derive(Debug, Clone)]
pub struct MessageBus {
    inbound: broadcast::Sender<InboundMessage>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        let (inbound, _) = broadcast::channel(capacity.max(1));
        Self { inbound }
    }

    pub fn subscribe_inbound(&self) -> broadcast::Receiver<InboundMessage> {
        self.inbound.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inbound.receiver_count()
    }
}

impl InboundSink for MessageBus {
    fn submit(&self, message: InboundMessage) {
        // No subscribers means the pipeline isn't attached yet
        if self.inbound.send(message).is_err() {
            tracing::debug!("Inbound message published with no subscribers");
        }
    }
}
