// ABOUTME: Channel adapter abstraction for pushing output back to users on any transport.
// ABOUTME: Defines the ChannelPort trait that every channel integration implements.

pub mod registry;
pub mod web;

use async_trait::async_trait;

use parley_core::events::RuntimeEvent;

/// Outbound side of a channel. `chat_id` is the channel-local conversation
/// id, not the composite session id.
///
/// Pushes are best-effort: they return whether the message was queued and
/// never fail.
#[async_trait]
pub trait ChannelPort: Send + Sync {
    /// Unique channel type (e.g., "web", "telegram")
    fn channel_type(&self) -> &str;

    async fn send_runtime_event(&self, chat_id: &str, event: &RuntimeEvent) -> bool;

    async fn send_text(&self, chat_id: &str, text: &str) -> bool;

    fn is_session_bound(&self, chat_id: &str) -> bool;
}
