// ABOUTME: Session-id to live-connection registry used to route pushes to bound clients.
// ABOUTME: Connection handles queue outbound frames with try_send and count what they drop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::protocol::OutboundFrame;

/// Outbound side of one live connection.
pub struct ConnectionHandle {
    pub id: String,
    /// Authenticated principal
    pub principal: String,
    tx: mpsc::Sender<Arc<String>>,
    dropped_messages: AtomicU64,
}

impl ConnectionHandle {
    pub fn new(id: String, principal: String, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id,
            principal,
            tx,
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Queue a serialized frame. Returns false, counting the drop, when the
    /// queue is full or the writer has gone away.
    pub fn send(&self, message: Arc<String>) -> bool {
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            parley_core::metrics::record_push_dropped();
            false
        }
    }

    pub fn send_frame(&self, frame: &OutboundFrame) -> bool {
        match serde_json::to_string(frame) {
            Ok(json) => self.send(Arc::new(json)),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize outbound frame");
                false
            }
        }
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("principal", &self.principal)
            .field("dropped_messages", &self.drop_count())
            .finish()
    }
}

/// Maps bound session ids to connections. A later registration for the same
/// session id replaces the earlier one.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    by_session: DashMap<String, Arc<ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the connection previously bound to this session id, if any.
    pub fn register(
        &self,
        session_id: &str,
        handle: Arc<ConnectionHandle>,
    ) -> Option<Arc<ConnectionHandle>> {
        self.by_session.insert(session_id.to_string(), handle)
    }

    /// Live connection for `session_id`. Closed connections resolve to None.
    pub fn resolve(&self, session_id: &str) -> Option<Arc<ConnectionHandle>> {
        let handle = self.by_session.get(session_id).map(|h| Arc::clone(h.value()))?;
        (!handle.is_closed()).then_some(handle)
    }

    /// Remove the binding only if it still belongs to `connection_id`.
    pub fn unregister(&self, session_id: &str, connection_id: &str) -> bool {
        self.by_session
            .remove_if(session_id, |_, h| h.id == connection_id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.by_session.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_session.is_empty()
    }
}
