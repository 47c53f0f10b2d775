// ABOUTME: Real-time web channel: WebSocket endpoint plus push operations toward bound clients.
// ABOUTME: Each socket runs a writer task and a reader loop around one Connection state machine.

pub mod connection;
pub mod protocol;
pub mod registry;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::auth::TokenValidator;
use crate::bus::InboundSink;
use crate::gateway::ChannelPort;
use connection::Connection;
use parley_core::admission::AdmissionControl;
use parley_core::commands::CommandRouter;
use parley_core::events::RuntimeEvent;
use parley_core::metrics;
use parley_core::pointer::PointerStore;
use parley_core::session::CHANNEL_WEB;
use protocol::OutboundFrame;
use registry::ConnectionRegistry;

pub const DEFAULT_OUTBOUND_BUFFER: usize = 64;

/// Shared state of the web channel across all of its connections.
pub struct WebChannel {
    registry: ConnectionRegistry,
    validator: Arc<dyn TokenValidator>,
    sink: Arc<dyn InboundSink>,
    router: Option<Arc<dyn CommandRouter>>,
    pointers: Option<Arc<PointerStore>>,
    admission: Option<Arc<AdmissionControl>>,
    outbound_buffer: usize,
    active_connections: AtomicUsize,
}

impl WebChannel {
    pub fn new(validator: Arc<dyn TokenValidator>, sink: Arc<dyn InboundSink>) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            validator,
            sink,
            router: None,
            pointers: None,
            admission: None,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            active_connections: AtomicUsize::new(0),
        }
    }

    pub fn with_router(mut self, router: Arc<dyn CommandRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_pointers(mut self, pointers: Arc<PointerStore>) -> Self {
        self.pointers = Some(pointers);
        self
    }

    pub fn with_admission(mut self, admission: Arc<AdmissionControl>) -> Self {
        self.admission = Some(admission);
        self
    }

    pub fn with_outbound_buffer(mut self, size: usize) -> Self {
        self.outbound_buffer = size.max(1);
        self
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn validator(&self) -> &dyn TokenValidator {
        self.validator.as_ref()
    }

    pub fn sink(&self) -> &dyn InboundSink {
        self.sink.as_ref()
    }

    pub fn router(&self) -> Option<&Arc<dyn CommandRouter>> {
        self.router.as_ref()
    }

    pub fn pointers(&self) -> Option<&Arc<PointerStore>> {
        self.pointers.as_ref()
    }

    pub fn admission(&self) -> Option<&Arc<AdmissionControl>> {
        self.admission.as_ref()
    }

    pub fn outbound_buffer(&self) -> usize {
        self.outbound_buffer
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub(crate) fn connection_opened(&self) {
        let active = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::record_connection_opened();
        metrics::set_active_connections(active);
    }

    pub(crate) fn connection_closed(&self) {
        let previous = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        metrics::set_active_connections(previous.saturating_sub(1));
    }

    // =========================================================================
    // Push
    // =========================================================================

    /// Queue a frame for the connection bound to `session_id`. Unknown, blank,
    /// or closed targets are a silent no-op.
    fn push(&self, session_id: &str, frame: &OutboundFrame) -> bool {
        if session_id.trim().is_empty() {
            return false;
        }
        match self.registry.resolve(session_id) {
            Some(handle) => handle.send_frame(frame),
            None => false,
        }
    }

    pub fn send_runtime_event(&self, session_id: &str, event: &RuntimeEvent) -> bool {
        let delivered = self.push(session_id, &OutboundFrame::runtime_event(session_id, event));
        if delivered {
            metrics::record_runtime_event_pushed();
        }
        delivered
    }

    pub fn send_text(&self, session_id: &str, text: &str) -> bool {
        self.push(session_id, &OutboundFrame::chunk(session_id, text))
    }

    pub fn send_done(&self, session_id: &str) -> bool {
        self.push(session_id, &OutboundFrame::done(session_id))
    }

    pub fn send_typing(&self, session_id: &str) -> bool {
        self.push(session_id, &OutboundFrame::typing(session_id))
    }

    pub fn is_session_bound(&self, session_id: &str) -> bool {
        !session_id.trim().is_empty() && self.registry.resolve(session_id).is_some()
    }
}

#[async_trait]
impl ChannelPort for WebChannel {
    fn channel_type(&self) -> &str {
        CHANNEL_WEB
    }

    async fn send_runtime_event(&self, chat_id: &str, event: &RuntimeEvent) -> bool {
        WebChannel::send_runtime_event(self, chat_id, event)
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> bool {
        WebChannel::send_text(self, chat_id, text)
    }

    fn is_session_bound(&self, chat_id: &str) -> bool {
        WebChannel::is_session_bound(self, chat_id)
    }
}

impl std::fmt::Debug for WebChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebChannel")
            .field("bound_sessions", &self.registry.len())
            .field("active_connections", &self.active_connections())
            .field("router", &self.router.is_some())
            .field("admission", &self.admission.is_some())
            .finish()
    }
}

// =============================================================================
// WebSocket Handler
// =============================================================================

/// WebSocket upgrade handler at /ws. The access token rides in `?token=`;
/// rejection happens before the upgrade, so nothing is ever sent on a socket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(web): State<Arc<WebChannel>>,
) -> Response {
    let mut conn = Connection::new(Arc::clone(&web));
    if conn.authenticate(params.get("token").map(String::as_str)).is_err() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let buffer = web.outbound_buffer();
    ws.on_upgrade(move |socket| run_connection(socket, conn, buffer))
}

async fn run_connection(socket: WebSocket, mut conn: Connection, buffer: usize) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(buffer);
    conn.open(tx);

    // Writer task: drains the outbound queue into the socket
    let mut writer_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sink.send(Message::Text(msg.as_str().into())).await.is_err() {
                break;
            }
        }
    });

    // Reader loop: frames are handled strictly in receipt order
    let reader = async {
        while let Some(Ok(msg)) = ws_stream.next().await {
            match msg {
                Message::Text(text) => {
                    conn.handle_text(text.as_str()).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = &mut writer_task => {},
        _ = reader => {},
    }

    conn.close();
    writer_task.abort();
}
