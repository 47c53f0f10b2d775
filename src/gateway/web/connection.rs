// ABOUTME: Per-connection state machine for the web channel, independent of the socket transport.
// ABOUTME: Authenticates, binds on first session id, then routes frames to commands or the inbound sink.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;

use super::protocol::{parse_frame, DropReason, FrameBody};
use super::registry::ConnectionHandle;
use super::WebChannel;
use crate::auth::{AuthError, TokenClaims};
use crate::bus::InboundMessage;
use parley_core::commands::{classify, Classified, CommandContext, COMMAND_PREFIX};
use parley_core::conversation_key;
use parley_core::metrics;
use parley_core::pointer::web_pointer_key;
use parley_core::session::{session_id as composite_session_id, CHANNEL_WEB};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    AuthenticatedUnbound,
    Bound { session_id: String },
    Closed,
}

/// What handling one frame amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Dropped(DropReason),
    /// A router command ran (its reply, if any, has been queued)
    Command { name: String },
    /// Handed to the inbound sink
    Forwarded,
}

pub struct Connection {
    id: String,
    channel: Arc<WebChannel>,
    state: ConnectionState,
    principal: Option<String>,
    outbound: Option<Arc<ConnectionHandle>>,
}

impl Connection {
    pub fn new(channel: Arc<WebChannel>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel,
            state: ConnectionState::Handshaking,
            principal: None,
            outbound: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    /// Validate the handshake token. Anything but a live access token closes
    /// the connection before it opens.
    pub fn authenticate(&mut self, token: Option<&str>) -> Result<TokenClaims, AuthError> {
        if self.state != ConnectionState::Handshaking {
            return Err(AuthError::Malformed("handshake already completed".to_string()));
        }
        match self.channel.validator().validate_access(token.unwrap_or_default()) {
            Ok(claims) => {
                self.principal = Some(claims.subject.clone());
                self.state = ConnectionState::AuthenticatedUnbound;
                Ok(claims)
            }
            Err(e) => {
                self.state = ConnectionState::Closed;
                metrics::record_connection_rejected(e.reason());
                tracing::warn!(connection_id = %self.id, reason = e.reason(), "Connection rejected");
                Err(e)
            }
        }
    }

    /// Attach the outbound queue once the transport is up.
    pub fn open(&mut self, tx: mpsc::Sender<Arc<String>>) {
        let principal = self.principal.clone().unwrap_or_default();
        self.outbound = Some(Arc::new(ConnectionHandle::new(self.id.clone(), principal, tx)));
        self.channel.connection_opened();
        tracing::info!(
            connection_id = %self.id,
            user = self.principal().unwrap_or_default(),
            "Connection established"
        );
    }

    /// Tear down. Later pushes to the bound session become no-ops.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if let ConnectionState::Bound { session_id } = &self.state {
            self.channel.registry().unregister(session_id, &self.id);
        }
        if self.outbound.take().is_some() {
            self.channel.connection_closed();
        }
        self.state = ConnectionState::Closed;
        tracing::info!(connection_id = %self.id, "Connection closed");
    }

    pub async fn handle_text(&mut self, raw: &str) -> FrameOutcome {
        let outcome = self.route(raw).await;
        if let FrameOutcome::Dropped(reason) = outcome {
            metrics::record_frame_dropped(reason.as_str());
            tracing::debug!(connection_id = %self.id, reason = %reason, "Frame dropped");
        }
        outcome
    }

    async fn route(&mut self, raw: &str) -> FrameOutcome {
        let Some(outbound) = self.outbound.clone() else {
            return FrameOutcome::Dropped(DropReason::NotOpen);
        };
        if matches!(self.state, ConnectionState::Handshaking | ConnectionState::Closed) {
            return FrameOutcome::Dropped(DropReason::NotOpen);
        }

        let frame = match parse_frame(raw) {
            Ok(frame) => frame,
            Err(reason) => return FrameOutcome::Dropped(reason),
        };

        let bound = match &self.state {
            ConnectionState::Bound { session_id } => Some(session_id.clone()),
            _ => None,
        };
        let session_id = match (bound, frame.session_id) {
            (Some(sid), _) => sid,
            (None, Some(sid)) => {
                self.bind(&sid, outbound);
                sid
            }
            (None, None) => return FrameOutcome::Dropped(DropReason::Unbound),
        };

        if let Some(client_instance_id) = frame.client_instance_id.as_deref() {
            self.bind_web_pointer(client_instance_id, &session_id);
        }

        let body = match frame.body {
            Ok(body) => body,
            Err(reason) => return FrameOutcome::Dropped(reason),
        };

        // Only text that itself begins with the prefix is a command
        if body.attachments.is_empty() && body.text.starts_with(COMMAND_PREFIX) {
            if let Classified::Command(cmd) = classify(body.text.trim()) {
                if let Some(outcome) = self.try_command(&cmd.name, &cmd.args, &session_id).await {
                    return outcome;
                }
            }
        }

        if let Some(admission) = self.channel.admission() {
            let result = admission.try_admit_channel(CHANNEL_WEB);
            if !result.allowed {
                tracing::warn!(
                    connection_id = %self.id,
                    session_id = %session_id,
                    wait_ms = result.wait_ms(),
                    "Message rejected by admission control"
                );
                return FrameOutcome::Dropped(DropReason::RateLimited);
            }
        }

        self.forward(body, &session_id);
        FrameOutcome::Forwarded
    }

    fn bind(&mut self, session_id: &str, outbound: Arc<ConnectionHandle>) {
        if let Some(previous) = self.channel.registry().register(session_id, outbound) {
            tracing::debug!(
                session_id = %session_id,
                replaced = %previous.id,
                "Session rebound to a newer connection"
            );
        }
        self.state = ConnectionState::Bound {
            session_id: session_id.to_string(),
        };
        tracing::debug!(connection_id = %self.id, session_id = %session_id, "Connection bound");
    }

    fn bind_web_pointer(&self, client_instance_id: &str, session_id: &str) {
        let (Some(pointers), Some(user)) = (self.channel.pointers(), self.principal()) else {
            return;
        };
        if user.trim().is_empty() || !conversation_key::is_legacy_compatible(session_id) {
            return;
        }
        let pointer_key = web_pointer_key(user, client_instance_id);
        if let Err(e) = pointers.set_active_conversation_key(&pointer_key, session_id) {
            tracing::debug!(error = %e, pointer = %pointer_key, "Failed to persist active pointer");
        }
    }

    /// None when no router claims the command, so the text falls through.
    async fn try_command(&self, name: &str, args: &[String], session_id: &str) -> Option<FrameOutcome> {
        let router = self.channel.router()?;
        if !router.has_command(name) {
            return None;
        }

        let context = CommandContext::for_conversation(CHANNEL_WEB, session_id);
        match router.execute(name, args, &context).await {
            Ok(result) => {
                metrics::record_command_executed(if result.success { "success" } else { "failure" });
                tracing::debug!(command = %name, success = result.success, "Executed command");
                self.channel.send_text(session_id, &result.message);
            }
            Err(e) => {
                metrics::record_command_executed("error");
                tracing::warn!(command = %name, session_id = %session_id, error = %e, "Command execution failed");
            }
        }
        Some(FrameOutcome::Command {
            name: name.to_string(),
        })
    }

    fn forward(&self, body: FrameBody, session_id: &str) {
        let attachments = (!body.attachments.is_empty()).then_some(body.attachments);
        let message = InboundMessage {
            id: uuid::Uuid::new_v4().to_string(),
            role: "user".to_string(),
            content: body.text,
            channel_type: CHANNEL_WEB.to_string(),
            chat_id: session_id.to_string(),
            session_id: composite_session_id(CHANNEL_WEB, session_id),
            sender_id: self.principal().unwrap_or_default().to_string(),
            timestamp: Utc::now(),
            attachments,
        };
        self.channel.sink().submit(message);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("principal", &self.principal)
            .finish()
    }
}
