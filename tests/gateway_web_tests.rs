// ABOUTME: Tests for the web channel connection state machine with mock collaborators.
// ABOUTME: Covers binding, command routing, attachment handling, admission, pointers, and push.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use parley::auth::{AuthError, TokenClaims, TokenType, TokenValidator};
use parley::bus::{InboundMessage, InboundSink};
use parley::gateway::web::connection::{Connection, ConnectionState, FrameOutcome};
use parley::gateway::web::protocol::DropReason;
use parley::gateway::web::WebChannel;
use parley_core::admission::AdmissionControl;
use parley_core::commands::{CommandContext, CommandInfo, CommandResult, CommandRouter};
use parley_core::config::RateLimitConfig;
use parley_core::events::{RuntimeEvent, RuntimeEventType};
use parley_core::pointer::{web_pointer_key, PointerStore};

// =============================================================================
// Mock collaborators
// =============================================================================

/// Accepts "access-{user}" and "refresh-{user}"; anything else is malformed.
struct StaticValidator;

impl TokenValidator for StaticValidator {
    fn validate(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let (token_type, subject) = if let Some(user) = token.strip_prefix("access-") {
            (TokenType::Access, user)
        } else if let Some(user) = token.strip_prefix("refresh-") {
            (TokenType::Refresh, user)
        } else {
            return Err(AuthError::Malformed("unknown token".to_string()));
        };
        Ok(TokenClaims {
            subject: subject.to_string(),
            token_type,
            expires_at: chrono::Utc::now() + chrono::Duration::minutes(5),
        })
    }
}

#[derive(Default)]
struct RecordingSink {
    messages: Mutex<Vec<InboundMessage>>,
}

impl RecordingSink {
    fn messages(&self) -> Vec<InboundMessage> {
        self.messages.lock().unwrap().clone()
    }
}

impl InboundSink for RecordingSink {
    fn submit(&self, message: InboundMessage) {
        self.messages.lock().unwrap().push(message);
    }
}

/// Knows "status" and "boom"; "boom" fails to execute.
#[derive(Default)]
struct RecordingRouter {
    calls: Mutex<Vec<(String, Vec<String>, CommandContext)>>,
}

#[async_trait]
impl CommandRouter for RecordingRouter {
    fn has_command(&self, name: &str) -> bool {
        matches!(name, "status" | "boom")
    }

    async fn execute(
        &self,
        name: &str,
        args: &[String],
        context: &CommandContext,
    ) -> Result<CommandResult> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), args.to_vec(), context.clone()));
        if name == "boom" {
            anyhow::bail!("router exploded");
        }
        Ok(CommandResult::success("status ok"))
    }

    fn list_commands(&self) -> Vec<CommandInfo> {
        Vec::new()
    }
}

struct Harness {
    channel: Arc<WebChannel>,
    sink: Arc<RecordingSink>,
    router: Arc<RecordingRouter>,
}

impl Harness {
    fn new() -> Self {
        Self::build(|channel| channel)
    }

    fn build(configure: impl FnOnce(WebChannel) -> WebChannel) -> Self {
        let sink = Arc::new(RecordingSink::default());
        let router = Arc::new(RecordingRouter::default());
        let channel = WebChannel::new(Arc::new(StaticValidator), sink.clone()).with_router(router.clone());
        Self {
            channel: Arc::new(configure(channel)),
            sink,
            router,
        }
    }

    fn connect(&self, user: &str) -> (Connection, mpsc::Receiver<Arc<String>>) {
        let mut conn = Connection::new(Arc::clone(&self.channel));
        conn.authenticate(Some(&format!("access-{}", user))).unwrap();
        let (tx, rx) = mpsc::channel(16);
        conn.open(tx);
        (conn, rx)
    }
}

fn frame(session_id: &str, text: &str) -> String {
    json!({ "sessionId": session_id, "text": text }).to_string()
}

fn image(data: &str) -> Value {
    json!({ "type": "image", "mimeType": "image/png", "dataBase64": data })
}

async fn next_frame(rx: &mut mpsc::Receiver<Arc<String>>) -> Value {
    let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for outbound frame")
        .expect("outbound queue closed");
    serde_json::from_str(&msg).unwrap()
}

// =============================================================================
// Handshake
// =============================================================================

#[test]
fn test_handshake_rejects_missing_and_refresh_tokens() {
    let harness = Harness::new();

    let mut conn = Connection::new(Arc::clone(&harness.channel));
    assert_eq!(conn.authenticate(None), Err(AuthError::Missing));
    assert_eq!(*conn.state(), ConnectionState::Closed);

    let mut conn = Connection::new(Arc::clone(&harness.channel));
    assert_eq!(
        conn.authenticate(Some("refresh-alice")),
        Err(AuthError::WrongType("refresh"))
    );

    let mut conn = Connection::new(Arc::clone(&harness.channel));
    let claims = conn.authenticate(Some("access-alice")).unwrap();
    assert_eq!(claims.subject, "alice");
    assert_eq!(*conn.state(), ConnectionState::AuthenticatedUnbound);
    assert_eq!(conn.principal(), Some("alice"));
}

#[tokio::test]
async fn test_frames_before_open_are_dropped() {
    let harness = Harness::new();
    let mut conn = Connection::new(Arc::clone(&harness.channel));
    conn.authenticate(Some("access-alice")).unwrap();

    let outcome = conn.handle_text(&frame("chat-0001", "hello")).await;
    assert_eq!(outcome, FrameOutcome::Dropped(DropReason::NotOpen));
}

// =============================================================================
// Binding
// =============================================================================

#[tokio::test]
async fn test_first_session_id_binds_and_is_immutable() {
    let harness = Harness::new();
    let (mut conn, _rx) = harness.connect("alice");

    assert_eq!(
        conn.handle_text(&frame("chat-0001", "first")).await,
        FrameOutcome::Forwarded
    );
    assert_eq!(
        *conn.state(),
        ConnectionState::Bound {
            session_id: "chat-0001".to_string()
        }
    );

    conn.handle_text(&frame("chat-9999", "second")).await;
    let messages = harness.sink.messages();
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().all(|m| m.chat_id == "chat-0001"));
    assert!(harness.channel.is_session_bound("chat-0001"));
    assert!(!harness.channel.is_session_bound("chat-9999"));
}

#[tokio::test]
async fn test_unbound_frame_without_session_id_is_dropped() {
    let harness = Harness::new();
    let (mut conn, _rx) = harness.connect("alice");

    let outcome = conn.handle_text(&json!({ "text": "hi", "sessionId": "  " }).to_string()).await;
    assert_eq!(outcome, FrameOutcome::Dropped(DropReason::Unbound));
    assert!(harness.sink.messages().is_empty());
}

#[tokio::test]
async fn test_body_rejected_frame_still_binds() {
    let harness = Harness::new();
    let (mut conn, _rx) = harness.connect("alice");

    let outcome = conn.handle_text(&frame("chat-0001", "   ")).await;
    assert_eq!(outcome, FrameOutcome::Dropped(DropReason::Empty));
    assert!(harness.channel.is_session_bound("chat-0001"));
}

#[tokio::test]
async fn test_close_unregisters_binding() {
    let harness = Harness::new();
    let (mut conn, _rx) = harness.connect("alice");
    conn.handle_text(&frame("chat-0001", "hello")).await;
    assert_eq!(harness.channel.active_connections(), 1);

    conn.close();
    assert_eq!(*conn.state(), ConnectionState::Closed);
    assert!(!harness.channel.is_session_bound("chat-0001"));
    assert_eq!(harness.channel.active_connections(), 0);
}

#[tokio::test]
async fn test_stale_close_keeps_newer_binding() {
    let harness = Harness::new();
    let (mut old, _old_rx) = harness.connect("alice");
    let (mut new, mut new_rx) = harness.connect("alice");

    old.handle_text(&frame("chat-0001", "from old")).await;
    new.handle_text(&frame("chat-0001", "from new")).await;
    old.close();

    assert!(harness.channel.is_session_bound("chat-0001"));
    assert!(harness.channel.send_text("chat-0001", "still here"));
    assert_eq!(next_frame(&mut new_rx).await["text"], "still here");
}

// =============================================================================
// Commands
// =============================================================================

#[tokio::test]
async fn test_status_command_routes_to_router_without_forwarding() {
    let harness = Harness::new();
    let (mut conn, mut rx) = harness.connect("alice");

    let outcome = conn.handle_text(&frame("chat-0001", "/status now")).await;
    assert_eq!(
        outcome,
        FrameOutcome::Command {
            name: "status".to_string()
        }
    );
    assert!(harness.sink.messages().is_empty());

    let calls = harness.router.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    let (name, args, ctx) = &calls[0];
    assert_eq!(name, "status");
    assert_eq!(args, &vec!["now".to_string()]);
    assert_eq!(ctx.session_id, "web:chat-0001");
    assert_eq!(ctx.channel_type, "web");
    assert_eq!(ctx.chat_id, "chat-0001");
    assert_eq!(ctx.conversation_key, "chat-0001");

    let reply = next_frame(&mut rx).await;
    assert_eq!(reply["type"], "assistant_chunk");
    assert_eq!(reply["sessionId"], "chat-0001");
    assert_eq!(reply["text"], "status ok");
}

#[tokio::test]
async fn test_failing_command_is_swallowed() {
    let harness = Harness::new();
    let (mut conn, mut rx) = harness.connect("alice");

    let outcome = conn.handle_text(&frame("chat-0001", "/boom")).await;
    assert_eq!(
        outcome,
        FrameOutcome::Command {
            name: "boom".to_string()
        }
    );
    assert!(harness.sink.messages().is_empty());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_unknown_command_falls_through_with_raw_text() {
    let harness = Harness::new();
    let (mut conn, _rx) = harness.connect("alice");

    let outcome = conn.handle_text(&frame("chat-0001", "/unknown thing")).await;
    assert_eq!(outcome, FrameOutcome::Forwarded);
    assert_eq!(harness.sink.messages()[0].content, "/unknown thing");
}

#[tokio::test]
async fn test_leading_whitespace_slash_is_plain_text() {
    let harness = Harness::new();
    let (mut conn, mut rx) = harness.connect("alice");

    let outcome = conn.handle_text(&frame("chat-0001", "  /status")).await;
    assert_eq!(outcome, FrameOutcome::Forwarded);
    assert!(harness.router.calls.lock().unwrap().is_empty());
    assert_eq!(harness.sink.messages()[0].content, "  /status");
    assert!(rx.try_recv().is_err());

    // Trailing whitespace after a real command is still a command
    let outcome = conn.handle_text(&frame("chat-0001", "/status  ")).await;
    assert_eq!(
        outcome,
        FrameOutcome::Command {
            name: "status".to_string()
        }
    );
}

#[tokio::test]
async fn test_commands_fall_through_without_router() {
    let sink = Arc::new(RecordingSink::default());
    let channel = Arc::new(WebChannel::new(Arc::new(StaticValidator), sink.clone()));
    let mut conn = Connection::new(Arc::clone(&channel));
    conn.authenticate(Some("access-alice")).unwrap();
    let (tx, _rx) = mpsc::channel(4);
    conn.open(tx);

    assert_eq!(
        conn.handle_text(&frame("chat-0001", "/status")).await,
        FrameOutcome::Forwarded
    );
    assert_eq!(sink.messages().len(), 1);
}

#[tokio::test]
async fn test_attachment_frames_are_never_commands() {
    let harness = Harness::new();
    let (mut conn, _rx) = harness.connect("alice");

    let raw = json!({
        "sessionId": "chat-0001",
        "text": "/status",
        "attachments": [image("aGVsbG8=")],
    })
    .to_string();
    assert_eq!(conn.handle_text(&raw).await, FrameOutcome::Forwarded);
    assert!(harness.router.calls.lock().unwrap().is_empty());
}

// =============================================================================
// Generic path and attachments
// =============================================================================

#[tokio::test]
async fn test_forwarded_message_fields() {
    let harness = Harness::new();
    let (mut conn, _rx) = harness.connect("alice");
    conn.handle_text(&frame("chat-0001", "hello there")).await;

    let messages = harness.sink.messages();
    let msg = &messages[0];
    assert_eq!(msg.role, "user");
    assert_eq!(msg.content, "hello there");
    assert_eq!(msg.channel_type, "web");
    assert_eq!(msg.chat_id, "chat-0001");
    assert_eq!(msg.session_id, "web:chat-0001");
    assert_eq!(msg.sender_id, "alice");
    assert!(msg.attachments.is_none());
    assert!(uuid::Uuid::parse_str(&msg.id).is_ok());
}

#[tokio::test]
async fn test_eight_images_are_truncated_to_six_in_order() {
    let harness = Harness::new();
    let (mut conn, _rx) = harness.connect("alice");

    let payloads = ["YQ==", "Yg==", "Yw==", "ZA==", "ZQ==", "Zg==", "Zw==", "aA=="];
    let attachments: Vec<Value> = payloads.iter().map(|p| image(p)).collect();
    let raw = json!({ "sessionId": "chat-0001", "text": "", "attachments": attachments }).to_string();

    assert_eq!(conn.handle_text(&raw).await, FrameOutcome::Forwarded);
    let messages = harness.sink.messages();
    let forwarded = messages[0].attachments.as_ref().unwrap();
    let data: Vec<&str> = forwarded.iter().map(|a| a.data_base64.as_str()).collect();
    assert_eq!(data, &payloads[..6]);
    assert!(forwarded.iter().all(|a| a.name == "image"));
}

#[tokio::test]
async fn test_empty_frame_is_fully_dropped() {
    let harness = Harness::new();
    let (mut conn, mut rx) = harness.connect("alice");

    let outcome = conn
        .handle_text(&json!({ "sessionId": "chat-0001", "text": "", "attachments": [] }).to_string())
        .await;
    assert_eq!(outcome, FrameOutcome::Dropped(DropReason::Empty));
    assert!(harness.sink.messages().is_empty());
    assert!(harness.router.calls.lock().unwrap().is_empty());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_invalid_attachment_drops_message() {
    let harness = Harness::new();
    let (mut conn, _rx) = harness.connect("alice");

    let pdf = json!({
        "sessionId": "chat-0001",
        "text": "see file",
        "attachments": [{ "type": "file", "mimeType": "application/pdf", "dataBase64": "YQ==" }],
    })
    .to_string();
    assert_eq!(
        conn.handle_text(&pdf).await,
        FrameOutcome::Dropped(DropReason::UnsupportedAttachmentType)
    );

    let bad = json!({ "sessionId": "chat-0001", "text": "x", "attachments": [image("!!not-base64!!")] })
        .to_string();
    assert_eq!(
        conn.handle_text(&bad).await,
        FrameOutcome::Dropped(DropReason::InvalidAttachmentEncoding)
    );
    assert!(harness.sink.messages().is_empty());
}

#[tokio::test]
async fn test_malformed_json_is_dropped() {
    let harness = Harness::new();
    let (mut conn, _rx) = harness.connect("alice");
    assert_eq!(
        conn.handle_text("{not json").await,
        FrameOutcome::Dropped(DropReason::MalformedJson)
    );
}

// =============================================================================
// Admission and pointers
// =============================================================================

#[tokio::test]
async fn test_admission_denial_drops_generic_messages_only() {
    let admission = Arc::new(AdmissionControl::new(&RateLimitConfig {
        enabled: true,
        user_requests_per_minute: 2,
        channel_messages_per_second: 30,
        llm_requests_per_minute: 60,
    }));
    let harness = Harness::build(|c| c.with_admission(admission));
    let (mut conn, _rx) = harness.connect("alice");

    assert_eq!(conn.handle_text(&frame("chat-0001", "one")).await, FrameOutcome::Forwarded);
    assert_eq!(conn.handle_text(&frame("chat-0001", "two")).await, FrameOutcome::Forwarded);
    assert_eq!(
        conn.handle_text(&frame("chat-0001", "three")).await,
        FrameOutcome::Dropped(DropReason::RateLimited)
    );
    // Commands are not metered
    assert_eq!(
        conn.handle_text(&frame("chat-0001", "/status")).await,
        FrameOutcome::Command {
            name: "status".to_string()
        }
    );
    assert_eq!(harness.sink.messages().len(), 2);
}

#[tokio::test]
async fn test_channel_denial_does_not_spend_global_budget() {
    let admission = Arc::new(AdmissionControl::new(&RateLimitConfig {
        enabled: true,
        user_requests_per_minute: 10,
        channel_messages_per_second: 1,
        llm_requests_per_minute: 60,
    }));
    let harness = Harness::build({
        let admission = Arc::clone(&admission);
        move |c| c.with_admission(admission)
    });
    let (mut conn, _rx) = harness.connect("alice");

    assert_eq!(conn.handle_text(&frame("chat-0001", "one")).await, FrameOutcome::Forwarded);
    assert_eq!(
        conn.handle_text(&frame("chat-0001", "two")).await,
        FrameOutcome::Dropped(DropReason::RateLimited)
    );
    assert_eq!(admission.bucket_state("user:global").unwrap().tokens, 9);
}

#[tokio::test]
async fn test_client_instance_id_sets_web_pointer() {
    let pointers = Arc::new(PointerStore::in_memory());
    let harness = Harness::build({
        let pointers = Arc::clone(&pointers);
        move |c| c.with_pointers(pointers)
    });
    let (mut conn, _rx) = harness.connect("alice");

    let raw = json!({ "sessionId": "chat-0001", "clientInstanceId": "tab-1", "text": "hi" }).to_string();
    conn.handle_text(&raw).await;
    assert_eq!(
        pointers.get_active_conversation_key(&web_pointer_key("alice", "tab-1")),
        Some("chat-0001".to_string())
    );

    // Session ids outside the legacy charset never become pointers
    let (mut other, _rx2) = harness.connect("alice");
    let raw = json!({ "sessionId": "bad key!", "clientInstanceId": "tab-2", "text": "hi" }).to_string();
    assert_eq!(other.handle_text(&raw).await, FrameOutcome::Forwarded);
    assert_eq!(
        pointers.get_active_conversation_key(&web_pointer_key("alice", "tab-2")),
        None
    );
}

// =============================================================================
// Push
// =============================================================================

#[tokio::test]
async fn test_runtime_event_push_requires_binding() {
    let harness = Harness::new();
    let event = RuntimeEvent::new(RuntimeEventType::ToolStarted)
        .at(chrono::DateTime::parse_from_rfc3339("2026-03-01T00:00:00Z").unwrap().into())
        .with_payload("tool", "search");

    assert!(!harness.channel.send_runtime_event("chat-0001", &event));
    assert!(!harness.channel.send_runtime_event("  ", &event));

    let (mut conn, mut rx) = harness.connect("alice");
    conn.handle_text(&frame("chat-0001", "hello")).await;
    assert!(harness.channel.send_runtime_event("chat-0001", &event));

    let pushed = next_frame(&mut rx).await;
    assert_eq!(pushed["type"], "system_event");
    assert_eq!(pushed["eventType"], "runtime_event");
    assert_eq!(pushed["runtimeEventType"], "TOOL_STARTED");
    assert_eq!(pushed["runtimeEventTimestamp"], "2026-03-01T00:00:00Z");
    assert_eq!(pushed["sessionId"], "chat-0001");
    assert_eq!(pushed["runtimeEventPayload"]["tool"], "search");

    conn.close();
    assert!(!harness.channel.send_runtime_event("chat-0001", &event));
}

#[tokio::test]
async fn test_full_outbound_queue_drops_push() {
    let harness = Harness::new();
    let mut conn = Connection::new(Arc::clone(&harness.channel));
    conn.authenticate(Some("access-alice")).unwrap();
    let (tx, _rx) = mpsc::channel(1);
    conn.open(tx);
    conn.handle_text(&frame("chat-0001", "hello")).await;

    assert!(harness.channel.send_done("chat-0001"));
    assert!(!harness.channel.send_typing("chat-0001"));
    let handle = harness.channel.registry().resolve("chat-0001").unwrap();
    assert_eq!(handle.drop_count(), 1);
}
