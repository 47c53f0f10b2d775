// ABOUTME: Wire format of the real-time web channel: inbound frame parsing and outbound envelopes.
// ABOUTME: parse_frame is the single stage where every silent-drop decision is made.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::bus::InboundAttachment;
use parley_core::events::RuntimeEvent;

pub const MAX_IMAGE_ATTACHMENTS: usize = 6;
pub const MAX_IMAGE_BYTES: usize = 8 * 1024 * 1024;
pub const DEFAULT_ATTACHMENT_NAME: &str = "image";

const ATTACHMENT_TYPE_IMAGE: &str = "image";
const IMAGE_MIME_PREFIX: &str = "image/";

// =============================================================================
// Drop reasons
// =============================================================================

/// Why an inbound frame produced no effect. Drops are silent to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    MalformedJson,
    UnsupportedAttachmentType,
    InvalidAttachmentEncoding,
    AttachmentTooLarge,
    /// Neither text nor attachments
    Empty,
    /// No session id yet and the frame didn't carry one
    Unbound,
    RateLimited,
    /// Connection is not authenticated or already closed
    NotOpen,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::MalformedJson => "malformed_json",
            DropReason::UnsupportedAttachmentType => "unsupported_attachment_type",
            DropReason::InvalidAttachmentEncoding => "invalid_attachment_encoding",
            DropReason::AttachmentTooLarge => "attachment_too_large",
            DropReason::Empty => "empty",
            DropReason::Unbound => "unbound",
            DropReason::RateLimited => "rate_limited",
            DropReason::NotOpen => "not_open",
        }
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Inbound
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    client_instance_id: Option<String>,
    #[serde(default)]
    attachments: Option<Vec<RawAttachment>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAttachment {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    data_base64: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// Content of a frame that is fit to be routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBody {
    /// Text as sent (untrimmed)
    pub text: String,
    pub attachments: Vec<InboundAttachment>,
}

/// A frame whose envelope parsed. Addressing is always available for
/// binding even when the body was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame {
    /// Trimmed, non-blank session id
    pub session_id: Option<String>,
    /// Trimmed, non-blank client instance id
    pub client_instance_id: Option<String>,
    pub body: Result<FrameBody, DropReason>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse one inbound text frame.
///
/// Returns `Err` only when the envelope itself is unreadable. Attachment and
/// emptiness problems land in `ParsedFrame::body`.
pub fn parse_frame(raw: &str) -> Result<ParsedFrame, DropReason> {
    let frame: RawFrame = serde_json::from_str(raw).map_err(|_| DropReason::MalformedJson)?;

    let text = frame.text.unwrap_or_default();
    let body = parse_attachments(frame.attachments.unwrap_or_default()).and_then(|attachments| {
        if text.trim().is_empty() && attachments.is_empty() {
            Err(DropReason::Empty)
        } else {
            Ok(FrameBody { text, attachments })
        }
    });

    Ok(ParsedFrame {
        session_id: non_blank(frame.session_id),
        client_instance_id: non_blank(frame.client_instance_id),
        body,
    })
}

/// Validate at most the first six attachments; the rest are discarded unseen.
fn parse_attachments(raw: Vec<RawAttachment>) -> Result<Vec<InboundAttachment>, DropReason> {
    raw.into_iter()
        .take(MAX_IMAGE_ATTACHMENTS)
        .map(validate_attachment)
        .collect()
}

fn validate_attachment(raw: RawAttachment) -> Result<InboundAttachment, DropReason> {
    let mime_type = raw.mime_type.unwrap_or_default();
    if raw.kind.as_deref() != Some(ATTACHMENT_TYPE_IMAGE) || !mime_type.starts_with(IMAGE_MIME_PREFIX) {
        return Err(DropReason::UnsupportedAttachmentType);
    }

    let data_base64 = raw.data_base64.unwrap_or_default();
    if data_base64.trim().is_empty() {
        return Err(DropReason::InvalidAttachmentEncoding);
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(data_base64.as_bytes())
        .map_err(|_| DropReason::InvalidAttachmentEncoding)?;
    if decoded.is_empty() {
        return Err(DropReason::InvalidAttachmentEncoding);
    }
    if decoded.len() > MAX_IMAGE_BYTES {
        return Err(DropReason::AttachmentTooLarge);
    }

    Ok(InboundAttachment {
        mime_type,
        name: non_blank(raw.name).unwrap_or_else(|| DEFAULT_ATTACHMENT_NAME.to_string()),
        data_base64,
    })
}

// =============================================================================
// Outbound
// =============================================================================

pub const EVENT_TYPE_RUNTIME: &str = "runtime_event";
pub const EVENT_TYPE_TYPING: &str = "typing";

/// Messages from the server to the client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    #[serde(rename_all = "camelCase")]
    AssistantChunk { session_id: String, text: String },
    #[serde(rename_all = "camelCase")]
    AssistantDone { session_id: String },
    #[serde(rename_all = "camelCase")]
    SystemEvent {
        event_type: &'static str,
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        runtime_event_type: Option<&'static str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        runtime_event_timestamp: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        runtime_event_payload: Option<Map<String, Value>>,
    },
}

impl OutboundFrame {
    pub fn chunk(session_id: &str, text: impl Into<String>) -> Self {
        OutboundFrame::AssistantChunk {
            session_id: session_id.to_string(),
            text: text.into(),
        }
    }

    pub fn done(session_id: &str) -> Self {
        OutboundFrame::AssistantDone {
            session_id: session_id.to_string(),
        }
    }

    pub fn typing(session_id: &str) -> Self {
        OutboundFrame::SystemEvent {
            event_type: EVENT_TYPE_TYPING,
            session_id: session_id.to_string(),
            runtime_event_type: None,
            runtime_event_timestamp: None,
            runtime_event_payload: None,
        }
    }

    pub fn runtime_event(session_id: &str, event: &RuntimeEvent) -> Self {
        OutboundFrame::SystemEvent {
            event_type: EVENT_TYPE_RUNTIME,
            session_id: session_id.to_string(),
            runtime_event_type: Some(event.event_type.as_str()),
            runtime_event_timestamp: Some(event.timestamp_rfc3339()),
            runtime_event_payload: Some(event.payload.clone()),
        }
    }
}
