// ABOUTME: Runtime events emitted by the agent pipeline while a turn is in progress.
// ABOUTME: Channels push these to bound clients; timestamps serialize as second-precision RFC 3339.
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeEventType {
    TurnStarted,
    TurnFinished,
    TurnFailed,
    TurnInterruptRequested,
    LlmStarted,
    LlmFinished,
    ToolStarted,
    ToolFinished,
    RetryStarted,
    RetryFinished,
    CompactionStarted,
    CompactionFinished,
}

impl RuntimeEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeEventType::TurnStarted => "TURN_STARTED",
            RuntimeEventType::TurnFinished => "TURN_FINISHED",
            RuntimeEventType::TurnFailed => "TURN_FAILED",
            RuntimeEventType::TurnInterruptRequested => "TURN_INTERRUPT_REQUESTED",
            RuntimeEventType::LlmStarted => "LLM_STARTED",
            RuntimeEventType::LlmFinished => "LLM_FINISHED",
            RuntimeEventType::ToolStarted => "TOOL_STARTED",
            RuntimeEventType::ToolFinished => "TOOL_FINISHED",
            RuntimeEventType::RetryStarted => "RETRY_STARTED",
            RuntimeEventType::RetryFinished => "RETRY_FINISHED",
            RuntimeEventType::CompactionStarted => "COMPACTION_STARTED",
            RuntimeEventType::CompactionFinished => "COMPACTION_FINISHED",
        }
    }
}

impl std::fmt::Display for RuntimeEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeEvent {
    pub event_type: RuntimeEventType,
    pub timestamp: DateTime<Utc>,
    /// Composite `channel:chatId` of the session the event belongs to, if known
    pub session_id: Option<String>,
    pub payload: Map<String, Value>,
}

impl RuntimeEvent {
    pub fn new(event_type: RuntimeEventType) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            session_id: None,
            payload: Map::new(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn for_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// `2026-03-01T00:00:00Z`
    pub fn timestamp_rfc3339(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}
