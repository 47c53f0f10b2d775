// ABOUTME: Session records keyed by channel and conversation key, plus the SessionStore interface.
// ABOUTME: Includes identity helpers for transport binding and an in-memory store for embedding and tests.
use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CHANNEL_WEB: &str = "web";
pub const CHANNEL_TELEGRAM: &str = "telegram";

/// Metadata field carrying the transport's own chat address.
pub const META_TRANSPORT_CHAT_ID: &str = "transportChatId";
/// Metadata field carrying the conversation key the session was bound under.
pub const META_CONVERSATION_KEY: &str = "conversationKey";

/// Build the session id for an identity: `channelType:conversationKey`.
pub fn session_id(channel_type: &str, conversation_key: &str) -> String {
    format!("{}:{}", channel_type, conversation_key)
}

/// Split a session id into (channel, conversation key). Both halves must be non-empty.
pub fn split_session_id(id: &str) -> Option<(&str, &str)> {
    let (channel, key) = id.split_once(':')?;
    if channel.is_empty() || key.is_empty() {
        return None;
    }
    Some((channel, key))
}

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub id: String,
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl SessionMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: role.into(),
            content: content.into(),
            timestamp: Utc::now(),
            metadata: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub channel_type: String,
    /// Conversation key the session was created under.
    pub chat_id: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub messages: Vec<SessionMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(channel_type: &str, conversation_key: &str) -> Self {
        let now = Utc::now();
        Self {
            id: session_id(channel_type, conversation_key),
            channel_type: channel_type.to_string(),
            chat_id: conversation_key.to_string(),
            metadata: Map::new(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn append_message(&mut self, message: SessionMessage) {
        self.messages.push(message);
        self.touch();
    }

    /// Drop the oldest messages so at most `keep_last` remain.
    /// Returns how many were removed.
    pub fn compact(&mut self, keep_last: usize) -> usize {
        let total = self.messages.len();
        if total <= keep_last {
            return 0;
        }
        let removed = total - keep_last;
        self.messages.drain(..removed);
        self.touch();
        removed
    }

    pub fn clear_messages(&mut self) {
        self.messages.clear();
        self.touch();
    }

    fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

// =============================================================================
// Identity helpers
// =============================================================================

/// Conversation key for a session: metadata first, then the id suffix, then chat id.
pub fn resolve_conversation_key(session: &Session) -> String {
    if let Some(key) = session.metadata_str(META_CONVERSATION_KEY) {
        return key.to_string();
    }
    if let Some((_, key)) = split_session_id(&session.id) {
        return key.to_string();
    }
    session.chat_id.clone()
}

/// Transport chat id for a session: metadata first, then chat id.
pub fn resolve_transport_chat_id(session: &Session) -> String {
    session
        .metadata_str(META_TRANSPORT_CHAT_ID)
        .map(str::to_string)
        .unwrap_or_else(|| session.chat_id.clone())
}

/// Record transport and conversation addressing in the session metadata.
/// Returns true if anything changed (caller decides whether to save).
pub fn bind_transport_and_conversation(
    session: &mut Session,
    transport_chat_id: &str,
    conversation_key: &str,
) -> bool {
    let mut changed = false;
    for (field, value) in [
        (META_TRANSPORT_CHAT_ID, transport_chat_id.trim()),
        (META_CONVERSATION_KEY, conversation_key.trim()),
    ] {
        if value.is_empty() {
            continue;
        }
        if session.metadata.get(field).and_then(Value::as_str) != Some(value) {
            session
                .metadata
                .insert(field.to_string(), Value::String(value.to_string()));
            changed = true;
        }
    }
    if changed {
        session.touch();
    }
    changed
}

/// Most recently updated first. Equal timestamps keep their input order.
pub fn sort_most_recent_first(sessions: &mut [Session]) {
    sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
}

// =============================================================================
// SessionStore
// =============================================================================

/// Durable session storage consumed by the conversation layer.
///
/// Implementations serialize mutations at least per session id.
/// `list_all` returns sessions in a stable order (creation time, then id).
pub trait SessionStore: Send + Sync {
    /// Return the session for this identity, creating and persisting an empty
    /// one if absent. Never modifies an existing session.
    fn get_or_create(&self, channel_type: &str, conversation_key: &str) -> Result<Session>;

    fn get(&self, id: &str) -> Result<Option<Session>>;

    /// Persist the session as given.
    fn save(&self, session: &Session) -> Result<()>;

    /// Returns true if a session was removed.
    fn delete(&self, id: &str) -> Result<bool>;

    fn list_all(&self) -> Result<Vec<Session>>;

    /// Remove the oldest messages leaving `keep_last`. `None` if the session is missing.
    fn compact_messages(&self, id: &str, keep_last: usize) -> Result<Option<usize>>;

    /// Empty the message list, keeping the record. Returns false if missing.
    fn clear_messages(&self, id: &str) -> Result<bool>;

    fn list_by_channel_type(&self, channel_type: &str) -> Result<Vec<Session>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|s| s.channel_type == channel_type)
            .collect())
    }

    fn list_by_channel_type_and_transport_chat_id(
        &self,
        channel_type: &str,
        transport_chat_id: &str,
    ) -> Result<Vec<Session>> {
        Ok(self
            .list_by_channel_type(channel_type)?
            .into_iter()
            .filter(|s| resolve_transport_chat_id(s) == transport_chat_id)
            .collect())
    }
}

// =============================================================================
// MemorySessionStore
// =============================================================================

/// Process-local store. Each session id is its own map entry, so writers on
/// different sessions never contend on one lock.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, Session>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionStore for MemorySessionStore {
    fn get_or_create(&self, channel_type: &str, conversation_key: &str) -> Result<Session> {
        let id = session_id(channel_type, conversation_key);
        let entry = self.sessions.entry(id).or_insert_with(|| {
            tracing::debug!(channel = %channel_type, key = %conversation_key, "Created session");
            Session::new(channel_type, conversation_key)
        });
        Ok(entry.value().clone())
    }

    fn get(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.get(id).map(|s| s.value().clone()))
    }

    fn save(&self, session: &Session) -> Result<()> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.sessions.remove(id).is_some())
    }

    fn list_all(&self) -> Result<Vec<Session>> {
        let mut all: Vec<Session> = self.sessions.iter().map(|s| s.value().clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }

    fn compact_messages(&self, id: &str, keep_last: usize) -> Result<Option<usize>> {
        Ok(self
            .sessions
            .get_mut(id)
            .map(|mut session| session.compact(keep_last)))
    }

    fn clear_messages(&self, id: &str) -> Result<bool> {
        match self.sessions.get_mut(id) {
            Some(mut session) => {
                session.clear_messages();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
