// ABOUTME: Conversation orchestration over sessions and pointers: resolve-with-repair, delete-with-repoint.
// ABOUTME: Also creates, activates, and lists conversations per channel and transport scope.
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::conversation_key;
use crate::metrics;
use crate::pointer::{self, PointerStore};
use crate::session::{
    bind_transport_and_conversation, resolve_conversation_key, resolve_transport_chat_id,
    session_id, sort_most_recent_first, split_session_id, Session, SessionStore,
    CHANNEL_TELEGRAM,
};

pub const DEFAULT_KEEP_LAST: usize = 20;
pub const MAX_RECENT_LIMIT: usize = 20;
const TITLE_MAX_LEN: usize = 64;
const PREVIEW_MAX_LEN: usize = 160;
const TITLE_KEY_PREFIX_LEN: usize = 12;
const DEFAULT_SESSION_TITLE: &str = "New session";

/// How an active conversation was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveSource {
    /// The stored pointer was valid.
    Pointer,
    /// The stored pointer was stale and has been rewritten.
    Repaired,
    /// There was no pointer; one has been created.
    Default,
}

impl ActiveSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActiveSource::Pointer => "pointer",
            ActiveSource::Repaired => "repaired",
            ActiveSource::Default => "default",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveConversation {
    pub conversation_key: String,
    pub session_id: String,
    pub source: ActiveSource,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub channel_type: String,
    pub conversation_key: String,
    pub transport_chat_id: String,
    pub message_count: usize,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Coordinates the session store and the pointer store.
#[derive(Clone)]
pub struct ConversationService {
    store: Arc<dyn SessionStore>,
    pointers: Arc<PointerStore>,
}

impl ConversationService {
    pub fn new(store: Arc<dyn SessionStore>, pointers: Arc<PointerStore>) -> Self {
        Self { store, pointers }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn pointers(&self) -> &Arc<PointerStore> {
        &self.pointers
    }

    // =========================================================================
    // Resolve with repair
    // =========================================================================

    /// Resolve the conversation a pointer refers to, repairing it if stale.
    ///
    /// `transport_chat_id` narrows the fallback scope to sessions bound to that
    /// upstream chat. The repaired mapping is persisted before returning.
    pub fn resolve_active(
        &self,
        pointer_key: &str,
        channel_type: &str,
        transport_chat_id: Option<&str>,
    ) -> Result<ActiveConversation> {
        let current = self.pointers.get_active_conversation_key(pointer_key);

        if let Some(key) = current.as_deref() {
            if self.is_resolvable(channel_type, transport_chat_id, key)? {
                return Ok(ActiveConversation {
                    conversation_key: key.to_string(),
                    session_id: session_id(channel_type, key),
                    source: ActiveSource::Pointer,
                });
            }
            tracing::info!(
                pointer = %pointer_key,
                stale = %key,
                "Active pointer references missing session, repairing"
            );
        }

        let repaired =
            self.resolve_or_create_conversation_key(channel_type, transport_chat_id, current.as_deref())?;
        self.pointers
            .set_active_conversation_key(pointer_key, &repaired)?;

        let source = if current.is_some() {
            ActiveSource::Repaired
        } else {
            ActiveSource::Default
        };
        metrics::record_pointer_repair(source.as_str());

        Ok(ActiveConversation {
            session_id: session_id(channel_type, &repaired),
            conversation_key: repaired,
            source,
        })
    }

    /// Return `preferred` if it still resolves, else the latest session in
    /// scope, else a freshly created one.
    pub fn resolve_or_create_conversation_key(
        &self,
        channel_type: &str,
        transport_chat_id: Option<&str>,
        preferred: Option<&str>,
    ) -> Result<String> {
        if let Some(key) = preferred.filter(|k| !k.trim().is_empty()) {
            if self.is_resolvable(channel_type, transport_chat_id, key)? {
                return Ok(key.to_string());
            }
        }

        let fallback = match self.find_latest_conversation_key(channel_type, transport_chat_id, preferred)? {
            Some(key) => key,
            None => conversation_key::generate(),
        };

        if !self.is_resolvable(channel_type, transport_chat_id, &fallback)? {
            self.ensure_session_exists(channel_type, transport_chat_id, &fallback)?;
        }
        Ok(fallback)
    }

    fn is_resolvable(
        &self,
        channel_type: &str,
        transport_chat_id: Option<&str>,
        key: &str,
    ) -> Result<bool> {
        if channel_type.is_empty() || !conversation_key::is_legacy_compatible(key) {
            return Ok(false);
        }
        let Some(session) = self.store.get(&session_id(channel_type, key.trim()))? else {
            return Ok(false);
        };
        Ok(match transport_chat_id {
            Some(transport) => resolve_transport_chat_id(&session) == transport,
            None => true,
        })
    }

    fn sessions_in_scope(
        &self,
        channel_type: &str,
        transport_chat_id: Option<&str>,
    ) -> Result<Vec<Session>> {
        let mut sessions = match transport_chat_id {
            Some(transport) => self
                .store
                .list_by_channel_type_and_transport_chat_id(channel_type, transport)?,
            None => self.store.list_by_channel_type(channel_type)?,
        };
        sort_most_recent_first(&mut sessions);
        Ok(sessions)
    }

    fn find_latest_conversation_key(
        &self,
        channel_type: &str,
        transport_chat_id: Option<&str>,
        excluded: Option<&str>,
    ) -> Result<Option<String>> {
        Ok(self
            .sessions_in_scope(channel_type, transport_chat_id)?
            .iter()
            .map(resolve_conversation_key)
            .find(|key| !key.trim().is_empty() && Some(key.as_str()) != excluded))
    }

    fn ensure_session_exists(
        &self,
        channel_type: &str,
        transport_chat_id: Option<&str>,
        key: &str,
    ) -> Result<Session> {
        let mut session = self.store.get_or_create(channel_type, key)?;
        if let Some(transport) = transport_chat_id {
            if bind_transport_and_conversation(&mut session, transport, key) {
                self.store.save(&session)?;
            }
        }
        Ok(session)
    }

    // =========================================================================
    // Delete with repoint
    // =========================================================================

    /// Delete a session and move every pointer that referenced it onto the
    /// latest remaining session in the same scope. Pointers with no fallback
    /// are cleared. Pointers into other conversations are left alone.
    ///
    /// Returns false if no session existed under `id`.
    pub fn delete_session(&self, id: &str) -> Result<bool> {
        let existing = self.store.get(id)?;
        let deleted = self.store.delete(id)?;

        let (channel, deleted_key) = match &existing {
            Some(session) => (session.channel_type.clone(), resolve_conversation_key(session)),
            None => match split_session_id(id) {
                Some((channel, key)) => (channel.to_string(), key.to_string()),
                None => return Ok(deleted),
            },
        };

        let snapshot = self.pointers.snapshot();
        let mut repointed = 0usize;
        let mut cleared = 0usize;
        for (pointer_key, target) in snapshot {
            if target != deleted_key || !pointer::is_pointer_for_channel(&pointer_key, &channel) {
                continue;
            }

            let transport = if channel == CHANNEL_TELEGRAM {
                pointer::telegram_transport_chat_id(&pointer_key)
            } else {
                None
            };

            match self.find_latest_conversation_key(&channel, transport, Some(&deleted_key))? {
                Some(replacement) => {
                    self.pointers
                        .set_active_conversation_key(&pointer_key, &replacement)?;
                    repointed += 1;
                }
                None => {
                    self.pointers.clear_active_conversation_key(&pointer_key)?;
                    cleared += 1;
                }
            }
        }

        tracing::info!(
            session_id = %id,
            deleted,
            repointed,
            cleared,
            "Session deleted"
        );
        Ok(deleted)
    }

    // =========================================================================
    // Create / activate / list
    // =========================================================================

    /// Create a conversation under a strict `preferred` key or a generated one,
    /// optionally making it active for `activate_pointer`.
    pub fn create_conversation(
        &self,
        channel_type: &str,
        preferred: Option<&str>,
        activate_pointer: Option<&str>,
        transport_chat_id: Option<&str>,
    ) -> Result<Session> {
        let key = match preferred.filter(|k| !k.trim().is_empty()) {
            Some(k) => conversation_key::normalize_strict(k)?,
            None => conversation_key::generate(),
        };

        let session = self.ensure_session_exists(channel_type, transport_chat_id, &key)?;
        if let Some(pointer_key) = activate_pointer {
            self.pointers.set_active_conversation_key(pointer_key, &key)?;
        }
        tracing::info!(session_id = %session.id, "Conversation created");
        Ok(session)
    }

    /// Make `key` active for `pointer_key`. Strict keys are always accepted;
    /// legacy keys only when a session already exists under them.
    pub fn activate_conversation(
        &self,
        pointer_key: &str,
        channel_type: &str,
        key: &str,
        transport_chat_id: Option<&str>,
    ) -> Result<String> {
        let key = conversation_key::normalize_for_activation(key, channel_type, self.store.as_ref())?;
        self.ensure_session_exists(channel_type, transport_chat_id, &key)?;
        self.pointers.set_active_conversation_key(pointer_key, &key)?;
        Ok(key)
    }

    /// Most recent sessions in scope, newest first. `limit` is clamped to 1..=20.
    pub fn list_recent(
        &self,
        channel_type: &str,
        transport_chat_id: Option<&str>,
        pointer_key: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SessionSummary>> {
        let limit = limit.clamp(1, MAX_RECENT_LIMIT);
        let active = pointer_key.and_then(|p| self.pointers.get_active_conversation_key(p));

        Ok(self
            .sessions_in_scope(channel_type, transport_chat_id)?
            .iter()
            .take(limit)
            .map(|session| {
                let key = resolve_conversation_key(session);
                let is_active = active.as_deref() == Some(key.as_str());
                summarize(session, is_active)
            })
            .collect())
    }

    /// Resolve the active conversation for an upstream chat, binding the
    /// chosen session to that chat.
    pub fn resolve_telegram_active(&self, transport_chat_id: &str) -> Result<ActiveConversation> {
        let pointer_key = pointer::telegram_pointer_key(transport_chat_id);
        let active = self.resolve_active(&pointer_key, CHANNEL_TELEGRAM, Some(transport_chat_id))?;
        self.ensure_session_exists(
            CHANNEL_TELEGRAM,
            Some(transport_chat_id),
            &active.conversation_key,
        )?;
        Ok(active)
    }

    /// Compact a session, keeping `keep_last` (default 20) newest messages.
    pub fn compact(&self, id: &str, keep_last: Option<usize>) -> Result<Option<usize>> {
        let removed = self
            .store
            .compact_messages(id, keep_last.unwrap_or(DEFAULT_KEEP_LAST))?;
        if let Some(n) = removed.filter(|n| *n > 0) {
            tracing::info!(session_id = %id, removed = n, "Session compacted");
        }
        Ok(removed)
    }

    pub fn clear(&self, id: &str) -> Result<bool> {
        self.store.clear_messages(id)
    }
}

impl std::fmt::Debug for ConversationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationService")
            .field("store", &"<SessionStore>")
            .field("pointers", &self.pointers)
            .finish()
    }
}

// =============================================================================
// Summaries
// =============================================================================

fn truncate(value: &str, max_len: usize) -> String {
    if value.chars().count() <= max_len {
        return value.to_string();
    }
    if max_len <= 3 {
        return value.chars().take(max_len).collect();
    }
    let mut out: String = value.chars().take(max_len - 3).collect();
    out.push_str("...");
    out
}

fn build_title(session: &Session, key: &str) -> String {
    let first_user = session
        .messages
        .iter()
        .filter(|m| m.role == "user")
        .map(|m| m.content.trim())
        .find(|c| !c.is_empty());
    if let Some(content) = first_user {
        return truncate(content, TITLE_MAX_LEN);
    }
    if !session.messages.is_empty() && !key.trim().is_empty() {
        return format!("Session {}", truncate(key, TITLE_KEY_PREFIX_LEN));
    }
    DEFAULT_SESSION_TITLE.to_string()
}

fn build_preview(session: &Session) -> Option<String> {
    session
        .messages
        .iter()
        .rev()
        .map(|m| m.content.trim())
        .find(|c| !c.is_empty())
        .map(|c| truncate(c, PREVIEW_MAX_LEN))
}

pub fn summarize(session: &Session, active: bool) -> SessionSummary {
    let key = resolve_conversation_key(session);
    SessionSummary {
        id: session.id.clone(),
        channel_type: session.channel_type.clone(),
        transport_chat_id: resolve_transport_chat_id(session),
        message_count: session.messages.len(),
        title: build_title(session, &key),
        preview: build_preview(session),
        active,
        created_at: session.created_at,
        updated_at: session.updated_at,
        conversation_key: key,
    }
}
