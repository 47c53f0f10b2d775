// ABOUTME: Active-conversation pointers: (channel, user, client) -> the conversation key currently in use.
// ABOUTME: Backed by a concurrent map, persisted as a versioned JSON registry with rollback on write failure.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::session::{CHANNEL_TELEGRAM, CHANNEL_WEB};

const REGISTRY_VERSION: u32 = 1;
const SEPARATOR: char = '|';
const BLANK_SEGMENT: &str = "_";

// =============================================================================
// Pointer keys
// =============================================================================

fn normalize_segment(segment: &str) -> &str {
    let trimmed = segment.trim();
    if trimmed.is_empty() {
        BLANK_SEGMENT
    } else {
        trimmed
    }
}

/// Generic pointer key: `{channel}|{segment}|...`. Blank segments become `_`.
pub fn pointer_key(channel_type: &str, segments: &[&str]) -> String {
    let mut key = normalize_segment(channel_type).to_string();
    for segment in segments {
        key.push(SEPARATOR);
        key.push_str(normalize_segment(segment));
    }
    key
}

/// Pointer for a connection-oriented client: one per (user, client instance).
pub fn web_pointer_key(username: &str, client_instance_id: &str) -> String {
    pointer_key(CHANNEL_WEB, &[username, client_instance_id])
}

/// Pointer for a chat-app conversation: one per upstream chat.
pub fn telegram_pointer_key(transport_chat_id: &str) -> String {
    pointer_key(CHANNEL_TELEGRAM, &[transport_chat_id])
}

/// Channel a pointer key belongs to.
pub fn pointer_channel(pointer_key: &str) -> Option<&str> {
    let (channel, _) = pointer_key.split_once(SEPARATOR)?;
    (!channel.is_empty()).then_some(channel)
}

/// Whether `pointer_key` is addressed within `channel_type`.
pub fn is_pointer_for_channel(pointer_key: &str, channel_type: &str) -> bool {
    !channel_type.is_empty() && pointer_channel(pointer_key) == Some(channel_type)
}

/// Upstream chat id embedded in a telegram pointer key.
pub fn telegram_transport_chat_id(pointer_key: &str) -> Option<&str> {
    let rest = pointer_key
        .strip_prefix(CHANNEL_TELEGRAM)?
        .strip_prefix(SEPARATOR)?;
    (!rest.is_empty()).then_some(rest)
}

// =============================================================================
// PointerStore
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PointerRegistry {
    version: u32,
    #[serde(default)]
    pointers: BTreeMap<String, String>,
    updated_at: DateTime<Utc>,
}

/// Store of active-conversation pointers.
///
/// Reads are lock-free map lookups. Mutations hold a write lock across the
/// map update and the registry write, so a failed write can be rolled back
/// without racing another writer.
pub struct PointerStore {
    pointers: DashMap<String, String>,
    registry_path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl PointerStore {
    /// Store with no persistence.
    pub fn in_memory() -> Self {
        Self {
            pointers: DashMap::new(),
            registry_path: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Load the registry at `path` if present; later writes go to the same file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let pointers = DashMap::new();

        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read pointer registry {}", path.display()))?;
            let registry: PointerRegistry = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse pointer registry {}", path.display()))?;
            if registry.version != REGISTRY_VERSION {
                tracing::warn!(
                    version = registry.version,
                    path = %path.display(),
                    "Unexpected pointer registry version, loading anyway"
                );
            }
            for (key, value) in registry.pointers {
                pointers.insert(key, value);
            }
        }

        tracing::info!(
            path = %path.display(),
            pointers = pointers.len(),
            "Pointer store loaded"
        );

        Ok(Self {
            pointers,
            registry_path: Some(path),
            write_lock: Mutex::new(()),
        })
    }

    pub fn get_active_conversation_key(&self, pointer_key: &str) -> Option<String> {
        self.pointers.get(pointer_key).map(|v| v.value().clone())
    }

    /// Point `pointer_key` at `conversation_key`. Setting the same value twice is a no-op.
    pub fn set_active_conversation_key(&self, pointer_key: &str, conversation_key: &str) -> Result<()> {
        let pointer_key = pointer_key.trim();
        let conversation_key = conversation_key.trim();
        if pointer_key.is_empty() {
            anyhow::bail!("pointer key must not be blank");
        }
        if conversation_key.is_empty() {
            anyhow::bail!("conversation key must not be blank");
        }

        let _guard = self.write_lock.lock();
        let previous = self
            .pointers
            .insert(pointer_key.to_string(), conversation_key.to_string());
        if previous.as_deref() == Some(conversation_key) {
            return Ok(());
        }

        if let Err(e) = self.persist() {
            self.restore(pointer_key, previous);
            return Err(e.context(format!("Failed to persist pointer {}", pointer_key)));
        }

        tracing::debug!(
            pointer = %pointer_key,
            conversation = %conversation_key,
            "Active conversation pointer set"
        );
        Ok(())
    }

    /// Remove a pointer. Returns the conversation key it held, if any.
    pub fn clear_active_conversation_key(&self, pointer_key: &str) -> Result<Option<String>> {
        let _guard = self.write_lock.lock();
        let Some((_, previous)) = self.pointers.remove(pointer_key) else {
            return Ok(None);
        };

        if let Err(e) = self.persist() {
            self.restore(pointer_key, Some(previous));
            return Err(e.context(format!("Failed to persist pointer removal {}", pointer_key)));
        }
        Ok(Some(previous))
    }

    /// Point-in-time copy, safe to iterate while pointers are being rewritten.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.pointers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pointers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pointers.is_empty()
    }

    fn restore(&self, pointer_key: &str, previous: Option<String>) {
        match previous {
            Some(value) => {
                self.pointers.insert(pointer_key.to_string(), value);
            }
            None => {
                self.pointers.remove(pointer_key);
            }
        }
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.registry_path else {
            return Ok(());
        };

        let registry = PointerRegistry {
            version: REGISTRY_VERSION,
            pointers: self
                .pointers
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&registry)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

impl std::fmt::Debug for PointerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointerStore")
            .field("pointers", &self.pointers.len())
            .field("registry_path", &self.registry_path)
            .finish()
    }
}
