// ABOUTME: Conversation key validation: strict keys for new conversations, legacy keys only if grandfathered.
// ABOUTME: Also generates fresh keys for repaired or newly created conversations.
use anyhow::Result;
use regex::Regex;
use std::sync::OnceLock;

use crate::session::{session_id, SessionStore};

const STRICT_PATTERN: &str = r"^[a-zA-Z0-9_-]{8,64}$";
const LEGACY_PATTERN: &str = r"^[a-zA-Z0-9_-]{1,64}$";

fn strict_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(STRICT_PATTERN).ok()).as_ref()
}

fn legacy_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(LEGACY_PATTERN).ok()).as_ref()
}

pub fn is_strict(key: &str) -> bool {
    strict_re().is_some_and(|re| re.is_match(key.trim()))
}

pub fn is_legacy_compatible(key: &str) -> bool {
    legacy_re().is_some_and(|re| re.is_match(key.trim()))
}

/// Trim and require the strict form.
pub fn normalize_strict(key: &str) -> Result<String> {
    let candidate = key.trim();
    if !is_strict(candidate) {
        anyhow::bail!("conversationKey must match {}", STRICT_PATTERN);
    }
    Ok(candidate.to_string())
}

/// Trim and require the legacy form.
pub fn normalize_legacy(key: &str) -> Result<String> {
    let candidate = key.trim();
    if !is_legacy_compatible(candidate) {
        anyhow::bail!("conversationKey must match {}", LEGACY_PATTERN);
    }
    Ok(candidate.to_string())
}

/// Accept a key for activation: strict keys always, legacy keys only when a
/// session already exists under that exact key in `channel_type`.
pub fn normalize_for_activation(
    key: &str,
    channel_type: &str,
    store: &dyn SessionStore,
) -> Result<String> {
    if is_strict(key) {
        return normalize_strict(key);
    }
    let candidate = normalize_legacy(key)?;
    if store.get(&session_id(channel_type, &candidate))?.is_some() {
        return Ok(candidate);
    }
    anyhow::bail!("conversationKey must match {}", STRICT_PATTERN)
}

/// Fresh strict key (UUID v4, 36 chars).
pub fn generate() -> String {
    uuid::Uuid::new_v4().to_string()
}
